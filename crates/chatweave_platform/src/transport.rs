#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Transport-level failure during an HTTP request or socket exchange.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
	/// Non-2xx response; the parsed body is kept for platform-specific
	/// error-code classification.
	#[error("http status {status}")]
	Status { status: u16, body: Value },

	#[error("network error: {0}")]
	Network(String),
}

impl TransportError {
	pub fn status(status: u16, body: Value) -> Self {
		Self::Status { status, body }
	}

	pub fn network(detail: impl Into<String>) -> Self {
		Self::Network(detail.into())
	}

	/// Auth-class failure (credentials expired/rejected).
	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Status { status: 401, .. })
	}

	pub fn http_status(&self) -> Option<u16> {
		match self {
			Self::Status { status, .. } => Some(*status),
			Self::Network(_) => None,
		}
	}
}

/// Parsed 2xx response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
	pub status: u16,
	pub data: Value,
}

/// Injected HTTP collaborator: one JSON request/response round trip,
/// erroring on non-2xx.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
	async fn request(
		&self,
		method: reqwest::Method,
		url: &str,
		bearer: Option<&str>,
		body: Option<Value>,
	) -> Result<HttpResponse, TransportError>;
}

/// Default `HttpTransport` backed by reqwest.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
	client: reqwest::Client,
}

impl ReqwestTransport {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
	async fn request(
		&self,
		method: reqwest::Method,
		url: &str,
		bearer: Option<&str>,
		body: Option<Value>,
	) -> Result<HttpResponse, TransportError> {
		let mut request = self.client.request(method, url);
		if let Some(token) = bearer {
			request = request.bearer_auth(token);
		}
		if let Some(body) = body {
			request = request.json(&body);
		}

		let response = request.send().await.map_err(|e| TransportError::network(e.to_string()))?;
		let status = response.status().as_u16();
		let text = response.text().await.map_err(|e| TransportError::network(e.to_string()))?;
		let data: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

		if !(200..300).contains(&status) {
			return Err(TransportError::Status { status, body: data });
		}

		Ok(HttpResponse { status, data })
	}
}

/// Events surfaced by a `ChatSocket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
	/// One text frame.
	Text(String),
	/// Orderly close from the peer.
	Closed,
}

/// Injected WebSocket-like collaborator. The default implementation
/// answers pings itself and surfaces only text frames and closure.
#[async_trait::async_trait]
pub trait ChatSocket: Send {
	async fn send_text(&mut self, text: &str) -> Result<(), TransportError>;

	/// Next inbound event; `None` once the stream has ended.
	async fn next_event(&mut self) -> Option<Result<SocketEvent, TransportError>>;

	async fn close(&mut self);
}

/// Socket factory injected into adapters so server-side and test runtimes
/// can supply their own implementation.
pub type SocketConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<Box<dyn ChatSocket>>> + Send + Sync>;

type TungsteniteWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TungsteniteSocket {
	ws: TungsteniteWs,
}

#[async_trait::async_trait]
impl ChatSocket for TungsteniteSocket {
	async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
		self.ws
			.send(WsMessage::text(text))
			.await
			.map_err(|e| TransportError::network(e.to_string()))
	}

	async fn next_event(&mut self) -> Option<Result<SocketEvent, TransportError>> {
		loop {
			let msg = self.ws.next().await?;
			match msg {
				Ok(WsMessage::Text(t)) => return Some(Ok(SocketEvent::Text(t.to_string()))),
				Ok(WsMessage::Ping(p)) => {
					let _ = self.ws.send(WsMessage::Pong(p)).await;
				}
				Ok(WsMessage::Close(_)) => return Some(Ok(SocketEvent::Closed)),
				Ok(_) => {}
				Err(e) => return Some(Err(TransportError::network(e.to_string()))),
			}
		}
	}

	async fn close(&mut self) {
		let _ = self.ws.close(None).await;
	}
}

/// Default connector backed by tokio-tungstenite.
pub fn default_socket_connector() -> SocketConnector {
	Arc::new(|url: Url| {
		Box::pin(async move {
			let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
				.await
				.context("websocket connect")?;
			Ok(Box::new(TungsteniteSocket { ws }) as Box<dyn ChatSocket>)
		}) as BoxFuture<'static, anyhow::Result<Box<dyn ChatSocket>>>
	})
}
