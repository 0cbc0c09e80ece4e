#![forbid(unsafe_code)]

//! Shared fakes for adapter tests: a routed HTTP transport and a scripted
//! socket connector.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::events::{ChatEvent, EventKind};
use crate::transport::{ChatSocket, HttpResponse, HttpTransport, SocketConnector, SocketEvent, TransportError};
use crate::ChatAdapter;

pub(crate) enum Scripted {
	Reply(Result<HttpResponse, TransportError>),
	/// Held until the notify fires, then replied.
	Gated(Arc<Notify>, Result<HttpResponse, TransportError>),
}

pub(crate) fn ok_json(data: Value) -> Scripted {
	Scripted::Reply(Ok(HttpResponse { status: 200, data }))
}

pub(crate) fn http_error(status: u16, body: Value) -> Scripted {
	Scripted::Reply(Err(TransportError::status(status, body)))
}

struct Route {
	method: reqwest::Method,
	url_contains: String,
	responses: VecDeque<Scripted>,
	/// Response replayed once the queue is drained.
	repeat: Option<Result<HttpResponse, TransportError>>,
}

/// Routed fake `HttpTransport`. Requests are matched by method plus a URL
/// substring; unmatched requests (and drained non-repeating routes) park
/// forever, which keeps poll loops quiescent at the end of a script.
#[derive(Default)]
pub(crate) struct FakeHttp {
	routes: Mutex<Vec<Route>>,
	requests: Mutex<Vec<(reqwest::Method, String, Option<Value>)>>,
}

impl FakeHttp {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn add_route(&self, method: reqwest::Method, url_contains: &str, responses: Vec<Scripted>) {
		self.routes.lock().push(Route {
			method,
			url_contains: url_contains.to_string(),
			responses: responses.into(),
			repeat: None,
		});
	}

	pub fn add_repeating_route(&self, method: reqwest::Method, url_contains: &str, response: Result<HttpResponse, TransportError>) {
		self.routes.lock().push(Route {
			method,
			url_contains: url_contains.to_string(),
			responses: VecDeque::new(),
			repeat: Some(response),
		});
	}

	pub fn requests(&self) -> Vec<(reqwest::Method, String, Option<Value>)> {
		self.requests.lock().clone()
	}

	pub fn request_count(&self, method: &reqwest::Method, url_contains: &str) -> usize {
		self.requests
			.lock()
			.iter()
			.filter(|(m, url, _)| m == method && url.contains(url_contains))
			.count()
	}

	fn next_scripted(&self, method: &reqwest::Method, url: &str) -> Option<Scripted> {
		let mut routes = self.routes.lock();
		for route in routes.iter_mut() {
			if &route.method != method || !url.contains(&route.url_contains) {
				continue;
			}
			if let Some(scripted) = route.responses.pop_front() {
				return Some(scripted);
			}
			if let Some(repeat) = &route.repeat {
				return Some(Scripted::Reply(repeat.clone()));
			}
		}
		None
	}
}

#[async_trait::async_trait]
impl HttpTransport for FakeHttp {
	async fn request(
		&self,
		method: reqwest::Method,
		url: &str,
		_bearer: Option<&str>,
		body: Option<Value>,
	) -> Result<HttpResponse, TransportError> {
		self.requests.lock().push((method.clone(), url.to_string(), body));

		match self.next_scripted(&method, url) {
			Some(Scripted::Reply(result)) => result,
			Some(Scripted::Gated(gate, result)) => {
				gate.notified().await;
				result
			}
			None => {
				std::future::pending::<()>().await;
				unreachable!("pending future resolved")
			}
		}
	}
}

pub(crate) struct FakeSocket {
	inbound: mpsc::UnboundedReceiver<Result<SocketEvent, TransportError>>,
	sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl ChatSocket for FakeSocket {
	async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
		self.sent.lock().push(text.to_string());
		Ok(())
	}

	async fn next_event(&mut self) -> Option<Result<SocketEvent, TransportError>> {
		self.inbound.recv().await
	}

	async fn close(&mut self) {}
}

/// Test-side handle to one scripted socket.
pub(crate) struct SocketScript {
	feed: mpsc::UnboundedSender<Result<SocketEvent, TransportError>>,
	pub sent: Arc<Mutex<Vec<String>>>,
}

impl SocketScript {
	pub fn text(&self, frame: &str) {
		let _ = self.feed.send(Ok(SocketEvent::Text(frame.to_string())));
	}

	pub fn error(&self, detail: &str) {
		let _ = self.feed.send(Err(TransportError::network(detail)));
	}

	pub fn close(&self) {
		let _ = self.feed.send(Ok(SocketEvent::Closed));
	}
}

/// Connector serving pre-built fake sockets, one per connect call, and
/// recording the URLs dialed. Refuses once the queue is exhausted.
pub(crate) fn scripted_connector(count: usize) -> (SocketConnector, Vec<SocketScript>, Arc<Mutex<Vec<String>>>) {
	let mut scripts = Vec::new();
	let mut sockets = Vec::new();

	for _ in 0..count {
		let (feed, inbound) = mpsc::unbounded_channel();
		let sent = Arc::new(Mutex::new(Vec::new()));
		scripts.push(SocketScript {
			feed,
			sent: Arc::clone(&sent),
		});
		sockets.push(FakeSocket { inbound, sent });
	}

	let queue = Arc::new(Mutex::new(sockets));
	let dialed = Arc::new(Mutex::new(Vec::new()));
	let dialed_in_closure = Arc::clone(&dialed);

	let connector: SocketConnector = Arc::new(move |url| {
		let queue = Arc::clone(&queue);
		let dialed = Arc::clone(&dialed_in_closure);
		Box::pin(async move {
			dialed.lock().push(url.to_string());
			let mut guard = queue.lock();
			if guard.is_empty() {
				anyhow::bail!("connection refused");
			}
			Ok(Box::new(guard.remove(0)) as Box<dyn ChatSocket>)
		}) as crate::transport::BoxFuture<'static, anyhow::Result<Box<dyn ChatSocket>>>
	});

	(connector, scripts, dialed)
}

const ALL_EVENT_KINDS: &[EventKind] = &[
	EventKind::Connected,
	EventKind::Disconnected,
	EventKind::Reconnect,
	EventKind::Message,
	EventKind::Whisper,
	EventKind::MessageDeleted,
	EventKind::MessagesCleared,
	EventKind::UserMessagesPurged,
	EventKind::UserTimeout,
	EventKind::UserJoin,
	EventKind::UserLeave,
	EventKind::UserUpdate,
	EventKind::SuperChat,
	EventKind::UserBanned,
	EventKind::ChatEnded,
	EventKind::CredentialsExpired,
	EventKind::Error,
];

/// Register a forwarding callback for every event kind.
pub(crate) fn capture_events(adapter: &mut dyn ChatAdapter) -> mpsc::UnboundedReceiver<ChatEvent> {
	let (tx, rx) = mpsc::unbounded_channel();
	for kind in ALL_EVENT_KINDS {
		let tx = tx.clone();
		adapter.on(
			*kind,
			Box::new(move |ev| {
				let _ = tx.send(ev.clone());
			}),
		);
	}
	rx
}

/// Await the next event of `kind`, skipping others.
pub(crate) async fn expect_event(events: &mut mpsc::UnboundedReceiver<ChatEvent>, kind: EventKind) -> ChatEvent {
	loop {
		let ev = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
			.await
			.expect("event within timeout")
			.expect("event channel open");
		if ev.kind() == kind {
			return ev;
		}
	}
}
