#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chatweave_domain::{ConnectionState, Message, Platform};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::dedup::{DedupWindow, EchoFilter};
use crate::events::{ChatEvent, EventHandler, EventKind, EventRegistry};
use crate::transform::TransformedText;
use crate::transport::{HttpTransport, ReqwestTransport, TransportError};
use crate::{AdapterError, Capabilities, ChatAdapter, SendReceipt, Session, new_session_id, now_ms};

const REQUIRED: &[&str] = &["liveVideoId", "accessToken"];

const CAPABILITIES: Capabilities = Capabilities {
	emoticons: true,
	writing: true,
	live: false,
};

const DEFAULT_API_BASE: &str = "https://graph.facebook.com";
const DEFAULT_VERSION: &str = "v3.0";
const DEDUP_CAPACITY: usize = 1_024;
/// Sent ids waiting for their single poll echo.
const ECHO_CAPACITY: usize = 5;

/// Graph OAuth error code for an invalidated/expired token.
const GRAPH_CODE_TOKEN_EXPIRED: i64 = 190;

#[derive(Debug, Clone, Deserialize)]
pub(super) struct CommentPage {
	#[serde(default)]
	pub data: Vec<CommentItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct CommentItem {
	pub id: String,
	#[serde(default)]
	pub from: Option<CommentAuthor>,
	#[serde(default)]
	pub message: Option<String>,
	#[serde(default)]
	pub created_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct CommentAuthor {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
}

struct PollCtx {
	session: Arc<Session>,
	events: Arc<EventRegistry>,
	http: Arc<dyn HttpTransport>,
	dedup: Arc<Mutex<DedupWindow>>,
	echo: Arc<Mutex<EchoFilter>>,
	graph_base: String,
	live_video_id: String,
	access_token: String,
	user_id: Option<String>,
	interval_ms: u64,
	parse_url: bool,
	epoch: u64,
	session_id: String,
}

/// REST-comment polling adapter for Facebook live videos.
///
/// Each cycle verifies the video is still live, fetches new comments with
/// the `since` cursor from the previous cycle, and reschedules itself;
/// sent comments reappearing in the platform's own log are suppressed
/// exactly once through the echo filter.
pub struct FacebookAdapter {
	config: ConfigStore,
	events: Arc<EventRegistry>,
	session: Arc<Session>,
	http: Arc<dyn HttpTransport>,
	dedup: Arc<Mutex<DedupWindow>>,
	echo: Arc<Mutex<EchoFilter>>,
	can_send: Arc<AtomicBool>,
	task: Option<JoinHandle<()>>,
}

impl FacebookAdapter {
	pub fn new() -> Self {
		Self::with_http_transport(Arc::new(ReqwestTransport::new()))
	}

	pub fn with_http_transport(http: Arc<dyn HttpTransport>) -> Self {
		let mut config = ConfigStore::new(REQUIRED);
		config.set("version", DEFAULT_VERSION);
		config.set("parseUrl", true);
		config.set("interval", 5_000u64);

		Self {
			config,
			events: Arc::new(EventRegistry::new()),
			session: Arc::new(Session::new()),
			http,
			dedup: Arc::new(Mutex::new(DedupWindow::new(DEDUP_CAPACITY))),
			echo: Arc::new(Mutex::new(EchoFilter::new(ECHO_CAPACITY))),
			can_send: Arc::new(AtomicBool::new(false)),
			task: None,
		}
	}

	fn graph_base(&self) -> String {
		let base = self.config.get_str_or("apiBaseUrl", DEFAULT_API_BASE);
		let version = self.config.get_str_or("version", DEFAULT_VERSION);
		format!("{base}/{version}")
	}

	fn is_auth_error(err: &TransportError) -> bool {
		if err.is_auth() {
			return true;
		}
		match err {
			TransportError::Status { body, .. } => {
				body.get("error").and_then(|e| e.get("code")).and_then(Value::as_i64)
					== Some(GRAPH_CODE_TOKEN_EXPIRED)
			}
			TransportError::Network(_) => false,
		}
	}

	fn classify_fetch_error(err: TransportError) -> AdapterError {
		if Self::is_auth_error(&err) {
			AdapterError::CredentialsExpired { detail: err.to_string() }
		} else {
			AdapterError::Transport { detail: err.to_string() }
		}
	}

	/// Connect handshake: load the Graph user behind the token. Page
	/// tokens unlock writing.
	async fn load_user(&mut self) -> Result<(), AdapterError> {
		let url = format!(
			"{}/me?fields={}&access_token={}",
			self.graph_base(),
			urlencoding::encode("id,name,metadata{type}"),
			urlencoding::encode(&self.config.get_str_or("accessToken", "")),
		);

		let resp = self.http.request(reqwest::Method::GET, &url, None, None).await.map_err(|e| {
			if Self::is_auth_error(&e) {
				AdapterError::CredentialsExpired { detail: e.to_string() }
			} else {
				AdapterError::Connection { detail: e.to_string() }
			}
		})?;

		let user_id = resp.data.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
		let username = resp.data.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
		let token_type = resp
			.data
			.get("metadata")
			.and_then(|m| m.get("type"))
			.and_then(Value::as_str)
			.unwrap_or_default();

		self.can_send.store(token_type == "page", Ordering::SeqCst);
		if !user_id.is_empty() {
			self.config.set("userId", user_id);
		}
		if !username.is_empty() {
			self.config.set("username", username);
		}

		Ok(())
	}

	/// Stream-liveness check run before each fetch.
	async fn fetch_live_status(ctx: &PollCtx) -> Result<String, TransportError> {
		let url = format!(
			"{}/{}?fields=status&access_token={}",
			ctx.graph_base,
			urlencoding::encode(&ctx.live_video_id),
			urlencoding::encode(&ctx.access_token),
		);

		let resp = ctx.http.request(reqwest::Method::GET, &url, None, None).await?;
		// A payload without a status field is treated as still live.
		Ok(resp
			.data
			.get("status")
			.and_then(Value::as_str)
			.unwrap_or("LIVE")
			.to_string())
	}

	async fn fetch_comments(ctx: &PollCtx, since: Option<i64>) -> Result<CommentPage, AdapterError> {
		let mut url = format!(
			"{}/{}/comments?order=chronological&live_filter=no_filter&fields={}&access_token={}",
			ctx.graph_base,
			urlencoding::encode(&ctx.live_video_id),
			urlencoding::encode("id,from,message,created_time"),
			urlencoding::encode(&ctx.access_token),
		);
		if let Some(since) = since {
			url.push_str(&format!("&since={since}"));
		}

		let resp = ctx
			.http
			.request(reqwest::Method::GET, &url, None, None)
			.await
			.map_err(Self::classify_fetch_error)?;

		serde_json::from_value(resp.data).map_err(|e| AdapterError::Protocol {
			detail: format!("malformed comments response: {e}"),
		})
	}

	fn normalize_comment(item: &CommentItem, ctx: &PollCtx) -> Message {
		let raw = item.message.clone().unwrap_or_default();

		let mut text = TransformedText::escaped(&raw);
		if ctx.parse_url {
			text.linkify();
		}

		let author = item.from.as_ref();
		let user_id = author.and_then(|a| a.id.clone()).unwrap_or_else(|| "0".to_string());
		let username = author
			.and_then(|a| a.name.clone())
			.unwrap_or_else(|| "Anonymous".to_string());
		let image = match author.and_then(|a| a.id.as_deref()) {
			Some(id) => format!("{}/{}/picture", ctx.graph_base, id),
			None => String::new(),
		};
		let broadcaster = ctx.user_id.as_deref() == Some(user_id.as_str());

		let timestamp = item
			.created_time
			.as_deref()
			.and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
			.map(|dt| dt.timestamp_millis())
			.unwrap_or_else(now_ms);

		let mut message = Message::new(item.id.clone(), username, text.into_string(), raw, timestamp);
		message.extra.insert("user_id".to_string(), Value::String(user_id));
		message.extra.insert("image".to_string(), Value::String(image));
		message.extra.insert("broadcaster".to_string(), Value::Bool(broadcaster));
		message
	}

	fn comment_timestamp_secs(item: &CommentItem) -> Option<i64> {
		let ts = item.created_time.as_deref()?;
		Some(chrono::DateTime::parse_from_rfc3339(ts).ok()?.timestamp())
	}

	async fn run_poll(ctx: PollCtx) {
		let mut since: Option<i64> = None;

		loop {
			match Self::fetch_live_status(&ctx).await {
				Ok(status) => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}
					if status != "LIVE" {
						info!(session_id = %ctx.session_id, %status, "video no longer live; disconnecting");
						ctx.session.set_state(ConnectionState::Disconnected);
						ctx.events.emit(&ChatEvent::ChatEnded);
						ctx.events.emit(&ChatEvent::Disconnected);
						return;
					}
				}
				Err(err) => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}
					Self::stop_on_fetch_error(&ctx, Self::classify_fetch_error(err));
					return;
				}
			}

			match Self::fetch_comments(&ctx, since).await {
				Ok(page) => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}

					for item in &page.data {
						if let Some(secs) = Self::comment_timestamp_secs(item) {
							since = Some(since.map_or(secs, |prev| prev.max(secs)));
						}

						// First reappearance of a self-sent comment is the
						// platform echoing our own write; drop it once.
						if ctx.echo.lock().absorb(&item.id) {
							ctx.dedup.lock().insert(&item.id);
							metrics::counter!("chatweave_facebook_echoes_dropped_total").increment(1);
							debug!(session_id = %ctx.session_id, comment_id = %item.id, "dropping echoed comment");
							continue;
						}

						if !ctx.dedup.lock().insert(&item.id) {
							metrics::counter!("chatweave_facebook_duplicates_dropped_total").increment(1);
							continue;
						}

						let message = Self::normalize_comment(item, &ctx);
						metrics::counter!("chatweave_facebook_messages_total").increment(1);
						ctx.events.emit(&ChatEvent::Message(message));
					}

					tokio::time::sleep(Duration::from_millis(ctx.interval_ms)).await;
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}
				}
				Err(err) => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}
					Self::stop_on_fetch_error(&ctx, err);
					return;
				}
			}
		}
	}

	/// Fetch errors cancel the loop; the caller issues a fresh connect if
	/// retry is desired.
	fn stop_on_fetch_error(ctx: &PollCtx, err: AdapterError) {
		warn!(session_id = %ctx.session_id, error = %err, "poll fetch failed");
		ctx.session.set_state(ConnectionState::Disconnected);
		match err {
			AdapterError::CredentialsExpired { detail } => {
				ctx.events.emit(&ChatEvent::CredentialsExpired { detail });
			}
			other => {
				ctx.events.emit(&ChatEvent::Error { detail: other.to_string() });
			}
		}
	}
}

impl Default for FacebookAdapter {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl ChatAdapter for FacebookAdapter {
	fn platform(&self) -> Platform {
		Platform::Facebook
	}

	fn capabilities(&self) -> Capabilities {
		CAPABILITIES
	}

	fn connection_state(&self) -> ConnectionState {
		self.session.state()
	}

	fn config(&self) -> &ConfigStore {
		&self.config
	}

	fn config_mut(&mut self) -> &mut ConfigStore {
		&mut self.config
	}

	fn on(&mut self, kind: EventKind, handler: EventHandler) {
		self.events.on(kind, handler);
	}

	async fn connect(&mut self) -> Result<(), AdapterError> {
		if matches!(
			self.session.state(),
			ConnectionState::Connecting | ConnectionState::Connected
		) {
			return Ok(());
		}

		self.config.validate_required()?;
		self.session.set_state(ConnectionState::Connecting);

		if let Err(e) = self.load_user().await {
			self.session.set_state(ConnectionState::Disconnected);
			self.events.emit(&ChatEvent::Error { detail: e.to_string() });
			return Err(e);
		}

		self.dedup.lock().clear();
		self.echo.lock().clear();
		let epoch = self.session.bump();
		self.session.set_state(ConnectionState::Connected);

		let session_id = new_session_id();
		info!(%session_id, "facebook polling starting");

		let ctx = PollCtx {
			session: Arc::clone(&self.session),
			events: Arc::clone(&self.events),
			http: Arc::clone(&self.http),
			dedup: Arc::clone(&self.dedup),
			echo: Arc::clone(&self.echo),
			graph_base: self.graph_base(),
			live_video_id: self.config.get_str_or("liveVideoId", ""),
			access_token: self.config.get_str_or("accessToken", ""),
			user_id: self.config.get_str("userId"),
			interval_ms: self.config.get_u64_or("interval", 5_000),
			parse_url: self.config.get_bool_or("parseUrl", true),
			epoch,
			session_id,
		};

		self.events.emit(&ChatEvent::Connected);
		self.task = Some(tokio::spawn(Self::run_poll(ctx)));

		Ok(())
	}

	async fn disconnect(&mut self) {
		if self.session.state() == ConnectionState::Disconnected {
			return;
		}

		self.session.bump();
		self.session.set_state(ConnectionState::Disconnected);
		if let Some(task) = self.task.take() {
			task.abort();
		}
		self.dedup.lock().clear();
		self.echo.lock().clear();
		self.can_send.store(false, Ordering::SeqCst);

		self.events.emit(&ChatEvent::Disconnected);
	}

	async fn send(&mut self, text: &str) -> Result<SendReceipt, AdapterError> {
		if self.session.state() != ConnectionState::Connected {
			return Err(AdapterError::NotConnected);
		}
		if !self.can_send.load(Ordering::SeqCst) {
			return Err(AdapterError::WritePermissionDenied {
				detail: "sending requires a page access token".to_string(),
			});
		}

		let url = format!(
			"{}/{}/comments?access_token={}",
			self.graph_base(),
			urlencoding::encode(&self.config.get_str_or("liveVideoId", "")),
			urlencoding::encode(&self.config.get_str_or("accessToken", "")),
		);

		let resp = self
			.http
			.request(reqwest::Method::POST, &url, None, Some(json!({ "message": text })))
			.await
			.map_err(Self::classify_fetch_error)?;

		let message_id = resp.data.get("id").and_then(Value::as_str).map(String::from);
		if let Some(id) = &message_id {
			// The platform reflects this comment back on the next poll.
			self.echo.lock().record(id);
		}

		Ok(SendReceipt { message_id })
	}
}
