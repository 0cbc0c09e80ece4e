#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chatweave_domain::{ConnectionState, Message, Platform};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::frames::{InboundFrame, MethodFrame, MixerChatData, classify_frame, render_segments, segments_raw_text};
use crate::backoff::ReconnectState;
use crate::config::ConfigStore;
use crate::events::{ChatEvent, EventHandler, EventKind, EventRegistry};
use crate::transport::{
	ChatSocket, HttpTransport, ReqwestTransport, SocketConnector, SocketEvent, default_socket_connector,
};
use crate::{AdapterError, Capabilities, ChatAdapter, SendReceipt, Session, new_session_id, now_ms};

const REQUIRED: &[&str] = &["username"];

const CAPABILITIES: Capabilities = Capabilities {
	emoticons: true,
	writing: true,
	live: true,
};

const DEFAULT_API_BASE: &str = "https://mixer.com/api/v1";

enum MixerCommand {
	Say {
		text: String,
		resp: oneshot::Sender<Result<SendReceipt, AdapterError>>,
	},
}

/// Hybrid bootstrap+socket adapter for Mixer chat.
///
/// Two REST calls resolve the numeric channel id and the chat-server
/// endpoint list, then a persistent socket is opened against one endpoint
/// chosen round-robin; the same rotation feeds every reconnect attempt.
pub struct MixerAdapter {
	config: ConfigStore,
	events: Arc<EventRegistry>,
	session: Arc<Session>,
	http: Arc<dyn HttpTransport>,
	connect_socket: SocketConnector,
	cmd_tx: Option<mpsc::Sender<MixerCommand>>,
	task: Option<JoinHandle<()>>,
	can_send: Arc<AtomicBool>,
}

#[derive(Clone, Copy)]
struct RenderFlags {
	parse_emoticon: bool,
	parse_url: bool,
	format_messages: bool,
}

struct LoopCtx {
	session: Arc<Session>,
	events: Arc<EventRegistry>,
	connect_socket: SocketConnector,
	endpoints: Vec<String>,
	endpoint_index: usize,
	channel_id: u64,
	user_id: Option<u64>,
	authkey: Option<String>,
	flags: RenderFlags,
	reconnect: bool,
	can_send: Arc<AtomicBool>,
	epoch: u64,
	session_id: String,
}

impl LoopCtx {
	/// Round-robin endpoint selection, wrapping to the start of the list.
	fn next_endpoint(&mut self) -> &str {
		let endpoint = &self.endpoints[self.endpoint_index % self.endpoints.len()];
		self.endpoint_index += 1;
		endpoint
	}

	fn auth_arguments(&self) -> Value {
		match (self.user_id, self.authkey.as_deref()) {
			(Some(user_id), Some(authkey)) => json!([self.channel_id, user_id, authkey]),
			_ => json!([self.channel_id]),
		}
	}

	fn writable(&self) -> bool {
		self.user_id.is_some() && self.authkey.is_some()
	}
}

impl MixerAdapter {
	pub fn new() -> Self {
		Self::with_transports(Arc::new(ReqwestTransport::new()), default_socket_connector())
	}

	pub fn with_transports(http: Arc<dyn HttpTransport>, connect_socket: SocketConnector) -> Self {
		let mut config = ConfigStore::new(REQUIRED);
		config.set("parseEmoticon", true);
		config.set("parseUrl", true);
		config.set("reconnect", true);
		config.set("formatMessages", true);

		Self {
			config,
			events: Arc::new(EventRegistry::new()),
			session: Arc::new(Session::new()),
			http,
			connect_socket,
			cmd_tx: None,
			task: None,
			can_send: Arc::new(AtomicBool::new(false)),
		}
	}

	fn map_connect_error(err: crate::TransportError) -> AdapterError {
		if err.is_auth() {
			AdapterError::CredentialsExpired { detail: err.to_string() }
		} else {
			AdapterError::Connection { detail: err.to_string() }
		}
	}

	/// REST call (a): resolve the numeric channel id (and the token
	/// user's id) from the configured human-readable username.
	async fn resolve_channel(&mut self) -> Result<(u64, Option<u64>), AdapterError> {
		if let Some(channel_id) = self.config.get("channelId").and_then(Value::as_u64) {
			return Ok((channel_id, self.config.get("userId").and_then(Value::as_u64)));
		}

		let base = self.config.get_str_or("apiBaseUrl", DEFAULT_API_BASE);
		let username = self.config.get_str_or("username", "");
		let url = format!("{base}/channels/{}?fields=id,userId", urlencoding::encode(&username));
		let bearer = self.config.get_str("accessToken");

		let resp = self
			.http
			.request(reqwest::Method::GET, &url, bearer.as_deref(), None)
			.await
			.map_err(Self::map_connect_error)?;

		let channel_id = resp.data.get("id").and_then(Value::as_u64).ok_or(AdapterError::Protocol {
			detail: format!("channel lookup for {username} returned no id"),
		})?;
		let user_id = resp.data.get("userId").and_then(Value::as_u64);

		self.config.set("channelId", channel_id);
		if let Some(user_id) = user_id
			&& self.config.get("userId").is_none()
		{
			self.config.set("userId", user_id);
		}

		Ok((channel_id, self.config.get("userId").and_then(Value::as_u64)))
	}

	/// REST call (b): fetch the chat-server endpoint list and auth key.
	async fn resolve_chat_servers(&self, channel_id: u64) -> Result<(Vec<String>, Option<String>), AdapterError> {
		let base = self.config.get_str_or("apiBaseUrl", DEFAULT_API_BASE);
		let url = format!("{base}/chats/{channel_id}");
		let bearer = self.config.get_str("accessToken");

		let resp = self
			.http
			.request(reqwest::Method::GET, &url, bearer.as_deref(), None)
			.await
			.map_err(Self::map_connect_error)?;

		let endpoints: Vec<String> = resp
			.data
			.get("endpoints")
			.and_then(Value::as_array)
			.map(|list| list.iter().filter_map(Value::as_str).map(String::from).collect())
			.unwrap_or_default();
		if endpoints.is_empty() {
			return Err(AdapterError::Connection {
				detail: "no chat servers available".to_string(),
			});
		}

		let authkey = resp.data.get("authkey").and_then(Value::as_str).map(String::from);
		Ok((endpoints, authkey))
	}

	async fn open_socket(
		connect_socket: &SocketConnector,
		endpoint: &str,
		auth_arguments: Value,
	) -> anyhow::Result<Box<dyn ChatSocket>> {
		let url = Url::parse(endpoint)?;
		let mut socket = connect_socket(url).await?;

		let frame = MethodFrame::new(now_ms() as u64, "auth", auth_arguments);
		socket
			.send_text(&serde_json::to_string(&frame).expect("auth frame serializes"))
			.await
			.map_err(|e| anyhow::anyhow!("auth frame write: {e}"))?;

		Ok(socket)
	}

	async fn run_loop(mut socket: Box<dyn ChatSocket>, mut cmd_rx: mpsc::Receiver<MixerCommand>, mut ctx: LoopCtx) {
		let mut backoff = ReconnectState::new();

		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					Some(MixerCommand::Say { text, resp }) => {
						let frame = MethodFrame::new(now_ms() as u64, "msg", json!([text]));
						let payload = serde_json::to_string(&frame).expect("msg frame serializes");
						let result = socket
							.send_text(&payload)
							.await
							.map(|_| SendReceipt::default())
							.map_err(|e| AdapterError::Transport { detail: e.to_string() });
						let _ = resp.send(result);
					}
					None => {
						socket.close().await;
						return;
					}
				},

				ev = socket.next_event() => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}

					match ev {
						Some(Ok(SocketEvent::Text(frame))) => Self::handle_frame(&frame, &ctx),
						Some(Ok(SocketEvent::Closed)) | None => {
							// Orderly close is terminal; the caller decides
							// whether to reconnect.
							ctx.can_send.store(false, Ordering::SeqCst);
							ctx.session.set_state(ConnectionState::Disconnected);
							ctx.events.emit(&ChatEvent::Disconnected);
							return;
						}
						Some(Err(e)) => {
							warn!(session_id = %ctx.session_id, error = %e, "chat socket error");
							ctx.can_send.store(false, Ordering::SeqCst);
							match Self::reconnect(&mut backoff, &mut ctx, &e).await {
								Some(new_socket) => socket = new_socket,
								None => return,
							}
						}
					}
				}
			}
		}
	}

	async fn reconnect(backoff: &mut ReconnectState, ctx: &mut LoopCtx, cause: &crate::TransportError) -> Option<Box<dyn ChatSocket>> {
		if !ctx.reconnect {
			ctx.events.emit(&ChatEvent::Error { detail: cause.to_string() });
			ctx.session.set_state(ConnectionState::Disconnected);
			ctx.events.emit(&ChatEvent::Disconnected);
			return None;
		}

		ctx.session.set_state(ConnectionState::Reconnecting);

		loop {
			let interval = backoff.increase();
			metrics::counter!("chatweave_mixer_reconnect_attempts_total").increment(1);
			ctx.events.emit(&ChatEvent::Reconnect {
				attempt: backoff.attempt(),
			});

			tokio::time::sleep(interval).await;
			if !ctx.session.is_current(ctx.epoch) {
				return None;
			}

			ctx.session.set_state(ConnectionState::Connecting);
			let endpoint = ctx.next_endpoint().to_string();
			match Self::open_socket(&ctx.connect_socket, &endpoint, ctx.auth_arguments()).await {
				Ok(socket) => {
					if !ctx.session.is_current(ctx.epoch) {
						return None;
					}
					ctx.session.set_state(ConnectionState::Connected);
					backoff.reset();
					ctx.can_send.store(ctx.writable(), Ordering::SeqCst);
					ctx.events.emit(&ChatEvent::Connected);
					return Some(socket);
				}
				Err(e) => {
					warn!(session_id = %ctx.session_id, %endpoint, error = %e, "reconnect attempt failed");
					ctx.session.set_state(ConnectionState::Reconnecting);
				}
			}
		}
	}

	fn handle_frame(frame: &str, ctx: &LoopCtx) {
		let value: Value = match serde_json::from_str(frame) {
			Ok(value) => value,
			Err(e) => {
				ctx.events.emit(&ChatEvent::Error {
					detail: format!("unparseable chat frame: {e}"),
				});
				return;
			}
		};

		match classify_frame(&value) {
			InboundFrame::UserJoin { user } => ctx.events.emit(&ChatEvent::UserJoin { user }),
			InboundFrame::UserLeave { user } => ctx.events.emit(&ChatEvent::UserLeave { user }),
			InboundFrame::Chat(chat) => {
				if chat.message.meta.is_censored() {
					// Suppressed entirely: not emitted, not counted.
					metrics::counter!("chatweave_mixer_censored_total").increment(1);
					debug!(session_id = %ctx.session_id, "dropping censored message");
					return;
				}

				let whisper = chat.message.meta.is_whisper();
				let message = Self::normalize_chat(&chat, ctx.flags);
				metrics::counter!("chatweave_mixer_messages_total").increment(1);
				if whisper {
					ctx.events.emit(&ChatEvent::Whisper(message));
				} else {
					ctx.events.emit(&ChatEvent::Message(message));
				}
			}
			InboundFrame::DeleteMessage { message_id } => ctx.events.emit(&ChatEvent::MessageDeleted { message_id }),
			InboundFrame::PurgeMessage { user_id } => ctx.events.emit(&ChatEvent::UserMessagesPurged { user_id }),
			InboundFrame::ClearMessages => ctx.events.emit(&ChatEvent::MessagesCleared),
			InboundFrame::UserTimeout { user, duration_seconds } => {
				ctx.events.emit(&ChatEvent::UserTimeout { user, duration_seconds });
			}
			InboundFrame::UserUpdate { user, roles } => ctx.events.emit(&ChatEvent::UserUpdate { user, roles }),
			InboundFrame::Malformed { detail } => ctx.events.emit(&ChatEvent::Error { detail }),
			InboundFrame::Other => {}
		}
	}

	fn normalize_chat(chat: &MixerChatData, flags: RenderFlags) -> Message {
		let raw = segments_raw_text(&chat.message.message);
		let body = if flags.format_messages {
			render_segments(&chat.message.message, flags.parse_emoticon, flags.parse_url)
		} else {
			raw.clone()
		};

		let id = chat.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
		let mut message = Message::new(id, chat.user_name.clone(), body, raw, now_ms());
		message.extra.insert("user_roles".to_string(), json!(chat.user_roles));
		message.extra.insert("user_level".to_string(), json!(chat.user_level));
		message.extra.insert("user_id".to_string(), json!(chat.user_id));
		message.extra.insert("user_avatar".to_string(), json!(chat.user_avatar));
		message
	}
}

impl Default for MixerAdapter {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl ChatAdapter for MixerAdapter {
	fn platform(&self) -> Platform {
		Platform::Mixer
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
		let session_id = new_session_id();

		let connect_result: Result<(u64, Option<u64>, Vec<String>, Option<String>), AdapterError> = async {
			let (channel_id, user_id) = self.resolve_channel().await?;
			let (endpoints, authkey) = self.resolve_chat_servers(channel_id).await?;
			Ok((channel_id, user_id, endpoints, authkey))
		}
		.await;

		let (channel_id, user_id, endpoints, authkey) = match connect_result {
			Ok(parts) => parts,
			Err(e) => {
				self.session.set_state(ConnectionState::Disconnected);
				self.events.emit(&ChatEvent::Error { detail: e.to_string() });
				return Err(e);
			}
		};

		let mut ctx = LoopCtx {
			session: Arc::clone(&self.session),
			events: Arc::clone(&self.events),
			connect_socket: self.connect_socket.clone(),
			endpoints,
			endpoint_index: 0,
			channel_id,
			user_id,
			authkey,
			flags: RenderFlags {
				parse_emoticon: self.config.get_bool_or("parseEmoticon", true),
				parse_url: self.config.get_bool_or("parseUrl", true),
				format_messages: self.config.get_bool_or("formatMessages", true),
			},
			reconnect: self.config.get_bool_or("reconnect", true),
			can_send: Arc::clone(&self.can_send),
			epoch: 0,
			session_id: session_id.clone(),
		};

		info!(%channel_id, %session_id, "mixer connecting");
		let endpoint = ctx.next_endpoint().to_string();
		let socket = match Self::open_socket(&self.connect_socket, &endpoint, ctx.auth_arguments()).await {
			Ok(socket) => socket,
			Err(e) => {
				self.session.set_state(ConnectionState::Disconnected);
				let err = AdapterError::Connection { detail: e.to_string() };
				self.events.emit(&ChatEvent::Error { detail: err.to_string() });
				return Err(err);
			}
		};

		ctx.epoch = self.session.bump();
		self.session.set_state(ConnectionState::Connected);
		self.can_send.store(ctx.writable(), Ordering::SeqCst);

		let (cmd_tx, cmd_rx) = mpsc::channel(16);
		self.cmd_tx = Some(cmd_tx);

		self.events.emit(&ChatEvent::Connected);
		self.task = Some(tokio::spawn(Self::run_loop(socket, cmd_rx, ctx)));

		Ok(())
	}

	async fn disconnect(&mut self) {
		if self.session.state() == ConnectionState::Disconnected {
			return;
		}

		self.session.bump();
		self.session.set_state(ConnectionState::Disconnected);
		self.cmd_tx = None;
		if let Some(task) = self.task.take() {
			task.abort();
		}
		self.can_send.store(false, Ordering::SeqCst);

		self.events.emit(&ChatEvent::Disconnected);
	}

	async fn send(&mut self, text: &str) -> Result<SendReceipt, AdapterError> {
		if self.session.state() != ConnectionState::Connected {
			return Err(AdapterError::NotConnected);
		}
		if !self.can_send.load(Ordering::SeqCst) {
			return Err(AdapterError::WritePermissionDenied {
				detail: "user id or auth key not set".to_string(),
			});
		}

		let Some(cmd_tx) = self.cmd_tx.clone() else {
			return Err(AdapterError::NotConnected);
		};

		let (resp_tx, resp_rx) = oneshot::channel();
		cmd_tx
			.send(MixerCommand::Say {
				text: text.to_string(),
				resp: resp_tx,
			})
			.await
			.map_err(|_| AdapterError::NotConnected)?;

		resp_rx.await.map_err(|_| AdapterError::Transport {
			detail: "send interrupted by disconnect".to_string(),
		})?
	}
}
