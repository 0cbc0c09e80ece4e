#![forbid(unsafe_code)]

use std::sync::Arc;

use chatweave_domain::{ConnectionState, EmoteSpan, Message, Platform};
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::irc::{ChatLine, IrcClient, IrcEvent, parse_emote_tag};
use crate::backoff::ReconnectState;
use crate::config::ConfigStore;
use crate::events::{ChatEvent, EventHandler, EventKind, EventRegistry};
use crate::transform::{escape_html, rewrite_emote_spans};
use crate::transport::{SocketConnector, default_socket_connector};
use crate::{AdapterError, Capabilities, ChatAdapter, SendReceipt, Session, new_session_id, now_ms};

const REQUIRED: &[&str] = &["channel", "clientId"];

const CAPABILITIES: Capabilities = Capabilities {
	emoticons: true,
	writing: true,
	live: true,
};

const DEFAULT_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv";

enum TwitchCommand {
	Say {
		text: String,
		resp: oneshot::Sender<Result<SendReceipt, AdapterError>>,
	},
}

/// Push-socket adapter for Twitch chat.
///
/// Delegates transport to the IRC chat client and drives the
/// `Connecting -> Connected -> Reconnecting -> Connecting` state machine,
/// normalizing tagged PRIVMSG lines into canonical messages.
pub struct TwitchAdapter {
	config: ConfigStore,
	events: Arc<EventRegistry>,
	session: Arc<Session>,
	connect_socket: SocketConnector,
	cmd_tx: Option<mpsc::Sender<TwitchCommand>>,
	task: Option<JoinHandle<()>>,
	can_send: bool,
}

#[derive(Clone, Copy)]
pub(super) struct ParseFlags {
	pub(super) parse_emoticons: bool,
	pub(super) filter_xss: bool,
}

struct LoopCtx {
	session: Arc<Session>,
	events: Arc<EventRegistry>,
	connect_socket: SocketConnector,
	url: Url,
	identity: Option<(String, String)>,
	channel: String,
	epoch: u64,
	reconnect: bool,
	flags: ParseFlags,
	session_id: String,
}

impl TwitchAdapter {
	pub fn new() -> Self {
		Self::with_socket_connector(default_socket_connector())
	}

	pub fn with_socket_connector(connect_socket: SocketConnector) -> Self {
		let mut config = ConfigStore::new(REQUIRED);
		config.set("parseEmoticon", true);
		config.set("filterXss", true);
		config.set("reconnect", true);

		Self {
			config,
			events: Arc::new(EventRegistry::new()),
			session: Arc::new(Session::new()),
			connect_socket,
			cmd_tx: None,
			task: None,
			can_send: false,
		}
	}

	fn identity(&self) -> Option<(String, String)> {
		let username = self.config.get_str("username")?;
		let token = self.config.get_str("accessToken")?;
		Some((username, token))
	}

	async fn run_loop(mut client: IrcClient, mut cmd_rx: mpsc::Receiver<TwitchCommand>, ctx: LoopCtx) {
		let mut backoff = ReconnectState::new();

		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => match cmd {
					Some(TwitchCommand::Say { text, resp }) => {
						let result = client
							.say(&ctx.channel, &text)
							.await
							.map(|_| SendReceipt::default())
							.map_err(|e| AdapterError::Transport { detail: e.to_string() });
						let _ = resp.send(result);
					}
					None => {
						client.close().await;
						return;
					}
				},

				ev = client.next() => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}

					match ev {
						Some(Ok(IrcEvent::Chat(line))) => {
							let message = parse_chat_line(&line, ctx.flags);
							metrics::counter!("chatweave_twitch_messages_total").increment(1);
							ctx.events.emit(&ChatEvent::Message(message));
						}
						Some(Ok(IrcEvent::Other(msg))) => {
							debug!(session_id = %ctx.session_id, command = %msg.command, "unhandled irc event");
						}
						Some(Ok(IrcEvent::Reconnect)) => {
							info!(session_id = %ctx.session_id, "server requested reconnect");
							match Self::reconnect(&mut backoff, &ctx).await {
								Some(new_client) => client = new_client,
								None => return,
							}
						}
						Some(Err(e)) => {
							warn!(session_id = %ctx.session_id, error = %e, "chat socket error");
							match Self::reconnect(&mut backoff, &ctx).await {
								Some(new_client) => client = new_client,
								None => return,
							}
						}
						None => {
							info!(session_id = %ctx.session_id, "chat socket ended");
							match Self::reconnect(&mut backoff, &ctx).await {
								Some(new_client) => client = new_client,
								None => return,
							}
						}
					}
				}
			}
		}
	}

	/// Backoff-paced reconnect cycle; `None` once the session ended or
	/// reconnection is disabled.
	async fn reconnect(backoff: &mut ReconnectState, ctx: &LoopCtx) -> Option<IrcClient> {
		if !ctx.reconnect {
			ctx.session.set_state(ConnectionState::Disconnected);
			ctx.events.emit(&ChatEvent::Disconnected);
			return None;
		}

		ctx.session.set_state(ConnectionState::Reconnecting);

		loop {
			let interval = backoff.increase();
			metrics::counter!("chatweave_twitch_reconnect_attempts_total").increment(1);
			ctx.events.emit(&ChatEvent::Reconnect {
				attempt: backoff.attempt(),
			});

			tokio::time::sleep(interval).await;
			if !ctx.session.is_current(ctx.epoch) {
				return None;
			}

			ctx.session.set_state(ConnectionState::Connecting);
			match IrcClient::connect(&ctx.connect_socket, ctx.url.clone(), ctx.identity.as_ref(), &ctx.channel).await {
				Ok(client) => {
					if !ctx.session.is_current(ctx.epoch) {
						return None;
					}
					ctx.session.set_state(ConnectionState::Connected);
					backoff.reset();
					ctx.events.emit(&ChatEvent::Connected);
					return Some(client);
				}
				Err(e) => {
					warn!(session_id = %ctx.session_id, error = %e, "reconnect attempt failed");
					ctx.session.set_state(ConnectionState::Reconnecting);
				}
			}
		}
	}
}

impl Default for TwitchAdapter {
	fn default() -> Self {
		Self::new()
	}
}

fn tag_flag(line: &ChatLine, key: &str) -> bool {
	line.tags.get(key).map(String::as_str) == Some("1")
}

fn parse_badges(line: &ChatLine) -> Map<String, Value> {
	let mut out = Map::new();
	if let Some(badges) = line.tags.get("badges") {
		for badge in badges.split(',') {
			if let Some((name, version)) = badge.split_once('/') {
				out.insert(name.to_string(), Value::String(version.to_string()));
			}
		}
	}
	out
}

fn flatten_emote_spans(emotes: &[(String, Vec<String>)]) -> Vec<EmoteSpan> {
	let mut spans = Vec::new();
	for (id, positions) in emotes {
		for position in positions {
			let Some((start, end)) = position.split_once('-') else {
				continue;
			};
			let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
				continue;
			};
			spans.push(EmoteSpan::new(start, end, id.clone()));
		}
	}
	spans
}

fn twitch_emote_markup(span: &EmoteSpan) -> String {
	format!(
		"<img class=\"emoticon\" src=\"https://static-cdn.jtvnw.net/emoticons/v1/{}/3.0\" />",
		span.id
	)
}

pub(super) fn parse_chat_line(line: &ChatLine, flags: ParseFlags) -> Message {
	let raw = line.text.clone();

	let emotes = line
		.tags
		.get("emotes")
		.map(|tag| parse_emote_tag(tag))
		.unwrap_or_default();
	let spans = flatten_emote_spans(&emotes);

	let body = if flags.parse_emoticons && !spans.is_empty() {
		rewrite_emote_spans(&raw, &spans, twitch_emote_markup, flags.filter_xss)
	} else if flags.filter_xss {
		escape_html(&raw)
	} else {
		raw.clone()
	};

	let badges = parse_badges(line);
	let broadcaster = badges.get("broadcaster").and_then(Value::as_str) == Some("1");

	let username = line
		.tags
		.get("display-name")
		.filter(|name| !name.trim().is_empty())
		.cloned()
		.unwrap_or_else(|| line.sender.clone());

	let id = line
		.tags
		.get("id")
		.filter(|id| !id.is_empty())
		.cloned()
		.unwrap_or_else(|| Uuid::new_v4().to_string());

	let timestamp = line
		.tags
		.get("tmi-sent-ts")
		.and_then(|ts| ts.parse::<i64>().ok())
		.unwrap_or_else(now_ms);

	let emote_map: Map<String, Value> = emotes
		.iter()
		.map(|(id, positions)| (id.clone(), json!(positions)))
		.collect();

	let mut message = Message::new(id, username, body, raw, timestamp);
	message.extra.insert(
		"colour".to_string(),
		Value::String(line.tags.get("color").cloned().unwrap_or_default()),
	);
	message.extra.insert("badges".to_string(), Value::Object(badges));
	message
		.extra
		.insert("subscriber".to_string(), Value::Bool(tag_flag(line, "subscriber")));
	message.extra.insert("mod".to_string(), Value::Bool(tag_flag(line, "mod")));
	message.extra.insert("turbo".to_string(), Value::Bool(tag_flag(line, "turbo")));
	message.extra.insert("broadcaster".to_string(), Value::Bool(broadcaster));
	message.extra.insert("emotes".to_string(), Value::Object(emote_map));
	message
}

#[async_trait::async_trait]
impl ChatAdapter for TwitchAdapter {
	fn platform(&self) -> Platform {
		Platform::Twitch
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

		let channel = self
			.config
			.get_str_or("channel", "")
			.trim_start_matches('#')
			.to_ascii_lowercase();
		let identity = self.identity();
		let url_raw = self.config.get_str_or("ircUrl", DEFAULT_IRC_URL);
		let url = Url::parse(&url_raw).map_err(|e| AdapterError::Connection {
			detail: format!("invalid chat url {url_raw}: {e}"),
		})?;

		self.session.set_state(ConnectionState::Connecting);
		let session_id = new_session_id();
		info!(%channel, %session_id, "twitch connecting");

		let client = match IrcClient::connect(&self.connect_socket, url.clone(), identity.as_ref(), &channel).await {
			Ok(client) => client,
			Err(e) => {
				self.session.set_state(ConnectionState::Disconnected);
				let err = AdapterError::Connection { detail: e.to_string() };
				self.events.emit(&ChatEvent::Error { detail: err.to_string() });
				return Err(err);
			}
		};

		let epoch = self.session.bump();
		self.session.set_state(ConnectionState::Connected);
		self.can_send = identity.is_some();

		let flags = ParseFlags {
			parse_emoticons: self.config.get_bool_or("parseEmoticon", true),
			filter_xss: self.config.get_bool_or("filterXss", true),
		};

		let (cmd_tx, cmd_rx) = mpsc::channel(16);
		self.cmd_tx = Some(cmd_tx);

		let ctx = LoopCtx {
			session: Arc::clone(&self.session),
			events: Arc::clone(&self.events),
			connect_socket: self.connect_socket.clone(),
			url,
			identity,
			channel,
			epoch,
			reconnect: self.config.get_bool_or("reconnect", true),
			flags,
			session_id,
		};

		self.events.emit(&ChatEvent::Connected);
		self.task = Some(tokio::spawn(Self::run_loop(client, cmd_rx, ctx)));

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
		self.can_send = false;

		self.events.emit(&ChatEvent::Disconnected);
	}

	async fn send(&mut self, text: &str) -> Result<SendReceipt, AdapterError> {
		if self.session.state() != ConnectionState::Connected {
			return Err(AdapterError::NotConnected);
		}
		if !self.can_send {
			return Err(AdapterError::WritePermissionDenied {
				detail: "twitch identity (username + accessToken) not configured".to_string(),
			});
		}

		let Some(cmd_tx) = self.cmd_tx.clone() else {
			return Err(AdapterError::NotConnected);
		};

		let (resp_tx, resp_rx) = oneshot::channel();
		cmd_tx
			.send(TwitchCommand::Say {
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
