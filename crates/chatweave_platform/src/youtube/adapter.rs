#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chatweave_domain::{ChatUser, ConnectionState, Message, Platform};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::dedup::DedupWindow;
use crate::events::{ChatEvent, EventHandler, EventKind, EventRegistry};
use crate::transform::{TransformedText, effective_poll_delay};
use crate::transport::{HttpTransport, ReqwestTransport};
use crate::{AdapterError, Capabilities, ChatAdapter, SendReceipt, Session, new_session_id, now_ms};

const REQUIRED: &[&str] = &["liveChatId", "accessToken"];

const CAPABILITIES: Capabilities = Capabilities {
	emoticons: true,
	writing: true,
	live: false,
};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const DEDUP_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LiveChatPage {
	#[serde(default)]
	pub items: Vec<LiveChatItem>,
	#[serde(default)]
	pub next_page_token: Option<String>,
	#[serde(default)]
	pub polling_interval_millis: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LiveChatItem {
	pub id: String,
	pub snippet: LiveChatSnippet,
	#[serde(default)]
	pub author_details: Option<AuthorDetails>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LiveChatSnippet {
	#[serde(rename = "type", default)]
	pub kind: String,
	#[serde(default)]
	pub display_message: Option<String>,
	#[serde(default)]
	pub published_at: Option<String>,
	#[serde(default)]
	pub super_chat_details: Option<SuperChatDetails>,
	#[serde(default)]
	pub message_deleted_details: Option<MessageDeletedDetails>,
	#[serde(default)]
	pub user_banned_details: Option<UserBannedDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct SuperChatDetails {
	#[serde(default)]
	pub user_comment: Option<String>,
	#[serde(default)]
	pub amount_display_string: Option<String>,
	#[serde(default)]
	pub amount_micros: Option<Value>,
	#[serde(default)]
	pub tier: Option<u64>,
	#[serde(default)]
	pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MessageDeletedDetails {
	pub deleted_message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UserBannedDetails {
	pub banned_user_details: BannedUser,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct BannedUser {
	#[serde(default)]
	pub channel_id: Option<String>,
	#[serde(default)]
	pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AuthorDetails {
	#[serde(default)]
	pub channel_id: Option<String>,
	#[serde(default)]
	pub display_name: Option<String>,
	#[serde(default)]
	pub profile_image_url: Option<String>,
	#[serde(default)]
	pub is_chat_moderator: bool,
	#[serde(default)]
	pub is_chat_owner: bool,
	#[serde(default)]
	pub is_chat_sponsor: bool,
	#[serde(default)]
	pub is_verified: bool,
}

#[derive(Clone, Copy)]
struct MessageFlags {
	parse_url: bool,
	format_messages: bool,
}

/// Everything one item needs to be normalized and emitted; shared by the
/// poll loop and the send path (which feeds the acknowledged item through
/// the same handler).
struct ItemCtx {
	events: Arc<EventRegistry>,
	dedup: Arc<Mutex<DedupWindow>>,
	flags: MessageFlags,
	emote_dict: HashMap<String, String>,
}

struct PollCtx {
	item: ItemCtx,
	session: Arc<Session>,
	http: Arc<dyn HttpTransport>,
	base: String,
	live_chat_id: String,
	access_token: String,
	max_results: u64,
	profile_image_size: u64,
	interval_ms: u64,
	epoch: u64,
	session_id: String,
}

#[derive(PartialEq, Eq)]
enum ItemOutcome {
	Continue,
	ChatEnded,
}

/// Paged-list polling adapter for YouTube live chat.
///
/// A self-rescheduling cancellable task fetches the message list, threads
/// `nextPageToken` between cycles and honors the server-suggested polling
/// interval with the configured interval as a minimum.
pub struct YouTubeAdapter {
	config: ConfigStore,
	events: Arc<EventRegistry>,
	session: Arc<Session>,
	http: Arc<dyn HttpTransport>,
	dedup: Arc<Mutex<DedupWindow>>,
	task: Option<JoinHandle<()>>,
}

impl YouTubeAdapter {
	pub fn new() -> Self {
		Self::with_http_transport(Arc::new(ReqwestTransport::new()))
	}

	pub fn with_http_transport(http: Arc<dyn HttpTransport>) -> Self {
		let mut config = ConfigStore::new(REQUIRED);
		config.set("maxResults", 200u64);
		config.set("interval", 5_000u64);
		config.set("profileImageSize", 64u64);
		config.set("parseUrl", true);
		config.set("formatMessages", true);
		config.set("parseEmoticon", true);

		Self {
			config,
			events: Arc::new(EventRegistry::new()),
			session: Arc::new(Session::new()),
			http,
			dedup: Arc::new(Mutex::new(DedupWindow::new(DEDUP_CAPACITY))),
			task: None,
		}
	}

	fn emote_dict(&self) -> HashMap<String, String> {
		let mut dict = HashMap::new();
		if !self.config.get_bool_or("parseEmoticon", true) {
			return dict;
		}
		if let Some(Value::Object(map)) = self.config.get("emoticons") {
			for (token, src) in map {
				if let Value::String(src) = src {
					dict.insert(token.clone(), src.clone());
				}
			}
		}
		dict
	}

	fn item_ctx(&self) -> ItemCtx {
		ItemCtx {
			events: Arc::clone(&self.events),
			dedup: Arc::clone(&self.dedup),
			flags: MessageFlags {
				parse_url: self.config.get_bool_or("parseUrl", true),
				format_messages: self.config.get_bool_or("formatMessages", true),
			},
			emote_dict: self.emote_dict(),
		}
	}

	async fn fetch_page(ctx: &PollCtx, page_token: Option<&str>) -> Result<LiveChatPage, AdapterError> {
		let mut url = format!(
			"{}/liveChat/messages?part=snippet%2CauthorDetails&liveChatId={}&maxResults={}&profileImageSize={}",
			ctx.base,
			urlencoding::encode(&ctx.live_chat_id),
			ctx.max_results,
			ctx.profile_image_size,
		);
		if let Some(token) = page_token
			&& !token.is_empty()
		{
			url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
		}

		let resp = ctx
			.http
			.request(reqwest::Method::GET, &url, Some(&ctx.access_token), None)
			.await?;

		serde_json::from_value(resp.data).map_err(|e| AdapterError::Protocol {
			detail: format!("malformed liveChat/messages response: {e}"),
		})
	}

	fn normalize_message(item: &LiveChatItem, raw: &str, ctx: &ItemCtx) -> Message {
		let mut text = TransformedText::escaped(raw);
		if ctx.flags.format_messages {
			if ctx.flags.parse_url {
				text.linkify();
			}
			text.substitute_emote_tokens(&ctx.emote_dict);
		}

		let author = item.author_details.as_ref();
		let username = author
			.and_then(|a| a.display_name.clone())
			.unwrap_or_default();
		let timestamp = item
			.snippet
			.published_at
			.as_deref()
			.and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
			.map(|dt| dt.timestamp_millis())
			.unwrap_or_else(now_ms);

		let mut message = Message::new(item.id.clone(), username, text.into_string(), raw, timestamp);
		message
			.extra
			.insert("type".to_string(), Value::String(item.snippet.kind.clone()));
		message.extra.insert(
			"authorChannelId".to_string(),
			json!(author.and_then(|a| a.channel_id.clone())),
		);
		message.extra.insert(
			"image".to_string(),
			Value::String(author.and_then(|a| a.profile_image_url.clone()).unwrap_or_default()),
		);
		message
			.extra
			.insert("moderator".to_string(), json!(author.is_some_and(|a| a.is_chat_moderator)));
		message
			.extra
			.insert("owner".to_string(), json!(author.is_some_and(|a| a.is_chat_owner)));
		message
			.extra
			.insert("sponsor".to_string(), json!(author.is_some_and(|a| a.is_chat_sponsor)));
		message
			.extra
			.insert("verified".to_string(), json!(author.is_some_and(|a| a.is_verified)));
		message
	}

	fn handle_item(item: &LiveChatItem, ctx: &ItemCtx) -> ItemOutcome {
		if !ctx.dedup.lock().insert(&item.id) {
			metrics::counter!("chatweave_youtube_duplicates_dropped_total").increment(1);
			return ItemOutcome::Continue;
		}

		match item.snippet.kind.as_str() {
			"superChatEvent" => {
				let details = item.snippet.super_chat_details.clone().unwrap_or_default();
				let raw = details.user_comment.clone().unwrap_or_default();
				let mut message = Self::normalize_message(item, &raw, ctx);
				message
					.extra
					.insert("amount".to_string(), json!(details.amount_display_string));
				message
					.extra
					.insert("amountMicros".to_string(), details.amount_micros.unwrap_or(Value::Null));
				message.extra.insert("tier".to_string(), json!(details.tier));
				message.extra.insert("currency".to_string(), json!(details.currency));
				ctx.events.emit(&ChatEvent::SuperChat(message));
			}
			"messageDeletedEvent" => {
				if let Some(details) = &item.snippet.message_deleted_details {
					ctx.events.emit(&ChatEvent::MessageDeleted {
						message_id: details.deleted_message_id.clone(),
					});
				}
			}
			"userBannedEvent" => {
				if let Some(details) = &item.snippet.user_banned_details {
					ctx.events.emit(&ChatEvent::UserBanned {
						user: ChatUser {
							id: details.banned_user_details.channel_id.clone(),
							username: details.banned_user_details.display_name.clone().unwrap_or_default(),
							roles: Vec::new(),
						},
					});
				}
			}
			"chatEndedEvent" => {
				ctx.events.emit(&ChatEvent::ChatEnded);
				return ItemOutcome::ChatEnded;
			}
			_ => {
				let raw = item.snippet.display_message.clone().unwrap_or_default();
				let message = Self::normalize_message(item, &raw, ctx);
				metrics::counter!("chatweave_youtube_messages_total").increment(1);
				ctx.events.emit(&ChatEvent::Message(message));
			}
		}

		ItemOutcome::Continue
	}

	async fn run_poll(ctx: PollCtx) {
		let mut page_token: Option<String> = None;

		loop {
			match Self::fetch_page(&ctx, page_token.as_deref()).await {
				Ok(page) => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}

					page_token = page.next_page_token.clone();
					for item in &page.items {
						if Self::handle_item(item, &ctx.item) == ItemOutcome::ChatEnded {
							info!(session_id = %ctx.session_id, "live chat ended; disconnecting");
							ctx.session.set_state(ConnectionState::Disconnected);
							ctx.events.emit(&ChatEvent::Disconnected);
							return;
						}
					}

					let delay = effective_poll_delay(ctx.interval_ms, page.polling_interval_millis);
					debug!(session_id = %ctx.session_id, delay_ms = delay, "next poll scheduled");
					tokio::time::sleep(Duration::from_millis(delay)).await;
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}
				}
				Err(err) => {
					if !ctx.session.is_current(ctx.epoch) {
						return;
					}

					// Fetch errors stop the loop; the caller reconnects.
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
					return;
				}
			}
		}
	}
}

impl Default for YouTubeAdapter {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait::async_trait]
impl ChatAdapter for YouTubeAdapter {
	fn platform(&self) -> Platform {
		Platform::YouTube
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

		self.dedup.lock().clear();
		let epoch = self.session.bump();
		self.session.set_state(ConnectionState::Connected);

		let session_id = new_session_id();
		info!(%session_id, "youtube polling starting");

		let ctx = PollCtx {
			item: self.item_ctx(),
			session: Arc::clone(&self.session),
			http: Arc::clone(&self.http),
			base: self.config.get_str_or("apiBaseUrl", DEFAULT_API_BASE),
			live_chat_id: self.config.get_str_or("liveChatId", ""),
			access_token: self.config.get_str_or("accessToken", ""),
			max_results: self.config.get_u64_or("maxResults", 200),
			profile_image_size: self.config.get_u64_or("profileImageSize", 64),
			interval_ms: self.config.get_u64_or("interval", 5_000),
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

		self.events.emit(&ChatEvent::Disconnected);
	}

	async fn send(&mut self, text: &str) -> Result<SendReceipt, AdapterError> {
		if self.session.state() != ConnectionState::Connected {
			return Err(AdapterError::NotConnected);
		}
		if text.trim().is_empty() {
			return Err(AdapterError::Protocol {
				detail: "message text must be non-empty".to_string(),
			});
		}

		let base = self.config.get_str_or("apiBaseUrl", DEFAULT_API_BASE);
		let url = format!("{base}/liveChat/messages?part=snippet%2CauthorDetails");
		let body = json!({
			"snippet": {
				"liveChatId": self.config.get_str_or("liveChatId", ""),
				"type": "textMessageEvent",
				"textMessageDetails": { "messageText": text },
			}
		});
		let token = self.config.get_str_or("accessToken", "");

		let resp = self
			.http
			.request(reqwest::Method::POST, &url, Some(&token), Some(body))
			.await?;

		let item: LiveChatItem = serde_json::from_value(resp.data).map_err(|e| AdapterError::Protocol {
			detail: format!("malformed liveChat insert response: {e}"),
		})?;

		// The acknowledged item flows through the normal handler: it is
		// emitted immediately and its id enters the dedup window, so the
		// next poll's echo of it is dropped.
		let receipt = SendReceipt {
			message_id: Some(item.id.clone()),
		};
		Self::handle_item(&item, &self.item_ctx());

		Ok(receipt)
	}
}
