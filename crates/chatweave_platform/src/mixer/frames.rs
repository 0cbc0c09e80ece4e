#![forbid(unsafe_code)]

use chatweave_domain::ChatUser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transform::escape_html;

/// Outbound `method` frame.
#[derive(Debug, Serialize)]
pub(super) struct MethodFrame<'a> {
	pub id: u64,
	#[serde(rename = "type")]
	pub kind: &'a str,
	pub method: &'a str,
	pub arguments: Value,
}

impl<'a> MethodFrame<'a> {
	pub fn new(id: u64, method: &'a str, arguments: Value) -> Self {
		Self {
			id,
			kind: "method",
			method,
			arguments,
		}
	}
}

/// Chat event payload carried by `ChatMessage` frames.
#[derive(Debug, Clone, Deserialize)]
pub(super) struct MixerChatData {
	#[serde(default)]
	pub id: Option<String>,
	pub user_name: String,
	#[serde(default)]
	pub user_id: Option<u64>,
	#[serde(default)]
	pub user_roles: Vec<String>,
	#[serde(default)]
	pub user_level: Option<u64>,
	#[serde(default)]
	pub user_avatar: Option<String>,
	pub message: MixerMessagePayload,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct MixerMessagePayload {
	pub message: Vec<MixerSegment>,
	#[serde(default)]
	pub meta: MixerMeta,
}

#[derive(Debug, Clone, Deserialize)]
pub(super) struct MixerSegment {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub text: String,
	#[serde(default)]
	pub url: Option<String>,
	#[serde(default)]
	pub pack: Option<String>,
	#[serde(default)]
	pub coords: Option<MixerCoords>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub(super) struct MixerCoords {
	pub x: i64,
	pub y: i64,
	pub width: u64,
	pub height: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub(super) struct MixerMeta {
	#[serde(default)]
	pub whisper: Option<bool>,
	#[serde(default)]
	pub censored: Option<bool>,
}

impl MixerMeta {
	pub fn is_whisper(&self) -> bool {
		self.whisper.unwrap_or(false)
	}

	pub fn is_censored(&self) -> bool {
		self.censored.unwrap_or(false)
	}
}

/// Classified inbound frame.
#[derive(Debug)]
pub(super) enum InboundFrame {
	UserJoin { user: ChatUser },
	UserLeave { user: ChatUser },
	Chat(Box<MixerChatData>),
	DeleteMessage { message_id: String },
	PurgeMessage { user_id: String },
	ClearMessages,
	UserTimeout { user: ChatUser, duration_seconds: u64 },
	UserUpdate { user: ChatUser, roles: Vec<String> },
	Malformed { detail: String },
	Other,
}

fn user_from_presence(value: &Value) -> ChatUser {
	ChatUser {
		id: value.get("id").map(json_id_to_string),
		username: value.get("username").and_then(Value::as_str).unwrap_or_default().to_string(),
		roles: string_list(value.get("roles")),
	}
}

fn json_id_to_string(value: &Value) -> String {
	match value {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

fn string_list(value: Option<&Value>) -> Vec<String> {
	value
		.and_then(Value::as_array)
		.map(|items| {
			items
				.iter()
				.filter_map(Value::as_str)
				.map(String::from)
				.collect()
		})
		.unwrap_or_default()
}

/// Classify one inbound frame. The checks are mutually exclusive and run
/// in priority order: presence frames first, then the named-event
/// dispatch table.
pub(super) fn classify_frame(value: &Value) -> InboundFrame {
	if value.get("originatingChannel").is_some() && value.get("username").is_some() {
		let user = user_from_presence(value);
		return if value.get("roles").is_some() {
			InboundFrame::UserJoin { user }
		} else {
			InboundFrame::UserLeave { user }
		};
	}

	let Some(event) = value.get("event").and_then(Value::as_str) else {
		return InboundFrame::Other;
	};
	let data = value.get("data").cloned().unwrap_or(Value::Null);

	match event {
		"ChatMessage" => match serde_json::from_value::<MixerChatData>(data) {
			Ok(chat) => InboundFrame::Chat(Box::new(chat)),
			Err(e) => InboundFrame::Malformed {
				detail: format!("malformed ChatMessage frame: {e}"),
			},
		},
		"DeleteMessage" => match data.get("id") {
			Some(id) => InboundFrame::DeleteMessage {
				message_id: json_id_to_string(id),
			},
			None => InboundFrame::Malformed {
				detail: "DeleteMessage frame without id".to_string(),
			},
		},
		"PurgeMessage" => match data.get("user_id") {
			Some(user_id) => InboundFrame::PurgeMessage {
				user_id: json_id_to_string(user_id),
			},
			None => InboundFrame::Malformed {
				detail: "PurgeMessage frame without user_id".to_string(),
			},
		},
		"ClearMessages" => InboundFrame::ClearMessages,
		"UserTimeout" => {
			let user = data.get("user").map(|u| ChatUser {
				id: u.get("user_id").map(json_id_to_string),
				username: u.get("user_name").and_then(Value::as_str).unwrap_or_default().to_string(),
				roles: string_list(u.get("user_roles")),
			});
			match user {
				Some(user) => InboundFrame::UserTimeout {
					user,
					duration_seconds: data.get("duration").and_then(Value::as_u64).unwrap_or(0),
				},
				None => InboundFrame::Malformed {
					detail: "UserTimeout frame without user".to_string(),
				},
			}
		}
		"UserUpdate" => {
			let roles = string_list(data.get("roles"));
			let user = ChatUser {
				id: data.get("user").map(json_id_to_string),
				username: data
					.get("username")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_string(),
				roles: roles.clone(),
			};
			InboundFrame::UserUpdate { user, roles }
		}
		_ => InboundFrame::Other,
	}
}

fn emoticon_markup(segment: &MixerSegment) -> Option<String> {
	let pack = segment.pack.as_deref()?;
	let coords = segment.coords?;

	Some(format!(
		"<span style=\"background-image: url('https://mixer.com/_latest/assets/emoticons/{pack}.png'); \
		 background-repeat: no-repeat; height: {}px; width: {}px; background-position-x: {}px; \
		 background-position-y: {}px;\" alt=\"{}\" class=\"emoticon\"></span>",
		coords.height,
		coords.width,
		-coords.x,
		-coords.y,
		escape_html(&segment.text),
	))
}

fn link_markup(segment: &MixerSegment) -> String {
	let url = segment.url.as_deref().unwrap_or(&segment.text);
	format!("<a href='{url}' class='link'>{}</a>", escape_html(&segment.text))
}

/// Raw text of a segment list: the untransformed source body.
pub(super) fn segments_raw_text(segments: &[MixerSegment]) -> String {
	segments.iter().map(|s| s.text.as_str()).collect()
}

/// Render a segment list to the transformed body. Text segments are
/// escaped; emoticon and link segments become markup when their passes
/// are enabled, escaped text otherwise.
pub(super) fn render_segments(segments: &[MixerSegment], parse_emoticon: bool, parse_url: bool) -> String {
	let mut body = String::new();
	for segment in segments {
		match segment.kind.as_str() {
			"emoticon" if parse_emoticon => match emoticon_markup(segment) {
				Some(markup) => body.push_str(&markup),
				None => body.push_str(&escape_html(&segment.text)),
			},
			"link" if parse_url => body.push_str(&link_markup(segment)),
			_ => body.push_str(&escape_html(&segment.text)),
		}
	}
	body
}
