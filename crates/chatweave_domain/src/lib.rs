#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported chat platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	Mixer,
	YouTube,
	Facebook,
}

impl Platform {
	/// Stable lowercase identifier, also the registry lookup key.
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::Mixer => "mixer",
			Platform::YouTube => "youtube",
			Platform::Facebook => "facebook",
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"mixer" => Ok(Platform::Mixer),
			"youtube" | "yt" => Ok(Platform::YouTube),
			"facebook" | "fb" => Ok(Platform::Facebook),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

/// Connection lifecycle state of one adapter instance.
///
/// Transitions are driven only by the adapter itself; callers observe the
/// state through the adapter's accessor and never mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
}

impl ConnectionState {
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
		}
	}

	/// Whether the adapter currently holds an established session.
	pub const fn is_connected(self) -> bool {
		matches!(self, ConnectionState::Connected)
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Canonical chat message emitted to consumers.
///
/// `body` is the fully transformed text, `raw` the untransformed source
/// text. `extra` is a free-form map of platform-specific attributes; its
/// schema is adapter-specific and must not be used to infer cross-platform
/// behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
	pub id: String,
	pub username: String,
	pub body: String,
	pub raw: String,
	/// Epoch milliseconds.
	pub timestamp: i64,
	#[serde(default)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Message {
	pub fn new(
		id: impl Into<String>,
		username: impl Into<String>,
		body: impl Into<String>,
		raw: impl Into<String>,
		timestamp: i64,
	) -> Self {
		Self {
			id: id.into(),
			username: username.into(),
			body: body.into(),
			raw: raw.into(),
			timestamp,
			extra: serde_json::Map::new(),
		}
	}
}

/// Inclusive character-offset range into the *original* raw message text,
/// naming an emote image substitution. Offsets count Unicode scalar values
/// and are defined in terms of the original string only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSpan {
	pub start: usize,
	pub end: usize,
	pub id: String,
}

impl EmoteSpan {
	pub fn new(start: usize, end: usize, id: impl Into<String>) -> Self {
		Self {
			start,
			end,
			id: id.into(),
		}
	}
}

/// Platform user reference used by presence/moderation events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
	#[serde(default)]
	pub id: Option<String>,
	pub username: String,
	#[serde(default)]
	pub roles: Vec<String>,
}

impl ChatUser {
	pub fn named(username: impl Into<String>) -> Self {
		Self {
			id: None,
			username: username.into(),
			roles: Vec::new(),
		}
	}
}
