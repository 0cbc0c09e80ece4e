#![forbid(unsafe_code)]

pub mod backoff;
pub mod config;
pub mod dedup;
pub mod events;
pub mod facebook;
pub mod mixer;
pub mod registry;
#[cfg(test)]
pub(crate) mod testutil;
pub mod transform;
pub mod transport;
pub mod twitch;
pub mod youtube;

use std::sync::atomic::{AtomicU64, Ordering};

use chatweave_domain::{ConnectionState, Platform};
use thiserror::Error;
use uuid::Uuid;

pub use crate::config::ConfigStore;
pub use crate::events::{ChatEvent, EventHandler, EventKind, EventRegistry};
pub use crate::registry::AdapterFactory;
pub use crate::transport::{ChatSocket, HttpTransport, SocketConnector, SocketEvent, TransportError};

/// Errors surfaced by `connect()`/`send()` and classified into background
/// events by the autonomous loops.
#[derive(Debug, Error)]
pub enum AdapterError {
	/// Required config key missing or empty at connect time. Fatal to that
	/// connect attempt, never retried automatically.
	#[error("missing required config key: {key}")]
	Config { key: String },

	/// Handshake or auth rejected by the platform.
	#[error("connection failed: {detail}")]
	Connection { detail: String },

	/// Network failure during send or fetch.
	#[error("transport error: {detail}")]
	Transport { detail: String },

	/// Auth-class failure; the caller must refresh credentials and resume.
	#[error("credentials expired: {detail}")]
	CredentialsExpired { detail: String },

	/// Send attempted without elevated rights.
	#[error("write permission denied: {detail}")]
	WritePermissionDenied { detail: String },

	/// Operation requires an established connection.
	#[error("not connected")]
	NotConnected,

	/// Malformed or unexpected payload, inbound or outbound.
	#[error("protocol error: {detail}")]
	Protocol { detail: String },
}

impl From<TransportError> for AdapterError {
	fn from(err: TransportError) -> Self {
		if err.is_auth() {
			AdapterError::CredentialsExpired { detail: err.to_string() }
		} else {
			AdapterError::Transport { detail: err.to_string() }
		}
	}
}

/// Static capability flags, fixed per adapter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
	pub emoticons: bool,
	pub writing: bool,
	/// Push (persistent socket) versus poll delivery.
	pub live: bool,
}

impl Capabilities {
	pub const fn has_emoticons(self) -> bool {
		self.emoticons
	}

	pub const fn has_writing(self) -> bool {
		self.writing
	}

	pub const fn is_live(self) -> bool {
		self.live
	}
}

/// Server-acknowledged send result, when the platform provides one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReceipt {
	pub message_id: Option<String>,
}

/// Contract implemented by every platform adapter.
///
/// An instance is created once per logical chat session, exclusively owned
/// by its caller, and destroyed (disconnected) at session end. Event
/// subscription is single-callback-per-event-kind: a later `on()`
/// registration for the same kind replaces the earlier one.
#[async_trait::async_trait]
pub trait ChatAdapter: Send {
	/// Which platform this adapter implements.
	fn platform(&self) -> Platform;

	/// Static capability flags for this adapter type.
	fn capabilities(&self) -> Capabilities;

	/// Current lifecycle state.
	fn connection_state(&self) -> ConnectionState;

	/// Per-instance config store.
	fn config(&self) -> &ConfigStore;
	fn config_mut(&mut self) -> &mut ConfigStore;

	/// Register the callback for one event kind (last registration wins).
	fn on(&mut self, kind: EventKind, handler: EventHandler);

	/// Validate required config, perform the platform handshake and start
	/// ingesting. Idempotent while `Connecting`/`Connected`.
	async fn connect(&mut self) -> Result<(), AdapterError>;

	/// Tear down the transport, cancel pending work and emit
	/// `disconnected`. No-op when already disconnected.
	async fn disconnect(&mut self);

	/// Send a chat message through the platform.
	async fn send(&mut self, text: &str) -> Result<SendReceipt, AdapterError>;
}

/// Shared connection flag plus cancellation epoch.
///
/// `disconnect()` bumps the epoch synchronously; background cycles capture
/// the epoch they were spawned under and re-check it after every await so
/// a late-resolving response becomes a no-op instead of mutating state.
pub(crate) struct Session {
	state: parking_lot::Mutex<ConnectionState>,
	epoch: AtomicU64,
}

impl Session {
	pub(crate) fn new() -> Self {
		Self {
			state: parking_lot::Mutex::new(ConnectionState::Disconnected),
			epoch: AtomicU64::new(0),
		}
	}

	pub(crate) fn state(&self) -> ConnectionState {
		*self.state.lock()
	}

	pub(crate) fn set_state(&self, state: ConnectionState) {
		*self.state.lock() = state;
	}

	/// Invalidate all prior epochs and return the new one.
	pub(crate) fn bump(&self) -> u64 {
		self.epoch.fetch_add(1, Ordering::SeqCst) + 1
	}

	pub(crate) fn is_current(&self, epoch: u64) -> bool {
		self.epoch.load(Ordering::SeqCst) == epoch
	}
}

/// Generate an opaque adapter session id for log correlation.
pub(crate) fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Wall clock in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
	chrono::Utc::now().timestamp_millis()
}
