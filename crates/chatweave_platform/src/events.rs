#![forbid(unsafe_code)]

use std::collections::HashMap;

use chatweave_domain::{ChatUser, Message};

/// Enumerated event kinds an adapter can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	Connected,
	Disconnected,
	Reconnect,
	Message,
	Whisper,
	MessageDeleted,
	MessagesCleared,
	UserMessagesPurged,
	UserTimeout,
	UserJoin,
	UserLeave,
	UserUpdate,
	SuperChat,
	UserBanned,
	ChatEnded,
	CredentialsExpired,
	Error,
}

/// Event payloads delivered to registered callbacks.
#[derive(Debug, Clone)]
pub enum ChatEvent {
	Connected,
	Disconnected,
	/// Emitted before each retry timer is scheduled, carrying the new
	/// attempt count.
	Reconnect { attempt: u32 },
	Message(Message),
	/// Direct message, distinct from ordinary `Message`.
	Whisper(Message),
	MessageDeleted { message_id: String },
	MessagesCleared,
	UserMessagesPurged { user_id: String },
	UserTimeout { user: ChatUser, duration_seconds: u64 },
	UserJoin { user: ChatUser },
	UserLeave { user: ChatUser },
	UserUpdate { user: ChatUser, roles: Vec<String> },
	SuperChat(Message),
	UserBanned { user: ChatUser },
	ChatEnded,
	/// Auth-class failure in background work; the caller should refresh
	/// credentials and reconnect.
	CredentialsExpired { detail: String },
	Error { detail: String },
}

impl ChatEvent {
	pub fn kind(&self) -> EventKind {
		match self {
			ChatEvent::Connected => EventKind::Connected,
			ChatEvent::Disconnected => EventKind::Disconnected,
			ChatEvent::Reconnect { .. } => EventKind::Reconnect,
			ChatEvent::Message(_) => EventKind::Message,
			ChatEvent::Whisper(_) => EventKind::Whisper,
			ChatEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
			ChatEvent::MessagesCleared => EventKind::MessagesCleared,
			ChatEvent::UserMessagesPurged { .. } => EventKind::UserMessagesPurged,
			ChatEvent::UserTimeout { .. } => EventKind::UserTimeout,
			ChatEvent::UserJoin { .. } => EventKind::UserJoin,
			ChatEvent::UserLeave { .. } => EventKind::UserLeave,
			ChatEvent::UserUpdate { .. } => EventKind::UserUpdate,
			ChatEvent::SuperChat(_) => EventKind::SuperChat,
			ChatEvent::UserBanned { .. } => EventKind::UserBanned,
			ChatEvent::ChatEnded => EventKind::ChatEnded,
			ChatEvent::CredentialsExpired { .. } => EventKind::CredentialsExpired,
			ChatEvent::Error { .. } => EventKind::Error,
		}
	}
}

pub type EventHandler = Box<dyn Fn(&ChatEvent) + Send + Sync + 'static>;

/// Single-subscriber callback registry.
///
/// Exactly one callback per event kind: a later registration for the same
/// kind silently replaces the earlier one. This is the deliberate
/// contract, not a multi-listener bus; consumers wanting fan-out register
/// one callback and dispatch themselves.
#[derive(Default)]
pub struct EventRegistry {
	handlers: parking_lot::RwLock<HashMap<EventKind, EventHandler>>,
}

impl EventRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register the callback for `kind`, replacing any earlier one.
	pub fn on(&self, kind: EventKind, handler: EventHandler) {
		self.handlers.write().insert(kind, handler);
	}

	/// Remove the callback for `kind`.
	pub fn off(&self, kind: EventKind) {
		self.handlers.write().remove(&kind);
	}

	/// Invoke the registered callback for the event's kind, if any.
	pub fn emit(&self, event: &ChatEvent) {
		let handlers = self.handlers.read();
		if let Some(handler) = handlers.get(&event.kind()) {
			handler(event);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicU32, Ordering};

	use super::*;

	#[test]
	fn emit_dispatches_to_registered_kind_only() {
		let registry = EventRegistry::new();
		let hits = Arc::new(AtomicU32::new(0));

		let hits_clone = Arc::clone(&hits);
		registry.on(
			EventKind::Connected,
			Box::new(move |_| {
				hits_clone.fetch_add(1, Ordering::SeqCst);
			}),
		);

		registry.emit(&ChatEvent::Connected);
		registry.emit(&ChatEvent::Disconnected);
		assert_eq!(hits.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn later_registration_replaces_earlier() {
		let registry = EventRegistry::new();
		let first = Arc::new(AtomicU32::new(0));
		let second = Arc::new(AtomicU32::new(0));

		let first_clone = Arc::clone(&first);
		registry.on(
			EventKind::Error,
			Box::new(move |_| {
				first_clone.fetch_add(1, Ordering::SeqCst);
			}),
		);
		let second_clone = Arc::clone(&second);
		registry.on(
			EventKind::Error,
			Box::new(move |_| {
				second_clone.fetch_add(1, Ordering::SeqCst);
			}),
		);

		registry.emit(&ChatEvent::Error {
			detail: "boom".to_string(),
		});

		assert_eq!(first.load(Ordering::SeqCst), 0);
		assert_eq!(second.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn off_unregisters() {
		let registry = EventRegistry::new();
		let hits = Arc::new(AtomicU32::new(0));

		let hits_clone = Arc::clone(&hits);
		registry.on(
			EventKind::ChatEnded,
			Box::new(move |_| {
				hits_clone.fetch_add(1, Ordering::SeqCst);
			}),
		);
		registry.off(EventKind::ChatEnded);

		registry.emit(&ChatEvent::ChatEnded);
		assert_eq!(hits.load(Ordering::SeqCst), 0);
	}
}
