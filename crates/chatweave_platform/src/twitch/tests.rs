#![forbid(unsafe_code)]

use std::time::Duration;

use chatweave_domain::ConnectionState;

use super::adapter::{ParseFlags, parse_chat_line};
use super::irc::ChatLine;
use crate::events::{ChatEvent, EventKind};
use crate::testutil::{SocketScript, capture_events, expect_event, scripted_connector};
use crate::twitch::TwitchAdapter;
use crate::{AdapterError, ChatAdapter};

fn handshake(script: &SocketScript) {
	script.text(":tmi.twitch.tv 001 tester :Welcome, GLHF!");
	script.text(":tester.tmi.twitch.tv 366 tester #demo :End of /NAMES list");
}

fn adapter_with(connector: crate::transport::SocketConnector) -> TwitchAdapter {
	let mut adapter = TwitchAdapter::with_socket_connector(connector);
	adapter.config_mut().set("channel", "demo").set("clientId", "client-1");
	adapter
}

fn chat_line(tags: &[(&str, &str)], sender: &str, text: &str) -> ChatLine {
	ChatLine {
		tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
		sender: sender.to_string(),
		text: text.to_string(),
	}
}

const PRIVMSG: &str = "@badges=broadcaster/1,subscriber/0;color=#1E90FF;display-name=Streamer;emotes=25:3-7;id=msg-1;mod=0;subscriber=1;tmi-sent-ts=1700000000000 :streamer!streamer@streamer.tmi.twitch.tv PRIVMSG #demo :hi Kappa";

#[tokio::test]
async fn connect_handshakes_and_emits_messages() {
	let (connector, scripts, _dialed) = scripted_connector(1);
	let mut adapter = adapter_with(connector);
	let mut events = capture_events(&mut adapter);

	handshake(&scripts[0]);
	adapter.connect().await.expect("connect");

	assert_eq!(adapter.connection_state(), ConnectionState::Connected);
	expect_event(&mut events, EventKind::Connected).await;

	let sent = scripts[0].sent.lock().clone();
	assert!(sent.iter().any(|l| l.starts_with("CAP REQ :twitch.tv/tags")));
	assert!(sent.iter().any(|l| l.starts_with("NICK justinfan")));
	assert!(sent.iter().any(|l| l == "JOIN #demo"));

	scripts[0].text(PRIVMSG);
	let ev = expect_event(&mut events, EventKind::Message).await;
	let ChatEvent::Message(message) = ev else {
		panic!("expected message event");
	};

	assert_eq!(message.id, "msg-1");
	assert_eq!(message.username, "Streamer");
	assert_eq!(message.raw, "hi Kappa");
	assert_eq!(
		message.body,
		"hi <img class=\"emoticon\" src=\"https://static-cdn.jtvnw.net/emoticons/v1/25/3.0\" />"
	);
	assert_eq!(message.timestamp, 1_700_000_000_000);
	assert_eq!(message.extra["broadcaster"], true);
	assert_eq!(message.extra["subscriber"], true);
}

#[tokio::test]
async fn connect_is_idempotent_while_connected() {
	let (connector, scripts, dialed) = scripted_connector(1);
	let mut adapter = adapter_with(connector);

	handshake(&scripts[0]);
	adapter.connect().await.expect("connect");
	adapter.connect().await.expect("second connect is a no-op");

	assert_eq!(dialed.lock().len(), 1);
}

#[tokio::test]
async fn connect_fails_fast_on_missing_required_config() {
	let (connector, _scripts, dialed) = scripted_connector(1);
	let mut adapter = TwitchAdapter::with_socket_connector(connector);
	adapter.config_mut().set("channel", "demo");

	match adapter.connect().await {
		Err(AdapterError::Config { key }) => assert_eq!(key, "clientId"),
		other => panic!("expected config error, got {other:?}"),
	}
	assert!(dialed.lock().is_empty());
	assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn send_requires_connection_and_identity() {
	let (connector, scripts, _dialed) = scripted_connector(1);
	let mut adapter = adapter_with(connector);

	assert!(matches!(adapter.send("hello").await, Err(AdapterError::NotConnected)));

	handshake(&scripts[0]);
	adapter.connect().await.expect("connect");

	// Anonymous guest connection cannot write.
	assert!(matches!(
		adapter.send("hello").await,
		Err(AdapterError::WritePermissionDenied { .. })
	));
}

#[tokio::test]
async fn authenticated_send_goes_through_the_socket() {
	let (connector, scripts, _dialed) = scripted_connector(1);
	let mut adapter = adapter_with(connector);
	adapter
		.config_mut()
		.set("username", "tester")
		.set("accessToken", "oauth:abc123");

	handshake(&scripts[0]);
	adapter.connect().await.expect("connect");

	let receipt = adapter.send("hello chat").await.expect("send");
	assert_eq!(receipt.message_id, None);

	let sent = scripts[0].sent.lock().clone();
	assert!(sent.iter().any(|l| l == "PRIVMSG #demo :hello chat"));
	assert!(sent.iter().any(|l| l == "PASS oauth:abc123"));
	assert!(sent.iter().any(|l| l == "NICK tester"));
}

#[tokio::test]
async fn disconnect_discards_late_socket_traffic() {
	let (connector, scripts, _dialed) = scripted_connector(1);
	let mut adapter = adapter_with(connector);
	let mut events = capture_events(&mut adapter);

	handshake(&scripts[0]);
	adapter.connect().await.expect("connect");
	expect_event(&mut events, EventKind::Connected).await;

	adapter.disconnect().await;
	assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
	expect_event(&mut events, EventKind::Disconnected).await;

	// Traffic resolving after disconnect must not re-emit events.
	scripts[0].text(PRIVMSG);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(events.try_recv().is_err());

	// Disconnecting again is a no-op.
	adapter.disconnect().await;
	assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn transport_error_triggers_backoff_reconnect() {
	let (connector, scripts, dialed) = scripted_connector(2);
	let mut adapter = adapter_with(connector);
	let mut events = capture_events(&mut adapter);

	handshake(&scripts[0]);
	handshake(&scripts[1]);
	adapter.connect().await.expect("connect");
	expect_event(&mut events, EventKind::Connected).await;

	scripts[0].error("connection reset");

	let ev = expect_event(&mut events, EventKind::Reconnect).await;
	let ChatEvent::Reconnect { attempt } = ev else {
		panic!("expected reconnect event");
	};
	assert_eq!(attempt, 1);

	expect_event(&mut events, EventKind::Connected).await;
	assert_eq!(adapter.connection_state(), ConnectionState::Connected);
	assert_eq!(dialed.lock().len(), 2);

	// The replacement socket keeps delivering chat.
	scripts[1].text(PRIVMSG);
	expect_event(&mut events, EventKind::Message).await;
}

#[test]
fn broadcaster_flag_requires_badge_value_one() {
	let flags = ParseFlags {
		parse_emoticons: true,
		filter_xss: true,
	};

	let with_badge = chat_line(&[("badges", "broadcaster/1")], "streamer", "hello");
	assert_eq!(parse_chat_line(&with_badge, flags).extra["broadcaster"], true);

	let without = chat_line(&[("badges", "subscriber/1")], "viewer", "hello");
	assert_eq!(parse_chat_line(&without, flags).extra["broadcaster"], false);
}

#[test]
fn escape_applies_outside_emote_markup_only() {
	let flags = ParseFlags {
		parse_emoticons: true,
		filter_xss: true,
	};

	let line = chat_line(&[("emotes", "25:6-10")], "viewer", "<b> & Kappa");
	let message = parse_chat_line(&line, flags);

	assert!(message.body.starts_with("&lt;b&gt; &amp; <img "));
	assert!(!message.body.contains("Kappa"));
	assert_eq!(message.raw, "<b> & Kappa");
}

#[test]
fn username_falls_back_to_sender_nick() {
	let flags = ParseFlags {
		parse_emoticons: false,
		filter_xss: false,
	};

	let line = chat_line(&[], "viewer42", "plain text");
	let message = parse_chat_line(&line, flags);

	assert_eq!(message.username, "viewer42");
	assert_eq!(message.body, "plain text");
	assert!(!message.id.is_empty());
}
