#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chatweave_domain::ConnectionState;
use serde_json::{Value, json};
use tokio::sync::Notify;

use crate::events::{ChatEvent, EventKind};
use crate::testutil::{FakeHttp, Scripted, capture_events, expect_event, http_error, ok_json};
use crate::transport::HttpResponse;
use crate::youtube::YouTubeAdapter;
use crate::{AdapterError, ChatAdapter};

fn adapter_with(http: Arc<FakeHttp>) -> YouTubeAdapter {
	let mut adapter = YouTubeAdapter::with_http_transport(http);
	adapter
		.config_mut()
		.set("liveChatId", "chat-1")
		.set("accessToken", "token-1");
	adapter
}

fn text_item(id: &str, text: &str) -> Value {
	json!({
		"id": id,
		"snippet": {
			"type": "textMessageEvent",
			"displayMessage": text,
			"publishedAt": "2023-11-14T22:00:00Z",
		},
		"authorDetails": {
			"channelId": "UC123",
			"displayName": "Viewer",
			"profileImageUrl": "https://yt.example/avatar.png",
			"isChatModerator": false,
			"isChatOwner": false,
			"isChatSponsor": true,
			"isVerified": false,
		},
	})
}

fn page(items: Vec<Value>, next_page_token: Option<&str>, polling_interval_millis: Option<u64>) -> Value {
	let mut page = json!({ "items": items });
	if let Some(token) = next_page_token {
		page["nextPageToken"] = json!(token);
	}
	if let Some(interval) = polling_interval_millis {
		page["pollingIntervalMillis"] = json!(interval);
	}
	page
}

#[tokio::test(start_paused = true)]
async fn overlapping_poll_windows_emit_each_id_once() {
	let http = FakeHttp::new();
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![
			ok_json(page(vec![text_item("m1", "one"), text_item("m2", "two")], Some("t1"), Some(1_000))),
			ok_json(page(vec![text_item("m2", "two"), text_item("m3", "three")], Some("t2"), None)),
		],
	);

	let mut adapter = adapter_with(Arc::clone(&http));
	let mut events = capture_events(&mut adapter);

	adapter.connect().await.expect("connect");
	expect_event(&mut events, EventKind::Connected).await;

	let mut seen = Vec::new();
	for _ in 0..3 {
		let ev = expect_event(&mut events, EventKind::Message).await;
		let ChatEvent::Message(message) = ev else {
			panic!("expected message");
		};
		seen.push(message.id);
	}

	assert_eq!(seen, vec!["m1", "m2", "m3"]);
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(events.try_recv().is_err(), "duplicate id must not be re-emitted");

	// The paging cursor was threaded into the second request.
	let polls: Vec<String> = http
		.requests()
		.into_iter()
		.filter(|(m, url, _)| *m == reqwest::Method::GET && url.contains("/liveChat/messages"))
		.map(|(_, url, _)| url)
		.collect();
	assert!(polls.len() >= 2);
	assert!(!polls[0].contains("pageToken="));
	assert!(polls[1].contains("pageToken=t1"));
}

#[tokio::test]
async fn message_bodies_are_escaped_and_linkified() {
	let http = FakeHttp::new();
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![ok_json(page(
			vec![text_item("m1", "<b>see</b> https://yt.example/clip")],
			None,
			None,
		))],
	);

	let mut adapter = adapter_with(http);
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");

	let ev = expect_event(&mut events, EventKind::Message).await;
	let ChatEvent::Message(message) = ev else {
		panic!("expected message");
	};

	assert_eq!(message.raw, "<b>see</b> https://yt.example/clip");
	assert_eq!(
		message.body,
		"&lt;b&gt;see&lt;/b&gt; <a href='https://yt.example/clip' class='link'>https://yt.example/clip</a>"
	);
	assert_eq!(message.username, "Viewer");
	assert_eq!(message.extra["sponsor"], true);
	assert_eq!(message.extra["authorChannelId"], "UC123");
}

#[tokio::test]
async fn special_item_types_dispatch_to_their_events() {
	let http = FakeHttp::new();
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![ok_json(page(
			vec![
				json!({
					"id": "sc1",
					"snippet": {
						"type": "superChatEvent",
						"superChatDetails": {
							"userComment": "great stream",
							"amountDisplayString": "$5.00",
							"amountMicros": "5000000",
							"tier": 2,
							"currency": "USD",
						},
					},
					"authorDetails": { "displayName": "Fan" },
				}),
				json!({
					"id": "del1",
					"snippet": {
						"type": "messageDeletedEvent",
						"messageDeletedDetails": { "deletedMessageId": "m7" },
					},
				}),
				json!({
					"id": "ban1",
					"snippet": {
						"type": "userBannedEvent",
						"userBannedDetails": {
							"bannedUserDetails": { "channelId": "UC9", "displayName": "Spammer" },
						},
					},
				}),
			],
			None,
			None,
		))],
	);

	let mut adapter = adapter_with(http);
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");

	let ev = expect_event(&mut events, EventKind::SuperChat).await;
	let ChatEvent::SuperChat(message) = ev else {
		panic!("expected super chat");
	};
	assert_eq!(message.raw, "great stream");
	assert_eq!(message.extra["amount"], "$5.00");
	assert_eq!(message.extra["currency"], "USD");

	let ev = expect_event(&mut events, EventKind::MessageDeleted).await;
	assert!(matches!(ev, ChatEvent::MessageDeleted { message_id } if message_id == "m7"));

	let ev = expect_event(&mut events, EventKind::UserBanned).await;
	let ChatEvent::UserBanned { user } = ev else {
		panic!("expected ban");
	};
	assert_eq!(user.username, "Spammer");
	assert_eq!(user.id.as_deref(), Some("UC9"));
}

#[tokio::test]
async fn chat_ended_disconnects_the_adapter() {
	let http = FakeHttp::new();
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![ok_json(page(
			vec![json!({ "id": "end1", "snippet": { "type": "chatEndedEvent" } })],
			None,
			None,
		))],
	);

	let mut adapter = adapter_with(Arc::clone(&http));
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");

	expect_event(&mut events, EventKind::ChatEnded).await;
	expect_event(&mut events, EventKind::Disconnected).await;
	assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(http.request_count(&reqwest::Method::GET, "/liveChat/messages"), 1);
}

#[tokio::test]
async fn auth_failure_emits_credentials_expired() {
	let http = FakeHttp::new();
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![http_error(401, json!({ "error": { "code": 401 } }))],
	);

	let mut adapter = adapter_with(Arc::clone(&http));
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");

	expect_event(&mut events, EventKind::CredentialsExpired).await;
	assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);

	// The loop does not self-heal from fetch errors.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(http.request_count(&reqwest::Method::GET, "/liveChat/messages"), 1);
}

#[tokio::test]
async fn generic_fetch_failure_emits_error() {
	let http = FakeHttp::new();
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![http_error(503, Value::Null)],
	);

	let mut adapter = adapter_with(http);
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");

	expect_event(&mut events, EventKind::Error).await;
	assert_eq!(adapter.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_discards_an_in_flight_fetch() {
	let http = FakeHttp::new();
	let gate = Arc::new(Notify::new());
	http.add_route(
		reqwest::Method::GET,
		"/liveChat/messages",
		vec![Scripted::Gated(
			Arc::clone(&gate),
			Ok(HttpResponse {
				status: 200,
				data: page(vec![text_item("m1", "late")], None, None),
			}),
		)],
	);

	let mut adapter = adapter_with(Arc::clone(&http));
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");
	expect_event(&mut events, EventKind::Connected).await;

	// Wait for the fetch to be in flight, then disconnect under it.
	while http.request_count(&reqwest::Method::GET, "/liveChat/messages") == 0 {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	adapter.disconnect().await;
	expect_event(&mut events, EventKind::Disconnected).await;

	gate.notify_one();
	tokio::time::sleep(Duration::from_millis(50)).await;

	assert!(events.try_recv().is_err(), "late fetch must not emit messages");
	assert_eq!(http.request_count(&reqwest::Method::GET, "/liveChat/messages"), 1);
}

#[tokio::test]
async fn send_feeds_the_acknowledged_item_through_the_handler() {
	let http = FakeHttp::new();
	// The poll loop parks on the unmatched GET while we exercise send.
	http.add_route(
		reqwest::Method::POST,
		"/liveChat/messages",
		vec![ok_json(text_item("m9", "my own message"))],
	);

	let mut adapter = adapter_with(Arc::clone(&http));
	let mut events = capture_events(&mut adapter);
	adapter.connect().await.expect("connect");
	expect_event(&mut events, EventKind::Connected).await;

	let receipt = adapter.send("my own message").await.expect("send");
	assert_eq!(receipt.message_id.as_deref(), Some("m9"));

	let ev = expect_event(&mut events, EventKind::Message).await;
	assert!(matches!(ev, ChatEvent::Message(m) if m.id == "m9"));

	let (_, _, body) = http
		.requests()
		.into_iter()
		.find(|(m, _, _)| *m == reqwest::Method::POST)
		.expect("send request recorded");
	assert_eq!(
		body.expect("send carries a body")["snippet"]["textMessageDetails"]["messageText"],
		"my own message"
	);
}

#[tokio::test]
async fn send_rejects_empty_and_disconnected() {
	let http = FakeHttp::new();
	let mut adapter = adapter_with(Arc::clone(&http));

	assert!(matches!(adapter.send("hi").await, Err(AdapterError::NotConnected)));

	adapter.connect().await.expect("connect");
	assert!(matches!(adapter.send("   ").await, Err(AdapterError::Protocol { .. })));
}

#[tokio::test]
async fn connect_fails_fast_on_missing_required_config() {
	let mut adapter = YouTubeAdapter::with_http_transport(FakeHttp::new());
	adapter.config_mut().set("liveChatId", "chat-1");

	match adapter.connect().await {
		Err(AdapterError::Config { key }) => assert_eq!(key, "accessToken"),
		other => panic!("expected config error, got {other:?}"),
	}
}
