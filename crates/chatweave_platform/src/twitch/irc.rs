#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use anyhow::{Context, anyhow, bail};
use tracing::{debug, warn};
use url::Url;

use crate::transport::{ChatSocket, SocketConnector, SocketEvent, TransportError};

/// One parsed IRC line: `@tags :prefix COMMAND params :trailing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IrcMessage {
	pub tags: HashMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

impl IrcMessage {
	/// Sender nick from a `nick!user@host` prefix.
	pub fn sender_nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		Some(prefix.split('!').next().unwrap_or(prefix))
	}

	pub fn trailing(&self) -> &str {
		self.params.last().map(String::as_str).unwrap_or_default()
	}
}

pub(crate) fn parse_message(line: &str) -> Option<IrcMessage> {
	let line = line.trim_end_matches(['\r', '\n']);
	if line.is_empty() {
		return None;
	}

	let mut rest = line;
	let mut tags = HashMap::new();

	if let Some(stripped) = rest.strip_prefix('@') {
		let (tag_part, remainder) = stripped.split_once(' ')?;
		for pair in tag_part.split(';') {
			match pair.split_once('=') {
				Some((k, v)) => tags.insert(k.to_string(), unescape_tag_value(v)),
				None => tags.insert(pair.to_string(), String::new()),
			};
		}
		rest = remainder;
	}

	let mut prefix = None;
	if let Some(stripped) = rest.strip_prefix(':') {
		let (prefix_part, remainder) = stripped.split_once(' ')?;
		prefix = Some(prefix_part.to_string());
		rest = remainder;
	}

	let mut params = Vec::new();
	let command;
	match rest.split_once(' ') {
		Some((cmd, mut param_part)) => {
			command = cmd.to_string();
			loop {
				if let Some(trailing) = param_part.strip_prefix(':') {
					params.push(trailing.to_string());
					break;
				}
				match param_part.split_once(' ') {
					Some((p, remainder)) => {
						if !p.is_empty() {
							params.push(p.to_string());
						}
						param_part = remainder;
					}
					None => {
						if !param_part.is_empty() {
							params.push(param_part.to_string());
						}
						break;
					}
				}
			}
		}
		None => command = rest.to_string(),
	}

	if command.is_empty() {
		return None;
	}

	Some(IrcMessage {
		tags,
		prefix,
		command,
		params,
	})
}

/// IRCv3 tag value unescaping.
fn unescape_tag_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let mut chars = value.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

/// Parse the `emotes=` tag (`25:0-4,12-16/1902:6-10`) into a mapping of
/// emote id -> list of `"start-end"` offset strings. Offsets reference the
/// pre-transform raw message body.
pub(crate) fn parse_emote_tag(tag: &str) -> Vec<(String, Vec<String>)> {
	let mut out = Vec::new();
	for group in tag.split('/') {
		let Some((id, positions)) = group.split_once(':') else {
			continue;
		};
		if id.is_empty() {
			continue;
		}
		let positions: Vec<String> = positions.split(',').filter(|p| !p.is_empty()).map(String::from).collect();
		if !positions.is_empty() {
			out.push((id.to_string(), positions));
		}
	}
	out
}

/// Inbound chat line with its user metadata tags.
#[derive(Debug, Clone)]
pub(crate) struct ChatLine {
	pub tags: HashMap<String, String>,
	pub sender: String,
	pub text: String,
}

#[derive(Debug)]
pub(crate) enum IrcEvent {
	Chat(ChatLine),
	/// Server asked us to tear down and reconnect.
	Reconnect,
	Other(IrcMessage),
}

/// Minimal Twitch chat-protocol client over an injected socket.
///
/// Requests message tags, authenticates (or joins read-only as a
/// `justinfan` guest), joins one channel, answers PINGs itself and
/// surfaces PRIVMSG lines as chat events.
pub(crate) struct IrcClient {
	socket: Box<dyn ChatSocket>,
	pending: VecDeque<String>,
}

impl IrcClient {
	pub async fn connect(
		connect_socket: &SocketConnector,
		url: Url,
		identity: Option<&(String, String)>,
		channel: &str,
	) -> anyhow::Result<Self> {
		let socket = connect_socket(url).await.context("open chat socket")?;
		let mut client = Self {
			socket,
			pending: VecDeque::new(),
		};

		client
			.send_line("CAP REQ :twitch.tv/tags twitch.tv/commands")
			.await
			.context("request capabilities")?;

		match identity {
			Some((username, token)) => {
				let token = token.strip_prefix("oauth:").unwrap_or(token);
				client.send_line(&format!("PASS oauth:{token}")).await?;
				client.send_line(&format!("NICK {}", username.to_ascii_lowercase())).await?;
			}
			None => {
				client
					.send_line(&format!("NICK justinfan{}", crate::now_ms() % 100_000))
					.await?;
			}
		}

		client.read_until_welcome().await?;
		client.send_line(&format!("JOIN #{channel}")).await.context("join channel")?;
		client.read_until_joined(channel).await?;

		Ok(client)
	}

	async fn send_line(&mut self, line: &str) -> anyhow::Result<()> {
		self.socket
			.send_text(line)
			.await
			.map_err(|e| anyhow!("chat socket write: {e}"))
	}

	pub async fn say(&mut self, channel: &str, text: &str) -> Result<(), TransportError> {
		self.socket.send_text(&format!("PRIVMSG #{channel} :{text}")).await
	}

	pub async fn close(&mut self) {
		self.socket.close().await;
	}

	async fn next_line(&mut self) -> Option<Result<String, TransportError>> {
		loop {
			if let Some(line) = self.pending.pop_front() {
				return Some(Ok(line));
			}

			match self.socket.next_event().await? {
				Ok(SocketEvent::Text(frame)) => {
					for line in frame.split("\r\n").filter(|l| !l.trim().is_empty()) {
						self.pending.push_back(line.to_string());
					}
				}
				Ok(SocketEvent::Closed) => return None,
				Err(e) => return Some(Err(e)),
			}
		}
	}

	async fn read_until_welcome(&mut self) -> anyhow::Result<()> {
		loop {
			let line = match self.next_line().await {
				Some(Ok(line)) => line,
				Some(Err(e)) => bail!("chat socket read: {e}"),
				None => bail!("chat socket closed before welcome"),
			};
			let Some(msg) = parse_message(&line) else {
				continue;
			};

			match msg.command.as_str() {
				"001" => return Ok(()),
				"PING" => self.send_line(&format!("PONG :{}", msg.trailing())).await?,
				"NOTICE" => {
					let text = msg.trailing().to_ascii_lowercase();
					if text.contains("authentication failed") || text.contains("improperly formatted auth") {
						bail!("twitch login rejected: {}", msg.trailing());
					}
				}
				_ => {}
			}
		}
	}

	async fn read_until_joined(&mut self, channel: &str) -> anyhow::Result<()> {
		loop {
			let line = match self.next_line().await {
				Some(Ok(line)) => line,
				Some(Err(e)) => bail!("chat socket read: {e}"),
				None => bail!("chat socket closed before join completed"),
			};
			let Some(msg) = parse_message(&line) else {
				continue;
			};

			match msg.command.as_str() {
				// End of NAMES confirms the join.
				"366" => return Ok(()),
				"PING" => self.send_line(&format!("PONG :{}", msg.trailing())).await?,
				"NOTICE" => {
					let text = msg.trailing();
					warn!(%channel, notice = %text, "notice during join");
					if text.to_ascii_lowercase().contains("authentication failed") {
						bail!("twitch login rejected: {text}");
					}
				}
				// Chat arriving already means the join took effect; keep
				// the line for the read loop.
				"PRIVMSG" => {
					self.pending.push_front(line.clone());
					return Ok(());
				}
				_ => {}
			}
		}
	}

	/// Next protocol event; `None` once the socket has ended.
	pub async fn next(&mut self) -> Option<Result<IrcEvent, TransportError>> {
		loop {
			let line = match self.next_line().await? {
				Ok(line) => line,
				Err(e) => return Some(Err(e)),
			};
			let Some(msg) = parse_message(&line) else {
				continue;
			};

			match msg.command.as_str() {
				"PING" => {
					let pong = format!("PONG :{}", msg.trailing());
					if let Err(e) = self.socket.send_text(&pong).await {
						return Some(Err(e));
					}
				}
				"PRIVMSG" => {
					let sender = msg.sender_nick().unwrap_or_default().to_string();
					let text = msg.trailing().to_string();
					return Some(Ok(IrcEvent::Chat(ChatLine {
						tags: msg.tags,
						sender,
						text,
					})));
				}
				"RECONNECT" => return Some(Ok(IrcEvent::Reconnect)),
				_ => {
					debug!(command = %msg.command, "ignoring irc command");
					return Some(Ok(IrcEvent::Other(msg)));
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_tagged_privmsg() {
		let line = "@badges=broadcaster/1;color=#FF0000;display-name=Streamer;emotes=25:3-7;id=abc;tmi-sent-ts=1700000000000 :streamer!streamer@streamer.tmi.twitch.tv PRIVMSG #demo :hi Kappa";
		let msg = parse_message(line).unwrap();

		assert_eq!(msg.command, "PRIVMSG");
		assert_eq!(msg.sender_nick(), Some("streamer"));
		assert_eq!(msg.params, vec!["#demo".to_string(), "hi Kappa".to_string()]);
		assert_eq!(msg.tags.get("display-name").unwrap(), "Streamer");
		assert_eq!(msg.tags.get("emotes").unwrap(), "25:3-7");
	}

	#[test]
	fn unescapes_tag_values() {
		let msg = parse_message("@system-msg=5\\sraiders\\sfrom\\sdemo :tmi.twitch.tv USERNOTICE #demo").unwrap();
		assert_eq!(msg.tags.get("system-msg").unwrap(), "5 raiders from demo");
	}

	#[test]
	fn parses_ping_and_numerics() {
		let ping = parse_message("PING :tmi.twitch.tv").unwrap();
		assert_eq!(ping.command, "PING");
		assert_eq!(ping.trailing(), "tmi.twitch.tv");

		let welcome = parse_message(":tmi.twitch.tv 001 nick :Welcome, GLHF!").unwrap();
		assert_eq!(welcome.command, "001");
	}

	#[test]
	fn emote_tag_maps_id_to_offset_pairs() {
		let parsed = parse_emote_tag("25:0-4,12-16/1902:6-10");
		assert_eq!(
			parsed,
			vec![
				("25".to_string(), vec!["0-4".to_string(), "12-16".to_string()]),
				("1902".to_string(), vec!["6-10".to_string()]),
			]
		);

		assert!(parse_emote_tag("").is_empty());
	}
}
