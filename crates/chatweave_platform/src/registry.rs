#![forbid(unsafe_code)]

use std::sync::Arc;

use chatweave_domain::Platform;

use crate::facebook::FacebookAdapter;
use crate::mixer::MixerAdapter;
use crate::transport::{HttpTransport, ReqwestTransport, SocketConnector, default_socket_connector};
use crate::twitch::TwitchAdapter;
use crate::youtube::YouTubeAdapter;
use crate::ChatAdapter;

/// Constructs a fresh adapter per chat session, keyed by platform.
///
/// The factory owns the injected transports and hands each new adapter its
/// own handles; there is no process-wide adapter instance and no hidden
/// shared state between sessions.
#[derive(Clone)]
pub struct AdapterFactory {
	http: Arc<dyn HttpTransport>,
	connect_socket: SocketConnector,
}

impl AdapterFactory {
	pub fn new() -> Self {
		Self {
			http: Arc::new(ReqwestTransport::new()),
			connect_socket: default_socket_connector(),
		}
	}

	pub fn with_http_transport(mut self, http: Arc<dyn HttpTransport>) -> Self {
		self.http = http;
		self
	}

	pub fn with_socket_connector(mut self, connect_socket: SocketConnector) -> Self {
		self.connect_socket = connect_socket;
		self
	}

	/// Build a new adapter instance for `platform`.
	pub fn create(&self, platform: Platform) -> Box<dyn ChatAdapter> {
		match platform {
			Platform::Twitch => Box::new(TwitchAdapter::with_socket_connector(self.connect_socket.clone())),
			Platform::Mixer => Box::new(MixerAdapter::with_transports(
				Arc::clone(&self.http),
				self.connect_socket.clone(),
			)),
			Platform::YouTube => Box::new(YouTubeAdapter::with_http_transport(Arc::clone(&self.http))),
			Platform::Facebook => Box::new(FacebookAdapter::with_http_transport(Arc::clone(&self.http))),
		}
	}
}

impl Default for AdapterFactory {
	fn default() -> Self {
		Self::new()
	}
}
