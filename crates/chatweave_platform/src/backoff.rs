#![forbid(unsafe_code)]

use std::time::Duration;

pub const DEFAULT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MULTIPLIER: f64 = 1.8;
pub const MAX_INTERVAL_MS: u64 = 60_000;

/// Exponential reconnect-interval calculator shared by every adapter that
/// reconnects.
///
/// Invariant: `default_interval_ms <= current_interval_ms <=
/// max_interval_ms`, monotonically non-decreasing between resets.
#[derive(Debug, Clone)]
pub struct ReconnectState {
	default_interval_ms: u64,
	multiplier: f64,
	max_interval_ms: u64,
	current_interval_ms: u64,
	attempt: u32,
}

impl ReconnectState {
	pub fn new() -> Self {
		Self::with_params(DEFAULT_INTERVAL_MS, DEFAULT_MULTIPLIER, MAX_INTERVAL_MS)
	}

	pub fn with_params(default_interval_ms: u64, multiplier: f64, max_interval_ms: u64) -> Self {
		Self {
			default_interval_ms,
			multiplier,
			max_interval_ms,
			current_interval_ms: default_interval_ms,
			attempt: 0,
		}
	}

	/// Count an attempt and return its delay, then grow the stored
	/// interval by the multiplier, capped at the maximum. The delay
	/// sequence from the defaults is 1000, 1800, 3240, 5832, ... capped
	/// at 60000.
	pub fn increase(&mut self) -> Duration {
		let used = self.current_interval_ms;
		self.attempt += 1;
		let grown = (self.current_interval_ms as f64 * self.multiplier) as u64;
		self.current_interval_ms = grown.min(self.max_interval_ms);
		Duration::from_millis(used)
	}

	/// Restore the default interval and zero the attempt counter. Called
	/// exactly once, immediately after a successful (re)connection.
	pub fn reset(&mut self) {
		self.current_interval_ms = self.default_interval_ms;
		self.attempt = 0;
	}

	pub fn current_interval(&self) -> Duration {
		Duration::from_millis(self.current_interval_ms)
	}

	pub fn current_interval_ms(&self) -> u64 {
		self.current_interval_ms
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}
}

impl Default for ReconnectState {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn delay_sequence_grows_and_caps() {
		let mut state = ReconnectState::new();
		let mut delays = Vec::new();

		for _ in 0..14 {
			delays.push(state.increase().as_millis() as u64);
		}

		assert_eq!(&delays[..5], &[1_000, 1_800, 3_240, 5_832, 10_497]);
		assert_eq!(*delays.last().unwrap(), 60_000);
		assert_eq!(state.attempt(), 14);

		// Monotonically non-decreasing between resets.
		assert!(delays.windows(2).all(|w| w[0] <= w[1]));
	}

	#[test]
	fn reset_returns_the_next_attempt_to_the_default() {
		let mut state = ReconnectState::new();
		state.increase();
		state.increase();
		state.increase();

		state.reset();
		assert_eq!(state.current_interval_ms(), 1_000);
		assert_eq!(state.attempt(), 0);

		assert_eq!(state.increase().as_millis(), 1_000);
		assert_eq!(state.attempt(), 1);
	}

	#[test]
	fn parameters_are_configuration() {
		let mut state = ReconnectState::with_params(500, 2.0, 2_000);
		assert_eq!(state.increase().as_millis(), 500);
		assert_eq!(state.increase().as_millis(), 1_000);
		assert_eq!(state.increase().as_millis(), 2_000);
		assert_eq!(state.increase().as_millis(), 2_000);
	}
}
