//! Injectable monotonic clock and jittered election timeouts.
//!
//! `Clock::now` returns a `tokio::time::Instant` rather than `std::time::Instant`
//! so that the election timer's `tokio::time::sleep_until` and a test's notion of
//! "now" are the same clock: `tokio::time` is the only clock in this process that
//! can be paused and fast-forwarded without a real wall-clock wait, via
//! `tokio::test(start_paused = true)` plus `tokio::time::advance`.

use rand::RngCore;
use std::time::Duration;
use tokio::time::Instant;

/// A source of monotonic time. Production code uses `SystemClock`; tests use
/// `MockClock` so election timeouts can be driven deterministically.
pub trait Clock: Send + Sync + 'static {
	fn now(&self) -> Instant;
}

/// Real wall-clock time via `tokio::time::Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// A clock that defers entirely to `tokio::time`'s own virtual clock.
///
/// Requires the caller's test to run under `#[tokio::test(start_paused = true)]`;
/// `advance` is a thin wrapper over `tokio::time::advance` so every timer
/// registered through `tokio::time::sleep_until` (the election timer, the
/// heartbeat ticker) observes the same jump `now()` does.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockClock;

impl MockClock {
	pub fn new() -> Self {
		MockClock
	}

	/// Fast-forwards the paused tokio clock by `dur`, firing any timers that
	/// fall due along the way.
	pub async fn advance(&self, dur: Duration) {
		tokio::time::advance(dur).await;
	}
}

impl Clock for MockClock {
	fn now(&self) -> Instant {
		Instant::now()
	}
}

/// Draws a uniform random duration in `[base_ms, 2*base_ms)` milliseconds.
pub fn jittered_election_timeout(base_ms: u64) -> Duration {
	let mut rng = rand::thread_rng();
	let span = base_ms.max(1);
	let jitter = (rng.next_u32() as u64 * span) / (u32::MAX as u64);
	Duration::from_millis(base_ms + jitter)
}
