//! Crash-loop detection and restart backoff.
//!
//! Pure bookkeeping: the manager feeds crash timestamps in and acts on the
//! returned decision. Once a tracker gives up it stays given up until the
//! user explicitly resets it; a flapping server must not be revived by the
//! clock alone.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Delay schedule between a crash and the restart attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
	/// The same delay after every crash.
	Flat(Duration),
	/// Doubles per consecutive crash, saturating at `cap`.
	Exponential { base: Duration, cap: Duration },
}

impl Backoff {
	/// Delay before restart attempt `attempt` (1-based).
	pub fn delay(&self, attempt: u32) -> Duration {
		match *self {
			Self::Flat(delay) => delay,
			Self::Exponential { base, cap } => {
				let shift = attempt.saturating_sub(1).min(16);
				base.saturating_mul(1 << shift).min(cap)
			}
		}
	}
}

/// When and how often a crashed server is brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
	/// Crash budget inside `window`: the `max_restarts`-th crash gives up.
	pub max_restarts: u32,
	/// Sliding window over which crashes are counted.
	pub window: Duration,
	pub backoff: Backoff,
}

impl Default for RestartPolicy {
	fn default() -> Self {
		Self {
			max_restarts: 5,
			window: Duration::from_secs(180),
			backoff: Backoff::Exponential {
				base: Duration::from_millis(500),
				cap: Duration::from_secs(8),
			},
		}
	}
}

/// Outcome of one recorded crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
	/// Restart after waiting `delay`.
	Restart { delay: Duration },
	/// The crash budget is spent; leave the server down.
	GiveUp,
}

/// Sliding-window crash counter for one server configuration.
#[derive(Debug)]
pub struct CrashTracker {
	policy: RestartPolicy,
	crashes: VecDeque<Instant>,
	gave_up: bool,
}

impl CrashTracker {
	pub fn new(policy: RestartPolicy) -> Self {
		Self {
			policy,
			crashes: VecDeque::new(),
			gave_up: false,
		}
	}

	/// Crashes currently inside the window.
	pub fn recent_crashes(&self) -> u32 {
		self.crashes.len() as u32
	}

	pub fn gave_up(&self) -> bool {
		self.gave_up
	}

	/// Record a crash at `now` and decide what to do about it.
	pub fn record_crash(&mut self, now: Instant) -> RestartDecision {
		if self.gave_up {
			return RestartDecision::GiveUp;
		}
		while let Some(oldest) = self.crashes.front() {
			if now.saturating_duration_since(*oldest) > self.policy.window {
				self.crashes.pop_front();
			} else {
				break;
			}
		}
		self.crashes.push_back(now);

		let attempt = self.crashes.len() as u32;
		if attempt >= self.policy.max_restarts {
			self.gave_up = true;
			RestartDecision::GiveUp
		} else {
			RestartDecision::Restart {
				delay: self.policy.backoff.delay(attempt),
			}
		}
	}

	/// Forget history and allow restarts again (user-requested restart).
	pub fn reset(&mut self) {
		self.crashes.clear();
		self.gave_up = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy() -> RestartPolicy {
		RestartPolicy {
			max_restarts: 5,
			window: Duration::from_secs(180),
			backoff: Backoff::Exponential {
				base: Duration::from_millis(500),
				cap: Duration::from_secs(8),
			},
		}
	}

	#[test]
	fn backoff_doubles_and_saturates() {
		let backoff = Backoff::Exponential {
			base: Duration::from_millis(500),
			cap: Duration::from_secs(8),
		};
		assert_eq!(backoff.delay(1), Duration::from_millis(500));
		assert_eq!(backoff.delay(2), Duration::from_secs(1));
		assert_eq!(backoff.delay(5), Duration::from_secs(8));
		assert_eq!(backoff.delay(30), Duration::from_secs(8));
	}

	#[test]
	fn crash_budget_is_spent_within_the_window() {
		let mut tracker = CrashTracker::new(policy());
		let t0 = Instant::now();
		for i in 0..4 {
			let decision = tracker.record_crash(t0 + Duration::from_secs(i));
			assert!(matches!(decision, RestartDecision::Restart { .. }), "attempt {} should restart", i + 1);
		}
		// The fifth crash inside the window exhausts the budget.
		assert_eq!(tracker.record_crash(t0 + Duration::from_secs(5)), RestartDecision::GiveUp);
		assert!(tracker.gave_up());

		// Giving up is sticky; a quiet hour changes nothing.
		assert_eq!(tracker.record_crash(t0 + Duration::from_secs(3600)), RestartDecision::GiveUp);
	}

	#[test]
	fn stable_stretches_clear_the_window() {
		let mut tracker = CrashTracker::new(policy());
		let t0 = Instant::now();
		for i in 0..4 {
			tracker.record_crash(t0 + Duration::from_secs(i));
		}
		// A crash long after the window restarts the count from one.
		let later = t0 + Duration::from_secs(600);
		assert_eq!(
			tracker.record_crash(later),
			RestartDecision::Restart {
				delay: Duration::from_millis(500)
			}
		);
		assert_eq!(tracker.recent_crashes(), 1);
	}

	#[test]
	fn reset_revives_a_given_up_tracker() {
		let mut tracker = CrashTracker::new(RestartPolicy {
			max_restarts: 2,
			window: Duration::from_secs(60),
			backoff: Backoff::Flat(Duration::from_millis(100)),
		});
		let t0 = Instant::now();
		tracker.record_crash(t0);
		assert_eq!(tracker.record_crash(t0 + Duration::from_secs(1)), RestartDecision::GiveUp);
		tracker.reset();
		assert_eq!(
			tracker.record_crash(t0 + Duration::from_secs(2)),
			RestartDecision::Restart {
				delay: Duration::from_millis(100)
			}
		);
	}
}
