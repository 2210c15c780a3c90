//! Timeout policy for retried remote calls.
//!
//! A single step of a retry loop reports its outcome as an [`Attempt`] and the loop decides what
//! to do with it, timeouts are expected outcomes, not errors.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::{timeout, Instant};

use super::{config::RemoteConfig, Error};

/// Outcome of a single step of a retry loop
#[derive(Debug)]
pub enum Attempt<T> {
	Ok(T),
	Timeout,
	Failed(Error),
}

impl<T> Attempt<T> {
	/// Runs `fut` with `limit`, a [`Error::Timeout`] coming from `fut` itself also counts as
	/// a timed out attempt
	pub async fn run<F>(limit: Duration, fut: F) -> Self
	where
		F: Future<Output = Result<T, Error>>,
	{
		match timeout(limit, fut).await {
			Ok(Ok(out)) => Self::Ok(out),
			Ok(Err(e)) if e.is_timeout() => Self::Timeout,
			Ok(Err(e)) => Self::Failed(e),
			Err(_) => Self::Timeout,
		}
	}
}

/// Exponentially growing attempt timeout, with random jitter, capped at a maximum
#[derive(Debug, Clone)]
pub struct RetryTimeout {
	initial: Duration,
	current: Duration,
	ratio: f64,
	jitter: f64,
	max: Duration,
	attempts: u32,
}

impl RetryTimeout {
	#[must_use]
	pub fn new(config: &RemoteConfig) -> Self {
		Self::with_policy(
			config.rpc_initial_timeout(),
			config.rpc_timeout_ratio,
			config.rpc_timeout_jitter,
			config.rpc_max_timeout(),
		)
	}

	#[must_use]
	pub fn with_policy(initial: Duration, ratio: f64, jitter: f64, max: Duration) -> Self {
		Self {
			initial,
			current: initial.min(max),
			ratio: ratio.max(1.0),
			jitter: jitter.clamp(0.0, 1.0),
			max,
			attempts: 0,
		}
	}

	/// Timeout for the next attempt, the following ones grow by the configured ratio
	pub fn next_timeout(&mut self) -> Duration {
		let base = self.current;
		self.attempts += 1;
		self.current = scale(base, self.ratio).min(self.max);

		if self.jitter > 0.0 {
			let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
			scale(base, factor).min(self.max)
		} else {
			base
		}
	}

	#[must_use]
	pub const fn attempts(&self) -> u32 {
		self.attempts
	}

	pub fn reset(&mut self) {
		self.current = self.initial.min(self.max);
		self.attempts = 0;
	}
}

#[allow(
	clippy::cast_possible_truncation,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss
)]
fn scale(duration: Duration, factor: f64) -> Duration {
	// Timeouts are far below the range where nanoseconds lose precision as f64
	Duration::from_nanos((duration.as_nanos() as f64 * factor).round() as u64)
}

/// Splits a caller supplied overall budget across the attempts of a retry loop
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSplitter {
	deadline: Option<Instant>,
}

impl TimeoutSplitter {
	/// `None` means there is no overall budget
	#[must_use]
	pub fn new(total: Option<Duration>) -> Self {
		Self {
			deadline: total.map(|total| Instant::now() + total),
		}
	}

	#[must_use]
	pub fn remaining(&self) -> Option<Duration> {
		self.deadline
			.map(|deadline| deadline.saturating_duration_since(Instant::now()))
	}

	#[must_use]
	pub fn is_exhausted(&self) -> bool {
		self.remaining().is_some_and(|remaining| remaining.is_zero())
	}

	/// How long the next attempt may take, `None` once the budget is exhausted
	#[must_use]
	pub fn split(&self, attempt: Duration) -> Option<Duration> {
		match self.remaining() {
			None => Some(attempt),
			Some(remaining) if remaining.is_zero() => None,
			Some(remaining) => Some(attempt.min(remaining)),
		}
	}
}
