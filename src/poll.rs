//! Bounded polling for remote state transitions.
//!
//! Every "wait until the server says so" step (challenge, authorization,
//! order, proof visibility) goes through [`poll`] with an explicit
//! [`PollPolicy`], so the attempt budget and interval are always supplied by
//! the caller.

use crate::error::Error;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often, and how many times, a remote state is polled.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PollPolicy {
  /// Total number of invocations of the poll action.
  pub max_attempts: u32,
  /// Delay between two invocations.
  #[serde(rename = "intervalMs", with = "duration_ms")]
  pub interval: Duration,
}

impl PollPolicy {
  pub const fn new(max_attempts: u32, interval: Duration) -> Self {
    PollPolicy {
      max_attempts,
      interval,
    }
  }
}

mod duration_ms {
  use serde::Deserialize;
  use serde::Deserializer;
  use serde::Serializer;
  use std::time::Duration;

  pub fn serialize<S: Serializer>(
    d: &Duration,
    s: S,
  ) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    d: D,
  ) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(d)?))
  }
}

/// The outcome of a single poll attempt.
#[derive(Debug)]
pub enum PollResult<T, S> {
  /// The awaited state was reached.
  Done(T),
  /// Not there yet. Carries the state observed by this attempt, or `None`
  /// if the attempt failed before anything could be observed (for example
  /// a transient network error).
  Retry(Option<S>),
  /// Stop polling and fail with this error.
  Fatal(Error),
}

#[derive(Debug)]
pub enum PollError<S> {
  /// All attempts were used up. `last` is the last observed state.
  Exhausted { attempts: u32, last: Option<S> },
  Cancelled,
  Fatal(Error),
}

impl<S: Debug> From<PollError<S>> for Error {
  fn from(err: PollError<S>) -> Self {
    match err {
      PollError::Exhausted { attempts, last } => Error::PollBudgetExhausted {
        attempts,
        last: last.map(|s| format!("{:?}", s)),
      },
      PollError::Cancelled => Error::Cancelled,
      PollError::Fatal(err) => err,
    }
  }
}

/// A cancellation signal, optionally combined with a deadline. Clones share
/// the same underlying token.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl Cancellation {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_deadline(mut self, deadline: Instant) -> Self {
    self.deadline = Some(deadline);
    self
  }

  pub fn with_timeout(self, timeout: Duration) -> Self {
    self.with_deadline(Instant::now() + timeout)
  }

  /// A cancellation that fires when this one does, but can also be
  /// cancelled on its own without affecting the parent.
  pub fn child(&self) -> Self {
    Cancellation {
      token: self.token.child_token(),
      deadline: self.deadline,
    }
  }

  pub fn cancel(&self) {
    self.token.cancel();
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
      || self.deadline.map_or(false, |d| Instant::now() >= d)
  }

  /// Resolves once the token is cancelled or the deadline has passed.
  pub async fn cancelled(&self) {
    match self.deadline {
      Some(deadline) => {
        tokio::select! {
          _ = self.token.cancelled() => {}
          _ = tokio::time::sleep_until(deadline) => {}
        }
      }
      None => self.token.cancelled().await,
    }
  }
}

/// Invoke `action` until it returns [`PollResult::Done`] or
/// [`PollResult::Fatal`], at most `policy.max_attempts` times, sleeping
/// `policy.interval` between attempts (never before the first one).
///
/// `action` receives the 1-based attempt number. Cancellation is observed
/// before each attempt and while sleeping.
pub async fn poll<T, S, F, Fut>(
  policy: &PollPolicy,
  cancellation: &Cancellation,
  mut action: F,
) -> Result<T, PollError<S>>
where
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = PollResult<T, S>>,
  S: Debug,
{
  let mut last = None;

  for attempt in 1..=policy.max_attempts {
    if attempt > 1 {
      debug!(
        { attempt, delay = ?policy.interval, last = ?last },
        "Not done yet. Waiting to poll."
      );
      tokio::select! {
        biased;
        _ = cancellation.cancelled() => return Err(PollError::Cancelled),
        _ = tokio::time::sleep(policy.interval) => {}
      }
    }

    if cancellation.is_cancelled() {
      return Err(PollError::Cancelled);
    }

    match action(attempt).await {
      PollResult::Done(value) => return Ok(value),
      PollResult::Retry(state) => {
        if state.is_some() {
          last = state;
        }
      }
      PollResult::Fatal(err) => return Err(PollError::Fatal(err)),
    }
  }

  Err(PollError::Exhausted {
    attempts: policy.max_attempts,
    last,
  })
}
