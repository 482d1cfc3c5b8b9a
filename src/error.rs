//! Error taxonomy for fetching and the service facade.
//!
//! Transient network failures are retryable; client errors and exhausted
//! retry budgets are terminal for the current call. Missing operator
//! configuration is deliberately NOT an error anywhere in this crate: those
//! paths degrade to an empty result with a logged warning so the caller can
//! render an actionable "not configured" state.

use thiserror::Error;

/// Failure modes of a page fetch against an external source.
#[derive(Debug, Error)]
pub enum FetchError {
  /// Network/5xx-class failure. Retried with bounded exponential backoff.
  #[error("transient fetch error: {0}")]
  Transient(String),

  /// 4xx-class failure. Terminal for the current call, never retried.
  #[error("client error: {0}")]
  Client(String),

  /// The retry budget for a single page was exhausted.
  #[error("retries exhausted after {attempts} attempts: {last_error}")]
  RetriesExhausted { attempts: u32, last_error: String },
}

impl FetchError {
  /// Whether another attempt at the same page may succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, FetchError::Transient(_))
  }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;
