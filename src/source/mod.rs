//! # Streamable Event Source
//!
//! The upstream side of the processor: a source opens a position-seekable
//! stream of tracked events, and the coordinator (the stream's only
//! reader) fans those events out to work packages.
//!
//! Availability notification is a negotiated capability. Push-capable
//! sources accept a callback through [`EventStream::on_available`] and
//! return `true`; the callback must only signal a waiting coordinator,
//! never do work, because sources may invoke it synchronously from the
//! publishing task. Poll-only sources return `false` and the
//! coordinator falls back to time-bounded polling.

mod in_memory;

pub use in_memory::InMemoryEventSource;

use crate::event::TrackedEvent;
use crate::token::TrackingToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Error type for event source operations.
#[derive(Debug, Error)]
pub enum SourceError {
  /// The source does not support the requested operation.
  #[error("event source does not support {0}")]
  Unsupported(&'static str),
  /// `next_available` was called with no event available.
  #[error("no event available at the stream head")]
  NoEventAvailable,
  /// The source or stream could not be reached.
  #[error("event source unavailable: {0}")]
  Unavailable(String),
}

/// Callback signalled when new events may be available.
pub type AvailabilityCallback = Box<dyn Fn() + Send + Sync>;

/// A position-ordered cursor over tracked events. Dropping the stream
/// closes it.
#[async_trait]
pub trait EventStream: Send {
  /// Returns the event at the head of the stream without consuming it.
  fn peek(&mut self) -> Option<&TrackedEvent>;

  /// Waits up to `timeout` for an event to become available. A zero
  /// timeout checks without waiting.
  async fn has_next_available(&mut self, timeout: Duration) -> bool;

  /// Consumes and returns the event at the head of the stream. Callers
  /// check availability first via [`EventStream::peek`] or
  /// [`EventStream::has_next_available`].
  fn next_available(&mut self) -> Result<TrackedEvent, SourceError>;

  /// Hints that future events with this event's payload type need not
  /// be delivered. Sources are free to ignore the hint.
  fn skip_payload_type(&mut self, event: &TrackedEvent);

  /// Registers an availability callback. Returns `true` iff the source
  /// supports push notification; otherwise the caller must poll.
  fn on_available(&mut self, callback: AvailabilityCallback) -> bool;
}

/// Opens position-seekable streams of tracked events.
#[async_trait]
pub trait StreamableEventSource: Send + Sync {
  /// Opens a stream positioned after `from`. `None` starts at the
  /// beginning of the stream.
  async fn open_stream(
    &self,
    from: Option<TrackingToken>,
  ) -> Result<Box<dyn EventStream>, SourceError>;

  /// Token preceding the oldest event in the stream.
  async fn tail_token(&self) -> Result<TrackingToken, SourceError>;

  /// Token at the newest event in the stream.
  async fn head_token(&self) -> Result<TrackingToken, SourceError>;

  /// Token at the given instant.
  async fn token_at(&self, at: DateTime<Utc>) -> Result<TrackingToken, SourceError> {
    let _ = at;
    Err(SourceError::Unsupported("token_at"))
  }

  /// Token at `duration` before now.
  async fn token_since(&self, duration: Duration) -> Result<TrackingToken, SourceError> {
    let age = chrono::Duration::from_std(duration)
      .map_err(|_| SourceError::Unsupported("token_since"))?;
    self.token_at(Utc::now() - age).await
  }
}

/// Where a processor starts reading when a segment has no token yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum InitialTokenPolicy {
  /// Start at the beginning of the stream.
  #[default]
  Tail,
  /// Start at the current end of the stream.
  Head,
  /// Start at the given instant.
  At(DateTime<Utc>),
}

impl InitialTokenPolicy {
  /// Resolves the policy against a source.
  pub async fn resolve(
    &self,
    source: &dyn StreamableEventSource,
  ) -> Result<TrackingToken, SourceError> {
    match self {
      InitialTokenPolicy::Tail => source.tail_token().await,
      InitialTokenPolicy::Head => source.head_token().await,
      InitialTokenPolicy::At(at) => source.token_at(*at).await,
    }
  }
}
