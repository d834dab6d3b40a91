//! In-memory event source.

use super::{AvailabilityCallback, EventStream, SourceError, StreamableEventSource};
use crate::event::{EventMessage, TrackedEvent};
use crate::token::TrackingToken;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct SourceInner {
  events: Vec<TrackedEvent>,
  ignored: Vec<TrackedEvent>,
  callbacks: Vec<Arc<AvailabilityCallback>>,
}

/// Grow-only in-memory event log.
///
/// Events are assigned contiguous global sequence positions starting at
/// `1`. The source is cheap to clone; clones share the same log. It
/// records every [`EventStream::skip_payload_type`] hint it receives,
/// which tests assert against, and can optionally advertise push
/// support so availability callbacks can be exercised.
#[derive(Clone)]
pub struct InMemoryEventSource {
  inner: Arc<RwLock<SourceInner>>,
  notify: Arc<Notify>,
  push_support: bool,
}

impl InMemoryEventSource {
  /// Creates a poll-only in-memory source.
  #[must_use]
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RwLock::new(SourceInner::default())),
      notify: Arc::new(Notify::new()),
      push_support: false,
    }
  }

  /// Creates a source that advertises push support: streams accept
  /// availability callbacks, fired via
  /// [`InMemoryEventSource::fire_available`].
  #[must_use]
  pub fn with_push_support() -> Self {
    Self { push_support: true, ..Self::new() }
  }

  /// Appends an event to the log and returns the position it was
  /// assigned.
  pub fn publish(&self, message: EventMessage) -> TrackingToken {
    let token = {
      let mut inner = self.inner.write().expect("source lock poisoned");
      let token = TrackingToken::sequence(inner.events.len() as i64 + 1);
      inner.events.push(TrackedEvent::new(token, message));
      token
    };
    self.notify.notify_waiters();
    token
  }

  /// Invokes every registered availability callback.
  pub fn fire_available(&self) {
    let callbacks: Vec<_> = {
      let inner = self.inner.read().expect("source lock poisoned");
      inner.callbacks.iter().map(Arc::clone).collect()
    };
    for callback in callbacks {
      callback();
    }
  }

  /// Events that streams were hinted to skip.
  #[must_use]
  pub fn ignored_events(&self) -> Vec<TrackedEvent> {
    self.inner.read().expect("source lock poisoned").ignored.clone()
  }

  /// Number of published events.
  #[must_use]
  pub fn len(&self) -> usize {
    self.inner.read().expect("source lock poisoned").events.len()
  }

  /// True when no events have been published.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Default for InMemoryEventSource {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl StreamableEventSource for InMemoryEventSource {
  async fn open_stream(
    &self,
    from: Option<TrackingToken>,
  ) -> Result<Box<dyn EventStream>, SourceError> {
    let index = from
      .and_then(|token| token.position())
      .map(|position| position.max(0) as usize)
      .unwrap_or(0);
    Ok(Box::new(InMemoryEventStream {
      inner: Arc::clone(&self.inner),
      notify: Arc::clone(&self.notify),
      index,
      peeked: None,
      push_support: self.push_support,
    }))
  }

  async fn tail_token(&self) -> Result<TrackingToken, SourceError> {
    Ok(TrackingToken::BEGINNING)
  }

  async fn head_token(&self) -> Result<TrackingToken, SourceError> {
    Ok(TrackingToken::sequence(self.len() as i64))
  }

  async fn token_at(&self, at: chrono::DateTime<chrono::Utc>) -> Result<TrackingToken, SourceError> {
    let inner = self.inner.read().expect("source lock poisoned");
    let position = inner
      .events
      .iter()
      .find(|event| event.message.timestamp >= at)
      .and_then(TrackedEvent::position)
      .map(|position| position - 1)
      .unwrap_or(inner.events.len() as i64);
    Ok(TrackingToken::sequence(position))
  }
}

struct InMemoryEventStream {
  inner: Arc<RwLock<SourceInner>>,
  notify: Arc<Notify>,
  index: usize,
  peeked: Option<TrackedEvent>,
  push_support: bool,
}

impl InMemoryEventStream {
  fn fill_peek(&mut self) {
    if self.peeked.is_none() {
      let inner = self.inner.read().expect("source lock poisoned");
      self.peeked = inner.events.get(self.index).cloned();
    }
  }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
  fn peek(&mut self) -> Option<&TrackedEvent> {
    self.fill_peek();
    self.peeked.as_ref()
  }

  async fn has_next_available(&mut self, timeout: Duration) -> bool {
    self.fill_peek();
    if self.peeked.is_some() {
      return true;
    }
    if timeout.is_zero() {
      return false;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    let notify = Arc::clone(&self.notify);
    loop {
      // Register for the publish notification before re-checking, so a
      // publish between the check and the wait is not missed.
      let notified = notify.notified();
      self.fill_peek();
      if self.peeked.is_some() {
        return true;
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        self.fill_peek();
        return self.peeked.is_some();
      }
    }
  }

  fn next_available(&mut self) -> Result<TrackedEvent, SourceError> {
    self.fill_peek();
    match self.peeked.take() {
      Some(event) => {
        self.index += 1;
        Ok(event)
      }
      None => Err(SourceError::NoEventAvailable),
    }
  }

  fn skip_payload_type(&mut self, event: &TrackedEvent) {
    let mut inner = self.inner.write().expect("source lock poisoned");
    inner.ignored.push(event.clone());
  }

  fn on_available(&mut self, callback: AvailabilityCallback) -> bool {
    if !self.push_support {
      return false;
    }
    let mut inner = self.inner.write().expect("source lock poisoned");
    inner.callbacks.push(Arc::new(callback));
    true
  }
}
