//! # Event Handler Invoker
//!
//! The downstream side of the processor: an invoker filters and applies
//! events on behalf of the registered handlers. Filtering happens at
//! two granularities — [`EventHandlerInvoker::can_handle_type`] is a
//! coarse payload-type filter the coordinator uses to skip whole
//! message types at the stream, and [`EventHandlerInvoker::can_handle`]
//! is the per-segment filter work packages consult per event. An event
//! rejected by `can_handle` still advances the segment's token.
//!
//! [`SimpleHandlerInvoker`] adapts a plain handler function, routing
//! events to segments through a [`SequencingPolicy`].

use crate::event::EventMessage;
use crate::segment::Segment;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error type for handler invocation.
#[derive(Debug, Error)]
pub enum InvokerError {
  /// The handler failed while applying an event.
  #[error("event handler failed: {0}")]
  Handler(String),
  /// The invoker does not support handler resets.
  #[error("handler does not support reset")]
  ResetNotSupported,
}

/// Filters and applies events per segment.
#[async_trait]
pub trait EventHandlerInvoker: Send + Sync {
  /// Coarse filter: whether any handler can process this payload type.
  /// When `false`, the coordinator hints the stream to skip the type
  /// entirely.
  fn can_handle_type(&self, payload_type: &str) -> bool {
    let _ = payload_type;
    true
  }

  /// Fine filter: whether this event should be handled in `segment`.
  fn can_handle(&self, event: &EventMessage, segment: &Segment) -> bool;

  /// Applies the event.
  async fn handle(&self, event: &EventMessage, segment: &Segment) -> Result<(), InvokerError>;

  /// Whether [`EventHandlerInvoker::perform_reset`] is supported.
  fn supports_reset(&self) -> bool {
    false
  }

  /// Prepares the handlers for reprocessing, invoked from the token
  /// reset flow while the processor is stopped.
  async fn perform_reset(&self, context: Option<serde_json::Value>) -> Result<(), InvokerError> {
    let _ = context;
    Err(InvokerError::ResetNotSupported)
  }
}

/// Policy deriving the routing key events are partitioned by.
#[derive(Clone, Default)]
pub enum SequencingPolicy {
  /// Route by the event identifier (uniform spread, no ordering
  /// guarantees between events).
  #[default]
  ByEventId,
  /// Route by the event's sequence key, keeping events that share a key
  /// on one segment, in order.
  BySequenceKey,
  /// Route by a caller-supplied key function.
  Custom(Arc<dyn Fn(&EventMessage) -> String + Send + Sync>),
}

impl SequencingPolicy {
  /// The routing key of `event` under this policy.
  #[must_use]
  pub fn key_for(&self, event: &EventMessage) -> String {
    match self {
      SequencingPolicy::ByEventId => event.identifier.to_string(),
      SequencingPolicy::BySequenceKey => event.sequencing_identifier(),
      SequencingPolicy::Custom(key_fn) => key_fn(event),
    }
  }
}

impl fmt::Debug for SequencingPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SequencingPolicy::ByEventId => write!(f, "SequencingPolicy::ByEventId"),
      SequencingPolicy::BySequenceKey => write!(f, "SequencingPolicy::BySequenceKey"),
      SequencingPolicy::Custom(_) => write!(f, "SequencingPolicy::Custom"),
    }
  }
}

type HandlerFn = dyn Fn(&EventMessage, &Segment) -> Result<(), InvokerError> + Send + Sync;
type ResetFn = dyn Fn(Option<&serde_json::Value>) + Send + Sync;
type TypeFilterFn = dyn Fn(&str) -> bool + Send + Sync;

/// Invoker wrapping one handler function.
///
/// `can_handle` routes each event to exactly one segment via the
/// sequencing policy, optionally narrowed by a payload-type filter.
#[derive(Clone)]
pub struct SimpleHandlerInvoker {
  handler: Arc<HandlerFn>,
  sequencing: SequencingPolicy,
  type_filter: Option<Arc<TypeFilterFn>>,
  reset_handler: Option<Arc<ResetFn>>,
}

impl SimpleHandlerInvoker {
  /// Creates an invoker around `handler`.
  pub fn new<F>(handler: F) -> Self
  where
    F: Fn(&EventMessage, &Segment) -> Result<(), InvokerError> + Send + Sync + 'static,
  {
    Self {
      handler: Arc::new(handler),
      sequencing: SequencingPolicy::default(),
      type_filter: None,
      reset_handler: None,
    }
  }

  /// Sets the sequencing policy used for segment routing.
  #[must_use]
  pub fn with_sequencing_policy(mut self, policy: SequencingPolicy) -> Self {
    self.sequencing = policy;
    self
  }

  /// Restricts the invoker to payload types accepted by `filter`.
  #[must_use]
  pub fn with_type_filter<F>(mut self, filter: F) -> Self
  where
    F: Fn(&str) -> bool + Send + Sync + 'static,
  {
    self.type_filter = Some(Arc::new(filter));
    self
  }

  /// Enables reset support, invoking `reset` from the token reset flow.
  #[must_use]
  pub fn with_reset_handler<F>(mut self, reset: F) -> Self
  where
    F: Fn(Option<&serde_json::Value>) + Send + Sync + 'static,
  {
    self.reset_handler = Some(Arc::new(reset));
    self
  }
}

impl fmt::Debug for SimpleHandlerInvoker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SimpleHandlerInvoker")
      .field("sequencing", &self.sequencing)
      .field("type_filter", &self.type_filter.is_some())
      .field("supports_reset", &self.reset_handler.is_some())
      .finish()
  }
}

#[async_trait]
impl EventHandlerInvoker for SimpleHandlerInvoker {
  fn can_handle_type(&self, payload_type: &str) -> bool {
    self.type_filter.as_ref().is_none_or(|filter| filter(payload_type))
  }

  fn can_handle(&self, event: &EventMessage, segment: &Segment) -> bool {
    self.can_handle_type(&event.payload_type) && segment.matches_key(&self.sequencing.key_for(event))
  }

  async fn handle(&self, event: &EventMessage, segment: &Segment) -> Result<(), InvokerError> {
    (self.handler)(event, segment)
  }

  fn supports_reset(&self) -> bool {
    self.reset_handler.is_some()
  }

  async fn perform_reset(&self, context: Option<serde_json::Value>) -> Result<(), InvokerError> {
    match &self.reset_handler {
      Some(reset) => {
        reset(context.as_ref());
        Ok(())
      }
      None => Err(InvokerError::ResetNotSupported),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn routes_each_event_to_exactly_one_segment() {
    let invoker = SimpleHandlerInvoker::new(|_, _| Ok(()))
      .with_sequencing_policy(SequencingPolicy::BySequenceKey);
    let segments: Vec<Segment> = Segment::compute_balanced(4);

    for n in 0..32 {
      let event = EventMessage::new("Number", json!(n)).with_sequence_key(format!("key-{}", n));
      let owners = segments.iter().filter(|s| invoker.can_handle(&event, s)).count();
      assert_eq!(owners, 1);
    }
  }

  #[tokio::test]
  async fn type_filter_rejects_at_both_granularities() {
    let invoker =
      SimpleHandlerInvoker::new(|_, _| Ok(())).with_type_filter(|t| t == "OrderPlaced");

    assert!(invoker.can_handle_type("OrderPlaced"));
    assert!(!invoker.can_handle_type("PaymentFailed"));

    let event = EventMessage::new("PaymentFailed", json!(null));
    assert!(!invoker.can_handle(&event, &Segment::ROOT));
  }

  #[tokio::test]
  async fn reset_requires_a_reset_handler() {
    let plain = SimpleHandlerInvoker::new(|_, _| Ok(()));
    assert!(!plain.supports_reset());
    assert!(matches!(
      plain.perform_reset(None).await,
      Err(InvokerError::ResetNotSupported)
    ));

    let resets = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resets);
    let resettable = SimpleHandlerInvoker::new(|_, _| Ok(())).with_reset_handler(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert!(resettable.supports_reset());
    resettable.perform_reset(Some(json!({"reason": "test"}))).await.unwrap();
    assert_eq!(resets.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn handler_errors_propagate() {
    let invoker = SimpleHandlerInvoker::new(|event, _| {
      Err(InvokerError::Handler(format!("boom on {}", event.payload_type)))
    });
    let event = EventMessage::new("Faulty", json!(null));
    let err = invoker.handle(&event, &Segment::ROOT).await.unwrap_err();
    assert!(err.to_string().contains("boom on Faulty"));
  }
}
