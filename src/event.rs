//! Event envelopes.
//!
//! [`EventMessage`] wraps a payload with an identifier, a payload type
//! name, an optional sequencing key and metadata, so the processor can
//! route, filter and trace events without knowing their concrete shape.
//! [`TrackedEvent`] pairs a message with the stream position it was
//! read at.

use crate::token::TrackingToken;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// An event wrapped with identity, type and routing information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
  /// Globally unique event identifier.
  pub identifier: Uuid,
  /// Name of the payload type, used for coarse handler filtering.
  pub payload_type: String,
  /// The event payload.
  pub payload: serde_json::Value,
  /// Key used to route the event to a segment. Events sharing a key are
  /// handled in order by the same segment.
  pub sequence_key: Option<String>,
  /// Publication timestamp.
  pub timestamp: DateTime<Utc>,
  /// Free-form metadata (source, correlation ids, headers).
  pub metadata: HashMap<String, String>,
}

impl EventMessage {
  /// Creates a new event message with a fresh identifier.
  #[must_use]
  pub fn new(payload_type: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      identifier: Uuid::new_v4(),
      payload_type: payload_type.into(),
      payload,
      sequence_key: None,
      timestamp: Utc::now(),
      metadata: HashMap::new(),
    }
  }

  /// Sets the sequencing key used for segment routing.
  #[must_use]
  pub fn with_sequence_key(mut self, key: impl Into<String>) -> Self {
    self.sequence_key = Some(key.into());
    self
  }

  /// Adds one metadata entry.
  #[must_use]
  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }

  /// The identifier events are sequenced by: the explicit sequence key
  /// when present, the event identifier otherwise.
  #[must_use]
  pub fn sequencing_identifier(&self) -> String {
    self
      .sequence_key
      .clone()
      .unwrap_or_else(|| self.identifier.to_string())
  }
}

/// An event message together with the stream position it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEvent {
  /// Position of this event in the upstream stream.
  pub token: TrackingToken,
  /// The event itself.
  pub message: EventMessage,
}

impl TrackedEvent {
  /// Creates a tracked event at the given position.
  #[must_use]
  pub fn new(token: TrackingToken, message: EventMessage) -> Self {
    Self { token, message }
  }

  /// Shorthand for the stream position of this event.
  #[must_use]
  pub fn position(&self) -> Option<i64> {
    self.token.position()
  }
}
