//! Processor-level error taxonomy.
//!
//! Leaf components (token store, event source, handler invoker,
//! transaction manager) define their own error enums; this module folds
//! them into the single [`ProcessorError`] surfaced by the processor
//! facade and used as the abort reason of work packages.

use crate::handler::InvokerError;
use crate::source::SourceError;
use crate::store::TokenStoreError;
use crate::transaction::TransactionError;
use thiserror::Error;

/// Errors produced by the pooled streaming processor.
#[derive(Debug, Error)]
pub enum ProcessorError {
  /// The processor was built with an invalid configuration.
  #[error("invalid processor configuration: {0}")]
  Configuration(String),

  /// The claim on a segment could not be acquired or kept.
  #[error("claim on segment {0} was lost")]
  ClaimLost(u32),

  /// A token store operation failed.
  #[error("token store error: {0}")]
  Store(#[from] TokenStoreError),

  /// An event source or stream operation failed.
  #[error("event stream error: {0}")]
  Stream(#[from] SourceError),

  /// The event handler failed while processing an event.
  #[error("event handler error: {0}")]
  Handler(#[from] InvokerError),

  /// A batch transaction could not be started or completed.
  #[error("transaction error: {0}")]
  Transaction(#[from] TransactionError),

  /// The requested operation is not supported by a collaborator.
  #[error("operation not supported: {0}")]
  Unsupported(&'static str),

  /// The operation is not allowed in the processor's current state.
  #[error("illegal processor state: {0}")]
  IllegalState(&'static str),

  /// The segment was released through the administrative API.
  #[error("segment {0} was released")]
  SegmentReleased(u32),

  /// The processor is shutting down.
  #[error("processor is shutting down")]
  ShuttingDown,
}

impl ProcessorError {
  /// True for faults the coordinator treats as transient, pausing with
  /// backoff instead of giving up.
  #[must_use]
  pub fn is_transient(&self) -> bool {
    matches!(self, ProcessorError::Store(_) | ProcessorError::Stream(_))
  }
}
