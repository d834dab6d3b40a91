//! Batch transaction boundaries.
//!
//! Each work package batch runs inside one transaction obtained from
//! the configured [`TransactionManager`]: events are handled and the
//! advanced token is stored before the transaction commits, so progress
//! and side effects move together. Deployments without transactional
//! infrastructure use [`NoTransactionManager`].

use async_trait::async_trait;
use thiserror::Error;

/// Error type for transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
  /// No transaction could be started.
  #[error("transaction could not be started: {0}")]
  NotStarted(String),
  /// Commit failed; the batch must be considered not processed.
  #[error("transaction commit failed: {0}")]
  CommitFailed(String),
  /// Rollback failed.
  #[error("transaction rollback failed: {0}")]
  RollbackFailed(String),
}

/// A transaction wrapping one batch of event handling.
#[async_trait]
pub trait Transaction: Send {
  /// Commits the transaction.
  async fn commit(self: Box<Self>) -> Result<(), TransactionError>;

  /// Rolls the transaction back.
  async fn rollback(self: Box<Self>) -> Result<(), TransactionError>;
}

/// Starts transactions around work package batches.
#[async_trait]
pub trait TransactionManager: Send + Sync {
  /// Opens a new transaction.
  async fn start_transaction(&self) -> Result<Box<dyn Transaction>, TransactionError>;
}

/// Transaction manager whose transactions do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransactionManager;

impl NoTransactionManager {
  /// Creates a new no-op transaction manager.
  #[must_use]
  pub fn new() -> Self {
    Self
  }
}

struct NoTransaction;

#[async_trait]
impl Transaction for NoTransaction {
  async fn commit(self: Box<Self>) -> Result<(), TransactionError> {
    Ok(())
  }

  async fn rollback(self: Box<Self>) -> Result<(), TransactionError> {
    Ok(())
  }
}

#[async_trait]
impl TransactionManager for NoTransactionManager {
  async fn start_transaction(&self) -> Result<Box<dyn Transaction>, TransactionError> {
    Ok(Box::new(NoTransaction))
  }
}
