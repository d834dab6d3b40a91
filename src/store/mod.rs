//! # Token Store
//!
//! Durable, per-segment claim and progress storage shared by every
//! processor instance working on the same stream. The store arbitrates
//! segment ownership across processes: fetching a token atomically
//! claims its segment, claims expire unless extended, and every write
//! is compare-and-set guarded on ownership.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryTokenStore`]: process-local storage, useful for tests
//!   and volatile deployments.
//! - [`FileTokenStore`]: JSON-file persistence for single-node
//!   deployments that must survive restarts.
//!
//! SQL-backed stores implement the same [`TokenStore`] trait outside
//! this crate.

mod file;
mod in_memory;

pub use file::FileTokenStore;
pub use in_memory::InMemoryTokenStore;

use crate::token::TrackingToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default lease duration after which an unextended claim expires.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for token store operations.
#[derive(Debug, Error)]
pub enum TokenStoreError {
  /// Another process holds a valid claim on the segment, or the caller
  /// no longer owns the claim it is trying to use.
  #[error("unable to claim segment {segment} of processor '{processor}'")]
  UnableToClaim {
    /// Processor name the claim belongs to.
    processor: String,
    /// Segment the claim is for.
    segment: u32,
  },

  /// Segments already exist for the processor; initialization is
  /// whole-store idempotent and refuses partial re-initialization.
  #[error("token segments already initialized for processor '{0}'")]
  UnableToInitialize(String),

  /// The segment has no row in the store.
  #[error("unknown segment {segment} of processor '{processor}'")]
  UnknownSegment {
    /// Processor name.
    processor: String,
    /// Missing segment id.
    segment: u32,
  },

  /// The backing storage could not be reached.
  #[error("token store unavailable: {0}")]
  Unavailable(String),
}

/// One persisted row: the segment's token plus its current lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaim {
  /// Progress token, `None` until the segment first stores progress.
  pub token: Option<TrackingToken>,
  /// Owner holding the lease, `None` when unclaimed.
  pub owner: Option<String>,
  /// Last time the lease was acquired, extended or written through.
  pub last_updated: DateTime<Utc>,
}

impl TokenClaim {
  /// Creates an unclaimed row holding `token`.
  #[must_use]
  pub fn unclaimed(token: Option<TrackingToken>) -> Self {
    Self { token, owner: None, last_updated: Utc::now() }
  }

  /// True iff some owner other than `owner` holds a still-valid lease.
  #[must_use]
  pub fn is_claimed_by_other(&self, owner: &str, timeout: Duration) -> bool {
    match self.owner.as_deref() {
      Some(current) if current != owner => {
        let age = Utc::now().signed_duration_since(self.last_updated);
        age.to_std().is_ok_and(|age| age < timeout)
      }
      _ => false,
    }
  }

  /// True iff `owner` holds a still-valid lease on this row.
  #[must_use]
  pub fn is_owned_by(&self, owner: &str, timeout: Duration) -> bool {
    match self.owner.as_deref() {
      Some(current) if current == owner => {
        let age = Utc::now().signed_duration_since(self.last_updated);
        age.to_std().is_ok_and(|age| age < timeout)
      }
      _ => false,
    }
  }
}

/// Durable, CAS-guarded claim and token storage, shared across
/// processes. All operations are atomic with respect to concurrent
/// callers.
#[async_trait]
pub trait TokenStore: Send + Sync {
  /// Creates `count` segment rows seeded with `initial_token`. Fails
  /// with [`TokenStoreError::UnableToInitialize`] when any segment
  /// already exists for `processor`.
  async fn initialize_token_segments(
    &self,
    processor: &str,
    count: usize,
    initial_token: Option<TrackingToken>,
  ) -> Result<(), TokenStoreError>;

  /// Returns the sorted segment ids known for `processor`.
  async fn fetch_segments(&self, processor: &str) -> Result<Vec<u32>, TokenStoreError>;

  /// Returns the segment's token, atomically claiming the segment for
  /// the caller. Fails with [`TokenStoreError::UnableToClaim`] while
  /// another process holds a valid claim.
  async fn fetch_token(
    &self,
    processor: &str,
    segment: u32,
  ) -> Result<Option<TrackingToken>, TokenStoreError>;

  /// Refreshes the caller's lease on the segment.
  async fn extend_claim(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError>;

  /// Stores the segment's token. Fails unless the caller owns the
  /// claim; a successful store also refreshes the lease.
  async fn store_token(
    &self,
    token: TrackingToken,
    processor: &str,
    segment: u32,
  ) -> Result<(), TokenStoreError>;

  /// Releases the caller's claim. Best effort: releasing a claim the
  /// caller does not hold is not an error.
  async fn release_claim(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError>;

  /// Creates one new, unclaimed segment row seeded with `token`. Used
  /// by segment splits.
  async fn initialize_segment(
    &self,
    token: Option<TrackingToken>,
    processor: &str,
    segment: u32,
  ) -> Result<(), TokenStoreError>;

  /// Deletes one segment row. Fails unless the caller owns the claim.
  /// Used by segment merges.
  async fn delete_token(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError>;

  /// Whether this store persists explicit segment rows, which split and
  /// merge require.
  fn requires_explicit_segment_initialization(&self) -> bool {
    true
  }

  /// A stable identifier for the backing storage, used to key
  /// in-process caches. `None` when the store cannot provide one.
  async fn storage_identifier(&self) -> Result<Option<String>, TokenStoreError>;
}
