//! In-memory token store.

use super::{TokenClaim, TokenStore, TokenStoreError, DEFAULT_CLAIM_TIMEOUT};
use crate::token::TrackingToken;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

type Rows = HashMap<String, BTreeMap<u32, TokenClaim>>;

/// Process-local token store backed by a shared map.
///
/// Claims are held under a per-handle owner id, so handles created with
/// [`InMemoryTokenStore::fork_owner`] compete for segments exactly like
/// separate processes sharing a database would.
#[derive(Debug, Clone)]
pub struct InMemoryTokenStore {
  rows: Arc<RwLock<Rows>>,
  identifier: Arc<str>,
  owner: Arc<str>,
  claim_timeout: Duration,
}

impl InMemoryTokenStore {
  /// Creates an empty store with the default claim timeout.
  #[must_use]
  pub fn new() -> Self {
    Self::with_claim_timeout(DEFAULT_CLAIM_TIMEOUT)
  }

  /// Creates an empty store whose claims expire after `claim_timeout`.
  #[must_use]
  pub fn with_claim_timeout(claim_timeout: Duration) -> Self {
    Self {
      rows: Arc::new(RwLock::new(HashMap::new())),
      identifier: Uuid::new_v4().to_string().into(),
      owner: Uuid::new_v4().to_string().into(),
      claim_timeout,
    }
  }

  /// Returns a handle on the same storage claiming under a new owner
  /// id, simulating a second process sharing the store.
  #[must_use]
  pub fn fork_owner(&self) -> Self {
    Self {
      rows: Arc::clone(&self.rows),
      identifier: Arc::clone(&self.identifier),
      owner: Uuid::new_v4().to_string().into(),
      claim_timeout: self.claim_timeout,
    }
  }

  /// The owner id this handle claims segments under.
  #[must_use]
  pub fn owner_id(&self) -> &str {
    &self.owner
  }

  fn lock_error(message: &str) -> TokenStoreError {
    TokenStoreError::Unavailable(message.to_string())
  }
}

impl Default for InMemoryTokenStore {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
  async fn initialize_token_segments(
    &self,
    processor: &str,
    count: usize,
    initial_token: Option<TrackingToken>,
  ) -> Result<(), TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    let entry = rows.entry(processor.to_string()).or_default();
    if !entry.is_empty() {
      return Err(TokenStoreError::UnableToInitialize(processor.to_string()));
    }
    for segment in crate::segment::Segment::compute_balanced(count) {
      entry.insert(segment.id(), TokenClaim::unclaimed(initial_token));
    }
    Ok(())
  }

  async fn fetch_segments(&self, processor: &str) -> Result<Vec<u32>, TokenStoreError> {
    let rows = self.rows.read().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    Ok(
      rows
        .get(processor)
        .map(|segments| segments.keys().copied().collect())
        .unwrap_or_default(),
    )
  }

  async fn fetch_token(
    &self,
    processor: &str,
    segment: u32,
  ) -> Result<Option<TrackingToken>, TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    let claim = rows
      .get_mut(processor)
      .and_then(|segments| segments.get_mut(&segment))
      .ok_or_else(|| TokenStoreError::UnknownSegment {
        processor: processor.to_string(),
        segment,
      })?;
    if claim.is_claimed_by_other(&self.owner, self.claim_timeout) {
      return Err(TokenStoreError::UnableToClaim {
        processor: processor.to_string(),
        segment,
      });
    }
    claim.owner = Some(self.owner.to_string());
    claim.last_updated = Utc::now();
    Ok(claim.token)
  }

  async fn extend_claim(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    let claim = rows
      .get_mut(processor)
      .and_then(|segments| segments.get_mut(&segment))
      .ok_or_else(|| TokenStoreError::UnknownSegment {
        processor: processor.to_string(),
        segment,
      })?;
    if !claim.is_owned_by(&self.owner, self.claim_timeout) {
      return Err(TokenStoreError::UnableToClaim {
        processor: processor.to_string(),
        segment,
      });
    }
    claim.last_updated = Utc::now();
    Ok(())
  }

  async fn store_token(
    &self,
    token: TrackingToken,
    processor: &str,
    segment: u32,
  ) -> Result<(), TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    let claim = rows
      .get_mut(processor)
      .and_then(|segments| segments.get_mut(&segment))
      .ok_or_else(|| TokenStoreError::UnknownSegment {
        processor: processor.to_string(),
        segment,
      })?;
    if !claim.is_owned_by(&self.owner, self.claim_timeout) {
      return Err(TokenStoreError::UnableToClaim {
        processor: processor.to_string(),
        segment,
      });
    }
    claim.token = Some(token);
    claim.last_updated = Utc::now();
    Ok(())
  }

  async fn release_claim(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    if let Some(claim) = rows.get_mut(processor).and_then(|segments| segments.get_mut(&segment)) {
      if claim.owner.as_deref() == Some(&*self.owner) {
        claim.owner = None;
      }
    }
    Ok(())
  }

  async fn initialize_segment(
    &self,
    token: Option<TrackingToken>,
    processor: &str,
    segment: u32,
  ) -> Result<(), TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    let segments = rows.entry(processor.to_string()).or_default();
    if segments.contains_key(&segment) {
      return Err(TokenStoreError::UnableToInitialize(processor.to_string()));
    }
    segments.insert(segment, TokenClaim::unclaimed(token));
    Ok(())
  }

  async fn delete_token(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError> {
    let mut rows = self.rows.write().map_err(|_| Self::lock_error("rows lock poisoned"))?;
    let segments = rows.get_mut(processor).ok_or_else(|| TokenStoreError::UnknownSegment {
      processor: processor.to_string(),
      segment,
    })?;
    let claim = segments.get(&segment).ok_or_else(|| TokenStoreError::UnknownSegment {
      processor: processor.to_string(),
      segment,
    })?;
    if !claim.is_owned_by(&self.owner, self.claim_timeout) {
      return Err(TokenStoreError::UnableToClaim {
        processor: processor.to_string(),
        segment,
      });
    }
    segments.remove(&segment);
    Ok(())
  }

  async fn storage_identifier(&self) -> Result<Option<String>, TokenStoreError> {
    Ok(Some(self.identifier.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PROCESSOR: &str = "test";

  #[tokio::test]
  async fn initialize_is_whole_store_idempotent() {
    let store = InMemoryTokenStore::new();
    store.initialize_token_segments(PROCESSOR, 4, None).await.unwrap();
    assert_eq!(store.fetch_segments(PROCESSOR).await.unwrap(), vec![0, 1, 2, 3]);

    let again = store.initialize_token_segments(PROCESSOR, 4, None).await;
    assert!(matches!(again, Err(TokenStoreError::UnableToInitialize(_))));
  }

  #[tokio::test]
  async fn fetch_token_claims_the_segment() {
    let store = InMemoryTokenStore::new();
    store
      .initialize_token_segments(PROCESSOR, 1, Some(TrackingToken::sequence(3)))
      .await
      .unwrap();

    assert_eq!(store.fetch_token(PROCESSOR, 0).await.unwrap(), Some(TrackingToken::sequence(3)));

    let other = store.fork_owner();
    let denied = other.fetch_token(PROCESSOR, 0).await;
    assert!(matches!(denied, Err(TokenStoreError::UnableToClaim { segment: 0, .. })));
  }

  #[tokio::test]
  async fn released_claim_is_reclaimable() {
    let store = InMemoryTokenStore::new();
    store.initialize_token_segments(PROCESSOR, 1, None).await.unwrap();
    store.fetch_token(PROCESSOR, 0).await.unwrap();
    store.release_claim(PROCESSOR, 0).await.unwrap();

    let other = store.fork_owner();
    assert!(other.fetch_token(PROCESSOR, 0).await.is_ok());
  }

  #[tokio::test]
  async fn expired_claim_is_reclaimable() {
    let store = InMemoryTokenStore::with_claim_timeout(Duration::from_millis(10));
    store.initialize_token_segments(PROCESSOR, 1, None).await.unwrap();
    store.fetch_token(PROCESSOR, 0).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let other = store.fork_owner();
    assert!(other.fetch_token(PROCESSOR, 0).await.is_ok());
  }

  #[tokio::test]
  async fn store_token_requires_ownership() {
    let store = InMemoryTokenStore::new();
    store.initialize_token_segments(PROCESSOR, 1, None).await.unwrap();
    store.fetch_token(PROCESSOR, 0).await.unwrap();

    let other = store.fork_owner();
    let denied = other.store_token(TrackingToken::sequence(5), PROCESSOR, 0).await;
    assert!(matches!(denied, Err(TokenStoreError::UnableToClaim { .. })));

    store.store_token(TrackingToken::sequence(5), PROCESSOR, 0).await.unwrap();
    store.release_claim(PROCESSOR, 0).await.unwrap();
    assert_eq!(other.fetch_token(PROCESSOR, 0).await.unwrap(), Some(TrackingToken::sequence(5)));
  }

  #[tokio::test]
  async fn extend_claim_requires_ownership() {
    let store = InMemoryTokenStore::new();
    store.initialize_token_segments(PROCESSOR, 1, None).await.unwrap();

    let denied = store.extend_claim(PROCESSOR, 0).await;
    assert!(matches!(denied, Err(TokenStoreError::UnableToClaim { .. })));

    store.fetch_token(PROCESSOR, 0).await.unwrap();
    store.extend_claim(PROCESSOR, 0).await.unwrap();
  }

  #[tokio::test]
  async fn split_style_row_management() {
    let store = InMemoryTokenStore::new();
    store.initialize_token_segments(PROCESSOR, 1, None).await.unwrap();
    store.fetch_token(PROCESSOR, 0).await.unwrap();

    store
      .initialize_segment(Some(TrackingToken::sequence(7)), PROCESSOR, 1)
      .await
      .unwrap();
    assert_eq!(store.fetch_segments(PROCESSOR).await.unwrap(), vec![0, 1]);

    store.fetch_token(PROCESSOR, 1).await.unwrap();
    store.delete_token(PROCESSOR, 1).await.unwrap();
    assert_eq!(store.fetch_segments(PROCESSOR).await.unwrap(), vec![0]);
  }

  #[tokio::test]
  async fn unknown_segment_is_reported() {
    let store = InMemoryTokenStore::new();
    let missing = store.fetch_token(PROCESSOR, 9).await;
    assert!(matches!(missing, Err(TokenStoreError::UnknownSegment { segment: 9, .. })));
  }

  #[tokio::test]
  async fn storage_identifier_is_stable_per_store() {
    let store = InMemoryTokenStore::new();
    let id = store.storage_identifier().await.unwrap();
    assert!(id.is_some());
    assert_eq!(store.fork_owner().storage_identifier().await.unwrap(), id);
  }
}
