//! File-backed token store.
//!
//! Persists all rows to a single JSON file: the file is loaded once on
//! open and rewritten on every mutation. Suitable for single-node
//! deployments; multi-node fleets need a store with real cross-process
//! CAS (SQL-backed, outside this crate).

use super::{TokenClaim, TokenStore, TokenStoreError, DEFAULT_CLAIM_TIMEOUT};
use crate::segment::Segment;
use crate::token::TrackingToken;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

type Rows = HashMap<String, BTreeMap<u32, TokenClaim>>;

/// Token store persisting rows to a JSON file.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
  path: PathBuf,
  cache: Arc<RwLock<Rows>>,
  owner: Arc<str>,
  claim_timeout: Duration,
}

impl FileTokenStore {
  /// Opens (or creates) a file-backed store at `path`.
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TokenStoreError> {
    Self::open_with_claim_timeout(path, DEFAULT_CLAIM_TIMEOUT)
  }

  /// Opens a file-backed store whose claims expire after
  /// `claim_timeout`.
  pub fn open_with_claim_timeout<P: AsRef<Path>>(
    path: P,
    claim_timeout: Duration,
  ) -> Result<Self, TokenStoreError> {
    let path = path.as_ref().to_path_buf();
    let cache = if path.exists() {
      let data = fs::read_to_string(&path)
        .map_err(|err| TokenStoreError::Unavailable(err.to_string()))?;
      if data.is_empty() {
        HashMap::new()
      } else {
        serde_json::from_str(&data).map_err(|err| TokenStoreError::Unavailable(err.to_string()))?
      }
    } else {
      HashMap::new()
    };

    Ok(Self {
      path,
      cache: Arc::new(RwLock::new(cache)),
      owner: Uuid::new_v4().to_string().into(),
      claim_timeout,
    })
  }

  /// Returns the path rows are persisted to.
  #[must_use]
  pub fn path(&self) -> &Path {
    &self.path
  }

  fn persist(&self, rows: &Rows) -> Result<(), TokenStoreError> {
    if let Some(parent) = self.path.parent() {
      fs::create_dir_all(parent).map_err(|err| TokenStoreError::Unavailable(err.to_string()))?;
    }
    let data = serde_json::to_string_pretty(rows)
      .map_err(|err| TokenStoreError::Unavailable(err.to_string()))?;
    fs::write(&self.path, data).map_err(|err| TokenStoreError::Unavailable(err.to_string()))
  }

  fn lock_error() -> TokenStoreError {
    TokenStoreError::Unavailable("cache lock poisoned".to_string())
  }
}

#[async_trait]
impl TokenStore for FileTokenStore {
  async fn initialize_token_segments(
    &self,
    processor: &str,
    count: usize,
    initial_token: Option<TrackingToken>,
  ) -> Result<(), TokenStoreError> {
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
    let entry = rows.entry(processor.to_string()).or_default();
    if !entry.is_empty() {
      return Err(TokenStoreError::UnableToInitialize(processor.to_string()));
    }
    for segment in Segment::compute_balanced(count) {
      entry.insert(segment.id(), TokenClaim::unclaimed(initial_token));
    }
    self.persist(&rows)
  }

  async fn fetch_segments(&self, processor: &str) -> Result<Vec<u32>, TokenStoreError> {
    let rows = self.cache.read().map_err(|_| Self::lock_error())?;
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
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
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
    let token = claim.token;
    self.persist(&rows)?;
    Ok(token)
  }

  async fn extend_claim(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError> {
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
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
    self.persist(&rows)
  }

  async fn store_token(
    &self,
    token: TrackingToken,
    processor: &str,
    segment: u32,
  ) -> Result<(), TokenStoreError> {
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
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
    self.persist(&rows)
  }

  async fn release_claim(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError> {
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
    let mut changed = false;
    if let Some(claim) = rows.get_mut(processor).and_then(|segments| segments.get_mut(&segment)) {
      if claim.owner.as_deref() == Some(&*self.owner) {
        claim.owner = None;
        changed = true;
      }
    }
    if changed {
      self.persist(&rows)?;
    }
    Ok(())
  }

  async fn initialize_segment(
    &self,
    token: Option<TrackingToken>,
    processor: &str,
    segment: u32,
  ) -> Result<(), TokenStoreError> {
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
    let segments = rows.entry(processor.to_string()).or_default();
    if segments.contains_key(&segment) {
      return Err(TokenStoreError::UnableToInitialize(processor.to_string()));
    }
    segments.insert(segment, TokenClaim::unclaimed(token));
    self.persist(&rows)
  }

  async fn delete_token(&self, processor: &str, segment: u32) -> Result<(), TokenStoreError> {
    let mut rows = self.cache.write().map_err(|_| Self::lock_error())?;
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
    self.persist(&rows)
  }

  async fn storage_identifier(&self) -> Result<Option<String>, TokenStoreError> {
    Ok(Some(format!("file:{}", self.path.display())))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  const PROCESSOR: &str = "test";

  #[tokio::test]
  async fn tokens_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tokens.json");

    {
      let store = FileTokenStore::open(&path).unwrap();
      store.initialize_token_segments(PROCESSOR, 2, None).await.unwrap();
      store.fetch_token(PROCESSOR, 0).await.unwrap();
      store.store_token(TrackingToken::sequence(41), PROCESSOR, 0).await.unwrap();
      store.release_claim(PROCESSOR, 0).await.unwrap();
    }

    let reopened = FileTokenStore::open(&path).unwrap();
    assert_eq!(reopened.fetch_segments(PROCESSOR).await.unwrap(), vec![0, 1]);
    assert_eq!(
      reopened.fetch_token(PROCESSOR, 0).await.unwrap(),
      Some(TrackingToken::sequence(41))
    );
  }

  #[tokio::test]
  async fn claims_are_enforced_across_handles() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tokens.json");

    let store = FileTokenStore::open(&path).unwrap();
    store.initialize_token_segments(PROCESSOR, 1, None).await.unwrap();
    store.fetch_token(PROCESSOR, 0).await.unwrap();

    let other = FileTokenStore::open(&path).unwrap();
    let denied = other.fetch_token(PROCESSOR, 0).await;
    assert!(matches!(denied, Err(TokenStoreError::UnableToClaim { .. })));
  }

  #[tokio::test]
  async fn identifier_derives_from_path() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tokens.json");
    let store = FileTokenStore::open(&path).unwrap();
    let id = store.storage_identifier().await.unwrap().unwrap();
    assert!(id.starts_with("file:"));
    assert!(id.ends_with("tokens.json"));
  }
}
