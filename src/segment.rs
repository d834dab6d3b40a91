//! Segment identities over the sequencing-key hash space.
//!
//! A segment is a `(id, mask)` pair selecting a subtree of the 32-bit
//! hash space: the segment owns every value `v` with `v & mask == id`.
//! The set of live segment ids always forms a partition of the full
//! space. Splitting extends the mask by one bit and yields two
//! siblings; merging collapses two siblings back into the lower id.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// One partition of the event stream, claimed and advanced atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
  id: u32,
  mask: u32,
}

impl Segment {
  /// The root segment covering the entire hash space.
  pub const ROOT: Segment = Segment { id: 0, mask: 0 };

  /// Returns the segment identifier.
  #[must_use]
  pub const fn id(&self) -> u32 {
    self.id
  }

  /// Returns the mask selecting this segment's subtree.
  #[must_use]
  pub const fn mask(&self) -> u32 {
    self.mask
  }

  /// True iff this segment owns the given hash value.
  #[must_use]
  pub const fn matches(&self, value: u64) -> bool {
    (value as u32) & self.mask == self.id
  }

  /// True iff this segment owns the given sequencing key.
  #[must_use]
  pub fn matches_key(&self, key: &str) -> bool {
    self.matches(hash_key(key))
  }

  /// Splits this segment one bit deeper, yielding `(self, sibling)`.
  #[must_use]
  pub const fn split(&self) -> (Segment, Segment) {
    let mask = (self.mask << 1) | 1;
    (
      Segment { id: self.id, mask },
      Segment { id: self.id + self.mask + 1, mask },
    )
  }

  /// The id of the sibling this segment can merge with, or `None` for
  /// the root segment.
  #[must_use]
  pub const fn sibling_id(&self) -> Option<u32> {
    if self.mask == 0 {
      None
    } else {
      Some(self.id ^ ((self.mask >> 1) + 1))
    }
  }

  /// Collapses this segment and its sibling into their parent. Returns
  /// `None` unless `other` is this segment's sibling at the same depth.
  #[must_use]
  pub fn merged_with(&self, other: &Segment) -> Option<Segment> {
    if self.mask != other.mask || self.sibling_id() != Some(other.id) {
      return None;
    }
    Some(Segment {
      id: self.id.min(other.id),
      mask: self.mask >> 1,
    })
  }

  /// Derives the mask of `id` from the full set of live segment ids:
  /// the shallowest subtree in which no other live id collides.
  #[must_use]
  pub fn compute(id: u32, all_ids: &[u32]) -> Segment {
    let mut mask = 0u32;
    loop {
      let collision = all_ids.iter().any(|&other| other != id && other & mask == id);
      if id <= mask && !collision {
        return Segment { id, mask };
      }
      if mask == u32::MAX {
        return Segment { id, mask };
      }
      mask = (mask << 1) | 1;
    }
  }

  /// Builds the initial balanced partition for `count` segments by
  /// repeatedly splitting the shallowest segment, sorted by id.
  #[must_use]
  pub fn compute_balanced(count: usize) -> Vec<Segment> {
    let mut segments = vec![Segment::ROOT];
    while segments.len() < count {
      let shallowest = segments
        .iter()
        .enumerate()
        .min_by_key(|(_, segment)| segment.mask)
        .map(|(index, _)| index)
        .unwrap_or(0);
      let (lower, upper) = segments.remove(shallowest).split();
      segments.push(lower);
      segments.push(upper);
    }
    segments.sort_by_key(Segment::id);
    segments
  }
}

impl Display for Segment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "segment[{}/{:#x}]", self.id, self.mask)
  }
}

fn hash_key(key: &str) -> u64 {
  use std::collections::hash_map::DefaultHasher;
  use std::hash::{Hash, Hasher};

  let mut hasher = DefaultHasher::new();
  key.hash(&mut hasher);
  hasher.finish()
}
