//! Observable per-segment processing status.

use crate::segment::Segment;
use crate::token::TrackingToken;
use serde::Serialize;

/// Snapshot of one segment's progress, published by its work package.
///
/// Snapshots are eventually consistent and may lag live processing by
/// one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentStatus {
  /// The segment being processed.
  pub segment: Segment,
  /// Progress token, `None` until the first batch completes.
  pub tracking_token: Option<TrackingToken>,
  /// Whether the segment has consumed everything scheduled to it.
  pub caught_up: bool,
  /// Whether the segment is re-processing a region after a token reset.
  pub replaying: bool,
  /// Whether the last handler invocation failed.
  pub error_state: bool,
  /// Number of handler failures observed on this segment.
  pub error_count: u64,
}

impl SegmentStatus {
  /// Creates the initial status for a freshly claimed segment.
  #[must_use]
  pub fn new(segment: Segment, tracking_token: Option<TrackingToken>) -> Self {
    let replaying = tracking_token.is_some_and(|token| token.is_replay());
    Self {
      segment,
      tracking_token,
      caught_up: false,
      replaying,
      error_state: false,
      error_count: 0,
    }
  }

  /// The stream position this segment has reached.
  #[must_use]
  pub fn current_position(&self) -> Option<i64> {
    self.tracking_token.and_then(|token| token.position())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn replay_flag_derives_from_token() {
    let plain = SegmentStatus::new(Segment::ROOT, Some(TrackingToken::sequence(4)));
    assert!(!plain.replaying);
    assert_eq!(plain.current_position(), Some(4));

    let replay = SegmentStatus::new(
      Segment::ROOT,
      Some(TrackingToken::Replay { current: 1, reset_at: 9 }),
    );
    assert!(replay.replaying);
    assert_eq!(replay.current_position(), Some(1));
  }

  #[test]
  fn fresh_segment_has_no_position() {
    let status = SegmentStatus::new(Segment::ROOT, None);
    assert_eq!(status.current_position(), None);
    assert!(!status.caught_up);
    assert_eq!(status.error_count, 0);
  }
}
