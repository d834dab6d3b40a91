//! # Tracking Tokens
//!
//! A tracking token is a comparable position in the upstream event
//! stream. Segments persist one token each; a token is only stored once
//! every event up to its position has been handled or deliberately
//! skipped, which is what makes redelivery after a crash at-least-once
//! instead of lossy.
//!
//! Two shapes exist:
//!
//! - [`TrackingToken::Sequence`]: a plain global sequence position.
//! - [`TrackingToken::Replay`]: a position wrapper created by a token
//!   reset. It remembers the position the segment had reached when the
//!   reset was issued (`reset_at`) and unwraps back into a plain
//!   sequence token once the segment catches up with it.
//!
//! The position `0` means "before the first event"; sources number
//! events from `1`. "No token at all" (`Option::None`) is reserved for
//! segments that have never stored progress.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display};

/// A position marker in the upstream event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackingToken {
  /// A global sequence position.
  Sequence(i64),
  /// A position inside a region that is being re-processed after a
  /// token reset. `current` advances with the replay; `reset_at` is the
  /// position the segment had reached when the reset was issued.
  Replay {
    /// Current replay position.
    current: i64,
    /// Position at which the replay has caught up with prior progress.
    reset_at: i64,
  },
}

impl TrackingToken {
  /// Token that precedes every event in the stream.
  pub const BEGINNING: TrackingToken = TrackingToken::Sequence(0);

  /// Creates a plain sequence token.
  #[must_use]
  pub const fn sequence(position: i64) -> Self {
    TrackingToken::Sequence(position)
  }

  /// Returns the stream position this token has reached.
  #[must_use]
  pub fn position(&self) -> Option<i64> {
    match self {
      TrackingToken::Sequence(position) => Some(*position),
      TrackingToken::Replay { current, .. } => Some(*current),
    }
  }

  /// True iff this token is at or past `other`.
  #[must_use]
  pub fn covers(&self, other: &TrackingToken) -> bool {
    self.position() >= other.position()
  }

  /// True while the token marks a region being re-processed.
  #[must_use]
  pub const fn is_replay(&self) -> bool {
    matches!(self, TrackingToken::Replay { .. })
  }

  /// Advances the token to `position`, never moving backwards. A replay
  /// token that reaches its reset position unwraps into a plain
  /// sequence token.
  #[must_use]
  pub fn advanced_to(self, position: i64) -> Self {
    match self {
      TrackingToken::Sequence(current) => TrackingToken::Sequence(current.max(position)),
      TrackingToken::Replay { current, reset_at } => {
        let advanced = current.max(position);
        if advanced >= reset_at {
          TrackingToken::Sequence(advanced)
        } else {
          TrackingToken::Replay { current: advanced, reset_at }
        }
      }
    }
  }

  /// Builds the token stored by a reset: processing restarts at
  /// `reset_to` and is considered a replay until it catches up with
  /// `token_at_reset` (the progress recorded before the reset). Returns
  /// `reset_to` unwrapped when there is nothing to re-process.
  #[must_use]
  pub fn replay_from(
    reset_to: Option<TrackingToken>,
    token_at_reset: Option<TrackingToken>,
  ) -> Option<TrackingToken> {
    let reset_at = match token_at_reset.and_then(|token| token.position()) {
      Some(position) if position > 0 => position,
      _ => return reset_to,
    };
    let current = reset_to.and_then(|token| token.position()).unwrap_or(0);
    if current >= reset_at {
      reset_to
    } else {
      Some(TrackingToken::Replay { current, reset_at })
    }
  }

  /// The lesser of two tokens, used to seed a merged segment so no
  /// event either half still owes gets skipped.
  #[must_use]
  pub fn lower_bound(self, other: TrackingToken) -> TrackingToken {
    if other.position() < self.position() { other } else { self }
  }
}

impl PartialOrd for TrackingToken {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for TrackingToken {
  fn cmp(&self, other: &Self) -> Ordering {
    self.position().cmp(&other.position()).then_with(|| match (self, other) {
      (TrackingToken::Sequence(_), TrackingToken::Sequence(_)) => Ordering::Equal,
      (TrackingToken::Sequence(_), TrackingToken::Replay { .. }) => Ordering::Less,
      (TrackingToken::Replay { .. }, TrackingToken::Sequence(_)) => Ordering::Greater,
      (TrackingToken::Replay { reset_at: ours, .. }, TrackingToken::Replay { reset_at: theirs, .. }) => {
        ours.cmp(theirs)
      }
    })
  }
}

impl Display for TrackingToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TrackingToken::Sequence(position) => write!(f, "seq:{}", position),
      TrackingToken::Replay { current, reset_at } => {
        write!(f, "replay:{}->{}", current, reset_at)
      }
    }
  }
}
