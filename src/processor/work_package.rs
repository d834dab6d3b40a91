//! Per-segment consumer.
//!
//! A work package drains the bounded in-memory queue the coordinator
//! fills for its segment, invokes the handler in batches inside a
//! transaction, persists the advanced token, and keeps the segment's
//! claim lease alive. One work package exists per claimed segment; each
//! runs as its own task on the worker runtime, so packages process in
//! parallel while every single segment stays strictly ordered.
//!
//! Aborting is irreversible: the first abort reason wins, the in-flight
//! batch completes, the claim is released, and the task exits.

use super::{ErrorHandlerPolicy, RollbackConfiguration, StatusMap};
use crate::error::ProcessorError;
use crate::event::TrackedEvent;
use crate::handler::EventHandlerInvoker;
use crate::segment::Segment;
use crate::status::SegmentStatus;
use crate::store::TokenStore;
use crate::token::TrackingToken;
use crate::transaction::TransactionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Queue capacity multiplier over the batch size.
const QUEUE_FACTOR: usize = 4;

/// Everything a work package needs from the processor configuration.
#[derive(Clone)]
pub(crate) struct WorkerContext {
  pub processor_name: Arc<str>,
  pub store: Arc<dyn TokenStore>,
  pub invoker: Arc<dyn EventHandlerInvoker>,
  pub transactions: Arc<dyn TransactionManager>,
  pub rollback: RollbackConfiguration,
  pub error_policy: ErrorHandlerPolicy,
  pub batch_size: usize,
  pub claim_extension_threshold: Duration,
  pub status: StatusMap,
  pub coordinator_wake: Arc<Notify>,
}

#[derive(Default)]
struct WorkPackageState {
  aborted: AtomicBool,
  reason: Mutex<Option<ProcessorError>>,
  abort_notify: Notify,
}

impl WorkPackageState {
  fn abort(&self, reason: ProcessorError) {
    if !self.aborted.swap(true, Ordering::SeqCst) {
      if let Ok(mut slot) = self.reason.lock() {
        *slot = Some(reason);
      }
    }
    // notify_one stores a permit, so an abort signalled between the
    // consumer's aborted check and its next await is not lost.
    self.abort_notify.notify_one();
  }

  fn is_aborted(&self) -> bool {
    self.aborted.load(Ordering::SeqCst)
  }

  fn take_reason(&self) -> Option<ProcessorError> {
    self.reason.lock().ok().and_then(|mut slot| slot.take())
  }
}

/// Coordinator-side handle on one segment's consumer task.
pub(crate) struct WorkPackage {
  segment: Segment,
  sender: mpsc::Sender<TrackedEvent>,
  state: Arc<WorkPackageState>,
  join: JoinHandle<()>,
  last_delivered: Option<TrackingToken>,
}

impl WorkPackage {
  /// Spawns the consumer task for `segment`, resuming at
  /// `initial_token`.
  pub(crate) fn spawn(
    segment: Segment,
    initial_token: Option<TrackingToken>,
    ctx: WorkerContext,
    worker: &Handle,
  ) -> Self {
    let capacity = (ctx.batch_size * QUEUE_FACTOR).max(QUEUE_FACTOR);
    let (sender, receiver) = mpsc::channel(capacity);
    let state = Arc::new(WorkPackageState::default());

    if let Ok(mut map) = ctx.status.write() {
      map.insert(segment.id(), SegmentStatus::new(segment, initial_token));
    }

    let join = worker.spawn(run(segment, initial_token, receiver, Arc::clone(&state), ctx));
    Self { segment, sender, state, join, last_delivered: initial_token }
  }

  pub(crate) fn segment(&self) -> Segment {
    self.segment
  }

  /// Appends an event to the pending queue. Returns whether the event
  /// was accepted: aborted packages and events at or before the last
  /// delivered position are rejected, as is a full queue.
  pub(crate) fn schedule_event(&mut self, event: &TrackedEvent) -> bool {
    if self.state.is_aborted() {
      return false;
    }
    if self.last_delivered.is_some_and(|last| last.covers(&event.token)) {
      return false;
    }
    match self.sender.try_send(event.clone()) {
      Ok(()) => {
        self.last_delivered = Some(event.token);
        true
      }
      Err(_) => false,
    }
  }

  /// True while the pending queue can accept more events. Aborted
  /// packages report capacity so they never stall dispatch.
  pub(crate) fn has_remaining_capacity(&self) -> bool {
    self.state.is_aborted() || self.sender.capacity() > 0
  }

  /// The highest token scheduled onto this package (not necessarily
  /// processed yet).
  pub(crate) fn last_delivered_token(&self) -> Option<TrackingToken> {
    self.last_delivered
  }

  /// Marks the package aborted. The consumer task finishes its
  /// in-flight batch, releases the claim and exits.
  pub(crate) fn abort(&self, reason: ProcessorError) {
    self.state.abort(reason);
  }

  /// True once the consumer task has exited.
  pub(crate) fn is_finished(&self) -> bool {
    self.join.is_finished()
  }

  /// Aborts the package and waits for its task to finish.
  pub(crate) async fn abort_and_join(self, reason: ProcessorError) {
    self.state.abort(reason);
    let _ = self.join.await;
  }

  /// Waits for an already-finished or aborting task to exit.
  pub(crate) async fn join(self) {
    let _ = self.join.await;
  }
}

async fn run(
  segment: Segment,
  mut current_token: Option<TrackingToken>,
  mut receiver: mpsc::Receiver<TrackedEvent>,
  state: Arc<WorkPackageState>,
  ctx: WorkerContext,
) {
  debug!(segment = segment.id(), "work package started");
  let mut last_extension = tokio::time::Instant::now();

  loop {
    if state.is_aborted() {
      break;
    }
    let extension_due = last_extension + ctx.claim_extension_threshold;
    let first = tokio::select! {
      _ = state.abort_notify.notified() => break,
      received = receiver.recv() => match received {
        Some(event) => Some(event),
        None => break,
      },
      _ = tokio::time::sleep_until(extension_due) => None,
    };

    let Some(first) = first else {
      // Idle past the extension threshold: keep the lease alive.
      if let Err(err) = ctx.store.extend_claim(&ctx.processor_name, segment.id()).await {
        warn!(segment = segment.id(), error = %err, "failed to extend claim");
        state.abort(ProcessorError::ClaimLost(segment.id()));
        break;
      }
      last_extension = tokio::time::Instant::now();
      update_status(&ctx, segment.id(), |status| status.caught_up = true);
      continue;
    };

    let mut batch = Vec::with_capacity(ctx.batch_size);
    batch.push(first);
    while batch.len() < ctx.batch_size {
      match receiver.try_recv() {
        Ok(event) => batch.push(event),
        Err(_) => break,
      }
    }

    match process_batch(&segment, current_token, batch, &ctx).await {
      Ok(token) => {
        current_token = Some(token);
        last_extension = tokio::time::Instant::now();
        let caught_up = receiver.is_empty();
        update_status(&ctx, segment.id(), |status| {
          status.tracking_token = Some(token);
          status.replaying = token.is_replay();
          status.caught_up = caught_up;
        });
        ctx.coordinator_wake.notify_one();
      }
      Err(reason) => {
        state.abort(reason);
        break;
      }
    }
  }

  if let Err(err) = ctx.store.release_claim(&ctx.processor_name, segment.id()).await {
    debug!(segment = segment.id(), error = %err, "failed to release claim");
  }
  if let Ok(mut map) = ctx.status.write() {
    map.remove(&segment.id());
  }
  match state.take_reason() {
    Some(ProcessorError::ShuttingDown) | Some(ProcessorError::SegmentReleased(_)) | None => {
      debug!(segment = segment.id(), "work package stopped");
    }
    Some(reason) => {
      warn!(segment = segment.id(), reason = %reason, "work package aborted");
    }
  }
  ctx.coordinator_wake.notify_one();
}

/// Handles one batch inside a transaction and persists the advanced
/// token. Returns the token the segment has progressed to, or the abort
/// reason.
async fn process_batch(
  segment: &Segment,
  current_token: Option<TrackingToken>,
  batch: Vec<TrackedEvent>,
  ctx: &WorkerContext,
) -> Result<TrackingToken, ProcessorError> {
  let transaction = ctx.transactions.start_transaction().await?;
  let mut progress = current_token;

  for event in &batch {
    if ctx.invoker.can_handle(&event.message, segment) {
      if let Err(err) = ctx.invoker.handle(&event.message, segment).await {
        record_failure(ctx, segment.id());
        if ctx.rollback.should_rollback(&err) {
          if let Err(rollback_err) = transaction.rollback().await {
            warn!(segment = segment.id(), error = %rollback_err, "rollback failed");
          }
          return Err(ProcessorError::Handler(err));
        }
        match ctx.error_policy {
          ErrorHandlerPolicy::Propagate => {
            // Keep progress up to, but not including, the failing event.
            if let Some(token) = progress {
              if let Err(store_err) =
                ctx.store.store_token(token, &ctx.processor_name, segment.id()).await
              {
                warn!(segment = segment.id(), error = %store_err, "failed to store partial progress");
              }
            }
            if let Err(commit_err) = transaction.commit().await {
              warn!(segment = segment.id(), error = %commit_err, "commit of partial progress failed");
            }
            return Err(ProcessorError::Handler(err));
          }
          ErrorHandlerPolicy::Ignore => {
            warn!(
              segment = segment.id(),
              event = %event.message.identifier,
              error = %err,
              "handler failed, skipping event"
            );
          }
        }
      }
    }
    progress = Some(advance(progress, event.token));
  }

  let Some(token) = progress else {
    return Err(ProcessorError::IllegalState("batch processing without events"));
  };

  if let Err(err) = ctx.store.store_token(token, &ctx.processor_name, segment.id()).await {
    warn!(segment = segment.id(), error = %err, "failed to store token");
    if let Err(rollback_err) = transaction.rollback().await {
      warn!(segment = segment.id(), error = %rollback_err, "rollback failed");
    }
    return Err(ProcessorError::ClaimLost(segment.id()));
  }
  transaction.commit().await?;
  Ok(token)
}

fn advance(progress: Option<TrackingToken>, event_token: TrackingToken) -> TrackingToken {
  match progress {
    Some(token) => token.advanced_to(event_token.position().unwrap_or(0)),
    None => event_token,
  }
}

fn update_status(ctx: &WorkerContext, segment_id: u32, update: impl FnOnce(&mut SegmentStatus)) {
  if let Ok(mut map) = ctx.status.write() {
    if let Some(status) = map.get_mut(&segment_id) {
      update(status);
    }
  }
}

fn record_failure(ctx: &WorkerContext, segment_id: u32) {
  update_status(ctx, segment_id, |status| {
    status.error_state = true;
    status.error_count += 1;
  });
}
