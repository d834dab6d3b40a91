//! Coordinator task.
//!
//! The coordinator is the single reader of the upstream stream. Each
//! pass of its loop claims unowned segments, keeps the stream opened
//! from the lowest claimed position, fans available events out to the
//! work packages, executes one queued control task, and reaps packages
//! that have aborted. Every event is offered to every live work
//! package: packages whose segment does not match an event still
//! advance their token past it, which keeps per-segment progress
//! honest without a separate progress-marker message.
//!
//! Faults from the store or the stream are treated as transient: the
//! coordinator pauses with exponential backoff and resumes, it never
//! crashes the process.

use super::work_package::{WorkPackage, WorkerContext};
use super::{ProcessorShared, ProcessorState};
use crate::error::ProcessorError;
use crate::event::TrackedEvent;
use crate::segment::Segment;
use crate::source::{EventStream, InitialTokenPolicy, StreamableEventSource};
use crate::store::{TokenStore, TokenStoreError};
use crate::token::TrackingToken;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, trace, warn};

/// Initial pause after a transient coordination fault.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Cap on the exponential fault backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Poll cadence for sources without push notification.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Events dispatched per pass before control tasks get a turn.
const DISPATCH_BURST: usize = 1024;
/// Reopen the stream ahead when the lowest claim has outrun the cursor
/// by this many positions.
const CATCHUP_REOPEN_THRESHOLD: i64 = 1024;

/// Administrative operations serialized onto the coordinator task.
pub(crate) enum CoordinatorInstruction {
  ReleaseSegment {
    segment_id: u32,
  },
  SplitSegment {
    segment_id: u32,
    reply: oneshot::Sender<Result<bool, ProcessorError>>,
  },
  MergeSegment {
    segment_id: u32,
    reply: oneshot::Sender<Result<bool, ProcessorError>>,
  },
}

/// Static configuration handed from the facade to the coordinator.
pub(crate) struct CoordinatorSettings {
  pub name: Arc<str>,
  pub store: Arc<dyn TokenStore>,
  pub source: Arc<dyn StreamableEventSource>,
  pub worker_ctx: WorkerContext,
  pub worker_handle: Handle,
  pub token_claim_interval: Duration,
  pub initial_segment_count: usize,
  pub initial_token_policy: InitialTokenPolicy,
  pub max_claimed_segments: usize,
  pub shared: Arc<ProcessorShared>,
  pub wake: Arc<Notify>,
}

pub(crate) struct Coordinator {
  settings: CoordinatorSettings,
  control_rx: mpsc::UnboundedReceiver<CoordinatorInstruction>,
  pending_instructions: VecDeque<CoordinatorInstruction>,
  work_packages: HashMap<u32, WorkPackage>,
  stream: Option<Box<dyn EventStream>>,
  stream_position: Option<TrackingToken>,
  push_notifications: bool,
  last_sweep: Option<Instant>,
  claims_dirty: bool,
  dispatch_saturated: bool,
  holddowns: HashMap<u32, Instant>,
  backoff: Duration,
  paused_until: Option<Instant>,
}

impl Coordinator {
  pub(crate) fn new(
    settings: CoordinatorSettings,
    control_rx: mpsc::UnboundedReceiver<CoordinatorInstruction>,
  ) -> Self {
    Self {
      settings,
      control_rx,
      pending_instructions: VecDeque::new(),
      work_packages: HashMap::new(),
      stream: None,
      stream_position: None,
      push_notifications: false,
      last_sweep: None,
      claims_dirty: false,
      dispatch_saturated: false,
      holddowns: HashMap::new(),
      backoff: INITIAL_BACKOFF,
      paused_until: None,
    }
  }

  pub(crate) async fn run(mut self, done: oneshot::Sender<()>) {
    info!(processor = %self.settings.name, "coordinator started");

    loop {
      if self.settings.shared.is_shutting_down() {
        break;
      }

      if let Some(until) = self.paused_until {
        if Instant::now() < until {
          self.wait_for(until.saturating_duration_since(Instant::now())).await;
          continue;
        }
        self.paused_until = None;
      }

      match self.coordinate().await {
        Ok(()) => {
          if self.settings.shared.clear_error() {
            info!(processor = %self.settings.name, "coordination recovered");
          }
          self.backoff = INITIAL_BACKOFF;
        }
        Err(err) => {
          warn!(
            processor = %self.settings.name,
            error = %err,
            backoff = ?self.backoff,
            "coordination failed, pausing"
          );
          self.settings.shared.mark_error();
          self.stream = None;
          self.stream_position = None;
          self.paused_until = Some(Instant::now() + self.backoff);
          self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
          continue;
        }
      }

      if let Some(instruction) = self.next_instruction() {
        self.execute(instruction).await;
        continue;
      }

      self.idle_wait().await;
    }

    self.shutdown(done).await;
  }

  /// One pass of the claim / stream / dispatch phases.
  async fn coordinate(&mut self) -> Result<(), ProcessorError> {
    self.reap_finished().await;
    if self.sweep_due() {
      self.claim_segments().await?;
    }
    if !self.work_packages.is_empty() {
      self.ensure_stream().await?;
      self.dispatch().await?;
    }
    Ok(())
  }

  fn sweep_due(&self) -> bool {
    self.claims_dirty
      || self
        .last_sweep
        .is_none_or(|at| at.elapsed() >= self.settings.token_claim_interval)
  }

  async fn claim_segments(&mut self) -> Result<(), ProcessorError> {
    self.claims_dirty = false;
    self.last_sweep = Some(Instant::now());

    let name = Arc::clone(&self.settings.name);
    let mut segments = self.settings.store.fetch_segments(&name).await?;
    if segments.is_empty() {
      let initial = match self.settings.initial_token_policy.resolve(self.settings.source.as_ref()).await {
        Ok(token) => Some(token),
        Err(err) => {
          warn!(processor = %name, error = %err, "failed to resolve initial token");
          None
        }
      };
      match self
        .settings
        .store
        .initialize_token_segments(&name, self.settings.initial_segment_count, initial)
        .await
      {
        Ok(()) => {
          debug!(processor = %name, count = self.settings.initial_segment_count, "token segments initialized");
        }
        // Another node initialized concurrently; claim whatever exists.
        Err(TokenStoreError::UnableToInitialize(_)) => {}
        Err(err) => {
          warn!(processor = %name, error = %err, "token segment initialization failed");
          return Ok(());
        }
      }
      segments = self.settings.store.fetch_segments(&name).await?;
    }

    let now = Instant::now();
    self.holddowns.retain(|_, until| *until > now);

    for &segment_id in &segments {
      if self.work_packages.len() >= self.settings.max_claimed_segments {
        break;
      }
      if self.work_packages.contains_key(&segment_id) || self.holddowns.contains_key(&segment_id) {
        continue;
      }
      match self.settings.store.fetch_token(&name, segment_id).await {
        Ok(token) => {
          debug!(processor = %name, segment = segment_id, token = ?token, "claimed segment");
          self.spawn_work_package(Segment::compute(segment_id, &segments), token);
        }
        Err(TokenStoreError::UnableToClaim { .. }) => {
          trace!(processor = %name, segment = segment_id, "segment claimed by another node");
        }
        Err(TokenStoreError::UnknownSegment { .. }) => {
          trace!(processor = %name, segment = segment_id, "segment row disappeared during sweep");
        }
        Err(err) => return Err(err.into()),
      }
    }
    Ok(())
  }

  fn spawn_work_package(&mut self, segment: Segment, token: Option<TrackingToken>) {
    let package = WorkPackage::spawn(
      segment,
      token,
      self.settings.worker_ctx.clone(),
      &self.settings.worker_handle,
    );
    self.work_packages.insert(segment.id(), package);
  }

  /// Opens the stream from the lowest claimed position, or reopens it
  /// when a fresh claim sits behind the cursor or everyone has moved
  /// far ahead of it.
  async fn ensure_stream(&mut self) -> Result<(), ProcessorError> {
    let lowest: Option<TrackingToken> = self
      .work_packages
      .values()
      .map(WorkPackage::last_delivered_token)
      .min()
      .unwrap_or(None);

    let reopen = match &self.stream {
      None => true,
      Some(_) => {
        let cursor = self.stream_position.and_then(|token| token.position()).unwrap_or(0);
        let low = lowest.and_then(|token| token.position()).unwrap_or(0);
        low < cursor || low > cursor + CATCHUP_REOPEN_THRESHOLD
      }
    };
    if !reopen {
      return Ok(());
    }

    debug!(processor = %self.settings.name, from = ?lowest, "opening event stream");
    let mut stream = self.settings.source.open_stream(lowest).await?;
    let wake = Arc::clone(&self.settings.wake);
    self.push_notifications = stream.on_available(Box::new(move || wake.notify_one()));
    self.stream = Some(stream);
    self.stream_position = lowest;
    Ok(())
  }

  /// Fans available events out to the work packages. The stream only
  /// advances while every package can accept the event, so a slow
  /// handler backpressures the read without blocking the coordinator
  /// on it.
  async fn dispatch(&mut self) -> Result<(), ProcessorError> {
    self.dispatch_saturated = false;
    let Some(mut stream) = self.stream.take() else {
      return Ok(());
    };

    let mut result = Ok(());
    let mut dispatched = 0usize;
    while dispatched < DISPATCH_BURST {
      if self.work_packages.is_empty() {
        break;
      }
      if !self.work_packages.values().all(WorkPackage::has_remaining_capacity) {
        break;
      }
      if !stream.has_next_available(Duration::ZERO).await {
        break;
      }
      let event = match stream.next_available() {
        Ok(event) => event,
        Err(err) => {
          result = Err(err.into());
          break;
        }
      };

      if !self.settings.worker_ctx.invoker.can_handle_type(&event.message.payload_type) {
        stream.skip_payload_type(&event);
      }
      self.offer(&event);
      self.stream_position = Some(event.token);
      dispatched += 1;
    }

    self.dispatch_saturated = dispatched == DISPATCH_BURST;
    self.stream = Some(stream);
    result
  }

  fn offer(&mut self, event: &TrackedEvent) {
    let mut accepted = false;
    for package in self.work_packages.values_mut() {
      accepted |= package.schedule_event(event);
    }
    if !accepted {
      trace!(position = ?event.position(), "event predates every claimed segment");
    }
  }

  /// Removes packages whose task has exited. Their claims were released
  /// on the way out; a short hold-down keeps a failing segment from
  /// being reclaimed in a hot loop.
  async fn reap_finished(&mut self) {
    let finished: Vec<u32> = self
      .work_packages
      .iter()
      .filter(|(_, package)| package.is_finished())
      .map(|(segment_id, _)| *segment_id)
      .collect();
    for segment_id in finished {
      if let Some(package) = self.work_packages.remove(&segment_id) {
        package.join().await;
      }
      debug!(processor = %self.settings.name, segment = segment_id, "reaped finished work package");
      self
        .holddowns
        .insert(segment_id, Instant::now() + self.settings.token_claim_interval);
    }
  }

  fn next_instruction(&mut self) -> Option<CoordinatorInstruction> {
    if let Some(instruction) = self.pending_instructions.pop_front() {
      return Some(instruction);
    }
    self.control_rx.try_recv().ok()
  }

  async fn execute(&mut self, instruction: CoordinatorInstruction) {
    match instruction {
      CoordinatorInstruction::ReleaseSegment { segment_id } => {
        info!(processor = %self.settings.name, segment = segment_id, "releasing segment");
        self
          .holddowns
          .insert(segment_id, Instant::now() + 2 * self.settings.token_claim_interval);
        if let Some(package) = self.work_packages.remove(&segment_id) {
          package.abort_and_join(ProcessorError::SegmentReleased(segment_id)).await;
        }
      }
      CoordinatorInstruction::SplitSegment { segment_id, reply } => {
        let _ = reply.send(self.split_segment(segment_id).await);
      }
      CoordinatorInstruction::MergeSegment { segment_id, reply } => {
        let _ = reply.send(self.merge_segment(segment_id).await);
      }
    }
  }

  async fn split_segment(&mut self, segment_id: u32) -> Result<bool, ProcessorError> {
    let name = Arc::clone(&self.settings.name);
    if !self.settings.store.requires_explicit_segment_initialization() {
      return Err(ProcessorError::Unsupported("token store cannot initialize segments"));
    }
    let Some(package) = self.work_packages.remove(&segment_id) else {
      warn!(processor = %name, segment = segment_id, "cannot split: segment not claimed by this node");
      return Ok(false);
    };
    let segment = package.segment();
    package.abort_and_join(ProcessorError::SegmentReleased(segment_id)).await;

    // Reclaim to read the progress the aborting package persisted.
    let token = match self.settings.store.fetch_token(&name, segment_id).await {
      Ok(token) => token,
      Err(err) => {
        warn!(processor = %name, segment = segment_id, error = %err, "failed to reclaim segment for split");
        self.claims_dirty = true;
        return Ok(false);
      }
    };

    let (lower, upper) = segment.split();
    if let Err(err) = self.settings.store.initialize_segment(token, &name, upper.id()).await {
      warn!(processor = %name, segment = segment_id, error = %err, "failed to initialize split sibling");
      self.spawn_work_package(segment, token);
      return Ok(false);
    }
    self.spawn_work_package(lower, token);
    match self.settings.store.fetch_token(&name, upper.id()).await {
      Ok(upper_token) => self.spawn_work_package(upper, upper_token),
      Err(err) => {
        debug!(processor = %name, segment = upper.id(), error = %err, "split sibling not claimed, leaving to a sweep");
        self.claims_dirty = true;
      }
    }
    info!(processor = %name, segment = segment_id, sibling = upper.id(), "segment split");
    Ok(true)
  }

  async fn merge_segment(&mut self, segment_id: u32) -> Result<bool, ProcessorError> {
    let name = Arc::clone(&self.settings.name);
    if !self.settings.store.requires_explicit_segment_initialization() {
      return Err(ProcessorError::Unsupported("token store cannot delete segments"));
    }
    let segments = match self.settings.store.fetch_segments(&name).await {
      Ok(segments) => segments,
      Err(err) => {
        warn!(processor = %name, segment = segment_id, error = %err, "failed to list segments for merge");
        return Ok(false);
      }
    };
    let segment = self
      .work_packages
      .get(&segment_id)
      .map(WorkPackage::segment)
      .unwrap_or_else(|| Segment::compute(segment_id, &segments));
    let Some(sibling_id) = segment.sibling_id() else {
      warn!(processor = %name, segment = segment_id, "root segment cannot be merged");
      return Ok(false);
    };
    let sibling = Segment::compute(sibling_id, &segments);
    let Some(merged) = segment.merged_with(&sibling) else {
      warn!(processor = %name, segment = segment_id, sibling = sibling_id, "siblings at uneven depth cannot be merged");
      return Ok(false);
    };

    let Some(package) = self.work_packages.remove(&segment_id) else {
      warn!(processor = %name, segment = segment_id, "cannot merge: segment not claimed by this node");
      return Ok(false);
    };
    package.abort_and_join(ProcessorError::SegmentReleased(segment_id)).await;
    if let Some(sibling_package) = self.work_packages.remove(&sibling_id) {
      sibling_package.abort_and_join(ProcessorError::SegmentReleased(sibling_id)).await;
    }

    // Claim both rows: reads the persisted tokens and authorizes the
    // delete of the half that goes away.
    let token = match self.settings.store.fetch_token(&name, segment_id).await {
      Ok(token) => token,
      Err(err) => {
        warn!(processor = %name, segment = segment_id, error = %err, "failed to reclaim segment for merge");
        self.claims_dirty = true;
        return Ok(false);
      }
    };
    let sibling_token = match self.settings.store.fetch_token(&name, sibling_id).await {
      Ok(token) => token,
      Err(err) => {
        warn!(processor = %name, segment = sibling_id, error = %err, "failed to claim merge sibling");
        let _ = self.settings.store.release_claim(&name, segment_id).await;
        self.claims_dirty = true;
        return Ok(false);
      }
    };

    let keep = merged.id();
    let remove = segment_id.max(sibling_id);
    let merged_token = match (token, sibling_token) {
      (Some(ours), Some(theirs)) => ours.lower_bound(theirs),
      // Either half without progress drags the merge back to the start.
      _ => TrackingToken::BEGINNING,
    };

    if let Err(err) = self.settings.store.delete_token(&name, remove).await {
      warn!(processor = %name, segment = remove, error = %err, "failed to delete merged segment row");
      let _ = self.settings.store.release_claim(&name, segment_id).await;
      let _ = self.settings.store.release_claim(&name, sibling_id).await;
      self.claims_dirty = true;
      return Ok(false);
    }
    if let Err(err) = self.settings.store.store_token(merged_token, &name, keep).await {
      warn!(processor = %name, segment = keep, error = %err, "failed to store merged token");
    }
    let _ = self.settings.store.release_claim(&name, keep).await;
    self.holddowns.remove(&keep);
    self.claims_dirty = true;
    info!(processor = %name, segment = keep, removed = remove, "segments merged");
    Ok(true)
  }

  /// Sleeps until something needs the coordinator: a wake signal
  /// (availability callback, package drain, shutdown), a control
  /// instruction, the next claim sweep, or the poll cadence for
  /// poll-only sources.
  async fn idle_wait(&mut self) {
    if self.claims_dirty || self.dispatch_saturated {
      return;
    }
    let now = Instant::now();
    let next_sweep = self
      .last_sweep
      .map(|at| at + self.settings.token_claim_interval)
      .unwrap_or(now);
    let mut deadline = next_sweep;
    if !self.push_notifications && self.stream.is_some() {
      deadline = deadline.min(now + POLL_INTERVAL);
    }
    let sleep_for = deadline.saturating_duration_since(now);
    if sleep_for.is_zero() {
      return;
    }
    self.wait_for(sleep_for).await;
  }

  async fn wait_for(&mut self, duration: Duration) {
    tokio::select! {
      _ = self.settings.wake.notified() => {}
      instruction = self.control_rx.recv() => match instruction {
        Some(instruction) => self.pending_instructions.push_back(instruction),
        // The facade was dropped without a shutdown; wind down.
        None => self.settings.shared.request_shutdown(),
      },
      _ = tokio::time::sleep(duration) => {}
    }
  }

  async fn shutdown(mut self, done: oneshot::Sender<()>) {
    info!(processor = %self.settings.name, "coordinator shutting down");
    let packages: Vec<WorkPackage> = self.work_packages.drain().map(|(_, package)| package).collect();
    futures::future::join_all(
      packages
        .into_iter()
        .map(|package| package.abort_and_join(ProcessorError::ShuttingDown)),
    )
    .await;
    self.stream = None;

    // Answer outstanding control instructions so callers do not hang.
    loop {
      let Some(instruction) = self.pending_instructions.pop_front().or_else(|| self.control_rx.try_recv().ok())
      else {
        break;
      };
      match instruction {
        CoordinatorInstruction::SplitSegment { reply, .. }
        | CoordinatorInstruction::MergeSegment { reply, .. } => {
          let _ = reply.send(Err(ProcessorError::ShuttingDown));
        }
        CoordinatorInstruction::ReleaseSegment { .. } => {}
      }
    }

    self.settings.shared.set_state(ProcessorState::Stopped);
    let _ = done.send(());
    info!(processor = %self.settings.name, "coordinator stopped");
  }
}
