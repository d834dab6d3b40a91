//! # Pooled Streaming Processor
//!
//! The public face of the crate: a processor consumes one append-only
//! event stream, partitions it into independently advancing segments,
//! and dispatches events to the configured handler with at-least-once
//! delivery per segment. Segment ownership is arbitrated through the
//! token store, so any number of processor instances across a fleet can
//! share the work without double-processing a segment.
//!
//! Build a processor through [`PooledStreamingProcessor::builder`],
//! `start()` it, and administer it through the split / merge / release
//! / reset operations. Shutting down is idempotent and releases every
//! claim so other nodes can take over immediately.

mod coordinator;
mod work_package;


use crate::error::ProcessorError;
use crate::handler::{EventHandlerInvoker, InvokerError};
use crate::source::{InitialTokenPolicy, StreamableEventSource};
use crate::status::SegmentStatus;
use crate::store::TokenStore;
use crate::token::TrackingToken;
use crate::transaction::TransactionManager;
use coordinator::{Coordinator, CoordinatorInstruction, CoordinatorSettings};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify, OnceCell};
use tracing::{debug, info};
use work_package::WorkerContext;

/// Default number of segments created on first initialization.
pub const DEFAULT_INITIAL_SEGMENT_COUNT: usize = 16;
/// Default pause between claim sweeps.
pub const DEFAULT_TOKEN_CLAIM_INTERVAL: Duration = Duration::from_secs(5);
/// Default idle period after which a work package refreshes its claim.
pub const DEFAULT_CLAIM_EXTENSION_THRESHOLD: Duration = Duration::from_secs(5);
/// Default number of events handled per transaction.
pub const DEFAULT_BATCH_SIZE: usize = 1;
/// Default cap on segments claimed by one processor instance.
pub const DEFAULT_MAX_CLAIMED_SEGMENTS: usize = i16::MAX as usize;

pub(crate) type StatusMap = Arc<RwLock<HashMap<u32, SegmentStatus>>>;

/// Decides whether a handler failure rolls the batch transaction back.
#[derive(Clone, Default)]
pub enum RollbackConfiguration {
  /// Roll back on every handler error.
  #[default]
  AnyError,
  /// Never roll back; progress up to the failing event is committed.
  Never,
  /// Roll back when the predicate returns `true` for the error.
  Custom(Arc<dyn Fn(&InvokerError) -> bool + Send + Sync>),
}

impl RollbackConfiguration {
  /// Whether `error` requires the batch to be rolled back.
  #[must_use]
  pub fn should_rollback(&self, error: &InvokerError) -> bool {
    match self {
      RollbackConfiguration::AnyError => true,
      RollbackConfiguration::Never => false,
      RollbackConfiguration::Custom(predicate) => predicate(error),
    }
  }
}

impl fmt::Debug for RollbackConfiguration {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RollbackConfiguration::AnyError => write!(f, "RollbackConfiguration::AnyError"),
      RollbackConfiguration::Never => write!(f, "RollbackConfiguration::Never"),
      RollbackConfiguration::Custom(_) => write!(f, "RollbackConfiguration::Custom"),
    }
  }
}

/// What a work package does with a handler failure after the rollback
/// decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ErrorHandlerPolicy {
  /// Propagate: abort the work package, leaving the segment to be
  /// reclaimed after the claim expires.
  #[default]
  Propagate,
  /// Log the failure and continue with the next event.
  Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessorState {
  NotStarted,
  Running,
  ShuttingDown,
  Stopped,
}

/// State shared between the facade and the coordinator task.
pub(crate) struct ProcessorShared {
  state: Mutex<ProcessorState>,
  error: AtomicBool,
  status: StatusMap,
}

impl ProcessorShared {
  fn new() -> Self {
    Self {
      state: Mutex::new(ProcessorState::NotStarted),
      error: AtomicBool::new(false),
      status: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  pub(crate) fn state(&self) -> ProcessorState {
    self.state.lock().map(|state| *state).unwrap_or(ProcessorState::Stopped)
  }

  pub(crate) fn set_state(&self, state: ProcessorState) {
    if let Ok(mut slot) = self.state.lock() {
      *slot = state;
    }
  }

  pub(crate) fn is_shutting_down(&self) -> bool {
    self.state() == ProcessorState::ShuttingDown
  }

  pub(crate) fn request_shutdown(&self) {
    if let Ok(mut slot) = self.state.lock() {
      if *slot == ProcessorState::Running {
        *slot = ProcessorState::ShuttingDown;
      }
    }
  }

  pub(crate) fn mark_error(&self) {
    self.error.store(true, Ordering::SeqCst);
  }

  /// Clears the error flag, returning whether it was set.
  pub(crate) fn clear_error(&self) -> bool {
    self.error.swap(false, Ordering::SeqCst)
  }

  pub(crate) fn is_error(&self) -> bool {
    self.error.load(Ordering::SeqCst)
  }
}

type ShutdownFuture = Shared<BoxFuture<'static, ()>>;

/// Concurrent, segment-partitioned event processor.
pub struct PooledStreamingProcessor {
  name: Arc<str>,
  store: Arc<dyn TokenStore>,
  source: Arc<dyn StreamableEventSource>,
  invoker: Arc<dyn EventHandlerInvoker>,
  transactions: Arc<dyn TransactionManager>,
  rollback: RollbackConfiguration,
  error_policy: ErrorHandlerPolicy,
  initial_segment_count: usize,
  initial_token_policy: InitialTokenPolicy,
  token_claim_interval: Duration,
  claim_extension_threshold: Duration,
  batch_size: usize,
  max_claimed_segments: usize,
  coordinator_handle: Handle,
  worker_handle: Handle,
  shared: Arc<ProcessorShared>,
  wake: Arc<Notify>,
  control_tx: Mutex<Option<mpsc::UnboundedSender<CoordinatorInstruction>>>,
  shutdown_future: Mutex<Option<ShutdownFuture>>,
  store_identifier: OnceCell<Option<String>>,
}

impl PooledStreamingProcessor {
  /// Returns a builder for configuring a processor.
  #[must_use]
  pub fn builder() -> ProcessorBuilder {
    ProcessorBuilder::new()
  }

  /// The logical processor name, keying its rows in the token store.
  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Starts the processor. A second `start()` on a running processor is
  /// a no-op; starting while a shutdown is in progress is an error.
  pub fn start(&self) -> Result<(), ProcessorError> {
    {
      let mut state = self
        .shared
        .state
        .lock()
        .map_err(|_| ProcessorError::IllegalState("processor state poisoned"))?;
      match *state {
        ProcessorState::Running => return Ok(()),
        ProcessorState::ShuttingDown => {
          return Err(ProcessorError::IllegalState("cannot start while shutting down"));
        }
        ProcessorState::NotStarted | ProcessorState::Stopped => {}
      }
      *state = ProcessorState::Running;
    }
    self.shared.clear_error();

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    if let Ok(mut slot) = self.control_tx.lock() {
      *slot = Some(control_tx);
    }
    if let Ok(mut slot) = self.shutdown_future.lock() {
      *slot = Some(
        async move {
          let _ = done_rx.await;
        }
        .boxed()
        .shared(),
      );
    }

    let settings = CoordinatorSettings {
      name: Arc::clone(&self.name),
      store: Arc::clone(&self.store),
      source: Arc::clone(&self.source),
      worker_ctx: self.worker_context(),
      worker_handle: self.worker_handle.clone(),
      token_claim_interval: self.token_claim_interval,
      initial_segment_count: self.initial_segment_count,
      initial_token_policy: self.initial_token_policy.clone(),
      max_claimed_segments: self.max_claimed_segments,
      shared: Arc::clone(&self.shared),
      wake: Arc::clone(&self.wake),
    };
    info!(processor = %self.name, "starting processor");
    self.coordinator_handle.spawn(Coordinator::new(settings, control_rx).run(done_tx));
    Ok(())
  }

  fn worker_context(&self) -> WorkerContext {
    WorkerContext {
      processor_name: Arc::clone(&self.name),
      store: Arc::clone(&self.store),
      invoker: Arc::clone(&self.invoker),
      transactions: Arc::clone(&self.transactions),
      rollback: self.rollback.clone(),
      error_policy: self.error_policy,
      batch_size: self.batch_size,
      claim_extension_threshold: self.claim_extension_threshold,
      status: Arc::clone(&self.shared.status),
      coordinator_wake: Arc::clone(&self.wake),
    }
  }

  /// Initiates a shutdown and returns a future completing once every
  /// work package has stopped and every claim has been released. The
  /// call is idempotent: repeated calls observe the same completion
  /// until the processor is started again. A processor that never
  /// started completes immediately.
  pub fn shutdown_async(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
    let requested = {
      let state = self.shared.state();
      state == ProcessorState::Running
    };
    if requested {
      info!(processor = %self.name, "shutdown requested");
      self.shared.request_shutdown();
      self.wake.notify_one();
    }
    let pending = match self.shared.state() {
      ProcessorState::ShuttingDown => {
        self.shutdown_future.lock().ok().and_then(|slot| slot.as_ref().cloned())
      }
      _ => None,
    };
    async move {
      if let Some(done) = pending {
        done.await;
      }
    }
  }

  /// Shuts the processor down and waits for completion.
  pub async fn shut_down(&self) {
    self.shutdown_async().await;
  }

  /// True while the processor is running (and not yet shutting down).
  #[must_use]
  pub fn is_running(&self) -> bool {
    self.shared.state() == ProcessorState::Running
  }

  /// True while the coordinator is paused after a transient fault.
  #[must_use]
  pub fn is_error(&self) -> bool {
    self.shared.is_error()
  }

  /// Snapshot of every claimed segment's progress.
  #[must_use]
  pub fn processing_status(&self) -> HashMap<u32, SegmentStatus> {
    self.shared.status.read().map(|status| status.clone()).unwrap_or_default()
  }

  /// True while any claimed segment is replaying after a token reset.
  #[must_use]
  pub fn is_replaying(&self) -> bool {
    self
      .processing_status()
      .values()
      .any(|status| status.replaying)
  }

  /// Releases a segment so another node can claim it. The segment stays
  /// locally unclaimable for twice the token claim interval.
  pub fn release_segment(&self, segment_id: u32) {
    if !self.send_instruction(CoordinatorInstruction::ReleaseSegment { segment_id }) {
      debug!(processor = %self.name, segment = segment_id, "release ignored: processor not running");
    }
  }

  /// Splits a segment in two, doubling its depth. Resolves to `true` on
  /// success and `false` when this node does not own the segment or the
  /// sibling row could not be created.
  pub async fn split_segment(&self, segment_id: u32) -> Result<bool, ProcessorError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    if !self.send_instruction(CoordinatorInstruction::SplitSegment { segment_id, reply: reply_tx }) {
      return Err(ProcessorError::IllegalState("processor is not running"));
    }
    reply_rx.await.map_err(|_| ProcessorError::ShuttingDown)?
  }

  /// Merges a segment with its sibling. Resolves to `true` on success
  /// and `false` when this node cannot own both halves.
  pub async fn merge_segment(&self, segment_id: u32) -> Result<bool, ProcessorError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    if !self.send_instruction(CoordinatorInstruction::MergeSegment { segment_id, reply: reply_tx }) {
      return Err(ProcessorError::IllegalState("processor is not running"));
    }
    reply_rx.await.map_err(|_| ProcessorError::ShuttingDown)?
  }

  fn send_instruction(&self, instruction: CoordinatorInstruction) -> bool {
    if !self.is_running() {
      return false;
    }
    let sent = self
      .control_tx
      .lock()
      .ok()
      .and_then(|slot| slot.as_ref().map(|tx| tx.send(instruction).is_ok()))
      .unwrap_or(false);
    if sent {
      self.wake.notify_one();
    }
    sent
  }

  /// Whether the configured handler supports [`Self::reset_tokens`].
  #[must_use]
  pub fn supports_reset(&self) -> bool {
    self.invoker.supports_reset()
  }

  /// Resets every segment to the configured initial position.
  pub async fn reset_tokens(&self) -> Result<(), ProcessorError> {
    self.reset_internal(None, None).await
  }

  /// Resets every segment to the configured initial position, passing
  /// `context` to the handler's reset hook.
  pub async fn reset_tokens_with_context(
    &self,
    context: serde_json::Value,
  ) -> Result<(), ProcessorError> {
    self.reset_internal(None, Some(context)).await
  }

  /// Resets every segment to the position selected by `policy`.
  pub async fn reset_tokens_from(&self, policy: InitialTokenPolicy) -> Result<(), ProcessorError> {
    self.reset_internal(Some(policy), None).await
  }

  /// Resets every segment to the position selected by `policy`, passing
  /// `context` to the handler's reset hook.
  pub async fn reset_tokens_from_with_context(
    &self,
    policy: InitialTokenPolicy,
    context: serde_json::Value,
  ) -> Result<(), ProcessorError> {
    self.reset_internal(Some(policy), Some(context)).await
  }

  /// Claims every segment, wraps its token in a replay marker at the
  /// target position, and invokes the handler's reset hook. Only
  /// permitted while the processor is stopped.
  async fn reset_internal(
    &self,
    policy: Option<InitialTokenPolicy>,
    context: Option<serde_json::Value>,
  ) -> Result<(), ProcessorError> {
    if !self.supports_reset() {
      return Err(ProcessorError::Unsupported("event handler does not support reset"));
    }
    match self.shared.state() {
      ProcessorState::NotStarted | ProcessorState::Stopped => {}
      _ => return Err(ProcessorError::IllegalState("processor must be shut down to reset tokens")),
    }

    let policy = policy.unwrap_or_else(|| self.initial_token_policy.clone());
    let target = policy.resolve(self.source.as_ref()).await?;
    let segments = self.store.fetch_segments(&self.name).await?;

    let mut claimed: Vec<(u32, Option<TrackingToken>)> = Vec::with_capacity(segments.len());
    for &segment_id in &segments {
      match self.store.fetch_token(&self.name, segment_id).await {
        Ok(token) => claimed.push((segment_id, token)),
        Err(err) => {
          self.release_claims(&claimed).await;
          return Err(err.into());
        }
      }
    }

    if let Err(err) = self.invoker.perform_reset(context).await {
      self.release_claims(&claimed).await;
      return Err(err.into());
    }

    for &(segment_id, current) in &claimed {
      if let Some(token) = TrackingToken::replay_from(Some(target), current) {
        if let Err(err) = self.store.store_token(token, &self.name, segment_id).await {
          self.release_claims(&claimed).await;
          return Err(err.into());
        }
      }
    }
    self.release_claims(&claimed).await;
    info!(processor = %self.name, target = %target, "tokens reset");
    Ok(())
  }

  async fn release_claims(&self, claimed: &[(u32, Option<TrackingToken>)]) {
    for (segment_id, _) in claimed {
      let _ = self.store.release_claim(&self.name, *segment_id).await;
    }
  }

  /// The per-node cap on concurrently claimed segments.
  #[must_use]
  pub fn max_capacity(&self) -> usize {
    self.max_claimed_segments
  }

  /// The stable identifier of the backing token store, fetched once and
  /// cached.
  pub async fn token_store_identifier(&self) -> Result<Option<String>, ProcessorError> {
    let identifier = self
      .store_identifier
      .get_or_try_init(|| async { self.store.storage_identifier().await })
      .await?;
    Ok(identifier.clone())
  }
}

impl fmt::Debug for PooledStreamingProcessor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PooledStreamingProcessor")
      .field("name", &self.name)
      .field("state", &self.shared.state())
      .field("batch_size", &self.batch_size)
      .field("initial_segment_count", &self.initial_segment_count)
      .finish()
  }
}

/// Builder for [`PooledStreamingProcessor`].
///
/// The name, event source, token store, handler invoker, transaction
/// manager and both runtimes are required; everything else has the
/// documented default. Validation failures surface as
/// [`ProcessorError::Configuration`] naming the offending option.
pub struct ProcessorBuilder {
  name: Option<String>,
  source: Option<Arc<dyn StreamableEventSource>>,
  store: Option<Arc<dyn TokenStore>>,
  invoker: Option<Arc<dyn EventHandlerInvoker>>,
  transactions: Option<Arc<dyn TransactionManager>>,
  coordinator_runtime: Option<Handle>,
  worker_runtime: Option<Handle>,
  rollback: RollbackConfiguration,
  error_policy: ErrorHandlerPolicy,
  initial_segment_count: usize,
  initial_token_policy: InitialTokenPolicy,
  token_claim_interval: Duration,
  claim_extension_threshold: Duration,
  batch_size: usize,
  max_claimed_segments: usize,
}

impl ProcessorBuilder {
  fn new() -> Self {
    Self {
      name: None,
      source: None,
      store: None,
      invoker: None,
      transactions: None,
      coordinator_runtime: None,
      worker_runtime: None,
      rollback: RollbackConfiguration::default(),
      error_policy: ErrorHandlerPolicy::default(),
      initial_segment_count: DEFAULT_INITIAL_SEGMENT_COUNT,
      initial_token_policy: InitialTokenPolicy::default(),
      token_claim_interval: DEFAULT_TOKEN_CLAIM_INTERVAL,
      claim_extension_threshold: DEFAULT_CLAIM_EXTENSION_THRESHOLD,
      batch_size: DEFAULT_BATCH_SIZE,
      max_claimed_segments: DEFAULT_MAX_CLAIMED_SEGMENTS,
    }
  }

  /// Sets the logical processor name (required).
  #[must_use]
  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  /// Sets the upstream event source (required).
  #[must_use]
  pub fn message_source<S>(mut self, source: S) -> Self
  where
    S: StreamableEventSource + 'static,
  {
    self.source = Some(Arc::new(source));
    self
  }

  /// Sets the token store (required).
  #[must_use]
  pub fn token_store<S>(mut self, store: S) -> Self
  where
    S: TokenStore + 'static,
  {
    self.store = Some(Arc::new(store));
    self
  }

  /// Sets the event handler invoker (required).
  #[must_use]
  pub fn event_handler_invoker<I>(mut self, invoker: I) -> Self
  where
    I: EventHandlerInvoker + 'static,
  {
    self.invoker = Some(Arc::new(invoker));
    self
  }

  /// Sets the transaction manager wrapping each batch (required).
  #[must_use]
  pub fn transaction_manager<T>(mut self, transactions: T) -> Self
  where
    T: TransactionManager + 'static,
  {
    self.transactions = Some(Arc::new(transactions));
    self
  }

  /// Sets the runtime hosting the coordinator task (required).
  #[must_use]
  pub fn coordinator_runtime(mut self, handle: Handle) -> Self {
    self.coordinator_runtime = Some(handle);
    self
  }

  /// Sets the runtime hosting the work package tasks (required).
  #[must_use]
  pub fn worker_runtime(mut self, handle: Handle) -> Self {
    self.worker_runtime = Some(handle);
    self
  }

  /// Sets the rollback decision for handler failures. Defaults to
  /// rolling back on any error.
  #[must_use]
  pub fn rollback_configuration(mut self, rollback: RollbackConfiguration) -> Self {
    self.rollback = rollback;
    self
  }

  /// Sets the processor-level error policy. Defaults to propagating,
  /// which aborts the failing segment's work package.
  #[must_use]
  pub fn error_handler(mut self, policy: ErrorHandlerPolicy) -> Self {
    self.error_policy = policy;
    self
  }

  /// Sets the number of segments created on first initialization.
  /// Defaults to 16.
  #[must_use]
  pub fn initial_segment_count(mut self, count: usize) -> Self {
    self.initial_segment_count = count;
    self
  }

  /// Sets where fresh segments start reading. Defaults to the beginning
  /// of the stream.
  #[must_use]
  pub fn initial_token(mut self, policy: InitialTokenPolicy) -> Self {
    self.initial_token_policy = policy;
    self
  }

  /// Sets the pause between claim sweeps. Defaults to 5 seconds.
  #[must_use]
  pub fn token_claim_interval(mut self, interval: Duration) -> Self {
    self.token_claim_interval = interval;
    self
  }

  /// Sets the idle period after which a work package refreshes its
  /// claim. Defaults to 5 seconds.
  #[must_use]
  pub fn claim_extension_threshold(mut self, threshold: Duration) -> Self {
    self.claim_extension_threshold = threshold;
    self
  }

  /// Sets the number of events handled per transaction. Defaults to 1.
  #[must_use]
  pub fn batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size;
    self
  }

  /// Sets the cap on segments claimed by this instance. Defaults to
  /// `i16::MAX`.
  #[must_use]
  pub fn max_claimed_segments(mut self, max: usize) -> Self {
    self.max_claimed_segments = max;
    self
  }

  /// Validates the configuration and builds the processor.
  pub fn build(self) -> Result<PooledStreamingProcessor, ProcessorError> {
    let name = self
      .name
      .filter(|name| !name.is_empty())
      .ok_or_else(|| configuration_error("name is required"))?;
    let source = self.source.ok_or_else(|| configuration_error("message_source is required"))?;
    let store = self.store.ok_or_else(|| configuration_error("token_store is required"))?;
    let invoker = self
      .invoker
      .ok_or_else(|| configuration_error("event_handler_invoker is required"))?;
    let transactions = self
      .transactions
      .ok_or_else(|| configuration_error("transaction_manager is required"))?;
    let coordinator_handle = self
      .coordinator_runtime
      .ok_or_else(|| configuration_error("coordinator_runtime is required"))?;
    let worker_handle = self
      .worker_runtime
      .ok_or_else(|| configuration_error("worker_runtime is required"))?;

    if self.initial_segment_count == 0 {
      return Err(configuration_error("initial_segment_count must be greater than zero"));
    }
    if self.batch_size == 0 {
      return Err(configuration_error("batch_size must be greater than zero"));
    }
    if self.max_claimed_segments == 0 {
      return Err(configuration_error("max_claimed_segments must be greater than zero"));
    }
    if self.token_claim_interval.is_zero() {
      return Err(configuration_error("token_claim_interval must be greater than zero"));
    }
    if self.claim_extension_threshold.is_zero() {
      return Err(configuration_error("claim_extension_threshold must be greater than zero"));
    }

    Ok(PooledStreamingProcessor {
      name: name.into(),
      store,
      source,
      invoker,
      transactions,
      rollback: self.rollback,
      error_policy: self.error_policy,
      initial_segment_count: self.initial_segment_count,
      initial_token_policy: self.initial_token_policy,
      token_claim_interval: self.token_claim_interval,
      claim_extension_threshold: self.claim_extension_threshold,
      batch_size: self.batch_size,
      max_claimed_segments: self.max_claimed_segments,
      coordinator_handle,
      worker_handle,
      shared: Arc::new(ProcessorShared::new()),
      wake: Arc::new(Notify::new()),
      control_tx: Mutex::new(None),
      shutdown_future: Mutex::new(None),
      store_identifier: OnceCell::new(),
    })
  }
}

fn configuration_error(message: &str) -> ProcessorError {
  ProcessorError::Configuration(message.to_string())
}
