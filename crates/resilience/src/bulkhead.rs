//! Bulkhead policy for isolating concurrent calls to a dependency
//!
//! A bulkhead caps in-flight executions at `max_parallelism` with a counting
//! semaphore. Calls that find every slot busy wait in a bounded FIFO queue of
//! `max_queue_length` entries, drained by one background worker per
//! bulkhead. A call arriving while the queue is full is refused with
//! [`ResilienceError::BulkheadRejected`] according to the configured
//! [`OverflowPolicy`].
//!
//! Admission is not strictly fair: a call that arrives exactly when a slot
//! frees takes the non-blocking fast path and may run before calls already
//! waiting in the queue.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{BulkheadRejection, ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// What happens to a call that arrives while the wait queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the arriving call; queued calls keep their place
    #[default]
    RejectNewest,
    /// Evict the oldest queued call and admit the arriving one
    DropOldest,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RejectNewest => f.write_str("reject_newest"),
            Self::DropOldest => f.write_str("drop_oldest"),
        }
    }
}

/// Validated, immutable bulkhead options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadOptions {
    max_parallelism: usize,
    max_queue_length: usize,
    overflow: OverflowPolicy,
}

impl Default for BulkheadOptions {
    fn default() -> Self {
        Self { max_parallelism: 10, max_queue_length: 20, overflow: OverflowPolicy::RejectNewest }
    }
}

impl BulkheadOptions {
    /// Create a builder seeded with the defaults
    pub fn builder() -> BulkheadOptionsBuilder {
        BulkheadOptionsBuilder::new()
    }

    /// Calls allowed to run at once
    pub const fn max_parallelism(&self) -> usize {
        self.max_parallelism
    }

    /// Calls allowed to wait for a slot
    pub const fn max_queue_length(&self) -> usize {
        self.max_queue_length
    }

    /// What happens to an arrival when the queue is full
    pub const fn overflow(&self) -> OverflowPolicy {
        self.overflow
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_parallelism == 0 {
            return Err(ConfigError::invalid("max_parallelism must be greater than 0"));
        }
        if self.max_parallelism > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(format!(
                "max_parallelism must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(())
    }
}

/// Builder for [`BulkheadOptions`]
#[derive(Debug, Default)]
pub struct BulkheadOptionsBuilder {
    options: BulkheadOptions,
}

impl BulkheadOptionsBuilder {
    /// Start from the defaults: 10 slots, 20 queue positions, reject newest
    pub fn new() -> Self {
        Self { options: BulkheadOptions::default() }
    }

    /// Set the number of concurrent executions (at least 1)
    pub fn max_parallelism(mut self, max: usize) -> Self {
        self.options.max_parallelism = max;
        self
    }

    /// Set the wait queue capacity; 0 disables queuing
    pub fn max_queue_length(mut self, max: usize) -> Self {
        self.options.max_queue_length = max;
        self
    }

    /// Set the overflow behaviour
    pub fn overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.options.overflow = overflow;
        self
    }

    /// Validate and build the options
    pub fn build(self) -> ConfigResult<BulkheadOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

/// Point-in-time bulkhead statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkheadStatistics {
    /// Bulkhead name
    pub name: String,
    /// Configured slot count
    pub max_parallelism: usize,
    /// Configured queue capacity
    pub max_queue_length: usize,
    /// Configured overflow behaviour
    pub overflow: OverflowPolicy,
    /// Calls running now
    pub current_parallelism: usize,
    /// Calls waiting now
    pub current_queue_length: usize,
    /// Every submitted call, including rejected ones
    pub total_executions: u64,
    /// Calls refused or evicted
    pub rejected_executions: u64,
    /// Calls that had to wait in the queue
    pub queued_executions: u64,
    /// Subset of `rejected_executions` evicted under [`OverflowPolicy::DropOldest`]
    pub evicted_executions: u64,
}

impl BulkheadStatistics {
    /// Share of submitted calls that were refused (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        if self.total_executions == 0 {
            return 0.0;
        }
        self.rejected_executions as f64 / self.total_executions as f64
    }

    /// Share of slots in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_parallelism as f64 / self.max_parallelism as f64
    }

    /// True when every slot is taken
    pub const fn is_at_capacity(&self) -> bool {
        self.current_parallelism >= self.max_parallelism
    }
}

impl fmt::Display for BulkheadStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bulkhead '{}': {}/{} in flight ({:.1}% utilized), {}/{} queued, {} rejected",
            self.name,
            self.current_parallelism,
            self.max_parallelism,
            self.utilization() * 100.0,
            self.current_queue_length,
            self.max_queue_length,
            self.rejected_executions
        )
    }
}

type Job = Box<dyn FnOnce(ActiveSlot) -> BoxFuture<'static, ()> + Send>;

/// Why a job never made it into the wait queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refused {
    QueueFull,
    ShutDown,
}

struct QueuedExecution {
    id: u64,
    job: Job,
}

#[derive(Default)]
struct BulkheadState {
    queue: VecDeque<QueuedExecution>,
    next_id: u64,
    active: usize,
    total_executions: u64,
    rejected_executions: u64,
    queued_executions: u64,
    evicted_executions: u64,
}

struct Shared {
    name: String,
    options: BulkheadOptions,
    semaphore: Arc<Semaphore>,
    state: Mutex<BulkheadState>,
    queue_ready: Notify,
    shutdown: CancellationToken,
}

/// Holds one semaphore slot for the lifetime of an execution
struct ActiveSlot {
    shared: Arc<Shared>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.active = state.active.saturating_sub(1);
    }
}

/// Removes a caller's queue entry if the caller stops waiting
struct QueueTicket<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut state = self.shared.state.lock();
            let position = state.queue.iter().position(|entry| entry.id == self.id);
            position.and_then(|i| state.queue.remove(i))
        };
        if abandoned.is_some() {
            debug!(name = %self.shared.name, "Queued call abandoned before dispatch");
        }
    }
}

impl Shared {
    fn occupy(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> ActiveSlot {
        let mut state = self.state.lock();
        state.active += 1;
        state.total_executions += 1;
        ActiveSlot { shared: Arc::clone(self), _permit: permit }
    }

    /// Shutdown is checked under the state lock, the same lock `shutdown`
    /// holds while it cancels and drains, so a job is either drained or
    /// refused, never stranded.
    fn enqueue(&self, job: Job) -> Result<u64, Refused> {
        let (id, evicted) = {
            let mut state = self.state.lock();
            if self.shutdown.is_cancelled() {
                return Err(Refused::ShutDown);
            }
            state.total_executions += 1;

            let mut evicted = None;
            if state.queue.len() >= self.options.max_queue_length {
                let oldest = match self.options.overflow {
                    OverflowPolicy::DropOldest => state.queue.pop_front(),
                    OverflowPolicy::RejectNewest => None,
                };
                state.rejected_executions += 1;
                match oldest {
                    Some(oldest) => {
                        state.evicted_executions += 1;
                        evicted = Some(oldest);
                    }
                    None => return Err(Refused::QueueFull),
                }
            }

            let id = state.next_id;
            state.next_id += 1;
            state.queue.push_back(QueuedExecution { id, job });
            state.queued_executions += 1;
            (id, evicted)
        };

        // Dropping the job closes its result channel outside the lock.
        if let Some(evicted) = evicted {
            warn!(
                name = %self.name,
                evicted_id = evicted.id,
                "Bulkhead queue full, evicting oldest queued call"
            );
            drop(evicted);
        }
        self.queue_ready.notify_one();
        Ok(id)
    }

    fn dequeue(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> Option<(Job, ActiveSlot)> {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.queue.pop_front()?;
            state.active += 1;
            entry
        };
        Some((entry.job, ActiveSlot { shared: Arc::clone(self), _permit: permit }))
    }

    async fn wait_for_work(&self) -> bool {
        loop {
            if self.shutdown.is_cancelled() {
                return false;
            }
            let pending = !self.state.lock().queue.is_empty();
            if pending {
                return true;
            }
            tokio::select! {
                () = self.queue_ready.notified() => {}
                () = self.shutdown.cancelled() => return false,
            }
        }
    }

    fn rejected<E>(&self, reason: BulkheadRejection) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceError::BulkheadRejected { name: self.name.clone(), reason }
    }
}

/// Drains the wait queue in FIFO order, one semaphore slot per dispatch
async fn drain_queue(shared: Arc<Shared>) {
    while shared.wait_for_work().await {
        let permit = tokio::select! {
            permit = Arc::clone(&shared.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            () = shared.shutdown.cancelled() => break,
        };

        // The entry may have been cancelled or evicted while we waited.
        let Some((job, slot)) = shared.dequeue(permit) else {
            continue;
        };
        debug!(name = %shared.name, "Dispatching queued call");
        tokio::spawn(job(slot));
    }
    debug!(name = %shared.name, "Bulkhead worker stopped");
}

/// Concurrency limiter with a bounded wait queue
///
/// # Examples
///
/// ```rust
/// use marketplace_resilience::bulkhead::{BulkheadOptions, BulkheadPolicy};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let options = BulkheadOptions::builder().max_parallelism(5).max_queue_length(10).build()?;
/// let bulkhead = BulkheadPolicy::new("payments", options);
///
/// let receipt = bulkhead.execute(|| async { Ok::<_, std::io::Error>("charged") }).await?;
/// # assert_eq!(receipt, "charged");
/// bulkhead.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct BulkheadPolicy {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BulkheadPolicy {
    /// Create a bulkhead and start its queue worker.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(name: impl Into<String>, options: BulkheadOptions) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            semaphore: Arc::new(Semaphore::new(options.max_parallelism)),
            options,
            state: Mutex::new(BulkheadState::default()),
            queue_ready: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let worker = tokio::spawn(drain_queue(Arc::clone(&shared)));

        Self { shared, worker: Mutex::new(Some(worker)) }
    }

    /// Bulkhead name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Options the bulkhead was built with
    pub fn options(&self) -> &BulkheadOptions {
        &self.shared.options
    }

    /// True once [`shutdown`](Self::shutdown) has begun
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Execute an operation inside the bulkhead.
    ///
    /// Queued operations run on the worker pool, hence the `Send + 'static`
    /// bounds.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(move || async move { operation().await.map_err(ResilienceError::operation) }, None)
            .await
    }

    /// Like [`execute`](Self::execute), but hands a full-queue rejection or an
    /// eviction to `fallback`
    pub async fn execute_with_fallback<F, Fut, FB, FbFut, T, E>(
        &self,
        operation: F,
        fallback: FB,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        FB: FnOnce(ResilienceError<E>) -> FbFut,
        FbFut: Future<Output = ResilienceResult<T, E>>,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        match self.execute(operation).await {
            Err(rejection @ ResilienceError::BulkheadRejected { .. }) => {
                debug!(policy = "bulkhead", name = %self.shared.name, "Invoking fallback");
                fallback(rejection).await
            }
            outcome => outcome,
        }
    }

    /// Execute, giving up with [`ResilienceError::Cancelled`] if `token`
    /// fires while the call is still queued
    pub async fn execute_cancellable<F, Fut, T, E>(
        &self,
        operation: F,
        token: &CancellationToken,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(
            move || async move { operation().await.map_err(ResilienceError::operation) },
            Some(token),
        )
        .await
    }

    /// Execute an operation whose errors are already resilience errors
    pub async fn execute_wrapped<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run(operation, None).await
    }

    #[instrument(skip(self, operation, cancel), fields(name = %self.shared.name))]
    async fn run<F, Fut, T, E>(
        &self,
        operation: F,
        cancel: Option<&CancellationToken>,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ResilienceResult<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(ResilienceError::ShutDown { name: shared.name.clone() });
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(ResilienceError::Cancelled);
        }

        if let Ok(permit) = Arc::clone(&shared.semaphore).try_acquire_owned() {
            let slot = shared.occupy(permit);
            debug!("Bulkhead slot acquired");
            let result = operation().await;
            drop(slot);
            return result;
        }

        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move |slot: ActiveSlot| {
            async move {
                let outcome = AssertUnwindSafe(operation()).catch_unwind().await;
                drop(slot);
                // The caller may have stopped waiting.
                let _ = sender.send(outcome);
            }
            .boxed()
        });

        let id = match shared.enqueue(job) {
            Ok(id) => id,
            Err(Refused::QueueFull) => {
                warn!(reason = %BulkheadRejection::QueueFull, "Bulkhead rejected call");
                return Err(shared.rejected(BulkheadRejection::QueueFull));
            }
            Err(Refused::ShutDown) => {
                return Err(ResilienceError::ShutDown { name: shared.name.clone() });
            }
        };
        let _ticket = QueueTicket { shared, id };
        debug!(queued_id = id, "Bulkhead full, call queued");

        let received = match cancel {
            Some(token) => tokio::select! {
                received = receiver => received,
                () = token.cancelled() => {
                    debug!("Queued call cancelled");
                    return Err(ResilienceError::Cancelled);
                }
            },
            None => receiver.await,
        };

        match received {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            // The worker only drops a queued job on shutdown or eviction.
            Err(_) if shared.shutdown.is_cancelled() => {
                Err(ResilienceError::ShutDown { name: shared.name.clone() })
            }
            Err(_) => Err(shared.rejected(BulkheadRejection::Evicted)),
        }
    }

    /// Consistent snapshot of the statistics
    pub fn statistics(&self) -> BulkheadStatistics {
        let options = &self.shared.options;
        let state = self.shared.state.lock();
        BulkheadStatistics {
            name: self.shared.name.clone(),
            max_parallelism: options.max_parallelism,
            max_queue_length: options.max_queue_length,
            overflow: options.overflow,
            current_parallelism: state.active,
            current_queue_length: state.queue.len(),
            total_executions: state.total_executions,
            rejected_executions: state.rejected_executions,
            queued_executions: state.queued_executions,
            evicted_executions: state.evicted_executions,
        }
    }

    /// Zero the counters; in-flight and queued calls are untouched
    pub fn reset_statistics(&self) {
        {
            let mut state = self.shared.state.lock();
            state.total_executions = 0;
            state.rejected_executions = 0;
            state.queued_executions = 0;
            state.evicted_executions = 0;
        }
        debug!(name = %self.shared.name, "Bulkhead statistics reset");
    }

    /// Stop the queue worker.
    ///
    /// Calls still queued complete with [`ResilienceError::ShutDown`], as do
    /// calls submitted afterwards. Calls already running finish normally.
    pub async fn shutdown(&self) {
        let drained: Vec<QueuedExecution> = {
            let mut state = self.shared.state.lock();
            self.shared.shutdown.cancel();
            state.queue.drain(..).collect()
        };
        let drained_count = drained.len();
        drop(drained);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(error) = worker.await {
                warn!(name = %self.shared.name, "Bulkhead worker ended abnormally: {}", error);
            }
        }
        info!(name = %self.shared.name, drained = drained_count, "Bulkhead shut down");
    }
}

impl Drop for BulkheadPolicy {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl fmt::Debug for BulkheadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.statistics();
        f.debug_struct("BulkheadPolicy")
            .field("name", &stats.name)
            .field("max_parallelism", &stats.max_parallelism)
            .field("max_queue_length", &stats.max_queue_length)
            .field("current_parallelism", &stats.current_parallelism)
            .field("current_queue_length", &stats.current_queue_length)
            .finish()
    }
}
