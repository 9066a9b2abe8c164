//! Sequencer implementation

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::SequencerConfig;
use super::queue::{QueueEntry, QueueEntryStatus, QueueState, SequencerStats, UnitRole};
use super::unit::{DelayedUnit, UnitHandle, UnitOutcome, UnitState};

/// Suffix distinguishing a task's wait unit from its exec unit
pub const DELAY_SUFFIX: &str = "_delay";

/// A unit waiting in the worklist
struct QueuedUnit {
    unit: DelayedUnit,
    role: UnitRole,
    submitted_at: Instant,
}

/// The unit currently owned by the worker
struct RunningUnit {
    handle: UnitHandle,
    role: UnitRole,
    delay: Duration,
    started_at: Instant,
}

/// Internal state protected by mutex
struct SequencerInner {
    /// Units in submission order
    worklist: VecDeque<QueuedUnit>,

    /// Exec units by task id
    index: HashMap<String, UnitHandle>,

    running: Option<RunningUnit>,

    /// Gates whether the worker may start the next unit
    suspended: bool,

    stats: SequencerStats,
}

impl SequencerInner {
    fn push(&mut self, unit: DelayedUnit, role: UnitRole) {
        self.worklist.push_back(QueuedUnit {
            unit,
            role,
            submitted_at: Instant::now(),
        });
        self.stats.peak_queue_depth = self.stats.peak_queue_depth.max(self.worklist.len());
    }

    /// Take the first unit whose dependencies have finished, if the
    /// worklist may start anything at all
    fn next_ready(&mut self) -> Option<QueuedUnit> {
        if self.suspended || self.running.is_some() {
            return None;
        }

        let position = self.worklist.iter().position(|queued| queued.unit.is_ready())?;
        let queued = self.worklist.remove(position)?;

        self.running = Some(RunningUnit {
            handle: queued.unit.handle(),
            role: queued.role,
            delay: queued.unit.delay(),
            started_at: Instant::now(),
        });
        Some(queued)
    }

    /// Record the outcome of the running unit and release the worker slot
    fn finish(&mut self, handle: &UnitHandle, role: UnitRole, outcome: &UnitOutcome) {
        self.running = None;

        if role != UnitRole::Exec {
            return;
        }

        match outcome {
            UnitOutcome::Completed => self.stats.total_completed += 1,
            UnitOutcome::Skipped => self.stats.total_skipped += 1,
            UnitOutcome::Failed(_) => self.stats.total_failed += 1,
        }

        // Only forget the id if it still refers to this very task
        if self
            .index
            .get(handle.id())
            .is_some_and(|indexed| indexed.same_unit(handle))
        {
            self.index.remove(handle.id());
        }
    }

    fn cancel_all(&mut self) {
        for queued in &self.worklist {
            queued.unit.cancel();
        }
        if let Some(running) = &self.running {
            running.handle.cancel();
        }
    }

    fn is_idle(&self) -> bool {
        self.worklist.is_empty() && self.running.is_none()
    }
}

struct Shared {
    name: String,
    inner: Mutex<SequencerInner>,

    /// Wakes the worker when the worklist may have become runnable
    wakeup: Notify,

    /// Signals waiters whenever the sequencer drains
    idle: Notify,

    shutdown: AtomicBool,
}

/// The Sequencer runs tasks one at a time, in the order they were added,
/// each after its own delay measured from the end of the previous task.
///
/// Every task becomes two worklist units: a wait unit `<id>_delay` that
/// sleeps for the delay, and a zero-delay exec unit `<id>` that depends on it
/// and invokes the body. Only exec units are indexed for removal.
///
/// Must be created inside a Tokio runtime; the worker is spawned onto it.
pub struct Sequencer {
    config: SequencerConfig,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Sequencer {
    /// Create a new sequencer with the given configuration
    pub fn new(config: SequencerConfig) -> Self {
        debug!(?config, "Sequencer::new: called");
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            inner: Mutex::new(SequencerInner {
                worklist: VecDeque::new(),
                index: HashMap::new(),
                running: None,
                suspended: config.start_suspended,
                stats: SequencerStats::default(),
            }),
            wakeup: Notify::new(),
            idle: Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker = tokio::spawn(worker_loop(shared.clone()));

        info!(name = %config.name, suspended = config.start_suspended, "Sequencer spawned");
        Self {
            config,
            shared,
            worker: Some(worker),
        }
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.config
    }

    /// Add a task with a direct body, returning its id
    ///
    /// The body runs no earlier than `delay` after the previous task's body
    /// finished. Without an id, a fresh one is generated. Reusing an id
    /// replaces the index entry; the older task still runs.
    pub async fn add_task<F>(&self, id: Option<&str>, delay: Duration, body: F) -> String
    where
        F: FnOnce() + Send + 'static,
    {
        let id = resolve_id(id);
        debug!(%id, ?delay, "Sequencer::add_task: called");
        let exec = DelayedUnit::new(id.clone(), Duration::ZERO, body);
        self.enqueue(id, delay, exec).await
    }

    /// Add a task with a suspending body, returning its id
    ///
    /// The worker stays occupied until the returned future completes.
    pub async fn add_async_task<F, Fut>(&self, id: Option<&str>, delay: Duration, body: F) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = resolve_id(id);
        debug!(%id, ?delay, "Sequencer::add_async_task: called");
        let exec = DelayedUnit::new_async(id.clone(), Duration::ZERO, body);
        self.enqueue(id, delay, exec).await
    }

    async fn enqueue(&self, id: String, delay: Duration, mut exec: DelayedUnit) -> String {
        let wait = DelayedUnit::wait(format!("{}{}", id, DELAY_SUFFIX), delay);
        exec.add_dependency(&wait.handle());

        let mut inner = self.shared.inner.lock().await;

        if inner.index.insert(id.clone(), exec.handle()).is_some() {
            debug!(%id, "Sequencer::enqueue: id already indexed, replacing entry");
        }

        inner.push(wait, UnitRole::Wait);
        inner.push(exec, UnitRole::Exec);
        inner.stats.total_added += 1;

        debug!(%id, queued = inner.worklist.len(), "Sequencer::enqueue: queued wait and exec units");
        drop(inner);

        self.shared.wakeup.notify_one();
        id
    }

    /// Cancel a task by id and forget it
    ///
    /// Its wait unit keeps its place in the worklist and still waits out the
    /// delay; only the body is prevented. Returns false for unknown ids.
    pub async fn remove_task_by_id(&self, id: &str) -> bool {
        debug!(%id, "Sequencer::remove_task_by_id: called");
        let mut inner = self.shared.inner.lock().await;

        match inner.index.remove(id) {
            Some(handle) => {
                debug!(%id, state = %handle.state(), "Sequencer::remove_task_by_id: found, cancelling");
                handle.cancel();
                inner.stats.total_removed += 1;
                true
            }
            None => {
                debug!(%id, "Sequencer::remove_task_by_id: not indexed");
                false
            }
        }
    }

    /// Same as `resume`
    pub async fn start(&self) {
        debug!("Sequencer::start: called");
        self.resume().await;
    }

    /// Stop starting new units. A unit already executing runs to completion.
    pub async fn pause(&self) {
        debug!("Sequencer::pause: called");
        self.shared.inner.lock().await.suspended = true;
    }

    /// Allow the worklist to start units again
    pub async fn resume(&self) {
        debug!("Sequencer::resume: called");
        self.shared.inner.lock().await.suspended = false;
        self.shared.wakeup.notify_one();
    }

    /// Cancel every queued and running unit
    ///
    /// The running unit finishes its current step. Everything else is
    /// skipped as the worker reaches it.
    pub async fn cancel(&self) {
        debug!("Sequencer::cancel: called");
        let mut inner = self.shared.inner.lock().await;
        inner.cancel_all();
        debug!(queued = inner.worklist.len(), "Sequencer::cancel: marked all units cancelled");
        drop(inner);

        self.shared.wakeup.notify_one();
    }

    /// Cancel everything, then drop all queued units and indexed ids
    ///
    /// Leaves the suspend flag untouched.
    pub async fn reset(&self) {
        debug!("Sequencer::reset: called");
        let mut inner = self.shared.inner.lock().await;
        inner.cancel_all();

        let dropped_tasks = inner
            .worklist
            .drain(..)
            .map(|queued| {
                queued.unit.handle().set_state(UnitState::Cancelled);
                queued.role
            })
            .filter(|role| *role == UnitRole::Exec)
            .count();
        inner.stats.total_skipped += dropped_tasks as u64;
        inner.index.clear();

        let idle = inner.is_idle();
        drop(inner);

        info!(name = %self.shared.name, dropped_tasks, "Sequencer reset");
        if idle {
            self.shared.idle.notify_waiters();
        }
    }

    pub async fn is_suspended(&self) -> bool {
        self.shared.inner.lock().await.suspended
    }

    /// Number of units waiting in the worklist, excluding the running one
    pub async fn len(&self) -> usize {
        self.shared.inner.lock().await.worklist.len()
    }

    /// Check if nothing is queued or running
    pub async fn is_idle(&self) -> bool {
        self.shared.inner.lock().await.is_idle()
    }

    /// Check if a task id is currently indexed
    pub async fn contains(&self, id: &str) -> bool {
        self.shared.inner.lock().await.index.contains_key(id)
    }

    /// Get current queue state
    pub async fn queue_state(&self) -> QueueState {
        debug!("Sequencer::queue_state: called");
        let inner = self.shared.inner.lock().await;

        QueueState {
            queued: inner.worklist.len(),
            running: inner.running.is_some(),
            suspended: inner.suspended,
            stats: inner.stats.clone(),
        }
    }

    /// Get the running unit followed by the worklist, in order
    pub async fn queue_details(&self) -> Vec<QueueEntry> {
        debug!("Sequencer::queue_details: called");
        let inner = self.shared.inner.lock().await;
        let now = Instant::now();

        inner
            .running
            .iter()
            .map(|r| QueueEntry {
                id: r.handle.id().to_string(),
                role: r.role,
                status: QueueEntryStatus::Running,
                delay: r.delay,
                elapsed: now - r.started_at,
            })
            .chain(inner.worklist.iter().map(|q| QueueEntry {
                id: q.unit.id().to_string(),
                role: q.role,
                status: if q.unit.is_cancelled() {
                    QueueEntryStatus::Cancelled
                } else {
                    QueueEntryStatus::Queued
                },
                delay: q.unit.delay(),
                elapsed: now - q.submitted_at,
            }))
            .collect()
    }

    /// Get the sequencer statistics
    pub async fn stats(&self) -> SequencerStats {
        debug!("Sequencer::stats: called");
        self.shared.inner.lock().await.stats.clone()
    }

    /// Wait until the worklist is empty and nothing is running
    ///
    /// Never resolves while paused with work queued.
    pub async fn wait_idle(&self) {
        debug!("Sequencer::wait_idle: called");
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.inner.lock().await.is_idle() {
                debug!("Sequencer::wait_idle: idle");
                return;
            }
            notified.await;
        }
    }

    /// Stop the worker after the unit it is running, and wait for it
    ///
    /// Units still queued are dropped without running.
    pub async fn shutdown(mut self) {
        debug!(name = %self.shared.name, "Sequencer::shutdown: called");
        self.signal_shutdown();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(name = %self.shared.name, error = %e, "Sequencer worker ended abnormally");
            }
        }
    }

    fn signal_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wakeup.notify_one();
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        if self.worker.is_some() {
            debug!(name = %self.shared.name, "Sequencer::drop: signalling worker shutdown");
            self.signal_shutdown();
        }
    }
}

fn resolve_id(id: Option<&str>) -> String {
    id.map(str::to_string).unwrap_or_else(|| Uuid::now_v7().to_string())
}

/// Single worker: pops one ready unit at a time and runs it to completion
async fn worker_loop(shared: Arc<Shared>) {
    debug!(name = %shared.name, "worker_loop: started");

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let next = shared.inner.lock().await.next_ready();
        let Some(QueuedUnit { unit, role, .. }) = next else {
            shared.wakeup.notified().await;
            continue;
        };

        let handle = unit.handle();
        debug!(name = %shared.name, id = %handle.id(), %role, "worker_loop: starting unit");
        let outcome = unit.run().await;

        let idle = {
            let mut inner = shared.inner.lock().await;
            inner.finish(&handle, role, &outcome);
            inner.is_idle()
        };

        if idle {
            debug!(name = %shared.name, "worker_loop: drained");
            shared.idle.notify_waiters();
        }
    }

    info!(name = %shared.name, "Sequencer worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&str) -> Box<dyn FnOnce() + Send + 'static>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        let make = move |name: &str| -> Box<dyn FnOnce() + Send + 'static> {
            let sink = sink.clone();
            let name = name.to_string();
            Box::new(move || sink.lock().unwrap().push(name))
        };
        (log, make)
    }

    #[tokio::test]
    async fn test_add_queues_wait_then_exec() {
        let sequencer = Sequencer::new(SequencerConfig::default());

        let id = sequencer.add_task(Some("first"), Duration::from_millis(10), || {}).await;
        assert_eq!(id, "first");

        let details = sequencer.queue_details().await;
        let ids: Vec<_> = details.iter().map(|e| (e.id.as_str(), e.role)).collect();
        assert_eq!(ids, vec![("first_delay", UnitRole::Wait), ("first", UnitRole::Exec)]);
        assert_eq!(details[0].delay, Duration::from_millis(10));
        assert_eq!(details[1].delay, Duration::ZERO);

        assert!(sequencer.contains("first").await);
        assert!(!sequencer.contains("first_delay").await);
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let sequencer = Sequencer::new(SequencerConfig::default());

        let a = sequencer.add_task(None, Duration::ZERO, || {}).await;
        let b = sequencer.add_task(None, Duration::ZERO, || {}).await;

        assert_ne!(a, b);
        assert!(sequencer.contains(&a).await);
        assert!(sequencer.contains(&b).await);
    }

    #[tokio::test]
    async fn test_starts_suspended_by_default() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        let (log, make) = recorder();

        sequencer.add_task(Some("a"), Duration::ZERO, make("a")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sequencer.is_suspended().await);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sequencer.len().await, 2);
    }

    #[tokio::test]
    async fn test_running_config_drains_immediately() {
        let sequencer = Sequencer::new(SequencerConfig::running());
        let (log, make) = recorder();

        sequencer.add_task(Some("a"), Duration::ZERO, make("a")).await;
        tokio::time::timeout(Duration::from_secs(2), sequencer.wait_idle())
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a"]);
        assert!(sequencer.is_idle().await);
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        sequencer.add_task(Some("a"), Duration::ZERO, || {}).await;

        assert!(!sequencer.remove_task_by_id("nope").await);
        assert!(!sequencer.remove_task_by_id("a_delay").await);
        assert_eq!(sequencer.stats().await.total_removed, 0);
        assert_eq!(sequencer.len().await, 2);
    }

    #[tokio::test]
    async fn test_remove_keeps_wait_unit_in_worklist() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        sequencer.add_task(Some("a"), Duration::from_millis(10), || {}).await;

        assert!(sequencer.remove_task_by_id("a").await);
        assert!(!sequencer.contains("a").await);

        let details = sequencer.queue_details().await;
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].status, QueueEntryStatus::Queued);
        assert_eq!(details[1].status, QueueEntryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_duplicate_id_last_write_wins() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        let (log, make) = recorder();

        sequencer.add_task(Some("dup"), Duration::ZERO, make("old")).await;
        sequencer.add_task(Some("dup"), Duration::ZERO, make("new")).await;

        // Only the newer entry is reachable by id
        assert!(sequencer.remove_task_by_id("dup").await);
        assert!(!sequencer.remove_task_by_id("dup").await);

        sequencer.start().await;
        tokio::time::timeout(Duration::from_secs(2), sequencer.wait_idle())
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["old"]);
    }

    #[tokio::test]
    async fn test_cancel_marks_everything() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        sequencer.add_task(Some("a"), Duration::ZERO, || {}).await;
        sequencer.add_task(Some("b"), Duration::ZERO, || {}).await;

        sequencer.cancel().await;

        let details = sequencer.queue_details().await;
        assert_eq!(details.len(), 4);
        assert!(details.iter().all(|e| e.status == QueueEntryStatus::Cancelled));
        // Still paused, so the cancelled units stay put
        assert_eq!(sequencer.len().await, 4);
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        sequencer.add_task(Some("a"), Duration::ZERO, || {}).await;
        sequencer.add_task(Some("b"), Duration::ZERO, || {}).await;

        sequencer.reset().await;

        let state = sequencer.queue_state().await;
        assert!(state.is_idle());
        assert!(state.suspended);
        assert_eq!(state.stats.total_skipped, 2);
        assert!(!sequencer.contains("a").await);
        tokio::time::timeout(Duration::from_secs(1), sequencer.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_completed_task_leaves_index() {
        let sequencer = Sequencer::new(SequencerConfig::running());
        sequencer.add_task(Some("done"), Duration::ZERO, || {}).await;

        tokio::time::timeout(Duration::from_secs(2), sequencer.wait_idle())
            .await
            .unwrap();

        assert!(!sequencer.contains("done").await);
        let stats = sequencer.stats().await;
        assert_eq!(stats.total_added, 1);
        assert_eq!(stats.total_completed, 1);
        assert_eq!(stats.peak_queue_depth, 2);
    }

    #[tokio::test]
    async fn test_pause_and_resume_flags() {
        let sequencer = Sequencer::new(SequencerConfig::running());
        assert!(!sequencer.is_suspended().await);

        sequencer.pause().await;
        sequencer.pause().await;
        assert!(sequencer.is_suspended().await);

        sequencer.resume().await;
        sequencer.start().await;
        assert!(!sequencer.is_suspended().await);
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let sequencer = Sequencer::new(SequencerConfig::default());
        sequencer.add_task(Some("never"), Duration::ZERO, || {}).await;

        tokio::time::timeout(Duration::from_secs(2), sequencer.shutdown())
            .await
            .unwrap();
    }
}
