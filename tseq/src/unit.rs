//! Delayed units of work
//!
//! A [`DelayedUnit`] waits out its delay and then invokes its body exactly
//! once, unless it was cancelled before the body started. Cancellation is
//! cooperative: it is observed at the start of [`DelayedUnit::run`] and, for
//! suspending bodies, once more after the wait elapses. A body that has
//! started is never interrupted.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{UnitFailure, panic_message};

/// Lifecycle state of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Completed,
    /// Skipped because it was cancelled before its body started
    Cancelled,
    Failed,
}

impl UnitState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed => 2,
            Self::Cancelled => 3,
            Self::Failed => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Completed,
            3 => Self::Cancelled,
            4 => Self::Failed,
            _ => Self::Pending,
        }
    }

    /// Finished units no longer hold back their dependents
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What running a unit amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// The body ran to completion
    Completed,

    /// The unit was cancelled before its body started
    Skipped,

    /// The body started but did not complete normally
    Failed(UnitFailure),
}

#[derive(Debug)]
struct UnitControl {
    id: String,
    cancelled: AtomicBool,
    state: AtomicU8,
}

/// Shared handle to a unit's identity, cancellation flag and state
///
/// Handles stay valid after the unit itself has been consumed by `run`.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    inner: Arc<UnitControl>,
}

impl UnitHandle {
    fn new(id: String) -> Self {
        Self {
            inner: Arc::new(UnitControl {
                id,
                cancelled: AtomicBool::new(false),
                state: AtomicU8::new(UnitState::Pending.as_u8()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Mark the unit cancelled. Has no effect on a body that already started.
    pub fn cancel(&self) {
        debug!(id = %self.inner.id, "UnitHandle::cancel: called");
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        self.inner.state.store(state.as_u8(), Ordering::Release);
    }

    /// Check if both handles refer to the same unit
    pub fn same_unit(&self, other: &UnitHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

enum UnitBody {
    /// Pure wait, nothing to invoke
    Noop,
    Direct(Box<dyn FnOnce() + Send + 'static>),
    Suspending(Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>),
}

impl UnitBody {
    fn flavor(&self) -> &'static str {
        match self {
            UnitBody::Noop => "wait",
            UnitBody::Direct(_) => "direct",
            UnitBody::Suspending(_) => "suspending",
        }
    }
}

/// An identifiable, cancellable closure preceded by a fixed delay
pub struct DelayedUnit {
    handle: UnitHandle,
    delay: Duration,
    body: UnitBody,
    dependencies: Vec<UnitHandle>,
}

impl fmt::Debug for DelayedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedUnit")
            .field("id", &self.handle.id())
            .field("delay", &self.delay)
            .field("flavor", &self.body.flavor())
            .field("state", &self.handle.state())
            .field("cancelled", &self.handle.is_cancelled())
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

impl DelayedUnit {
    /// Create a unit with a direct (synchronous) body
    pub fn new<F>(id: impl Into<String>, delay: Duration, body: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_body(id.into(), delay, UnitBody::Direct(Box::new(body)))
    }

    /// Create a unit with a suspending body
    pub fn new_async<F, Fut>(id: impl Into<String>, delay: Duration, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::with_body(id.into(), delay, UnitBody::Suspending(Box::new(move || body().boxed())))
    }

    /// Create a unit that only waits
    pub fn wait(id: impl Into<String>, delay: Duration) -> Self {
        Self::with_body(id.into(), delay, UnitBody::Noop)
    }

    fn with_body(id: String, delay: Duration, body: UnitBody) -> Self {
        Self {
            handle: UnitHandle::new(id),
            delay,
            body,
            dependencies: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Get a handle that outlives the unit, for cancellation and state lookup
    pub fn handle(&self) -> UnitHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    /// Declare that this unit must not start before `other` has finished
    pub fn add_dependency(&mut self, other: &UnitHandle) {
        debug!(id = %self.handle.id(), dependency = %other.id(), "DelayedUnit::add_dependency: called");
        self.dependencies.push(other.clone());
    }

    /// Check if every dependency has finished (or was skipped)
    pub fn is_ready(&self) -> bool {
        self.dependencies.iter().all(|dep| dep.state().is_finished())
    }

    /// Wait out the delay, then invoke the body once
    ///
    /// Resolves only after the body has fully completed, including any
    /// suspension inside a suspending body.
    pub async fn run(self) -> UnitOutcome {
        let Self { handle, delay, body, .. } = self;
        debug!(id = %handle.id(), ?delay, flavor = body.flavor(), "DelayedUnit::run: called");

        if handle.is_cancelled() {
            debug!(id = %handle.id(), "DelayedUnit::run: cancelled before start, skipping");
            handle.set_state(UnitState::Cancelled);
            return UnitOutcome::Skipped;
        }

        handle.set_state(UnitState::Running);

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match body {
            UnitBody::Noop => Ok(()),
            UnitBody::Direct(body) => run_direct(body).await,
            UnitBody::Suspending(body) => {
                if handle.is_cancelled() {
                    debug!(id = %handle.id(), "DelayedUnit::run: cancelled during wait, skipping body");
                    handle.set_state(UnitState::Cancelled);
                    return UnitOutcome::Skipped;
                }
                run_suspending(body).await
            }
        };

        match result {
            Ok(()) => {
                debug!(id = %handle.id(), "DelayedUnit::run: completed");
                handle.set_state(UnitState::Completed);
                UnitOutcome::Completed
            }
            Err(failure) => {
                warn!(id = %handle.id(), %failure, "Unit body failed");
                handle.set_state(UnitState::Failed);
                UnitOutcome::Failed(failure)
            }
        }
    }
}

/// Run a blocking body on the blocking pool and wait for it
async fn run_direct(body: Box<dyn FnOnce() + Send + 'static>) -> Result<(), UnitFailure> {
    tokio::task::spawn_blocking(body).await.map_err(UnitFailure::from)
}

/// Launch a suspending body and block this unit on its completion signal
async fn run_suspending(body: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>) -> Result<(), UnitFailure> {
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = AssertUnwindSafe(async move { body().await })
            .catch_unwind()
            .await
            .map_err(|payload| UnitFailure::Panicked(panic_message(payload.as_ref())));
        let _ = done_tx.send(result);
    });

    done_rx.await.unwrap_or(Err(UnitFailure::Abandoned))
}
