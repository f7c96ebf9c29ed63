//! Bounded execution of downstream calls.
//!
//! Every call to an external collaborator goes through [`Supervisor`], which
//! turns it into a [`TaskResult`]: the value, a timeout, or the preserved
//! failure cause. Nothing here retries on its own; [`Supervisor::retry_read_once`]
//! is the only retry and callers opt into it explicitly.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::TurnError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskResult<T, E> {
    Success(T),
    Timeout,
    Failure(E),
}

impl<T, E> TaskResult<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            Self::Timeout | Self::Failure(_) => None,
        }
    }

    /// Timeout and Failure collapse into the fallback.
    pub fn unwrap_or(self, fallback: T) -> T {
        self.ok().unwrap_or(fallback)
    }

    pub fn unwrap_or_else(self, fallback: impl FnOnce() -> T) -> T {
        self.ok().unwrap_or_else(fallback)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskResult<U, E> {
        match self {
            Self::Success(value) => TaskResult::Success(f(value)),
            Self::Timeout => TaskResult::Timeout,
            Self::Failure(cause) => TaskResult::Failure(cause),
        }
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Timeout => "timeout",
            Self::Failure(_) => "failure",
        }
    }
}

impl<T, E: Display> TaskResult<T, E> {
    /// For mandatory calls: anything but success becomes a turn error.
    pub fn into_required(self, operation: &str, budget: Duration) -> Result<T, TurnError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Timeout => Err(TurnError::Timeout { operation: operation.to_owned(), budget }),
            Self::Failure(cause) => Err(TurnError::dependency(operation, cause)),
        }
    }
}

/// Default per-class timeouts. The `turn` budget bounds a whole turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budgets {
    pub classification: Duration,
    pub memory_lookup: Duration,
    pub extraction: Duration,
    pub search: Duration,
    pub external_write: Duration,
    pub interim_notice: Duration,
    pub turn: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            classification: Duration::from_millis(500),
            memory_lookup: Duration::from_secs(5),
            extraction: Duration::from_secs(25),
            search: Duration::from_secs(15),
            external_write: Duration::from_secs(10),
            interim_notice: Duration::from_secs(2),
            turn: Duration::from_secs(60),
        }
    }
}

/// Absolute point in time by which a piece of work must finish.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self { at: Instant::now() + budget }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Deadline for a nested call: the tighter of the parent and `budget`.
    pub fn child(&self, budget: Duration) -> Deadline {
        let candidate = Instant::now() + budget;
        Deadline { at: candidate.min(self.at) }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IsolationError<E> {
    #[error("{0}")]
    Operation(E),
    #[error("operation panicked: {0}")]
    Panicked(String),
    #[error("worker pool is closed")]
    PoolClosed,
}

#[derive(Clone, Debug, Default)]
pub struct Supervisor {
    budgets: Budgets,
}

impl Supervisor {
    pub fn new(budgets: Budgets) -> Self {
        Self { budgets }
    }

    pub fn budgets(&self) -> &Budgets {
        &self.budgets
    }

    /// Runs `future` for at most `timeout`. On deadline the future is dropped
    /// and `Timeout` is returned, whatever it would have produced later.
    pub async fn run<T, E, F>(&self, operation: &str, timeout: Duration, future: F) -> TaskResult<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let started = Instant::now();
        match tokio::time::timeout(timeout, future).await {
            Ok(Ok(value)) => {
                debug!(
                    event_name = "supervisor.success",
                    operation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "supervised operation completed"
                );
                TaskResult::Success(value)
            }
            Ok(Err(cause)) => {
                warn!(
                    event_name = "supervisor.failure",
                    operation,
                    error = %cause,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "supervised operation failed"
                );
                TaskResult::Failure(cause)
            }
            Err(_) => {
                warn!(
                    event_name = "supervisor.timeout",
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "supervised operation exceeded its budget"
                );
                TaskResult::Timeout
            }
        }
    }

    /// Like [`Supervisor::run`], bounded by both `budget` and the parent deadline.
    /// An already expired parent yields `Timeout` without polling the future.
    pub async fn run_within<T, E, F>(
        &self,
        operation: &str,
        parent: Deadline,
        budget: Duration,
        future: F,
    ) -> TaskResult<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        let deadline = parent.child(budget);
        if deadline.is_expired() {
            warn!(
                event_name = "supervisor.budget_exhausted",
                operation,
                "parent budget exhausted before the operation started"
            );
            return TaskResult::Timeout;
        }
        self.run(operation, deadline.remaining(), future).await
    }

    /// Supervised call that degrades to `fallback` on timeout or failure.
    pub async fn run_or<T, E, F>(&self, operation: &str, timeout: Duration, fallback: T, future: F) -> T
    where
        F: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.run(operation, timeout, future).await.unwrap_or(fallback)
    }

    /// Runs a `'static` operation on its own task so a panic is reported as a
    /// failure instead of unwinding through the caller. The task is aborted on
    /// timeout.
    pub async fn spawn<T, E, F>(
        &self,
        operation: &str,
        timeout: Duration,
        future: F,
    ) -> TaskResult<T, IsolationError<E>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let mut handle = tokio::spawn(future);
        let joined = self
            .run(operation, timeout, async {
                match (&mut handle).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(cause)) => Err(IsolationError::Operation(cause)),
                    Err(join_error) => Err(IsolationError::Panicked(join_error.to_string())),
                }
            })
            .await;
        if matches!(joined, TaskResult::Timeout) {
            handle.abort();
        }
        joined
    }

    /// Explicit single retry for idempotent reads. The retry only happens if
    /// the first attempt failed or timed out and budget remains.
    pub async fn retry_read_once<T, E, F, Fut>(
        &self,
        operation: &str,
        deadline: Deadline,
        per_attempt: Duration,
        mut read: F,
    ) -> TaskResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let first = self.run_within(operation, deadline, per_attempt, read()).await;
        if first.is_success() || deadline.is_expired() {
            return first;
        }
        debug!(event_name = "supervisor.retry", operation, "retrying idempotent read once");
        self.run_within(operation, deadline, per_attempt, read()).await
    }
}

/// Bounded pool for blocking work. Waiting for a permit counts against the
/// caller's timeout, so a saturated pool surfaces as `Timeout`.
#[derive(Clone, Debug)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BlockingPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { permits: Arc::new(Semaphore::new(capacity)), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<T, E, F>(
        &self,
        operation: &str,
        timeout: Duration,
        job: F,
    ) -> TaskResult<T, IsolationError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let deadline = Deadline::after(timeout);
        let permit =
            match tokio::time::timeout(deadline.remaining(), self.permits.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return TaskResult::Failure(IsolationError::PoolClosed),
                Err(_) => {
                    warn!(
                        event_name = "blocking_pool.saturated",
                        operation,
                        capacity = self.capacity,
                        "no blocking worker became available before the deadline"
                    );
                    return TaskResult::Timeout;
                }
            };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });

        match tokio::time::timeout(deadline.remaining(), handle).await {
            Ok(Ok(Ok(value))) => TaskResult::Success(value),
            Ok(Ok(Err(cause))) => TaskResult::Failure(IsolationError::Operation(cause)),
            Ok(Err(join_error)) => {
                TaskResult::Failure(IsolationError::Panicked(join_error.to_string()))
            }
            Err(_) => {
                // The blocking job keeps its permit until it returns.
                warn!(
                    event_name = "blocking_pool.timeout",
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "blocking job exceeded its budget"
                );
                TaskResult::Timeout
            }
        }
    }
}
