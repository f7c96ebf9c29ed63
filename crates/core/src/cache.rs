//! TTL cache in front of the slow external record store.
//!
//! One [`TableSlot`] per logical table holds the current snapshot, a
//! generation counter bumped on every invalidation, and at most one in-flight
//! refresh per generation. Concurrent readers of a cold or expired table all
//! wait on the same refresh. The refresh runs on its own task so a reader that
//! gives up does not cancel it for the others.
//!
//! Writes go through the cache ([`RecordCache::create`],
//! [`RecordCache::update_field`], [`RecordCache::delete`]) so the slot is
//! invalidated as soon as the store confirms the write.
//!
//! The `*_within` variants also honour a caller's [`Deadline`]: a turn with
//! two seconds left waits two seconds, not the full refresh or write budget.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::domain::record::{Record, TableName};
use crate::errors::ServiceError;
use crate::ports::RecordStore;
use crate::supervisor::{Deadline, Supervisor, TaskResult};

pub type Snapshot = Arc<Vec<Record>>;

type RefreshOutcome = Result<Snapshot, CacheError>;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("refresh of `{table}` exceeded {budget:?}")]
    Timeout { table: TableName, budget: Duration },
    #[error("refresh of `{table}` failed: {cause}")]
    Refresh { table: TableName, cause: ServiceError },
    #[error("refresh of `{table}` stopped before publishing a result")]
    Abandoned { table: TableName },
    #[error("write to `{table}` exceeded {budget:?}; outcome unknown")]
    WriteTimeout { table: TableName, budget: Duration },
    #[error("write to `{table}` failed: {cause}")]
    Write { table: TableName, cause: ServiceError },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Ignore freshness and fetch from the store.
    pub force_refresh: bool,
    /// On refresh failure, serve a TTL-expired snapshot if one exists.
    pub allow_stale: bool,
}

impl GetOptions {
    pub fn force_refresh() -> Self {
        Self { force_refresh: true, allow_stale: false }
    }

    pub fn allow_stale() -> Self {
        Self { force_refresh: false, allow_stale: true }
    }
}

/// Why a read could not be answered from the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Miss {
    Cold,
    Expired,
    Forced,
}

impl Miss {
    fn as_str(self) -> &'static str {
        match self {
            Self::Cold => "cold",
            Self::Expired => "expired",
            Self::Forced => "forced",
        }
    }
}

struct CacheEntry {
    records: Snapshot,
    captured_at: Instant,
}

struct Flight {
    generation: u64,
    outcome: watch::Receiver<Option<RefreshOutcome>>,
}

#[derive(Default)]
struct SlotState {
    entry: Option<CacheEntry>,
    generation: u64,
    in_flight: Option<Flight>,
}

#[derive(Default)]
struct TableSlot {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    invalidations: AtomicU64,
    stale_served: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub refreshes: u64,
    pub refresh_failures: u64,
    pub invalidations: u64,
    pub stale_served: u64,
    pub tables: usize,
}

pub struct RecordCache {
    store: Arc<dyn RecordStore>,
    supervisor: Supervisor,
    ttl: Duration,
    refresh_timeout: Duration,
    write_timeout: Duration,
    slots: Mutex<HashMap<TableName, Arc<TableSlot>>>,
    metrics: Arc<CacheMetrics>,
}

impl RecordCache {
    pub fn new(store: Arc<dyn RecordStore>, supervisor: Supervisor, ttl: Duration) -> Self {
        let write_timeout = supervisor.budgets().external_write;
        Self {
            store,
            supervisor,
            ttl,
            refresh_timeout: Duration::from_secs(10),
            write_timeout,
            slots: Mutex::new(HashMap::new()),
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, table: &TableName) -> Result<Snapshot, CacheError> {
        self.get_with(table, GetOptions::default()).await
    }

    pub async fn get_with(
        &self,
        table: &TableName,
        options: GetOptions,
    ) -> Result<Snapshot, CacheError> {
        let slot = self.slot(table);
        let mut receiver = {
            let mut state = lock(&slot.state);
            let miss = match &state.entry {
                _ if options.force_refresh => Miss::Forced,
                Some(entry) if entry.captured_at.elapsed() < self.ttl => {
                    self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(event_name = "cache.hit", table = %table, "serving cached snapshot");
                    return Ok(Arc::clone(&entry.records));
                }
                Some(_) => Miss::Expired,
                None => Miss::Cold,
            };
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            debug!(event_name = "cache.miss", table = %table, reason = miss.as_str(), "cache miss");

            let generation = state.generation;
            let joinable = state
                .in_flight
                .as_ref()
                .filter(|flight| flight.generation == generation)
                .map(|flight| flight.outcome.clone());
            match joinable {
                Some(outcome) => outcome,
                None => self.start_refresh(table, &slot, &mut state),
            }
        };

        let outcome = wait_for_outcome(table, &mut receiver).await;
        match outcome {
            Ok(records) => Ok(records),
            Err(error) if options.allow_stale => {
                let state = lock(&slot.state);
                match &state.entry {
                    Some(entry) => {
                        self.metrics.stale_served.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            event_name = "cache.stale_served",
                            table = %table,
                            age_secs = entry.captured_at.elapsed().as_secs(),
                            error = %error,
                            "refresh failed; serving expired snapshot"
                        );
                        Ok(Arc::clone(&entry.records))
                    }
                    None => Err(error),
                }
            }
            Err(error) => Err(error),
        }
    }

    pub async fn get_within(
        &self,
        table: &TableName,
        deadline: Deadline,
    ) -> Result<Snapshot, CacheError> {
        self.get_with_within(table, GetOptions::default(), deadline).await
    }

    /// Waits at most until the tighter of `deadline` and the refresh budget.
    /// A refresh this reader gives up on keeps running for the others, and a
    /// fresh snapshot is served even when the deadline has passed.
    pub async fn get_with_within(
        &self,
        table: &TableName,
        options: GetOptions,
        deadline: Deadline,
    ) -> Result<Snapshot, CacheError> {
        let budget = deadline.child(self.refresh_timeout).remaining();
        match tokio::time::timeout(budget, self.get_with(table, options)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event_name = "cache.wait_timeout",
                    table = %table,
                    budget_ms = budget.as_millis() as u64,
                    "caller deadline reached while waiting for a refresh"
                );
                Err(CacheError::Timeout { table: table.clone(), budget })
            }
        }
    }

    /// Drops the snapshot and moves the table to a new generation. Refreshes
    /// started before this call will not populate the slot.
    pub fn invalidate(&self, table: &TableName) {
        let slot = self.slot(table);
        let mut state = lock(&slot.state);
        state.generation += 1;
        state.entry = None;
        self.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        info!(
            event_name = "cache.invalidated",
            table = %table,
            generation = state.generation,
            "record cache invalidated"
        );
    }

    pub async fn create(&self, table: &TableName, record: Record) -> Result<(), CacheError> {
        self.create_within(table, record, self.write_deadline()).await
    }

    pub async fn create_within(
        &self,
        table: &TableName,
        record: Record,
        deadline: Deadline,
    ) -> Result<(), CacheError> {
        self.write_within("record_store.create", table, deadline, self.store.create(table, record))
            .await
    }

    pub async fn update_field(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), CacheError> {
        self.update_field_within(table, key, field, value, self.write_deadline()).await
    }

    pub async fn update_field_within(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
        deadline: Deadline,
    ) -> Result<(), CacheError> {
        self.write_within(
            "record_store.update_field",
            table,
            deadline,
            self.store.update_field(table, key, field, value),
        )
        .await
    }

    pub async fn delete(&self, table: &TableName, key: &str) -> Result<(), CacheError> {
        self.delete_within(table, key, self.write_deadline()).await
    }

    pub async fn delete_within(
        &self,
        table: &TableName,
        key: &str,
        deadline: Deadline,
    ) -> Result<(), CacheError> {
        self.write_within("record_store.delete", table, deadline, self.store.delete(table, key))
            .await
    }

    pub fn stats(&self) -> CacheStats {
        let tables = lock(&self.slots).len();
        CacheStats {
            hits: self.metrics.hits.load(Ordering::Relaxed),
            misses: self.metrics.misses.load(Ordering::Relaxed),
            refreshes: self.metrics.refreshes.load(Ordering::Relaxed),
            refresh_failures: self.metrics.refresh_failures.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
            stale_served: self.metrics.stale_served.load(Ordering::Relaxed),
            tables,
        }
    }

    fn write_deadline(&self) -> Deadline {
        Deadline::after(self.write_timeout)
    }

    async fn write_within<F>(
        &self,
        operation: &str,
        table: &TableName,
        deadline: Deadline,
        write: F,
    ) -> Result<(), CacheError>
    where
        F: Future<Output = Result<(), ServiceError>>,
    {
        let budget = deadline.child(self.write_timeout).remaining();
        let outcome =
            self.supervisor.run_within(operation, deadline, self.write_timeout, write).await;
        self.finish_write(table, outcome, budget)
    }

    fn finish_write(
        &self,
        table: &TableName,
        outcome: TaskResult<(), ServiceError>,
        budget: Duration,
    ) -> Result<(), CacheError> {
        match outcome {
            TaskResult::Success(()) => {
                self.invalidate(table);
                Ok(())
            }
            TaskResult::Timeout => {
                // The store may still apply the write.
                self.invalidate(table);
                Err(CacheError::WriteTimeout { table: table.clone(), budget })
            }
            TaskResult::Failure(cause) => Err(CacheError::Write { table: table.clone(), cause }),
        }
    }

    fn slot(&self, table: &TableName) -> Arc<TableSlot> {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(table.clone()).or_default())
    }

    fn start_refresh(
        &self,
        table: &TableName,
        slot: &Arc<TableSlot>,
        state: &mut SlotState,
    ) -> watch::Receiver<Option<RefreshOutcome>> {
        let (sender, receiver) = watch::channel(None);
        let generation = state.generation;
        state.in_flight = Some(Flight { generation, outcome: receiver.clone() });
        self.metrics.refreshes.fetch_add(1, Ordering::Relaxed);

        let store = Arc::clone(&self.store);
        let supervisor = self.supervisor.clone();
        let metrics = Arc::clone(&self.metrics);
        let slot = Arc::clone(slot);
        let table = table.clone();
        let budget = self.refresh_timeout;

        tokio::spawn(async move {
            let started = Instant::now();
            let result = match supervisor.run("record_store.list_all", budget, store.list_all(&table)).await
            {
                TaskResult::Success(records) => Ok(Arc::new(records)),
                TaskResult::Timeout => Err(CacheError::Timeout { table: table.clone(), budget }),
                TaskResult::Failure(cause) => {
                    Err(CacheError::Refresh { table: table.clone(), cause })
                }
            };

            {
                let mut state = lock(&slot.state);
                match &result {
                    Ok(records) if state.generation == generation => {
                        state.entry = Some(CacheEntry {
                            records: Arc::clone(records),
                            captured_at: Instant::now(),
                        });
                        info!(
                            event_name = "cache.refresh",
                            table = %table,
                            generation,
                            records = records.len(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "record cache refreshed"
                        );
                    }
                    Ok(_) => {
                        debug!(
                            event_name = "cache.refresh_superseded",
                            table = %table,
                            generation,
                            current_generation = state.generation,
                            "refresh finished after an invalidation; result not cached"
                        );
                    }
                    Err(_) => {
                        metrics.refresh_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                if state.in_flight.as_ref().is_some_and(|flight| flight.generation == generation) {
                    state.in_flight = None;
                }
            }

            let _ = sender.send(Some(result));
        });

        receiver
    }
}

async fn wait_for_outcome(
    table: &TableName,
    receiver: &mut watch::Receiver<Option<RefreshOutcome>>,
) -> RefreshOutcome {
    loop {
        let published = receiver.borrow_and_update().clone();
        if let Some(outcome) = published {
            return outcome;
        }
        if receiver.changed().await.is_err() {
            let last = receiver.borrow().clone();
            return last.unwrap_or_else(|| Err(CacheError::Abandoned { table: table.clone() }));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
