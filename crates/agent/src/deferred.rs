//! Fire-and-forget persistence of conversation memory.
//!
//! The turn path only ever calls [`DeferredWritePipeline::enqueue`], which
//! never waits. A dedicated consumer task drains the bounded queue and runs
//! each write on its own task, at most `max_concurrent_writes` at a time.
//! Writes for one user apply in arrival order, so a task created by one turn
//! exists before a later turn resolves it. Failures are logged and audited,
//! never returned to the turn that produced the write.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use concierge_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use concierge_core::config::DeferredConfig;
use concierge_core::domain::intent::IntentCategory;
use concierge_core::domain::memory::{
    ConversationTurn, NewTask, PreferenceUpdate, SemanticEntry, TaskStatus, UserId,
};
use concierge_core::ports::{Embedder, SemanticMemory, StructuredMemory};
use concierge_core::supervisor::{Supervisor, TaskResult};

/// Facts a handler observed that the writer turns into preference and task
/// updates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSignals {
    pub email_body: Option<String>,
    pub place_location: Option<String>,
    pub task_description: Option<String>,
    /// Id for the task created from `task_description`, when the handler
    /// needs to refer to it later.
    pub task_id: Option<String>,
    pub resolved_task: Option<TaskResolution>,
}

/// A follow-up task this turn finished or abandoned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskResolution {
    pub task_id: String,
    pub status: TaskStatus,
}

/// One queued memory-persistence job, created after the reply was handed to
/// the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredWrite {
    pub user_id: UserId,
    pub correlation_id: String,
    pub message: String,
    pub reply: String,
    pub category: Option<IntentCategory>,
    pub signals: WriteSignals,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    DroppedQueueFull,
    DroppedClosed,
}

/// Email tone inferred from a drafted body, if the wording is telling.
pub fn derive_email_tone(body: &str) -> Option<&'static str> {
    let lowered = body.to_lowercase();
    if ["please", "kindly", "would appreciate"].iter().any(|word| lowered.contains(word)) {
        Some("polite")
    } else if ["urgent", "asap", "immediately"].iter().any(|word| lowered.contains(word)) {
        Some("direct")
    } else {
        None
    }
}

pub fn derive_preferences(write: &DeferredWrite) -> PreferenceUpdate {
    let mut update = PreferenceUpdate::default();
    if write.category == Some(IntentCategory::Email) {
        if let Some(body) = &write.signals.email_body {
            update.email_tone = derive_email_tone(body).map(str::to_owned);
        }
    }
    if write.category == Some(IntentCategory::PlaceSearch) {
        update.add_favorite_location = write
            .signals
            .place_location
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty() && !location.eq_ignore_ascii_case("near me"))
            .map(str::to_owned);
    }
    update
}

pub fn derive_task(write: &DeferredWrite) -> Option<NewTask> {
    let description = write.signals.task_description.as_ref()?;
    let task_type = write.category.unwrap_or(IntentCategory::General).task_type();
    let mut task = NewTask::new(task_type, description.clone());
    if let Some(id) = &write.signals.task_id {
        task.id = id.clone();
    }
    Some(task)
}

/// Applies one [`DeferredWrite`] against both memory backends.
#[derive(Clone)]
pub struct DeferredWriter {
    structured: Arc<dyn StructuredMemory>,
    semantic: Arc<dyn SemanticMemory>,
    embedder: Arc<dyn Embedder>,
    supervisor: Supervisor,
    audit: Arc<dyn AuditSink>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
}

impl DeferredWriter {
    pub fn new(
        structured: Arc<dyn StructuredMemory>,
        semantic: Arc<dyn SemanticMemory>,
        embedder: Arc<dyn Embedder>,
        supervisor: Supervisor,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { structured, semantic, embedder, supervisor, audit }
    }

    pub async fn apply(&self, write: &DeferredWrite) -> WriteReport {
        let budget = self.supervisor.budgets().external_write;
        let mut report = WriteReport::default();

        let turn = ConversationTurn {
            message: write.message.clone(),
            reply: write.reply.clone(),
            intent: write.category,
            created_at: write.created_at,
        };
        let appended = self
            .supervisor
            .run(
                "deferred.append_turn",
                budget,
                self.structured.append_turn(&write.user_id, &turn),
            )
            .await;
        record_step(&mut report, write, "append_turn", appended);

        let embedded =
            self.supervisor.run("deferred.embed", budget, self.embedder.embed(&write.message)).await;
        let upserted = match embedded {
            TaskResult::Success(embedding) => {
                let entry = SemanticEntry {
                    text: write.message.clone(),
                    intent: write.category,
                    embedding,
                };
                self.supervisor
                    .run(
                        "deferred.semantic_upsert",
                        budget,
                        self.semantic.upsert(&write.user_id, entry),
                    )
                    .await
            }
            TaskResult::Timeout => TaskResult::Timeout,
            TaskResult::Failure(error) => TaskResult::Failure(error),
        };
        record_step(&mut report, write, "semantic_upsert", upserted);

        let preferences = derive_preferences(write);
        if !preferences.is_empty() {
            let updated = self
                .supervisor
                .run(
                    "deferred.update_preferences",
                    budget,
                    self.structured.update_preferences(&write.user_id, &preferences),
                )
                .await;
            record_step(&mut report, write, "update_preferences", updated);
        }

        if let Some(task) = derive_task(write) {
            let created = self
                .supervisor
                .run("deferred.create_task", budget, self.structured.create_task(&write.user_id, &task))
                .await;
            record_step(&mut report, write, "create_task", created);
        }

        if let Some(resolution) = &write.signals.resolved_task {
            let resolved = self
                .supervisor
                .run(
                    "deferred.resolve_task",
                    budget,
                    self.structured.update_task_status(
                        &write.user_id,
                        &resolution.task_id,
                        resolution.status,
                    ),
                )
                .await;
            record_step(&mut report, write, "resolve_task", resolved);
        }

        let outcome =
            if report.failed.is_empty() { AuditOutcome::Success } else { AuditOutcome::Degraded };
        self.audit.emit(
            AuditEvent::new(
                Some(write.user_id.clone()),
                write.correlation_id.clone(),
                "deferred.write_completed",
                AuditCategory::DeferredWrite,
                outcome,
            )
            .with_metadata("completed", report.completed.join(","))
            .with_metadata("failed", report.failed.join(",")),
        );
        report
    }
}

fn record_step<E: std::fmt::Display>(
    report: &mut WriteReport,
    write: &DeferredWrite,
    step: &'static str,
    outcome: TaskResult<(), E>,
) {
    match outcome {
        TaskResult::Success(()) => report.completed.push(step),
        TaskResult::Timeout => {
            warn!(
                event_name = "deferred.write_failed",
                correlation_id = %write.correlation_id,
                user_id = %write.user_id,
                step,
                reason = "timeout",
                "deferred write step timed out"
            );
            report.failed.push(step);
        }
        TaskResult::Failure(error) => {
            warn!(
                event_name = "deferred.write_failed",
                correlation_id = %write.correlation_id,
                user_id = %write.user_id,
                step,
                error = %error,
                "deferred write step failed"
            );
            report.failed.push(step);
        }
    }
}

/// Chains each user's writes behind the previous one in arrival order.
/// Owned by the consumer task, so no locking.
#[derive(Default)]
struct UserOrdering {
    tails: HashMap<UserId, watch::Receiver<bool>>,
}

impl UserOrdering {
    /// Registers a new write for `user_id`. Returns the predecessor to wait
    /// for and the sender that marks this write finished.
    fn enqueue(
        &mut self,
        user_id: &UserId,
    ) -> (Option<watch::Receiver<bool>>, watch::Sender<bool>) {
        // Forget users whose last write already finished.
        self.tails.retain(|_, tail| tail.has_changed().is_ok() && !*tail.borrow());
        let (done, tail) = watch::channel(false);
        (self.tails.insert(user_id.clone(), tail), done)
    }
}

/// Resolves once the predecessor finished, or was dropped without finishing.
async fn wait_for_predecessor(previous: Option<watch::Receiver<bool>>) {
    if let Some(mut previous) = previous {
        let _ = previous.wait_for(|finished| *finished).await;
    }
}

pub struct DeferredWritePipeline {
    sender: Mutex<Option<mpsc::Sender<DeferredWrite>>>,
    consumer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    capacity: usize,
}

impl DeferredWritePipeline {
    /// Spawns the consumer; must be called inside a tokio runtime.
    pub fn start(writer: DeferredWriter, config: &DeferredConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let consumer = tokio::spawn(consume(writer, receiver, config.max_concurrent_writes.max(1)));
        Self {
            sender: Mutex::new(Some(sender)),
            consumer: tokio::sync::Mutex::new(Some(consumer)),
            capacity,
        }
    }

    /// Never waits. A full queue drops the write with a warning.
    pub fn enqueue(&self, write: DeferredWrite) -> EnqueueOutcome {
        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(sender) = sender else {
            warn!(
                event_name = "deferred.dropped",
                correlation_id = %write.correlation_id,
                reason = "closed",
                "deferred write pipeline is shut down; write dropped"
            );
            return EnqueueOutcome::DroppedClosed;
        };

        let correlation_id = write.correlation_id.clone();
        match sender.try_send(write) {
            Ok(()) => {
                debug!(
                    event_name = "deferred.enqueued",
                    correlation_id = %correlation_id,
                    "write queued"
                );
                EnqueueOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    event_name = "deferred.dropped",
                    correlation_id = %correlation_id,
                    reason = "queue_full",
                    capacity = self.capacity,
                    "deferred write queue is full; write dropped"
                );
                EnqueueOutcome::DroppedQueueFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::DroppedClosed,
        }
    }

    /// Writes waiting in the queue, not counting ones already being applied.
    pub fn queue_depth(&self) -> usize {
        let sender = match self.sender.lock() {
            Ok(sender) => sender.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        sender.map(|sender| sender.max_capacity() - sender.capacity()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stops accepting writes and waits up to `grace` for queued and running
    /// writes to finish. Returns `false` if the grace period ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let closed = match self.sender.lock() {
            Ok(mut sender) => sender.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(closed);
        let Some(mut consumer) = self.consumer.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(grace, &mut consumer).await {
            Ok(_) => {
                info!(event_name = "deferred.drained", "deferred write queue drained");
                true
            }
            Err(_) => {
                warn!(
                    event_name = "deferred.drain_timeout",
                    grace_ms = grace.as_millis() as u64,
                    "deferred writes still running at shutdown; aborting"
                );
                consumer.abort();
                false
            }
        }
    }
}

async fn consume(
    writer: DeferredWriter,
    mut receiver: mpsc::Receiver<DeferredWrite>,
    max_concurrent: usize,
) {
    let permits = Arc::new(Semaphore::new(max_concurrent));
    let mut ordering = UserOrdering::default();
    let mut running = JoinSet::new();

    while let Some(write) = receiver.recv().await {
        while running.try_join_next().is_some() {}

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let (previous, done) = ordering.enqueue(&write.user_id);
        let writer = writer.clone();
        running.spawn(async move {
            let _permit = permit;
            wait_for_predecessor(previous).await;
            writer.apply(&write).await;
            let _ = done.send(true);
        });
    }

    while running.join_next().await.is_some() {}
}
