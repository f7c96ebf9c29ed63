//! Age-based pruning of conversational memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::domain::memory::PrunedRows;
use crate::errors::ServiceError;
use crate::ports::{SemanticMemory, StructuredMemory};

#[derive(Clone)]
pub struct RetentionSweeper {
    structured: Arc<dyn StructuredMemory>,
    semantic: Arc<dyn SemanticMemory>,
    keep_for: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(
        structured: Arc<dyn StructuredMemory>,
        semantic: Arc<dyn SemanticMemory>,
        keep_for: chrono::Duration,
    ) -> Self {
        Self { structured, semantic, keep_for }
    }

    pub fn keep_for(&self) -> chrono::Duration {
        self.keep_for
    }

    pub async fn sweep(&self) -> Result<PrunedRows, ServiceError> {
        self.sweep_at(Utc::now()).await
    }

    /// Removes everything older than `now - keep_for`. Both stores are swept
    /// even if the first one fails; the first error is returned.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<PrunedRows, ServiceError> {
        let cutoff = now - self.keep_for;
        let structured = self.structured.prune_before(cutoff).await;
        let semantic = self.semantic.prune_before(cutoff).await;

        let mut pruned = PrunedRows::default();
        let mut first_error = None;
        match structured {
            Ok(rows) => {
                pruned.conversation_turns = rows.conversation_turns;
                pruned.tasks = rows.tasks;
            }
            Err(error) => first_error = Some(error),
        }
        match semantic {
            Ok(rows) => pruned.semantic_entries = rows,
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        info!(
            event_name = "memory.retention.swept",
            cutoff = %cutoff,
            conversation_turns = pruned.conversation_turns,
            tasks = pruned.tasks,
            semantic_entries = pruned.semantic_entries,
            "pruned memories past the retention window"
        );
        Ok(pruned)
    }

    /// Sweeps once immediately, then every `interval` until the handle is
    /// aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(error) = self.sweep().await {
                    warn!(
                        event_name = "memory.retention.failed",
                        error = %error,
                        "retention sweep failed; retrying on the next tick"
                    );
                }
            }
        })
    }
}
