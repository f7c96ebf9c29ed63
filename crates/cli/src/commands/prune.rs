use std::sync::Arc;

use concierge_core::domain::memory::PrunedRows;
use concierge_core::embedding::HashingEmbedder;
use concierge_core::retention::RetentionSweeper;
use concierge_db::{SqlSemanticMemory, SqlStructuredMemory};

use crate::commands::{with_migrated_pool, CommandResult};

/// Deletes conversation turns, resolved tasks and semantic entries older
/// than `days`, falling back to `context.retention_days`.
pub fn run(days: Option<u32>) -> CommandResult {
    let outcome = with_migrated_pool("prune", |config, pool| async move {
        let days = days.unwrap_or(config.context.retention_days);
        if days == 0 {
            return Ok(None);
        }
        let sweeper = RetentionSweeper::new(
            Arc::new(SqlStructuredMemory::new(pool.clone())),
            Arc::new(SqlSemanticMemory::new(pool, Arc::new(HashingEmbedder::default()))),
            chrono::Duration::days(i64::from(days)),
        );
        let pruned =
            sweeper.sweep().await.map_err(|error| ("prune_execution", error.to_string(), 6u8))?;
        Ok(Some((days, pruned)))
    });

    match outcome {
        Ok(None) => CommandResult::success("prune", "retention is disabled; nothing was pruned"),
        Ok(Some((days, pruned))) => CommandResult::success("prune", summary(days, &pruned)),
        Err(failure) => failure,
    }
}

fn summary(days: u32, pruned: &PrunedRows) -> String {
    format!(
        "pruned {} row(s) older than {days} day(s): {} conversation turn(s), {} resolved \
         task(s), {} semantic entr(y/ies)",
        pruned.total(),
        pruned.conversation_turns,
        pruned.tasks,
        pruned.semantic_entries
    )
}

#[cfg(test)]
mod tests {
    use concierge_core::domain::memory::PrunedRows;

    use super::summary;

    #[test]
    fn summary_breaks_the_total_down_by_store() {
        let pruned = PrunedRows { conversation_turns: 4, tasks: 2, semantic_entries: 3 };

        assert_eq!(
            summary(30, &pruned),
            "pruned 9 row(s) older than 30 day(s): 4 conversation turn(s), 2 resolved task(s), \
             3 semantic entr(y/ies)"
        );
    }
}
