//! Per-turn memory context.
//!
//! Four independent lookups (preferences, open tasks, recent turns, semantic
//! recall) run concurrently, each under its own supervised budget. A lookup
//! that fails or times out leaves its section empty and is listed in
//! [`ContextBundle::degraded`]; the others are unaffected.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::info;

use concierge_core::config::ContextConfig;
use concierge_core::domain::memory::{
    ConversationTurn, Preferences, SemanticMatch, TaskStatus, UserId, UserTask,
};
use concierge_core::ports::{SemanticMemory, StructuredMemory};
use concierge_core::supervisor::{Supervisor, TaskResult};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ContextLimits {
    pub recent_turns: usize,
    pub semantic_matches: usize,
    pub pending_tasks: usize,
    pub char_budget: usize,
    pub min_similarity: f32,
}

impl Default for ContextLimits {
    fn default() -> Self {
        Self {
            recent_turns: 5,
            semantic_matches: 5,
            pending_tasks: 3,
            char_budget: 2_000,
            min_similarity: 0.7,
        }
    }
}

impl From<&ContextConfig> for ContextLimits {
    fn from(config: &ContextConfig) -> Self {
        Self {
            recent_turns: config.recent_turns,
            semantic_matches: config.semantic_matches,
            pending_tasks: config.pending_tasks,
            char_budget: config.char_budget,
            min_similarity: config.min_similarity,
        }
    }
}

/// Ephemeral aggregate for one turn. Never persisted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextBundle {
    pub preferences: Option<Preferences>,
    pub tasks: Vec<UserTask>,
    /// Most recent first, as fetched.
    pub recent_turns: Vec<ConversationTurn>,
    /// Similarity descending.
    pub semantic: Vec<SemanticMatch>,
    pub degraded: Vec<&'static str>,
}

struct Section {
    header: &'static str,
    entries: Vec<String>,
}

impl Section {
    fn rendered_len(&self) -> usize {
        if self.entries.is_empty() {
            return 0;
        }
        self.header.chars().count()
            + 1
            + self.entries.iter().map(|entry| entry.chars().count() + 1).sum::<usize>()
    }
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.preferences.is_none()
            && self.tasks.is_empty()
            && self.recent_turns.is_empty()
            && self.semantic.is_empty()
    }

    /// Renders the bundle in merge order (preferences, open tasks, recent
    /// turns oldest to newest, related messages) within `char_budget`.
    /// Whole entries are dropped to fit: related messages first (least
    /// similar first), then the oldest turns, then tasks, then preferences.
    pub fn render(&self, char_budget: usize) -> String {
        let mut preferences = Section { header: "Preferences:", entries: Vec::new() };
        if let Some(prefs) = &self.preferences {
            preferences.entries.push(format!("- email tone: {}", prefs.email_tone));
            preferences.entries.push(format!("- email sign-off: {}", prefs.email_signoff));
            preferences.entries.push(format!("- work hours: {}", prefs.work_hours));
            if !prefs.favorite_locations.is_empty() {
                preferences.entries.push(format!(
                    "- favourite locations: {}",
                    prefs.favorite_locations.join(", ")
                ));
            }
        }

        let mut tasks = Section {
            header: "Open tasks:",
            entries: self
                .tasks
                .iter()
                .map(|task| format!("- [{}] {}", task.task_type, task.description))
                .collect(),
        };

        let mut turns = Section {
            header: "Recent conversation:",
            entries: self
                .recent_turns
                .iter()
                .rev()
                .map(|turn| format!("- user: {} | assistant: {}", turn.message, turn.reply))
                .collect(),
        };

        let mut semantic = Section {
            header: "Related past messages:",
            entries: self
                .semantic
                .iter()
                .map(|entry| match entry.intent {
                    Some(intent) => format!("- [{}] {}", intent.as_str(), entry.text),
                    None => format!("- {}", entry.text),
                })
                .collect(),
        };

        // The final newline is trimmed, hence the `- 1`.
        let total = |sections: [&Section; 4]| -> usize {
            sections.iter().map(|section| section.rendered_len()).sum::<usize>().saturating_sub(1)
        };

        while total([&preferences, &tasks, &turns, &semantic]) > char_budget {
            if semantic.entries.pop().is_some() {
                continue;
            }
            if !turns.entries.is_empty() {
                turns.entries.remove(0);
                continue;
            }
            if tasks.entries.pop().is_some() {
                continue;
            }
            if preferences.entries.pop().is_none() {
                break;
            }
        }

        let mut rendered = String::new();
        for section in [&preferences, &tasks, &turns, &semantic] {
            if section.entries.is_empty() {
                continue;
            }
            rendered.push_str(section.header);
            rendered.push('\n');
            for entry in &section.entries {
                rendered.push_str(entry);
                rendered.push('\n');
            }
        }
        rendered.truncate(rendered.trim_end().len());
        rendered
    }
}

#[derive(Clone)]
pub struct ContextAggregator {
    structured: Arc<dyn StructuredMemory>,
    semantic: Arc<dyn SemanticMemory>,
    supervisor: Supervisor,
}

impl ContextAggregator {
    pub fn new(
        structured: Arc<dyn StructuredMemory>,
        semantic: Arc<dyn SemanticMemory>,
        supervisor: Supervisor,
    ) -> Self {
        Self { structured, semantic, supervisor }
    }

    /// Wall-clock time is bounded by the memory lookup budget, not the sum of
    /// the four lookups.
    pub async fn build(
        &self,
        user_id: &UserId,
        current_message: &str,
        limits: &ContextLimits,
    ) -> ContextBundle {
        let started = Instant::now();
        let budget = self.supervisor.budgets().memory_lookup;

        let (preferences, tasks, turns, semantic) = tokio::join!(
            self.supervisor.run(
                "memory.preferences",
                budget,
                self.structured.get_preferences(user_id)
            ),
            self.supervisor.run(
                "memory.tasks",
                budget,
                self.structured.get_tasks(user_id, Some(TaskStatus::Pending), limits.pending_tasks)
            ),
            self.supervisor.run(
                "memory.recent_turns",
                budget,
                self.structured.recent_turns(user_id, limits.recent_turns)
            ),
            self.supervisor.run(
                "memory.semantic",
                budget,
                self.semantic.query(user_id, current_message, limits.semantic_matches)
            ),
        );

        let mut bundle = ContextBundle::default();
        match preferences {
            TaskResult::Success(found) => bundle.preferences = found,
            TaskResult::Timeout | TaskResult::Failure(_) => bundle.degraded.push("preferences"),
        }
        match tasks {
            TaskResult::Success(found) => bundle.tasks = found,
            TaskResult::Timeout | TaskResult::Failure(_) => bundle.degraded.push("tasks"),
        }
        match turns {
            TaskResult::Success(found) => bundle.recent_turns = found,
            TaskResult::Timeout | TaskResult::Failure(_) => bundle.degraded.push("recent_turns"),
        }
        match semantic {
            TaskResult::Success(found) => {
                bundle.semantic = found
                    .into_iter()
                    .filter(|entry| entry.score >= limits.min_similarity)
                    .take(limits.semantic_matches)
                    .collect();
            }
            TaskResult::Timeout | TaskResult::Failure(_) => bundle.degraded.push("semantic"),
        }

        info!(
            event_name = "context.built",
            user_id = %user_id,
            tasks = bundle.tasks.len(),
            recent_turns = bundle.recent_turns.len(),
            semantic = bundle.semantic.len(),
            degraded = ?bundle.degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "memory context assembled"
        );
        bundle
    }
}
