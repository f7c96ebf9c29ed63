use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::intent::IntentCategory;

/// Messaging address of the person on the other end, e.g. `whatsapp:+9715...`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub email_tone: String,
    pub email_signoff: String,
    pub work_hours: String,
    pub favorite_locations: Vec<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            email_tone: "professional".to_owned(),
            email_signoff: "Best regards".to_owned(),
            work_hours: "9am-5pm".to_owned(),
            favorite_locations: Vec::new(),
        }
    }
}

impl Preferences {
    /// Applies an update field by field; absent fields keep their value.
    pub fn apply(&mut self, update: &PreferenceUpdate) {
        if let Some(tone) = &update.email_tone {
            self.email_tone = tone.clone();
        }
        if let Some(signoff) = &update.email_signoff {
            self.email_signoff = signoff.clone();
        }
        if let Some(work_hours) = &update.work_hours {
            self.work_hours = work_hours.clone();
        }
        if let Some(location) = &update.add_favorite_location {
            if !self.favorite_locations.iter().any(|known| known.eq_ignore_ascii_case(location)) {
                self.favorite_locations.push(location.clone());
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceUpdate {
    pub email_tone: Option<String>,
    pub email_signoff: Option<String>,
    pub work_hours: Option<String>,
    pub add_favorite_location: Option<String>,
}

impl PreferenceUpdate {
    pub fn is_empty(&self) -> bool {
        self.email_tone.is_none()
            && self.email_signoff.is_none()
            && self.work_hours.is_none()
            && self.add_favorite_location.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub message: String,
    pub reply: String,
    pub intent: Option<IntentCategory>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Done,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "done" => Some(Self::Done),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTask {
    pub id: String,
    pub task_type: String,
    pub description: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

/// A task to record. The id is assigned up front so a later turn can resolve
/// the task without reading it back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub task_type: String,
    pub description: String,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_task_id(),
            task_type: task_type.into(),
            description: description.into(),
        }
    }
}

pub fn new_task_id() -> String {
    format!("task-{}", uuid::Uuid::new_v4())
}

/// Rows removed by one retention sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedRows {
    pub conversation_turns: u64,
    pub tasks: u64,
    pub semantic_entries: u64,
}

impl PrunedRows {
    pub fn total(&self) -> u64 {
        self.conversation_turns + self.tasks + self.semantic_entries
    }
}

/// Summary of a user's recent history, served by the memory API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub total_conversations: usize,
    pub pending_tasks_count: usize,
    pub most_common_intent: String,
    pub intent_frequency: BTreeMap<String, usize>,
    pub has_pending_tasks: bool,
}

impl ConversationAnalysis {
    /// Ties on the most common intent go to the alphabetically first name.
    pub fn from_history(turns: &[ConversationTurn], pending_tasks: &[UserTask]) -> Self {
        let mut intent_frequency = BTreeMap::new();
        for intent in turns.iter().filter_map(|turn| turn.intent) {
            *intent_frequency.entry(intent.as_str().to_owned()).or_insert(0) += 1;
        }
        let most_common_intent = intent_frequency
            .iter()
            .fold(None::<(&String, usize)>, |best, (name, count)| match best {
                Some((_, best_count)) if best_count >= *count => best,
                _ => Some((name, *count)),
            })
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "unknown".to_owned());

        Self {
            total_conversations: turns.len(),
            pending_tasks_count: pending_tasks.len(),
            most_common_intent,
            intent_frequency,
            has_pending_tasks: !pending_tasks.is_empty(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticEntry {
    pub text: String,
    pub intent: Option<IntentCategory>,
    pub embedding: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticMatch {
    pub text: String,
    pub intent: Option<IntentCategory>,
    pub score: f32,
}
