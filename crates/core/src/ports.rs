//! Narrow interfaces to every external collaborator the turn pipeline uses.
//!
//! Implementations live in `concierge-db` (SQLite), `concierge-twilio`
//! (messaging) and the server's HTTP clients; tests use scripted fakes.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::memory::{
    ConversationTurn, NewTask, PreferenceUpdate, Preferences, PrunedRows, SemanticEntry,
    SemanticMatch, TaskStatus, UserId, UserTask,
};
use crate::domain::record::{Record, TableName};
use crate::errors::ServiceError;
use crate::schedule::TimeWindow;

/// Slow external tabular store (a spreadsheet of contacts, for example).
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_all(&self, table: &TableName) -> Result<Vec<Record>, ServiceError>;
    async fn create(&self, table: &TableName, record: Record) -> Result<(), ServiceError>;
    async fn update_field(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), ServiceError>;
    async fn delete(&self, table: &TableName, key: &str) -> Result<(), ServiceError>;
}

/// Relational memory: preferences, tasks and the conversation log.
#[async_trait]
pub trait StructuredMemory: Send + Sync {
    async fn get_preferences(&self, user_id: &UserId) -> Result<Option<Preferences>, ServiceError>;
    async fn update_preferences(
        &self,
        user_id: &UserId,
        update: &PreferenceUpdate,
    ) -> Result<(), ServiceError>;
    /// Newest first. `None` returns tasks in every status.
    async fn get_tasks(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<UserTask>, ServiceError>;
    async fn create_task(&self, user_id: &UserId, task: &NewTask) -> Result<(), ServiceError>;
    /// `NotFound` when the user has no task with this id.
    async fn update_task_status(
        &self,
        user_id: &UserId,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), ServiceError>;
    /// Most recent first.
    async fn recent_turns(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ServiceError>;
    async fn append_turn(&self, user_id: &UserId, turn: &ConversationTurn)
        -> Result<(), ServiceError>;
    /// Drops conversation turns created before `cutoff` and tasks resolved
    /// before it. Pending tasks and preferences are kept.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PrunedRows, ServiceError>;
}

/// Similarity recall over past messages.
#[async_trait]
pub trait SemanticMemory: Send + Sync {
    /// Best matches first.
    async fn query(
        &self,
        user_id: &UserId,
        text: &str,
        k: usize,
    ) -> Result<Vec<SemanticMatch>, ServiceError>;
    async fn upsert(&self, user_id: &UserId, entry: SemanticEntry) -> Result<(), ServiceError>;
    /// Returns the number of entries removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError>;
}

/// Text to vector. Vectors from different models live in different spaces
/// and score zero against each other.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
    fn model(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompletionLimits {
    pub max_tokens: u32,
    pub temperature: f32,
    pub json_output: bool,
}

impl Default for CompletionLimits {
    fn default() -> Self {
        Self { max_tokens: 600, temperature: 0.3, json_output: false }
    }
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, prompt: &Prompt, limits: CompletionLimits)
        -> Result<String, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: Option<String>,
    pub address: Option<String>,
    pub rating: Option<f32>,
}

#[async_trait]
pub trait SearchService: Send + Sync {
    /// Ranked best-first.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub summary: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub description: Option<String>,
    pub link: Option<String>,
}

#[async_trait]
pub trait CalendarService: Send + Sync {
    async fn list_events(
        &self,
        window: &TimeWindow,
        max_results: usize,
    ) -> Result<Vec<CalendarEvent>, ServiceError>;
    async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ServiceError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Returns the provider's message id.
    async fn send(&self, email: &OutgoingEmail) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait MessagingTransport: Send + Sync {
    /// The primary reply; called exactly once per turn.
    async fn send(&self, user_id: &UserId, text: &str) -> Result<(), ServiceError>;
    /// A progress notice; never carries the reply.
    async fn send_interim(&self, user_id: &UserId, text: &str) -> Result<(), ServiceError>;
}
