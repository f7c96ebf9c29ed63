use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use concierge_core::domain::memory::{
    ConversationTurn, NewTask, PreferenceUpdate, Preferences, PrunedRows, SemanticEntry,
    SemanticMatch, TaskStatus, UserId, UserTask,
};
use concierge_core::domain::record::{Record, TableName};
use concierge_core::embedding::cosine_similarity;
use concierge_core::errors::ServiceError;
use concierge_core::ports::{Embedder, RecordStore, SemanticMemory, StructuredMemory};

#[derive(Default)]
pub struct InMemoryRecordStore {
    tables: RwLock<HashMap<TableName, BTreeMap<String, Record>>>,
}

impl InMemoryRecordStore {
    pub fn with_records(table: TableName, records: Vec<Record>) -> Self {
        let rows = records.into_iter().map(|record| (record.key.clone(), record)).collect();
        Self { tables: RwLock::new(HashMap::from([(table, rows)])) }
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_all(&self, table: &TableName) -> Result<Vec<Record>, ServiceError> {
        let tables = self.tables.read().await;
        Ok(tables.get(table).map(|rows| rows.values().cloned().collect()).unwrap_or_default())
    }

    async fn create(&self, table: &TableName, record: Record) -> Result<(), ServiceError> {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.clone()).or_default();
        if rows.contains_key(&record.key) {
            return Err(ServiceError::Rejected(format!("`{}` already exists", record.key)));
        }
        rows.insert(record.key.clone(), record);
        Ok(())
    }

    async fn update_field(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), ServiceError> {
        let mut tables = self.tables.write().await;
        let record = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(key))
            .ok_or_else(|| ServiceError::NotFound(format!("`{key}` in `{table}`")))?;
        record.fields.insert(field.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, table: &TableName, key: &str) -> Result<(), ServiceError> {
        let mut tables = self.tables.write().await;
        tables
            .get_mut(table)
            .and_then(|rows| rows.remove(key))
            .map(|_| ())
            .ok_or_else(|| ServiceError::NotFound(format!("`{key}` in `{table}`")))
    }
}

struct StoredTask {
    task: UserTask,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryStructuredMemory {
    preferences: RwLock<HashMap<UserId, Preferences>>,
    tasks: RwLock<HashMap<UserId, Vec<StoredTask>>>,
    turns: RwLock<HashMap<UserId, Vec<ConversationTurn>>>,
}

#[async_trait::async_trait]
impl StructuredMemory for InMemoryStructuredMemory {
    async fn get_preferences(&self, user_id: &UserId) -> Result<Option<Preferences>, ServiceError> {
        let preferences = self.preferences.read().await;
        Ok(preferences.get(user_id).cloned())
    }

    async fn update_preferences(
        &self,
        user_id: &UserId,
        update: &PreferenceUpdate,
    ) -> Result<(), ServiceError> {
        let mut preferences = self.preferences.write().await;
        preferences.entry(user_id.clone()).or_default().apply(update);
        Ok(())
    }

    async fn get_tasks(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<UserTask>, ServiceError> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .get(user_id)
            .map(|tasks| {
                tasks
                    .iter()
                    .rev()
                    .map(|stored| &stored.task)
                    .filter(|task| status.map_or(true, |status| task.status == status))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_task(&self, user_id: &UserId, task: &NewTask) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.write().await;
        let user_tasks = tasks.entry(user_id.clone()).or_default();
        if user_tasks.iter().any(|stored| stored.task.id == task.id) {
            return Err(ServiceError::Rejected(format!("task {} already exists", task.id)));
        }
        let now = Utc::now();
        user_tasks.push(StoredTask {
            task: UserTask {
                id: task.id.clone(),
                task_type: task.task_type.clone(),
                description: task.description.clone(),
                status: TaskStatus::Pending,
                created_at: now,
            },
            updated_at: now,
        });
        Ok(())
    }

    async fn update_task_status(
        &self,
        user_id: &UserId,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), ServiceError> {
        let mut tasks = self.tasks.write().await;
        let stored = tasks
            .get_mut(user_id)
            .and_then(|tasks| tasks.iter_mut().find(|stored| stored.task.id == task_id))
            .ok_or_else(|| ServiceError::NotFound(format!("task {task_id}")))?;
        stored.task.status = status;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn recent_turns(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ServiceError> {
        let turns = self.turns.read().await;
        Ok(turns
            .get(user_id)
            .map(|turns| turns.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn append_turn(
        &self,
        user_id: &UserId,
        turn: &ConversationTurn,
    ) -> Result<(), ServiceError> {
        let mut turns = self.turns.write().await;
        turns.entry(user_id.clone()).or_default().push(turn.clone());
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PrunedRows, ServiceError> {
        let mut pruned = PrunedRows::default();
        for user_turns in self.turns.write().await.values_mut() {
            let before = user_turns.len();
            user_turns.retain(|turn| turn.created_at >= cutoff);
            pruned.conversation_turns += (before - user_turns.len()) as u64;
        }
        for user_tasks in self.tasks.write().await.values_mut() {
            let before = user_tasks.len();
            user_tasks.retain(|stored| !stored.task.status.is_resolved() || stored.updated_at >= cutoff);
            pruned.tasks += (before - user_tasks.len()) as u64;
        }
        Ok(pruned)
    }
}

pub struct InMemorySemanticMemory {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<UserId, Vec<(SemanticEntry, DateTime<Utc>)>>>,
}

impl InMemorySemanticMemory {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder, entries: RwLock::new(HashMap::new()) }
    }
}

#[async_trait::async_trait]
impl SemanticMemory for InMemorySemanticMemory {
    async fn query(
        &self,
        user_id: &UserId,
        text: &str,
        k: usize,
    ) -> Result<Vec<SemanticMatch>, ServiceError> {
        let query = self.embedder.embed(text).await?;
        let entries = self.entries.read().await;
        let mut matches: Vec<SemanticMatch> = entries
            .get(user_id)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(entry, _)| SemanticMatch {
                        text: entry.text.clone(),
                        intent: entry.intent,
                        score: cosine_similarity(&query, &entry.embedding),
                    })
                    .collect()
            })
            .unwrap_or_default();
        matches.sort_by(|left, right| right.score.total_cmp(&left.score));
        matches.truncate(k);
        Ok(matches)
    }

    async fn upsert(&self, user_id: &UserId, entry: SemanticEntry) -> Result<(), ServiceError> {
        let mut entries = self.entries.write().await;
        let user_entries = entries.entry(user_id.clone()).or_default();
        let stored_at = Utc::now();
        match user_entries.iter_mut().find(|(existing, _)| existing.text == entry.text) {
            Some(existing) => *existing = (entry, stored_at),
            None => user_entries.push((entry, stored_at)),
        }
        Ok(())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut removed = 0;
        for user_entries in self.entries.write().await.values_mut() {
            let before = user_entries.len();
            user_entries.retain(|(_, stored_at)| *stored_at >= cutoff);
            removed += (before - user_entries.len()) as u64;
        }
        Ok(removed)
    }
}
