//! Scripted collaborators that journal every call so tests can assert on
//! which services a turn touched, and in what order.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use concierge_agent::{AgentRuntime, RuntimeServices};
use concierge_core::audit::InMemoryAuditSink;
use concierge_core::cache::RecordCache;
use concierge_core::config::AppConfig;
use concierge_core::domain::memory::{
    ConversationTurn, NewTask, PreferenceUpdate, Preferences, PrunedRows, SemanticEntry,
    SemanticMatch, TaskStatus, UserId, UserTask,
};
use concierge_core::domain::record::{Record, TableName};
use concierge_core::embedding::HashingEmbedder;
use concierge_core::errors::ServiceError;
use concierge_core::ports::{
    CalendarEvent, CalendarService, CompletionLimits, CompletionService, EmailSender,
    MessagingTransport, OutgoingEmail, Prompt, RecordStore, SearchHit, SearchService,
    SemanticMemory, StructuredMemory,
};
use concierge_core::schedule::TimeWindow;
use concierge_core::supervisor::{Budgets, Supervisor};
use concierge_db::{InMemoryRecordStore, InMemorySemanticMemory, InMemoryStructuredMemory};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Ordered log of collaborator calls.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn record(&self, entry: &str) {
        guard(&self.entries).push(entry.to_owned());
    }

    pub fn entries(&self) -> Vec<String> {
        guard(&self.entries).clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|recorded| recorded == entry)
    }
}

pub struct JournaledRecords {
    inner: InMemoryRecordStore,
    journal: Arc<Journal>,
}

#[async_trait]
impl RecordStore for JournaledRecords {
    async fn list_all(&self, table: &TableName) -> Result<Vec<Record>, ServiceError> {
        self.journal.record("records.list_all");
        self.inner.list_all(table).await
    }

    async fn create(&self, table: &TableName, record: Record) -> Result<(), ServiceError> {
        self.journal.record("records.create");
        self.inner.create(table, record).await
    }

    async fn update_field(
        &self,
        table: &TableName,
        key: &str,
        field: &str,
        value: &str,
    ) -> Result<(), ServiceError> {
        self.journal.record("records.update_field");
        self.inner.update_field(table, key, field, value).await
    }

    async fn delete(&self, table: &TableName, key: &str) -> Result<(), ServiceError> {
        self.journal.record("records.delete");
        self.inner.delete(table, key).await
    }
}

pub struct JournaledStructured {
    pub inner: InMemoryStructuredMemory,
    journal: Arc<Journal>,
}

#[async_trait]
impl StructuredMemory for JournaledStructured {
    async fn get_preferences(&self, user_id: &UserId) -> Result<Option<Preferences>, ServiceError> {
        self.journal.record("structured.get_preferences");
        self.inner.get_preferences(user_id).await
    }

    async fn update_preferences(
        &self,
        user_id: &UserId,
        update: &PreferenceUpdate,
    ) -> Result<(), ServiceError> {
        self.journal.record("structured.update_preferences");
        self.inner.update_preferences(user_id, update).await
    }

    async fn get_tasks(
        &self,
        user_id: &UserId,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<UserTask>, ServiceError> {
        self.journal.record("structured.get_tasks");
        self.inner.get_tasks(user_id, status, limit).await
    }

    async fn create_task(&self, user_id: &UserId, task: &NewTask) -> Result<(), ServiceError> {
        self.journal.record("structured.create_task");
        self.inner.create_task(user_id, task).await
    }

    async fn update_task_status(
        &self,
        user_id: &UserId,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), ServiceError> {
        self.journal.record("structured.update_task_status");
        self.inner.update_task_status(user_id, task_id, status).await
    }

    async fn recent_turns(
        &self,
        user_id: &UserId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, ServiceError> {
        self.journal.record("structured.recent_turns");
        self.inner.recent_turns(user_id, limit).await
    }

    async fn append_turn(
        &self,
        user_id: &UserId,
        turn: &ConversationTurn,
    ) -> Result<(), ServiceError> {
        self.journal.record("structured.append_turn");
        self.inner.append_turn(user_id, turn).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<PrunedRows, ServiceError> {
        self.journal.record("structured.prune_before");
        self.inner.prune_before(cutoff).await
    }
}

pub struct JournaledSemantic {
    inner: InMemorySemanticMemory,
    delay: Option<Duration>,
    journal: Arc<Journal>,
}

#[async_trait]
impl SemanticMemory for JournaledSemantic {
    async fn query(
        &self,
        user_id: &UserId,
        text: &str,
        k: usize,
    ) -> Result<Vec<SemanticMatch>, ServiceError> {
        self.journal.record("semantic.query");
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.query(user_id, text, k).await
    }

    async fn upsert(&self, user_id: &UserId, entry: SemanticEntry) -> Result<(), ServiceError> {
        self.journal.record("semantic.upsert");
        self.inner.upsert(user_id, entry).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        self.journal.record("semantic.prune_before");
        self.inner.prune_before(cutoff).await
    }
}

pub struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Prompt>>,
    journal: Arc<Journal>,
}

impl ScriptedCompletion {
    pub fn prompts(&self) -> Vec<Prompt> {
        guard(&self.prompts).clone()
    }
}

#[async_trait]
impl CompletionService for ScriptedCompletion {
    async fn complete(
        &self,
        prompt: &Prompt,
        _limits: CompletionLimits,
    ) -> Result<String, ServiceError> {
        self.journal.record("completion.complete");
        guard(&self.prompts).push(prompt.clone());
        guard(&self.replies)
            .pop_front()
            .ok_or_else(|| ServiceError::unavailable("inference backend returned 503"))
    }
}

pub struct JournaledSearch {
    name: &'static str,
    journal: Arc<Journal>,
}

#[async_trait]
impl SearchService for JournaledSearch {
    async fn query(&self, _text: &str, _limit: usize) -> Result<Vec<SearchHit>, ServiceError> {
        self.journal.record(self.name);
        Ok(Vec::new())
    }
}

pub struct JournaledCalendar {
    journal: Arc<Journal>,
}

#[async_trait]
impl CalendarService for JournaledCalendar {
    async fn list_events(
        &self,
        _window: &TimeWindow,
        _max_results: usize,
    ) -> Result<Vec<CalendarEvent>, ServiceError> {
        self.journal.record("calendar.list_events");
        Ok(Vec::new())
    }

    async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ServiceError> {
        self.journal.record("calendar.create_event");
        Ok(event.clone())
    }
}

pub struct RecordingEmail {
    sent: Mutex<Vec<OutgoingEmail>>,
    journal: Arc<Journal>,
}

impl RecordingEmail {
    pub fn sent(&self) -> Vec<OutgoingEmail> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmail {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, ServiceError> {
        self.journal.record("email.send");
        guard(&self.sent).push(email.clone());
        Ok("email-1".to_owned())
    }
}

pub struct RecordingTransport {
    replies: Mutex<Vec<String>>,
    interim: Mutex<Vec<String>>,
    interim_delay: Option<Duration>,
    journal: Arc<Journal>,
}

impl RecordingTransport {
    pub fn replies(&self) -> Vec<String> {
        guard(&self.replies).clone()
    }

    pub fn interim(&self) -> Vec<String> {
        guard(&self.interim).clone()
    }
}

#[async_trait]
impl MessagingTransport for RecordingTransport {
    async fn send(&self, _user_id: &UserId, text: &str) -> Result<(), ServiceError> {
        self.journal.record("transport.send");
        guard(&self.replies).push(text.to_owned());
        Ok(())
    }

    async fn send_interim(&self, _user_id: &UserId, text: &str) -> Result<(), ServiceError> {
        self.journal.record("transport.send_interim");
        if let Some(delay) = self.interim_delay {
            tokio::time::sleep(delay).await;
        }
        guard(&self.interim).push(text.to_owned());
        Ok(())
    }
}

pub fn user() -> UserId {
    UserId::new("whatsapp:+971500000001")
}

pub fn contacts() -> Vec<Record> {
    vec![
        Record::new("John Carter")
            .with_field("email", "john.carter@example.com")
            .with_field("phone", "+971500000101"),
        Record::new("Amira Haddad").with_field("email", "amira@example.com"),
    ]
}

pub struct HarnessBuilder {
    config: AppConfig,
    completions: Vec<String>,
    semantic_delay: Option<Duration>,
    interim_delay: Option<Duration>,
    structured: InMemoryStructuredMemory,
}

impl HarnessBuilder {
    pub fn completions<'a>(mut self, replies: impl IntoIterator<Item = &'a str>) -> Self {
        self.completions = replies.into_iter().map(str::to_owned).collect();
        self
    }

    pub fn semantic_delay(mut self, delay: Duration) -> Self {
        self.semantic_delay = Some(delay);
        self
    }

    pub fn interim_delay(mut self, delay: Duration) -> Self {
        self.interim_delay = Some(delay);
        self
    }

    pub fn interim_notices(mut self, enabled: bool) -> Self {
        self.config.assistant.interim_notices = enabled;
        self
    }

    pub fn structured(mut self, structured: InMemoryStructuredMemory) -> Self {
        self.structured = structured;
        self
    }

    pub fn build(self) -> Harness {
        let journal = Arc::new(Journal::default());
        let embedder = Arc::new(HashingEmbedder::default());
        let store = Arc::new(JournaledRecords {
            inner: InMemoryRecordStore::with_records(TableName::contacts(), contacts()),
            journal: journal.clone(),
        });
        let records = Arc::new(RecordCache::new(
            store.clone(),
            Supervisor::new(Budgets::default()),
            self.config.cache.ttl(),
        ));
        let structured =
            Arc::new(JournaledStructured { inner: self.structured, journal: journal.clone() });
        let semantic = Arc::new(JournaledSemantic {
            inner: InMemorySemanticMemory::new(embedder.clone()),
            delay: self.semantic_delay,
            journal: journal.clone(),
        });
        let completion = Arc::new(ScriptedCompletion {
            replies: Mutex::new(self.completions.into()),
            prompts: Mutex::new(Vec::new()),
            journal: journal.clone(),
        });
        let email = Arc::new(RecordingEmail { sent: Mutex::new(Vec::new()), journal: journal.clone() });
        let transport = Arc::new(RecordingTransport {
            replies: Mutex::new(Vec::new()),
            interim: Mutex::new(Vec::new()),
            interim_delay: self.interim_delay,
            journal: journal.clone(),
        });
        let audit = InMemoryAuditSink::default();

        let runtime = AgentRuntime::new(
            &self.config,
            RuntimeServices {
                records,
                structured: structured.clone(),
                semantic,
                embedder,
                completion: completion.clone(),
                places: Arc::new(JournaledSearch { name: "places.query", journal: journal.clone() }),
                web: Arc::new(JournaledSearch { name: "web.query", journal: journal.clone() }),
                calendar: Arc::new(JournaledCalendar { journal: journal.clone() }),
                email: email.clone(),
                transport: transport.clone(),
                audit: Arc::new(audit.clone()),
            },
        );

        Harness { runtime, journal, completion, email, transport, structured, audit }
    }
}

pub struct Harness {
    pub runtime: AgentRuntime,
    pub journal: Arc<Journal>,
    pub completion: Arc<ScriptedCompletion>,
    pub email: Arc<RecordingEmail>,
    pub transport: Arc<RecordingTransport>,
    pub structured: Arc<JournaledStructured>,
    pub audit: InMemoryAuditSink,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            config: AppConfig::default(),
            completions: Vec::new(),
            semantic_delay: None,
            interim_delay: None,
            structured: InMemoryStructuredMemory::default(),
        }
    }
}
