//! Scripted collaborators shared by the unit tests in this crate.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, TimeZone};

use concierge_core::cache::RecordCache;
use concierge_core::domain::memory::UserId;
use concierge_core::domain::record::{Record, TableName};
use concierge_core::errors::ServiceError;
use concierge_core::ports::{
    CalendarEvent, CalendarService, CompletionLimits, CompletionService, EmailSender,
    OutgoingEmail, Prompt, SearchHit, SearchService,
};
use concierge_core::schedule::TimeWindow;
use concierge_core::supervisor::{Budgets, Deadline, Supervisor};
use concierge_db::InMemoryRecordStore;

use crate::handlers::TurnContext;
use crate::llm::LlmGateway;

fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Returns queued completions in order; an empty queue is an outage.
#[derive(Default)]
pub(crate) struct ScriptedCompletion {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedCompletion {
    pub(crate) fn new<'a>(replies: impl IntoIterator<Item = &'a str>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(str::to_owned).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn prompts(&self) -> Vec<Prompt> {
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
        guard(&self.prompts).push(prompt.clone());
        guard(&self.replies)
            .pop_front()
            .ok_or_else(|| ServiceError::unavailable("completion provider down"))
    }
}

#[derive(Default)]
pub(crate) struct RecordingEmailSender {
    sent: Mutex<Vec<OutgoingEmail>>,
    failing: bool,
    delay: Option<Duration>,
}

impl RecordingEmailSender {
    pub(crate) fn failing() -> Self {
        Self { failing: true, ..Self::default() }
    }

    /// Accepts each email only after `delay`.
    pub(crate) fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    pub(crate) fn sent(&self) -> Vec<OutgoingEmail> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, ServiceError> {
        if self.failing {
            return Err(ServiceError::unavailable("smtp relay refused connection"));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut sent = guard(&self.sent);
        sent.push(email.clone());
        Ok(format!("msg-{}", sent.len()))
    }
}

#[derive(Default)]
pub(crate) struct ScriptedSearch {
    hits: Vec<SearchHit>,
    delay: Option<Duration>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub(crate) fn with_hits(hits: Vec<SearchHit>) -> Self {
        Self { hits, ..Self::default() }
    }

    pub(crate) fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::default() }
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        guard(&self.queries).clone()
    }
}

#[async_trait]
impl SearchService for ScriptedSearch {
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, ServiceError> {
        guard(&self.queries).push(text.to_owned());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.hits.iter().take(limit).cloned().collect())
    }
}

pub(crate) fn hit(title: &str, snippet: &str) -> SearchHit {
    SearchHit {
        title: title.to_owned(),
        snippet: snippet.to_owned(),
        url: Some(format!("https://example.com/{}", title.to_lowercase().replace(' ', "-"))),
        address: None,
        rating: None,
    }
}

#[derive(Default)]
pub(crate) struct ScriptedCalendar {
    events: Vec<CalendarEvent>,
    windows: Mutex<Vec<TimeWindow>>,
    created: Mutex<Vec<CalendarEvent>>,
}

impl ScriptedCalendar {
    pub(crate) fn with_events(events: Vec<CalendarEvent>) -> Self {
        Self { events, ..Self::default() }
    }

    pub(crate) fn windows(&self) -> Vec<TimeWindow> {
        guard(&self.windows).clone()
    }

    pub(crate) fn created(&self) -> Vec<CalendarEvent> {
        guard(&self.created).clone()
    }
}

#[async_trait]
impl CalendarService for ScriptedCalendar {
    async fn list_events(
        &self,
        window: &TimeWindow,
        max_results: usize,
    ) -> Result<Vec<CalendarEvent>, ServiceError> {
        guard(&self.windows).push(window.clone());
        Ok(self
            .events
            .iter()
            .filter(|event| window.contains(&event.start))
            .take(max_results)
            .cloned()
            .collect())
    }

    async fn create_event(&self, event: &CalendarEvent) -> Result<CalendarEvent, ServiceError> {
        guard(&self.created).push(event.clone());
        Ok(CalendarEvent { link: Some("https://calendar.example.com/e/1".to_owned()), ..event.clone() })
    }
}

pub(crate) fn gulf_offset() -> FixedOffset {
    FixedOffset::east_opt(4 * 3600).unwrap()
}

/// Wednesday 2025-03-12 09:30 at UTC+04:00.
pub(crate) fn wednesday_morning() -> DateTime<FixedOffset> {
    gulf_offset().with_ymd_and_hms(2025, 3, 12, 9, 30, 0).unwrap()
}

pub(crate) fn user() -> UserId {
    UserId::new("whatsapp:+971500000001")
}

pub(crate) fn turn(message: &str) -> TurnContext {
    TurnContext {
        user_id: user(),
        correlation_id: "turn-test".to_owned(),
        message: message.to_owned(),
        memory: String::new(),
        now: wednesday_morning(),
        deadline: Deadline::after(Duration::from_secs(60)),
    }
}

pub(crate) fn supervisor() -> Supervisor {
    Supervisor::new(Budgets::default())
}

pub(crate) fn gateway(completion: Arc<ScriptedCompletion>) -> LlmGateway {
    LlmGateway::new(completion, supervisor(), 600)
}

pub(crate) fn contact_records() -> Vec<Record> {
    vec![
        Record::new("John Carter")
            .with_field("email", "john.carter@example.com")
            .with_field("phone", "+971500000101"),
        Record::new("Amira Haddad").with_field("email", "amira@example.com"),
    ]
}

pub(crate) fn contacts_cache() -> (Arc<InMemoryRecordStore>, Arc<RecordCache>) {
    let store =
        Arc::new(InMemoryRecordStore::with_records(TableName::contacts(), contact_records()));
    let cache = RecordCache::new(store.clone(), supervisor(), Duration::from_secs(300));
    (store, Arc::new(cache))
}
