//! A runtime wired to in-memory stores, for handler tests that never reach
//! an external service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use concierge_agent::{AgentRuntime, RuntimeServices};
use concierge_core::audit::InMemoryAuditSink;
use concierge_core::cache::RecordCache;
use concierge_core::config::AppConfig;
use concierge_core::domain::memory::UserId;
use concierge_core::domain::record::{Record, TableName};
use concierge_core::embedding::HashingEmbedder;
use concierge_core::errors::ServiceError;
use concierge_core::ports::{Embedder, MessagingTransport};
use concierge_core::supervisor::Supervisor;
use concierge_db::{InMemoryRecordStore, InMemorySemanticMemory, InMemoryStructuredMemory};

use crate::clients::{
    ChatCompletionClient, PlacesSearchClient, ResendEmailSender, UnconfiguredCalendar,
    WebSearchClient,
};

#[derive(Default)]
pub(crate) struct RecordingTransport {
    replies: Mutex<Vec<(String, String)>>,
}

impl RecordingTransport {
    pub(crate) fn replies(&self) -> Vec<(String, String)> {
        match self.replies.lock() {
            Ok(replies) => replies.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl MessagingTransport for RecordingTransport {
    async fn send(&self, user_id: &UserId, text: &str) -> Result<(), ServiceError> {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push((user_id.as_str().to_owned(), text.to_owned()));
        }
        Ok(())
    }

    async fn send_interim(&self, _user_id: &UserId, _text: &str) -> Result<(), ServiceError> {
        Ok(())
    }
}

pub(crate) fn offline_runtime(transport: Arc<RecordingTransport>) -> AgentRuntime {
    let config = AppConfig::default();
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
    let contacts = vec![Record::new("John Carter").with_field("email", "john@example.com")];
    let records = RecordCache::new(
        Arc::new(InMemoryRecordStore::with_records(TableName::contacts(), contacts)),
        Supervisor::new(config.budgets.budgets()),
        Duration::from_secs(config.cache.ttl_secs),
    );

    let services = RuntimeServices {
        records: Arc::new(records),
        structured: Arc::new(InMemoryStructuredMemory::default()),
        semantic: Arc::new(InMemorySemanticMemory::new(embedder.clone())),
        embedder,
        completion: Arc::new(ChatCompletionClient::from_config(&config.llm).unwrap()),
        places: Arc::new(PlacesSearchClient::from_config(&config.search).unwrap()),
        web: Arc::new(WebSearchClient::from_config(&config.search).unwrap()),
        calendar: Arc::new(UnconfiguredCalendar),
        email: Arc::new(ResendEmailSender::from_config(&config.email).unwrap()),
        transport,
        audit: Arc::new(InMemoryAuditSink::default()),
    };
    AgentRuntime::new(&config, services)
}
