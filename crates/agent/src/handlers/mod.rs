//! One handler per routed intent category.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use concierge_core::cache::CacheError;
use concierge_core::domain::intent::IntentCategory;
use concierge_core::domain::memory::UserId;
use concierge_core::errors::TurnError;
use concierge_core::supervisor::Deadline;

use crate::deferred::WriteSignals;

pub mod calendar;
pub mod contact;
pub mod email;
pub mod general;
pub mod places;
pub mod web;

pub use calendar::CalendarHandler;
pub use contact::ContactHandler;
pub use email::EmailHandler;
pub use general::GeneralHandler;
pub use places::PlaceSearchHandler;
pub use web::WebSearchHandler;

/// Everything a handler may read about the current turn.
#[derive(Clone, Debug)]
pub struct TurnContext {
    pub user_id: UserId,
    pub correlation_id: String,
    pub message: String,
    /// Rendered memory context, possibly empty.
    pub memory: String,
    pub now: DateTime<FixedOffset>,
    pub deadline: Deadline,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub reply: String,
    pub signals: WriteSignals,
}

impl HandlerOutcome {
    pub fn reply(reply: impl Into<String>) -> Self {
        Self { reply: reply.into(), signals: WriteSignals::default() }
    }

    pub fn with_signals(mut self, signals: WriteSignals) -> Self {
        self.signals = signals;
        self
    }
}

/// Record cache failures seen by a handler; the cache already supervised the call.
pub(crate) fn cache_failure(operation: &str, error: CacheError) -> TurnError {
    match error {
        CacheError::Timeout { budget, .. } | CacheError::WriteTimeout { budget, .. } => {
            TurnError::Timeout { operation: operation.to_owned(), budget }
        }
        other => TurnError::dependency(operation, other),
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn category(&self) -> IntentCategory;
    async fn handle(&self, turn: &TurnContext) -> Result<HandlerOutcome, TurnError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<IntentCategory, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    /// Replaces any handler already registered for the same category.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.category(), handler);
    }

    pub fn get(&self, category: IntentCategory) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&category).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
