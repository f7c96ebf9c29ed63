//! The per-turn coordinator: classify, gather context, dispatch, reply, then
//! hand memory persistence to the deferred pipeline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Utc};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use concierge_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use concierge_core::cache::RecordCache;
use concierge_core::config::AppConfig;
use concierge_core::domain::intent::{Classification, IntentCategory};
use concierge_core::domain::memory::UserId;
use concierge_core::domain::record::TableName;
use concierge_core::errors::TurnError;
use concierge_core::ports::{
    CalendarService, CompletionService, EmailSender, Embedder, MessagingTransport,
    SearchService, SemanticMemory, StructuredMemory,
};
use concierge_core::schedule::{local_now, offset_from_minutes, policy_from_config};
use concierge_core::supervisor::{Deadline, Supervisor, TaskResult};

use crate::context::{ContextAggregator, ContextLimits};
use crate::deferred::{
    DeferredWrite, DeferredWritePipeline, DeferredWriter, EnqueueOutcome, WriteSignals,
};
use crate::handlers::{
    CalendarHandler, ContactHandler, EmailHandler, GeneralHandler, HandlerOutcome,
    HandlerRegistry, PlaceSearchHandler, TurnContext, WebSearchHandler,
};
use crate::llm::LlmGateway;
use crate::router::IntentRouter;
use crate::session::{PendingAction, SessionStore};

pub const INTERIM_NOTICE: &str = "Working on it...";

/// Every collaborator a runtime needs, already constructed.
#[derive(Clone)]
pub struct RuntimeServices {
    pub records: Arc<RecordCache>,
    pub structured: Arc<dyn StructuredMemory>,
    pub semantic: Arc<dyn SemanticMemory>,
    pub embedder: Arc<dyn Embedder>,
    pub completion: Arc<dyn CompletionService>,
    pub places: Arc<dyn SearchService>,
    pub web: Arc<dyn SearchService>,
    pub calendar: Arc<dyn CalendarService>,
    pub email: Arc<dyn EmailSender>,
    pub transport: Arc<dyn MessagingTransport>,
    pub audit: Arc<dyn AuditSink>,
}

struct TurnOutcome {
    reply: String,
    category: Option<IntentCategory>,
    signals: WriteSignals,
}

pub struct AgentRuntime {
    router: IntentRouter,
    context: ContextAggregator,
    limits: ContextLimits,
    handlers: HandlerRegistry,
    email: Arc<EmailHandler>,
    places: Arc<PlaceSearchHandler>,
    sessions: Arc<SessionStore>,
    supervisor: Supervisor,
    records: Arc<RecordCache>,
    transport: Arc<dyn MessagingTransport>,
    audit: Arc<dyn AuditSink>,
    deferred: DeferredWritePipeline,
    offset: FixedOffset,
    interim_notices: bool,
}

impl AgentRuntime {
    /// Wires handlers and starts the deferred write consumer, so it must be
    /// called inside a tokio runtime.
    pub fn new(config: &AppConfig, services: RuntimeServices) -> Self {
        let supervisor = Supervisor::new(config.budgets.budgets());
        let offset = offset_from_minutes(config.assistant.utc_offset_minutes);
        let contacts = TableName::new(config.cache.contacts_table.clone());
        let sessions = Arc::new(SessionStore::default());
        let llm =
            LlmGateway::new(services.completion.clone(), supervisor.clone(), config.llm.max_tokens);

        let email = Arc::new(EmailHandler::new(
            llm.clone(),
            services.records.clone(),
            contacts.clone(),
            sessions.clone(),
            services.email.clone(),
        ));
        let places = Arc::new(PlaceSearchHandler::new(
            llm.clone(),
            services.places.clone(),
            sessions.clone(),
            config.search.max_results,
        ));

        let mut handlers = HandlerRegistry::default();
        handlers.register(email.clone());
        handlers.register(places.clone());
        handlers.register(Arc::new(ContactHandler::new(
            llm.clone(),
            services.records.clone(),
            contacts,
        )));
        handlers.register(Arc::new(CalendarHandler::new(
            llm.clone(),
            services.calendar.clone(),
            Arc::from(policy_from_config(&config.assistant)),
        )));
        handlers.register(Arc::new(WebSearchHandler::new(
            llm.clone(),
            services.web.clone(),
            config.search.max_results,
        )));
        handlers.register(Arc::new(GeneralHandler::new(llm)));

        let writer = DeferredWriter::new(
            services.structured.clone(),
            services.semantic.clone(),
            services.embedder.clone(),
            supervisor.clone(),
            services.audit.clone(),
        );

        Self {
            router: IntentRouter::new(config.assistant.confidence_threshold, offset),
            context: ContextAggregator::new(
                services.structured,
                services.semantic,
                supervisor.clone(),
            ),
            limits: ContextLimits::from(&config.context),
            handlers,
            email,
            places,
            sessions,
            supervisor,
            records: services.records,
            transport: services.transport,
            audit: services.audit,
            deferred: DeferredWritePipeline::start(writer, &config.deferred),
            offset,
            interim_notices: config.assistant.interim_notices,
        }
    }

    pub fn records(&self) -> &Arc<RecordCache> {
        &self.records
    }

    pub fn deferred(&self) -> &DeferredWritePipeline {
        &self.deferred
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Runs one chat turn end to end and returns the reply that was sent.
    ///
    /// The reply goes to the transport exactly once, before any memory write
    /// is queued. Failures of mandatory calls become an apology; nothing here
    /// returns an error.
    pub async fn handle_turn(&self, user_id: &UserId, message: &str) -> String {
        let correlation_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let deadline = Deadline::after(self.supervisor.budgets().turn);
        let now = local_now(self.offset);

        info!(
            event_name = "ingress.turn.received",
            correlation_id = %correlation_id,
            user_id = %user_id,
            chars = message.chars().count(),
            "turn received"
        );
        self.audit.emit(AuditEvent::new(
            Some(user_id.clone()),
            &correlation_id,
            "ingress.turn.received",
            AuditCategory::Ingress,
            AuditOutcome::Success,
        ));

        let turn = TurnContext {
            user_id: user_id.clone(),
            correlation_id: correlation_id.clone(),
            message: message.to_owned(),
            memory: String::new(),
            now,
            deadline,
        };

        let outcome = match self.sessions.take(user_id) {
            Some(pending) => self.resume(pending, &turn).await,
            None => match self.router.classify_at(message, now) {
                Classification::FastReply(reply) => {
                    self.audit.emit(
                        AuditEvent::new(
                            Some(user_id.clone()),
                            &correlation_id,
                            "router.classified",
                            AuditCategory::Routing,
                            AuditOutcome::Success,
                        )
                        .with_metadata("path", "fast"),
                    );
                    // Nothing worth remembering on the fast path.
                    self.send_reply(user_id, &correlation_id, &reply).await;
                    self.log_completed(&correlation_id, None, started);
                    return reply;
                }
                Classification::Routed { category, confidence } => {
                    self.audit.emit(
                        AuditEvent::new(
                            Some(user_id.clone()),
                            &correlation_id,
                            "router.classified",
                            AuditCategory::Routing,
                            AuditOutcome::Success,
                        )
                        .with_metadata("path", "routed")
                        .with_metadata("category", category.as_str())
                        .with_metadata("confidence", confidence.to_string()),
                    );
                    self.dispatch(category, turn).await
                }
            },
        };

        self.send_reply(user_id, &correlation_id, &outcome.reply).await;
        self.enqueue(user_id, &correlation_id, message, &outcome);
        self.log_completed(&correlation_id, outcome.category, started);
        outcome.reply
    }

    /// Drains queued memory writes; see [`DeferredWritePipeline::shutdown`].
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.deferred.shutdown(grace).await
    }

    async fn resume(&self, pending: PendingAction, turn: &TurnContext) -> TurnOutcome {
        let (category, result) = match pending {
            PendingAction::EmailDraft(draft) => {
                (IntentCategory::Email, self.email.resolve_draft(turn, draft).await)
            }
            PendingAction::PlaceQuery { query } => (
                IntentCategory::PlaceSearch,
                self.places.search(turn, &query, turn.message.trim()).await,
            ),
        };
        info!(
            event_name = "session.resumed",
            correlation_id = %turn.correlation_id,
            category = category.as_str(),
            "continued pending conversation"
        );
        self.finish(category, turn, result)
    }

    /// The interim notice runs alongside context gathering and the handler.
    /// Both finish before the reply is sent, so the notice never trails it.
    async fn dispatch(&self, category: IntentCategory, turn: TurnContext) -> TurnOutcome {
        let user_id = turn.user_id.clone();
        let ((), (turn, result)) =
            tokio::join!(self.send_interim(category, &user_id), self.run_handler(category, turn));
        self.finish(category, &turn, result)
    }

    async fn run_handler(
        &self,
        category: IntentCategory,
        mut turn: TurnContext,
    ) -> (TurnContext, Result<HandlerOutcome, TurnError>) {
        let bundle = self.context.build(&turn.user_id, &turn.message, &self.limits).await;
        turn.memory = bundle.render(self.limits.char_budget);

        let result = match self.handlers.get(category) {
            Some(handler) => handler.handle(&turn).await,
            None => {
                Err(TurnError::Configuration(format!("no handler registered for `{category}`")))
            }
        };
        (turn, result)
    }

    async fn send_interim(&self, category: IntentCategory, user_id: &UserId) {
        if !self.interim_notices || !category.is_high_cost() {
            return;
        }
        let budget = self.supervisor.budgets().interim_notice;
        // Best effort; the real reply still goes out through send_reply.
        let _ = self
            .supervisor
            .run(
                "transport.send_interim",
                budget,
                self.transport.send_interim(user_id, INTERIM_NOTICE),
            )
            .await;
    }

    fn finish(
        &self,
        category: IntentCategory,
        turn: &TurnContext,
        result: Result<HandlerOutcome, TurnError>,
    ) -> TurnOutcome {
        match result {
            Ok(outcome) => TurnOutcome {
                reply: outcome.reply,
                category: Some(category),
                signals: outcome.signals,
            },
            Err(error) => {
                warn!(
                    event_name = "turn.failed",
                    correlation_id = %turn.correlation_id,
                    category = category.as_str(),
                    error = %error,
                    "turn failed; replying with an apology"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(turn.user_id.clone()),
                        &turn.correlation_id,
                        "turn.failed",
                        AuditCategory::Dependency,
                        AuditOutcome::Failed,
                    )
                    .with_metadata("error", error.to_string()),
                );
                let reply = error.into_reply(turn.correlation_id.as_str());
                TurnOutcome {
                    reply: reply.user_message().to_owned(),
                    category: Some(category),
                    signals: WriteSignals::default(),
                }
            }
        }
    }

    async fn send_reply(&self, user_id: &UserId, correlation_id: &str, reply: &str) {
        let budget = self.supervisor.budgets().external_write;
        let sent =
            self.supervisor.run("transport.send", budget, self.transport.send(user_id, reply)).await;
        let outcome = match &sent {
            TaskResult::Success(()) => AuditOutcome::Success,
            TaskResult::Timeout | TaskResult::Failure(_) => AuditOutcome::Failed,
        };
        self.audit.emit(
            AuditEvent::new(
                Some(user_id.clone()),
                correlation_id,
                "reply.sent",
                AuditCategory::Reply,
                outcome,
            )
            .with_metadata("transport", sent.outcome()),
        );
    }

    fn enqueue(
        &self,
        user_id: &UserId,
        correlation_id: &str,
        message: &str,
        outcome: &TurnOutcome,
    ) {
        let write = DeferredWrite {
            user_id: user_id.clone(),
            correlation_id: correlation_id.to_owned(),
            message: message.to_owned(),
            reply: outcome.reply.clone(),
            category: outcome.category,
            signals: outcome.signals.clone(),
            created_at: Utc::now(),
        };
        let (audit_outcome, label) = match self.deferred.enqueue(write) {
            EnqueueOutcome::Queued => (AuditOutcome::Success, "queued"),
            EnqueueOutcome::DroppedQueueFull => (AuditOutcome::Rejected, "queue_full"),
            EnqueueOutcome::DroppedClosed => (AuditOutcome::Rejected, "closed"),
        };
        self.audit.emit(
            AuditEvent::new(
                Some(user_id.clone()),
                correlation_id,
                "deferred.enqueued",
                AuditCategory::DeferredWrite,
                audit_outcome,
            )
            .with_metadata("outcome", label),
        );
    }

    fn log_completed(
        &self,
        correlation_id: &str,
        category: Option<IntentCategory>,
        started: Instant,
    ) {
        info!(
            event_name = "turn.completed",
            correlation_id = %correlation_id,
            category = category.map(IntentCategory::as_str).unwrap_or("fast_path"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "turn completed"
        );
    }
}
