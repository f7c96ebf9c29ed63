use std::sync::Arc;
use std::time::Duration;

use concierge_agent::{AgentRuntime, RuntimeServices};
use concierge_core::audit::TracingAuditSink;
use concierge_core::cache::RecordCache;
use concierge_core::config::{AppConfig, ConfigError};
use concierge_core::embedding::{HashingEmbedder, PooledEmbedder};
use concierge_core::errors::ServiceError;
use concierge_core::ports::{Embedder, MessagingTransport, SemanticMemory, StructuredMemory};
use concierge_core::retention::RetentionSweeper;
use concierge_core::supervisor::{BlockingPool, Supervisor};
use concierge_db::{
    connect_with_settings, migrations, DbPool, SqlRecordStore, SqlSemanticMemory,
    SqlStructuredMemory,
};
use concierge_twilio::{DelayedReplies, TwilioError, TwilioMessenger};
use thiserror::Error;
use tracing::info;

use crate::clients::{
    ChatCompletionClient, EmbeddingClient, PlacesSearchClient, ResendEmailSender, UnconfiguredCalendar,
    WebSearchClient,
};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub runtime: Arc<AgentRuntime>,
    pub delayed: DelayedReplies,
    pub structured: Arc<dyn StructuredMemory>,
    pub semantic: Arc<dyn SemanticMemory>,
}

impl Application {
    pub fn retention_sweeper(&self) -> Option<RetentionSweeper> {
        retention_sweeper(&self.config, self.structured.clone(), self.semantic.clone())
    }
}

/// `None` when `context.retention_days` is zero.
pub fn retention_sweeper(
    config: &AppConfig,
    structured: Arc<dyn StructuredMemory>,
    semantic: Arc<dyn SemanticMemory>,
) -> Option<RetentionSweeper> {
    config.context.retention().map(|keep_for| RetentionSweeper::new(structured, semantic, keep_for))
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("twilio client setup failed: {0}")]
    Transport(#[from] TwilioError),
    #[error("http client setup failed: {0}")]
    Client(#[from] ServiceError),
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let delayed = DelayedReplies::default();
    let transport = Arc::new(TwilioMessenger::new(&config.twilio, delayed.clone())?);
    let services = runtime_services(&config, &db_pool, transport)?;
    let structured = services.structured.clone();
    let semantic = services.semantic.clone();
    let runtime = Arc::new(AgentRuntime::new(&config, services));
    info!(
        event_name = "system.bootstrap.runtime_ready",
        correlation_id = "bootstrap",
        llm_provider = ?config.llm.provider,
        contacts_table = %config.cache.contacts_table,
        "agent runtime ready"
    );

    Ok(Application { config, db_pool, runtime, delayed, structured, semantic })
}

/// The configured embeddings endpoint, or the local hashing embedder on the
/// blocking pool when no embedding model is configured.
pub fn embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>, BootstrapError> {
    let embedder: Arc<dyn Embedder> = match EmbeddingClient::from_config(&config.llm)? {
        Some(client) => {
            info!(
                event_name = "system.bootstrap.embedder_configured",
                correlation_id = "bootstrap",
                endpoint = client.endpoint(),
                model = client.model(),
                "remote embeddings configured"
            );
            Arc::new(client)
        }
        None => {
            let local = PooledEmbedder::new(
                HashingEmbedder::default(),
                BlockingPool::new(config.assistant.blocking_pool_size),
                config.budgets.budgets().external_write,
            );
            info!(
                event_name = "system.bootstrap.embedder_configured",
                correlation_id = "bootstrap",
                model = local.model(),
                "no embedding model configured; using the local lexical embedder"
            );
            Arc::new(local)
        }
    };
    Ok(embedder)
}

/// SQLite-backed memory plus the HTTP clients for every external service.
pub fn runtime_services(
    config: &AppConfig,
    db_pool: &DbPool,
    transport: Arc<dyn MessagingTransport>,
) -> Result<RuntimeServices, BootstrapError> {
    let embedder = embedder(config)?;
    let records = RecordCache::new(
        Arc::new(SqlRecordStore::new(db_pool.clone())),
        Supervisor::new(config.budgets.budgets()),
        Duration::from_secs(config.cache.ttl_secs),
    )
    .with_refresh_timeout(Duration::from_secs(config.cache.refresh_timeout_secs));
    let completion = ChatCompletionClient::from_config(&config.llm)?;
    info!(
        event_name = "system.bootstrap.llm_configured",
        correlation_id = "bootstrap",
        endpoint = completion.endpoint(),
        model = %config.llm.model,
        "completion client configured"
    );

    Ok(RuntimeServices {
        records: Arc::new(records),
        structured: Arc::new(SqlStructuredMemory::new(db_pool.clone())),
        semantic: Arc::new(SqlSemanticMemory::new(db_pool.clone(), embedder.clone())),
        embedder,
        completion: Arc::new(completion),
        places: Arc::new(PlacesSearchClient::from_config(&config.search)?),
        web: Arc::new(WebSearchClient::from_config(&config.search)?),
        calendar: Arc::new(UnconfiguredCalendar),
        email: Arc::new(ResendEmailSender::from_config(&config.email)?),
        transport,
        audit: Arc::new(TracingAuditSink),
    })
}
