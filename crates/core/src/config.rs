use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::supervisor::Budgets;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub twilio: TwilioConfig,
    pub llm: LlmConfig,
    pub search: SearchConfig,
    pub email: EmailConfig,
    pub cache: CacheConfig,
    pub budgets: BudgetConfig,
    pub context: ContextConfig,
    pub deferred: DeferredConfig,
    pub assistant: AssistantConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: SecretString,
    pub whatsapp_number: String,
    pub api_base_url: String,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    /// Model for the `/embeddings` endpoint. Unset falls back to the local
    /// hashing embedder, except for openai which defaults to
    /// `text-embedding-3-small`.
    pub embedding_model: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub api_key: Option<SecretString>,
    pub places_base_url: String,
    pub web_base_url: Option<String>,
    pub max_results: usize,
}

#[derive(Clone, Debug)]
pub struct EmailConfig {
    pub api_key: Option<SecretString>,
    pub api_base_url: String,
    pub from_address: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub refresh_timeout_secs: u64,
    pub contacts_table: String,
}

/// Per-operation-class timeouts, in milliseconds.
#[derive(Clone, Debug)]
pub struct BudgetConfig {
    pub classification_ms: u64,
    pub memory_lookup_ms: u64,
    pub extraction_ms: u64,
    pub search_ms: u64,
    pub external_write_ms: u64,
    pub interim_notice_ms: u64,
    pub turn_ms: u64,
}

#[derive(Clone, Debug)]
pub struct ContextConfig {
    pub recent_turns: usize,
    pub semantic_matches: usize,
    pub pending_tasks: usize,
    pub char_budget: usize,
    pub min_similarity: f32,
    /// Conversation turns, semantic entries and resolved tasks older than
    /// this are pruned. Zero keeps everything.
    pub retention_days: u32,
}

#[derive(Clone, Debug)]
pub struct DeferredConfig {
    pub queue_capacity: usize,
    pub max_concurrent_writes: usize,
}

#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub utc_offset_minutes: i32,
    pub confidence_threshold: u8,
    pub upcoming_window: UpcomingWindow,
    pub upcoming_days: u32,
    pub blocking_pool_size: usize,
    pub interim_notices: bool,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpcomingWindow {
    RollingDays,
    RemainderOfWeek,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub twilio_account_sid: Option<String>,
    pub twilio_auth_token: Option<String>,
    pub twilio_whatsapp_number: Option<String>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://concierge.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            twilio: TwilioConfig {
                account_sid: String::new(),
                auth_token: String::new().into(),
                whatsapp_number: String::new(),
                api_base_url: "https://api.twilio.com".to_string(),
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                max_tokens: 600,
                embedding_model: None,
            },
            search: SearchConfig {
                api_key: None,
                places_base_url: "https://maps.googleapis.com/maps/api/place".to_string(),
                web_base_url: None,
                max_results: 5,
            },
            email: EmailConfig {
                api_key: None,
                api_base_url: "https://api.resend.com".to_string(),
                from_address: None,
            },
            cache: CacheConfig {
                ttl_secs: 300,
                refresh_timeout_secs: 10,
                contacts_table: "contacts".to_string(),
            },
            budgets: BudgetConfig {
                classification_ms: 500,
                memory_lookup_ms: 5_000,
                extraction_ms: 25_000,
                search_ms: 15_000,
                external_write_ms: 10_000,
                interim_notice_ms: 2_000,
                turn_ms: 60_000,
            },
            context: ContextConfig {
                recent_turns: 5,
                semantic_matches: 5,
                pending_tasks: 3,
                char_budget: 2_000,
                min_similarity: 0.7,
                retention_days: 30,
            },
            deferred: DeferredConfig { queue_capacity: 256, max_concurrent_writes: 4 },
            assistant: AssistantConfig {
                utc_offset_minutes: 240,
                confidence_threshold: 60,
                upcoming_window: UpcomingWindow::RollingDays,
                upcoming_days: 7,
                blocking_pool_size: 4,
                interim_notices: true,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl BudgetConfig {
    pub fn budgets(&self) -> Budgets {
        Budgets {
            classification: Duration::from_millis(self.classification_ms),
            memory_lookup: Duration::from_millis(self.memory_lookup_ms),
            extraction: Duration::from_millis(self.extraction_ms),
            search: Duration::from_millis(self.search_ms),
            external_write: Duration::from_millis(self.external_write_ms),
            interim_notice: Duration::from_millis(self.interim_notice_ms),
            turn: Duration::from_millis(self.turn_ms),
        }
    }
}

impl LlmConfig {
    pub fn resolved_embedding_model(&self) -> Option<&str> {
        match (self.embedding_model.as_deref(), self.provider) {
            (Some(model), _) => Some(model),
            (None, LlmProvider::OpenAi) => Some("text-embedding-3-small"),
            (None, LlmProvider::Ollama) => None,
        }
    }
}

impl ContextConfig {
    pub fn retention(&self) -> Option<chrono::Duration> {
        (self.retention_days > 0).then(|| chrono::Duration::days(i64::from(self.retention_days)))
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for UpcomingWindow {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rolling_days" => Ok(Self::RollingDays),
            "remainder_of_week" => Ok(Self::RemainderOfWeek),
            other => Err(ConfigError::Validation(format!(
                "unsupported upcoming window `{other}` (expected rolling_days|remainder_of_week)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("concierge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(twilio) = patch.twilio {
            if let Some(account_sid) = twilio.account_sid {
                self.twilio.account_sid = account_sid;
            }
            if let Some(auth_token_value) = twilio.auth_token {
                self.twilio.auth_token = secret_value(auth_token_value);
            }
            if let Some(whatsapp_number) = twilio.whatsapp_number {
                self.twilio.whatsapp_number = whatsapp_number;
            }
            if let Some(api_base_url) = twilio.api_base_url {
                self.twilio.api_base_url = api_base_url;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
            if let Some(embedding_model) = llm.embedding_model {
                self.llm.embedding_model = Some(embedding_model);
            }
        }

        if let Some(search) = patch.search {
            if let Some(search_api_key_value) = search.api_key {
                self.search.api_key = Some(secret_value(search_api_key_value));
            }
            if let Some(places_base_url) = search.places_base_url {
                self.search.places_base_url = places_base_url;
            }
            if let Some(web_base_url) = search.web_base_url {
                self.search.web_base_url = Some(web_base_url);
            }
            if let Some(max_results) = search.max_results {
                self.search.max_results = max_results;
            }
        }

        if let Some(email) = patch.email {
            if let Some(email_api_key_value) = email.api_key {
                self.email.api_key = Some(secret_value(email_api_key_value));
            }
            if let Some(api_base_url) = email.api_base_url {
                self.email.api_base_url = api_base_url;
            }
            if let Some(from_address) = email.from_address {
                self.email.from_address = Some(from_address);
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(ttl_secs) = cache.ttl_secs {
                self.cache.ttl_secs = ttl_secs;
            }
            if let Some(refresh_timeout_secs) = cache.refresh_timeout_secs {
                self.cache.refresh_timeout_secs = refresh_timeout_secs;
            }
            if let Some(contacts_table) = cache.contacts_table {
                self.cache.contacts_table = contacts_table;
            }
        }

        if let Some(budgets) = patch.budgets {
            if let Some(value) = budgets.classification_ms {
                self.budgets.classification_ms = value;
            }
            if let Some(value) = budgets.memory_lookup_ms {
                self.budgets.memory_lookup_ms = value;
            }
            if let Some(value) = budgets.extraction_ms {
                self.budgets.extraction_ms = value;
            }
            if let Some(value) = budgets.search_ms {
                self.budgets.search_ms = value;
            }
            if let Some(value) = budgets.external_write_ms {
                self.budgets.external_write_ms = value;
            }
            if let Some(value) = budgets.interim_notice_ms {
                self.budgets.interim_notice_ms = value;
            }
            if let Some(value) = budgets.turn_ms {
                self.budgets.turn_ms = value;
            }
        }

        if let Some(context) = patch.context {
            if let Some(recent_turns) = context.recent_turns {
                self.context.recent_turns = recent_turns;
            }
            if let Some(semantic_matches) = context.semantic_matches {
                self.context.semantic_matches = semantic_matches;
            }
            if let Some(pending_tasks) = context.pending_tasks {
                self.context.pending_tasks = pending_tasks;
            }
            if let Some(char_budget) = context.char_budget {
                self.context.char_budget = char_budget;
            }
            if let Some(min_similarity) = context.min_similarity {
                self.context.min_similarity = min_similarity;
            }
            if let Some(retention_days) = context.retention_days {
                self.context.retention_days = retention_days;
            }
        }

        if let Some(deferred) = patch.deferred {
            if let Some(queue_capacity) = deferred.queue_capacity {
                self.deferred.queue_capacity = queue_capacity;
            }
            if let Some(max_concurrent_writes) = deferred.max_concurrent_writes {
                self.deferred.max_concurrent_writes = max_concurrent_writes;
            }
        }

        if let Some(assistant) = patch.assistant {
            if let Some(utc_offset_minutes) = assistant.utc_offset_minutes {
                self.assistant.utc_offset_minutes = utc_offset_minutes;
            }
            if let Some(confidence_threshold) = assistant.confidence_threshold {
                self.assistant.confidence_threshold = confidence_threshold;
            }
            if let Some(upcoming_window) = assistant.upcoming_window {
                self.assistant.upcoming_window = upcoming_window;
            }
            if let Some(upcoming_days) = assistant.upcoming_days {
                self.assistant.upcoming_days = upcoming_days;
            }
            if let Some(blocking_pool_size) = assistant.blocking_pool_size {
                self.assistant.blocking_pool_size = blocking_pool_size;
            }
            if let Some(interim_notices) = assistant.interim_notices {
                self.assistant.interim_notices = interim_notices;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("CONCIERGE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("CONCIERGE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("CONCIERGE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = value;
        }
        if let Some(value) = read_env("CONCIERGE_TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = secret_value(value);
        }
        if let Some(value) = read_env("CONCIERGE_TWILIO_WHATSAPP_NUMBER") {
            self.twilio.whatsapp_number = value;
        }
        if let Some(value) = read_env("CONCIERGE_TWILIO_API_BASE_URL") {
            self.twilio.api_base_url = value;
        }

        if let Some(value) = read_env("CONCIERGE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("CONCIERGE_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = Some(value);
        }
        if let Some(value) = read_env("CONCIERGE_LLM_MAX_TOKENS") {
            self.llm.max_tokens = parse_u32("CONCIERGE_LLM_MAX_TOKENS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SEARCH_API_KEY") {
            self.search.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_SEARCH_PLACES_BASE_URL") {
            self.search.places_base_url = value;
        }
        if let Some(value) = read_env("CONCIERGE_SEARCH_WEB_BASE_URL") {
            self.search.web_base_url = Some(value);
        }

        if let Some(value) = read_env("CONCIERGE_EMAIL_API_KEY") {
            self.email.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("CONCIERGE_EMAIL_FROM_ADDRESS") {
            self.email.from_address = Some(value);
        }

        if let Some(value) = read_env("CONCIERGE_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse_u64("CONCIERGE_CACHE_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_CACHE_REFRESH_TIMEOUT_SECS") {
            self.cache.refresh_timeout_secs =
                parse_u64("CONCIERGE_CACHE_REFRESH_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_CONTEXT_RETENTION_DAYS") {
            self.context.retention_days = parse_u32("CONCIERGE_CONTEXT_RETENTION_DAYS", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_DEFERRED_QUEUE_CAPACITY") {
            self.deferred.queue_capacity = parse_usize("CONCIERGE_DEFERRED_QUEUE_CAPACITY", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_ASSISTANT_UTC_OFFSET_MINUTES") {
            self.assistant.utc_offset_minutes =
                parse_i32("CONCIERGE_ASSISTANT_UTC_OFFSET_MINUTES", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_CONFIDENCE_THRESHOLD") {
            self.assistant.confidence_threshold =
                parse_u8("CONCIERGE_ASSISTANT_CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_UPCOMING_WINDOW") {
            self.assistant.upcoming_window = value.parse()?;
        }
        if let Some(value) = read_env("CONCIERGE_ASSISTANT_INTERIM_NOTICES") {
            self.assistant.interim_notices =
                parse_bool("CONCIERGE_ASSISTANT_INTERIM_NOTICES", &value)?;
        }

        if let Some(value) = read_env("CONCIERGE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_PORT") {
            self.server.port = parse_u16("CONCIERGE_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("CONCIERGE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("CONCIERGE_LOGGING_LEVEL").or_else(|| read_env("CONCIERGE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("CONCIERGE_LOGGING_FORMAT").or_else(|| read_env("CONCIERGE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(account_sid) = overrides.twilio_account_sid {
            self.twilio.account_sid = account_sid;
        }
        if let Some(auth_token) = overrides.twilio_auth_token {
            self.twilio.auth_token = secret_value(auth_token);
        }
        if let Some(whatsapp_number) = overrides.twilio_whatsapp_number {
            self.twilio.whatsapp_number = whatsapp_number;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_twilio(&self.twilio)?;
        validate_llm(&self.llm)?;
        validate_cache(&self.cache)?;
        validate_budgets(&self.budgets)?;
        validate_context(&self.context)?;
        validate_deferred(&self.deferred)?;
        validate_assistant(&self.assistant)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_twilio(twilio: &TwilioConfig) -> Result<(), ConfigError> {
    let account_sid = twilio.account_sid.trim();
    if account_sid.is_empty() {
        return Err(ConfigError::Validation(
            "twilio.account_sid is required. Find it on https://console.twilio.com > Account Info"
                .to_string(),
        ));
    }
    if !account_sid.starts_with("AC") {
        let hint = if account_sid.starts_with("SK") {
            " (hint: you may have used an API key SID instead of the account SID)"
        } else {
            ""
        };
        return Err(ConfigError::Validation(format!(
            "twilio.account_sid must start with `AC`{hint}. Find it on https://console.twilio.com"
        )));
    }

    if twilio.auth_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "twilio.auth_token is required. Find it on https://console.twilio.com > Account Info"
                .to_string(),
        ));
    }

    if twilio.whatsapp_number.trim().is_empty() {
        return Err(ConfigError::Validation(
            "twilio.whatsapp_number is required (e.g. `whatsapp:+14155238886`)".to_string(),
        ));
    }

    if !twilio.api_base_url.starts_with("http://") && !twilio.api_base_url.starts_with("https://")
    {
        return Err(ConfigError::Validation(
            "twilio.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "llm.max_tokens must be greater than zero".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.ttl_secs == 0 {
        return Err(ConfigError::Validation("cache.ttl_secs must be greater than zero".to_string()));
    }
    if cache.refresh_timeout_secs == 0 || cache.refresh_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "cache.refresh_timeout_secs must be in range 1..=120".to_string(),
        ));
    }
    if cache.contacts_table.trim().is_empty() {
        return Err(ConfigError::Validation("cache.contacts_table must not be empty".to_string()));
    }
    Ok(())
}

fn validate_budgets(budgets: &BudgetConfig) -> Result<(), ConfigError> {
    let entries = [
        ("budgets.classification_ms", budgets.classification_ms),
        ("budgets.memory_lookup_ms", budgets.memory_lookup_ms),
        ("budgets.extraction_ms", budgets.extraction_ms),
        ("budgets.search_ms", budgets.search_ms),
        ("budgets.external_write_ms", budgets.external_write_ms),
        ("budgets.interim_notice_ms", budgets.interim_notice_ms),
    ];
    for (key, value) in entries {
        if value == 0 {
            return Err(ConfigError::Validation(format!("{key} must be greater than zero")));
        }
        if value > budgets.turn_ms {
            return Err(ConfigError::Validation(format!(
                "{key} ({value}) must not exceed budgets.turn_ms ({})",
                budgets.turn_ms
            )));
        }
    }
    Ok(())
}

fn validate_context(context: &ContextConfig) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&context.min_similarity) {
        return Err(ConfigError::Validation(
            "context.min_similarity must be in range 0.0..=1.0".to_string(),
        ));
    }
    if context.char_budget == 0 {
        return Err(ConfigError::Validation(
            "context.char_budget must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_deferred(deferred: &DeferredConfig) -> Result<(), ConfigError> {
    if deferred.queue_capacity == 0 {
        return Err(ConfigError::Validation(
            "deferred.queue_capacity must be greater than zero".to_string(),
        ));
    }
    if deferred.max_concurrent_writes == 0 {
        return Err(ConfigError::Validation(
            "deferred.max_concurrent_writes must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_assistant(assistant: &AssistantConfig) -> Result<(), ConfigError> {
    if assistant.confidence_threshold > 100 {
        return Err(ConfigError::Validation(
            "assistant.confidence_threshold must be in range 0..=100".to_string(),
        ));
    }
    if assistant.utc_offset_minutes.abs() > 14 * 60 {
        return Err(ConfigError::Validation(
            "assistant.utc_offset_minutes must be within -840..=840".to_string(),
        ));
    }
    if assistant.upcoming_days == 0 {
        return Err(ConfigError::Validation(
            "assistant.upcoming_days must be greater than zero".to_string(),
        ));
    }
    if assistant.blocking_pool_size == 0 {
        return Err(ConfigError::Validation(
            "assistant.blocking_pool_size must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u8(key: &str, value: &str) -> Result<u8, ConfigError> {
    value.parse::<u8>().map_err(|_| invalid_override(key, value))
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_i32(key: &str, value: &str) -> Result<i32, ConfigError> {
    value.parse::<i32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    twilio: Option<TwilioPatch>,
    llm: Option<LlmPatch>,
    search: Option<SearchPatch>,
    email: Option<EmailPatch>,
    cache: Option<CachePatch>,
    budgets: Option<BudgetPatch>,
    context: Option<ContextPatch>,
    deferred: Option<DeferredPatch>,
    assistant: Option<AssistantPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TwilioPatch {
    account_sid: Option<String>,
    auth_token: Option<String>,
    whatsapp_number: Option<String>,
    api_base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    embedding_model: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchPatch {
    api_key: Option<String>,
    places_base_url: Option<String>,
    web_base_url: Option<String>,
    max_results: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct EmailPatch {
    api_key: Option<String>,
    api_base_url: Option<String>,
    from_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    ttl_secs: Option<u64>,
    refresh_timeout_secs: Option<u64>,
    contacts_table: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BudgetPatch {
    classification_ms: Option<u64>,
    memory_lookup_ms: Option<u64>,
    extraction_ms: Option<u64>,
    search_ms: Option<u64>,
    external_write_ms: Option<u64>,
    interim_notice_ms: Option<u64>,
    turn_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ContextPatch {
    recent_turns: Option<usize>,
    semantic_matches: Option<usize>,
    pending_tasks: Option<usize>,
    char_budget: Option<usize>,
    min_similarity: Option<f32>,
    retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct DeferredPatch {
    queue_capacity: Option<usize>,
    max_concurrent_writes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantPatch {
    utc_offset_minutes: Option<i32>,
    confidence_threshold: Option<u8>,
    upcoming_window: Option<UpcomingWindow>,
    upcoming_days: Option<u32>,
    blocking_pool_size: Option<usize>,
    interim_notices: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
