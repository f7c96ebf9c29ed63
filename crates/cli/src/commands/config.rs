use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use concierge_core::config::{AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let source = |key_path: &str, env_key: &str| {
        let file_doc = config_file_doc.as_ref();
        field_source(key_path, Some(env_key), file_doc, config_file_path.as_deref())
    };

    let entries: Vec<(&str, String, &str)> = vec![
        ("database.url", config.database.url.clone(), "CONCIERGE_DATABASE_URL"),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            "CONCIERGE_DATABASE_MAX_CONNECTIONS",
        ),
        (
            "twilio.account_sid",
            redact_sid(&config.twilio.account_sid),
            "CONCIERGE_TWILIO_ACCOUNT_SID",
        ),
        (
            "twilio.auth_token",
            redact_secret(Some(&config.twilio.auth_token)),
            "CONCIERGE_TWILIO_AUTH_TOKEN",
        ),
        (
            "twilio.whatsapp_number",
            config.twilio.whatsapp_number.clone(),
            "CONCIERGE_TWILIO_WHATSAPP_NUMBER",
        ),
        ("llm.provider", format!("{:?}", config.llm.provider), "CONCIERGE_LLM_PROVIDER"),
        ("llm.model", config.llm.model.clone(), "CONCIERGE_LLM_MODEL"),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "CONCIERGE_LLM_BASE_URL",
        ),
        ("llm.api_key", redact_secret(config.llm.api_key.as_ref()), "CONCIERGE_LLM_API_KEY"),
        (
            "llm.embedding_model",
            config
                .llm
                .resolved_embedding_model()
                .unwrap_or("<local lexical embedder>")
                .to_string(),
            "CONCIERGE_LLM_EMBEDDING_MODEL",
        ),
        (
            "search.api_key",
            redact_secret(config.search.api_key.as_ref()),
            "CONCIERGE_SEARCH_API_KEY",
        ),
        (
            "search.web_base_url",
            config.search.web_base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            "CONCIERGE_SEARCH_WEB_BASE_URL",
        ),
        ("email.api_key", redact_secret(config.email.api_key.as_ref()), "CONCIERGE_EMAIL_API_KEY"),
        (
            "email.from_address",
            config.email.from_address.clone().unwrap_or_else(|| "<unset>".to_string()),
            "CONCIERGE_EMAIL_FROM_ADDRESS",
        ),
        ("cache.ttl_secs", config.cache.ttl_secs.to_string(), "CONCIERGE_CACHE_TTL_SECS"),
        (
            "deferred.queue_capacity",
            config.deferred.queue_capacity.to_string(),
            "CONCIERGE_DEFERRED_QUEUE_CAPACITY",
        ),
        (
            "context.retention_days",
            config.context.retention_days.to_string(),
            "CONCIERGE_CONTEXT_RETENTION_DAYS",
        ),
        (
            "assistant.utc_offset_minutes",
            config.assistant.utc_offset_minutes.to_string(),
            "CONCIERGE_ASSISTANT_UTC_OFFSET_MINUTES",
        ),
        (
            "assistant.confidence_threshold",
            config.assistant.confidence_threshold.to_string(),
            "CONCIERGE_ASSISTANT_CONFIDENCE_THRESHOLD",
        ),
        (
            "assistant.upcoming_window",
            format!("{:?}", config.assistant.upcoming_window),
            "CONCIERGE_ASSISTANT_UPCOMING_WINDOW",
        ),
        (
            "server.bind_address",
            config.server.bind_address.clone(),
            "CONCIERGE_SERVER_BIND_ADDRESS",
        ),
        ("server.port", config.server.port.to_string(), "CONCIERGE_SERVER_PORT"),
        ("logging.level", config.logging.level.clone(), "CONCIERGE_LOGGING_LEVEL"),
        ("logging.format", format!("{:?}", config.logging.format), "CONCIERGE_LOGGING_FORMAT"),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    lines.extend(
        entries
            .into_iter()
            .map(|(key, value, env_key)| render_line(key, &value, source(key, env_key))),
    );
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("concierge.toml"), PathBuf::from("config/concierge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_secret(secret: Option<&SecretString>) -> String {
    match secret.map(|secret| secret.expose_secret().trim().is_empty()) {
        None => "<unset>".to_string(),
        Some(true) => "<empty>".to_string(),
        Some(false) => "<redacted>".to_string(),
    }
}

/// Keeps the `AC` prefix and last four characters of an account SID.
fn redact_sid(sid: &str) -> String {
    let sid = sid.trim();
    if sid.len() <= 6 || !sid.is_ascii() {
        return "<redacted>".to_string();
    }
    format!("{}***{}", &sid[..2], &sid[sid.len() - 4..])
}
