use std::env;
use std::sync::{Mutex, OnceLock};

use chrono::{Duration, Utc};
use concierge_cli::commands::{contacts, doctor, migrate, prune, seed};
use concierge_core::domain::memory::{ConversationTurn, UserId};
use concierge_core::ports::StructuredMemory;
use concierge_db::{connect_with_settings, SqlStructuredMemory};
use serde_json::Value;

const TWILIO_ENV: [(&str, &str); 3] = [
    ("CONCIERGE_TWILIO_ACCOUNT_SID", "AC0123456789abcdef"),
    ("CONCIERGE_TWILIO_AUTH_TOKEN", "twilio-test-token"),
    ("CONCIERGE_TWILIO_WHATSAPP_NUMBER", "whatsapp:+14155238886"),
];

#[test]
fn migrate_returns_success_with_valid_env() {
    with_env(&valid_env("sqlite::memory:"), || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 0, "expected successful migrate run");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["command"], "migrate");
        assert_eq!(payload["status"], "ok");
    });
}

#[test]
fn migrate_returns_config_failure_without_twilio_credentials() {
    with_env(&[("CONCIERGE_DATABASE_URL", "sqlite::memory:")], || {
        let result = migrate::run();
        assert_eq!(result.exit_code, 2, "expected config validation failure code");

        let payload = parse_payload(&result.output);
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["error_class"], "config_validation");
        assert!(payload["message"].as_str().unwrap_or("").contains("twilio.account_sid"));
    });
}

#[test]
fn seed_is_idempotent_across_runs() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&valid_env(&url), || {
        let first = seed::run();
        assert_eq!(first.exit_code, 0, "{}", first.output);
        let first_message = parse_payload(&first.output)["message"].as_str().unwrap().to_owned();
        assert!(first_message.contains("created 3, already present 0"), "{first_message}");
        assert!(first_message.contains("  - John Carter"));

        let second = seed::run();
        assert_eq!(second.exit_code, 0, "{}", second.output);
        let second_message = parse_payload(&second.output)["message"].as_str().unwrap().to_owned();
        assert!(second_message.contains("created 0, already present 3"), "{second_message}");
    });
}

#[test]
fn contacts_lists_seeded_records_through_the_cache() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&valid_env(&url), || {
        let empty = contacts::run(None);
        assert_eq!(empty.exit_code, 0, "{}", empty.output);
        assert_eq!(parse_payload(&empty.output)["message"], "no contacts in `contacts`");

        assert_eq!(seed::run().exit_code, 0);

        let listed = contacts::run(None);
        let message = parse_payload(&listed.output)["message"].as_str().unwrap().to_owned();
        assert!(message.starts_with("3 contact(s) in `contacts`:"), "{message}");
        assert!(message.contains("  - John Carter <john.carter@example.com> +971500000101"));

        let filtered = contacts::run(Some("amira"));
        let message = parse_payload(&filtered.output)["message"].as_str().unwrap().to_owned();
        assert!(message.starts_with("1 contact(s)"), "{message}");
        assert!(message.contains("Amira Haddad"));
        assert!(!message.contains("John Carter"));
    });
}

#[test]
fn prune_removes_turns_past_the_retention_window() {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = file_database_url(&dir);

    with_env(&valid_env(&url), || {
        assert_eq!(migrate::run().exit_code, 0);
        insert_turns(&url, &[45, 2]);

        let result = prune::run(None);
        assert_eq!(result.exit_code, 0, "{}", result.output);
        let message = parse_payload(&result.output)["message"].as_str().unwrap().to_owned();
        assert!(message.starts_with("pruned 1 row(s) older than 30 day(s)"), "{message}");
        assert!(message.contains("1 conversation turn(s)"), "{message}");

        let tighter = prune::run(Some(1));
        let message = parse_payload(&tighter.output)["message"].as_str().unwrap().to_owned();
        assert!(message.contains("1 conversation turn(s)"), "{message}");
    });
}

#[test]
fn prune_does_nothing_when_retention_is_disabled() {
    let mut vars = valid_env("sqlite::memory:");
    vars.push(("CONCIERGE_CONTEXT_RETENTION_DAYS", "0".to_string()));

    with_env(&vars, || {
        let result = prune::run(None);
        assert_eq!(result.exit_code, 0, "{}", result.output);
        assert_eq!(
            parse_payload(&result.output)["message"],
            "retention is disabled; nothing was pruned"
        );
    });
}

#[test]
fn doctor_warns_about_unconfigured_optional_services() {
    with_env(&valid_env("sqlite::memory:"), || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 0, "{}", result.output);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "warn");
        let checks = report["checks"].as_array().expect("checks");
        let status_of = |name: &str| {
            checks
                .iter()
                .find(|check| check["name"] == name)
                .map(|check| check["status"].clone())
                .unwrap_or(Value::Null)
        };
        assert_eq!(status_of("config_validation"), "pass");
        assert_eq!(status_of("database_connectivity"), "pass");
        assert_eq!(status_of("optional_services"), "warn");
    });
}

#[test]
fn doctor_fails_and_skips_dependent_checks_without_config() {
    with_env::<&str>(&[], || {
        let result = doctor::run(true);
        assert_eq!(result.exit_code, 1);

        let report = parse_payload(&result.output);
        assert_eq!(report["overall_status"], "fail");
        let skipped = report["checks"]
            .as_array()
            .expect("checks")
            .iter()
            .filter(|check| check["status"] == "skipped")
            .count();
        assert_eq!(skipped, 4);
    });
}

fn valid_env(database_url: &str) -> Vec<(&'static str, String)> {
    let mut vars = TWILIO_ENV
        .iter()
        .map(|(key, value)| (*key, (*value).to_string()))
        .collect::<Vec<_>>();
    vars.push(("CONCIERGE_DATABASE_URL", database_url.to_string()));
    vars
}

fn insert_turns(database_url: &str, ages_in_days: &[i64]) {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    runtime.block_on(async {
        let pool = connect_with_settings(database_url, 1, 5).await.expect("connect");
        let memory = SqlStructuredMemory::new(pool.clone());
        let user = UserId::new("whatsapp:+971500000001");
        for age in ages_in_days {
            let turn = ConversationTurn {
                message: format!("{age} days ago"),
                reply: "noted".to_owned(),
                intent: None,
                created_at: Utc::now() - Duration::days(*age),
            };
            memory.append_turn(&user, &turn).await.expect("append turn");
        }
        pool.close().await;
    });
}

fn file_database_url(dir: &tempfile::TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("concierge.db").display())
}

fn parse_payload(output: &str) -> Value {
    serde_json::from_str(output).expect("command output should be valid JSON")
}

fn with_env<V: AsRef<str>>(vars: &[(&str, V)], test_fn: impl FnOnce()) {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner());

    let keys = [
        "CONCIERGE_DATABASE_URL",
        "CONCIERGE_DATABASE_MAX_CONNECTIONS",
        "CONCIERGE_DATABASE_TIMEOUT_SECS",
        "CONCIERGE_TWILIO_ACCOUNT_SID",
        "CONCIERGE_TWILIO_AUTH_TOKEN",
        "CONCIERGE_TWILIO_WHATSAPP_NUMBER",
        "CONCIERGE_LLM_PROVIDER",
        "CONCIERGE_LLM_API_KEY",
        "CONCIERGE_LLM_BASE_URL",
        "CONCIERGE_LLM_MODEL",
        "CONCIERGE_SEARCH_API_KEY",
        "CONCIERGE_SEARCH_WEB_BASE_URL",
        "CONCIERGE_EMAIL_API_KEY",
        "CONCIERGE_EMAIL_FROM_ADDRESS",
        "CONCIERGE_CACHE_TTL_SECS",
        "CONCIERGE_CONTEXT_RETENTION_DAYS",
        "CONCIERGE_SERVER_PORT",
        "CONCIERGE_LOGGING_LEVEL",
        "CONCIERGE_LOGGING_FORMAT",
        "CONCIERGE_LOG_LEVEL",
        "CONCIERGE_LOG_FORMAT",
    ];

    let previous_values: Vec<(&str, Option<String>)> =
        keys.iter().map(|key| (*key, env::var(key).ok())).collect();

    for key in &keys {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value.as_ref());
    }

    test_fn();

    for (key, value) in previous_values {
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
    }
}
