use std::sync::Arc;
use std::time::Duration;

use concierge_core::cache::RecordCache;
use concierge_core::domain::record::{Record, TableName};
use concierge_core::supervisor::Supervisor;
use concierge_db::SqlRecordStore;

use crate::commands::{with_migrated_pool, CommandResult};

pub fn run(name: Option<&str>) -> CommandResult {
    let listed = with_migrated_pool("contacts", |config, pool| async move {
        let table = TableName::new(config.cache.contacts_table.clone());
        let cache = RecordCache::new(
            Arc::new(SqlRecordStore::new(pool)),
            Supervisor::new(config.budgets.budgets()),
            Duration::from_secs(config.cache.ttl_secs),
        )
        .with_refresh_timeout(Duration::from_secs(config.cache.refresh_timeout_secs));

        let snapshot = cache
            .get(&table)
            .await
            .map_err(|error| ("contacts_refresh", error.to_string(), 6u8))?;
        let lines = snapshot
            .iter()
            .filter(|record| name.map_or(true, |name| name_matches(record, name)))
            .map(render_contact)
            .collect::<Vec<_>>();
        Ok((table, lines))
    });

    match listed {
        Ok((table, lines)) if lines.is_empty() => {
            CommandResult::success("contacts", format!("no contacts in `{table}`"))
        }
        Ok((table, lines)) => CommandResult::success(
            "contacts",
            format!("{} contact(s) in `{table}`:\n{}", lines.len(), lines.join("\n")),
        ),
        Err(failure) => failure,
    }
}

fn name_matches(record: &Record, name: &str) -> bool {
    record.key.to_lowercase().contains(&name.trim().to_lowercase())
}

fn render_contact(record: &Record) -> String {
    let mut line = format!("  - {}", record.key);
    if let Some(email) = record.field("email").filter(|email| !email.is_empty()) {
        line.push_str(&format!(" <{email}>"));
    }
    if let Some(phone) = record.field("phone").filter(|phone| !phone.is_empty()) {
        line.push_str(&format!(" {phone}"));
    }
    line
}
