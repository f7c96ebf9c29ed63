use concierge_core::domain::record::TableName;
use concierge_db::{ContactSeed, SqlRecordStore};

use crate::commands::{with_migrated_pool, CommandResult};

pub fn run() -> CommandResult {
    let outcome = with_migrated_pool("seed", |config, pool| async move {
        let table = TableName::new(config.cache.contacts_table.clone());
        let store = SqlRecordStore::new(pool);

        let loaded = ContactSeed::load(&store, &table)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 6u8))?;
        let verification = ContactSeed::verify(&store, &table)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 7u8))?;

        if !verification.all_present {
            return Err(("seed_verification", verification_failure(&verification.checks), 7u8));
        }
        Ok((table, loaded.created.len(), loaded.skipped.len()))
    });

    match outcome {
        Ok((table, created, skipped)) => {
            let names = ContactSeed::names()
                .into_iter()
                .map(|name| format!("  - {name}"))
                .collect::<Vec<_>>();
            CommandResult::success(
                "seed",
                format!(
                    "seed contacts present in `{table}` (created {created}, already present \
                     {skipped}):\n{}",
                    names.join("\n")
                ),
            )
        }
        Err(failure) => failure,
    }
}

fn verification_failure(checks: &[(&'static str, bool)]) -> String {
    let missing =
        checks.iter().filter_map(|(name, present)| (!present).then_some(*name)).collect::<Vec<_>>();
    if missing.is_empty() {
        "some seed contacts failed to load".to_string()
    } else {
        format!("seed verification failed for: {}", missing.join(", "))
    }
}
