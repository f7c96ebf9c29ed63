use concierge_db::migrations;

use crate::commands::{with_migrated_pool, CommandResult};

pub fn run() -> CommandResult {
    let applied = with_migrated_pool("migrate", |_config, _pool| async {
        Ok(migrations::known_versions())
    });

    match applied {
        Ok(versions) => CommandResult::success(
            "migrate",
            format!("applied pending migrations (known versions: {versions:?})"),
        ),
        Err(failure) => failure,
    }
}
