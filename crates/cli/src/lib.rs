pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "concierge",
    about = "Concierge operator CLI",
    long_about = "Inspect configuration, run migrations and readiness checks, manage the \
                  contacts table and prune old conversation memory behind the WhatsApp \
                  assistant.",
    after_help = "Examples:\n  concierge doctor --json\n  concierge config\n  concierge contacts\n  \
                  concierge prune --days 30"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Load the demo contacts into the contacts table (idempotent)")]
    Seed,
    #[command(about = "List the contacts table through the record cache")]
    Contacts {
        #[arg(long, help = "Only show contacts whose name matches")]
        name: Option<String>,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Delete conversation memory older than the retention window")]
    Prune {
        #[arg(long, help = "Keep this many days instead of context.retention_days")]
        days: Option<u32>,
    },
    #[command(about = "Validate config, Twilio and LLM readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Contacts { name } => commands::contacts::run(name.as_deref()),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Prune { days } => commands::prune::run(days),
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
