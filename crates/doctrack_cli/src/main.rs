//! doctrack CLI.
//!
//! # Responsibility
//! - Expose apply and the postponed-documents batch over a database file.
//! - Keep output line-oriented for scripting.

use clap::{Parser, Subcommand};
use doctrack_core::{
    core_version, init_logging_from_config, open_db, parse_as_of_date, DocumentService,
    DocumentsConfig,
};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "doctrack")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Materialize documented entity history into snapshots")]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, default_value = "doctrack.db", value_name = "FILE")]
    db: PathBuf,

    /// JSON file with schemas and settings
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the core version
    Version,

    /// Apply one entity's documents and persist the result
    Apply {
        /// Schema kind of the entity
        #[arg(long)]
        kind: String,

        /// Entity identifier
        #[arg(long, value_name = "UUID")]
        entity: Uuid,

        /// Last calendar day to materialize (YYYY-MM-DD), today when omitted
        #[arg(long, value_name = "DATE")]
        as_of: Option<String>,
    },

    /// Apply every entity with documents of one kind dated on one day
    ApplyPostponed {
        #[arg(long)]
        kind: String,

        /// Document day (YYYY-MM-DD)
        #[arg(long, value_name = "DATE")]
        date: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!("event=cli_exit module=cli status=error reason={message}");
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    if let Command::Version = cli.command {
        println!("doctrack_core version={}", core_version());
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => DocumentsConfig::from_path(path).map_err(|err| err.to_string())?,
        None => DocumentsConfig::default(),
    };
    if let Some(logging) = &config.logging {
        init_logging_from_config(logging).map_err(|err| err.to_string())?;
    }

    let registry = config.schema_registry().map_err(|err| err.to_string())?;
    let conn = open_db(&cli.db).map_err(|err| err.to_string())?;
    let service = DocumentService::new(&conn, Arc::new(registry))
        .create_entity_after_change_created(config.create_entity_after_change_created);

    match cli.command {
        Command::Version => {}
        Command::Apply {
            kind,
            entity,
            as_of,
        } => {
            let as_of = as_of
                .as_deref()
                .map(parse_as_of_date)
                .transpose()
                .map_err(|err| err.to_string())?;
            let outcome = service
                .apply(&kind, entity, as_of)
                .map_err(|err| err.to_string())?;
            match &outcome.snapshot {
                Some(snapshot) => println!(
                    "entity={} history_date={} changed_fields={}",
                    outcome.entity_id,
                    snapshot.history_date,
                    outcome.changed_fields.join(",")
                ),
                None => println!("entity={} snapshot=none", outcome.entity_id),
            }
        }
        Command::ApplyPostponed { kind, date } => {
            let day = parse_as_of_date(&date).map_err(|err| err.to_string())?;
            let report = service
                .apply_postponed(&kind, day)
                .map_err(|err| err.to_string())?;
            println!(
                "kind={} day={} applied={} skipped={}",
                report.kind,
                report.day,
                report.applied.len(),
                report.skipped
            );
            for entity_id in report.applied {
                println!("applied entity={entity_id}");
            }
        }
    }
    Ok(())
}
