#![forbid(unsafe_code)]

use clap::{Parser, Subcommand};
use fsx::Engine;
use fsx::checkpoint::{CheckpointTrigger, Checkpointer, ColumnDef, ColumnType, EntitySchema};
use fsx::config::EngineConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fsx-admin", version, about = "Operator commands for the fsx storage engine", long_about = None)]
struct Cli {
    /// Path to the engine's SQLite metadata database.
    #[arg(long, default_value = "fsx.db")]
    db: PathBuf,
    /// Directory holding the extent store and warm/cold tier backends.
    #[arg(long, default_value = "fsx-data")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flush a file's dirty pages to extents. Omitting `file_id` flushes
    /// every file with pending writes.
    Flush { file_id: Option<String> },
    /// Truncate a file to a given byte size, re-materializing and splitting
    /// extents as needed.
    Truncate { file_id: String, size: u64 },
    /// Run a manual checkpoint of the example columnar entity table.
    Checkpoint,
    /// Run the tiered blob router's promotion/demotion migration.
    Migrate {
        #[arg(long)]
        dry_run: bool,
    },
    /// Print file/directory/blob counts and per-tier size breakdown.
    Stats,
}

fn open_engine(cli: &Cli) -> Result<Engine, Box<dyn std::error::Error>> {
    Ok(Engine::open(&cli.db, &cli.data_dir, EngineConfig::default())?)
}

/// The schema `checkpoint` exercises: a generic `kv_entries` table standing
/// in for whatever entity table an embedder registers with the columnar
/// checkpointer. Real deployments register their own schema programmatically
/// via [`fsx::checkpoint::Checkpointer`].
fn example_schema() -> EntitySchema {
    EntitySchema::new("kv_entries", "id", vec![ColumnDef::new("id", ColumnType::Text), ColumnDef::new("data", ColumnType::Json)])
}

fn main() {
    fsx::logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("fsx-admin: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    match &cli.command {
        Commands::Flush { file_id } => {
            let engine = open_engine(cli)?;
            match file_id {
                Some(id) => runtime.block_on(engine.extents.flush_file(id))?,
                None => runtime.block_on(engine.extents.flush())?,
            }
            println!("flush ok");
            Ok(())
        }
        Commands::Truncate { file_id, size } => {
            let engine = open_engine(cli)?;
            runtime.block_on(engine.extents.truncate(file_id, *size))?;
            println!("truncated file_id={file_id} size={size}");
            Ok(())
        }
        Commands::Checkpoint => {
            let engine = open_engine(cli)?;
            let conn = fsx::sql::SqlConn::open(&cli.db)?;
            conn.with(|c| c.execute_batch("CREATE TABLE IF NOT EXISTS kv_entries (id TEXT PRIMARY KEY, data TEXT)"))?;
            let checkpointer = Checkpointer::new(
                std::sync::Arc::new(conn),
                example_schema(),
                fsx::buffer::BufferConfig::from(&engine.config().write_buffer),
                engine.config().checkpoint.clone(),
            );
            let result = checkpointer.checkpoint(CheckpointTrigger::Manual)?;
            println!(
                "checkpoint entities={} bytes={} duration_ms={} trigger={}",
                result.entity_count,
                result.total_bytes,
                result.duration_ms,
                result.trigger.as_str()
            );
            Ok(())
        }
        Commands::Migrate { dry_run } => {
            let engine = open_engine(cli)?;
            let report = runtime.block_on(engine.router.run_migration(*dry_run))?;
            println!(
                "migrate dry_run={dry_run} promoted={} demoted={} errors={}",
                report.promoted.len(),
                report.demoted.len(),
                report.errors.len()
            );
            for err in &report.errors {
                eprintln!("fsx-admin: migrate error: {err}");
            }
            Ok(())
        }
        Commands::Stats => {
            let engine = open_engine(cli)?;
            let files = engine.metadata.count_files()?;
            let dirs = engine.metadata.count_dirs()?;
            let total_size = engine.metadata.sum_size()?;
            println!("files={files} dirs={dirs} total_size={total_size}");
            for (tier, count, size) in engine.metadata.tier_stats()? {
                println!("tier={} count={count} size={size}", tier.as_str());
            }
            Ok(())
        }
    }
}
