use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use shmstore::ShmTable;
use shmstore_cli::{Operation, parse_file, run_and_detach};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Insert, delete, look up or dump records in a shared memory hash table.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// File of `<u64 key> <value>` lines.
    file: PathBuf,

    /// 1 = insert, 2 = delete, 3 = lookup, anything else = dump the table.
    op: String,

    /// Name of the shared table.
    #[arg(long, env = "SHMSTORE_NAME", default_value = "shmstore")]
    name: String,

    /// Remove the table's shared memory objects when done.
    #[arg(long)]
    unlink: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match execute(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("shmstore: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn execute(args: &Args) -> Result<()> {
    let records = parse_file(&args.file)
        .with_context(|| format!("file parse error in {}", args.file.display()))?;
    let operation = Operation::from_code(&args.op);

    let table = ShmTable::attach(&args.name)
        .with_context(|| format!("failed to attach shared table {:?}", args.name))?;

    let stdout = io::stdout();
    let outcome = run_and_detach(table, operation, &records, &mut stdout.lock(), args.unlink)?;
    if outcome.failed_inserts > 0 {
        eprintln!("{} insert(s) failed: table is full", outcome.failed_inserts);
    }
    if outcome.missing_deletes > 0 {
        eprintln!("{} key(s) to delete were not present", outcome.missing_deletes);
    }
    info!(?operation, ?outcome, "done");
    Ok(())
}
