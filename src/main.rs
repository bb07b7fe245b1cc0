use clap::{Args, Parser, Subcommand};
use ledger_migrate::config::JobConfig;
use ledger_migrate::engine::{preview, MigrationEngine};
use ledger_migrate::entry::EntrySet;
use ledger_migrate::ledger::{open_ledger, JournalLedger, Ledger};
use ledger_migrate::planner::PackingPolicy;
use ledger_migrate::reporter::ProgressReport;
use ledger_migrate::source::EntrySource;
use ledger_migrate::store::ProgressStore;
use ledger_migrate::MigrateError;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Exit status after an operator interrupt (128 + SIGINT).
const INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "ledger-migrate")]
#[command(about = "Resumable batch migration of owner holdings into an external ledger", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all outstanding entries, resuming from the progress file
    Run(JobArgs),
    /// Print the batches a run would submit, without locking or writing
    Plan {
        #[command(flatten)]
        job: JobArgs,
        /// List every entry of every batch
        #[arg(long)]
        verbose: bool,
    },
    /// Print the progress report of an existing progress file
    Status(JobArgs),
}

#[derive(Args)]
struct JobArgs {
    /// JSON job file; flags below override its fields
    #[arg(long, short)]
    config: Option<PathBuf>,
    #[arg(long)]
    job: Option<String>,
    /// Snapshot file (repeatable)
    #[arg(long = "snapshot", short)]
    snapshots: Vec<PathBuf>,
    /// Progress file; the lock file sits next to it with a .lock suffix
    #[arg(long, short)]
    progress: Option<PathBuf>,
    /// journal:<path> or an http(s) endpoint
    #[arg(long, short)]
    ledger: Option<String>,
    /// Pack at most N owners per batch
    #[arg(long, conflicts_with_all = ["entry_count", "unit_count"])]
    owner_count: Option<usize>,
    /// Pack at most N entries per batch, round-robin across owners
    #[arg(long, conflicts_with = "unit_count")]
    entry_count: Option<usize>,
    /// Pack at most N units of quantity per batch
    #[arg(long)]
    unit_count: Option<u64>,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    retry_delay_ms: Option<u64>,
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Keep owner keys exactly as written in the snapshots
    #[arg(long)]
    keep_owner_case: bool,
    /// Plan permanently failed entries again
    #[arg(long)]
    retry_failed: bool,
}

impl JobArgs {
    fn resolve(&self) -> Result<JobConfig, MigrateError> {
        let mut config = match &self.config {
            Some(path) => JobConfig::load(path)?,
            None => JobConfig::default(),
        };
        if let Some(job) = &self.job {
            config.job = job.clone();
        }
        if !self.snapshots.is_empty() {
            config.snapshots = self.snapshots.clone();
        }
        if let Some(progress) = &self.progress {
            config.progress = progress.clone();
        }
        if self.ledger.is_some() {
            config.ledger = self.ledger.clone();
        }
        if let Some(max_owners) = self.owner_count {
            config.engine.packing = PackingPolicy::OwnerCount { max_owners };
        }
        if let Some(max_entries) = self.entry_count {
            config.engine.packing = PackingPolicy::EntryCount { max_entries };
        }
        if let Some(max_units) = self.unit_count {
            config.engine.packing = PackingPolicy::UnitCount { max_units };
        }
        if let Some(n) = self.max_retries {
            config.engine.max_retries = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            config.engine.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout_ms {
            config.engine.operation_timeout = Duration::from_millis(ms);
        }
        if self.keep_owner_case {
            config.normalize_owner_case = false;
        }
        if self.retry_failed {
            config.retry_failed = true;
        }
        config.validate()?;
        Ok(config)
    }
}

fn load_source(config: &JobConfig) -> Result<EntrySet, MigrateError> {
    let source = EntrySource::new(config.snapshots.clone(), config.source_options());
    let (set, stats) = source.load()?;
    println!(
        "[migrate] Loaded {} snapshot file(s): {} owners, {} entries, {} units",
        stats.files, stats.owners, stats.entries, stats.total_quantity
    );
    Ok(set)
}

/// Journal ledgers are capped at the snapshot quantities so a replay can
/// never apply more than was requested.
fn build_ledger(config: &JobConfig, source: &EntrySet) -> Result<Box<dyn Ledger>, MigrateError> {
    let target = config
        .ledger
        .as_deref()
        .ok_or_else(|| MigrateError::Input("no ledger configured (use --ledger)".to_string()))?;
    if let Some(path) = target.strip_prefix("journal:") {
        return Ok(Box::new(JournalLedger::open(path)?.with_caps(source.clone())));
    }
    open_ledger(target, config.engine.operation_timeout)
}

/// The first SIGINT/SIGTERM asks the run to stop after the batch in flight
/// is saved. A second one removes the lock and exits immediately.
fn install_interrupt_handler(lock: &Path) -> Result<Arc<AtomicBool>, MigrateError> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    let lock = lock.to_path_buf();
    ctrlc::set_handler(move || {
        if handler_flag.swap(true, Ordering::SeqCst) {
            let _ = fs::remove_file(&lock);
            eprintln!("[migrate] Interrupted again, lock released, exiting");
            process::exit(INTERRUPTED);
        }
        warn!("interrupt received, finishing the current batch (interrupt again to abort)");
    })
    .map_err(|e| MigrateError::Other(format!("cannot install signal handler: {}", e)))?;
    Ok(flag)
}

/// Returns whether the run stopped on an interrupt.
fn run(args: &JobArgs) -> Result<bool, MigrateError> {
    let config = args.resolve()?;
    println!("[migrate] Starting job '{}'", config.job);
    println!("[migrate] Progress file: {}", config.progress.display());

    let source = load_source(&config)?;
    let ledger = build_ledger(&config, &source)?;
    let engine = MigrationEngine::open(&config, source, ledger)?;
    let interrupt = install_interrupt_handler(&config.lock_path())?;
    let mut engine = engine.with_interrupt(interrupt);
    println!(
        "[migrate] {} batches planned under {}",
        engine.planned_batches(),
        config.engine.packing
    );

    let summary = engine.run()?;
    summary.print();
    Ok(summary.interrupted)
}

fn plan(args: &JobArgs, verbose: bool) -> Result<(), MigrateError> {
    let config = args.resolve()?;
    let source = load_source(&config)?;
    let preview = preview(&config, &source)?;

    println!("[migrate] {} batches under {}", preview.batches.len(), config.engine.packing);
    for (i, batch) in preview.batches.iter().enumerate() {
        println!(
            "[migrate] batch {}: {} owners, {} entries, {} units",
            preview.record.next_batch_index + i as u64,
            batch.owner_count(),
            batch.entry_count(),
            batch.total_quantity()
        );
        if verbose {
            println!("          {}", batch.describe());
        }
    }
    Ok(())
}

fn status(args: &JobArgs) -> Result<(), MigrateError> {
    let config = args.resolve()?;
    let source = load_source(&config)?;
    let store = ProgressStore::open_read_only(&config.progress, &config.job);
    if !store.exists() {
        println!("[migrate] No progress file at {}", config.progress.display());
    }
    let mut record = store.load()?;
    if config.normalize_owner_case {
        record.lowercase_owners();
    }
    record.reconcile(&source);

    ProgressReport::from_record(&record, &source).print();
    for failed in record.unresolved_failures() {
        let ids: Vec<String> = failed
            .entries
            .iter()
            .map(|e| format!("{}/{}x{}", e.owner_key, e.asset_id, e.quantity))
            .collect();
        println!(
            "[migrate] failed batch {}: {} ({})",
            failed.batch_index,
            ids.join(","),
            failed.error
        );
    }
    if config.lock_path().exists() {
        println!("[migrate] Lock file present: {}", config.lock_path().display());
    }
    Ok(())
}

fn main() -> Result<(), MigrateError> {
    ledger_migrate::init_tracing("ledger-migrate");
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => {
            if run(args)? {
                process::exit(INTERRUPTED);
            }
            Ok(())
        }
        Commands::Plan { job, verbose } => plan(job, *verbose),
        Commands::Status(args) => status(args),
    }
}
