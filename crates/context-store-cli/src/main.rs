use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use context_store_api::{ContextStore, Scheduler};
use context_store_core::config::{ENV_LOCK_STRATEGY, STATE_FILE};
use context_store_core::{LockStrategy, MetaMergeStrategy, StoreConfig};
use context_store_sqlite::SqliteStateStore;
use serde::Serialize;
use serde_json::Value;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "ctx.v1";
const SIGNAL_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "ctx")]
#[command(about = "Context store CLI")]
struct Cli {
    /// Project root holding one directory per app.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Durable store path. Defaults to `<root>/context_store.sqlite3`.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Overrides the lock strategy from the environment.
    #[arg(long)]
    lock_strategy: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print resolved configuration and the chosen lock backend.
    Info,
    /// List apps that have a context store directory.
    Apps,
    /// Run the startup restore cascade for every app.
    Restore,
    /// Restore, then persist every app's in-memory state.
    Autosave,
    /// Back up every `state.json` and the durable store.
    Backup,
    Status {
        #[command(subcommand)]
        command: StatusCommand,
    },
    Block {
        #[command(subcommand)]
        command: BlockCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Meta {
        #[command(subcommand)]
        command: MetaCommand,
    },
    /// Compare durable rows with the registry, restoring where they disagree.
    VerifyRestore(VerifyArgs),
    /// Run the autosave/backup scheduler in the foreground.
    Run(RunArgs),
}

#[derive(Debug, Subcommand)]
enum StatusCommand {
    Set(StatusSetArgs),
    Get(EntryArgs),
    Delete(EntryArgs),
}

#[derive(Debug, Subcommand)]
enum BlockCommand {
    Set(BlockSetArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    MigrateJson(AppArgs),
    Upsert(DbUpsertArgs),
    Show(DbShowArgs),
    History(EntryArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    Stats(DbStatsArgs),
    Health,
}

#[derive(Debug, Subcommand)]
enum MetaCommand {
    /// Write a default `meta.json` for apps that only have `state.json`.
    Generate(MetaGenerateArgs),
    /// Merge `*.meta.json` sidecars into each app's `meta.json`.
    Migrate(MetaMigrateArgs),
}

#[derive(Debug, Args)]
struct MetaGenerateArgs {
    /// Limit to these apps; repeatable.
    #[arg(long = "app")]
    apps: Vec<String>,
}

#[derive(Debug, Args)]
struct MetaMigrateArgs {
    /// `latest` or `merge`.
    #[arg(long, default_value = "latest")]
    strategy: String,
    /// Leave merged sidecars in place instead of moving them to `meta_backups/`.
    #[arg(long, default_value_t = false)]
    no_backup: bool,
}

#[derive(Debug, Args)]
struct VerifyArgs {
    #[arg(long = "app")]
    apps: Vec<String>,
    /// Report only; never restore.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct AppArgs {
    #[arg(long)]
    app: String,
}

#[derive(Debug, Args)]
struct EntryArgs {
    #[arg(long)]
    app: String,
    #[arg(long)]
    serial: String,
}

#[derive(Debug, Args)]
struct StatusSetArgs {
    #[arg(long)]
    app: String,
    #[arg(long)]
    serial: String,
    /// Dotted path under `STATUS`, e.g. `sensors.temp`.
    #[arg(long)]
    path: String,
    /// JSON value; anything that does not parse is stored as a string.
    #[arg(long)]
    value: String,
    #[arg(long)]
    command: Option<String>,
}

#[derive(Debug, Args)]
struct BlockSetArgs {
    #[arg(long)]
    app: String,
    #[arg(long)]
    serial: String,
    /// Top-level block name, e.g. `SETUP`.
    #[arg(long)]
    name: String,
    #[arg(long)]
    value: String,
    #[arg(long)]
    command: Option<String>,
}

#[derive(Debug, Args)]
struct DbUpsertArgs {
    #[arg(long)]
    app: String,
    #[arg(long)]
    serial: String,
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct DbShowArgs {
    #[arg(long)]
    app: String,
    #[arg(long)]
    serial: Option<String>,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    /// Explicit destination; otherwise a rotated copy under `backups/`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbStatsArgs {
    #[arg(long)]
    app: Option<String>,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Stop after this many seconds; otherwise runs until SIGINT or SIGTERM.
    #[arg(long)]
    seconds: Option<u64>,
    #[arg(long, default_value_t = false)]
    skip_restore: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert("contract_version".to_string(), Value::String(CLI_CONTRACT_VERSION.to_string()));
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: &impl Serialize) -> Result<()> {
    let value = serde_json::to_value(value)?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_payload(raw: &str) -> Result<Value> {
    let payload: Value = serde_json::from_str(raw).context("payload must be valid JSON")?;
    if !payload.is_object() {
        return Err(anyhow!("payload must be a JSON object"));
    }
    Ok(payload)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn build_store(cli: &Cli) -> Result<ContextStore> {
    let mut config = StoreConfig::from_env();
    if let Some(raw) = cli.lock_strategy.as_deref() {
        config.lock.strategy = LockStrategy::parse(raw)
            .with_context(|| format!("unknown lock strategy `{raw}` (see {ENV_LOCK_STRATEGY})"))?;
    }
    if let Some(db) = cli.db.clone() {
        config.db_path = Some(db);
    }
    Ok(ContextStore::new(cli.root.clone(), config))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let store = build_store(&cli)?;
    match cli.command {
        Command::Info => run_info(&store),
        Command::Apps => emit_json(&serde_json::json!({ "apps": store.apps()? })),
        Command::Restore => emit_json(&store.restore_all()?),
        Command::Autosave => run_autosave(&store),
        Command::Backup => emit_json(&store.backup_all()?),
        Command::Status { command } => run_status(command, &store),
        Command::Block { command } => run_block(command, &store),
        Command::Db { command } => run_db(command, &store),
        Command::Meta { command } => run_meta(command, &store),
        Command::VerifyRestore(args) => {
            let apps = (!args.apps.is_empty()).then_some(args.apps.as_slice());
            emit_json(&store.verify_restore(apps, args.dry_run)?)
        }
        Command::Run(args) => run_scheduler(&args, store),
    }
}

fn run_info(store: &ContextStore) -> Result<()> {
    let config = store.config();
    emit_json(&serde_json::json!({
        "root": store.root(),
        "db_path": store.db_path(),
        "state_file": STATE_FILE,
        "lock_backend": store.persistence().lock_backend(),
        "lock_strategy": config.lock.strategy.as_str(),
        "lock_timeout_secs": config.lock.timeout.as_secs_f64(),
        "lock_max_retries": config.lock.max_retries,
        "backup_enabled": config.backup_enabled,
        "backup_interval_secs": config.backup_interval.as_secs_f64(),
        "autosave_interval_secs": config.autosave_interval.as_secs_f64(),
        "retention": {
            "keep_days": config.retention.keep_days,
            "max_backups": config.retention.max_backups,
            "max_total_bytes": config.retention.max_total_bytes
        }
    }))
}

fn run_autosave(store: &ContextStore) -> Result<()> {
    let restored = store.restore_all()?;
    let report = store.autosave_all();
    emit_json(&serde_json::json!({ "restored": restored, "autosave": report }))
}

fn run_status(command: StatusCommand, store: &ContextStore) -> Result<()> {
    match command {
        StatusCommand::Set(args) => {
            let path: Vec<&str> = args.path.split('.').filter(|segment| !segment.is_empty()).collect();
            if path.is_empty() {
                return Err(anyhow!("--path must name at least one key"));
            }
            let outcome =
                store.save_status_path(&args.app, &args.serial, &path, parse_value(&args.value), args.command.as_deref())?;
            emit_json(&outcome)
        }
        StatusCommand::Get(args) => {
            let entry = store
                .persistence()
                .load_entry(&args.app, &args.serial)
                .with_context(|| format!("no entry {} in {}", args.serial, args.app))?;
            emit_json(&serde_json::json!({ "app": args.app, "serial": args.serial, "entry": entry }))
        }
        StatusCommand::Delete(args) => {
            let outcome = store.persistence().delete_entry(&args.app, &args.serial)?;
            emit_json(&serde_json::json!({ "removed": outcome.removed, "durable_removed": outcome.mirror_removed }))
        }
    }
}

fn run_block(command: BlockCommand, store: &ContextStore) -> Result<()> {
    match command {
        BlockCommand::Set(args) => {
            let outcome = store.save_block_top_level(
                &args.app,
                &args.serial,
                &args.name,
                parse_value(&args.value),
                args.command.as_deref(),
            )?;
            emit_json(&outcome)
        }
    }
}

fn run_db(command: DbCommand, store: &ContextStore) -> Result<()> {
    match command {
        DbCommand::MigrateJson(args) => emit_json(&store.migrate_json(&args.app)?),
        DbCommand::Upsert(args) => emit_json(&store.upsert_state(&args.app, &args.serial, &parse_payload(&args.payload)?)?),
        DbCommand::Show(args) => {
            let states = store.db_states(&args.app, args.serial.as_deref())?;
            emit_json(&serde_json::json!({ "app": args.app, "states": states }))
        }
        DbCommand::History(args) => {
            let history = store.db_history(&args.app, &args.serial)?;
            emit_json(&serde_json::json!({ "app": args.app, "serial": args.serial, "history": history }))
        }
        DbCommand::Backup(args) => match args.out {
            Some(out) => emit_json(&serde_json::json!({ "path": store.backup_db_to(&out)? })),
            None => emit_json(&store.backup_db()?),
        },
        DbCommand::Restore(args) => {
            let mut durable = SqliteStateStore::open(store.db_path())?;
            durable.restore_db(&args.input)?;
            emit_json(&serde_json::json!({
                "restored_from": args.input,
                "schema_version": durable.schema_version()?
            }))
        }
        DbCommand::Stats(args) => emit_json(&store.db_stats(args.app.as_deref())?),
        DbCommand::Health => emit_json(&store.db_health()?),
    }
}

/// Set the returned flag on the first termination signal; a second one exits immediately.
fn install_shutdown_flag() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    for &signal in TERM_SIGNALS {
        flag::register_conditional_shutdown(signal, 1, Arc::clone(&stop))
            .with_context(|| format!("failed to install handler for signal {signal}"))?;
        flag::register(signal, Arc::clone(&stop))
            .with_context(|| format!("failed to install handler for signal {signal}"))?;
    }
    Ok(stop)
}

fn run_meta(command: MetaCommand, store: &ContextStore) -> Result<()> {
    match command {
        MetaCommand::Generate(args) => {
            let apps = (!args.apps.is_empty()).then_some(args.apps.as_slice());
            let generated = store.persistence().generate_meta_from_state(apps)?;
            emit_json(&serde_json::json!({ "apps": generated }))
        }
        MetaCommand::Migrate(args) => {
            let strategy = MetaMergeStrategy::parse(&args.strategy)
                .with_context(|| format!("unknown merge strategy `{}` (expected latest or merge)", args.strategy))?;
            let migrated = store.persistence().migrate_meta_files(strategy, !args.no_backup)?;
            emit_json(&serde_json::json!({ "strategy": strategy, "apps": migrated }))
        }
    }
}

fn run_scheduler(args: &RunArgs, store: ContextStore) -> Result<()> {
    let stop = install_shutdown_flag()?;
    let scheduler = Scheduler::new(Arc::new(store));
    if !args.skip_restore {
        scheduler.restore_all()?;
    }
    scheduler.start()?;

    let deadline = args.seconds.and_then(|seconds| Instant::now().checked_add(Duration::from_secs(seconds)));
    tracing::info!(seconds = args.seconds, "scheduler running; waiting for shutdown signal");
    while !stop.load(Ordering::SeqCst) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }
        thread::sleep(SIGNAL_POLL);
    }
    if stop.load(Ordering::SeqCst) {
        tracing::info!("shutdown signal received");
    }
    scheduler.shutdown();
    emit_json(&serde_json::json!({
        "state": scheduler.state(),
        "stats": scheduler.stats(),
        "history": scheduler.history()
    }))
}
