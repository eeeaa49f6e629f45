use clap::{Parser, Subcommand};
use datamigrate::config::AppConfig;
use datamigrate::data_transfer::connection_resolver::resolve_connections;
use datamigrate::data_transfer::mapper::render_mappings;
use datamigrate::data_transfer::planner::build_execution_plan;
use datamigrate::data_transfer::sink::{CompositeReporter, FileReporter, LogReporter};
use datamigrate::data_transfer::storage::RunHistory;
use datamigrate::data_transfer::{RunEnvironment, RunOptions};
use datamigrate::tables::MigrationTable;
use datamigrate::MigrationError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "datamigrate")]
#[command(about = "Migrates legacy SQL Server tables into the PostgreSQL schema")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace); RUST_LOG is used when absent
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate one or more tables (`all` runs every table)
    Run {
        #[arg(required = true)]
        tables: Vec<String>,
        /// Truncate each target table before loading
        #[arg(long)]
        truncate: bool,
        /// Load each table inside a single transaction
        #[arg(long)]
        transaction: bool,
        /// Use the parallel read/transform/write pipeline
        #[arg(long)]
        parallel: bool,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Cancel a table run after this many seconds
        #[arg(long)]
        max_duration: Option<u64>,
        /// Read and transform without writing to the target
        #[arg(long)]
        dry_run: bool,
    },

    /// List the registered tables
    List,

    /// Print the column mapping of a table
    Mappings { table: String },

    /// Show recent runs from the run history
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        table: Option<String>,
    },
}

fn init_logging(level: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.parse_filters(level);
    }
    builder.format_timestamp_millis().init();
}

// =====================================================
// MAIN
// =====================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let result = match cli.command {
        Commands::List => {
            cmd_list();
            Ok(())
        }
        Commands::Mappings { table } => cmd_mappings(&table),
        Commands::History { limit, table } => {
            cmd_history(cli.config.as_deref(), limit, table.as_deref()).await
        }
        Commands::Run {
            tables,
            truncate,
            transaction,
            parallel,
            batch_size,
            max_duration,
            dry_run,
        } => {
            let flags = RunFlags {
                truncate,
                transaction,
                parallel,
                batch_size,
                max_duration,
                dry_run,
            };
            cmd_run(cli.config.as_deref(), &tables, flags).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// =====================================================
// COMMANDS
// =====================================================

fn cmd_list() {
    for table in MigrationTable::ALL {
        println!("{}", table.describe());
    }
}

fn cmd_mappings(name: &str) -> Result<(), MigrationError> {
    let plan = build_execution_plan(&[name])?;
    for table in plan.tables() {
        print!("{}", render_mappings(table.target(), &table.mappings()));
    }
    Ok(())
}

async fn cmd_history(
    config_path: Option<&std::path::Path>,
    limit: usize,
    table: Option<&str>,
) -> Result<(), MigrationError> {
    let config = AppConfig::load(config_path)?;
    let history = RunHistory::open(&config.history_db_path())
        .await
        .map_err(MigrationError::Storage)?;
    let runs = history
        .recent(table, limit)
        .await
        .map_err(MigrationError::Storage)?;

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<32} {:<10} processed={} migrated={} skipped={} errored={}{}{}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.table,
            run.state.as_str(),
            run.counters.processed,
            run.counters.migrated,
            run.counters.skipped,
            run.counters.errored,
            if run.dry_run { " (dry run)" } else { "" },
            run.error
                .as_deref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

struct RunFlags {
    truncate: bool,
    transaction: bool,
    parallel: bool,
    batch_size: Option<usize>,
    max_duration: Option<u64>,
    dry_run: bool,
}

async fn cmd_run(
    config_path: Option<&std::path::Path>,
    requested: &[String],
    flags: RunFlags,
) -> Result<(), MigrationError> {
    let plan = build_execution_plan(requested)?;
    let config = AppConfig::load(config_path)?;
    let connections = resolve_connections(&config.connection_strings)?;

    let settings = &config.migration;
    let use_transaction = flags.transaction || settings.use_transaction;
    let options = RunOptions {
        batch_size: flags.batch_size.or(settings.batch_size),
        use_transaction,
        truncate: flags.truncate || settings.truncate_before_run,
        parallel: flags.parallel,
        dry_run: flags.dry_run,
        max_duration: flags
            .max_duration
            .or(settings.max_duration_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
        pipeline: settings.pipeline.resolve(use_transaction),
    };

    let mut reporter = CompositeReporter::new()
        .with(LogReporter)
        .with(FileReporter::new(&settings.report_dir, settings.report_format));
    match RunHistory::open(&config.history_db_path()).await {
        Ok(history) => reporter = reporter.with(history),
        Err(e) => log::warn!("Run history disabled: {}", e),
    }

    let shutdown = CancellationToken::new();
    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, cancelling the current run");
            ctrl_c_token.cancel();
        }
    });

    let env = RunEnvironment {
        connections,
        options,
        reporter: Arc::new(reporter),
        shutdown,
    };

    for table in plan.tables() {
        log::info!("Migrating {} from {}", table.name(), table.source_table());
        let migrated = table.execute(&env).await?;
        println!("{}: migrated {} rows", table.name(), migrated);
    }
    Ok(())
}
