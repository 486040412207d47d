//! dbbackup - backup, restore and cluster backup coordination.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dbbackup::config::{parse_override, BackupConfig};
use dbbackup::report::Reporter;
use dbbackup::spider::{self, RunOutcome};
use dbbackup::{dumper, loader, migrate, utils};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "dbbackup", author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stdout
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up one instance
    Dumpbackup(DumpArgs),

    /// Restore a backup described by an index file
    Loadbackup {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Override a config value, e.g. logical_load.databases=db1
        #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
        overrides: Vec<String>,
    },

    /// Coordinated backups of a sharded cluster
    Spiderbackup {
        #[command(subcommand)]
        action: SpiderAction,
    },

    /// Convert a legacy .info description into an .index manifest
    Migrateold {
        #[arg(long, value_name = "FILE")]
        legacy_info: PathBuf,

        #[arg(long, value_name = "DIR")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DumpArgs {
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// logical or physical
    #[arg(long)]
    backup_type: Option<String>,

    /// Comma separated subset of data, schema, grant, or all
    #[arg(long)]
    data_schema_grant: Option<String>,

    #[arg(long)]
    backup_id: Option<String>,

    /// Override a config value, e.g. public.tar_size_threshold=2048
    #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
    overrides: Vec<String>,

    /// Do not kill the capture tool at public.backup_timeout
    #[arg(long)]
    nocheck_deadline: bool,
}

#[derive(Subcommand, Debug)]
enum SpiderAction {
    /// On the routing node: create one task per shard
    Schedule {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Block until every shard finishes
        #[arg(long)]
        wait: bool,
    },

    /// On a storage node: reconcile local tasks and launch the next one
    Check {
        /// One config per local instance; the first one names this node
        #[arg(short, long, value_name = "FILE", required = true, num_args = 1..)]
        config: Vec<PathBuf>,

        /// Keep checking every spider.poll_interval_secs until signalled
        #[arg(long)]
        daemon: bool,
    },

    /// Claim and run this instance's task of a cluster backup
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        #[arg(long)]
        backup_id: String,
    },
}

fn load_config(path: &Path, raw: &[String], extra: Vec<(String, String)>) -> Result<BackupConfig> {
    let mut overrides = extra;
    for item in raw {
        overrides.push(parse_override(item)?);
    }
    BackupConfig::load(path, &overrides).with_context(|| format!("loading {}", path.display()))
}

async fn dumpbackup(args: DumpArgs) -> Result<()> {
    let mut extra = Vec::new();
    if let Some(t) = args.backup_type {
        extra.push(("public.backup_type".to_string(), t.to_lowercase()));
    }
    if let Some(s) = args.data_schema_grant {
        extra.push(("public.data_schema_grant".to_string(), s));
    }
    if let Some(id) = args.backup_id {
        extra.push(("public.backup_id".to_string(), id));
    }
    let cfg = load_config(&args.config, &args.overrides, extra)?;
    let reporter = Reporter::new(&cfg);
    let index = dumper::run_dump(&cfg, &reporter, !args.nocheck_deadline)
        .await
        .with_context(|| format!("backup {} of port {}", cfg.public.backup_id, cfg.public.mysql_port))?;
    tracing::info!(
        backup_id = %index.backup_id,
        target = %index.target_name,
        parts = index.archive_parts().len(),
        "Backup complete"
    );
    Ok(())
}

async fn spiderbackup(action: SpiderAction, log_file: Option<PathBuf>) -> Result<()> {
    match action {
        SpiderAction::Schedule { config, wait } => {
            let cfg = load_config(&config, &[], Vec::new())?;
            if let Some(id) = spider::schedule_command(&cfg, wait).await? {
                println!("{}", id);
            }
        }
        SpiderAction::Check { config, daemon } => {
            let mut configs = Vec::with_capacity(config.len());
            for path in config {
                let cfg = load_config(&path, &[], Vec::new())?;
                configs.push((path, cfg));
            }
            spider::check_command(&configs, daemon, log_file).await?;
        }
        SpiderAction::Run { config, backup_id } => {
            let cfg = load_config(&config, &[], Vec::new())?;
            match spider::run_command(&cfg, &backup_id).await? {
                RunOutcome::Failed(reason) => bail!("cluster backup task failed: {}", reason),
                outcome => tracing::info!(backup_id = %backup_id, outcome = ?outcome, "Task finished"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    utils::logger::init(&cli.log_level, cli.log_file.as_deref())?;
    tracing::debug!("dbbackup v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Dumpbackup(args) => dumpbackup(args).await,
        Command::Loadbackup { config, overrides } => {
            let cfg = load_config(&config, &overrides, Vec::new())?;
            loader::run_load(&cfg)
                .await
                .with_context(|| format!("load into port {}", cfg.public.mysql_port))?;
            tracing::info!("Load complete");
            Ok(())
        }
        Command::Spiderbackup { action } => spiderbackup(action, cli.log_file).await,
        Command::Migrateold { legacy_info, output } => {
            let path = migrate::migrate(&legacy_info, &output)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}
