use anyhow::{Context, Result};
use binlog_rollback::config::FlashbackConfig;
use binlog_rollback::flashback;
use clap::Parser;
use dbbackup::utils::logger;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "binlog-rollback", author, version, about, long_about = None)]
struct Cli {
    /// Flashback job config (INI, or JSON by extension)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Decode only; leave flashback.sql in the work dir for review
    #[arg(long)]
    parse_only: bool,

    /// Override a config value, e.g. stop_time=2024-03-01 11:00:00
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

fn override_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("override {:?} is not KEY=VALUE", raw))?;
    Ok((key.trim().to_lowercase(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(&cli.log_level, cli.log_file.as_deref())?;

    let mut overrides = Vec::with_capacity(cli.overrides.len() + 1);
    for raw in &cli.overrides {
        overrides.push(override_pair(raw)?);
    }
    if cli.parse_only {
        overrides.push(("parse_only".to_string(), "true".to_string()));
    }
    let cfg = FlashbackConfig::load(&cli.config, &overrides)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let target = format!("{}:{}", cfg.host, cfg.port);
    let output = flashback::run(cfg)
        .await
        .with_context(|| format!("flashback on {}", target))?;
    tracing::info!(output = %output.display(), "Flashback finished");
    Ok(())
}
