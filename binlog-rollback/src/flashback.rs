//! The flashback job: precheck, decode in flashback mode, replay.
//!
//! Steps must run in order and the first failure is terminal; a failed
//! job refuses further steps.

use crate::config::{FlashbackConfig, TIME_FORMAT};
use crate::error::{Result, RollbackError};
use crate::precheck::{self, Prepared};
use dbbackup::utils::cmd::{find_tool, ExternalCommand};
use sqlx::MySqlPool;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DECODER: &str = "mysqlbinlog";
pub const CLIENT: &str = "mysql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    New,
    PreChecked,
    Started,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::New => "new",
            Stage::PreChecked => "prechecked",
            Stage::Started => "started",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Arguments for the decoder in flashback mode: inverted row events,
/// bounded by the window and filters, reading the snapshotted binlogs.
pub fn decoder_args(cfg: &FlashbackConfig, prepared: &Prepared) -> Vec<String> {
    let mut args = vec![
        "--flashback".to_string(),
        format!("--start-datetime={}", prepared.start.format(TIME_FORMAT)),
        format!("--stop-datetime={}", prepared.stop.format(TIME_FORMAT)),
    ];
    let databases = cfg.database_list();
    if !databases.is_empty() {
        args.push(format!("--database={}", databases.join(",")));
    }
    let tables = cfg.table_list();
    if !tables.is_empty() {
        args.push(format!("--table={}", tables.join(",")));
    }
    if let Some(filter) = &prepared.rows_filter {
        args.push(format!("--rows-filter={}", filter));
    }
    args.extend(prepared.binlogs.iter().map(|p| p.display().to_string()));
    args
}

/// Client arguments for replaying the decoded file. Replayed statements
/// stay out of the binlog unless `recover_binlog` is set.
pub fn client_args(cfg: &FlashbackConfig) -> Vec<String> {
    let mut args = vec![
        format!("--host={}", cfg.host),
        format!("--port={}", cfg.port),
        format!("--user={}", cfg.user),
        format!("--password={}", cfg.password),
        format!("--default-character-set={}", cfg.charset),
    ];
    if !cfg.recover_binlog {
        args.push("--init-command=SET SESSION sql_log_bin=0".to_string());
    }
    args
}

pub struct Flashback {
    cfg: FlashbackConfig,
    stage: Stage,
    prepared: Option<Prepared>,
}

impl Flashback {
    pub fn new(cfg: FlashbackConfig) -> Self {
        Self {
            cfg,
            stage: Stage::New,
            prepared: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn output_path(&self) -> PathBuf {
        self.cfg.output_path()
    }

    fn require(&self, want: Stage, action: &'static str) -> Result<()> {
        if self.stage != want {
            return Err(RollbackError::State {
                action,
                state: self.stage.to_string(),
            });
        }
        Ok(())
    }

    fn settle<T>(&mut self, next: Stage, result: Result<T>) -> Result<T> {
        self.stage = if result.is_ok() { next } else { Stage::Failed };
        result
    }

    pub async fn precheck(&mut self, pool: &MySqlPool) -> Result<()> {
        self.require(Stage::New, "precheck")?;
        let result = precheck::run_precheck(&self.cfg, pool).await;
        self.prepared = Some(self.settle(Stage::PreChecked, result)?);
        Ok(())
    }

    /// Decode into `flashback.sql` under the work dir.
    pub async fn start(&mut self) -> Result<PathBuf> {
        self.require(Stage::PreChecked, "start")?;
        let result = match &self.prepared {
            Some(prepared) => decode(&self.cfg, prepared).await,
            None => Err(RollbackError::State {
                action: "start",
                state: "unprepared".to_string(),
            }),
        };
        self.settle(Stage::Started, result)
    }

    pub async fn import(&mut self) -> Result<()> {
        self.require(Stage::Started, "import")?;
        if self.cfg.parse_only {
            info!(output = %self.output_path().display(), "Parse only, replay skipped");
            self.stage = Stage::Done;
            return Ok(());
        }
        let result = replay(&self.cfg).await;
        self.settle(Stage::Done, result)
    }

    #[cfg(test)]
    pub(crate) fn prepared_with(cfg: FlashbackConfig, prepared: Prepared) -> Self {
        Self {
            cfg,
            stage: Stage::PreChecked,
            prepared: Some(prepared),
        }
    }
}

fn tool_path(name: &str, explicit: Option<&Path>, cfg: &FlashbackConfig) -> Result<PathBuf> {
    Ok(find_tool(name, explicit, cfg.tool_dir.as_deref())?)
}

async fn decode(cfg: &FlashbackConfig, prepared: &Prepared) -> Result<PathBuf> {
    let program = tool_path(DECODER, cfg.decoder_path.as_deref(), cfg)?;
    let output = cfg.output_path();
    ExternalCommand::new(DECODER, program)
        .args(decoder_args(cfg, prepared))
        .stdout_file(&output)
        .log_to(cfg.work_dir.join(format!("{}.log", DECODER)))
        .run()
        .await?;
    let size = std::fs::metadata(&output)?.len();
    if size == 0 {
        warn!(output = %output.display(), "Decoder produced no statements; nothing to undo");
    }
    info!(output = %output.display(), size, "Binlogs decoded");
    Ok(output)
}

async fn replay(cfg: &FlashbackConfig) -> Result<()> {
    let program = tool_path(CLIENT, cfg.mysql_client_path.as_deref(), cfg)?;
    ExternalCommand::new(CLIENT, program)
        .args(client_args(cfg))
        .stdin_file(cfg.output_path())
        .log_to(cfg.work_dir.join(format!("{}_import.log", CLIENT)))
        .run()
        .await?;
    info!(host = %cfg.host, port = cfg.port, recover_binlog = cfg.recover_binlog, "Flashback replayed");
    Ok(())
}

/// Run the whole job. Returns the decoded statement file.
pub async fn run(cfg: FlashbackConfig) -> Result<PathBuf> {
    std::fs::create_dir_all(&cfg.work_dir)?;
    let pool = cfg.conn_param().connect().await?;
    let mut job = Flashback::new(cfg);
    let checked = job.precheck(&pool).await;
    pool.close().await;
    checked?;
    let output = job.start().await?;
    job.import().await?;
    Ok(output)
}
