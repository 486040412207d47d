//! Safety checks run before any binlog is touched, and resolution of
//! everything the decoder needs.

use crate::binlog::{self, BinlogFile};
use crate::config::FlashbackConfig;
use crate::error::{Result, RollbackError};
use crate::filter;
use dbbackup::utils::mysqlconn::{global_variable, server_version, slave_status, version_number};
use chrono::{DateTime, Local};
use sqlx::MySqlPool;
use std::path::{Path, PathBuf};
use tracing::info;

/// `binlog_row_image` exists from 5.6 on; older servers always log full rows.
const ROW_IMAGE_SINCE: u32 = 5_006_000;

#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    pub version: String,
    pub binlog_format: String,
    pub row_image: Option<String>,
    pub log_bin_basename: Option<String>,
    pub is_replica: bool,
}

/// Everything the decode step needs, resolved against the live instance.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub binlogs: Vec<PathBuf>,
    pub rows_filter: Option<String>,
    pub start: DateTime<Local>,
    pub stop: DateTime<Local>,
}

pub fn check_variables(version: &str, binlog_format: &str, row_image: Option<&str>) -> Result<()> {
    if !binlog_format.eq_ignore_ascii_case("ROW") {
        return Err(RollbackError::precheck(format!(
            "binlog_format is {}, flashback needs ROW",
            binlog_format
        )));
    }
    if version_number(version) >= ROW_IMAGE_SINCE {
        match row_image {
            Some(image) if image.eq_ignore_ascii_case("FULL") => {}
            other => {
                return Err(RollbackError::precheck(format!(
                    "binlog_row_image is {}, flashback needs FULL",
                    other.unwrap_or("unset")
                )))
            }
        }
    }
    Ok(())
}

pub fn check_instance(info: &InstanceInfo) -> Result<()> {
    if info.is_replica {
        return Err(RollbackError::precheck(
            "instance is a replica; flashback must run on the writable node",
        ));
    }
    check_variables(&info.version, &info.binlog_format, info.row_image.as_deref())
}

pub async fn inspect(pool: &MySqlPool) -> Result<InstanceInfo> {
    let version = server_version(pool).await?;
    Ok(InstanceInfo {
        binlog_format: global_variable(pool, "binlog_format").await?.unwrap_or_default(),
        row_image: global_variable(pool, "binlog_row_image").await?,
        log_bin_basename: global_variable(pool, "log_bin_basename").await?,
        is_replica: slave_status(pool).await?.is_some(),
        version,
    })
}

/// Directory and basename of the binlogs. `binlog_dir` overrides the
/// directory; the basename always comes from `@@log_bin_basename`.
pub fn binlog_source(cfg: &FlashbackConfig, log_bin_basename: Option<&str>) -> Result<(PathBuf, String)> {
    let base = log_bin_basename
        .filter(|b| !b.trim().is_empty())
        .map(Path::new)
        .ok_or_else(|| RollbackError::precheck("log_bin_basename is empty; is binary logging enabled?"))?;
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| RollbackError::precheck(format!("bad log_bin_basename {}", base.display())))?;
    let dir = match &cfg.binlog_dir {
        Some(dir) => dir.clone(),
        None => base.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    Ok((dir, name))
}

/// Candidate binlogs: the explicit list if one is configured, otherwise
/// the files overlapping the time window.
pub fn candidate_binlogs(
    cfg: &FlashbackConfig,
    dir: &Path,
    basename: &str,
    start: DateTime<Local>,
    stop: DateTime<Local>,
) -> Result<Vec<BinlogFile>> {
    let explicit = cfg.binlog_file_list();
    if !explicit.is_empty() {
        return binlog::explicit_binlogs(dir, &explicit);
    }
    let files = binlog::list_binlogs(dir, basename)?;
    binlog::select_window(&files, start, stop)
}

pub async fn run_precheck(cfg: &FlashbackConfig, pool: &MySqlPool) -> Result<Prepared> {
    let (start, stop) = cfg.window(Local::now())?;
    let info = inspect(pool).await?;
    check_instance(&info)?;

    let rows_filter = filter::resolve_row_filter(cfg, pool).await?;

    let (dir, basename) = if cfg.binlog_file_list().is_empty() {
        binlog_source(cfg, info.log_bin_basename.as_deref())?
    } else {
        // explicit names only need the directory, which validate() requires
        (cfg.binlog_dir.clone().unwrap_or_default(), String::new())
    };
    let files = candidate_binlogs(cfg, &dir, &basename, start, stop)?;
    info!(
        version = %info.version,
        binlogs = files.len(),
        first = %files.first().map(|f| f.name.as_str()).unwrap_or(""),
        filter = rows_filter.as_deref().unwrap_or(""),
        "Precheck passed"
    );
    let binlogs = binlog::snapshot(&files, &cfg.binlog_work_dir())?;
    Ok(Prepared {
        binlogs,
        rows_filter,
        start,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::tests::write_binlog;
    use crate::config::tests::sample_config;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_check_variables() {
        assert!(check_variables("5.7.20-log", "ROW", Some("FULL")).is_ok());
        assert!(check_variables("5.5.24", "ROW", None).is_ok());
        assert!(check_variables("8.0.30", "row", Some("full")).is_ok());

        for (version, format, image) in [
            ("5.7.20", "STATEMENT", Some("FULL")),
            ("5.7.20", "MIXED", Some("FULL")),
            ("5.7.20", "ROW", Some("MINIMAL")),
            ("8.0.30", "ROW", None),
        ] {
            let err = check_variables(version, format, image).unwrap_err();
            assert!(matches!(err, RollbackError::Precheck(_)), "{} {}", version, format);
        }
    }

    #[test]
    fn test_replica_rejected() {
        let info = InstanceInfo {
            version: "5.7.20".to_string(),
            binlog_format: "ROW".to_string(),
            row_image: Some("FULL".to_string()),
            log_bin_basename: Some("/data/mysql/binlog/binlog".to_string()),
            is_replica: true,
        };
        assert!(check_instance(&info).is_err());
        assert!(check_instance(&InstanceInfo { is_replica: false, ..info }).is_ok());
    }

    #[test]
    fn test_binlog_source() {
        let mut cfg = sample_config(Path::new("/tmp/fb"));
        let (dir, name) = binlog_source(&cfg, Some("/data/mysql/binlog/binlog20000")).unwrap();
        assert_eq!(dir, PathBuf::from("/data/mysql/binlog"));
        assert_eq!(name, "binlog20000");

        cfg.binlog_dir = Some(PathBuf::from("/backup/binlog"));
        let (dir, _) = binlog_source(&cfg, Some("/data/mysql/binlog/binlog20000")).unwrap();
        assert_eq!(dir, PathBuf::from("/backup/binlog"));

        assert!(binlog_source(&cfg, None).is_err());
    }

    #[test]
    fn test_candidates_scan_and_explicit() {
        let dir = TempDir::new().unwrap();
        let at = |h| Local.with_ymd_and_hms(2024, 3, 1, h, 0, 0).unwrap();
        write_binlog(dir.path(), "binlog.000001", at(9));
        write_binlog(dir.path(), "binlog.000002", at(10));
        write_binlog(dir.path(), "binlog.000003", at(12));

        let mut cfg = sample_config(dir.path());
        let (start, stop) = cfg.window(Local::now()).unwrap();
        let scanned = candidate_binlogs(&cfg, dir.path(), "binlog", start, stop).unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].name, "binlog.000002");

        let early = Local.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert!(matches!(
            candidate_binlogs(&cfg, dir.path(), "binlog", early, stop),
            Err(RollbackError::NoCandidateBinlogs { .. })
        ));

        cfg.binlog_dir = Some(dir.path().to_path_buf());
        cfg.binlog_files = "binlog.000003".to_string();
        let explicit = candidate_binlogs(&cfg, dir.path(), "", start, stop).unwrap();
        assert_eq!(explicit[0].name, "binlog.000003");
    }
}
