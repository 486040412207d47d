//! Artifact store upload client.
//!
//! Each file is streamed to the store and the returned task id is recorded
//! in the manifest so the file can be fetched back later.

use crate::config::BackupClientConfig;
use crate::utils::errors::{BackupError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// Task id recorded for files that were not uploaded.
pub const NOT_UPLOADED: &str = "-1";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    task_id: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct UploadClient {
    http: reqwest::Client,
    url: String,
    token: String,
    concurrency: usize,
}

impl UploadClient {
    /// `None` when uploads are disabled.
    pub fn from_config(cfg: &BackupClientConfig) -> Option<Self> {
        if !cfg.enable {
            return None;
        }
        Some(Self {
            http: reqwest::Client::new(),
            url: cfg.url.trim_end_matches('/').to_string(),
            token: cfg.token.clone(),
            concurrency: cfg.concurrency.max(1),
        })
    }

    /// Upload one file and return the store's task id.
    pub async fn upload(&self, path: &Path, backup_id: &str) -> Result<String> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let resp = self
            .http
            .post(format!("{}/upload", self.url))
            .bearer_auth(&self.token)
            .header("x-backup-id", backup_id)
            .header("x-file-name", &name)
            .header("x-total-size", size.to_string())
            .body(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BackupError::ExternalTool {
                tool: "backup_client".to_string(),
                status: status.to_string(),
                output: text,
            });
        }

        let parsed: UploadResponse = resp.json().await?;
        let task_id = match parsed.task_id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        info!(file = %name, size, task_id = %task_id, "Uploaded");
        Ok(task_id)
    }

    /// Upload files with at most `concurrency` transfers in flight.
    /// Results come back in input order.
    pub async fn upload_all(&self, paths: Vec<PathBuf>, backup_id: &str) -> Vec<Result<String>> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(paths.len());

        for path in paths {
            let sem = Arc::clone(&semaphore);
            let client = self.clone();
            let backup_id = backup_id.to_string();
            handles.push(tokio::spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|e| BackupError::Process(format!("upload semaphore closed: {}", e)))?;
                client.upload(&path, &backup_id).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Upload task panicked: {}", e);
                    Err(BackupError::Process(e.to_string()))
                }
            });
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_client() {
        let cfg = BackupClientConfig::default();
        assert!(UploadClient::from_config(&cfg).is_none());
    }

    #[test]
    fn test_enabled_client_trims_url() {
        let cfg = BackupClientConfig {
            enable: true,
            url: "http://store.local:8080/".to_string(),
            token: "t".to_string(),
            concurrency: 0,
        };
        let client = UploadClient::from_config(&cfg).unwrap();
        assert_eq!(client.url, "http://store.local:8080");
        assert_eq!(client.concurrency, 1);
    }

    #[test]
    fn test_response_task_id_forms() {
        let r: UploadResponse = serde_json::from_str(r#"{"task_id": 42}"#).unwrap();
        assert_eq!(r.task_id.to_string(), "42");
        let r: UploadResponse = serde_json::from_str(r#"{"task_id": "abc"}"#).unwrap();
        assert_eq!(r.task_id, serde_json::Value::String("abc".into()));
    }
}
