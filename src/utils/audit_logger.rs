use crate::config::Config;
use crate::terminal::ExecuteParams;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_FIELD_BYTES: usize = 1024;

/// Appends one line per `/execute` call to a size-rotated log file.
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    pub fn new(config: &Config) -> Self {
        // Ensure log directory exists
        if let Some(parent_dir) = config.audit_log_file.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Self {
            log_file_path: config.audit_log_file.clone(),
            max_size_bytes: config.audit_log_max_size_bytes,
        }
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let extension = self
                .log_file_path
                .extension()
                .unwrap_or_default()
                .to_string_lossy();

            let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
            let backup_path = self.log_file_path.with_file_name(backup_file_name);

            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    /// Records an execute request and its outcome. Failures are logged, never returned.
    pub async fn log_execute(&self, params: &ExecuteParams, outcome: &str) {
        if let Err(e) = self.try_log_execute(params, outcome).await {
            error!(outcome = %outcome, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_execute(&self, params: &ExecuteParams, outcome: &str) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let timestamp = Utc::now().to_rfc3339();

        let mut request = serde_json::to_value(params)?;
        if let Some(obj) = request.as_object_mut() {
            for field in ["command", "input"] {
                if let Some(Value::String(text)) = obj.get_mut(field) {
                    if text.len() > MAX_LOGGED_FIELD_BYTES {
                        *text = format!("<{} truncated for log: {} bytes>", field, text.len());
                    }
                }
            }
        }

        let cwd = params.cwd.as_deref().unwrap_or("-");
        let log_entry = format!(
            "{} | {:<11} | {} | {}\n",
            timestamp,
            outcome,
            cwd,
            serde_json::to_string(&request)?
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;

        file.write_all(log_entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
