use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::ProtocolError;
use crate::store::types::Vfo;

use super::StationAdapter;

/// Adapter for programs that poll a drop file instead of exposing a socket.
///
/// There is no acknowledgement channel: success is the appended line being
/// flush-durable on disk. Each command becomes one timestamped line, e.g.
///
/// ```text
/// 2026-08-29T19:00:00Z QSY 14070000
/// 2026-08-29T19:00:00Z MODE USB
/// 2026-08-29T19:00:01Z MSG net starting on 20m
/// ```
pub struct FileWatchAdapter {
    path: PathBuf,
}

impl FileWatchAdapter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn stamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    async fn append_line(&self, line: &str) -> Result<(), ProtocolError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| classify_io("open", &e))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| classify_io("write", &e))?;
        file.flush().await.map_err(|e| classify_io("flush", &e))?;
        // The watcher may pick the file up at any moment; make the write
        // durable before reporting success.
        file.sync_all().await.map_err(|e| classify_io("sync", &e))?;
        debug!("Appended to {}: {}", self.path.display(), line);
        Ok(())
    }
}

fn classify_io(context: &str, err: &std::io::Error) -> ProtocolError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            ProtocolError::Permanent(format!("{} {}", context, err))
        }
        _ => ProtocolError::Transient(format!("{} {}", context, err)),
    }
}

#[async_trait]
impl StationAdapter for FileWatchAdapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    async fn set_frequency(&mut self, hz: u64, _vfo: Option<Vfo>) -> Result<(), ProtocolError> {
        self.append_line(&format!("{} QSY {}", Self::stamp(), hz))
            .await
    }

    async fn set_mode(&mut self, mode: &str) -> Result<(), ProtocolError> {
        self.append_line(&format!("{} MODE {}", Self::stamp(), mode))
            .await
    }

    async fn send_text(&mut self, text: &str) -> Result<(), ProtocolError> {
        // Collapse newlines: the watcher treats each line as one command.
        let flat = text.replace(['\r', '\n'], " ");
        self.append_line(&format!("{} MSG {}", Self::stamp(), flat))
            .await
    }

    async fn health_check(&mut self) -> Result<(), ProtocolError> {
        let dir = self.path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let meta = tokio::fs::metadata(dir)
            .await
            .map_err(|e| classify_io("probe", &e))?;
        if !meta.is_dir() {
            return Err(ProtocolError::Permanent(format!(
                "watch parent {} is not a directory",
                dir.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(ProtocolError::Permanent(format!(
                "watch directory {} is read-only",
                dir.display()
            )));
        }
        Ok(())
    }

    async fn close(&mut self) {
        // Nothing held open between commands.
    }
}
