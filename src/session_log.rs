use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[async_trait]
pub trait SessionLog: Send + Sync {
    async fn record(&self, step: u32, kind: &str, detail: &str);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSessionLog;

#[async_trait]
impl SessionLog for TracingSessionLog {
    async fn record(&self, step: u32, kind: &str, detail: &str) {
        info!(step, kind, "{detail}");
    }
}

pub struct FileSessionLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSessionLog {
    pub async fn open(path: impl AsRef<Path>, model: &str) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(mut f) => {
                let header = format!("session_start={}\nmodel={model}\n---\n", Utc::now().to_rfc3339());
                if let Err(e) = f.write_all(header.as_bytes()).await {
                    warn!(path = %path.display(), "session log header write failed: {e}");
                }
                Some(f)
            }
            Err(e) => {
                warn!(path = %path.display(), "session log unavailable: {e}");
                None
            }
        };
        Self { path, file: Mutex::new(file) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionLog for FileSessionLog {
    async fn record(&self, step: u32, kind: &str, detail: &str) {
        info!(step, kind, "{detail}");
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else { return };
        let line = format!("[{}] step={step} kind={kind} {detail}\n", Utc::now().format("%H:%M:%S%.3f"));
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!(path = %self.path.display(), "session log write failed: {e}");
            return;
        }
        let _ = file.flush().await;
    }
}
