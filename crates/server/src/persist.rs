//! Background persistence of durable world data.
//!
//! Snapshots are serialized by the caller and handed to a single writer
//! task, so disk I/O never runs under a world lock and writes to one file
//! land in the order they were queued. Each write goes to a temporary file
//! that is then renamed over the target. A failed write is remembered per
//! path until the caller queues that path again.

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

enum Job {
    Write { path: PathBuf, bytes: Vec<u8> },
    Barrier(oneshot::Sender<()>),
}

/// Handle to the writer task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Persister {
    tx: Option<mpsc::UnboundedSender<Job>>,
    /// Paths whose latest write failed.
    failed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Persister {
    /// A persister that drops every write.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            failed: Arc::default(),
        }
    }

    /// Start the writer task on the current runtime.
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let failed: Arc<Mutex<HashSet<PathBuf>>> = Arc::default();
        let failures = Arc::clone(&failed);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Write { path, bytes } => match write_atomically(&path, &bytes).await {
                        Ok(()) => {
                            debug!("Saved {} ({} bytes)", path.display(), bytes.len());
                            lock(&failures).remove(&path);
                        }
                        Err(e) => {
                            error!("Failed to save {}: {:#}", path.display(), e);
                            lock(&failures).insert(path);
                        }
                    },
                    Job::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self {
            tx: Some(tx),
            failed,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Serialize `value` now and queue it for writing to `path`.
    pub fn save<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(value)?;
        tx.send(Job::Write {
            path: path.to_path_buf(),
            bytes,
        })
        .map_err(|_| anyhow::anyhow!("persistence writer has stopped"))
    }

    /// Whether the latest finished write to `path` failed. Clears the mark,
    /// so the caller is expected to queue the path again.
    pub fn take_failed(&self, path: &Path) -> bool {
        lock(&self.failed).remove(path)
    }

    /// Wait until every write queued before this call has finished.
    pub async fn flushed(&self) {
        let Some(tx) = &self.tx else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(Job::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn lock(failed: &Mutex<HashSet<PathBuf>>) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
    failed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a JSON file written by [`Persister::save`]. A missing file is `None`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}
