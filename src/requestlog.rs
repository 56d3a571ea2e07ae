//! Bounded single-consumer request-log sink.
//!
//! One background task drains a capacity-32 channel for the process
//! lifetime; producers (download handlers) send and move on, applying
//! back-pressure rather than dropping entries when the queue is full.

use tokio::sync::mpsc;

use crate::config::RequestLogStorage;
use crate::db::ContentStore;
use crate::hashing::ObjectHash;

const QUEUE_CAPACITY: usize = 32;

/// One completed download, queued for logging.
pub struct RequestLogEntry {
    pub time: String,
    pub flags: i64,
    pub protocol: i64,
    pub bytes_sent: i64,
    pub version_id: i64,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct RequestLogSink {
    sender: Option<mpsc::Sender<RequestLogEntry>>,
}

impl RequestLogSink {
    /// Starts the sink's consumer task (if `storage` isn't `None`) and
    /// returns a handle producers can send through.
    #[must_use]
    pub fn spawn(storage: RequestLogStorage, content: std::sync::Arc<ContentStore>) -> Self {
        if storage == RequestLogStorage::None {
            return Self { sender: None };
        }

        let (tx, mut rx) = mpsc::channel::<RequestLogEntry>(QUEUE_CAPACITY);
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                match storage {
                    RequestLogStorage::Console => log_console(&entry),
                    RequestLogStorage::Database => {
                        if let Err(err) = log_database(&content, &entry) {
                            tracing::warn!(error = %err, "failed to persist request log entry");
                        }
                    }
                    RequestLogStorage::None => unreachable!(),
                }
            }
        });

        Self { sender: Some(tx) }
    }

    /// Queues `entry`. Awaits if the channel is full; a no-op sink (disabled)
    /// drops the entry immediately.
    pub async fn log(&self, entry: RequestLogEntry) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(entry).await;
        }
    }
}

fn log_console(entry: &RequestLogEntry) {
    let hash = ObjectHash::hash(&entry.body);
    tracing::info!(
        time = %entry.time,
        flags = entry.flags,
        protocol = entry.protocol,
        version_id = entry.version_id,
        bytes_sent = entry.bytes_sent,
        body_len = entry.body.len(),
        body_hash = %hash,
        "download request"
    );
}

fn log_database(content: &ContentStore, entry: &RequestLogEntry) -> anyhow::Result<()> {
    let hash = ObjectHash::hash(&entry.body);
    let blob_id = content.insert_request_log_blob(&hash, &entry.body)?;
    content.insert_request_log(
        &entry.time,
        entry.flags,
        entry.protocol,
        entry.bytes_sent,
        entry.version_id,
        Some(blob_id),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn disabled_sink_accepts_without_blocking() {
        let sink = RequestLogSink::spawn(RequestLogStorage::None, std::sync::Arc::new(ContentStore::open(Path::new(":memory:"), 1).unwrap()));
        sink.log(RequestLogEntry {
            time: "2026-01-01T00:00:00Z".into(),
            flags: 0,
            protocol: 1,
            bytes_sent: 4,
            version_id: 1,
            body: vec![0, 1, 0, 0],
        })
        .await;
    }

    #[tokio::test]
    async fn database_sink_persists_entry() {
        let content = std::sync::Arc::new(ContentStore::open(Path::new(":memory:"), 1).unwrap());
        let version_id = content.begin_content_version("wow", "1.0.0", "2026-01-01T00:00:00Z").unwrap();

        let sink = RequestLogSink::spawn(RequestLogStorage::Database, content.clone());
        sink.log(RequestLogEntry {
            time: "2026-01-01T00:00:00Z".into(),
            flags: 0,
            protocol: 1,
            bytes_sent: 4,
            version_id,
            body: vec![1, 0, 0, 0],
        })
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
