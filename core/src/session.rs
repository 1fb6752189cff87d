//! C3 — Session fence.
//!
//! Grounded on `core/src/rollout.rs`'s pattern of a background `tokio`
//! task owning shared state and publishing updates through a channel,
//! and on its `Uuid::new_v4()` session-id generation. Here the published
//! value is read far more often than it changes, so a `tokio::sync::watch`
//! channel stands in for the rollout writer's `mpsc` — readers get the
//! latest value without awaiting the background task.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use loom_protocol::SessionFile;
use tokio::sync::watch;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

fn generate_session_id() -> String {
    use rand::Rng;
    let epoch_ms = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let mut rng = rand::rng();
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("session_{epoch_ms}_{suffix}")
}

/// Process-wide singleton: the current session id, hot-swappable if the
/// `.session_id` file changes underneath the process.
#[derive(Clone)]
pub struct SessionFence {
    rx: watch::Receiver<String>,
}

impl SessionFence {
    /// Read `.session_id` at `path`; generate and persist a new one if
    /// missing. Spawns a background task that re-reads the file every 5s
    /// and hot-swaps the published value on change.
    pub async fn start(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path: PathBuf = path.into();
        let initial = load_or_create(&path).await?;
        let (tx, rx) = watch::channel(initial);

        let poll_path = path.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            loop {
                interval.tick().await;
                if let Ok(Some(id)) = read_session_id(&poll_path).await
                    && tx.borrow().as_str() != id
                {
                    let _ = tx.send(id);
                }
            }
        });

        Ok(SessionFence { rx })
    }

    /// Current session id as observed by the most recent poll.
    pub fn session_id(&self) -> String {
        self.rx.borrow().clone()
    }

    /// Envelopes without `meta.session_id` are legacy and rejected.
    pub fn is_current_session(&self, envelope: &loom_protocol::Envelope) -> bool {
        crate::envelope::is_current_session(envelope, &self.session_id())
    }
}

/// Shared-ownership convenience for processes that pass the fence to
/// several worker loops.
pub type SharedSessionFence = Arc<SessionFence>;

async fn load_or_create(path: &Path) -> std::io::Result<String> {
    if let Some(id) = read_session_id(path).await? {
        return Ok(id);
    }
    let id = generate_session_id();
    write_session_file(path, &id).await?;
    Ok(id)
}

async fn read_session_id(path: &Path) -> std::io::Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let file: SessionFile = serde_json::from_slice(&bytes).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e)
            })?;
            Ok(Some(file.session_id))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

async fn write_session_file(path: &Path, session_id: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let now = time::OffsetDateTime::now_utc();
    let boot_time = now
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let file = SessionFile {
        session_id: session_id.to_string(),
        boot_time,
        boot_timestamp: now.unix_timestamp(),
        version: 1,
    };
    let bytes = serde_json::to_vec_pretty(&file)?;
    tokio::fs::write(path, bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_session_file_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".session_id");
        let fence = SessionFence::start(&path).await.unwrap();
        assert!(fence.session_id().starts_with("session_"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn reuses_existing_session_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".session_id");
        write_session_file(&path, "session_fixed_abcdef").await.unwrap();
        let fence = SessionFence::start(&path).await.unwrap();
        assert_eq!(fence.session_id(), "session_fixed_abcdef");
    }
}
