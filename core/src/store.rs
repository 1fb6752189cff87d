//! C2 — Persistent queues (Log, Inbox, Outbox).
//!
//! Grounded on `core/src/rollout.rs`'s append-only JSONL writer: that
//! module never mutates a rollout file in place, it only appends. Our
//! queues *do* need in-place rewrites (dedup, prune, status transitions),
//! so the atomicity technique generalizes to "write a sibling temp file,
//! then rename" rather than "open in append mode" — the rename is what
//! makes a torn read impossible, matching spec.md §4.2's requirement.

use std::path::Path;
use std::path::PathBuf;

use loom_protocol::Envelope;
use loom_protocol::QueueFile;
use loom_protocol::Status;

use crate::error::CoreError;
use crate::error::Result;

/// Retention/prune policy for one queue kind. The Log, Inbox, and Outbox
/// each get their own cap; noise-prune mode widens the Log's cap to 4000
/// (spec.md §4.2).
#[derive(Debug, Clone, Copy)]
pub struct CapPolicy {
    pub max: usize,
}

/// A single JSON-file-backed queue (`log.jsonc`, `inbox.jsonc`,
/// `outbox.jsonc`). Newest-first in memory; every mutating call
/// read-modify-writes the whole file atomically.
pub struct Store {
    path: PathBuf,
    cap: CapPolicy,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>, cap: CapPolicy) -> Self {
        Store {
            path: path.into(),
            cap,
        }
    }

    pub fn ensure_exists(&self) -> Result<()> {
        if !self.path.exists() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(&self.path, e))?;
            }
            self.write(&QueueFile::new())?;
        }
        Ok(())
    }

    pub fn read(&self) -> Result<QueueFile> {
        self.ensure_exists()?;
        let bytes = std::fs::read(&self.path).map_err(|e| io_err(&self.path, e))?;
        let file: QueueFile = serde_json::from_slice(&bytes)?;
        if file.schema_version != loom_protocol::SCHEMA_VERSION {
            return Err(CoreError::MalformedQueueFile {
                path: self.path.display().to_string(),
                reason: format!("unsupported schema_version {}", file.schema_version),
            });
        }
        Ok(file)
    }

    pub fn write(&self, file: &QueueFile) -> Result<()> {
        atomic_rewrite(&self.path, file)
    }

    /// Insert `env` at the head (newest-first) without dedup.
    pub fn append(&self, env: Envelope) -> Result<()> {
        let mut file = self.read()?;
        file.messages.insert(0, env);
        self.prune_and_write(file)
    }

    /// Insert `env`, keeping only the higher-[`Status::dedup_priority`]
    /// copy when an entry with the same id already exists. Meta is merged
    /// by shallow overwrite: the kept envelope's fields win, but any
    /// fields from the other copy are not lost if the kept envelope
    /// leaves them unset — see [`merge_meta`].
    pub fn append_deduped(&self, env: Envelope) -> Result<()> {
        let mut file = self.read()?;
        if let Some(pos) = file.messages.iter().position(|e| e.id == env.id) {
            let existing = file.messages.remove(pos);
            let merged = dedup_merge(existing, env);
            file.messages.insert(0, merged);
        } else {
            file.messages.insert(0, env);
        }
        self.prune_and_write(file)
    }

    /// Replace the envelope with the same id as `env` (used after a claim
    /// transitions its status). No-op if the id is absent.
    pub fn update(&self, env: Envelope) -> Result<()> {
        let mut file = self.read()?;
        if let Some(pos) = file.messages.iter().position(|e| e.id == env.id) {
            file.messages[pos] = env;
        } else {
            file.messages.insert(0, env);
        }
        self.write(&file)
    }

    /// Collapse any remaining same-id duplicates (defensive; normal
    /// traffic never creates them because every insert path dedups).
    pub fn remove_duplicates(&self) -> Result<()> {
        let file = self.read()?;
        let mut seen = std::collections::HashSet::new();
        let mut deduped = Vec::with_capacity(file.messages.len());
        let mut by_id: std::collections::HashMap<String, Envelope> = std::collections::HashMap::new();
        for env in file.messages {
            match by_id.remove(&env.id) {
                Some(existing) => {
                    by_id.insert(env.id.clone(), dedup_merge(existing, env));
                }
                None => {
                    by_id.insert(env.id.clone(), env);
                }
            }
        }
        for (id, env) in by_id {
            if seen.insert(id) {
                deduped.push(env);
            }
        }
        deduped.sort_by(|a, b| b.id.cmp(&a.id));
        self.write(&QueueFile {
            schema_version: loom_protocol::SCHEMA_VERSION,
            messages: deduped,
        })
    }

    /// Drop entries past `self.cap.max`, preferring to delete `done`
    /// entries from the tail first; never deletes non-`done` entries
    /// (spec.md §4.2).
    pub fn prune(&self, max: usize) -> Result<()> {
        let mut file = self.read()?;
        prune_messages(&mut file.messages, max);
        self.write(&file)
    }

    fn prune_and_write(&self, mut file: QueueFile) -> Result<()> {
        prune_messages(&mut file.messages, self.cap.max);
        self.write(&file)
    }

    /// Most recent `n` entries (newest-first), for session replay /
    /// debugging a stuck pipeline (supplemented feature, SPEC_FULL.md §5).
    pub fn tail(&self, n: usize) -> Result<Vec<Envelope>> {
        let file = self.read()?;
        Ok(file.messages.into_iter().take(n).collect())
    }

    /// Filters out envelopes whose `type` matches `noise_type` — used by
    /// long-retention views (spec.md §4.2 "noise filter").
    pub fn read_filtered(&self, noise_type: Option<&str>) -> Result<Vec<Envelope>> {
        let file = self.read()?;
        Ok(match noise_type {
            None => file.messages,
            Some(nt) => file
                .messages
                .into_iter()
                .filter(|e| e.kind.as_deref() != Some(nt))
                .collect(),
        })
    }

    /// Recovery sweep (SPEC_FULL.md §5, resolving spec.md §9's open
    /// question): promote `processing` entries older than
    /// `older_than_secs` back to `sent` so a crashed worker's claim does
    /// not permanently stall the pipeline.
    pub fn recover_stale_processing(&self, older_than_secs: u64) -> Result<usize> {
        let mut file = self.read()?;
        let now = crate::envelope::iso8601_now();
        let mut recovered = 0;
        for env in file.messages.iter_mut() {
            if env.status == Status::Processing && age_secs(&env.created_at, &now) > older_than_secs {
                env.status = Status::Sent;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.write(&file)?;
        }
        Ok(recovered)
    }
}

/// Merge rule for [`Store::append_deduped`]: keep whichever envelope has
/// the higher dedup priority wholesale (its meta wins), but backfill any
/// `ext` keys the loser set and the winner left unset. This matches
/// spec.md §4.2 ("keeps the higher-priority status and merges meta by
/// shallow overwrite") and SPEC_FULL.md §6 Q2 (equal status => incoming
/// wins, i.e. last-writer-wins within a tick).
fn dedup_merge(existing: Envelope, incoming: Envelope) -> Envelope {
    let existing_prio = existing.status.dedup_priority();
    let incoming_prio = incoming.status.dedup_priority();

    let (mut winner, loser) = if incoming_prio >= existing_prio {
        (incoming, existing)
    } else {
        (existing, incoming)
    };

    for (k, v) in loser.meta.ext {
        winner.meta.ext.entry(k).or_insert(v);
    }
    winner
}

fn prune_messages(messages: &mut Vec<Envelope>, max: usize) {
    if messages.len() <= max {
        return;
    }
    // Newest-first: candidates for removal are scanned from the tail
    // (oldest) forward, removing `done` entries until under cap.
    let mut i = messages.len();
    while messages.len() > max && i > 0 {
        i -= 1;
        if messages[i].status == Status::Done {
            messages.remove(i);
        }
    }
}

fn age_secs(created_at: &str, now_rfc3339: &str) -> u64 {
    use time::OffsetDateTime;
    use time::format_description::well_known::Rfc3339;
    let parse = |s: &str| OffsetDateTime::parse(s, &Rfc3339).ok();
    match (parse(created_at), parse(now_rfc3339)) {
        (Some(created), Some(now)) => (now - created).whole_seconds().max(0) as u64,
        _ => 0,
    }
}

fn atomic_rewrite(path: &Path, file: &QueueFile) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(file)?;
    let tmp_path = sibling_temp_path(path);
    std::fs::write(&tmp_path, &bytes).map_err(|e| io_err(&tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "queue".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

fn io_err(path: &Path, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Default cap policies (spec.md §4.2).
pub fn log_cap(noise_prune: bool) -> CapPolicy {
    CapPolicy {
        max: if noise_prune { 4000 } else { 100 },
    }
}

pub fn outbox_cap() -> CapPolicy {
    CapPolicy { max: 10 }
}

pub fn inbox_cap() -> CapPolicy {
    CapPolicy { max: 100 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_protocol::Meta;
    use loom_protocol::Priority;
    use loom_protocol::Stage;

    fn env(id: &str, status: Status) -> Envelope {
        Envelope {
            id: id.to_string(),
            sender: "user".to_string(),
            content: "hi".to_string(),
            kind: None,
            stage: Stage("queued_1".to_string()),
            slot: None,
            correlation_id: "c1".to_string(),
            reply_to: None,
            priority: Priority(0),
            status,
            flags: vec![],
            meta: Meta::default(),
            conversation_id: None,
            turn_number: None,
            displayed: false,
            role: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn append_and_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("log.jsonc"), log_cap(false));
        store.append(env("id-1", Status::Queued)).unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.messages.len(), 1);
        assert_eq!(file.messages[0].id, "id-1");
    }

    #[test]
    fn append_deduped_keeps_higher_priority_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("outbox.jsonc"), outbox_cap());
        store.append(env("id-1", Status::Sent)).unwrap();
        store.append_deduped(env("id-1", Status::Queued)).unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.messages.len(), 1);
        assert_eq!(file.messages[0].status, Status::Sent);
    }

    #[test]
    fn append_deduped_with_equal_status_is_last_writer_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("outbox.jsonc"), outbox_cap());
        let mut first = env("id-1", Status::Sent);
        first.content = "first".to_string();
        store.append(first).unwrap();
        let mut second = env("id-1", Status::Sent);
        second.content = "second".to_string();
        store.append_deduped(second).unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.messages[0].content, "second");
    }

    #[test]
    fn prune_removes_done_entries_from_tail_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("outbox.jsonc"), CapPolicy { max: 2 });
        store.append(env("id-1", Status::Done)).unwrap();
        store.append(env("id-2", Status::Sent)).unwrap();
        store.append(env("id-3", Status::Done)).unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.messages.len(), 2);
        assert!(file.messages.iter().any(|e| e.id == "id-2"));
    }

    #[test]
    fn prune_never_deletes_non_done_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("outbox.jsonc"), CapPolicy { max: 1 });
        store.append(env("id-1", Status::Sent)).unwrap();
        store.append(env("id-2", Status::Processing)).unwrap();
        let file = store.read().unwrap();
        assert_eq!(file.messages.len(), 2);
    }

    #[test]
    fn malformed_schema_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonc");
        std::fs::write(&path, br#"{"schema_version":2,"messages":[]}"#).unwrap();
        let store = Store::new(path, log_cap(false));
        assert!(store.read().is_err());
    }

    #[test]
    fn recover_stale_processing_promotes_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("outbox.jsonc"), outbox_cap());
        let mut stuck = env("id-1", Status::Processing);
        stuck.created_at = "2000-01-01T00:00:00Z".to_string();
        store.append(stuck).unwrap();
        let recovered = store.recover_stale_processing(120).unwrap();
        assert_eq!(recovered, 1);
        let file = store.read().unwrap();
        assert_eq!(file.messages[0].status, Status::Sent);
    }
}
