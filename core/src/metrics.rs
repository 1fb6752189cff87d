//! Metrics counters (SPEC_FULL.md §5, supplemented — the source only
//! diagnoses pipeline health via `debug/message_flow.ts`; this build gives
//! every worker a durable increment-only counter file instead).
//!
//! Grounded on `store.rs`'s atomic-rewrite technique: the counter file is
//! small enough to read-modify-write wholesale on every increment, same
//! as a queue file, just with a different schema.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::CoreError;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsFile {
    pub counters: HashMap<String, u64>,
}

/// One `metrics/<name>.jsonc` file's increment-only counters.
pub struct MetricsSink {
    path: PathBuf,
}

impl MetricsSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        MetricsSink { path: path.into() }
    }

    pub fn increment(&self, counter: &str, by: u64) -> Result<u64> {
        let mut file = self.read()?;
        let entry = file.counters.entry(counter.to_string()).or_insert(0);
        *entry += by;
        let value = *entry;
        self.write(&file)?;
        Ok(value)
    }

    pub fn read(&self) -> Result<MetricsFile> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MetricsFile::default()),
            Err(e) => Err(io_err(&self.path, e)),
        }
    }

    fn write(&self, file: &MetricsFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(file)?;
        let tmp = sibling_temp_path(&self.path);
        std::fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "metric".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

fn io_err(path: &Path, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increment_persists_and_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::new(dir.path().join("renderer_timeouts.jsonc"));
        assert_eq!(sink.increment("timeout", 1).unwrap(), 1);
        assert_eq!(sink.increment("timeout", 1).unwrap(), 2);
        let file = sink.read().unwrap();
        assert_eq!(file.counters["timeout"], 2);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::new(dir.path().join("missing.jsonc"));
        assert!(sink.read().unwrap().counters.is_empty());
    }
}
