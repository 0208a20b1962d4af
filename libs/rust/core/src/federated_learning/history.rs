//! Durable, append-only log of round outcomes.
//!
//! The whole log is one JSON array rewritten on every append. Field names
//! (`round`, `accuracy`, `clients`, `client`) are what the dashboard reads.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::storage::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetric {
    #[serde(rename = "client")]
    pub client_id: String,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    #[serde(rename = "round")]
    pub round_number: u64,
    #[serde(rename = "accuracy")]
    pub global_accuracy: Option<f64>,
    #[serde(rename = "clients")]
    pub client_metrics: Vec<ClientMetric>,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("history at {path} is corrupt: {source}")]
    Corrupt { path: PathBuf, #[source] source: serde_json::Error },
    #[error("history serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    pub fn path(&self) -> &Path { &self.path }

    /// Every recorded round in append order. A store that was never written is empty.
    pub fn read_all(&self) -> Result<Vec<RoundSummary>, HistoryError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(HistoryError::Io { path: self.path.clone(), source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| HistoryError::Corrupt { path: self.path.clone(), source })
    }

    /// Appends one summary and returns the new length. An unreadable store is
    /// reported rather than replaced, so earlier rounds are never dropped.
    pub fn append(&self, summary: RoundSummary) -> Result<usize, HistoryError> {
        let mut hist = self.read_all()?;
        hist.push(summary);
        let bytes = serde_json::to_vec_pretty(&hist)?;
        write_atomic(&self.path, &bytes).map_err(|source| HistoryError::Io { path: self.path.clone(), source })?;
        Ok(hist.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(round: u64, acc: Option<f64>) -> RoundSummary {
        RoundSummary { round_number: round, global_accuracy: acc, client_metrics: vec![ClientMetric { client_id: "h1".into(), accuracy: acc }] }
    }

    #[test]
    fn missing_store_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("metrics_history.json"));
        assert!(store.read_all().unwrap().is_empty());
    }

    #[test]
    fn appends_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("metrics_history.json"));
        let entries: Vec<_> = (1..=5).map(|r| summary(r, Some(0.1 * r as f64))).collect();
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(store.append(e.clone()).unwrap(), i + 1);
        }
        assert_eq!(store.read_all().unwrap(), entries);
    }

    #[test]
    fn corrupt_store_is_reported_and_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics_history.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = HistoryStore::new(&path);
        assert!(matches!(store.read_all(), Err(HistoryError::Corrupt { .. })));
        assert!(matches!(store.append(summary(1, None)), Err(HistoryError::Corrupt { .. })));
        assert_eq!(std::fs::read(&path).unwrap(), b"{not json");
    }

    #[test]
    fn serialized_field_names() {
        let v = serde_json::to_value(summary(2, None)).unwrap();
        assert_eq!(v, serde_json::json!({"round": 2, "accuracy": null, "clients": [{"client": "h1", "accuracy": null}]}));
    }
}
