//! Durable session state.
//!
//! A small file-backed document store: the `RecoverySession` record as a
//! JSON document plus an append-only JSONL failure log, readable after a
//! crash to resume partial-result collection.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;

use crate::recovery::{FailureRecord, RecoverySession};

/// File-backed store under the configured state directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (and create) the store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join("session.json")
    }

    fn failures_path(&self) -> PathBuf {
        self.dir.join("failures.jsonl")
    }

    /// Persist the session record, replacing any previous snapshot.
    pub fn save_session(&self, session: &RecoverySession) -> Result<()> {
        let json = serde_json::to_string_pretty(session)
            .context("Failed to serialize session")?;
        std::fs::write(self.session_path(), json)
            .with_context(|| format!("Failed to write {}", self.session_path().display()))?;
        Ok(())
    }

    /// Load the persisted session, if one exists.
    pub fn load_session(&self) -> Result<Option<RecoverySession>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let session = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(session))
    }

    /// Append one failure record to the append-only log.
    pub fn record_failure(&self, record: &FailureRecord) -> Result<()> {
        let json = serde_json::to_string(record).context("Failed to serialize failure record")?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.failures_path())
            .with_context(|| format!("Failed to open {}", self.failures_path().display()))?;
        writeln!(file, "{json}").context("Failed to append failure record")?;
        Ok(())
    }

    /// Read back every recorded failure, oldest first.
    pub fn load_failures(&self) -> Result<Vec<FailureRecord>> {
        let path = self.failures_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            let record: FailureRecord =
                serde_json::from_str(line).context("Failed to parse failure record")?;
            records.push(record);
        }
        Ok(records)
    }

    /// Write a snapshot of partially collected job results.
    ///
    /// Best-effort by contract: interrupt handling swallows errors from
    /// this path, so it simply reports them.
    pub fn save_partial_results(&self, jobs_json: &serde_json::Value) -> Result<()> {
        let path = self.dir.join("partial_results.json");
        let json = serde_json::to_string_pretty(jobs_json)
            .context("Failed to serialize partial results")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::FailureCategory;
    use crate::recovery::SessionStatus;
    use chrono::Utc;

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        assert!(store.load_session().unwrap().is_none());

        let mut session = RecoverySession::new("session=abc");
        session.status = SessionStatus::PartialResultsCollected;
        session.failed_job_ids.insert("linux-amd64-build".to_string());
        session.violation_streak = 2;
        store.save_session(&session).unwrap();

        let loaded = store.load_session().unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::PartialResultsCollected);
        assert!(loaded.failed_job_ids.contains("linux-amd64-build"));
        assert_eq!(loaded.violation_streak, 2);
    }

    #[test]
    fn test_failure_log_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        for n in 0..3 {
            store
                .record_failure(&FailureRecord {
                    job_id: format!("job-{n}"),
                    category: FailureCategory::Network,
                    raw_message: "connection refused".to_string(),
                    timestamp: Utc::now(),
                    recovery_actions_applied: vec!["reset_networks".to_string()],
                })
                .unwrap();
        }

        let records = store.load_failures().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].job_id, "job-0");
        assert_eq!(records[2].job_id, "job-2");
        assert!(records.iter().all(|r| r.category == FailureCategory::Network));
    }
}
