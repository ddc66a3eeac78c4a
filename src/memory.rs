//! Durable fact logs.
//!
//! Two append-only markdown files, `USER_MEMORY.md` and `COMPANY_MEMORY.md`,
//! each created with a one-line header on first write. A write is skipped
//! when the confidence is below the threshold, or when the summary already
//! occurs verbatim anywhere in the log.
//!
//! Duplicate detection is plain substring containment. Paraphrases and
//! contradictions ("lives in London" vs "moved to New York") are not
//! recognised and both get appended.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

use crate::config::MemoryConfig;
use crate::models::{MemorySnapshot, MemoryTarget};

#[derive(Debug, Clone, PartialEq)]
pub enum MemoryOutcome {
    SkippedLowConfidence { confidence: f64, threshold: f64 },
    SkippedDuplicate,
    Written { target: MemoryTarget },
}

impl fmt::Display for MemoryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryOutcome::SkippedLowConfidence {
                confidence,
                threshold,
            } => write!(
                f,
                "Skipped: Confidence {} is too low (threshold {}).",
                confidence, threshold
            ),
            MemoryOutcome::SkippedDuplicate => f.write_str("Skipped: Fact already exists in memory."),
            MemoryOutcome::Written { target } => write!(f, "Success: Wrote to {} memory.", target),
        }
    }
}

#[derive(Debug)]
pub struct MemoryStore {
    dir: PathBuf,
    threshold: f64,
    write_lock: Mutex<()>,
}

impl MemoryStore {
    pub fn new(dir: impl Into<PathBuf>, threshold: f64) -> Self {
        Self {
            dir: dir.into(),
            threshold,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.dir.clone(), config.confidence_threshold)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, target: MemoryTarget) -> PathBuf {
        self.dir.join(target.file_name())
    }

    /// Full log text, or an empty string if the log was never written.
    pub fn read(&self, target: MemoryTarget) -> Result<String> {
        let path = self.path(target);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Append `summary` unless it is low-confidence or already present.
    pub fn append_if_new(
        &self,
        target: MemoryTarget,
        summary: &str,
        confidence: f64,
    ) -> Result<MemoryOutcome> {
        if !confidence.is_finite() || confidence < self.threshold {
            return Ok(MemoryOutcome::SkippedLowConfidence {
                confidence,
                threshold: self.threshold,
            });
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("memory write lock poisoned"))?;

        let existing = self.read(target)?;
        if existing.contains(summary) {
            tracing::debug!(%target, "memory fact already present");
            return Ok(MemoryOutcome::SkippedDuplicate);
        }

        let path = self.path(target);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        if existing.is_empty() {
            writeln!(file, "# {}", target.file_name())?;
        }
        write!(file, "\n- {}", summary)?;
        file.flush()?;

        tracing::info!(%target, "memory fact written");
        Ok(MemoryOutcome::Written { target })
    }

    pub fn snapshot(&self) -> Result<MemorySnapshot> {
        Ok(MemorySnapshot {
            user: self.read(MemoryTarget::User)?,
            company: self.read(MemoryTarget::Company)?,
        })
    }
}

/// CLI entry point for `corpus memory show`.
pub fn run_memory_show(config: &MemoryConfig) -> Result<()> {
    let store = MemoryStore::from_config(config);
    let snapshot = store.snapshot()?;
    for (target, text) in [
        (MemoryTarget::User, &snapshot.user),
        (MemoryTarget::Company, &snapshot.company),
    ] {
        println!("{}", store.path(target).display());
        if text.is_empty() {
            println!("  (empty)");
        } else {
            for line in text.lines() {
                println!("  {}", line);
            }
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path(), 0.8);
        (dir, store)
    }

    #[test]
    fn test_read_missing_log_is_empty() {
        let (_dir, store) = store();
        assert_eq!(store.read(MemoryTarget::User).unwrap(), "");
        assert_eq!(store.snapshot().unwrap(), MemorySnapshot::default());
    }

    #[test]
    fn test_write_then_duplicate() {
        let (_dir, store) = store();
        let fact = "Prefers metric units";
        assert_eq!(
            store.append_if_new(MemoryTarget::User, fact, 0.9).unwrap(),
            MemoryOutcome::Written {
                target: MemoryTarget::User
            }
        );
        assert_eq!(
            store.append_if_new(MemoryTarget::User, fact, 0.9).unwrap(),
            MemoryOutcome::SkippedDuplicate
        );
        let log = store.read(MemoryTarget::User).unwrap();
        assert_eq!(log.matches(fact).count(), 1);
        assert_eq!(log, "# USER_MEMORY.md\n\n- Prefers metric units");
    }

    #[test]
    fn test_low_confidence_never_writes() {
        let (dir, store) = store();
        for summary in ["anything", "", "Lives in Paris"] {
            let outcome = store
                .append_if_new(MemoryTarget::Company, summary, 0.5)
                .unwrap();
            assert!(matches!(outcome, MemoryOutcome::SkippedLowConfidence { .. }));
        }
        assert!(!dir.path().join("COMPANY_MEMORY.md").exists());
    }

    #[test]
    fn test_non_finite_confidence_never_writes() {
        let (dir, store) = store();
        for confidence in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let outcome = store
                .append_if_new(MemoryTarget::User, "Lives in Oslo", confidence)
                .unwrap();
            assert!(matches!(outcome, MemoryOutcome::SkippedLowConfidence { .. }));
        }
        assert!(!dir.path().join("USER_MEMORY.md").exists());
    }

    #[test]
    fn test_threshold_is_inclusive_at_store() {
        let (_dir, store) = store();
        assert!(matches!(
            store.append_if_new(MemoryTarget::User, "edge", 0.8).unwrap(),
            MemoryOutcome::Written { .. }
        ));
    }

    #[test]
    fn test_contradictions_are_both_kept() {
        let (_dir, store) = store();
        store
            .append_if_new(MemoryTarget::User, "Lives in London", 0.95)
            .unwrap();
        store
            .append_if_new(MemoryTarget::User, "Moved to New York", 0.95)
            .unwrap();
        let log = store.read(MemoryTarget::User).unwrap();
        assert!(log.contains("London"));
        assert!(log.contains("New York"));
    }

    #[test]
    fn test_logs_are_independent() {
        let (_dir, store) = store();
        store
            .append_if_new(MemoryTarget::Company, "Fiscal year starts in April", 0.9)
            .unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.user, "");
        assert!(snap.company.starts_with("# COMPANY_MEMORY.md\n"));
        assert!(snap.company.contains("- Fiscal year starts in April"));
    }

    #[test]
    fn test_outcome_messages() {
        assert_eq!(
            MemoryOutcome::SkippedLowConfidence {
                confidence: 0.5,
                threshold: 0.8
            }
            .to_string(),
            "Skipped: Confidence 0.5 is too low (threshold 0.8)."
        );
        assert_eq!(
            MemoryOutcome::SkippedDuplicate.to_string(),
            "Skipped: Fact already exists in memory."
        );
        assert_eq!(
            MemoryOutcome::Written {
                target: MemoryTarget::Company
            }
            .to_string(),
            "Success: Wrote to COMPANY memory."
        );
    }
}
