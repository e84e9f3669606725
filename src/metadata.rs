//! Metadata Checkpoint: a small JSON file under the coin's working
//! directory recording which pipeline phases have completed. Presence
//! of a phase's key means "already done" — the Phase Orchestrator skips
//! straight past it on resume unless overridden by `--phase` or
//! `--regenerate`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub fn metadata_path(working_dir: &Path) -> PathBuf {
    working_dir.join("metadata.json")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
    /// Hash of the last block this coin successfully processed. Carried
    /// independently of phase completion, since phases get cleared at
    /// the start of every new pass but the resume point must survive.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(flatten)]
    phases: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write via temp file + rename so a crash mid-write never leaves a
    /// truncated or partially-written checkpoint behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp_path, bytes)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn is_complete(&self, phase: &str) -> bool {
        self.phases.contains_key(phase)
    }

    pub fn record(&mut self, phase: &str, summary: impl Serialize) -> Result<()> {
        self.phases.insert(phase.to_string(), serde_json::to_value(summary)?);
        Ok(())
    }

    pub fn get<T: for<'de> Deserialize<'de>>(&self, phase: &str) -> Option<T> {
        self.phases.get(phase).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn clear(&mut self, phase: &str) {
        self.phases.remove(phase);
    }

    pub fn clear_all(&mut self) {
        self.phases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roundtrips_through_disk() {
        let dir = TempDir::new().unwrap();
        let path = metadata_path(dir.path());

        let mut meta = Metadata::load(&path).unwrap();
        assert!(!meta.is_complete("extract"));

        meta.record("extract", serde_json::json!({"vout": 10})).unwrap();
        meta.save(&path).unwrap();

        let reloaded = Metadata::load(&path).unwrap();
        assert!(reloaded.is_complete("extract"));
        assert!(!reloaded.is_complete("sort"));
    }

    #[test]
    fn regenerate_clears_a_single_phase() {
        let dir = TempDir::new().unwrap();
        let path = metadata_path(dir.path());
        let mut meta = Metadata::default();
        meta.record("extract", serde_json::json!({})).unwrap();
        meta.record("sort", serde_json::json!({})).unwrap();
        meta.clear("extract");
        meta.save(&path).unwrap();

        let reloaded = Metadata::load(&path).unwrap();
        assert!(!reloaded.is_complete("extract"));
        assert!(reloaded.is_complete("sort"));
    }
}
