//! The manifest store (§2 item 4, §6): a single append-only JSON document
//! describing every partition, run, schema version and drop ever recorded.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PartitionError;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub signature: String,
    pub version: u32,
}

/// One record type's presence inside a single partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPartitionEntry {
    /// Relative to the run's `partition_root`, e.g. `partition_00001/Table.csv`.
    pub path: String,
    /// Relative to `partition_root`, alongside `path`.
    pub digests: String,
    pub rows: u64,
    pub schema_signature: String,
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_schema_versions: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub name: String,
    pub dir: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub models: BTreeMap<String, ModelPartitionEntry>,
    #[serde(default)]
    pub stale: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
    #[serde(default)]
    pub replaces: Vec<String>,
    #[serde(default)]
    pub replaced_by: Vec<String>,
    pub created_at: String,
    pub run_id: String,
}

impl PartitionRecord {
    /// The numeric index embedded in `partition_NNNNN`.
    pub fn index(&self) -> Option<u32> {
        self.name.strip_prefix("partition_")?.parse().ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default)]
    pub partitions_created: Vec<String>,
    #[serde(default)]
    pub partitions_marked_stale: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropLogEntry {
    pub config: String,
    pub performed_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub partitions: Vec<PartitionRecord>,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    #[serde(default)]
    pub model_schemas: BTreeMap<String, SchemaEntry>,
    #[serde(default)]
    pub drops: Vec<DropLogEntry>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            partitions: Vec::new(),
            runs: Vec::new(),
            model_schemas: BTreeMap::new(),
            drops: Vec::new(),
        }
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, PartitionError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| PartitionError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let manifest: Manifest = serde_json::from_str(&data)
            .map_err(|e| PartitionError::ManifestMalformed(e.to_string()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(PartitionError::ManifestVersionMismatch {
                path: path.display().to_string(),
                found: manifest.version,
                expected: MANIFEST_VERSION,
            });
        }
        Ok(manifest)
    }

    /// Write the manifest atomically: serialise to a sibling temp file, then
    /// rename over the destination so a crash mid-write never leaves a
    /// truncated manifest.
    pub fn save(&self, path: &Path) -> Result<(), PartitionError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|e| PartitionError::ManifestMalformed(e.to_string()))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &data).map_err(|e| PartitionError::Io {
            path: tmp_path.display().to_string(),
            source: e,
        })?;
        std::fs::rename(&tmp_path, path).map_err(|e| PartitionError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    pub fn highest_partition_index(&self) -> u32 {
        self.partitions.iter().filter_map(PartitionRecord::index).max().unwrap_or(0)
    }

    pub fn non_stale_partitions(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.partitions.iter().filter(|p| !p.stale)
    }

    /// Schema-version propagation (§4.3): given the current signature of
    /// every record type touched this run, return the version each should
    /// carry and the set of record types whose signature changed.
    pub fn propagate_schema_versions(
        &self,
        current_signatures: &BTreeMap<String, String>,
    ) -> (BTreeMap<String, u32>, Vec<String>) {
        let mut versions = BTreeMap::new();
        let mut modified = Vec::new();
        for (record_type, signature) in current_signatures {
            match self.model_schemas.get(record_type) {
                None => {
                    versions.insert(record_type.clone(), 1);
                }
                Some(prior) if &prior.signature == signature => {
                    versions.insert(record_type.clone(), prior.version);
                }
                Some(prior) => {
                    versions.insert(record_type.clone(), prior.version + 1);
                    modified.push(record_type.clone());
                }
            }
        }
        (versions, modified)
    }

    /// Partitions impacted by this run's modified record types (§4.3): not
    /// already stale, and containing at least one modified record type.
    pub fn impacted_partitions<'a>(&'a self, modified: &'a [String]) -> Vec<&'a PartitionRecord> {
        self.non_stale_partitions()
            .filter(|p| p.models.keys().any(|rt| modified.contains(rt)))
            .collect()
    }
}

pub fn now_iso() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_entry(signature: &str, version: u32) -> SchemaEntry {
        SchemaEntry {
            signature: signature.to_string(),
            version,
        }
    }

    #[test]
    fn new_record_type_starts_at_version_one() {
        let manifest = Manifest::default();
        let mut current = BTreeMap::new();
        current.insert("Table".to_string(), "sig-a".to_string());
        let (versions, modified) = manifest.propagate_schema_versions(&current);
        assert_eq!(versions["Table"], 1);
        assert!(modified.is_empty());
    }

    #[test]
    fn unchanged_signature_keeps_version() {
        let mut manifest = Manifest::default();
        manifest.model_schemas.insert("Table".to_string(), schema_entry("sig-a", 3));
        let mut current = BTreeMap::new();
        current.insert("Table".to_string(), "sig-a".to_string());
        let (versions, modified) = manifest.propagate_schema_versions(&current);
        assert_eq!(versions["Table"], 3);
        assert!(modified.is_empty());
    }

    #[test]
    fn changed_signature_bumps_version_and_marks_modified() {
        let mut manifest = Manifest::default();
        manifest.model_schemas.insert("Table".to_string(), schema_entry("sig-a", 3));
        let mut current = BTreeMap::new();
        current.insert("Table".to_string(), "sig-b".to_string());
        let (versions, modified) = manifest.propagate_schema_versions(&current);
        assert_eq!(versions["Table"], 4);
        assert_eq!(modified, vec!["Table".to_string()]);
    }

    #[test]
    fn load_missing_manifest_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.version, MANIFEST_VERSION);
        assert!(manifest.partitions.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = Manifest::default();
        manifest.model_schemas.insert("Table".to_string(), schema_entry("sig-a", 1));
        manifest.save(&path).unwrap();
        let loaded = Manifest::load(&path).unwrap();
        assert_eq!(loaded.model_schemas["Table"].version, 1);
    }

    #[test]
    fn rejects_mismatched_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, r#"{"version": 99, "partitions": [], "runs": [], "model_schemas": {}, "drops": []}"#).unwrap();
        assert!(Manifest::load(&path).is_err());
    }
}
