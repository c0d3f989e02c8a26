//! The query config builder (§4.8): scans every partition's resume-state
//! files and turns them into the forward (record type → collections) and
//! inverse (collection → record types) indices the fan-out query client
//! resolves its targets from.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::resume_state::{ResumeStateFile, ResumeStateStore};

/// What a given record type resolves to across every collection that has
/// ever indexed it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordTypeEntry {
    pub collections: BTreeSet<String>,
    pub total_documents: u64,
    pub partitions: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryConfig {
    pub generated_at: String,
    pub record_types: BTreeMap<String, RecordTypeEntry>,
    pub collections: BTreeMap<String, BTreeSet<String>>,
    pub total_collections: usize,
    pub total_record_types: usize,
}

impl QueryConfig {
    /// All collections a record type is known to live in; empty if the
    /// record type has never been indexed.
    pub fn collections_for(&self, record_type: &str) -> BTreeSet<String> {
        self.record_types
            .get(record_type)
            .map(|entry| entry.collections.clone())
            .unwrap_or_default()
    }

    /// Union of collections for a set of record types. An empty or missing
    /// `record_types` list (passed as `None`) resolves to *every* known
    /// collection (§4.9 "nil/empty models" rule).
    pub fn resolve_collections(&self, record_types: Option<&[String]>) -> BTreeSet<String> {
        match record_types {
            None => self.collections.keys().cloned().collect(),
            Some(names) if names.is_empty() => self.collections.keys().cloned().collect(),
            Some(names) => {
                let mut out = BTreeSet::new();
                for name in names {
                    match self.record_types.get(name) {
                        Some(entry) => out.extend(entry.collections.iter().cloned()),
                        None => warn!(record_type = %name, "query config: unknown record type, ignoring"),
                    }
                }
                out
            }
        }
    }
}

/// Walk `partition_root`'s immediate subdirectories in lexicographic order,
/// read every `*_resume_state.json` file found inside, and fold it into one
/// [`QueryConfig`]. A malformed or unreadable resume-state file is logged
/// and skipped rather than aborting the whole scan (§4.8).
pub fn build(partition_root: &Path) -> std::io::Result<QueryConfig> {
    let mut config = QueryConfig {
        generated_at: Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string(),
        ..Default::default()
    };

    let mut partition_dirs: Vec<_> = std::fs::read_dir(partition_root)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .collect();
    partition_dirs.sort_by_key(|e| e.file_name());

    for dir_entry in partition_dirs {
        let partition_name = dir_entry.file_name().to_string_lossy().to_string();
        let dir_path = dir_entry.path();
        let mut state_files: Vec<_> = match std::fs::read_dir(&dir_path) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path()
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.ends_with(crate::resume_state::RESUME_STATE_SUFFIX))
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) => {
                warn!(dir = %dir_path.display(), error = %e, "query config: could not list partition directory, skipping");
                continue;
            }
        };
        state_files.sort_by_key(|e| e.file_name());

        for state_entry in state_files {
            let path = state_entry.path();
            let Some(collection) = ResumeStateStore::collection_name_of(&path) else {
                continue;
            };
            let per_record_type = match read_resume_state_file(&path) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "query config: malformed resume-state file, skipping");
                    continue;
                }
            };

            for (record_type, state) in per_record_type {
                if !state.started || state.collection_count == 0 {
                    continue;
                }
                let inverse_entry = config.collections.entry(collection.clone()).or_default();
                inverse_entry.insert(record_type.clone());
                let entry = config.record_types.entry(record_type).or_default();
                entry.collections.insert(collection.clone());
                entry.partitions.insert(partition_name.clone());
                entry.total_documents += state.collection_count;
            }
        }
    }

    config.total_collections = config.collections.len();
    config.total_record_types = config.record_types.len();
    Ok(config)
}

fn read_resume_state_file(path: &Path) -> std::io::Result<ResumeStateFile> {
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_state(dir: &Path, partition: &str, collection: &str, body: &str) {
        let partition_dir = dir.join(partition);
        std::fs::create_dir_all(&partition_dir).unwrap();
        std::fs::write(partition_dir.join(format!("{collection}_resume_state.json")), body).unwrap();
    }

    #[test]
    fn builds_forward_and_inverse_indices() {
        let dir = tempfile::tempdir().unwrap();
        write_state(
            dir.path(),
            "partition_00001",
            "partition_00001",
            r#"{"Table": {"started": true, "collection_count": 5}, "Field": {"started": true, "collection_count": 2}}"#,
        );
        write_state(
            dir.path(),
            "partition_00002",
            "partition_00002",
            r#"{"Table": {"started": true, "collection_count": 3}}"#,
        );

        let config = build(dir.path()).unwrap();
        assert_eq!(config.total_collections, 2);
        assert_eq!(config.record_types["Table"].total_documents, 8);
        assert!(config.record_types["Table"].collections.contains("partition_00001"));
        assert!(config.record_types["Table"].collections.contains("partition_00002"));
        assert!(!config.record_types["Field"].collections.contains("partition_00002"));
    }

    #[test]
    fn malformed_state_file_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), "partition_00001", "partition_00001", "{not json");
        let config = build(dir.path()).unwrap();
        assert!(config.record_types.is_empty());
    }

    #[test]
    fn resolve_collections_defaults_to_everything_when_unscoped() {
        let dir = tempfile::tempdir().unwrap();
        write_state(
            dir.path(),
            "partition_00001",
            "partition_00001",
            r#"{"Table": {"started": true, "collection_count": 5}}"#,
        );
        let config = build(dir.path()).unwrap();
        assert_eq!(config.resolve_collections(None).len(), 1);
        assert_eq!(config.resolve_collections(Some(&[])).len(), 1);
    }

    #[test]
    fn started_but_unfinished_record_type_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        write_state(
            dir.path(),
            "partition_00001",
            "partition_00001",
            r#"{"Table": {"started": true, "collection_count": 5}, "Field": {"started": true, "collection_count": 0}, "Unstarted": {"started": false, "collection_count": 9}}"#,
        );

        let config = build(dir.path()).unwrap();
        assert!(config.record_types.contains_key("Table"));
        assert!(!config.record_types.contains_key("Field"));
        assert!(!config.record_types.contains_key("Unstarted"));
        assert_eq!(config.record_types["Table"].total_documents, 5);
        // The collection's only valid entry is Table, so the inverse map
        // reflects that rather than also listing the excluded record types.
        assert_eq!(config.collections["partition_00001"].len(), 1);
        assert!(config.collections["partition_00001"].contains("Table"));

        // A collection whose only record types are all excluded must not
        // appear in the inverse map at all (§4.8).
        assert_eq!(config.resolve_collections(None).len(), 1);
    }
}
