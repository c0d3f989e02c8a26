//! The drop planner and applier (§4.12): marks `(record_type, partition)`
//! pairs as logically deleted in the manifest, optionally removing the
//! on-disk CSV, without ever discarding history already recorded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use vecdex_partition::manifest::{now_iso, DropLogEntry, Manifest};

use crate::error::DropError;

/// Selects which record types a drop touches and the optional date window
/// against each candidate partition's `created_at` (§4.12).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DropRequest {
    /// Empty means every record type present in the manifest.
    pub record_types: Vec<String>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub reason: Option<String>,
}

/// One record type's planned drop: the partitions it would remove and the
/// set of schema versions observed across them, for the drop log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedModelDrop {
    pub record_type: String,
    pub partitions: Vec<String>,
    pub schema_versions: Vec<u32>,
    pub rows: u64,
}

/// Serialised to disk by `drop plan` and read back by `drop apply`, so a
/// plan can be reviewed before it takes effect (§6 "Drop plan" file format).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DropPlan {
    pub models: Vec<PlannedModelDrop>,
    pub already_deleted: Vec<(String, String)>,
}

impl DropPlan {
    pub fn is_empty(&self) -> bool {
        self.models.iter().all(|m| m.partitions.is_empty())
    }

    pub fn total_partitions(&self) -> usize {
        self.models.iter().map(|m| m.partitions.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DropResult {
    pub record_type: String,
    pub partition: String,
    pub rows: u64,
    pub reason: Option<String>,
}

/// Build a [`DropPlan`] against `manifest` without mutating anything.
/// Record types with no matching, not-already-deleted partitions are
/// omitted from the plan entirely.
pub fn plan(manifest: &Manifest, request: &DropRequest) -> DropPlan {
    let record_types: Vec<String> = if request.record_types.is_empty() {
        manifest.model_schemas.keys().cloned().collect()
    } else {
        request.record_types.clone()
    };

    let mut result = DropPlan::default();
    for record_type in record_types {
        let mut partitions = Vec::new();
        let mut schema_versions = std::collections::BTreeSet::new();
        let mut rows = 0u64;
        for partition in &manifest.partitions {
            let Some(entry) = partition.models.get(&record_type) else {
                continue;
            };
            if !within_window(&partition.created_at, request) {
                continue;
            }
            if entry.deleted {
                result.already_deleted.push((record_type.clone(), partition.name.clone()));
                continue;
            }
            partitions.push(partition.name.clone());
            schema_versions.insert(entry.schema_version);
            rows += entry.rows;
        }
        if partitions.is_empty() {
            continue;
        }
        partitions.sort();
        result.models.push(PlannedModelDrop {
            record_type,
            partitions,
            schema_versions: schema_versions.into_iter().collect(),
            rows,
        });
    }
    result
}

fn within_window(created_at: &str, request: &DropRequest) -> bool {
    if let Some(before) = &request.before {
        if created_at.as_bytes() >= before.as_bytes() {
            return false;
        }
    }
    if let Some(after) = &request.after {
        if created_at.as_bytes() < after.as_bytes() {
            return false;
        }
    }
    true
}

pub struct ApplyOptions {
    pub apply_changes: bool,
    pub remove_local: bool,
    pub performed_by: Option<String>,
    /// Where partition directories live, needed to resolve each
    /// `ModelPartitionEntry::path` into an on-disk file when `remove_local`
    /// is set.
    pub partition_root: PathBuf,
}

/// Apply a previously computed [`DropPlan`] against `manifest`. With
/// `apply_changes` unset this is a dry run: `manifest` is left untouched and
/// the returned results describe what *would* happen. Re-applying an
/// already-applied plan is a no-op per pair (§9 open question: `deleted` is
/// one-way, the original `drop_reason` is never overwritten).
pub fn apply(
    manifest: &mut Manifest,
    dropped_plan: &DropPlan,
    request: &DropRequest,
    options: &ApplyOptions,
) -> Result<Vec<DropResult>, DropError> {
    let mut results = Vec::new();
    let mut any_applied = false;
    let performed_at = now_iso();

    for model in &dropped_plan.models {
        for partition_name in &model.partitions {
            let Some(partition) = manifest.partitions.iter_mut().find(|p| &p.name == partition_name) else {
                warn!(record_type = %model.record_type, partition = %partition_name, "drop: target partition missing from the manifest, skipping");
                continue;
            };
            let Some(entry) = partition.models.get_mut(&model.record_type) else {
                warn!(record_type = %model.record_type, partition = %partition_name, "drop: target record type missing from partition, skipping");
                continue;
            };
            if entry.deleted {
                results.push(DropResult {
                    record_type: model.record_type.clone(),
                    partition: partition_name.clone(),
                    rows: entry.rows,
                    reason: entry.drop_reason.clone(),
                });
                continue;
            }

            let rows = entry.rows;
            let csv_path = options.partition_root.join(&entry.path);

            if options.apply_changes {
                entry.deleted = true;
                entry.deleted_at = Some(performed_at.clone());
                entry.drop_reason = request.reason.clone();
                entry.drop_schema_versions = Some(model.schema_versions.clone());
                any_applied = true;

                if options.remove_local {
                    remove_local_csv(&csv_path)?;
                }
            }

            results.push(DropResult {
                record_type: model.record_type.clone(),
                partition: partition_name.clone(),
                rows,
                reason: request.reason.clone(),
            });
        }
    }

    for (record_type, partition_name) in &dropped_plan.already_deleted {
        if let Some(partition) = manifest.partitions.iter().find(|p| &p.name == partition_name) {
            if let Some(entry) = partition.models.get(record_type) {
                results.push(DropResult {
                    record_type: record_type.clone(),
                    partition: partition_name.clone(),
                    rows: entry.rows,
                    reason: entry.drop_reason.clone(),
                });
            }
        }
    }

    if any_applied {
        manifest.drops.push(DropLogEntry {
            config: serde_json::to_string(request).unwrap_or_default(),
            performed_at,
            performed_by: options.performed_by.clone(),
        });
    }

    Ok(results)
}

fn remove_local_csv(path: &Path) -> Result<(), DropError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DropError::Io {
            path: path.display().to_string(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use vecdex_partition::manifest::{ModelPartitionEntry, PartitionRecord};

    fn partition(name: &str, created_at: &str, record_type: &str, rows: u64, version: u32) -> PartitionRecord {
        let mut models = BTreeMap::new();
        models.insert(
            record_type.to_string(),
            ModelPartitionEntry {
                path: format!("{name}/{record_type}.csv"),
                digests: format!("{name}/{record_type}.digests"),
                rows,
                schema_signature: "sig".to_string(),
                schema_version: version,
                deleted: false,
                deleted_at: None,
                drop_reason: None,
                drop_schema_versions: None,
            },
        );
        PartitionRecord {
            name: name.to_string(),
            dir: name.to_string(),
            config: serde_json::Value::Null,
            models,
            stale: false,
            stale_at: None,
            stale_reason: None,
            replaces: Vec::new(),
            replaced_by: Vec::new(),
            created_at: created_at.to_string(),
            run_id: "run-1".to_string(),
        }
    }

    #[test]
    fn plan_omits_record_types_with_no_matches() {
        let manifest = Manifest::default();
        let request = DropRequest::default();
        let plan = plan(&manifest, &request);
        assert!(plan.models.is_empty());
    }

    #[test]
    fn plan_collects_matching_partitions_sorted() {
        let mut manifest = Manifest::default();
        manifest.partitions.push(partition("partition_00002", "2024-02-01T00:00:00", "Table", 10, 1));
        manifest.partitions.push(partition("partition_00001", "2024-01-01T00:00:00", "Table", 5, 1));
        let request = DropRequest {
            record_types: vec!["Table".to_string()],
            ..Default::default()
        };
        let plan = plan(&manifest, &request);
        assert_eq!(plan.models.len(), 1);
        assert_eq!(
            plan.models[0].partitions,
            vec!["partition_00001".to_string(), "partition_00002".to_string()]
        );
        assert_eq!(plan.models[0].rows, 15);
    }

    #[test]
    fn plan_respects_before_after_window() {
        let mut manifest = Manifest::default();
        manifest.partitions.push(partition("partition_00001", "2024-01-01T00:00:00", "Table", 5, 1));
        manifest.partitions.push(partition("partition_00002", "2024-06-01T00:00:00", "Table", 5, 1));
        let request = DropRequest {
            record_types: vec!["Table".to_string()],
            before: Some("2024-03-01T00:00:00".to_string()),
            ..Default::default()
        };
        let plan = plan(&manifest, &request);
        assert_eq!(plan.models[0].partitions, vec!["partition_00001".to_string()]);
    }

    #[test]
    fn dry_run_does_not_mutate_manifest() {
        let mut manifest = Manifest::default();
        manifest.partitions.push(partition("partition_00001", "2024-01-01T00:00:00", "Table", 5, 1));
        let request = DropRequest {
            record_types: vec!["Table".to_string()],
            reason: Some("superseded".to_string()),
            ..Default::default()
        };
        let dropped_plan = plan(&manifest, &request);
        let options = ApplyOptions {
            apply_changes: false,
            remove_local: false,
            performed_by: None,
            partition_root: PathBuf::from("/tmp/does-not-matter"),
        };
        let results = apply(&mut manifest, &dropped_plan, &request, &options).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!manifest.partitions[0].models["Table"].deleted);
        assert!(manifest.drops.is_empty());
    }

    #[test]
    fn apply_marks_deleted_and_logs_once() {
        let mut manifest = Manifest::default();
        manifest.partitions.push(partition("partition_00001", "2024-01-01T00:00:00", "Table", 5, 1));
        let request = DropRequest {
            record_types: vec!["Table".to_string()],
            reason: Some("superseded".to_string()),
            ..Default::default()
        };
        let dropped_plan = plan(&manifest, &request);
        let options = ApplyOptions {
            apply_changes: true,
            remove_local: false,
            performed_by: Some("operator".to_string()),
            partition_root: PathBuf::from("/tmp/does-not-matter"),
        };
        apply(&mut manifest, &dropped_plan, &request, &options).unwrap();
        assert!(manifest.partitions[0].models["Table"].deleted);
        assert_eq!(
            manifest.partitions[0].models["Table"].drop_reason,
            Some("superseded".to_string())
        );
        assert_eq!(manifest.drops.len(), 1);
    }

    #[test]
    fn reapplying_does_not_overwrite_original_reason() {
        let mut manifest = Manifest::default();
        manifest.partitions.push(partition("partition_00001", "2024-01-01T00:00:00", "Table", 5, 1));
        let first_request = DropRequest {
            record_types: vec!["Table".to_string()],
            reason: Some("first-reason".to_string()),
            ..Default::default()
        };
        let options = ApplyOptions {
            apply_changes: true,
            remove_local: false,
            performed_by: None,
            partition_root: PathBuf::from("/tmp/does-not-matter"),
        };
        let first_plan = plan(&manifest, &first_request);
        apply(&mut manifest, &first_plan, &first_request, &options).unwrap();

        let second_request = DropRequest {
            record_types: vec!["Table".to_string()],
            reason: Some("second-reason".to_string()),
            ..Default::default()
        };
        let second_plan = plan(&manifest, &second_request);
        assert!(second_plan.models.is_empty());
        assert_eq!(second_plan.already_deleted, vec![("Table".to_string(), "partition_00001".to_string())]);
        let results = apply(&mut manifest, &second_plan, &second_request, &options).unwrap();
        assert_eq!(results[0].reason, Some("first-reason".to_string()));
        assert_eq!(
            manifest.partitions[0].models["Table"].drop_reason,
            Some("first-reason".to_string())
        );
        assert_eq!(manifest.drops.len(), 1);
    }
}
