//! The partition writer (§4.4): the three-pass carryover/ingest/finalize
//! algorithm that turns CSV sources and prior partitions into a new,
//! deduplicated set of partitions, recorded atomically in the manifest.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use csv::{ReaderBuilder, WriterBuilder};
use vecdex_core::digest::{row_digest, schema_signature, SignatureField};
use vecdex_core::registry::Registry;

use crate::csv_reader::{open_source, CsvSourceConfig, RowOutcome};
use crate::error::PartitionError;
use crate::manifest::{now_iso, Manifest, ModelPartitionEntry, PartitionRecord, RunRecord};

/// One configured ingest source for a record type.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub record_type: String,
    /// Source template, see [`crate::source_template`].
    pub template: String,
    /// target field name -> source column name; empty means identity
    /// (target fields are read straight from the like-named source column).
    pub target_to_source: BTreeMap<String, String>,
    /// Fields for which a nil/empty/"NA"/"N/A" value causes the row to be
    /// dropped before digesting.
    pub drop_na_columns: Vec<String>,
    pub csv_config: CsvSourceConfig,
}

#[derive(Debug, Clone)]
pub struct PartitionWriterConfig {
    pub partition_root: PathBuf,
    /// Max rows per record type per partition; 0 = unlimited.
    pub directory_size: u64,
    pub run_id: String,
}

#[derive(Debug, Default)]
pub struct RunOutcome {
    pub partitions_created: Vec<String>,
    pub partitions_marked_stale: Vec<String>,
    pub rows_carried_over: u64,
    pub rows_ingested: u64,
}

struct RecordTypeWriter {
    csv: csv::Writer<BufWriter<File>>,
    digests: BufWriter<File>,
    rows: u64,
    header: Vec<String>,
    csv_path: PathBuf,
    digests_path: PathBuf,
}

struct OpenPartition {
    name: String,
    dir: PathBuf,
    writers: BTreeMap<String, RecordTypeWriter>,
    replaces: HashSet<String>,
}

/// Drives the three-pass write for one run. Construct with [`Self::open`],
/// which hydrates the seen-digest set from every non-stale partition, then
/// call [`Self::run`].
pub struct PartitionWriter {
    config: PartitionWriterConfig,
    manifest: Manifest,
    seen: HashMap<String, HashSet<String>>,
    next_index: u32,
    current: Option<OpenPartition>,
    new_partitions: Vec<PartitionRecord>,
    /// This run's schema decisions, filled in by `run` before the carryover
    /// and ingest passes and read back by `finalize_current`.
    pending_versions: BTreeMap<String, u32>,
    pending_signatures: BTreeMap<String, String>,
}

impl PartitionWriter {
    pub fn open(config: PartitionWriterConfig, manifest: Manifest) -> Result<Self, PartitionError> {
        let mut seen: HashMap<String, HashSet<String>> = HashMap::new();
        for partition in manifest.non_stale_partitions() {
            for (record_type, entry) in &partition.models {
                if entry.deleted {
                    continue;
                }
                let digests_path = config.partition_root.join(&entry.digests);
                let file = File::open(&digests_path).map_err(|e| PartitionError::Io {
                    path: digests_path.display().to_string(),
                    source: e,
                })?;
                let reader = BufReader::new(file);
                let bucket = seen.entry(record_type.clone()).or_default();
                for line in reader.lines() {
                    let line = line.map_err(|e| PartitionError::Io {
                        path: digests_path.display().to_string(),
                        source: e,
                    })?;
                    if !line.is_empty() {
                        bucket.insert(line);
                    }
                }
            }
        }
        let next_index = manifest.highest_partition_index() + 1;
        Ok(Self {
            config,
            manifest,
            seen,
            next_index,
            current: None,
            new_partitions: Vec::new(),
            pending_versions: BTreeMap::new(),
            pending_signatures: BTreeMap::new(),
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn partition_dir(&self, name: &str) -> PathBuf {
        self.config.partition_root.join(name)
    }

    fn open_new_partition(&mut self) -> Result<(), PartitionError> {
        let name = format!("partition_{:05}", self.next_index);
        self.next_index += 1;
        let dir = self.partition_dir(&name);
        fs::create_dir_all(&dir).map_err(|e| PartitionError::Io {
            path: dir.display().to_string(),
            source: e,
        })?;
        self.current = Some(OpenPartition {
            name,
            dir,
            writers: BTreeMap::new(),
            replaces: HashSet::new(),
        });
        Ok(())
    }

    fn writer_for<'a>(
        &'a mut self,
        record_type: &str,
        header: &[String],
    ) -> Result<&'a mut RecordTypeWriter, PartitionError> {
        if self.current.is_none() {
            self.open_new_partition()?;
        }
        let partition = self.current.as_mut().expect("just opened");
        if !partition.writers.contains_key(record_type) {
            let safe_name = sanitize_filename(record_type);
            let csv_path = partition.dir.join(format!("{safe_name}.csv"));
            let digests_path = partition.dir.join(format!("{safe_name}.csv.digests"));
            let csv_file = File::create(&csv_path).map_err(|e| PartitionError::Io {
                path: csv_path.display().to_string(),
                source: e,
            })?;
            let digests_file = File::create(&digests_path).map_err(|e| PartitionError::Io {
                path: digests_path.display().to_string(),
                source: e,
            })?;
            let mut csv_writer = WriterBuilder::new().from_writer(BufWriter::new(csv_file));
            csv_writer.write_record(header).map_err(|e| PartitionError::Io {
                path: csv_path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
            partition.writers.insert(
                record_type.to_string(),
                RecordTypeWriter {
                    csv: csv_writer,
                    digests: BufWriter::new(digests_file),
                    rows: 0,
                    header: header.to_vec(),
                    csv_path,
                    digests_path,
                },
            );
        }
        Ok(partition.writers.get_mut(record_type).expect("inserted above"))
    }

    /// Write one row, rolling over to a fresh partition first if
    /// `record_type`'s count in the currently open partition has already
    /// reached `directory_size` (§4.4).
    fn write_row(
        &mut self,
        record_type: &str,
        header: &[String],
        cells: &[Option<String>],
        digest: &str,
    ) -> Result<(), PartitionError> {
        let needs_rollover = self.current.as_ref().is_some_and(|p| {
            self.config.directory_size > 0
                && p.writers
                    .get(record_type)
                    .is_some_and(|w| w.rows >= self.config.directory_size)
        });
        if needs_rollover {
            self.finalize_current()?;
        }
        let writer = self.writer_for(record_type, header)?;
        let record: Vec<String> = cells.iter().map(|c| c.clone().unwrap_or_default()).collect();
        writer.csv.write_record(&record).map_err(|e| PartitionError::Io {
            path: writer.csv_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;
        writeln!(writer.digests, "{digest}").map_err(|e| PartitionError::Io {
            path: writer.digests_path.display().to_string(),
            source: e,
        })?;
        writer.rows += 1;
        self.seen.entry(record_type.to_string()).or_default().insert(digest.to_string());
        Ok(())
    }

    /// Carryover pass (§4.4 pass 1): copy every non-modified record type's
    /// rows verbatim from `impacted` partitions into the current partition.
    fn carryover(
        &mut self,
        impacted_names: &[String],
        modified: &[String],
    ) -> Result<u64, PartitionError> {
        let mut copied = 0u64;
        let impacted_partitions: Vec<PartitionRecord> = self
            .manifest
            .partitions
            .iter()
            .filter(|p| impacted_names.contains(&p.name))
            .cloned()
            .collect();

        for partition in &impacted_partitions {
            for (record_type, entry) in &partition.models {
                if modified.contains(record_type) || entry.deleted {
                    continue;
                }
                let csv_path = self.config.partition_root.join(&entry.path);
                let mut reader = ReaderBuilder::new()
                    .has_headers(true)
                    .from_path(&csv_path)
                    .map_err(|e| PartitionError::Io {
                        path: csv_path.display().to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e),
                    })?;
                let header: Vec<String> = reader
                    .headers()
                    .map_err(|e| PartitionError::Io {
                        path: csv_path.display().to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e),
                    })?
                    .iter()
                    .map(str::to_string)
                    .collect();
                for record in reader.records() {
                    let record = record.map_err(|e| PartitionError::Io {
                        path: csv_path.display().to_string(),
                        source: std::io::Error::new(std::io::ErrorKind::Other, e),
                    })?;
                    let cells: Vec<Option<String>> = record
                        .iter()
                        .map(|c| if c.is_empty() { None } else { Some(c.to_string()) })
                        .collect();
                    let digest = row_digest(cells.iter().map(|c| c.as_deref()));
                    self.write_row(record_type, &header, &cells, &digest)?;
                    copied += 1;
                }
            }
            if let Some(open) = self.current.as_mut() {
                open.replaces.insert(partition.name.clone());
            }
        }
        Ok(copied)
    }

    /// Ingest pass (§4.4 pass 2): drive each configured source's reader,
    /// project, drop-na filter, dedupe and write.
    fn ingest(&mut self, sources: &[SourceSpec], registry: &dyn Registry) -> Result<u64, PartitionError> {
        let mut written = 0u64;
        for source in sources {
            let mut reader = open_source(&source.template, source.csv_config.clone())?;
            let source_header = reader.header().to_vec();
            let target_fields: Vec<String> = if source.target_to_source.is_empty() {
                source_header.clone()
            } else {
                source.target_to_source.keys().cloned().collect()
            };

            while let Some(outcome) = reader.next_row()? {
                let RowOutcome::Row(row) = outcome else {
                    // Dropped row: logged by the caller via §7 MalformedRow;
                    // the writer itself only counts successful writes.
                    continue;
                };
                let mut projected: Vec<Option<String>> = Vec::with_capacity(target_fields.len());
                let mut drop_row = false;
                for target in &target_fields {
                    let source_col = source
                        .target_to_source
                        .get(target)
                        .map(String::as_str)
                        .unwrap_or(target.as_str());
                    let value = row.get(&source_header, source_col).map(str::to_string);
                    if source.drop_na_columns.contains(target)
                        && matches!(value.as_deref(), None | Some("") | Some("NA") | Some("N/A"))
                    {
                        drop_row = true;
                    }
                    projected.push(value);
                }
                if drop_row {
                    continue;
                }
                if let Some(record_type) = registry.record_type(&source.record_type) {
                    let mut record = vecdex_core::registry::Record::new();
                    for (field, value) in target_fields.iter().zip(projected.iter()) {
                        record.insert(field.clone(), value.clone());
                    }
                    if record_type.validate(&record).is_err() {
                        continue;
                    }
                }
                let digest = row_digest(projected.iter().map(|c| c.as_deref()));
                if self
                    .seen
                    .get(&source.record_type)
                    .is_some_and(|set| set.contains(&digest))
                {
                    continue;
                }
                self.write_row(&source.record_type, &target_fields, &projected, &digest)?;
                written += 1;
            }
        }
        Ok(written)
    }

    fn finalize_current(&mut self) -> Result<(), PartitionError> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        if open.writers.is_empty() || open.writers.values().all(|w| w.rows == 0) {
            let _ = fs::remove_dir_all(&open.dir);
            return Ok(());
        }
        let mut models = BTreeMap::new();
        let mut config_fragment = serde_json::Map::new();
        for (record_type, mut writer) in open.writers {
            writer.csv.flush().ok();
            writer.digests.flush().ok();
            let schema_sig = self
                .pending_schema_signature(&record_type)
                .unwrap_or_default();
            let schema_ver = self.pending_schema_version(&record_type).unwrap_or(1);
            // Recorded relative to `partition_root` so the manifest stays
            // portable across checkouts; `vectorize_config.json` below keeps
            // the absolute form per §6.
            let rel_path = writer
                .csv_path
                .strip_prefix(&self.config.partition_root)
                .unwrap_or(&writer.csv_path)
                .display()
                .to_string();
            let rel_digests = writer
                .digests_path
                .strip_prefix(&self.config.partition_root)
                .unwrap_or(&writer.digests_path)
                .display()
                .to_string();
            models.insert(
                record_type.clone(),
                ModelPartitionEntry {
                    path: rel_path,
                    digests: rel_digests,
                    rows: writer.rows,
                    schema_signature: schema_sig,
                    schema_version: schema_ver,
                    deleted: false,
                    deleted_at: None,
                    drop_reason: None,
                    drop_schema_versions: None,
                },
            );
            config_fragment.insert(
                record_type,
                serde_json::json!({
                    "path": writer.csv_path.display().to_string(),
                    "columns": Vec::<String>::new(),
                    "digests": writer.digests_path.display().to_string(),
                }),
            );
        }
        let replaces: Vec<String> = open.replaces.into_iter().collect();
        let record = PartitionRecord {
            name: open.name.clone(),
            dir: open.dir.display().to_string(),
            config: serde_json::Value::Object(config_fragment),
            models,
            stale: false,
            stale_at: None,
            stale_reason: None,
            replaces,
            replaced_by: Vec::new(),
            created_at: now_iso(),
            run_id: self.config.run_id.clone(),
        };
        self.new_partitions.push(record);
        Ok(())
    }

    fn pending_schema_signature(&self, record_type: &str) -> Option<String> {
        self.pending_signatures.get(record_type).cloned()
    }

    fn pending_schema_version(&self, record_type: &str) -> Option<u32> {
        self.pending_versions.get(record_type).copied()
    }

    /// Run the full three-pass write against the manifest this writer was
    /// opened with, returning the updated manifest and a summary. Does not
    /// persist the manifest to disk; call [`Manifest::save`] on the
    /// returned manifest.
    pub fn run(
        mut self,
        sources: &[SourceSpec],
        registry: &dyn Registry,
    ) -> Result<(Manifest, RunOutcome), PartitionError> {
        let mut current_signatures: BTreeMap<String, String> = BTreeMap::new();
        for source in sources {
            let fields: Vec<SignatureField> = registry
                .record_type(&source.record_type)
                .map(|record_type| record_type.schema.signature_fields())
                .unwrap_or_default();
            current_signatures.insert(source.record_type.clone(), schema_signature(&fields));
        }
        for (record_type, entry) in &self.manifest.model_schemas {
            current_signatures
                .entry(record_type.clone())
                .or_insert_with(|| entry.signature.clone());
        }

        let (versions, modified) = self.manifest.propagate_schema_versions(&current_signatures);
        for record_type in &modified {
            if !sources.iter().any(|s| &s.record_type == record_type) {
                return Err(PartitionError::SchemaChangeWithoutSource {
                    record_type: record_type.clone(),
                });
            }
        }

        self.pending_versions = versions.clone();
        self.pending_signatures = current_signatures.clone();

        let impacted_names: Vec<String> = self
            .manifest
            .impacted_partitions(&modified)
            .into_iter()
            .map(|p| p.name.clone())
            .collect();

        // A modified record type is never carried over (the carryover pass
        // below skips it), and every non-stale partition holding it is by
        // definition impacted — so every digest hydrated for it at `open()`
        // came from data this run is about to stale out. Drop those digests
        // now so the ingest pass re-admits rows whose content happens to
        // match old, pre-schema-change rows instead of silently dropping
        // them as duplicates of data no future indexer will read again.
        for record_type in &modified {
            self.seen.remove(record_type);
        }

        let rows_carried_over = self.carryover(&impacted_names, &modified)?;
        let rows_ingested = self.ingest(sources, registry)?;
        self.finalize_current()?;

        let mut outcome = RunOutcome {
            rows_carried_over,
            rows_ingested,
            ..Default::default()
        };

        for partition in &self.new_partitions {
            outcome.partitions_created.push(partition.name.clone());
        }
        for name in &impacted_names {
            if let Some(partition) = self.manifest.partitions.iter_mut().find(|p| &p.name == name) {
                partition.stale = true;
                partition.stale_at = Some(now_iso());
                partition.stale_reason = Some("schema-change".to_string());
                partition
                    .replaced_by
                    .extend(self.new_partitions.iter().map(|p| p.name.clone()));
                outcome.partitions_marked_stale.push(name.clone());
            }
        }

        self.manifest.partitions.extend(self.new_partitions);
        for (record_type, version) in versions {
            let signature = current_signatures.get(&record_type).cloned().unwrap_or_default();
            self.manifest
                .model_schemas
                .insert(record_type, crate::manifest::SchemaEntry { signature, version });
        }
        self.manifest.runs.push(RunRecord {
            run_id: self.config.run_id.clone(),
            started_at: now_iso(),
            finished_at: Some(now_iso()),
            partitions_created: outcome.partitions_created.clone(),
            partitions_marked_stale: outcome.partitions_marked_stale.clone(),
        });

        Ok((self.manifest, outcome))
    }
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '_' })
        .collect()
}
