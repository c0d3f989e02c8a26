//! The batch indexer (§4.5): streams one record type's partition CSV into a
//! collection, batching under a joint (document-count, token-budget)
//! constraint, honouring the per-document byte budget via compaction or a
//! hard-trim fallback, and persisting resume state after every commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use vecdex_core::compactor::hard_trim;
use vecdex_core::digest::document_id;
use vecdex_core::registry::{Record, RecordType};
use vecdex_core::vector_store::{Collection, GetRequest, Metadata, UpsertError};
use vecdex_core::{Compactor, TokenCounter};
use vecdex_partition::csv_reader::{CsvSourceConfig, HeaderRowPolicy, RowOutcome, SeriesReader};

use crate::batch_builder::{BatchBuilder, PendingDocument};
use crate::e2e::{E2eRecorder, SampledDocument};
use crate::error::IndexError;
use crate::resume_state::{ResumeDecision, ResumeState, ResumeStateStore, SourceSignature};
use crate::token_truncation::{truncate, TruncationStrategy};

/// Policy constants driving batching and per-document budgets (§4.5).
#[derive(Debug, Clone)]
pub struct IndexingPolicy {
    pub max_docs_per_request: usize,
    pub max_tokens_per_request: usize,
    pub token_safety_limit: usize,
    pub document_size_limit: usize,
    pub embedding_token_limit: usize,
    pub configured_batch_size: usize,
    pub truncation_strategy: TruncationStrategy,
}

impl Default for IndexingPolicy {
    fn default() -> Self {
        Self {
            max_docs_per_request: 2048,
            max_tokens_per_request: 300_000,
            token_safety_limit: 250_000,
            document_size_limit: 16_384,
            embedding_token_limit: 8191,
            configured_batch_size: 100,
            truncation_strategy: TruncationStrategy::Auto,
        }
    }
}

impl IndexingPolicy {
    /// §10.3: `TOKEN_SAFETY_LIMIT <= MAX_TOKENS_PER_REQUEST` is validated at
    /// config-load time; this is the same check surfaced programmatically.
    pub fn is_valid(&self) -> bool {
        self.token_safety_limit <= self.max_tokens_per_request
            && self.max_docs_per_request <= 2048
    }
}

/// One configured record-type source for the indexer: the partition's
/// per-record-type CSV path plus the metadata needed to build documents.
#[derive(Debug, Clone)]
pub struct IndexSourceSpec {
    pub record_type: String,
    pub csv_path: PathBuf,
    pub partition_name: Option<String>,
    pub schema_version: Option<u32>,
    pub truncation_override: Option<TruncationStrategy>,
}

#[derive(Debug, Default)]
pub struct IndexRunReport {
    pub documents_indexed: u64,
    pub documents_dropped_oversize: u64,
    pub rows_skipped_duplicate: u64,
    pub skipped_complete: bool,
}

/// Reservoir-sampler hook (§4.11), kept generic so the indexer doesn't
/// depend on `rand`/`serde` directly for this optional concern.
pub trait SampleSink {
    fn offer(&mut self, row_index: u64, doc_id: &str, text: &str, metadata: &Metadata);
}

impl SampleSink for () {
    fn offer(&mut self, _row_index: u64, _doc_id: &str, _text: &str, _metadata: &Metadata) {}
}

/// Bridges the indexer's [`SampleSink`] hook to the real [`E2eRecorder`]
/// (§4.11), attaching the record type and source path every sample needs.
pub struct E2eSink<'a> {
    pub recorder: &'a mut E2eRecorder,
    pub record_type: String,
    pub source_path: String,
}

impl SampleSink for E2eSink<'_> {
    fn offer(&mut self, row_index: u64, doc_id: &str, text: &str, metadata: &Metadata) {
        self.recorder.offer(SampledDocument {
            row_index,
            doc_id: doc_id.to_string(),
            text: text.to_string(),
            metadata: metadata.clone(),
            record_type: Some(self.record_type.clone()),
            source_path: Some(self.source_path.clone()),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    BatchFull,
    TokenBudget,
    SingleOversizeAlone,
    Final,
}

impl FlushReason {
    fn as_str(self) -> &'static str {
        match self {
            FlushReason::BatchFull => "batch_full",
            FlushReason::TokenBudget => "token_budget",
            FlushReason::SingleOversizeAlone => "single_oversize_alone",
            FlushReason::Final => "final",
        }
    }
}

/// Drives the batch indexer for one record type against one collection.
pub struct BatchIndexer<'a> {
    pub policy: IndexingPolicy,
    pub token_counter: &'a dyn TokenCounter,
    pub compactor: Option<&'a (dyn Compactor + Send + Sync)>,
    pub resume_store: ResumeStateStore,
    pub errors_dir: PathBuf,
}

impl<'a> BatchIndexer<'a> {
    /// Run the indexer for one record type (§4.5). `record_type` supplies
    /// the semantic/keyword field lists the document builder consults;
    /// `collection` is the already-resolved destination (§4.10).
    pub async fn index_record_type(
        &self,
        source: &IndexSourceSpec,
        record_type: &RecordType,
        collection: Arc<dyn Collection>,
        sample_sink: &mut dyn SampleSink,
    ) -> Result<IndexRunReport, IndexError> {
        let mut report = IndexRunReport::default();

        let current_signature = SourceSignature::of_file(&source.csv_path).map_err(|e| IndexError::Io {
            path: source.csv_path.display().to_string(),
            source: e,
        })?;
        let decision = self.resume_store.decide(&source.record_type, &current_signature)?;
        if matches!(decision, ResumeDecision::SkipComplete) {
            info!(record_type = %source.record_type, "indexer: source unchanged and complete, skipping");
            report.skipped_complete = true;
            return Ok(report);
        }

        let mut state = self.resume_store.load(&source.record_type)?;
        state.started = true;
        state.source_signature = None; // cleared until this run completes successfully
        self.resume_store.save(&source.record_type, &state)?;

        let (mut reader, mut skip_remaining, mut documents_indexed) = match &decision {
            ResumeDecision::Offset {
                byte_offset,
                row_index,
                fieldnames,
            } => {
                match SeriesReader::resume_at_offset(
                    source.csv_path.clone(),
                    fieldnames.clone(),
                    *byte_offset,
                    *row_index,
                    b',',
                ) {
                    Ok(reader) => (reader, 0u64, state.documents_indexed),
                    Err(e) => {
                        warn!(record_type = %source.record_type, error = %e, "indexer: offset seek failed, falling back to count-mode from the beginning");
                        state.file_offset = None;
                        state.row_index = 0;
                        let reader = self.open_fresh(&source.csv_path)?;
                        (reader, state.documents_indexed, state.documents_indexed)
                    }
                }
            }
            ResumeDecision::Count { rows } => (self.open_fresh(&source.csv_path)?, *rows, *rows),
            ResumeDecision::Fresh => (self.open_fresh(&source.csv_path)?, 0u64, 0u64),
            ResumeDecision::SkipComplete => unreachable!("handled above"),
        };

        let header = reader.header().to_vec();
        let mut builder = BatchBuilder::new(self.policy.configured_batch_size);
        let mut snapshot_persisted = skip_remaining == 0;

        while let Some(outcome) = reader.next_row().map_err(IndexError::Partition)? {
            let row = match outcome {
                RowOutcome::Row(row) => row,
                RowOutcome::Dropped {
                    first_physical_row,
                    last_physical_row,
                } => {
                    warn!(
                        record_type = %source.record_type,
                        first_physical_row,
                        last_physical_row,
                        "indexer: malformed row dropped, width never matched header"
                    );
                    continue;
                }
            };

            if skip_remaining > 0 {
                skip_remaining -= 1;
                if skip_remaining == 0 && !snapshot_persisted {
                    state.file_offset = Some(reader.cursor_position());
                    state.row_index = reader.row_index();
                    state.fieldnames = Some(header.clone());
                    self.resume_store.save(&source.record_type, &state)?;
                    snapshot_persisted = true;
                }
                continue;
            }

            let record: Record = header
                .iter()
                .zip(row.cells.iter())
                .map(|(name, cell)| (name.clone(), cell.clone()))
                .collect();

            let (mut text, mut metadata) = build_document_text_and_metadata(
                record_type,
                &record,
                source,
            );
            let id = document_id(&source.record_type, &record);

            let original_bytes = text.len();
            if original_bytes > self.policy.document_size_limit {
                text = self
                    .compact_document(&id, &text, &source.record_type, &mut metadata, original_bytes)
                    .await;
            }

            let strategy = source
                .truncation_override
                .unwrap_or(self.policy.truncation_strategy)
                .resolve(&source.record_type, &record_type.semantic_fields, &text);
            let original_tokens = self.token_counter.count(&text);
            if original_tokens > self.policy.embedding_token_limit {
                let outcome = truncate(strategy, &text, self.policy.embedding_token_limit, self.token_counter);
                if outcome.was_truncated {
                    metadata.insert("truncated".to_string(), serde_json::Value::Bool(true));
                    metadata.insert(
                        "original_tokens".to_string(),
                        serde_json::Value::from(original_tokens as u64),
                    );
                    text = outcome.text;
                }
            }
            let tokens = self.token_counter.count(&text);

            sample_sink.offer(reader.row_index(), &id, &text, &metadata);

            if tokens > self.policy.max_tokens_per_request {
                error!(record_type = %source.record_type, id = %id, tokens, "indexer: document exceeds the hard token limit even after truncation, dropping");
                report.documents_dropped_oversize += 1;
                continue;
            }

            let doc = PendingDocument {
                id,
                text,
                metadata,
                tokens,
            };

            if tokens > self.policy.token_safety_limit {
                if !builder.is_empty() {
                    self.flush(
                        &mut builder,
                        collection.as_ref(),
                        source,
                        &mut state,
                        FlushReason::TokenBudget,
                        &mut report,
                        &mut documents_indexed,
                    )
                    .await?;
                }
                builder.push(doc);
                self.flush(
                    &mut builder,
                    collection.as_ref(),
                    source,
                    &mut state,
                    FlushReason::SingleOversizeAlone,
                    &mut report,
                    &mut documents_indexed,
                )
                .await?;
                self.persist_progress(source, &mut state, &header, &reader, documents_indexed)?;
                continue;
            }

            if builder.would_overflow(doc.tokens, self.policy.token_safety_limit) {
                let reason = if builder.pending_len() >= builder.effective_batch_size() {
                    FlushReason::BatchFull
                } else {
                    FlushReason::TokenBudget
                };
                self.flush(
                    &mut builder,
                    collection.as_ref(),
                    source,
                    &mut state,
                    reason,
                    &mut report,
                    &mut documents_indexed,
                )
                .await?;
                self.persist_progress(source, &mut state, &header, &reader, documents_indexed)?;
            }
            builder.push(doc);
        }

        self.flush(
            &mut builder,
            collection.as_ref(),
            source,
            &mut state,
            FlushReason::Final,
            &mut report,
            &mut documents_indexed,
        )
        .await?;

        state.complete = true;
        state.source_signature = Some(current_signature);
        state.documents_indexed = documents_indexed;
        state.collection_count = collection.count().await.unwrap_or(documents_indexed);
        state.indexed_at = Some(Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string());
        self.resume_store.save(&source.record_type, &state)?;

        report.documents_indexed = documents_indexed;
        Ok(report)
    }

    /// Mid-run checkpoint (§4.5: "resume state updates after every successful
    /// flush"): persists the reader's current cursor alongside the documents
    /// committed so far, so a crash between flushes loses at most one batch.
    fn persist_progress(
        &self,
        source: &IndexSourceSpec,
        state: &mut ResumeState,
        header: &[String],
        reader: &SeriesReader,
        documents_indexed: u64,
    ) -> Result<(), IndexError> {
        state.file_offset = Some(reader.cursor_position());
        state.row_index = reader.row_index();
        state.fieldnames = Some(header.to_vec());
        state.documents_indexed = documents_indexed;
        self.resume_store.save(&source.record_type, state)
    }

    fn open_fresh(&self, csv_path: &Path) -> Result<SeriesReader, IndexError> {
        let config = CsvSourceConfig {
            delimiter: b',',
            header_row: HeaderRowPolicy::All,
            malformed_column: None,
        };
        SeriesReader::open(vec![csv_path.to_path_buf()], config).map_err(IndexError::Partition)
    }

    /// §4.5 step 2: compact over-budget text, then hard-trim whatever the
    /// compactor leaves over budget. Always returns text within budget.
    async fn compact_document(
        &self,
        id: &str,
        text: &str,
        record_type: &str,
        metadata: &mut Metadata,
        original_bytes: usize,
    ) -> String {
        metadata.insert(
            "original_bytes".to_string(),
            serde_json::Value::from(original_bytes as u64),
        );
        let compacted = match self.compactor {
            Some(compactor) => match compactor.compact(id, text, Some(record_type), self.policy.document_size_limit).await {
                Ok(outcome) => {
                    metadata.insert("compacted".to_string(), serde_json::Value::Bool(outcome.was_compacted));
                    outcome.text
                }
                Err(e) => {
                    error!(id = %id, error = %e, "indexer: compactor failed, falling back to hard trim");
                    metadata.insert("compacted".to_string(), serde_json::Value::Bool(false));
                    text.to_string()
                }
            },
            None => text.to_string(),
        };
        if compacted.len() > self.policy.document_size_limit {
            let trimmed = hard_trim(&compacted, self.policy.document_size_limit);
            metadata.insert(
                "compaction_fallback".to_string(),
                serde_json::Value::String("hard_trim".to_string()),
            );
            metadata.insert("compacted_bytes".to_string(), serde_json::Value::from(trimmed.len() as u64));
            trimmed
        } else {
            metadata.insert("compacted_bytes".to_string(), serde_json::Value::from(compacted.len() as u64));
            compacted
        }
    }

    /// Flush protocol (§4.5): pre-flush dedup against the collection, retry
    /// on duplicate-id errors, write an error report and propagate on any
    /// other failure, persist resume state on success.
    #[allow(clippy::too_many_arguments)]
    async fn flush(
        &self,
        builder: &mut BatchBuilder,
        collection: &dyn Collection,
        source: &IndexSourceSpec,
        state: &mut ResumeState,
        reason: FlushReason,
        report: &mut IndexRunReport,
        documents_indexed: &mut u64,
    ) -> Result<(), IndexError> {
        let mut batch = builder.drain_fitting(self.policy.token_safety_limit);
        if batch.is_empty() {
            return Ok(());
        }

        loop {
            let ids: Vec<String> = batch.iter().map(|d| d.id.clone()).collect();
            let existing = collection
                .get(GetRequest {
                    ids: Some(ids),
                    ..Default::default()
                })
                .await
                .map(|r| r.ids)
                .unwrap_or_default();
            if existing.is_empty() {
                break;
            }
            let before = batch.len();
            batch.retain(|d| !existing.contains(&d.id));
            report.rows_skipped_duplicate += (before - batch.len()) as u64;
            if batch.len() == before {
                break;
            }
            if batch.is_empty() {
                return Ok(());
            }
        }

        debug!(record_type = %source.record_type, reason = reason.as_str(), count = batch.len(), "indexer: flushing batch");

        self.upsert_with_retry(collection, source, &mut batch).await?;

        *documents_indexed += batch.len() as u64;
        Ok(())
    }

    async fn upsert_with_retry(
        &self,
        collection: &dyn Collection,
        source: &IndexSourceSpec,
        batch: &mut Vec<PendingDocument>,
    ) -> Result<(), IndexError> {
        loop {
            let ids: Vec<String> = batch.iter().map(|d| d.id.clone()).collect();
            let documents: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let metadatas: Vec<Metadata> = batch.iter().map(|d| d.metadata.clone()).collect();
            match collection.upsert(ids, documents, metadatas).await {
                Ok(()) => return Ok(()),
                Err(UpsertError::DuplicateId { ids }) => {
                    warn!(collection = collection.name(), ids = ?ids, "indexer: duplicate ids reported by upsert, retrying without them");
                    let before = batch.len();
                    batch.retain(|d| !ids.contains(&d.id));
                    if batch.is_empty() {
                        return Ok(());
                    }
                    if batch.len() == before {
                        return Err(IndexError::UnresolvableDuplicateIds);
                    }
                }
                Err(UpsertError::Other(e)) => {
                    self.write_error_report(source, collection.name(), "upsert_failure", batch, &e);
                    return Err(IndexError::UpsertFailure {
                        collection: collection.name().to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    fn write_error_report(
        &self,
        source: &IndexSourceSpec,
        collection: &str,
        reason: &str,
        batch: &[PendingDocument],
        error: &anyhow::Error,
    ) {
        #[derive(Serialize)]
        struct ErrorRow<'a> {
            id: &'a str,
            document: &'a str,
            metadata: &'a Metadata,
            token_count: usize,
        }
        #[derive(Serialize)]
        struct ErrorReport<'a> {
            timestamp: String,
            record_type: &'a str,
            collection: &'a str,
            reason: &'a str,
            source_csv: String,
            rows: Vec<ErrorRow<'a>>,
            exception: String,
        }

        let report = ErrorReport {
            timestamp: Utc::now().naive_utc().format("%Y%m%dT%H%M%S%.fZ").to_string(),
            record_type: &source.record_type,
            collection,
            reason,
            source_csv: source.csv_path.display().to_string(),
            rows: batch
                .iter()
                .map(|d| ErrorRow {
                    id: &d.id,
                    document: &d.text,
                    metadata: &d.metadata,
                    token_count: d.tokens,
                })
                .collect(),
            exception: format!("{error:#}"),
        };

        if let Err(e) = std::fs::create_dir_all(&self.errors_dir) {
            error!(error = %e, dir = %self.errors_dir.display(), "indexer: could not create error-report directory");
            return;
        }
        let safe_type = sanitize_filename(&source.record_type);
        let stamp = Utc::now().naive_utc().format("%Y%m%dT%H%M%S%.fZ").to_string();
        let mut path = self.errors_dir.join(format!("{stamp}_{safe_type}.yaml"));
        let mut n = 1;
        while path.exists() {
            path = self.errors_dir.join(format!("{stamp}_{safe_type}_{n}.yaml"));
            n += 1;
        }
        match serde_yaml::to_string(&report) {
            Ok(yaml) => {
                if let Err(e) = std::fs::write(&path, yaml) {
                    error!(error = %e, path = %path.display(), "indexer: failed to write yaml error report");
                }
            }
            Err(e) => {
                warn!(error = %e, "indexer: failed to render yaml error report, falling back to json");
                let json_path = path.with_extension("json");
                if let Ok(data) = serde_json::to_vec_pretty(&report) {
                    let _ = std::fs::write(&json_path, data);
                }
            }
        }
    }
}

/// §3 Document: text = newline-joined non-empty semantic fields, else
/// canonical JSON fallback; metadata = record type, source path, schema
/// version, non-empty keyword field values, partition name.
fn build_document_text_and_metadata(
    record_type: &RecordType,
    record: &Record,
    source: &IndexSourceSpec,
) -> (String, Metadata) {
    let semantic_text: Vec<&str> = record_type
        .semantic_fields
        .iter()
        .filter_map(|f| record.get(f).and_then(|v| v.as_deref()))
        .filter(|v| !v.is_empty())
        .collect();
    let text = if semantic_text.is_empty() {
        serde_json::to_string(record).unwrap_or_default()
    } else {
        semantic_text.join("\n")
    };

    let mut metadata: Metadata = BTreeMap::new();
    metadata.insert(
        "record_type".to_string(),
        serde_json::Value::String(source.record_type.clone()),
    );
    metadata.insert(
        "source_path".to_string(),
        serde_json::Value::String(source.csv_path.display().to_string()),
    );
    if let Some(version) = source.schema_version {
        metadata.insert("schema_version".to_string(), serde_json::Value::from(version));
    }
    if let Some(partition_name) = &source.partition_name {
        metadata.insert(
            "partition_name".to_string(),
            serde_json::Value::String(partition_name.clone()),
        );
    }
    for field in &record_type.keyword_fields {
        if let Some(Some(value)) = record.get(field) {
            if !value.is_empty() {
                metadata.insert(field.clone(), serde_json::Value::String(value.clone()));
            }
        }
    }
    (text, metadata)
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '_' })
        .collect()
}
