//! Resume state (§4.6, §6): one JSON file per collection,
//! `<collection>_resume_state.json`, mapping record type → cursor. Offset
//! mode seeking with a count-mode fallback.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IndexError;

pub const RESUME_STATE_SUFFIX: &str = "_resume_state.json";

/// `{mtime, size}` fingerprint of a source file, used to decide whether a
/// "complete" record type can be skipped entirely on the next run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceSignature {
    pub mtime: i64,
    pub size: u64,
}

impl SourceSignature {
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let meta = fs::metadata(path)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(Self { mtime, size: meta.len() })
    }
}

/// One record type's cursor within a collection's resume-state file (§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
    #[serde(default)]
    pub documents_indexed: u64,
    #[serde(default)]
    pub collection_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_signature: Option<SourceSignature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_offset: Option<u64>,
    #[serde(default)]
    pub row_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fieldnames: Option<Vec<String>>,
}

/// What a fresh run should do before reading the first row of a record
/// type, per §4.5's change-detection rule and §4.6's offset/count modes.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeDecision {
    /// A complete, unchanged run from a prior pass; skip the record type.
    SkipComplete,
    /// Seek the byte stream to `byte_offset` and resume at `row_index`,
    /// reusing `fieldnames` as the header.
    Offset {
        byte_offset: u64,
        row_index: u64,
        fieldnames: Vec<String>,
    },
    /// No usable offset; skip the first `rows` physical rows by counting.
    Count { rows: u64 },
    /// No resume state at all; start from the beginning.
    Fresh,
}

/// The on-disk shape of `<collection>_resume_state.json`: record type →
/// cursor, for every record type this collection has ever indexed.
pub type ResumeStateFile = BTreeMap<String, ResumeState>;

/// Resume-state store for one collection. Every record type sharing a
/// collection shares this one JSON file (§6); reads/writes always go
/// through the whole file so concurrent record types in the same run never
/// clobber each other's entries.
pub struct ResumeStateStore {
    state_dir: PathBuf,
    collection: String,
}

impl ResumeStateStore {
    pub fn new(state_dir: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            collection: collection.into(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.state_dir.join(format!("{}{RESUME_STATE_SUFFIX}", self.collection))
    }

    /// Derive the collection name a resume-state file belongs to, by
    /// stripping [`RESUME_STATE_SUFFIX`] from its file stem (§4.8).
    pub fn collection_name_of(path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        file_name.strip_suffix(RESUME_STATE_SUFFIX).map(str::to_string)
    }

    pub fn load_all(&self) -> Result<ResumeStateFile, IndexError> {
        let path = self.path();
        if !path.exists() {
            return Ok(ResumeStateFile::new());
        }
        let data = fs::read_to_string(&path).map_err(|e| IndexError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        // A state file that fails to parse is treated the same as a fresh
        // start rather than aborting the run (§4.6 degrades, never aborts).
        Ok(serde_json::from_str(&data).unwrap_or_default())
    }

    pub fn load(&self, record_type: &str) -> Result<ResumeState, IndexError> {
        Ok(self.load_all()?.remove(record_type).unwrap_or_default())
    }

    /// Update `record_type`'s entry and rewrite the whole collection file.
    pub fn save(&self, record_type: &str, state: &ResumeState) -> Result<(), IndexError> {
        let mut all = self.load_all()?;
        all.insert(record_type.to_string(), state.clone());
        self.save_all(&all)
    }

    fn save_all(&self, all: &ResumeStateFile) -> Result<(), IndexError> {
        fs::create_dir_all(&self.state_dir).map_err(|e| IndexError::Io {
            path: self.state_dir.display().to_string(),
            source: e,
        })?;
        let path = self.path();
        let data = serde_json::to_vec_pretty(all).expect("resume state always serialisable");
        fs::write(&path, data).map_err(|e| IndexError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Decide how a run should resume `record_type` against `current_source`.
    /// Offset mode takes precedence over count mode (§4.6); a seek failure
    /// is the caller's responsibility to degrade from `Offset` to `Count`.
    pub fn decide(
        &self,
        record_type: &str,
        current_source: &SourceSignature,
    ) -> Result<ResumeDecision, IndexError> {
        let state = self.load(record_type)?;
        if state.complete && state.source_signature == Some(*current_source) {
            return Ok(ResumeDecision::SkipComplete);
        }
        if let (Some(byte_offset), Some(fieldnames)) = (state.file_offset, state.fieldnames.clone()) {
            return Ok(ResumeDecision::Offset {
                byte_offset,
                row_index: state.row_index,
                fieldnames,
            });
        }
        if state.documents_indexed > 0 {
            return Ok(ResumeDecision::Count { rows: state.documents_indexed });
        }
        Ok(ResumeDecision::Fresh)
    }
}
