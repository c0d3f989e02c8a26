//! E2E sampling recorder (§4.11): an optional, purely observational
//! reservoir sampler attached to the batch indexer for auditing what was
//! actually indexed without retaining every document in memory.

use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::warn;

use vecdex_core::vector_store::Metadata;

#[derive(Debug, Clone, Serialize)]
pub struct SampledDocument {
    pub row_index: u64,
    pub doc_id: String,
    pub text: String,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

/// Classic reservoir sampling (Algorithm R): uniform over the full stream
/// regardless of stream length, using only O(capacity) memory.
pub struct E2eRecorder {
    capacity: usize,
    rng: StdRng,
    offered: u64,
    reservoir: Vec<SampledDocument>,
}

impl E2eRecorder {
    /// `capacity == 0` disables sampling entirely; `offer` becomes a no-op.
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity,
            rng: StdRng::seed_from_u64(seed),
            offered: 0,
            reservoir: Vec::with_capacity(capacity),
        }
    }

    pub fn offer(&mut self, mut doc: SampledDocument) {
        if self.capacity == 0 {
            return;
        }
        self.offered += 1;
        if self.reservoir.len() < self.capacity {
            self.reservoir.push(doc);
            return;
        }
        let j = self.rng.gen_range(0..self.offered);
        if (j as usize) < self.capacity {
            std::mem::swap(&mut self.reservoir[j as usize], &mut doc);
        }
    }

    pub fn len(&self) -> usize {
        self.reservoir.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservoir.is_empty()
    }

    /// Serialise the retained samples as one JSON array. Failures are
    /// logged, never propagated — the recorder is observational only.
    pub fn finish(&self, output_path: &Path) {
        let data = match serde_json::to_vec_pretty(&self.reservoir) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "e2e recorder: failed to serialise samples");
                return;
            }
        };
        if let Some(parent) = output_path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(error = %e, path = %output_path.display(), "e2e recorder: failed to create output directory");
                return;
            }
        }
        if let Err(e) = fs::write(output_path, data) {
            warn!(error = %e, path = %output_path.display(), "e2e recorder: failed to write samples");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(row_index: u64) -> SampledDocument {
        SampledDocument {
            row_index,
            doc_id: format!("doc-{row_index}"),
            text: "text".to_string(),
            metadata: Metadata::new(),
            record_type: Some("Table".to_string()),
            source_path: None,
        }
    }

    #[test]
    fn zero_capacity_is_a_no_op() {
        let mut recorder = E2eRecorder::new(0, 1);
        recorder.offer(doc(1));
        assert!(recorder.is_empty());
    }

    #[test]
    fn retains_up_to_capacity_then_stays_bounded() {
        let mut recorder = E2eRecorder::new(3, 42);
        for i in 0..1000 {
            recorder.offer(doc(i));
        }
        assert_eq!(recorder.len(), 3);
    }

    #[test]
    fn finish_writes_a_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = E2eRecorder::new(2, 7);
        recorder.offer(doc(1));
        recorder.offer(doc(2));
        let out = dir.path().join("samples.json");
        recorder.finish(&out);
        let data = std::fs::read_to_string(&out).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
