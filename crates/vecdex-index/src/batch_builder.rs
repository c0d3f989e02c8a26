//! `BatchBuilder` (§9 design note): a plain value type holding the pending
//! batch for one record type, rather than a closure-based state machine.
//! The indexer owns one builder per record type and calls its methods
//! directly; there is no hidden mutable capture.

use serde_json::Value;

use vecdex_core::vector_store::Metadata;

#[derive(Debug, Clone)]
pub struct PendingDocument {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub tokens: usize,
}

#[derive(Debug, Default)]
pub struct BatchBuilder {
    pending: Vec<PendingDocument>,
    pending_tokens: usize,
    /// Monotonically non-increasing per §4.5's flush protocol: once a flush
    /// shrinks below the configured batch size, later batches never grow
    /// back past that shrunk size.
    effective_batch_size: usize,
}

impl BatchBuilder {
    pub fn new(configured_batch_size: usize) -> Self {
        Self {
            pending: Vec::new(),
            pending_tokens: 0,
            effective_batch_size: configured_batch_size.min(2048),
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.effective_batch_size
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Lower `effective_batch_size` to `n`, never raising it back up.
    pub fn shrink_to(&mut self, n: usize) {
        self.effective_batch_size = self.effective_batch_size.min(n.max(1));
    }

    /// Whether `doc` would push the pending batch over `effective_batch_size`
    /// or over `token_safety_limit`, i.e. whether a flush should happen
    /// before adding it.
    pub fn would_overflow(&self, doc_tokens: usize, token_safety_limit: usize) -> bool {
        self.pending.len() >= self.effective_batch_size
            || self.pending_tokens + doc_tokens > token_safety_limit
    }

    pub fn push(&mut self, doc: PendingDocument) {
        self.pending_tokens += doc.tokens;
        self.pending.push(doc);
    }

    /// Drain the pending batch, shrinking from the tail until its token sum
    /// fits `token_safety_limit` (§4.5 flush protocol). Returns the
    /// documents to send now and, if any had to be deferred, pushes them
    /// back onto a fresh pending buffer.
    pub fn drain_fitting(&mut self, token_safety_limit: usize) -> Vec<PendingDocument> {
        let mut batch = std::mem::take(&mut self.pending);
        self.pending_tokens = 0;
        if batch.is_empty() {
            return batch;
        }
        let mut total: usize = batch.iter().map(|d| d.tokens).sum();
        let mut deferred = Vec::new();
        while batch.len() > 1 && total > token_safety_limit {
            let removed = batch.pop().expect("len > 1");
            total -= removed.tokens;
            deferred.push(removed);
        }
        if !deferred.is_empty() {
            deferred.reverse();
            if batch.len() < self.effective_batch_size {
                self.shrink_to(batch.len());
            }
            for doc in deferred {
                self.pending_tokens += doc.tokens;
                self.pending.push(doc);
            }
        }
        batch
    }

    pub fn as_json_metadata(metadata: &Metadata) -> Value {
        Value::Object(metadata.clone().into_iter().collect())
    }
}
