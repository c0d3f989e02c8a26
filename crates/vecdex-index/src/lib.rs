//! The indexing half of the workspace: batching documents from a
//! partition's CSVs into a vector store, resuming interrupted runs, query
//! config/fan-out for reading them back, and the drop workflow for
//! retracting what was indexed.

pub mod batch_builder;
pub mod drop;
pub mod e2e;
pub mod error;
pub mod http_store;
pub mod indexer;
pub mod query_client;
pub mod query_config;
pub mod resume_state;
pub mod token_truncation;

pub use batch_builder::{BatchBuilder, PendingDocument};
pub use drop::{apply as apply_drop, plan as plan_drop, ApplyOptions, DropPlan, DropRequest, DropResult};
pub use e2e::{E2eRecorder, SampledDocument};
pub use error::{DropError, IndexError, QueryError};
pub use http_store::HttpVectorStoreClient;
pub use indexer::{BatchIndexer, E2eSink, IndexRunReport, IndexSourceSpec, IndexingPolicy, SampleSink};
pub use query_client::{MergedMatch, MergedQueryResult, QueryClient, StoreAddress};
pub use query_config::{build as build_query_config, QueryConfig, RecordTypeEntry};
pub use resume_state::{ResumeDecision, ResumeState, ResumeStateFile, ResumeStateStore, SourceSignature};
pub use token_truncation::{truncate, TruncationOutcome, TruncationStrategy};
