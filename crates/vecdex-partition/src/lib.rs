//! The partitioning engine (§2 items 1-5, §4.1-§4.4): CSV ingestion,
//! malformed-row recovery, schema versioning and the manifest-backed
//! partition writer.

pub mod csv_reader;
pub mod error;
pub mod manifest;
pub mod partition_writer;
pub mod source_template;

pub use csv_reader::{CsvSourceConfig, HeaderRowPolicy, Row, RowOutcome, SeriesReader, StreamCursor};
pub use error::PartitionError;
pub use manifest::{Manifest, ModelPartitionEntry, PartitionRecord, RunRecord, SchemaEntry};
pub use partition_writer::{PartitionWriter, PartitionWriterConfig, RunOutcome, SourceSpec};
