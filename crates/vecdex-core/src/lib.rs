//! Shared types for the vecdex partitioning and indexing engine: row
//! digests, schema signatures, the registry/vector-store/compactor/
//! token-counter traits consumed as external collaborators, the collection
//! naming strategy, and the configuration error kind every other crate
//! reuses.

pub mod collection_strategy;
pub mod compactor;
pub mod digest;
pub mod error;
pub mod registry;
pub mod token;
pub mod vector_store;

pub use collection_strategy::CollectionStrategy;
pub use compactor::Compactor;
pub use digest::document_id;
pub use error::ConfigError;
pub use registry::{Record, Registry};
pub use token::TokenCounter;
pub use vector_store::{Collection, VectorStoreClient};
