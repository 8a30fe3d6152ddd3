//! Semantic search infrastructure for vault items.
//!
//! One embedding vector per item, cosine-similarity top-k retrieval, and a
//! durable binary store for the vectors.
//!
//! # Architecture
//!
//! - `embeddings`: the `Embedder` seam and the fastembed-backed implementation
//! - `index`: in-memory vector index with cosine similarity search
//! - `storage`: binary file I/O for embeddings.bin persistence
//! - `preprocess`: searchable-text composition for embedding input
//! - `service`: high-level semantic index service

pub mod embeddings;
mod index;
mod preprocess;
mod service;
mod storage;

pub use embeddings::{DisabledEmbedder, Embedder, EmbeddingError, FastembedEmbedder};
pub use index::{Hit, IndexError, VectorEntry, VectorIndex};
pub use preprocess::{compose_searchable_text, SearchableParts};
pub use service::{SemanticError, SemanticService};
pub use storage::{VectorStorage, VectorStorageError};

/// Default embedding model name (384-dim, small enough to ship everywhere)
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Queries shorter than this return empty without touching the embedder
pub const MIN_QUERY_LEN: usize = 2;
