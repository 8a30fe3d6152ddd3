//! High-level semantic index service.
//!
//! Owns the embedder, the in-memory vector index, and its persistent form,
//! and serialises upsert/remove against query behind one lock. Initialisation
//! is lazy so a daemon start does not block on model loading.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::eid::Eid;
use crate::semantic::embeddings::{Embedder, EmbeddingError};
use crate::semantic::index::{Hit, IndexError, VectorIndex};
use crate::semantic::storage::{VectorStorage, VectorStorageError};
use crate::semantic::MIN_QUERY_LEN;

#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Service not initialized")]
    NotInitialized,

    #[error("Internal error: {0}")]
    Internal(String),
}

struct SemanticState {
    index: VectorIndex,
    storage: VectorStorage,
}

pub struct SemanticService {
    embedder: Arc<dyn Embedder>,
    vectors_path: PathBuf,
    /// Lazily-initialized state. Uses Mutex<Option<_>> instead of OnceLock
    /// because initialisation is fallible.
    state: Mutex<Option<SemanticState>>,
}

impl SemanticService {
    pub fn new(embedder: Arc<dyn Embedder>, vectors_path: PathBuf) -> Self {
        Self {
            embedder,
            vectors_path,
            state: Mutex::new(None),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed the item's searchable text and store the vector, replacing any
    /// previous one. The store file is rewritten after the change.
    pub fn upsert(&self, id: &Eid, created_at: i64, text: &str) -> Result<(), SemanticError> {
        let embedding = self.embedder.embed(text)?;

        self.with_state(|state, embedder| {
            state.index.upsert(id.clone(), created_at, embedding)?;
            state.storage.save(&state.index, &embedder.model_id_hash())?;
            Ok(())
        })?
    }

    /// Remove an item's vector. Returns whether anything was removed.
    pub fn remove(&self, id: &Eid) -> Result<bool, SemanticError> {
        self.with_state(|state, embedder| {
            let removed = state.index.remove(id).is_some();
            if removed {
                state.storage.save(&state.index, &embedder.model_id_hash())?;
            }
            Ok(removed)
        })?
    }

    /// Top-k most similar item ids for a query string.
    ///
    /// Queries below the minimum length and queries against an empty index
    /// return empty without calling the embedder.
    pub fn query(&self, text: &str, k: usize) -> Result<Vec<Hit>, SemanticError> {
        if text.trim().chars().count() < MIN_QUERY_LEN {
            return Ok(Vec::new());
        }
        if self.size() == 0 {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(text)?;

        self.with_state(|state, _| Ok(state.index.query(&embedding, k)?))?
    }

    /// Number of stored vectors. Zero when uninitialised.
    pub fn size(&self) -> usize {
        // initialise so restarts report the persisted count
        if self.ensure_initialized().is_err() {
            return 0;
        }
        self.state
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|s| s.index.len()))
            .unwrap_or(0)
    }

    /// Ids currently present in the index; the startup backfill diffs this
    /// against the item index.
    pub fn ids(&self) -> Result<Vec<Eid>, SemanticError> {
        self.with_state(|state, _| Ok(state.index.ids().cloned().collect()))?
    }

    /// Expected vector length, observable to integrity checks.
    pub fn dimensions(&self) -> Result<usize, SemanticError> {
        self.with_state(|state, _| Ok(state.index.dimensions()))?
    }

    /// Force initialization. Normally happens lazily on first use.
    pub fn initialize(&self) -> Result<(), SemanticError> {
        self.ensure_initialized()
    }

    fn with_state<F, R>(&self, f: F) -> Result<Result<R, SemanticError>, SemanticError>
    where
        F: FnOnce(&mut SemanticState, &Arc<dyn Embedder>) -> Result<R, SemanticError>,
    {
        self.ensure_initialized()?;

        let mut guard = self
            .state
            .lock()
            .map_err(|e| SemanticError::Internal(format!("Lock poisoned: {}", e)))?;

        let state = guard.as_mut().ok_or(SemanticError::NotInitialized)?;
        Ok(f(state, &self.embedder))
    }

    fn ensure_initialized(&self) -> Result<(), SemanticError> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| SemanticError::Internal(format!("Lock poisoned: {}", e)))?;

        if guard.is_none() {
            *guard = Some(self.do_init()?);
        }

        Ok(())
    }

    fn do_init(&self) -> Result<SemanticState, SemanticError> {
        let dimensions = self.embedder.dimensions();
        let model_id = self.embedder.model_id_hash();

        let storage = VectorStorage::new(self.vectors_path.clone());

        let index = if storage.exists() {
            match storage.load(&model_id, dimensions) {
                Ok(idx) => {
                    log::info!("loaded {} vectors from storage", idx.len());
                    idx
                }
                Err(VectorStorageError::Io(err)) => {
                    log::error!("failed to read vector storage: {err}");
                    return Err(VectorStorageError::Io(err).into());
                }
                // vectors are derivable; the startup backfill re-embeds
                Err(err) => {
                    log::warn!("discarding vector storage ({err}), starting fresh");
                    VectorIndex::new(dimensions)
                }
            }
        } else {
            log::info!("no existing vector index, starting fresh");
            VectorIndex::new(dimensions)
        };

        Ok(SemanticState { index, storage })
    }
}
