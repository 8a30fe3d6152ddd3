//! In-memory vector index with cosine similarity search.
//!
//! One entry per item. Queries return up to k hits ordered by descending
//! similarity; ties break by descending `created_at`, then ascending id,
//! so results are deterministic.

use std::collections::HashMap;

use crate::eid::Eid;

/// An entry in the vector index.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    /// Creation time of the item, used for tie-breaking
    pub created_at: i64,
    /// The embedding vector
    pub embedding: Vec<f32>,
}

pub struct VectorIndex {
    entries: HashMap<Eid, VectorEntry>,
    /// Expected embedding dimensions
    dimensions: usize,
}

/// Search result from the vector index.
#[derive(Debug, Clone)]
pub struct Hit {
    pub id: Eid,
    /// Cosine similarity score
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace the vector for an item.
    ///
    /// Rejects vectors of the wrong length and vectors with zero norm
    /// (they cannot participate in cosine similarity).
    pub fn upsert(
        &mut self,
        id: Eid,
        created_at: i64,
        embedding: Vec<f32>,
    ) -> Result<(), IndexError> {
        if embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if l2_norm(&embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        self.entries.insert(
            id,
            VectorEntry {
                created_at,
                embedding,
            },
        );

        Ok(())
    }

    pub fn remove(&mut self, id: &Eid) -> Option<VectorEntry> {
        self.entries.remove(id)
    }

    pub fn get(&self, id: &Eid) -> Option<&VectorEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &Eid) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &Eid> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Eid, &VectorEntry)> {
        self.entries.iter()
    }

    /// Top-k most similar entries to the query vector.
    ///
    /// The scan is linear; at tens of thousands of items that is well under
    /// a millisecond and keeps the on-disk format trivial.
    pub fn query(&self, query: &[f32], k: usize) -> Result<Vec<Hit>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut scored: Vec<(&Eid, &VectorEntry, f32)> = self
            .entries
            .iter()
            .map(|(id, entry)| (id, entry, cosine_similarity(query, &entry.embedding, query_norm)))
            .collect();

        scored.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
                .then_with(|| a.0.cmp(b.0))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(id, _, score)| Hit {
                id: id.clone(),
                score,
            })
            .collect())
    }

    /// Bulk load entries, used when hydrating from storage. Entries that
    /// fail validation are skipped rather than aborting the load.
    pub fn bulk_load(&mut self, entries: Vec<(Eid, i64, Vec<f32>)>) {
        for (id, created_at, embedding) in entries {
            let _ = self.upsert(id, created_at, embedding);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity; query norm is precomputed by the caller.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}
