//! # ANN Index
//!
//! In-memory approximate nearest-neighbor index over L2-normalized embedding vectors.
//!
//! The underlying `hora` HNSW implementation only exposes a Euclidean-space metric in
//! the version this crate depends on. Because every embedding is mandatorily
//! L2-normalized before it reaches this module (see `RagOrchestrator::resolve_embedding`
//! in [`crate::rag`]), squared Euclidean distance between unit vectors is a strictly
//! monotonic function of cosine similarity: `‖a-b‖² = 2 - 2·cos(a,b)` when `‖a‖=‖b‖=1`.
//! Building the index with `Metric::Euclidean` over normalized vectors therefore produces the same nearest-
//! neighbor ranking as true cosine distance — there is no cosine metric to switch to,
//! and none is needed.
//!
//! `hora`'s `HNSWIndex` freezes its graph at `build()` and does not support adding
//! after that point, so this module keeps its own list of `(id, vector)` entries as
//! the source of truth and rebuilds the HNSW graph lazily, the next time a query is
//! made after an add. The Row Store remains the ultimate system of record — this
//! index is always fully reconstructable from it via [`AnnIndex::warm_rebuild`].

use crate::error::{GhostWireError, GhostWireResult};
use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

struct Inner {
    entries: Vec<(i32, Vec<f32>)>,
    index: Option<HNSWIndex<f32, i32>>,
    dirty: bool,
}

/// Process-global ANN index, guarded by a single mutex. Adds are O(1) amortized;
/// queries trigger a full rebuild only when entries have changed since the last one.
pub struct AnnIndex {
    dimension: usize,
    inner: Mutex<Inner>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    dimension: usize,
    entries: Vec<(i32, Vec<f32>)>,
}

impl AnnIndex {
    pub fn new(dimension: usize) -> Self {
        AnnIndex {
            dimension,
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                index: None,
                dirty: false,
            }),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Add a vector under `id`. Does not rebuild the index; the next `query` will see
    /// it after an implicit rebuild.
    pub fn add(&self, id: i32, vector: &[f32]) -> GhostWireResult<()> {
        if vector.len() != self.dimension {
            return Err(GhostWireError::IndexShape {
                expected: self.dimension,
                found: vector.len(),
            });
        }
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| GhostWireError::index("ann index lock poisoned"))?;
        guard.entries.push((id, vector.to_vec()));
        guard.dirty = true;
        Ok(())
    }

    /// Number of entries currently held (built or not).
    pub fn size(&self) -> usize {
        self.inner.lock().map(|g| g.entries.len()).unwrap_or(0)
    }

    fn rebuild_locked(guard: &mut Inner, dimension: usize) -> GhostWireResult<()> {
        if guard.entries.is_empty() {
            guard.index = None;
            guard.dirty = false;
            return Ok(());
        }
        let mut index = HNSWIndex::new(dimension, &HNSWParams::default());
        for (id, vector) in &guard.entries {
            index
                .add(vector, *id)
                .map_err(|_| GhostWireError::index("failed to add vector during rebuild"))?;
        }
        index
            .build(Metric::Euclidean)
            .map_err(|_| GhostWireError::index("failed to build index"))?;
        guard.index = Some(index);
        guard.dirty = false;
        Ok(())
    }

    /// Query for the `k` nearest ids to `vector`. Triggers a rebuild first if entries
    /// have changed since the last query. Returns ids ordered nearest-first.
    pub fn query(&self, vector: &[f32], k: usize) -> GhostWireResult<Vec<i32>> {
        if vector.len() != self.dimension {
            return Err(GhostWireError::IndexShape {
                expected: self.dimension,
                found: vector.len(),
            });
        }
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| GhostWireError::index("ann index lock poisoned"))?;
        if guard.dirty || guard.index.is_none() {
            Self::rebuild_locked(&mut guard, self.dimension)?;
        }
        Ok(guard
            .index
            .as_ref()
            .map(|idx| idx.search(vector, k))
            .unwrap_or_default())
    }

    /// Replace the index's contents wholesale, e.g. during a warm rebuild from the
    /// Row Store. Marks the index dirty so the next query rebuilds the HNSW graph.
    pub fn warm_rebuild(&self, entries: Vec<(i32, Vec<f32>)>) -> GhostWireResult<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| GhostWireError::index("ann index lock poisoned"))?;
        guard.entries = entries;
        guard.index = None;
        guard.dirty = true;
        Ok(())
    }

    /// Serialize the current entry set to a single opaque file (bincode-encoded).
    /// Does not serialize the built HNSW graph itself; restore rebuilds it from the
    /// entries, which is cheap relative to the I/O of a large binary graph dump.
    pub fn snapshot(&self, path: &Path) -> GhostWireResult<()> {
        let guard = self
            .inner
            .lock()
            .map_err(|_| GhostWireError::index("ann index lock poisoned"))?;
        let snap = SnapshotFile {
            dimension: self.dimension,
            entries: guard.entries.clone(),
        };
        let bytes = bincode::serde::encode_to_vec(&snap, bincode::config::standard())
            .map_err(|e| GhostWireError::storage(format!("snapshot encode failed: {e}")))?;
        fs::write(path, bytes)
            .map_err(|e| GhostWireError::storage(format!("snapshot write failed: {e}")))?;
        Ok(())
    }

    /// Load a previously-written snapshot. Verifies the stored dimension matches this
    /// index's configured dimension; a mismatch is an [`GhostWireError::IndexShape`]
    /// error so the caller can fall back to a warm rebuild.
    pub fn restore(&self, path: &Path) -> GhostWireResult<()> {
        let bytes = fs::read(path)
            .map_err(|e| GhostWireError::storage(format!("snapshot read failed: {e}")))?;
        let (snap, _): (SnapshotFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| GhostWireError::storage(format!("snapshot decode failed: {e}")))?;
        if snap.dimension != self.dimension {
            return Err(GhostWireError::IndexShape {
                expected: self.dimension,
                found: snap.dimension,
            });
        }
        self.warm_rebuild(snap.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        v.iter().map(|x| x / norm).collect()
    }

    #[test]
    fn query_before_any_add_returns_empty() {
        let idx = AnnIndex::new(4);
        let q = idx.query(&unit(vec![1.0, 0.0, 0.0, 0.0]), 3).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn nearest_neighbor_is_the_closest_vector() {
        let idx = AnnIndex::new(4);
        idx.add(1, &unit(vec![1.0, 0.0, 0.0, 0.0])).unwrap();
        idx.add(2, &unit(vec![0.0, 1.0, 0.0, 0.0])).unwrap();
        idx.add(3, &unit(vec![0.0, 0.0, 1.0, 0.0])).unwrap();

        let results = idx.query(&unit(vec![0.9, 0.1, 0.0, 0.0]), 1).unwrap();
        assert_eq!(results, vec![1]);
    }

    #[test]
    fn add_rejects_mismatched_dimension() {
        let idx = AnnIndex::new(4);
        let err = idx.add(1, &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, GhostWireError::IndexShape { .. }));
    }

    #[test]
    fn size_reflects_added_entries() {
        let idx = AnnIndex::new(3);
        assert_eq!(idx.size(), 0);
        idx.add(1, &unit(vec![1.0, 0.0, 0.0])).unwrap();
        idx.add(2, &unit(vec![0.0, 1.0, 0.0])).unwrap();
        assert_eq!(idx.size(), 2);
    }

    #[test]
    fn snapshot_and_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.snap");

        let idx = AnnIndex::new(3);
        idx.add(1, &unit(vec![1.0, 0.0, 0.0])).unwrap();
        idx.add(2, &unit(vec![0.0, 1.0, 0.0])).unwrap();
        idx.snapshot(&path).unwrap();

        let restored = AnnIndex::new(3);
        restored.restore(&path).unwrap();
        assert_eq!(restored.size(), 2);

        let results = restored.query(&unit(vec![1.0, 0.0, 0.0]), 1).unwrap();
        assert_eq!(results, vec![1]);
    }

    #[test]
    fn restore_rejects_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ann.snap");

        let idx = AnnIndex::new(3);
        idx.add(1, &unit(vec![1.0, 0.0, 0.0])).unwrap();
        idx.snapshot(&path).unwrap();

        let restored = AnnIndex::new(4);
        let err = restored.restore(&path).unwrap_err();
        assert!(matches!(err, GhostWireError::IndexShape { .. }));
    }

    #[test]
    fn warm_rebuild_replaces_entries_wholesale() {
        let idx = AnnIndex::new(2);
        idx.add(1, &unit(vec![1.0, 0.0])).unwrap();
        assert_eq!(idx.size(), 1);

        idx.warm_rebuild(vec![(2, unit(vec![0.0, 1.0])), (3, unit(vec![1.0, 1.0]))])
            .unwrap();
        assert_eq!(idx.size(), 2);
        let results = idx.query(&unit(vec![0.0, 1.0]), 1).unwrap();
        assert_eq!(results, vec![2]);
    }
}
