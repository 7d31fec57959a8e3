//! Single-user HNSW index over usearch.
//!
//! Keys are the caller's `vector_id`s; metadata, tombstones and the
//! pending buffer live one level up in the service. usearch persists
//! through file paths, so the byte round-trip goes through a scratch
//! file.

use crate::error::{Error, Result};
use memvault_core::config::{IndexSettings, SpaceKind};
use tracing::debug;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

/// HNSW index for one user's vectors.
pub struct UserIndex {
    index: usearch::Index,
    settings: IndexSettings,
}

impl UserIndex {
    /// Allocate a fresh index with the given parameters.
    pub fn new(settings: &IndexSettings) -> Result<Self> {
        let options = Self::options(settings);
        let index = usearch::Index::new(&options)
            .map_err(|e| Error::Index(format!("failed to create index: {e}")))?;
        index
            .reserve(settings.max_elements)
            .map_err(|e| Error::Index(format!("failed to reserve capacity: {e}")))?;
        debug!(
            dimension = settings.dimension,
            space = %settings.space,
            capacity = settings.max_elements,
            "Created HNSW index"
        );
        Ok(Self {
            index,
            settings: settings.clone(),
        })
    }

    fn options(settings: &IndexSettings) -> IndexOptions {
        IndexOptions {
            dimensions: settings.dimension,
            metric: match settings.space {
                SpaceKind::Cosine => MetricKind::Cos,
                SpaceKind::L2 => MetricKind::L2sq,
            },
            quantization: ScalarKind::F32,
            connectivity: settings.m,
            expansion_add: settings.ef_construction,
            expansion_search: settings.ef_search,
            multi: false,
        }
    }

    /// Insert a vector under `vector_id`, expanding capacity if needed.
    pub fn insert(&self, vector_id: u32, vector: &[f32]) -> Result<()> {
        if self.index.size() >= self.index.capacity() {
            let new_cap = std::cmp::max(self.index.capacity() * 2, 64);
            self.index
                .reserve(new_cap)
                .map_err(|e| Error::Index(format!("failed to expand capacity: {e}")))?;
        }
        self.index
            .add(vector_id as u64, vector)
            .map_err(|e| Error::Index(format!("failed to add vector {vector_id}: {e}")))?;
        Ok(())
    }

    /// Whether a vector id is present in the structure.
    pub fn contains(&self, vector_id: u32) -> bool {
        self.index.contains(vector_id as u64)
    }

    /// Remove a vector (flush rollback path).
    pub fn remove(&self, vector_id: u32) -> Result<()> {
        self.index
            .remove(vector_id as u64)
            .map_err(|e| Error::Index(format!("failed to remove vector {vector_id}: {e}")))?;
        Ok(())
    }

    /// Top-`count` nearest neighbours, sorted by distance with ties
    /// broken by the lower vector id.
    pub fn search(&self, query: &[f32], count: usize) -> Result<Vec<(u32, f32)>> {
        if count == 0 || self.index.size() == 0 {
            return Ok(Vec::new());
        }
        let matches = self
            .index
            .search(query, count)
            .map_err(|e| Error::Index(format!("search failed: {e}")))?;
        let mut results: Vec<(u32, f32)> = matches
            .keys
            .iter()
            .zip(matches.distances.iter())
            .map(|(key, distance)| (*key as u32, *distance))
            .collect();
        sort_by_distance(&mut results);
        Ok(results)
    }

    /// Number of vectors currently in the structure.
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Whether the structure is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The index settings.
    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Serialize the structure to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = tempfile::NamedTempFile::new()?;
        let path = file
            .path()
            .to_str()
            .ok_or_else(|| Error::Index("invalid scratch path encoding".to_string()))?
            .to_string();
        self.index
            .save(&path)
            .map_err(|e| Error::Index(format!("failed to serialize index: {e}")))?;
        let bytes = std::fs::read(&path)?;
        Ok(bytes)
    }

    /// Restore a structure from bytes produced by [`Self::to_bytes`].
    pub fn from_bytes(bytes: &[u8], settings: &IndexSettings) -> Result<Self> {
        let file = tempfile::NamedTempFile::new()?;
        std::fs::write(file.path(), bytes)?;
        let path = file
            .path()
            .to_str()
            .ok_or_else(|| Error::Index("invalid scratch path encoding".to_string()))?
            .to_string();

        let options = Self::options(settings);
        let index = usearch::Index::new(&options)
            .map_err(|e| Error::Index(format!("failed to create index: {e}")))?;
        index
            .load(&path)
            .map_err(|e| Error::Index(format!("failed to deserialize index: {e}")))?;
        debug!(vectors = index.size(), "Restored HNSW index from snapshot");
        Ok(Self {
            index,
            settings: settings.clone(),
        })
    }
}

/// Sort `(vector_id, distance)` pairs by distance, lower id first on ties.
pub fn sort_by_distance(results: &mut [(u32, f32)]) {
    results.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}

/// Distance between two vectors in the given space (pending-buffer
/// brute force; matches usearch's metric definitions).
pub fn distance(space: SpaceKind, a: &[f32], b: &[f32]) -> f32 {
    match space {
        SpaceKind::Cosine => {
            let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
            let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                1.0 - dot / (norm_a * norm_b)
            }
        }
        SpaceKind::L2 => a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum(),
    }
}

/// Convert a distance into the reported similarity.
pub fn similarity_from_distance(space: SpaceKind, d: f32) -> f32 {
    match space {
        SpaceKind::Cosine => 1.0 - d,
        SpaceKind::L2 => 1.0 / (1.0 + d),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings(dimension: usize) -> IndexSettings {
        IndexSettings {
            dimension,
            max_elements: 16,
            ..IndexSettings::default()
        }
    }

    #[test]
    fn test_insert_and_search() {
        let index = UserIndex::new(&small_settings(4)).unwrap();
        index.insert(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.insert(2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.insert(3, &[1.0, 0.1, 0.0, 0.0]).unwrap();
        assert_eq!(index.len(), 3);

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
    }

    #[test]
    fn test_auto_expand_capacity() {
        let mut settings = small_settings(4);
        settings.max_elements = 2;
        let index = UserIndex::new(&settings).unwrap();
        for i in 0..10u32 {
            index.insert(i, &[i as f32, 1.0, 0.0, 0.0]).unwrap();
        }
        assert_eq!(index.len(), 10);
    }

    #[test]
    fn test_bytes_roundtrip() {
        let settings = small_settings(4);
        let index = UserIndex::new(&settings).unwrap();
        index.insert(7, &[0.0, 0.0, 1.0, 0.0]).unwrap();
        index.insert(9, &[0.0, 0.0, 0.0, 1.0]).unwrap();

        let bytes = index.to_bytes().unwrap();
        let restored = UserIndex::from_bytes(&bytes, &settings).unwrap();
        assert_eq!(restored.len(), 2);

        let results = restored.search(&[0.0, 0.0, 1.0, 0.0], 1).unwrap();
        assert_eq!(results[0].0, 7);
    }

    #[test]
    fn test_remove() {
        let index = UserIndex::new(&small_settings(4)).unwrap();
        index.insert(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.remove(1).unwrap();
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_contains() {
        let index = UserIndex::new(&small_settings(4)).unwrap();
        assert!(!index.contains(1));
        index.insert(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(index.contains(1));
        assert!(!index.contains(2));
        index.remove(1).unwrap();
        assert!(!index.contains(1));
    }

    #[test]
    fn test_cosine_distance() {
        let d = distance(SpaceKind::Cosine, &[1.0, 0.0], &[1.0, 0.0]);
        assert!(d.abs() < 1e-6);
        let d = distance(SpaceKind::Cosine, &[1.0, 0.0], &[0.0, 1.0]);
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_distance_and_similarity() {
        let d = distance(SpaceKind::L2, &[0.0, 0.0], &[3.0, 4.0]);
        assert!((d - 25.0).abs() < 1e-6);
        assert!((similarity_from_distance(SpaceKind::L2, 0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_tie_break_by_lower_id() {
        let mut results = vec![(5u32, 0.5f32), (2, 0.5), (9, 0.1)];
        sort_by_distance(&mut results);
        assert_eq!(results, vec![(9, 0.1), (2, 0.5), (5, 0.5)]);
    }
}
