use std::path::Path;

use rayon::prelude::*;

use crate::error::{Error, Result};

const F32_SIZE: usize = std::mem::size_of::<f32>();

/// A scored document. `doc_id` is the 1-based row index in the blob.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDocument {
    pub doc_id: u64,
    pub score: f32,
}

/// Flat, exact cosine-similarity index over N document vectors.
///
/// Blob format (no header; dimension D is supplied out of band):
/// - N * D * 4 bytes: f32 LE values in row-major order
///
/// Rows are used as stored. Scores are only cosine similarities if the
/// blob was built from unit-norm vectors.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    /// `data[row * dimension + dim_idx]`
    data: Vec<f32>,
    dimension: usize,
    num_vectors: usize,
}

impl VectorIndex {
    /// Read an embedding blob from disk.
    pub fn open(path: &Path, dimension: usize) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound {
                kind: "embedding blob",
                path: path.to_path_buf(),
            });
        }

        let bytes = std::fs::read(path)?;
        let index = Self::from_bytes(&bytes, dimension)?;

        tracing::info!(
            path = %path.display(),
            num_vectors = index.num_vectors,
            dimension,
            "embedding index loaded"
        );
        Ok(index)
    }

    pub fn from_bytes(bytes: &[u8], dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::ConfigMissing("embedding dimension"));
        }

        let row_bytes = dimension.checked_mul(F32_SIZE).ok_or_else(|| {
            Error::malformed(
                "embedding blob",
                format!("dimension {dimension} is too large for f32 rows"),
            )
        })?;
        if bytes.len() % row_bytes != 0 {
            return Err(Error::malformed(
                "embedding blob",
                format!(
                    "{} bytes is not a multiple of the {row_bytes}-byte row size (dimension {dimension})",
                    bytes.len()
                ),
            ));
        }

        // The blob need not be 4-byte aligned, so copy rather than cast.
        let mut data: Vec<f32> = bytemuck::pod_collect_to_vec(bytes);
        if cfg!(target_endian = "big") {
            for value in &mut data {
                *value = f32::from_le_bytes(value.to_ne_bytes());
            }
        }

        Self::from_flat(data, dimension)
    }

    pub fn from_flat(data: Vec<f32>, dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(Error::ConfigMissing("embedding dimension"));
        }
        if data.len() % dimension != 0 {
            return Err(Error::malformed(
                "embedding matrix",
                format!(
                    "{} values is not a multiple of dimension {dimension}",
                    data.len()
                ),
            ));
        }

        let num_vectors = data.len() / dimension;
        Ok(Self {
            data,
            dimension,
            num_vectors,
        })
    }

    pub fn len(&self) -> usize {
        self.num_vectors
    }

    pub fn is_empty(&self) -> bool {
        self.num_vectors == 0
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// The stored vector for 0-based `row`.
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.dimension)?;
        let end = start.checked_add(self.dimension)?;
        self.data.get(start..end)
    }

    /// Exact top-K search by dot product.
    ///
    /// Results are sorted by descending score, ties broken by ascending
    /// row. Asking for more than N results returns all N.
    pub fn query(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<RankedDocument>> {
        if query.len() != self.dimension {
            return Err(Error::malformed(
                "query vector",
                format!(
                    "length {} does not match index dimension {}",
                    query.len(),
                    self.dimension
                ),
            ));
        }
        if top_k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let scores: Vec<f32> = self
            .data
            .par_chunks_exact(self.dimension)
            .map(|row| dot(row, query))
            .collect();

        let mut ranked: Vec<RankedDocument> = scores
            .into_iter()
            .enumerate()
            .map(|(row, score)| RankedDocument {
                doc_id: row as u64 + 1,
                score,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then(a.doc_id.cmp(&b.doc_id))
        });
        ranked.truncate(top_k);

        Ok(ranked)
    }
}

// Fold from +0.0 so a sum of zero products stays +0.0; total_cmp orders
// -0.0 below +0.0.
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).fold(0.0f32, |acc, (x, y)| acc + x * y)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::error::ErrorKind;

    fn blob(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn three_docs() -> VectorIndex {
        VectorIndex::from_bytes(
            &blob(&[1.0, 0.0, 0.0, 1.0, 0.707, 0.707]),
            2,
        )
        .unwrap()
    }

    #[test]
    fn top_two_of_three() {
        let results = three_docs().query(&[1.0, 0.0], 2).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!((results[0].score - 1.0).abs() < 1e-6);
        assert!((results[1].score - 0.707).abs() < 1e-6);
    }

    #[test]
    fn top_k_larger_than_n_returns_all() {
        let results = three_docs().query(&[0.0, 1.0], 10).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn zero_query_ties_resolve_by_row() {
        let results = three_docs().query(&[0.0, 0.0], 3).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(results.iter().all(|r| r.score == 0.0));
    }

    #[test]
    fn zero_query_against_negative_rows() {
        let index =
            VectorIndex::from_flat(vec![-1.0, -0.5, 0.5, 1.0, -0.25, 0.0], 2)
                .unwrap();
        let results = index.query(&[0.0, 0.0], 3).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn row_matches_itself() {
        let s = 0.5f32.sqrt();
        let index =
            VectorIndex::from_flat(vec![1.0, 0.0, 0.0, 1.0, s, s, -s, s], 2)
                .unwrap();
        for row in 0..index.len() {
            let query = index.row(row).unwrap().to_vec();
            let top = index.query(&query, 1).unwrap();
            assert_eq!(top[0].doc_id, row as u64 + 1);
            assert!((top[0].score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn malformed_blob_length() {
        let err = VectorIndex::from_bytes(&[0u8; 12], 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn oversized_dimension_is_malformed() {
        let err = VectorIndex::from_bytes(&[0u8; 8], usize::MAX / 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);

        let err = VectorIndex::from_bytes(&[], usize::MAX).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn row_out_of_range_is_none() {
        let index = three_docs();
        assert!(index.row(3).is_none());
        assert!(index.row(usize::MAX).is_none());
    }

    #[test]
    fn zero_dimension_is_config_missing() {
        let err = VectorIndex::from_bytes(&[], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
    }

    #[test]
    fn empty_blob_has_no_results() {
        let index = VectorIndex::from_bytes(&[], 4).unwrap();
        assert!(index.is_empty());
        assert!(index.query(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn unaligned_blob_decodes() {
        let mut bytes = vec![0u8];
        bytes.extend(blob(&[1.5, -2.0]));
        let index = VectorIndex::from_bytes(&bytes[1..], 2).unwrap();
        assert_eq!(index.row(0).unwrap(), &[1.5, -2.0]);
    }

    #[test]
    fn wrong_query_length_is_rejected() {
        let err = three_docs().query(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = VectorIndex::open(&tmp.path().join("rag_embeddings.bin"), 2)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn open_reads_blob_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rag_embeddings.bin");
        std::fs::write(&path, blob(&[1.0, 0.0, 0.0, 1.0])).unwrap();

        let index = VectorIndex::open(&path, 2).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.dimension(), 2);
    }

    proptest! {
        #[test]
        fn full_query_returns_every_row_once_sorted(
            values in prop::collection::vec(-1.0f32..1.0, 0..120),
            query in prop::collection::vec(-1.0f32..1.0, 4),
        ) {
            let usable = values.len() - values.len() % 4;
            let index = VectorIndex::from_flat(values[..usable].to_vec(), 4).unwrap();
            let results = index.query(&query, index.len() + 3).unwrap();

            prop_assert_eq!(results.len(), index.len());
            let mut ids: Vec<u64> = results.iter().map(|r| r.doc_id).collect();
            ids.sort_unstable();
            let expected: Vec<u64> = (1..=index.len() as u64).collect();
            prop_assert_eq!(ids, expected);
            for pair in results.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
