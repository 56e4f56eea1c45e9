//! Embedding encoding and cosine similarity.
//!
//! # Responsibility
//! - Convert embeddings to and from their persisted blob form.
//! - Compare embeddings by cosine similarity.
//!
//! # Invariants
//! - Blob layout is 8 bytes per dimension, little-endian `f64`, and round
//!   trips bit-for-bit.
//! - `cosine_similarity` never fails; degenerate input yields `0.0`.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

const BYTES_PER_DIMENSION: usize = std::mem::size_of::<f64>();

/// Embedding vector tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f64>,
    pub model_id: String,
}

impl Embedding {
    pub fn new(values: Vec<f64>, model_id: impl Into<String>) -> Self {
        Self {
            values,
            model_id: model_id.into(),
        }
    }

    /// Returns whether this embedding is comparable under `active_model_id`.
    pub fn is_current(&self, active_model_id: &str) -> bool {
        !self.values.is_empty() && self.model_id == active_model_id
    }

    pub fn to_blob(&self) -> Vec<u8> {
        encode_embedding(&self.values)
    }
}

/// Blob length is not a whole number of dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobDecodeError {
    pub len: usize,
}

impl Display for BlobDecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "embedding blob length {} is not a multiple of {BYTES_PER_DIMENSION}",
            self.len
        )
    }
}

impl Error for BlobDecodeError {}

/// Encodes an embedding into its persisted blob form.
pub fn encode_embedding(values: &[f64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * BYTES_PER_DIMENSION);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decodes a persisted embedding blob.
pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f64>, BlobDecodeError> {
    if blob.len() % BYTES_PER_DIMENSION != 0 {
        return Err(BlobDecodeError { len: blob.len() });
    }

    let mut values = Vec::with_capacity(blob.len() / BYTES_PER_DIMENSION);
    for chunk in blob.chunks_exact(BYTES_PER_DIMENSION) {
        let mut raw = [0_u8; BYTES_PER_DIMENSION];
        raw.copy_from_slice(chunk);
        values.push(f64::from_le_bytes(raw));
    }
    Ok(values)
}

/// Cosine similarity in `[-1, 1]`.
///
/// Returns `0.0` when either vector is empty, the lengths differ, or either
/// has zero magnitude. A genuinely orthogonal pair also yields `0.0`, so
/// callers must read zero as "no signal".
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (Some(scale_a), Some(scale_b)) = (max_magnitude(a), max_magnitude(b)) else {
        return 0.0;
    };

    // Both sides are scaled into [-1, 1] first so squares neither underflow
    // nor overflow; each scaled norm is then at least 1.
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x / scale_a, y / scale_b);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }

    let score = dot / denom;
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(-1.0, 1.0)
}

/// Largest absolute component, or `None` for an all-zero or non-finite
/// vector.
fn max_magnitude(values: &[f64]) -> Option<f64> {
    let max = values.iter().fold(0.0_f64, |acc, value| acc.max(value.abs()));
    (max > 0.0 && max.is_finite()).then_some(max)
}

#[cfg(test)]
mod tests {
    use super::{cosine_similarity, decode_embedding, encode_embedding, Embedding};

    #[test]
    fn blob_round_trip_is_bit_exact() {
        let values = vec![
            0.0,
            -0.0,
            -1.5,
            f64::MIN_POSITIVE / 4.0,
            1e10,
            -3.25e300,
            f64::MAX,
            f64::MIN,
        ];
        let decoded = decode_embedding(&encode_embedding(&values)).unwrap();
        assert_eq!(decoded.len(), values.len());
        for (left, right) in values.iter().zip(decoded.iter()) {
            assert_eq!(left.to_bits(), right.to_bits());
        }
    }

    #[test]
    fn blob_uses_eight_little_endian_bytes_per_dimension() {
        let bytes = encode_embedding(&[1.0]);
        assert_eq!(bytes, 1.0_f64.to_le_bytes().to_vec());
        assert_eq!(encode_embedding(&[1.0, 2.0, 3.0]).len(), 24);
    }

    #[test]
    fn decode_rejects_truncated_blob() {
        let err = decode_embedding(&[0_u8; 9]).unwrap_err();
        assert_eq!(err.len, 9);
        assert!(decode_embedding(&[]).unwrap().is_empty());
    }

    #[test]
    fn cosine_is_symmetric_and_bounded() {
        let a = [0.3, -1.2, 4.0];
        let b = [2.0, 0.5, -0.1];
        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        assert_eq!(ab, ba);
        assert!((-1.0..=1.0).contains(&ab));
    }

    #[test]
    fn cosine_of_vector_with_itself_is_one() {
        let a = [0.1, 0.2, 0.3, 0.4];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-12);
        let negated = [-0.1, -0.2, -0.3, -0.4];
        assert!((cosine_similarity(&a, &negated) + 1.0).abs() < 1e-12);

        for tiny_or_huge in [[1e-170, 2e-170], [1e200, 2e200], [5e-320, 1e-320]] {
            let score = cosine_similarity(&tiny_or_huge, &tiny_or_huge);
            assert!((score - 1.0).abs() < 1e-12, "{tiny_or_huge:?} -> {score}");
        }
        assert!((cosine_similarity(&[1e200, 0.0], &[1e-170, 0.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn cosine_degenerate_inputs_are_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn embedding_is_stale_under_another_model() {
        let embedding = Embedding::new(vec![1.0, 0.0], "model-a");
        assert!(embedding.is_current("model-a"));
        assert!(!embedding.is_current("model-b"));
        assert!(!Embedding::new(Vec::new(), "model-a").is_current("model-a"));
    }
}
