//! Embedding blobs and in-process similarity ranking

use crate::error::{MemoryError, Result};

/// Encode an embedding for the `embedding` BLOB column
pub fn encode_vector(embedding: &[f32]) -> Result<Vec<u8>> {
    bincode::serialize(embedding).map_err(|e| MemoryError::Serialization(e.to_string()))
}

/// Decode an embedding previously written by [`encode_vector`]
pub fn decode_vector(data: &[u8]) -> Result<Vec<f32>> {
    bincode::deserialize(data).map_err(|e| MemoryError::Serialization(e.to_string()))
}

/// Compute cosine similarity between two vectors.
///
/// Mismatched dimensions and zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (dot, sq_a, sq_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, sq_a, sq_b), (x, y)| {
            (dot + x * y, sq_a + x * x, sq_b + y * y)
        });
    if sq_a == 0.0 || sq_b == 0.0 {
        return 0.0;
    }
    dot / (sq_a.sqrt() * sq_b.sqrt())
}

/// Keep the `k` best `(item, score)` pairs, highest score first.
///
/// Equal scores keep their input order, so callers feed candidates in id order.
pub fn top_k<T>(mut scored: Vec<(T, f32)>, k: usize) -> Vec<(T, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_handles_degenerate_inputs() {
        let x = [1.0, 0.0, 0.0];
        assert!((cosine_similarity(&x, &[2.0, 0.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&x, &[0.0, 3.0, 0.0]).abs() < 1e-6);
        assert!((cosine_similarity(&x, &[-1.0, 0.0, 0.0]) + 1.0).abs() < 1e-6);

        assert_eq!(cosine_similarity(&x, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&x, &[0.0; 3]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn blob_survives_storage_encoding() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v).unwrap()).unwrap(), v);
        assert!(decode_vector(&[1, 2]).is_err());
    }

    #[test]
    fn top_k_is_stable_on_ties() {
        let ranked = top_k(vec![("a", 0.5), ("b", 0.9), ("c", 0.5), ("d", 0.1)], 3);
        let ids: Vec<_> = ranked.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
