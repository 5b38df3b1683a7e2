use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;

use crate::core::model::{EmbeddingKind, SessionId};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Index operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Vector has {actual} dimensions, index for {kind} expects {expected}")]
    DimensionMismatch {
        kind: EmbeddingKind,
        expected: usize,
        actual: usize,
    },

    #[error("Similarity index unavailable: {message}")]
    Unavailable { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub file_id: String,
    pub score: f64,
}

/// Vector search scoped by session. Queries only ever see vectors inserted
/// under the same session and kind.
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    async fn insert(
        &self,
        session: SessionId,
        file_id: &str,
        vector: &[f32],
        kind: EmbeddingKind,
    ) -> Result<(), IndexError>;

    /// Neighbors with cosine similarity `>= score_threshold`, best first.
    async fn query(
        &self,
        session: SessionId,
        vector: &[f32],
        kind: EmbeddingKind,
        score_threshold: f64,
    ) -> Result<Vec<Neighbor>, IndexError>;

    async fn drop_session(&self, session: SessionId) -> Result<(), IndexError>;
}

/// Cosine similarity; zero vectors are similar to nothing.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[derive(Default)]
struct KindIndex {
    dimensions: usize,
    entries: Vec<(String, Vec<f32>)>,
}

/// Brute-force in-process index.
#[derive(Default)]
pub struct MemorySimilarityIndex {
    sessions: RwLock<HashMap<(SessionId, EmbeddingKind), KindIndex>>,
}

impl MemorySimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .map(|s| {
                let mut ids: Vec<_> = s.keys().map(|(id, _)| *id).collect();
                ids.sort();
                ids.dedup();
                ids.len()
            })
            .unwrap_or(0)
    }

    fn poisoned() -> IndexError {
        IndexError::Unavailable {
            message: "index lock poisoned".to_string(),
        }
    }
}

#[async_trait]
impl SimilarityIndex for MemorySimilarityIndex {
    async fn insert(
        &self,
        session: SessionId,
        file_id: &str,
        vector: &[f32],
        kind: EmbeddingKind,
    ) -> Result<(), IndexError> {
        let mut sessions = self.sessions.write().map_err(|_| Self::poisoned())?;
        let index = sessions.entry((session, kind)).or_default();

        if index.entries.is_empty() {
            index.dimensions = vector.len();
        } else if index.dimensions != vector.len() {
            return Err(IndexError::DimensionMismatch {
                kind,
                expected: index.dimensions,
                actual: vector.len(),
            });
        }

        match index.entries.iter_mut().find(|(id, _)| id == file_id) {
            Some(entry) => entry.1 = vector.to_vec(),
            None => index.entries.push((file_id.to_string(), vector.to_vec())),
        }
        Ok(())
    }

    async fn query(
        &self,
        session: SessionId,
        vector: &[f32],
        kind: EmbeddingKind,
        score_threshold: f64,
    ) -> Result<Vec<Neighbor>, IndexError> {
        let sessions = self.sessions.read().map_err(|_| Self::poisoned())?;
        let Some(index) = sessions.get(&(session, kind)) else {
            return Ok(Vec::new());
        };
        if index.dimensions != vector.len() {
            return Err(IndexError::DimensionMismatch {
                kind,
                expected: index.dimensions,
                actual: vector.len(),
            });
        }

        let mut neighbors: Vec<Neighbor> = index
            .entries
            .iter()
            .map(|(id, v)| Neighbor {
                file_id: id.clone(),
                score: cosine_similarity(vector, v),
            })
            .filter(|n| n.score >= score_threshold)
            .collect();
        neighbors.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.file_id.cmp(&b.file_id))
        });
        Ok(neighbors)
    }

    async fn drop_session(&self, session: SessionId) -> Result<(), IndexError> {
        let mut sessions = self.sessions.write().map_err(|_| Self::poisoned())?;
        sessions.retain(|(id, _), _| *id != session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine_similarity(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_query_applies_threshold() {
        let index = MemorySimilarityIndex::new();
        let session = Uuid::new_v4();
        index.insert(session, "a", &[1.0, 0.0], EmbeddingKind::Text).await.unwrap();
        index.insert(session, "b", &[0.9, 0.1], EmbeddingKind::Text).await.unwrap();
        index.insert(session, "c", &[0.0, 1.0], EmbeddingKind::Text).await.unwrap();

        let neighbors = index
            .query(session, &[1.0, 0.0], EmbeddingKind::Text, 0.85)
            .await
            .unwrap();
        let ids: Vec<_> = neighbors.iter().map(|n| n.file_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let index = MemorySimilarityIndex::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        index.insert(first, "a", &[1.0, 0.0], EmbeddingKind::Image).await.unwrap();

        let neighbors = index
            .query(second, &[1.0, 0.0], EmbeddingKind::Image, 0.0)
            .await
            .unwrap();
        assert!(neighbors.is_empty());

        let other_kind = index
            .query(first, &[1.0, 0.0], EmbeddingKind::Text, 0.0)
            .await
            .unwrap();
        assert!(other_kind.is_empty());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let index = MemorySimilarityIndex::new();
        let session = Uuid::new_v4();
        index.insert(session, "a", &[1.0, 0.0], EmbeddingKind::Text).await.unwrap();
        let result = index.insert(session, "b", &[1.0, 0.0, 0.0], EmbeddingKind::Text).await;
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_drop_session() {
        let index = MemorySimilarityIndex::new();
        let session = Uuid::new_v4();
        index.insert(session, "a", &[1.0], EmbeddingKind::Text).await.unwrap();
        index.insert(session, "b", &[1.0], EmbeddingKind::Image).await.unwrap();
        assert_eq!(index.session_count(), 1);

        index.drop_session(session).await.unwrap();
        assert_eq!(index.session_count(), 0);
    }
}
