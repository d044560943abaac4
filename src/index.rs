//! Vector index contract for k-nearest-neighbor retrieval.
//!
//! The index is an external collaborator (an Atlas-style vector search or
//! equivalent); this module pins the contract the engine assumes of it and
//! provides an in-memory reference implementation used by tests and small
//! deployments. The engine itself never computes similarities; that is the
//! index's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// One scored retrieval hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub doc_id: String,
    /// Cosine similarity mapped into [0,1]
    pub similarity: f64,
}

/// Optional metadata filter for a kNN query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnnFilter {
    /// Restrict to this customer's transactions
    pub customer_id: Option<String>,
    /// Restrict to this merchant category
    pub merchant_category: Option<String>,
    /// Never return this document (the query transaction itself)
    pub exclude_doc_id: Option<String>,
}

impl KnnFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.merchant_category = Some(category.into());
        self
    }

    pub fn exclude(mut self, doc_id: impl Into<String>) -> Self {
        self.exclude_doc_id = Some(doc_id.into());
        self
    }
}

/// k-nearest-neighbor lookup over transaction vectors.
///
/// Results are eventually consistent: very recent inserts may be missing.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `k` hits ordered by descending similarity.
    ///
    /// `num_candidates` sizes the approximate-search candidate pool; exact
    /// indexes may ignore it.
    async fn knn(
        &self,
        query: &[f32],
        k: usize,
        num_candidates: usize,
        filter: Option<&KnnFilter>,
    ) -> Result<Vec<ScoredId>>;

    /// The dimension the index was built with.
    fn dimension(&self) -> usize;

    /// Number of indexed documents.
    async fn population(&self) -> Result<u64>;
}

/// Check a query vector against the index dimension.
pub fn ensure_dimension(index: &dyn VectorIndex, query: &[f32]) -> Result<()> {
    if query.len() != index.dimension() {
        return Err(Error::index_skew(index.dimension(), query.len()));
    }
    Ok(())
}

/// Metadata attached to an indexed vector, used by `KnnFilter`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    pub customer_id: String,
    pub merchant_category: String,
}

struct IndexedDoc {
    vector: Vec<f32>,
    meta: DocMeta,
}

/// In-memory cosine index.
pub struct InMemoryVectorIndex {
    dimension: usize,
    docs: RwLock<HashMap<String, IndexedDoc>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a document vector.
    pub async fn insert(&self, doc_id: impl Into<String>, vector: Vec<f32>, meta: DocMeta) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::index_skew(self.dimension, vector.len()));
        }
        let mut docs = self.docs.write().await;
        docs.insert(doc_id.into(), IndexedDoc { vector, meta });
        Ok(())
    }

    fn cosine(a: &[f32], b: &[f32]) -> f64 {
        let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
        let na: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        let nb: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        dot / (na * nb)
    }

    fn matches(meta: &DocMeta, doc_id: &str, filter: Option<&KnnFilter>) -> bool {
        let Some(filter) = filter else { return true };
        if let Some(ref customer) = filter.customer_id {
            if &meta.customer_id != customer {
                return false;
            }
        }
        if let Some(ref category) = filter.merchant_category {
            if &meta.merchant_category != category {
                return false;
            }
        }
        if let Some(ref excluded) = filter.exclude_doc_id {
            if doc_id == excluded {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    // Exact scan; num_candidates has no effect here.
    async fn knn(
        &self,
        query: &[f32],
        k: usize,
        _num_candidates: usize,
        filter: Option<&KnnFilter>,
    ) -> Result<Vec<ScoredId>> {
        if query.len() != self.dimension {
            return Err(Error::index_skew(self.dimension, query.len()));
        }

        let docs = self.docs.read().await;
        let mut hits: Vec<ScoredId> = docs
            .iter()
            .filter(|(doc_id, doc)| Self::matches(&doc.meta, doc_id, filter))
            .map(|(doc_id, doc)| ScoredId {
                doc_id: doc_id.clone(),
                // Map cosine [-1,1] into [0,1].
                similarity: (Self::cosine(query, &doc.vector) + 1.0) / 2.0,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn population(&self) -> Result<u64> {
        Ok(self.docs.read().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn unit(values: &[f32]) -> Vec<f32> {
        values.to_vec()
    }

    #[tokio::test]
    async fn test_knn_orders_by_similarity() {
        let index = InMemoryVectorIndex::new(3);
        index
            .insert("near", unit(&[1.0, 0.1, 0.0]), DocMeta::default())
            .await
            .unwrap();
        index
            .insert("far", unit(&[0.0, 1.0, 0.0]), DocMeta::default())
            .await
            .unwrap();

        let hits = index.knn(&[1.0, 0.0, 0.0], 2, 100, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "near");
        assert!(hits[0].similarity > hits[1].similarity);
        assert!((0.0..=1.0).contains(&hits[0].similarity));
    }

    #[tokio::test]
    async fn test_knn_respects_filters() {
        let index = InMemoryVectorIndex::new(2);
        index
            .insert(
                "a",
                unit(&[1.0, 0.0]),
                DocMeta {
                    customer_id: "C1".to_string(),
                    merchant_category: "grocery".to_string(),
                },
            )
            .await
            .unwrap();
        index
            .insert(
                "b",
                unit(&[1.0, 0.0]),
                DocMeta {
                    customer_id: "C2".to_string(),
                    merchant_category: "grocery".to_string(),
                },
            )
            .await
            .unwrap();

        let filter = KnnFilter::new().customer("C1");
        let hits = index.knn(&[1.0, 0.0], 10, 100, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "a");

        let filter = KnnFilter::new().exclude("a");
        let hits = index.knn(&[1.0, 0.0], 10, 100, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "b");
    }

    #[tokio::test]
    async fn test_knn_empty_index() {
        let index = InMemoryVectorIndex::new(2);
        let hits = index.knn(&[1.0, 0.0], 5, 100, None).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(index.population().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dimension_skew_rejected() {
        let index = InMemoryVectorIndex::new(3);

        let err = index.insert("x", vec![1.0, 0.0], DocMeta::default()).await.unwrap_err();
        assert!(matches!(err, Error::IndexSkew { expected: 3, actual: 2 }));

        let err = index.knn(&[1.0, 0.0], 5, 100, None).await.unwrap_err();
        assert!(matches!(err, Error::IndexSkew { .. }));
        assert!(ensure_dimension(&index, &[0.0, 0.0]).is_err());
        assert!(ensure_dimension(&index, &[0.0, 0.0, 0.0]).is_ok());
    }

    #[tokio::test]
    async fn test_knn_ties_break_deterministically() {
        let index = InMemoryVectorIndex::new(2);
        index.insert("b", unit(&[1.0, 0.0]), DocMeta::default()).await.unwrap();
        index.insert("a", unit(&[1.0, 0.0]), DocMeta::default()).await.unwrap();

        let hits = index.knn(&[1.0, 0.0], 2, 100, None).await.unwrap();
        assert_eq!(hits[0].doc_id, "a");
        assert_eq!(hits[1].doc_id, "b");
    }
}
