//! In-process vector store.
//!
//! Brute-force cosine search over points held in a mutex-guarded map.
//! Selected by `qdrant.url: "memory:"`; backs the test suite and offline
//! smoke runs with the exact semantics the Qdrant gateway promises.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{cosine_similarity, Distance, Filter, Point, ScoredPoint, VectorStore};
use crate::error::{Result, SemIndexError};

#[derive(Default)]
struct Collection {
    vector_size: usize,
    points: HashMap<String, Point>,
}

#[derive(Default)]
pub struct MemoryVectorStore {
    collections: Mutex<HashMap<String, Collection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn init_collection(
        &self,
        name: &str,
        vector_size: usize,
        _distance: Distance,
        force: bool,
    ) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        match collections.get(name) {
            Some(existing) if existing.vector_size != vector_size && !force => {
                Err(SemIndexError::VectorDimensionMismatch {
                    collection: name.to_string(),
                    expected: vector_size,
                    actual: existing.vector_size,
                })
            }
            Some(_) if force => {
                collections.insert(
                    name.to_string(),
                    Collection {
                        vector_size,
                        points: HashMap::new(),
                    },
                );
                Ok(())
            }
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    name.to_string(),
                    Collection {
                        vector_size,
                        points: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| SemIndexError::Other(format!("unknown collection: {name}")))?;
        for point in points {
            if point.vector.len() != collection.vector_size {
                return Err(SemIndexError::VectorDimensionMismatch {
                    collection: name.to_string(),
                    expected: collection.vector_size,
                    actual: point.vector.len(),
                });
            }
            collection.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn delete_ids(&self, name: &str, ids: &[String]) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(collection) = collections.get_mut(name) {
            for id in ids {
                collection.points.remove(id);
            }
        }
        Ok(())
    }

    async fn delete_filter(&self, name: &str, filter: &Filter) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        if let Some(collection) = collections.get_mut(name) {
            collection.points.retain(|_, p| !filter.matches(&p.payload));
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.lock().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| SemIndexError::Other(format!("unknown collection: {name}")))?;

        let mut hits: Vec<ScoredPoint> = collection
            .points
            .values()
            .filter(|p| filter.map(|f| f.matches(&p.payload)).unwrap_or(true))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get_points(&self, name: &str, ids: &[String]) -> Result<Vec<Point>> {
        let collections = self.collections.lock().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| SemIndexError::Other(format!("unknown collection: {name}")))?;
        Ok(ids
            .iter()
            .filter_map(|id| collection.points.get(id).cloned())
            .collect())
    }

    async fn count(&self, name: &str, filter: Option<&Filter>) -> Result<usize> {
        let collections = self.collections.lock().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| SemIndexError::Other(format!("unknown collection: {name}")))?;
        Ok(collection
            .points
            .values()
            .filter(|p| filter.map(|f| f.matches(&p.payload)).unwrap_or(true))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(id: &str, vector: Vec<f32>, project: &str) -> Point {
        Point {
            id: id.to_string(),
            vector,
            payload: json!({"project_id": project, "document_id": format!("doc-{id}")}),
        }
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 3, Distance::Cosine, false).await.unwrap();
        store.init_collection("c", 3, Distance::Cosine, false).await.unwrap();
    }

    #[tokio::test]
    async fn dimension_mismatch_is_distinguished() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 3, Distance::Cosine, false).await.unwrap();
        let err = store
            .init_collection("c", 4, Distance::Cosine, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SemIndexError::VectorDimensionMismatch { expected: 4, actual: 3, .. }
        ));
    }

    #[tokio::test]
    async fn force_recreates_with_new_size() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 3, Distance::Cosine, false).await.unwrap();
        store
            .upsert("c", vec![point("a", vec![1.0, 0.0, 0.0], "p")])
            .await
            .unwrap();
        store.init_collection("c", 4, Distance::Cosine, true).await.unwrap();
        assert_eq!(store.count("c", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_replaces_by_id() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 2, Distance::Cosine, false).await.unwrap();
        store.upsert("c", vec![point("a", vec![1.0, 0.0], "p")]).await.unwrap();
        store.upsert("c", vec![point("a", vec![0.0, 1.0], "p")]).await.unwrap();
        assert_eq!(store.count("c", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wrong_size_vector_rejected() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 3, Distance::Cosine, false).await.unwrap();
        let err = store
            .upsert("c", vec![point("a", vec![1.0], "p")])
            .await
            .unwrap_err();
        assert!(matches!(err, SemIndexError::VectorDimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn search_ranks_by_similarity_and_respects_filter() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 2, Distance::Cosine, false).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point("exact", vec![1.0, 0.0], "p1"),
                    point("close", vec![0.9, 0.1], "p1"),
                    point("far", vec![0.0, 1.0], "p1"),
                    point("other-project", vec![1.0, 0.0], "p2"),
                ],
            )
            .await
            .unwrap();

        let filter = Filter::new().eq("project_id", "p1");
        let hits = store
            .search("c", &[1.0, 0.0], 2, Some(&filter))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "exact");
        assert_eq!(hits[1].id, "close");
    }

    #[tokio::test]
    async fn delete_by_filter_removes_matches() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 2, Distance::Cosine, false).await.unwrap();
        store
            .upsert(
                "c",
                vec![point("a", vec![1.0, 0.0], "p1"), point("b", vec![0.0, 1.0], "p2")],
            )
            .await
            .unwrap();

        store
            .delete_filter("c", &Filter::new().eq("project_id", "p1"))
            .await
            .unwrap();
        assert_eq!(store.count("c", None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_points_fetches_payloads() {
        let store = MemoryVectorStore::new();
        store.init_collection("c", 2, Distance::Cosine, false).await.unwrap();
        store.upsert("c", vec![point("a", vec![1.0, 0.0], "p")]).await.unwrap();
        let points = store.get_points("c", &["a".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].payload["project_id"], "p");
    }
}
