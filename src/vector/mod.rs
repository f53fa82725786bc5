//! Vector store gateway.
//!
//! The only part of the system that talks to the vector database. Two
//! implementations of [`VectorStore`]:
//!
//! - [`qdrant::QdrantGateway`] — Qdrant over its REST API.
//! - [`memory::MemoryVectorStore`] — in-process brute-force store selected
//!   by `qdrant.url: "memory:"`; used by the test suite and offline smoke
//!   runs.
//!
//! Payload filters are built from a small typed DSL ([`Filter`]) supporting
//! equality, in-set membership, and nested-field equality, and serialized
//! to the store's native representation inside each gateway.

pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::QdrantConfig;
use crate::error::Result;

/// One stored point: id, vector, payload.
#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search hit.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

/// Typed payload filter: all conditions must hold.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

/// One filter condition. Field paths use dots for nesting
/// (`content_tags.strategy`).
#[derive(Debug, Clone)]
pub enum Condition {
    /// Field equals the value.
    Eq(String, Value),
    /// Field value is one of the given values.
    In(String, Vec<Value>),
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.to_string(), value.into()));
        self
    }

    pub fn any_of(mut self, field: &str, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In(field.to_string(), values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluate against a payload (used by the memory store and by
    /// post-filtering).
    pub fn matches(&self, payload: &Value) -> bool {
        self.conditions.iter().all(|c| match c {
            Condition::Eq(field, expected) => {
                lookup(payload, field).map(|v| v == expected).unwrap_or(false)
            }
            Condition::In(field, options) => lookup(payload, field)
                .map(|v| options.iter().any(|o| o == v))
                .unwrap_or(false),
        })
    }
}

/// Resolve a dotted field path inside a JSON payload.
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

/// Distance metric for collection creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distance {
    Cosine,
    Dot,
    Euclid,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "Cosine",
            Distance::Dot => "Dot",
            Distance::Euclid => "Euclid",
        }
    }
}

/// Interface over the external ANN store.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Ensure the collection exists with the given dimensionality.
    /// Idempotent; a collection with a different vector size yields
    /// [`crate::error::SemIndexError::VectorDimensionMismatch`] unless
    /// `force` recreates it.
    async fn init_collection(
        &self,
        name: &str,
        vector_size: usize,
        distance: Distance,
        force: bool,
    ) -> Result<()>;

    /// Insert-or-replace a batch of points.
    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()>;

    /// Delete points by id.
    async fn delete_ids(&self, name: &str, ids: &[String]) -> Result<()>;

    /// Delete points matching a payload filter.
    async fn delete_filter(&self, name: &str, filter: &Filter) -> Result<()>;

    /// Nearest-neighbor search with optional payload filter.
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Fetch points by id (payload joins during retrieval).
    async fn get_points(&self, name: &str, ids: &[String]) -> Result<Vec<Point>>;

    /// Count points matching a filter.
    async fn count(&self, name: &str, filter: Option<&Filter>) -> Result<usize>;
}

/// Instantiate the gateway selected by the configuration.
pub fn create_store(config: &QdrantConfig) -> Result<Arc<dyn VectorStore>> {
    if config.url == "memory:" {
        Ok(Arc::new(memory::MemoryVectorStore::new()))
    } else {
        Ok(Arc::new(qdrant::QdrantGateway::new(config)?))
    }
}

/// Cosine similarity between two equal-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
