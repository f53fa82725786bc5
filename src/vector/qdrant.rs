//! Qdrant REST gateway.
//!
//! Speaks Qdrant's HTTP API directly with `reqwest`: collection
//! creation/inspection, batch point upsert, deletion by id set or payload
//! filter, filtered vector search, point retrieval, and counting. Point ids
//! on the wire are UUIDs derived from the chunk id (Qdrant only accepts
//! UUIDs or integers); the logical chunk id always travels in the payload,
//! so responses map back losslessly.
//!
//! Transient failures (network, 429, 5xx) are retried a fixed number of
//! times with short exponential backoff; anything else surfaces
//! immediately.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use super::{Condition, Distance, Filter, Point, ScoredPoint, VectorStore};
use crate::config::QdrantConfig;
use crate::error::{Result, SemIndexError};
use crate::models::point_uuid;

const MAX_ATTEMPTS: u32 = 3;

pub struct QdrantGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantGateway {
    pub fn new(config: &QdrantConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_err: Option<SemIndexError> = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * (1 << attempt));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.request(method.clone(), &url);
            if let Some(key) = &self.api_key {
                if !key.is_empty() {
                    request = request.header("api-key", key);
                }
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.json().await.unwrap_or(Value::Null));
                    }
                    let text = resp.text().await.unwrap_or_default();
                    let err = SemIndexError::from_status(status.as_u16(), "qdrant", text);
                    if err.is_transient() {
                        tracing::warn!(status = status.as_u16(), attempt, "qdrant transient error");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "qdrant network error");
                    last_err = Some(SemIndexError::TransientNetwork {
                        target: "qdrant".to_string(),
                        detail: e.to_string(),
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SemIndexError::Other("qdrant request failed".into())))
    }

    /// Vector size of an existing collection, or None when absent.
    async fn collection_size(&self, name: &str) -> Result<Option<usize>> {
        let url = format!("{}/collections/{}", self.base_url, name);
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        let resp = request.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(SemIndexError::from_status(status, "qdrant", text));
        }
        let body: Value = resp.json().await?;
        let size = body
            .pointer("/result/config/params/vectors/size")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize);
        Ok(size)
    }
}

/// Serialize the typed filter into Qdrant's `must` clause.
fn qdrant_filter(filter: &Filter) -> Value {
    let must: Vec<Value> = filter
        .conditions
        .iter()
        .map(|c| match c {
            Condition::Eq(field, value) => json!({"key": field, "match": {"value": value}}),
            Condition::In(field, values) => json!({"key": field, "match": {"any": values}}),
        })
        .collect();
    json!({ "must": must })
}

#[async_trait]
impl VectorStore for QdrantGateway {
    async fn init_collection(
        &self,
        name: &str,
        vector_size: usize,
        distance: Distance,
        force: bool,
    ) -> Result<()> {
        match self.collection_size(name).await? {
            Some(existing) if existing == vector_size && !force => return Ok(()),
            Some(existing) if existing != vector_size && !force => {
                return Err(SemIndexError::VectorDimensionMismatch {
                    collection: name.to_string(),
                    expected: vector_size,
                    actual: existing,
                });
            }
            Some(_) => {
                self.request(reqwest::Method::DELETE, &format!("/collections/{name}"), None)
                    .await?;
            }
            None => {}
        }

        let body = json!({
            "vectors": { "size": vector_size, "distance": distance.as_str() }
        });
        self.request(
            reqwest::Method::PUT,
            &format!("/collections/{name}"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let wire_points: Vec<Value> = points
            .iter()
            .map(|p| {
                json!({
                    "id": point_uuid(&p.id),
                    "vector": p.vector,
                    "payload": p.payload,
                })
            })
            .collect();
        let body = json!({ "points": wire_points });
        self.request(
            reqwest::Method::PUT,
            &format!("/collections/{name}/points?wait=true"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_ids(&self, name: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let wire_ids: Vec<String> = ids.iter().map(|id| point_uuid(id)).collect();
        let body = json!({ "points": wire_ids });
        self.request(
            reqwest::Method::POST,
            &format!("/collections/{name}/points/delete?wait=true"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_filter(&self, name: &str, filter: &Filter) -> Result<()> {
        let body = json!({ "filter": qdrant_filter(filter) });
        self.request(
            reqwest::Method::POST,
            &format!("/collections/{name}/points/delete?wait=true"),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(f) = filter {
            if !f.is_empty() {
                body["filter"] = qdrant_filter(f);
            }
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{name}/points/search"),
                Some(&body),
            )
            .await?;

        let hits = response
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .into_iter()
            .map(|hit| {
                let payload = hit.get("payload").cloned().unwrap_or(Value::Null);
                let id = payload
                    .get("chunk_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| {
                        hit.get("id").map(|v| v.to_string()).unwrap_or_default()
                    });
                ScoredPoint {
                    id,
                    score: hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32,
                    payload,
                }
            })
            .collect())
    }

    async fn get_points(&self, name: &str, ids: &[String]) -> Result<Vec<Point>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let wire_ids: Vec<String> = ids.iter().map(|id| point_uuid(id)).collect();
        let body = json!({ "ids": wire_ids, "with_payload": true, "with_vector": true });
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{name}/points"),
                Some(&body),
            )
            .await?;

        let records = response
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(records
            .into_iter()
            .map(|record| {
                let payload = record.get("payload").cloned().unwrap_or(Value::Null);
                let id = payload
                    .get("chunk_id")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                let vector = record
                    .get("vector")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().map(|x| x.as_f64().unwrap_or(0.0) as f32).collect())
                    .unwrap_or_default();
                Point { id, vector, payload }
            })
            .collect())
    }

    async fn count(&self, name: &str, filter: Option<&Filter>) -> Result<usize> {
        let mut body = json!({ "exact": true });
        if let Some(f) = filter {
            if !f.is_empty() {
                body["filter"] = qdrant_filter(f);
            }
        }
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{name}/points/count"),
                Some(&body),
            )
            .await?;
        Ok(response
            .pointer("/result/count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn gateway(url: &str) -> QdrantGateway {
        QdrantGateway::new(&QdrantConfig {
            url: url.to_string(),
            api_key: Some("qk".to_string()),
            collection_name: "test".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn filter_serialization() {
        let filter = Filter::new()
            .eq("project_id", "p1")
            .any_of("source_type", vec![json!("git"), json!("jira")]);
        let wire = qdrant_filter(&filter);
        assert_eq!(wire["must"][0]["key"], "project_id");
        assert_eq!(wire["must"][0]["match"]["value"], "p1");
        assert_eq!(wire["must"][1]["match"]["any"][1], "jira");
    }

    #[tokio::test]
    async fn init_creates_missing_collection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/collections/kb");
            then.status(404);
        });
        let create = server.mock(|when, then| {
            when.method(PUT)
                .path("/collections/kb")
                .json_body_partial(r#"{"vectors": {"size": 8, "distance": "Cosine"}}"#);
            then.status(200).json_body(json!({"result": true}));
        });

        gateway(&server.base_url())
            .init_collection("kb", 8, Distance::Cosine, false)
            .await
            .unwrap();
        create.assert();
    }

    #[tokio::test]
    async fn init_detects_dimension_mismatch() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/collections/kb");
            then.status(200).json_body(json!({
                "result": {"config": {"params": {"vectors": {"size": 4, "distance": "Cosine"}}}}
            }));
        });

        let err = gateway(&server.base_url())
            .init_collection("kb", 8, Distance::Cosine, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SemIndexError::VectorDimensionMismatch { expected: 8, actual: 4, .. }
        ));
    }

    #[tokio::test]
    async fn force_recreates_collection() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/collections/kb");
            then.status(200).json_body(json!({
                "result": {"config": {"params": {"vectors": {"size": 4, "distance": "Cosine"}}}}
            }));
        });
        let delete = server.mock(|when, then| {
            when.method(DELETE).path("/collections/kb");
            then.status(200).json_body(json!({"result": true}));
        });
        let create = server.mock(|when, then| {
            when.method(PUT).path("/collections/kb");
            then.status(200).json_body(json!({"result": true}));
        });

        gateway(&server.base_url())
            .init_collection("kb", 8, Distance::Cosine, true)
            .await
            .unwrap();
        delete.assert();
        create.assert();
    }

    #[tokio::test]
    async fn upsert_sends_uuid_ids_and_payload() {
        let server = MockServer::start();
        let uuid = point_uuid("chunk-1");
        let upsert = server.mock(move |when, then| {
            when.method(PUT)
                .path("/collections/kb/points")
                .body_contains(&uuid)
                .body_contains("chunk-1");
            then.status(200).json_body(json!({"result": {"status": "ok"}}));
        });

        gateway(&server.base_url())
            .upsert(
                "kb",
                vec![Point {
                    id: "chunk-1".to_string(),
                    vector: vec![0.1, 0.2],
                    payload: json!({"chunk_id": "chunk-1"}),
                }],
            )
            .await
            .unwrap();
        upsert.assert();
    }

    #[tokio::test]
    async fn search_maps_chunk_ids_back() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/collections/kb/points/search");
            then.status(200).json_body(json!({
                "result": [
                    {"id": "u-1", "score": 0.9, "payload": {"chunk_id": "chunk-1"}},
                    {"id": "u-2", "score": 0.5, "payload": {"chunk_id": "chunk-2"}}
                ]
            }));
        });

        let hits = gateway(&server.base_url())
            .search("kb", &[0.1, 0.2], 5, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "chunk-1");
        assert!((hits[0].score - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/collections/kb/points/count");
            then.status(503).body("busy");
        });

        let err = gateway(&server.base_url()).count("kb", None).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(mock.hits(), MAX_ATTEMPTS as usize);
    }
}
