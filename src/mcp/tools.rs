//! MCP tool registry.
//!
//! Each retrieval operation is exposed as one [`McpTool`] trait object with
//! a JSON-schema parameter spec. `tools/list` serializes the registry;
//! `tools/call` validates arguments against the schema (violations become
//! `-32602 Invalid params`) and dispatches to the engine. Every tool's
//! result is a JSON object shaped `{results: [...], diagnostics?: {...}}`.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, SemIndexError};
use crate::retrieval::crossdoc::ClusterStrategy;
use crate::retrieval::{AttachmentFilter, CommonFilters, HierarchyFilter, RetrievalEngine};

/// One callable tool.
#[async_trait]
pub trait McpTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the tool's arguments (`type: object`).
    fn input_schema(&self) -> Value;
    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn McpTool>>,
}

impl ToolRegistry {
    /// Registry with the full retrieval tool surface.
    pub fn with_builtins() -> Self {
        Self {
            tools: vec![
                Box::new(SearchTool),
                Box::new(HierarchySearchTool),
                Box::new(AttachmentSearchTool),
                Box::new(RelationshipsTool),
                Box::new(SimilarDocumentsTool),
                Box::new(ConflictsTool),
                Box::new(ComplementaryTool),
                Box::new(ClusterTool),
            ],
        }
    }

    pub fn find(&self, name: &str) -> Option<&dyn McpTool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// `tools/list` payload.
    pub fn list(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name(),
                        "description": t.description(),
                        "inputSchema": t.input_schema(),
                    })
                })
                .collect(),
        )
    }
}

/// Validate `params` against a tool schema: `required` membership and
/// primitive `type` agreement. Returns a human-readable violation.
pub fn validate_params(schema: &Value, params: &Value) -> std::result::Result<(), String> {
    if !params.is_object() {
        return Err("arguments must be an object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if params.get(name).is_none() {
                return Err(format!("missing required parameter '{name}'"));
            }
        }
    }

    let properties = schema.get("properties").and_then(|p| p.as_object());
    if let (Some(properties), Some(args)) = (properties, params.as_object()) {
        for (name, value) in args {
            let Some(spec) = properties.get(name) else {
                return Err(format!("unknown parameter '{name}'"));
            };
            if let Some(expected) = spec.get("type").and_then(|t| t.as_str()) {
                let ok = match expected {
                    "string" => value.is_string(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !ok {
                    return Err(format!("parameter '{name}' must be a {expected}"));
                }
            }
            if let Some(options) = spec.get("enum").and_then(|e| e.as_array()) {
                if !options.contains(value) {
                    return Err(format!("parameter '{name}' must be one of {options:?}"));
                }
            }
        }
    }
    Ok(())
}

// ============ Shared argument parsing ============

fn common_filters(params: &Value) -> CommonFilters {
    let list = |key: &str| -> Vec<String> {
        params
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    };
    CommonFilters {
        project_ids: list("project_ids"),
        source_types: list("source_types"),
    }
}

fn query_of(params: &Value) -> Result<&str> {
    params
        .get("query")
        .and_then(|v| v.as_str())
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| SemIndexError::Protocol("query must not be empty".into()))
}

fn limit_of(params: &Value, default: usize) -> usize {
    params
        .get("limit")
        .and_then(|v| v.as_u64())
        .map(|l| l.clamp(1, 100) as usize)
        .unwrap_or(default)
}

fn filter_properties() -> Value {
    json!({
        "source_types": {
            "type": "array",
            "items": {"type": "string"},
            "description": "Restrict to these source types (git, confluence, jira, publicdocs, localfile)"
        },
        "project_ids": {
            "type": "array",
            "items": {"type": "string"},
            "description": "Restrict to these project ids"
        }
    })
}

fn schema(extra_properties: Value, required: &[&str]) -> Value {
    let mut properties = json!({
        "query": {"type": "string", "description": "Search query"},
        "limit": {"type": "integer", "description": "Maximum results", "default": 10},
    });
    let shared = filter_properties();
    if let Some(base) = properties.as_object_mut() {
        if let Some(filters) = shared.as_object() {
            for (k, v) in filters {
                base.insert(k.clone(), v.clone());
            }
        }
        if let Some(extra) = extra_properties.as_object() {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn results(value: Value) -> Value {
    json!({ "results": value })
}

// ============ Tools ============

struct SearchTool;

#[async_trait]
impl McpTool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Semantic search across the knowledge base"
    }

    fn input_schema(&self) -> Value {
        schema(json!({}), &["query"])
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let hits = engine
            .semantic_search(query_of(params)?, limit_of(params, 10), &common_filters(params))
            .await?;
        Ok(results(serde_json::to_value(hits)?))
    }
}

struct HierarchySearchTool;

#[async_trait]
impl McpTool for HierarchySearchTool {
    fn name(&self) -> &str {
        "hierarchy_search"
    }

    fn description(&self) -> &str {
        "Semantic search over hierarchy-bearing sources, with ancestors, children and optional grouping by root document"
    }

    fn input_schema(&self) -> Value {
        schema(
            json!({
                "organize_by_hierarchy": {"type": "boolean", "default": false},
                "hierarchy_filter": {
                    "type": "object",
                    "properties": {
                        "depth": {"type": "integer"},
                        "has_children": {"type": "boolean"},
                        "parent_title": {"type": "string"},
                        "root_only": {"type": "boolean"}
                    }
                }
            }),
            &["query"],
        )
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let hf = params.get("hierarchy_filter").cloned().unwrap_or(json!({}));
        let hierarchy_filter = HierarchyFilter {
            depth: hf.get("depth").and_then(|v| v.as_u64()).map(|d| d as usize),
            has_children: hf.get("has_children").and_then(|v| v.as_bool()),
            parent_title: hf
                .get("parent_title")
                .and_then(|v| v.as_str())
                .map(String::from),
            root_only: hf.get("root_only").and_then(|v| v.as_bool()).unwrap_or(false),
        };
        let organized = params
            .get("organize_by_hierarchy")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let hits = engine
            .hierarchy_search(
                query_of(params)?,
                limit_of(params, 10),
                &common_filters(params),
                organized,
                &hierarchy_filter,
            )
            .await?;
        Ok(results(serde_json::to_value(hits)?))
    }
}

struct AttachmentSearchTool;

#[async_trait]
impl McpTool for AttachmentSearchTool {
    fn name(&self) -> &str {
        "attachment_search"
    }

    fn description(&self) -> &str {
        "Semantic search over attachments, with optional parent-document context"
    }

    fn input_schema(&self) -> Value {
        schema(
            json!({
                "include_parent_context": {"type": "boolean", "default": false},
                "attachment_filter": {
                    "type": "object",
                    "properties": {
                        "file_type": {"type": "string"},
                        "file_size_min": {"type": "integer"},
                        "file_size_max": {"type": "integer"},
                        "attachments_only": {"type": "boolean"},
                        "author": {"type": "string"},
                        "parent_document_title": {"type": "string"}
                    }
                }
            }),
            &["query"],
        )
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let af = params.get("attachment_filter").cloned().unwrap_or(json!({}));
        let attachment_filter = AttachmentFilter {
            file_type: af.get("file_type").and_then(|v| v.as_str()).map(String::from),
            file_size_min: af.get("file_size_min").and_then(|v| v.as_u64()),
            file_size_max: af.get("file_size_max").and_then(|v| v.as_u64()),
            attachments_only: af
                .get("attachments_only")
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
            author: af.get("author").and_then(|v| v.as_str()).map(String::from),
            parent_document_title: af
                .get("parent_document_title")
                .and_then(|v| v.as_str())
                .map(String::from),
        };
        let include_parent = params
            .get("include_parent_context")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let hits = engine
            .attachment_search(
                query_of(params)?,
                limit_of(params, 10),
                &common_filters(params),
                include_parent,
                &attachment_filter,
            )
            .await?;
        Ok(results(serde_json::to_value(hits)?))
    }
}

struct RelationshipsTool;

#[async_trait]
impl McpTool for RelationshipsTool {
    fn name(&self) -> &str {
        "analyze_document_relationships"
    }

    fn description(&self) -> &str {
        "Pairwise similarity edges with explanations over the top matching documents"
    }

    fn input_schema(&self) -> Value {
        schema(json!({}), &["query"])
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let edges = engine
            .analyze_relationships(query_of(params)?, limit_of(params, 10), &common_filters(params))
            .await?;
        Ok(results(serde_json::to_value(edges)?))
    }
}

struct SimilarDocumentsTool;

#[async_trait]
impl McpTool for SimilarDocumentsTool {
    fn name(&self) -> &str {
        "find_similar_documents"
    }

    fn description(&self) -> &str {
        "Documents most similar to the target, with per-metric scores"
    }

    fn input_schema(&self) -> Value {
        schema(
            json!({
                "document_id": {
                    "type": "string",
                    "description": "Target document id (alternative to query)"
                },
                "max_similar": {"type": "integer", "description": "Maximum similar documents", "default": 5}
            }),
            &[],
        )
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let max_similar = params
            .get("max_similar")
            .and_then(|v| v.as_u64())
            .map(|m| m.clamp(1, 50) as usize)
            .unwrap_or(5);
        let query = params
            .get("query")
            .and_then(|v| v.as_str())
            .filter(|q| !q.trim().is_empty());
        let document_id = params.get("document_id").and_then(|v| v.as_str());
        let similar = engine
            .find_similar(query, document_id, max_similar, &common_filters(params))
            .await?;
        Ok(results(serde_json::to_value(similar)?))
    }
}

struct ConflictsTool;

#[async_trait]
impl McpTool for ConflictsTool {
    fn name(&self) -> &str {
        "detect_document_conflicts"
    }

    fn description(&self) -> &str {
        "Contradicting document pairs within topic clusters"
    }

    fn input_schema(&self) -> Value {
        schema(json!({}), &["query"])
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let conflicts = engine
            .detect_conflicts(query_of(params)?, limit_of(params, 20), &common_filters(params))
            .await?;
        Ok(results(serde_json::to_value(conflicts)?))
    }
}

struct ComplementaryTool;

#[async_trait]
impl McpTool for ComplementaryTool {
    fn name(&self) -> &str {
        "find_complementary_content"
    }

    fn description(&self) -> &str {
        "Content complementing the target: topically related, low duplication"
    }

    fn input_schema(&self) -> Value {
        schema(
            json!({
                "max_recommendations": {"type": "integer", "default": 5}
            }),
            &["query"],
        )
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let max = params
            .get("max_recommendations")
            .and_then(|v| v.as_u64())
            .map(|m| m.clamp(1, 50) as usize)
            .unwrap_or(5);
        let recommendations = engine
            .find_complementary(query_of(params)?, max, &common_filters(params))
            .await?;
        Ok(results(serde_json::to_value(recommendations)?))
    }
}

struct ClusterTool;

#[async_trait]
impl McpTool for ClusterTool {
    fn name(&self) -> &str {
        "cluster_documents"
    }

    fn description(&self) -> &str {
        "Agglomerative clustering of the top matching documents"
    }

    fn input_schema(&self) -> Value {
        schema(
            json!({
                "strategy": {
                    "type": "string",
                    "enum": ["mixed_features", "entity_based", "topic_based", "project_based"],
                    "default": "mixed_features"
                },
                "max_clusters": {"type": "integer", "default": 5},
                "min_cluster_size": {"type": "integer", "default": 2}
            }),
            &["query"],
        )
    }

    async fn call(&self, params: &Value, engine: &RetrievalEngine) -> Result<Value> {
        let strategy = params
            .get("strategy")
            .and_then(|v| v.as_str())
            .unwrap_or("mixed_features");
        let strategy = ClusterStrategy::parse(strategy)
            .ok_or_else(|| SemIndexError::Protocol(format!("unknown strategy '{strategy}'")))?;
        let max_clusters = params
            .get("max_clusters")
            .and_then(|v| v.as_u64())
            .map(|m| m.clamp(1, 50) as usize)
            .unwrap_or(5);
        let min_cluster_size = params
            .get("min_cluster_size")
            .and_then(|v| v.as_u64())
            .map(|m| m.max(1) as usize)
            .unwrap_or(2);

        let clusters = engine
            .cluster_documents(
                query_of(params)?,
                limit_of(params, 30),
                &common_filters(params),
                strategy,
                max_clusters,
                min_cluster_size,
            )
            .await?;
        Ok(results(serde_json::to_value(clusters)?))
    }
}
