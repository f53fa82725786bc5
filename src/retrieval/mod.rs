//! Retrieval engine.
//!
//! Query orchestration over the vector store: embed the query, search with
//! payload filters derived from the request, then post-process (hierarchy
//! reconstruction, attachment joins, and the cross-document analyses in
//! [`crossdoc`]). All scoring here is a pure function of payload fields;
//! given the same candidate set the output is deterministic.

pub mod crossdoc;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::SimilarityWeights;
use crate::error::{Result, SemIndexError};
use crate::llm::LlmProvider;
use crate::vector::{Filter, VectorStore};

/// Shared handle the MCP server dispatches tools against.
#[derive(Clone)]
pub struct RetrievalEngine {
    pub provider: Arc<dyn LlmProvider>,
    pub vector: Arc<dyn VectorStore>,
    pub collection: String,
    pub weights: SimilarityWeights,
}

/// Filters common to every search tool.
#[derive(Debug, Clone, Default)]
pub struct CommonFilters {
    pub project_ids: Vec<String>,
    pub source_types: Vec<String>,
}

impl CommonFilters {
    fn to_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.project_ids.is_empty() {
            filter = filter.any_of(
                "project_id",
                self.project_ids.iter().map(|p| Value::String(p.clone())).collect(),
            );
        }
        if !self.source_types.is_empty() {
            filter = filter.any_of(
                "source_type",
                self.source_types.iter().map(|s| Value::String(s.clone())).collect(),
            );
        }
        filter
    }
}

/// One hit as returned to MCP clients.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
    pub project_id: String,
    pub source_type: String,
    pub source_name: String,
    pub title: Option<String>,
    pub section_title: Option<String>,
    pub content: String,
    pub url: Option<String>,
    pub is_attachment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_document_id: Option<String>,
    pub breadcrumb: Vec<String>,
    pub hierarchy_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_context: Option<Value>,
}

impl SearchHit {
    fn from_payload(chunk_id: String, score: f32, payload: &Value) -> Self {
        let str_field = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let snippet = payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .chars()
            .take(500)
            .collect::<String>();

        Self {
            chunk_id,
            document_id: str_field("document_id").unwrap_or_default(),
            score,
            project_id: str_field("project_id").unwrap_or_default(),
            source_type: str_field("source_type").unwrap_or_default(),
            source_name: str_field("source_name").unwrap_or_default(),
            title: str_field("title"),
            section_title: str_field("section_title"),
            content: snippet,
            url: str_field("url"),
            is_attachment: payload
                .get("is_attachment")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            parent_document_id: str_field("parent_document_id"),
            breadcrumb: payload
                .get("breadcrumb")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            hierarchy_depth: payload
                .get("hierarchy_depth")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as usize,
            parent_context: None,
        }
    }
}

impl RetrievalEngine {
    /// Embed the query and return the raw scored payloads.
    async fn search_payloads(
        &self,
        query: &str,
        limit: usize,
        filter: Filter,
    ) -> Result<Vec<(String, f32, Value)>> {
        if query.trim().is_empty() {
            return Err(SemIndexError::Protocol("query must not be empty".into()));
        }
        let vector = self
            .provider
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SemIndexError::Model("empty embedding response".into()))?;

        let filter_opt = (!filter.is_empty()).then_some(&filter);
        let hits = self
            .vector
            .search(&self.collection, &vector, limit, filter_opt)
            .await
            .map_err(|e| match e {
                e if e.is_transient() => SemIndexError::ToolUnavailable(e.to_string()),
                e => e,
            })?;
        Ok(hits.into_iter().map(|h| (h.id, h.score, h.payload)).collect())
    }

    /// Plain semantic search.
    pub async fn semantic_search(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
    ) -> Result<Vec<SearchHit>> {
        let payloads = self.search_payloads(query, limit, filters.to_filter()).await?;
        Ok(payloads
            .into_iter()
            .map(|(id, score, payload)| SearchHit::from_payload(id, score, &payload))
            .collect())
    }
}

// ============ Hierarchy search ============

/// Post-filters for hierarchy search.
#[derive(Debug, Clone, Default)]
pub struct HierarchyFilter {
    pub depth: Option<usize>,
    pub has_children: Option<bool>,
    pub parent_title: Option<String>,
    pub root_only: bool,
}

/// A hierarchy-organized result group rooted at one document.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyGroup {
    pub root_document_id: String,
    pub root_title: Option<String>,
    pub hits: Vec<HierarchyHit>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HierarchyHit {
    #[serde(flatten)]
    pub hit: SearchHit,
    pub ancestors: Vec<String>,
    pub children_ids: Vec<String>,
}

/// Result shape for `hierarchy_search`: flat or grouped by root.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HierarchyResults {
    Flat(Vec<HierarchyHit>),
    Grouped(Vec<HierarchyGroup>),
}

impl RetrievalEngine {
    /// Semantic search restricted to hierarchy-bearing sources, with
    /// ancestors/children resolved from the payload and optional
    /// organization by root document.
    pub async fn hierarchy_search(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
        organize_by_hierarchy: bool,
        hierarchy_filter: &HierarchyFilter,
    ) -> Result<HierarchyResults> {
        let mut filters = filters.clone();
        if filters.source_types.is_empty() {
            // Hierarchy exists for Confluence always, and for file-backed
            // sources when the source opted in at ingestion time.
            filters.source_types =
                vec!["confluence".into(), "localfile".into(), "git".into()];
        }

        let payloads = self.search_payloads(query, limit, filters.to_filter()).await?;
        let mut hits: Vec<HierarchyHit> = payloads
            .into_iter()
            .map(|(id, score, payload)| {
                let hit = SearchHit::from_payload(id, score, &payload);
                let list = |key: &str| {
                    payload
                        .get(key)
                        .and_then(|v| v.as_array())
                        .map(|a| {
                            a.iter()
                                .filter_map(|v| v.as_str())
                                .map(String::from)
                                .collect::<Vec<_>>()
                        })
                        .unwrap_or_default()
                };
                HierarchyHit {
                    ancestors: list("ancestors"),
                    children_ids: list("children_ids"),
                    hit,
                }
            })
            .collect();

        hits.retain(|h| {
            if let Some(depth) = hierarchy_filter.depth {
                if h.hit.hierarchy_depth != depth {
                    return false;
                }
            }
            if let Some(has_children) = hierarchy_filter.has_children {
                if h.children_ids.is_empty() == has_children {
                    return false;
                }
            }
            if let Some(parent_title) = &hierarchy_filter.parent_title {
                if h.hit.breadcrumb.last().map(String::as_str) != Some(parent_title.as_str()) {
                    return false;
                }
            }
            if hierarchy_filter.root_only && !h.ancestors.is_empty() {
                return false;
            }
            true
        });

        if !organize_by_hierarchy {
            return Ok(HierarchyResults::Flat(hits));
        }

        // Group by root document, sort each group by depth then score.
        let mut groups: BTreeMap<String, HierarchyGroup> = BTreeMap::new();
        for hit in hits {
            let root = hit
                .ancestors
                .first()
                .cloned()
                .unwrap_or_else(|| hit.hit.document_id.clone());
            let group = groups.entry(root.clone()).or_insert_with(|| HierarchyGroup {
                root_document_id: root,
                root_title: hit.hit.breadcrumb.first().cloned().or_else(|| hit.hit.title.clone()),
                hits: Vec::new(),
            });
            group.hits.push(hit);
        }
        let mut grouped: Vec<HierarchyGroup> = groups.into_values().collect();
        for group in &mut grouped {
            group.hits.sort_by(|a, b| {
                a.hit
                    .hierarchy_depth
                    .cmp(&b.hit.hierarchy_depth)
                    .then_with(|| {
                        b.hit
                            .score
                            .partial_cmp(&a.hit.score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            });
        }
        // Best group first.
        grouped.sort_by(|a, b| {
            let best = |g: &HierarchyGroup| {
                g.hits
                    .iter()
                    .map(|h| h.hit.score)
                    .fold(f32::NEG_INFINITY, f32::max)
            };
            best(b).partial_cmp(&best(a)).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(HierarchyResults::Grouped(grouped))
    }
}

// ============ Attachment search ============

/// Filters for attachment search.
#[derive(Debug, Clone, Default)]
pub struct AttachmentFilter {
    pub file_type: Option<String>,
    pub file_size_min: Option<u64>,
    pub file_size_max: Option<u64>,
    /// When false, parent documents owning attachments also match.
    pub attachments_only: bool,
    pub author: Option<String>,
    pub parent_document_title: Option<String>,
}

impl RetrievalEngine {
    /// Semantic search over attachments, optionally joined with the parent
    /// document's payload.
    pub async fn attachment_search(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
        include_parent_context: bool,
        attachment_filter: &AttachmentFilter,
    ) -> Result<Vec<SearchHit>> {
        let mut filter = filters.to_filter();
        if attachment_filter.attachments_only {
            filter = filter.eq("is_attachment", true);
        }

        let payloads = self.search_payloads(query, limit * 2, filter).await?;
        let mut hits = Vec::new();

        for (id, score, payload) in payloads {
            let is_attachment = payload
                .get("is_attachment")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let has_attachments = payload
                .get("has_attachments")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !is_attachment && !(has_attachments && !attachment_filter.attachments_only) {
                continue;
            }

            if !attachment_matches(&payload, attachment_filter) {
                continue;
            }

            let mut hit = SearchHit::from_payload(id, score, &payload);

            let parent_payload = if include_parent_context || attachment_filter.parent_document_title.is_some() {
                match &hit.parent_document_id {
                    Some(parent_id) => self.parent_payload(parent_id).await?,
                    None => None,
                }
            } else {
                None
            };

            if let Some(wanted_title) = &attachment_filter.parent_document_title {
                let parent_title = parent_payload
                    .as_ref()
                    .and_then(|p| p.get("title"))
                    .and_then(|v| v.as_str());
                if parent_title != Some(wanted_title.as_str()) {
                    continue;
                }
            }

            if include_parent_context {
                hit.parent_context = parent_payload.map(|p| {
                    serde_json::json!({
                        "document_id": p.get("document_id"),
                        "title": p.get("title"),
                        "url": p.get("url"),
                        "breadcrumb": p.get("breadcrumb"),
                    })
                });
            }

            hits.push(hit);
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    /// First chunk payload of the parent document, if present. Chunk ids
    /// are deterministic, so chunk 0 of the parent is addressable directly.
    async fn parent_payload(&self, parent_document_id: &str) -> Result<Option<Value>> {
        let first_chunk =
            crate::models::chunk_id(parent_document_id, 0, crate::models::CHUNKER_VERSION);
        let points = self
            .vector
            .get_points(&self.collection, &[first_chunk])
            .await?;
        let wanted = Filter::new().eq("document_id", parent_document_id);
        Ok(points
            .into_iter()
            .next()
            .filter(|p| wanted.matches(&p.payload))
            .map(|p| p.payload))
    }
}

fn attachment_matches(payload: &Value, filter: &AttachmentFilter) -> bool {
    if let Some(file_type) = &filter.file_type {
        let matches_type = payload
            .get("attachment_filename")
            .and_then(|v| v.as_str())
            .map(|name| {
                name.rsplit('.')
                    .next()
                    .map(|ext| ext.eq_ignore_ascii_case(file_type.trim_start_matches('.')))
                    .unwrap_or(false)
            })
            .or_else(|| {
                payload
                    .get("attachment_mime")
                    .and_then(|v| v.as_str())
                    .map(|mime| mime.contains(file_type.as_str()))
            })
            .unwrap_or(false);
        if !matches_type {
            return false;
        }
    }

    let size = payload.get("attachment_size").and_then(|v| v.as_u64());
    if let Some(min) = filter.file_size_min {
        if size.map(|s| s < min).unwrap_or(true) {
            return false;
        }
    }
    if let Some(max) = filter.file_size_max {
        if size.map(|s| s > max).unwrap_or(true) {
            return false;
        }
    }

    if let Some(author) = &filter.author {
        let matches_author = payload
            .get("author")
            .and_then(|v| v.as_str())
            .map(|a| a.eq_ignore_ascii_case(author))
            .unwrap_or(false);
        if !matches_author {
            return false;
        }
    }
    true
}
