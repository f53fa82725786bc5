//! Cross-document intelligence.
//!
//! Relationship analysis, similarity ranking, conflict detection,
//! complementary-content recommendation, and agglomerative clustering over
//! a candidate pool retrieved by semantic search. Every score is a pure
//! function of payload-derived document profiles, so results are
//! deterministic for a given candidate set.
//!
//! The composite similarity is a weighted sum of entity overlap, topic
//! overlap, metadata overlap and hierarchy proximity, with weights from
//! `global.search.similarity`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{CommonFilters, RetrievalEngine};
use crate::config::SimilarityWeights;
use crate::error::Result;

/// Payload-derived profile of one document in the candidate pool.
#[derive(Debug, Clone)]
pub struct DocProfile {
    pub document_id: String,
    pub title: Option<String>,
    pub project_id: String,
    pub source_type: String,
    pub author: Option<String>,
    pub score: f32,
    pub entities: BTreeSet<String>,
    pub topics: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub ancestors: Vec<String>,
    pub content_sample: String,
}

impl DocProfile {
    fn from_payload(payload: &Value, score: f32) -> Self {
        let str_field = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let str_list = |key: &str| -> Vec<String> {
            payload
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

        let title = str_field("title");
        let section = str_field("section_title");
        let labels: BTreeSet<String> = str_list("labels").into_iter().collect();

        // Entities: annotated entities plus title-cased words of the title.
        let mut entities: BTreeSet<String> = payload
            .pointer("/content_tags/entities")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(t) = &title {
            entities.extend(
                t.split_whitespace()
                    .filter(|w| w.chars().next().map(char::is_uppercase).unwrap_or(false))
                    .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
                    .filter(|w| w.len() >= 3),
            );
        }

        // Topics: lowercased terms from title, section, breadcrumb, labels.
        let mut topics = BTreeSet::new();
        let mut add_terms = |text: &str| {
            topics.extend(
                text.split(|c: char| !c.is_alphanumeric())
                    .filter(|w| w.len() >= 4)
                    .map(|w| w.to_ascii_lowercase()),
            )
        };
        if let Some(t) = &title {
            add_terms(t);
        }
        if let Some(s) = &section {
            add_terms(s);
        }
        for crumb in str_list("breadcrumb") {
            add_terms(&crumb);
        }
        for label in &labels {
            add_terms(label);
        }

        Self {
            document_id: str_field("document_id").unwrap_or_default(),
            title,
            project_id: str_field("project_id").unwrap_or_default(),
            source_type: str_field("source_type").unwrap_or_default(),
            author: str_field("author"),
            score,
            entities,
            topics,
            labels,
            ancestors: str_list("ancestors"),
            content_sample: payload
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .chars()
                .take(2000)
                .collect(),
        }
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Shared-ancestor-prefix proximity in `[0, 1]`.
fn hierarchy_proximity(a: &DocProfile, b: &DocProfile) -> f64 {
    if a.ancestors.is_empty() && b.ancestors.is_empty() {
        return 0.0;
    }
    let shared = a
        .ancestors
        .iter()
        .zip(b.ancestors.iter())
        .take_while(|(x, y)| x == y)
        .count() as f64;
    let depth = a.ancestors.len().max(b.ancestors.len()) as f64;
    shared / depth
}

fn metadata_overlap(a: &DocProfile, b: &DocProfile) -> f64 {
    let mut score = 0.0;
    if a.project_id == b.project_id {
        score += 0.4;
    }
    if a.source_type == b.source_type {
        score += 0.3;
    }
    if a.author.is_some() && a.author == b.author {
        score += 0.3;
    }
    score
}

/// Weighted composite similarity in `[0, 1]`.
pub fn composite_similarity(a: &DocProfile, b: &DocProfile, w: &SimilarityWeights) -> f64 {
    w.entity * jaccard(&a.entities, &b.entities)
        + w.topic * jaccard(&a.topics, &b.topics)
        + w.metadata * metadata_overlap(a, b)
        + w.hierarchy * hierarchy_proximity(a, b)
}

// ============ Result shapes ============

#[derive(Debug, Clone, Serialize)]
pub struct RelationshipEdge {
    pub from: String,
    pub to: String,
    pub similarity: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarDocument {
    pub document_id: String,
    pub title: Option<String>,
    pub similarity: f64,
    pub entity_overlap: f64,
    pub topic_overlap: f64,
    pub metadata_overlap: f64,
    pub hierarchy_proximity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictPair {
    pub document_a: String,
    pub document_b: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub document_id: String,
    pub title: Option<String>,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub cluster_id: usize,
    pub document_ids: Vec<String>,
    pub shared_topics: Vec<String>,
}

/// Clustering strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStrategy {
    MixedFeatures,
    EntityBased,
    TopicBased,
    ProjectBased,
}

impl ClusterStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mixed_features" => Some(Self::MixedFeatures),
            "entity_based" => Some(Self::EntityBased),
            "topic_based" => Some(Self::TopicBased),
            "project_based" => Some(Self::ProjectBased),
            _ => None,
        }
    }
}

// ============ Engine operations ============

impl RetrievalEngine {
    /// Candidate pool for cross-document analyses: top-`limit` documents by
    /// semantic search, one profile per document (best chunk wins).
    pub async fn candidate_profiles(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
    ) -> Result<Vec<DocProfile>> {
        // Over-fetch chunks: several chunks may map to one document.
        let payloads = self
            .search_payloads(query, limit * 4, filters.to_filter())
            .await?;

        let mut by_doc: BTreeMap<String, DocProfile> = BTreeMap::new();
        for (_, score, payload) in payloads {
            let profile = DocProfile::from_payload(&payload, score);
            if profile.document_id.is_empty() {
                continue;
            }
            match by_doc.get_mut(&profile.document_id) {
                // Merge: keep best score, union the term sets.
                Some(existing) => {
                    existing.score = existing.score.max(profile.score);
                    existing.entities.extend(profile.entities);
                    existing.topics.extend(profile.topics);
                }
                None => {
                    by_doc.insert(profile.document_id.clone(), profile);
                }
            }
        }

        let mut profiles: Vec<DocProfile> = by_doc.into_values().collect();
        profiles.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        profiles.truncate(limit);
        Ok(profiles)
    }

    /// Pairwise composite similarity over the candidate pool, as an edge
    /// list with per-edge explanations.
    pub async fn analyze_relationships(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
    ) -> Result<Vec<RelationshipEdge>> {
        let profiles = self.candidate_profiles(query, limit, filters).await?;
        let mut edges = Vec::new();

        for i in 0..profiles.len() {
            for j in (i + 1)..profiles.len() {
                let (a, b) = (&profiles[i], &profiles[j]);
                let similarity = composite_similarity(a, b, &self.weights);
                if similarity <= 0.0 {
                    continue;
                }
                edges.push(RelationshipEdge {
                    from: a.document_id.clone(),
                    to: b.document_id.clone(),
                    similarity,
                    explanation: explain_pair(a, b),
                });
            }
        }
        edges.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(edges)
    }

    /// Top `max_similar` documents most similar to the target, given either
    /// a query or a document id.
    pub async fn find_similar(
        &self,
        target_query: Option<&str>,
        target_document_id: Option<&str>,
        max_similar: usize,
        filters: &CommonFilters,
    ) -> Result<Vec<SimilarDocument>> {
        // With a document-id target, the query becomes that document's own
        // content sample; chunk 0 is addressable via the deterministic id
        // scheme.
        let (query, explicit_target) = match (target_query, target_document_id) {
            (Some(q), _) => (q.to_string(), None),
            (None, Some(doc_id)) => {
                let first_chunk =
                    crate::models::chunk_id(doc_id, 0, crate::models::CHUNKER_VERSION);
                let points = self
                    .vector
                    .get_points(&self.collection, &[first_chunk])
                    .await?;
                let point = points.into_iter().next().ok_or_else(|| {
                    crate::error::SemIndexError::Protocol(format!(
                        "unknown document: {doc_id}"
                    ))
                })?;
                let profile = DocProfile::from_payload(&point.payload, 1.0);
                (profile.content_sample.clone(), Some(profile))
            }
            (None, None) => {
                return Err(crate::error::SemIndexError::Protocol(
                    "either query or document_id is required".into(),
                ))
            }
        };

        let mut profiles = self
            .candidate_profiles(&query, max_similar * 3 + 1, filters)
            .await?;
        if let Some(target) = &explicit_target {
            profiles.retain(|p| p.document_id != target.document_id);
        }
        if profiles.is_empty() {
            return Ok(Vec::new());
        }
        // Without an explicit target, the highest-scoring candidate is the
        // target's stand-in.
        let target = match explicit_target {
            Some(t) => t,
            None => profiles.remove(0),
        };
        if profiles.is_empty() {
            return Ok(Vec::new());
        }

        let mut similar: Vec<SimilarDocument> = profiles
            .iter()
            .map(|p| SimilarDocument {
                document_id: p.document_id.clone(),
                title: p.title.clone(),
                similarity: composite_similarity(&target, p, &self.weights),
                entity_overlap: jaccard(&target.entities, &p.entities),
                topic_overlap: jaccard(&target.topics, &p.topics),
                metadata_overlap: metadata_overlap(&target, p),
                hierarchy_proximity: hierarchy_proximity(&target, p),
            })
            .collect();
        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        similar.truncate(max_similar);
        Ok(similar)
    }

    /// Topic-clustered conflict detection: within each topic cluster, a
    /// deterministic keyword-opposition rule set flags contradicting pairs.
    pub async fn detect_conflicts(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
    ) -> Result<Vec<ConflictPair>> {
        let profiles = self.candidate_profiles(query, limit, filters).await?;
        let mut conflicts = Vec::new();

        for i in 0..profiles.len() {
            for j in (i + 1)..profiles.len() {
                let (a, b) = (&profiles[i], &profiles[j]);
                // Same topic cluster: enough topical overlap to contradict.
                if jaccard(&a.topics, &b.topics) < 0.2 {
                    continue;
                }
                if let Some(explanation) = conflict_explanation(a, b) {
                    conflicts.push(ConflictPair {
                        document_a: a.document_id.clone(),
                        document_b: b.document_id.clone(),
                        explanation,
                    });
                }
            }
        }
        Ok(conflicts)
    }

    /// Complementary content: high topic overlap, low duplication,
    /// compatible context.
    pub async fn find_complementary(
        &self,
        target_query: &str,
        max_recommendations: usize,
        filters: &CommonFilters,
    ) -> Result<Vec<Recommendation>> {
        let mut profiles = self
            .candidate_profiles(target_query, max_recommendations * 3 + 1, filters)
            .await?;
        if profiles.is_empty() {
            return Ok(Vec::new());
        }
        let target = profiles.remove(0);

        let mut recommendations: Vec<Recommendation> = profiles
            .iter()
            .map(|p| {
                let topic_overlap = jaccard(&target.topics, &p.topics);
                let duplication = jaccard(&target.entities, &p.entities);
                let compatibility = 0.5 + 0.5 * metadata_overlap(&target, p);
                let score = topic_overlap * (1.0 - duplication) * compatibility;
                Recommendation {
                    document_id: p.document_id.clone(),
                    title: p.title.clone(),
                    score,
                    reason: format!(
                        "topic overlap {topic_overlap:.2}, duplication {duplication:.2}, context {compatibility:.2}"
                    ),
                }
            })
            .filter(|r| r.score > 0.0)
            .collect();
        recommendations.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        recommendations.truncate(max_recommendations);
        Ok(recommendations)
    }

    /// Agglomerative single-linkage clustering over the candidate pool.
    pub async fn cluster_documents(
        &self,
        query: &str,
        limit: usize,
        filters: &CommonFilters,
        strategy: ClusterStrategy,
        max_clusters: usize,
        min_cluster_size: usize,
    ) -> Result<Vec<Cluster>> {
        let profiles = self.candidate_profiles(query, limit, filters).await?;
        if profiles.is_empty() {
            return Ok(Vec::new());
        }

        let similarity = |a: &DocProfile, b: &DocProfile| -> f64 {
            match strategy {
                ClusterStrategy::MixedFeatures => composite_similarity(a, b, &self.weights),
                ClusterStrategy::EntityBased => jaccard(&a.entities, &b.entities),
                ClusterStrategy::TopicBased => jaccard(&a.topics, &b.topics),
                ClusterStrategy::ProjectBased => (a.project_id == b.project_id) as u8 as f64,
            }
        };

        // Start singleton, merge the closest pair (single linkage) until
        // the cluster budget or the similarity floor is reached.
        let mut clusters: Vec<Vec<usize>> = (0..profiles.len()).map(|i| vec![i]).collect();
        const MIN_LINK: f64 = 0.05;

        while clusters.len() > max_clusters.max(1) {
            let mut best: Option<(usize, usize, f64)> = None;
            for i in 0..clusters.len() {
                for j in (i + 1)..clusters.len() {
                    let link = clusters[i]
                        .iter()
                        .flat_map(|&a| clusters[j].iter().map(move |&b| (a, b)))
                        .map(|(a, b)| similarity(&profiles[a], &profiles[b]))
                        .fold(f64::NEG_INFINITY, f64::max);
                    if best.map(|(_, _, s)| link > s).unwrap_or(true) {
                        best = Some((i, j, link));
                    }
                }
            }
            match best {
                Some((i, j, link)) if link >= MIN_LINK => {
                    let merged = clusters.remove(j);
                    clusters[i].extend(merged);
                }
                _ => break,
            }
        }

        let mut result = Vec::new();
        for members in clusters {
            if members.len() < min_cluster_size {
                continue;
            }
            let mut document_ids: Vec<String> = members
                .iter()
                .map(|&i| profiles[i].document_id.clone())
                .collect();
            document_ids.sort();

            // Topics shared by every member.
            let shared = members
                .iter()
                .map(|&i| profiles[i].topics.clone())
                .reduce(|acc, t| acc.intersection(&t).cloned().collect())
                .unwrap_or_default();

            result.push(Cluster {
                cluster_id: result.len(),
                document_ids,
                shared_topics: shared.into_iter().take(8).collect(),
            });
        }
        Ok(result)
    }
}

fn explain_pair(a: &DocProfile, b: &DocProfile) -> String {
    let mut reasons = Vec::new();
    let shared_entities: Vec<&String> = a.entities.intersection(&b.entities).take(3).collect();
    if !shared_entities.is_empty() {
        reasons.push(format!(
            "shared entities: {}",
            shared_entities
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    let shared_topics: Vec<&String> = a.topics.intersection(&b.topics).take(3).collect();
    if !shared_topics.is_empty() {
        reasons.push(format!(
            "shared topics: {}",
            shared_topics
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if a.project_id == b.project_id {
        reasons.push("same project".to_string());
    }
    if hierarchy_proximity(a, b) > 0.0 {
        reasons.push("shared hierarchy ancestor".to_string());
    }
    if reasons.is_empty() {
        "weak metadata similarity".to_string()
    } else {
        reasons.join("; ")
    }
}

/// Keyword oppositions checked on topically-close pairs.
const OPPOSITIONS: &[(&str, &str)] = &[
    ("enable", "disable"),
    ("enabled", "disabled"),
    ("always", "never"),
    ("required", "optional"),
    ("deprecated", "recommended"),
    ("allow", "deny"),
    ("supported", "unsupported"),
    ("true", "false"),
];

fn conflict_explanation(a: &DocProfile, b: &DocProfile) -> Option<String> {
    let text_a = a.content_sample.to_ascii_lowercase();
    let text_b = b.content_sample.to_ascii_lowercase();

    for (left, right) in OPPOSITIONS {
        let a_left = contains_word(&text_a, left);
        let a_right = contains_word(&text_a, right);
        let b_left = contains_word(&text_b, left);
        let b_right = contains_word(&text_b, right);
        if (a_left && !a_right && b_right && !b_left)
            || (a_right && !a_left && b_left && !b_right)
        {
            return Some(format!(
                "documents disagree on '{left}' vs '{right}' for a shared topic"
            ));
        }
    }

    // Value mismatch: same title from different authors counts as a
    // potential stale-copy conflict.
    if a.title.is_some() && a.title == b.title && a.author != b.author {
        return Some("same title with diverging authorship".to_string());
    }
    None
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric()).any(|w| w == word)
}
