//! Core data models that flow through the ingestion and retrieval pipeline.
//!
//! A connector produces [`Document`]s; change detection keeps or drops them;
//! the chunking engine turns each surviving document into [`Chunk`]s; the
//! upserter writes one vector-store point per chunk. Identifiers are stable
//! SHA-256 digests so repeated runs over unchanged sources reproduce the
//! same ids.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Bump to force a clean re-chunk of every document: chunk ids are derived
/// from this constant, so old and new chunk sets never collide.
pub const CHUNKER_VERSION: u32 = 2;

/// The supported source types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Git,
    Confluence,
    Jira,
    PublicDocs,
    LocalFile,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Git => "git",
            SourceType::Confluence => "confluence",
            SourceType::Jira => "jira",
            SourceType::PublicDocs => "publicdocs",
            SourceType::LocalFile => "localfile",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "git" => Some(SourceType::Git),
            "confluence" => Some(SourceType::Confluence),
            "jira" => Some(SourceType::Jira),
            "publicdocs" => Some(SourceType::PublicDocs),
            "localfile" => Some(SourceType::LocalFile),
            _ => None,
        }
    }

    /// Whether documents from this source carry parent/child hierarchy.
    /// File-system sources only do so when `preserve_hierarchy` is enabled
    /// on the source config; that is reflected per-document in its metadata.
    pub fn exposes_hierarchy(&self) -> bool {
        matches!(
            self,
            SourceType::Confluence | SourceType::LocalFile | SourceType::Git
        )
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document body as observed by a connector.
#[derive(Debug, Clone)]
pub enum DocumentContent {
    /// UTF-8 text, ready for chunking.
    Text(String),
    /// Raw bytes that need file conversion before chunking.
    Binary(Vec<u8>),
}

impl DocumentContent {
    pub fn len(&self) -> usize {
        match self {
            DocumentContent::Text(s) => s.len(),
            DocumentContent::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DocumentContent::Text(s) => Some(s),
            DocumentContent::Binary(_) => None,
        }
    }
}

/// Raw per-document metadata filled by connectors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    /// Titles (or directory segments) from root to this document.
    #[serde(default)]
    pub breadcrumb: Vec<String>,
    /// Ancestor document ids, root first.
    #[serde(default)]
    pub ancestors: Vec<String>,
    #[serde(default)]
    pub children_ids: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Confluence space key or JIRA project key.
    pub space_key: Option<String>,
    /// Issue links for JIRA documents.
    #[serde(default)]
    pub issue_links: Vec<String>,
    /// Attachment details; set only when `is_attachment`.
    pub attachment_filename: Option<String>,
    pub attachment_mime: Option<String>,
    pub attachment_size: Option<u64>,
    /// Set on parents that own at least one attachment.
    #[serde(default)]
    pub has_attachments: bool,
    /// Marks Excel sheets rendered to Markdown; switches the Markdown
    /// chunker to the H2-per-sheet path.
    #[serde(default)]
    pub is_excel_sheet: bool,
    /// Free-form connector extras that survive into the chunk payload.
    #[serde(default)]
    pub extras: BTreeMap<String, Value>,
}

/// One ingested item, as observed by a connector on one run.
#[derive(Debug, Clone)]
pub struct Document {
    /// `stable_hash(project_id, source_type, source_name, source_uri)`.
    pub document_id: String,
    pub project_id: String,
    pub source_type: SourceType,
    pub source_name: String,
    /// Identifier within the source: relative path, page id, issue key, URL.
    pub source_uri: String,
    pub content: DocumentContent,
    /// MIME type or lowercase extension of the original content.
    pub content_type: String,
    /// For attachments, the owning document's id.
    pub parent_document_id: Option<String>,
    pub is_attachment: bool,
    pub metadata: DocMetadata,
}

impl Document {
    /// Construct a document and derive its stable id.
    pub fn new(
        project_id: &str,
        source_type: SourceType,
        source_name: &str,
        source_uri: &str,
        content: DocumentContent,
        content_type: &str,
    ) -> Self {
        Self {
            document_id: document_id(project_id, source_type, source_name, source_uri),
            project_id: project_id.to_string(),
            source_type,
            source_name: source_name.to_string(),
            source_uri: source_uri.to_string(),
            content,
            content_type: content_type.to_string(),
            parent_document_id: None,
            is_attachment: false,
            metadata: DocMetadata::default(),
        }
    }

    pub fn title(&self) -> &str {
        self.metadata.title.as_deref().unwrap_or(&self.source_uri)
    }

    pub fn needs_conversion(&self) -> bool {
        matches!(self.content, DocumentContent::Binary(_))
    }
}

/// One vector-store point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// `stable_hash(document_id, chunk_index, CHUNKER_VERSION)`.
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// Payload stored alongside every vector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub project_id: String,
    pub source_type: String,
    pub source_name: String,
    pub parent_document_id: Option<String>,
    pub total_chunks: usize,
    pub title: Option<String>,
    pub section_title: Option<String>,
    pub breadcrumb: Vec<String>,
    pub hierarchy_depth: usize,
    pub ancestors: Vec<String>,
    pub children_ids: Vec<String>,
    pub url: Option<String>,
    pub author: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_attachment: bool,
    pub attachment_filename: Option<String>,
    pub attachment_mime: Option<String>,
    pub attachment_size: Option<u64>,
    pub has_attachments: bool,
    /// Content-type tags: chunking strategy, language, markdown header
    /// chain, JSON path, code element kind.
    pub content_tags: BTreeMap<String, Value>,
    pub labels: Vec<String>,
}

impl ChunkMetadata {
    /// Seed chunk metadata from the owning document.
    pub fn from_document(doc: &Document) -> Self {
        Self {
            project_id: doc.project_id.clone(),
            source_type: doc.source_type.as_str().to_string(),
            source_name: doc.source_name.clone(),
            parent_document_id: doc.parent_document_id.clone(),
            total_chunks: 0,
            title: doc.metadata.title.clone(),
            section_title: None,
            breadcrumb: doc.metadata.breadcrumb.clone(),
            hierarchy_depth: doc.metadata.ancestors.len(),
            ancestors: doc.metadata.ancestors.clone(),
            children_ids: doc.metadata.children_ids.clone(),
            url: doc.metadata.url.clone(),
            author: doc.metadata.author.clone(),
            updated_at: doc.metadata.updated_at,
            is_attachment: doc.is_attachment,
            attachment_filename: doc.metadata.attachment_filename.clone(),
            attachment_mime: doc.metadata.attachment_mime.clone(),
            attachment_size: doc.metadata.attachment_size,
            has_attachments: doc.metadata.has_attachments,
            content_tags: BTreeMap::new(),
            labels: doc.metadata.labels.clone(),
        }
    }
}

/// Outcome of a file-conversion attempt, recorded per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionOutcome {
    Converted,
    SkippedTooLarge,
    Failed,
    Unsupported,
}

impl ConversionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversionOutcome::Converted => "converted",
            ConversionOutcome::SkippedTooLarge => "skipped_too_large",
            ConversionOutcome::Failed => "failed",
            ConversionOutcome::Unsupported => "unsupported",
        }
    }
}

// ============ Stable identifiers ============

/// `document_id = hex(sha256(project, type, name, uri))[..32]`.
pub fn document_id(
    project_id: &str,
    source_type: SourceType,
    source_name: &str,
    source_uri: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(source_type.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(source_name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(source_uri.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// `chunk_id = hex(sha256(document_id, chunk_index, chunker_version))[..32]`.
pub fn chunk_id(document_id: &str, chunk_index: usize, chunker_version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(chunk_index.to_le_bytes());
    hasher.update(b"\x1f");
    hasher.update(chunker_version.to_le_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}

/// Deterministic content hash over post-conversion text plus the metadata
/// fields that participate in change detection.
pub fn content_hash(text: &str, metadata: &DocMetadata) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.replace("\r\n", "\n").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(metadata.title.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(
        metadata
            .updated_at
            .map(|t| t.timestamp().to_string())
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update(b"\x1f");
    hasher.update(metadata.breadcrumb.join("/").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Qdrant point ids must be UUIDs or integers; build a UUID from the first
/// 16 bytes of the chunk-id digest so point ids stay reproducible.
pub fn point_uuid(chunk_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(chunk_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Uuid::from_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_ids_are_stable() {
        let a = document_id("p", SourceType::Git, "repo", "docs/a.md");
        let b = document_id("p", SourceType::Git, "repo", "docs/a.md");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn document_ids_differ_per_component() {
        let base = document_id("p", SourceType::Git, "repo", "docs/a.md");
        assert_ne!(base, document_id("p2", SourceType::Git, "repo", "docs/a.md"));
        assert_ne!(
            base,
            document_id("p", SourceType::LocalFile, "repo", "docs/a.md")
        );
        assert_ne!(base, document_id("p", SourceType::Git, "other", "docs/a.md"));
        assert_ne!(base, document_id("p", SourceType::Git, "repo", "docs/b.md"));
    }

    #[test]
    fn chunk_ids_depend_on_version() {
        let a = chunk_id("doc", 0, 1);
        let b = chunk_id("doc", 0, 2);
        assert_ne!(a, b);
    }

    #[test]
    fn content_hash_normalizes_line_endings() {
        let meta = DocMetadata::default();
        assert_eq!(content_hash("a\r\nb", &meta), content_hash("a\nb", &meta));
    }

    #[test]
    fn content_hash_tracks_title() {
        let mut meta = DocMetadata::default();
        let h1 = content_hash("body", &meta);
        meta.title = Some("Title".into());
        let h2 = content_hash("body", &meta);
        assert_ne!(h1, h2);
    }

    #[test]
    fn point_uuid_is_valid_and_stable() {
        let u1 = point_uuid("abc123");
        let u2 = point_uuid("abc123");
        assert_eq!(u1, u2);
        assert!(uuid::Uuid::parse_str(&u1).is_ok());
    }
}
