//! Content-aware chunking engine.
//!
//! A document is dispatched to one of five strategies by its
//! (post-conversion) content type:
//!
//! | Strategy | Module | Selected for |
//! |----------|--------|--------------|
//! | Markdown | [`markdown`] | `.md`, converted office/PDF content |
//! | HTML | [`html`] | `.html`, `text/html` |
//! | Code | [`code`] | common source-file extensions |
//! | JSON | [`json`] | `.json`, `application/json` |
//! | Default | [`text`] | everything else |
//!
//! All strategies interpret `chunk_size`/`chunk_overlap` as character
//! counts, are pure functions of `(content, configuration,
//! CHUNKER_VERSION)`, and cap their output at `max_chunks_per_document`.
//! Chunk ids derive from `(document_id, chunk_index, CHUNKER_VERSION)`, so
//! re-chunking unchanged content reproduces identical ids.

pub mod code;
pub mod html;
pub mod json;
pub mod markdown;
pub mod text;

use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::ChunkingConfig;
use crate::models::{chunk_id, Chunk, ChunkMetadata, Document, CHUNKER_VERSION};

/// Intermediate chunk produced by a strategy, before ids and document
/// metadata are attached.
#[derive(Debug, Clone, Default)]
pub struct Piece {
    pub content: String,
    pub section_title: Option<String>,
    /// Strategy-specific extras (header chain, JSON path, element kind...).
    pub tags: BTreeMap<String, Value>,
}

impl Piece {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tag(mut self, key: &str, value: Value) -> Self {
        self.tags.insert(key.to_string(), value);
        self
    }
}

/// The chunking strategy chosen for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Markdown,
    Html,
    Code,
    Json,
    Default,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Markdown => "markdown",
            Strategy::Html => "html",
            Strategy::Code => "code",
            Strategy::Json => "json",
            Strategy::Default => "default",
        }
    }
}

/// Extensions treated as source code by the dispatcher.
const CODE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "c", "h", "cpp", "hpp", "cc", "cs", "rb",
    "php", "swift", "kt", "scala", "sh", "bash", "sql", "lua", "zig",
];

/// Office formats whose converted output is Markdown.
const CONVERTED_EXTENSIONS: &[&str] = &["pdf", "docx", "pptx", "xlsx", "doc", "ppt", "xls"];

/// Pick the strategy for a document.
///
/// Tie-break order: converted office content is Markdown; then extension or
/// MIME; then the plain-text default.
pub fn detect_strategy(content_type: &str, was_converted: bool) -> Strategy {
    let ct = content_type.to_ascii_lowercase();
    let ext = ct
        .rsplit('.')
        .next()
        .unwrap_or(&ct)
        .trim_start_matches('.');

    if was_converted || CONVERTED_EXTENSIONS.contains(&ext) {
        return Strategy::Markdown;
    }
    if ext == "md" || ext == "markdown" || ct == "text/markdown" {
        return Strategy::Markdown;
    }
    if ext == "html" || ext == "htm" || ct == "text/html" {
        return Strategy::Html;
    }
    if ext == "json" || ct == "application/json" {
        return Strategy::Json;
    }
    if CODE_EXTENSIONS.contains(&ext) {
        return Strategy::Code;
    }
    Strategy::Default
}

/// Chunk a document's (post-conversion) text into vector-store-ready
/// [`Chunk`]s.
pub fn chunk_document(
    doc: &Document,
    content: &str,
    was_converted: bool,
    is_excel_sheet: bool,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let strategy = detect_strategy(&doc.content_type, was_converted);

    let mut pieces = match strategy {
        Strategy::Markdown => markdown::chunk_markdown(
            content,
            config,
            is_excel_sheet || doc.metadata.is_excel_sheet,
        ),
        Strategy::Html => html::chunk_html(content, config),
        Strategy::Code => code::chunk_code(content, &doc.content_type, config),
        Strategy::Json => json::chunk_json(content, config),
        Strategy::Default => text::chunk_plain(content, config),
    };

    if pieces.len() > config.max_chunks_per_document {
        tracing::warn!(
            document = %doc.document_id,
            produced = pieces.len(),
            cap = config.max_chunks_per_document,
            "chunk cap exceeded, truncating"
        );
        pieces.truncate(config.max_chunks_per_document);
    }

    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| {
            let mut metadata = ChunkMetadata::from_document(doc);
            metadata.total_chunks = total;
            metadata.section_title = piece.section_title;
            metadata.content_tags = piece.tags;
            metadata
                .content_tags
                .insert("strategy".into(), Value::String(strategy.as_str().into()));
            Chunk {
                chunk_id: chunk_id(&doc.document_id, index, CHUNKER_VERSION),
                document_id: doc.document_id.clone(),
                chunk_index: index,
                content: piece.content,
                metadata,
            }
        })
        .collect()
}

// ============ Shared helpers ============

/// Largest byte index `<= idx` that is a char boundary. Exposed for callers
/// that truncate chunk content post-hoc (token clamping).
pub fn clamp_boundary(s: &str, idx: usize) -> usize {
    floor_char_boundary(s, idx)
}

/// Largest byte index `<= idx` that is a char boundary.
pub(crate) fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Find a split point at or before `limit`, preferring the last whitespace
/// in the tail of the window so words stay intact. Returns a byte index in
/// `(0, limit]`.
pub(crate) fn split_point(s: &str, limit: usize) -> usize {
    let hard = floor_char_boundary(s, limit);
    if hard >= s.len() {
        return s.len();
    }
    // Only look back over the final quarter of the window; a word longer
    // than that gets cut rather than producing a tiny chunk.
    let window_start = floor_char_boundary(s, hard.saturating_sub(limit / 4));
    match s[window_start..hard].rfind(char::is_whitespace) {
        Some(pos) => window_start + pos + 1,
        None => hard.max(1),
    }
}

/// Trailing slice of up to `overlap` characters, starting at a char
/// boundary. Used to seed the next window of a sliding-window split.
pub(crate) fn overlap_tail(s: &str, overlap: usize) -> &str {
    if overlap == 0 || s.is_empty() {
        return "";
    }
    let start = floor_char_boundary(s, s.len().saturating_sub(overlap));
    &s[start..]
}
