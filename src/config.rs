//! Configuration parsing and validation.
//!
//! semindex is configured via a single YAML file (`semindex.yaml` in the
//! workspace directory). The file has two top-level keys:
//!
//! - `global` — shared infrastructure: `qdrant`, `llm`, `chunking`,
//!   `state_management`, `file_conversion`, `pipeline`, `search`.
//! - `projects` — a mapping from project id to project definition, each
//!   carrying a `sources` mapping of source-type → source-name → config.
//!
//! Environment variables of the form `${NAME}` are expanded in every string
//! value before deserialization, so credentials stay out of the file:
//!
//! ```yaml
//! global:
//!   qdrant:
//!     url: ${QDRANT_URL}
//!     collection_name: semindex
//!   llm:
//!     provider: openai
//!     base_url: https://api.openai.com
//!     api_key: ${OPENAI_API_KEY}
//!     models:
//!       embeddings: text-embedding-3-small
//!     embeddings:
//!       vector_size: 1536
//! projects:
//!   platform:
//!     display_name: Platform docs
//!     sources:
//!       localfile:
//!         docs:
//!           base_path: ./docs
//! ```
//!
//! The configuration is loaded once at startup and treated as immutable for
//! the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, SemIndexError};

/// Top-level configuration document.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
    /// Workspace directory the config was loaded from. Not part of the YAML.
    #[serde(skip)]
    pub workspace: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GlobalConfig {
    pub qdrant: QdrantConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub state_management: StateConfig,
    #[serde(default)]
    pub file_conversion: FileConversionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

// ============ Vector store ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QdrantConfig {
    /// Qdrant endpoint, e.g. `http://localhost:6333`. The special value
    /// `memory:` selects the in-process store (tests, offline smoke runs).
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_collection_name")]
    pub collection_name: String,
}

fn default_collection_name() -> String {
    "semindex".to_string()
}

// ============ LLM provider ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    /// One of `openai`, `openai_compat`, `ollama`, `custom`, `fake`.
    pub provider: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Extra headers sent on every request (the `custom` provider's hook).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub models: ModelsConfig,
    /// `cl100k_base` or `none`.
    #[serde(default = "default_tokenizer")]
    pub tokenizer: String,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    pub embeddings: EmbeddingsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelsConfig {
    pub embeddings: String,
    #[serde(default)]
    pub chat: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RequestConfig {
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_s_min")]
    pub backoff_s_min: f64,
    #[serde(default = "default_backoff_s_max")]
    pub backoff_s_max: f64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_timeout_s(),
            max_retries: default_max_retries(),
            backoff_s_min: default_backoff_s_min(),
            backoff_s_max: default_backoff_s_max(),
        }
    }
}

fn default_timeout_s() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_s_min() -> f64 {
    1.0
}
fn default_backoff_s_max() -> f64 {
    32.0
}
fn default_tokenizer() -> String {
    "cl100k_base".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitConfig {
    /// Requests per minute. 0 disables the cap.
    #[serde(default = "default_rpm")]
    pub rpm: u32,
    /// Tokens per minute. 0 disables the cap.
    #[serde(default = "default_tpm")]
    pub tpm: u32,
    /// Maximum in-flight requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rpm: default_rpm(),
            tpm: default_tpm(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_rpm() -> u32 {
    600
}
fn default_tpm() -> u32 {
    0
}
fn default_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingsConfig {
    pub vector_size: usize,
    #[serde(default = "default_max_tokens_per_request")]
    pub max_tokens_per_request: usize,
    #[serde(default = "default_max_tokens_per_chunk")]
    pub max_tokens_per_chunk: usize,
}

fn default_max_tokens_per_request() -> usize {
    8000
}
fn default_max_tokens_per_chunk() -> usize {
    2000
}

// ============ Chunking ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    /// Chunk size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap in characters; clamped to `max_overlap_percentage × chunk_size`.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    #[serde(default = "default_max_chunks_per_document")]
    pub max_chunks_per_document: usize,
    #[serde(default = "default_max_overlap_percentage")]
    pub max_overlap_percentage: f64,
    #[serde(default)]
    pub markdown: MarkdownChunkingConfig,
    #[serde(default)]
    pub html: HtmlChunkingConfig,
    #[serde(default)]
    pub code: CodeChunkingConfig,
    #[serde(default)]
    pub json: JsonChunkingConfig,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            max_chunks_per_document: default_max_chunks_per_document(),
            max_overlap_percentage: default_max_overlap_percentage(),
            markdown: MarkdownChunkingConfig::default(),
            html: HtmlChunkingConfig::default(),
            code: CodeChunkingConfig::default(),
            json: JsonChunkingConfig::default(),
        }
    }
}

impl ChunkingConfig {
    /// Effective overlap: the configured value clamped to the percentage cap.
    pub fn effective_overlap(&self) -> usize {
        let cap = (self.max_overlap_percentage * self.chunk_size as f64).floor() as usize;
        self.chunk_overlap.min(cap)
    }
}

fn default_chunk_size() -> usize {
    1500
}
fn default_chunk_overlap() -> usize {
    200
}
fn default_min_chunk_size() -> usize {
    50
}
fn default_max_chunks_per_document() -> usize {
    500
}
fn default_max_overlap_percentage() -> f64 {
    0.25
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MarkdownChunkingConfig {
    /// Split on H1 only when the document has at least this many H1s.
    #[serde(default = "default_threshold_h1")]
    pub header_analysis_threshold_h1: usize,
    /// Also split on H3 when the document has at least this many H3s.
    #[serde(default = "default_threshold_h3")]
    pub header_analysis_threshold_h3: usize,
    #[serde(default = "default_min_section_size")]
    pub min_section_size: usize,
    #[serde(default = "default_max_chunks_per_section")]
    pub max_chunks_per_section: usize,
}

impl Default for MarkdownChunkingConfig {
    fn default() -> Self {
        Self {
            header_analysis_threshold_h1: default_threshold_h1(),
            header_analysis_threshold_h3: default_threshold_h3(),
            min_section_size: default_min_section_size(),
            max_chunks_per_section: default_max_chunks_per_section(),
        }
    }
}

fn default_threshold_h1() -> usize {
    2
}
fn default_threshold_h3() -> usize {
    4
}
fn default_min_section_size() -> usize {
    100
}
fn default_max_chunks_per_section() -> usize {
    50
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HtmlChunkingConfig {
    /// Below this size, use cheap text extraction instead of a DOM parse.
    #[serde(default = "default_simple_parsing_threshold")]
    pub simple_parsing_threshold: usize,
    #[serde(default = "default_max_html_size_for_parsing")]
    pub max_html_size_for_parsing: usize,
    #[serde(default = "default_true")]
    pub preserve_semantic_structure: bool,
}

impl Default for HtmlChunkingConfig {
    fn default() -> Self {
        Self {
            simple_parsing_threshold: default_simple_parsing_threshold(),
            max_html_size_for_parsing: default_max_html_size_for_parsing(),
            preserve_semantic_structure: true,
        }
    }
}

fn default_simple_parsing_threshold() -> usize {
    4096
}
fn default_max_html_size_for_parsing() -> usize {
    2 * 1024 * 1024
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CodeChunkingConfig {
    #[serde(default = "default_true")]
    pub enable_ast_parsing: bool,
    #[serde(default = "default_max_file_size_for_ast")]
    pub max_file_size_for_ast: usize,
    #[serde(default = "default_max_element_size")]
    pub max_element_size: usize,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: usize,
    #[serde(default = "default_true")]
    pub enable_dependency_analysis: bool,
}

impl Default for CodeChunkingConfig {
    fn default() -> Self {
        Self {
            enable_ast_parsing: true,
            max_file_size_for_ast: default_max_file_size_for_ast(),
            max_element_size: default_max_element_size(),
            max_recursion_depth: default_max_recursion_depth(),
            enable_dependency_analysis: true,
        }
    }
}

fn default_max_file_size_for_ast() -> usize {
    512 * 1024
}
fn default_max_element_size() -> usize {
    2000
}
fn default_max_recursion_depth() -> usize {
    8
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JsonChunkingConfig {
    #[serde(default = "default_max_json_size_for_parsing")]
    pub max_json_size_for_parsing: usize,
    #[serde(default = "default_max_array_items_per_chunk")]
    pub max_array_items_per_chunk: usize,
    #[serde(default = "default_max_object_keys_to_process")]
    pub max_object_keys_to_process: usize,
    #[serde(default = "default_true")]
    pub enable_schema_inference: bool,
}

impl Default for JsonChunkingConfig {
    fn default() -> Self {
        Self {
            max_json_size_for_parsing: default_max_json_size_for_parsing(),
            max_array_items_per_chunk: default_max_array_items_per_chunk(),
            max_object_keys_to_process: default_max_object_keys_to_process(),
            enable_schema_inference: true,
        }
    }
}

fn default_max_json_size_for_parsing() -> usize {
    1024 * 1024
}
fn default_max_array_items_per_chunk() -> usize {
    25
}
fn default_max_object_keys_to_process() -> usize {
    200
}

fn default_true() -> bool {
    true
}

// ============ State store ============

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct StateConfig {
    /// Defaults to `<workspace>/state/semindex.sqlite`.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl StateConfig {
    pub fn resolve_path(&self, workspace: &Path) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| workspace.join("state").join("semindex.sqlite"))
    }
}

// ============ File conversion ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FileConversionConfig {
    /// Files larger than this are not converted (bytes).
    #[serde(default = "default_conversion_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_conversion_timeout_s")]
    pub conversion_timeout_s: u64,
    #[serde(default)]
    pub markitdown: MarkitdownConfig,
}

impl Default for FileConversionConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_conversion_max_file_size(),
            conversion_timeout_s: default_conversion_timeout_s(),
            markitdown: MarkitdownConfig::default(),
        }
    }
}

fn default_conversion_max_file_size() -> u64 {
    50 * 1024 * 1024
}
fn default_conversion_timeout_s() -> u64 {
    60
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MarkitdownConfig {
    /// When set, image attachments get an LLM-generated caption section.
    #[serde(default)]
    pub enable_llm_descriptions: bool,
}

// ============ Pipeline ============

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_chunker_workers")]
    pub chunker_workers: usize,
    #[serde(default = "default_embedder_workers")]
    pub embedder_workers: usize,
    #[serde(default = "default_upserter_workers")]
    pub upserter_workers: usize,
    #[serde(default = "default_docs_queue")]
    pub docs_queue: usize,
    #[serde(default = "default_chunks_queue")]
    pub chunks_queue: usize,
    #[serde(default = "default_upsert_queue")]
    pub upsert_queue: usize,
    #[serde(default = "default_max_upsert_retries")]
    pub max_upsert_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunker_workers: default_chunker_workers(),
            embedder_workers: default_embedder_workers(),
            upserter_workers: default_upserter_workers(),
            docs_queue: default_docs_queue(),
            chunks_queue: default_chunks_queue(),
            upsert_queue: default_upsert_queue(),
            max_upsert_retries: default_max_upsert_retries(),
        }
    }
}

fn default_chunker_workers() -> usize {
    4
}
fn default_embedder_workers() -> usize {
    2
}
fn default_upserter_workers() -> usize {
    2
}
fn default_docs_queue() -> usize {
    16
}
fn default_chunks_queue() -> usize {
    64
}
fn default_upsert_queue() -> usize {
    16
}
fn default_max_upsert_retries() -> u32 {
    3
}

// ============ Search ============

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SearchConfig {
    #[serde(default)]
    pub similarity: SimilarityWeights,
}

/// Weights for the composite cross-document similarity score.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SimilarityWeights {
    #[serde(default = "default_entity_weight")]
    pub entity: f64,
    #[serde(default = "default_topic_weight")]
    pub topic: f64,
    #[serde(default = "default_metadata_weight")]
    pub metadata: f64,
    #[serde(default = "default_hierarchy_weight")]
    pub hierarchy: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            entity: default_entity_weight(),
            topic: default_topic_weight(),
            metadata: default_metadata_weight(),
            hierarchy: default_hierarchy_weight(),
        }
    }
}

fn default_entity_weight() -> f64 {
    0.3
}
fn default_topic_weight() -> f64 {
    0.3
}
fn default_metadata_weight() -> f64 {
    0.2
}
fn default_hierarchy_weight() -> f64 {
    0.2
}

// ============ Projects ============

#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub git: BTreeMap<String, GitSourceConfig>,
    #[serde(default)]
    pub confluence: BTreeMap<String, ConfluenceSourceConfig>,
    #[serde(default)]
    pub jira: BTreeMap<String, JiraSourceConfig>,
    #[serde(default)]
    pub publicdocs: BTreeMap<String, PublicDocsSourceConfig>,
    #[serde(default)]
    pub localfile: BTreeMap<String, LocalFileSourceConfig>,
}

impl SourcesConfig {
    pub fn is_empty(&self) -> bool {
        self.git.is_empty()
            && self.confluence.is_empty()
            && self.jira.is_empty()
            && self.publicdocs.is_empty()
            && self.localfile.is_empty()
    }
}

/// Fields shared by every source type.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CommonSourceConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Extension allow list; empty means everything.
    #[serde(default)]
    pub file_types: Vec<String>,
    /// Files larger than this are skipped with a warning (bytes).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_true")]
    pub enable_file_conversion: bool,
    /// Synthesize folder documents and fill ancestors/breadcrumbs.
    #[serde(default)]
    pub preserve_hierarchy: bool,
}

impl Default for CommonSourceConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            file_types: Vec::new(),
            max_file_size: default_max_file_size(),
            enable_file_conversion: true,
            preserve_hierarchy: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitSourceConfig {
    pub url: String,
    #[serde(default = "default_git_branch")]
    pub branch: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub common: CommonSourceConfig,
}

fn default_git_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConfluenceSourceConfig {
    pub base_url: String,
    pub space_key: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    /// Personal access token (data center deployments).
    #[serde(default)]
    pub pat: Option<String>,
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    #[serde(flatten)]
    pub common: CommonSourceConfig,
}

fn default_page_limit() -> usize {
    50
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JiraSourceConfig {
    pub base_url: String,
    pub project_key: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub pat: Option<String>,
    #[serde(default)]
    pub issue_types: Vec<String>,
    #[serde(default)]
    pub include_statuses: Vec<String>,
    #[serde(default = "default_jira_rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "default_true")]
    pub include_attachments: bool,
    #[serde(flatten)]
    pub common: CommonSourceConfig,
}

fn default_jira_rpm() -> u32 {
    60
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PublicDocsSourceConfig {
    pub base_url: String,
    #[serde(default = "default_path_pattern")]
    pub path_pattern: String,
    #[serde(default = "default_content_selector")]
    pub content_selector: String,
    #[serde(default)]
    pub remove_selectors: Vec<String>,
    #[serde(default)]
    pub attachment_selectors: Vec<String>,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(flatten)]
    pub common: CommonSourceConfig,
}

fn default_path_pattern() -> String {
    "/".to_string()
}
fn default_content_selector() -> String {
    "article, main".to_string()
}
fn default_max_pages() -> usize {
    200
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocalFileSourceConfig {
    pub base_path: PathBuf,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(flatten)]
    pub common: CommonSourceConfig,
}

// ============ Loading ============

/// Default config file name inside the workspace.
pub const CONFIG_FILE: &str = "semindex.yaml";

/// Load and validate the configuration from `<workspace>/semindex.yaml`.
///
/// `${NAME}` references are expanded from the environment in every string
/// value; an unset variable expands to the empty string.
pub fn load_config(workspace: &Path) -> Result<Config> {
    let path = workspace.join(CONFIG_FILE);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| SemIndexError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    load_config_from_str(&content, workspace)
}

/// Parse configuration from a YAML string (used by tests and `load_config`).
pub fn load_config_from_str(content: &str, workspace: &Path) -> Result<Config> {
    let mut value: serde_yml::Value = serde_yml::from_str(content)
        .map_err(|e| SemIndexError::Config(format!("invalid YAML: {e}")))?;
    expand_env_vars(&mut value);

    // The pre-unification `embeddings` block at global level is gone; point
    // users at the llm section instead of silently ignoring it.
    if let Some(global) = value.get("global") {
        if global.get("embeddings").is_some() && global.get("llm").is_none() {
            return Err(SemIndexError::Config(
                "legacy 'global.embeddings' block is no longer supported; use 'global.llm'".into(),
            ));
        }
    }

    let mut config: Config = serde_yml::from_value(value)
        .map_err(|e| SemIndexError::Config(format!("invalid configuration: {e}")))?;
    config.workspace = workspace.to_path_buf();
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let g = &config.global;

    if g.chunking.chunk_size == 0 {
        return Err(SemIndexError::Config("chunking.chunk_size must be > 0".into()));
    }
    if !(0.0..=1.0).contains(&g.chunking.max_overlap_percentage) {
        return Err(SemIndexError::Config(
            "chunking.max_overlap_percentage must be in [0.0, 1.0]".into(),
        ));
    }
    if g.chunking.min_chunk_size > g.chunking.chunk_size {
        return Err(SemIndexError::Config(
            "chunking.min_chunk_size must not exceed chunk_size".into(),
        ));
    }
    if g.llm.embeddings.vector_size == 0 {
        return Err(SemIndexError::Config(
            "llm.embeddings.vector_size must be > 0".into(),
        ));
    }
    match g.llm.provider.as_str() {
        "openai" | "openai_compat" | "ollama" | "custom" | "fake" => {}
        other => {
            return Err(SemIndexError::Config(format!(
                "unknown llm.provider '{other}'; use openai, openai_compat, ollama, custom, or fake"
            )))
        }
    }
    match g.llm.tokenizer.as_str() {
        "cl100k_base" | "none" => {}
        other => {
            return Err(SemIndexError::Config(format!(
                "unknown llm.tokenizer '{other}'; use cl100k_base or none"
            )))
        }
    }
    if g.qdrant.url.trim().is_empty() {
        return Err(SemIndexError::Config("qdrant.url must not be empty".into()));
    }

    for (project_id, project) in &config.projects {
        if project_id.trim().is_empty() {
            return Err(SemIndexError::Config("project id must not be empty".into()));
        }
        if project.sources.is_empty() {
            tracing::warn!(project = %project_id, "project has no sources configured");
        }
    }

    Ok(())
}

/// Expand `${NAME}` in every string scalar of the YAML tree, in place.
fn expand_env_vars(value: &mut serde_yml::Value) {
    match value {
        serde_yml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_env_str(s);
            }
        }
        serde_yml::Value::Sequence(seq) => {
            for v in seq {
                expand_env_vars(v);
            }
        }
        serde_yml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_env_vars(v);
            }
        }
        _ => {}
    }
}

fn expand_env_str(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

// ============ Redacted display ============

/// Render the effective configuration as YAML with secret values replaced
/// by `***`. Used by `semx config`.
pub fn redacted_yaml(raw: &str) -> Result<String> {
    let mut value: serde_yml::Value = serde_yml::from_str(raw)
        .map_err(|e| SemIndexError::Config(format!("invalid YAML: {e}")))?;
    redact(&mut value, None);
    serde_yml::to_string(&value).map_err(|e| SemIndexError::Config(e.to_string()))
}

fn redact(value: &mut serde_yml::Value, key: Option<&str>) {
    match value {
        serde_yml::Value::String(s) => {
            if let Some(k) = key {
                let k = k.to_ascii_lowercase();
                if (k.contains("token") || k.contains("key") || k.contains("password") || k == "pat")
                    && !s.is_empty()
                {
                    *s = "***".to_string();
                }
            }
        }
        serde_yml::Value::Sequence(seq) => {
            for v in seq {
                redact(v, key);
            }
        }
        serde_yml::Value::Mapping(map) => {
            let keys: Vec<serde_yml::Value> = map.keys().cloned().collect();
            for k in keys {
                let key_str = k.as_str().map(|s| s.to_string());
                if let Some(v) = map.get_mut(&k) {
                    redact(v, key_str.as_deref());
                }
            }
        }
        _ => {}
    }
}
