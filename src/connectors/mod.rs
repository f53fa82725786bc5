//! Source connectors.
//!
//! One connector per supported source type, each implementing
//! [`SourceConnector`]: scan the external source and return the documents
//! (and attachments, pre-linked via `parent_document_id`) observed on this
//! run. Connectors never write state; change detection happens downstream
//! in the pipeline.
//!
//! | Connector | Source | Module |
//! |-----------|--------|--------|
//! | Local files | directory walk | [`localfile`] |
//! | Git | clone/fetch + working-tree walk | [`git`] |
//! | Confluence | space page + attachment pagination | [`confluence`] |
//! | JIRA | issue pagination with comments/links | [`jira`] |
//! | Public docs | same-host crawl with CSS extraction | [`publicdocs`] |

pub mod confluence;
pub mod git;
pub mod jira;
pub mod localfile;
pub mod publicdocs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use crate::config::{CommonSourceConfig, Config};
use crate::error::{Result, SemIndexError};
use crate::models::{Document, SourceType};

/// A data source that produces documents for ingestion.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Instance name within its type (e.g. `"platform"`).
    fn source_name(&self) -> &str;

    /// Scan the source and return every observed document. `since` is the
    /// last successful run's timestamp; connectors that can filter
    /// server-side use it, the rest return everything and let change
    /// detection drop the unchanged.
    async fn fetch_documents(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Document>>;
}

/// Build all connectors for a project, optionally narrowed to one source
/// type and/or source name.
pub fn build_connectors(
    config: &Config,
    project_id: &str,
    source_type: Option<SourceType>,
    source_name: Option<&str>,
) -> Result<Vec<Box<dyn SourceConnector>>> {
    let project = config
        .projects
        .get(project_id)
        .ok_or_else(|| SemIndexError::Config(format!("unknown project: {project_id}")))?;

    let wanted = |t: SourceType, name: &str| {
        source_type.map(|st| st == t).unwrap_or(true)
            && source_name.map(|sn| sn == name).unwrap_or(true)
    };

    let mut connectors: Vec<Box<dyn SourceConnector>> = Vec::new();
    for (name, cfg) in &project.sources.localfile {
        if wanted(SourceType::LocalFile, name) {
            connectors.push(Box::new(localfile::LocalFileConnector::new(
                project_id.to_string(),
                name.clone(),
                cfg.clone(),
            )));
        }
    }
    for (name, cfg) in &project.sources.git {
        if wanted(SourceType::Git, name) {
            connectors.push(Box::new(git::GitConnector::new(
                project_id.to_string(),
                name.clone(),
                cfg.clone(),
                config.workspace.clone(),
            )));
        }
    }
    for (name, cfg) in &project.sources.confluence {
        if wanted(SourceType::Confluence, name) {
            connectors.push(Box::new(confluence::ConfluenceConnector::new(
                project_id.to_string(),
                name.clone(),
                cfg.clone(),
            )?));
        }
    }
    for (name, cfg) in &project.sources.jira {
        if wanted(SourceType::Jira, name) {
            connectors.push(Box::new(jira::JiraConnector::new(
                project_id.to_string(),
                name.clone(),
                cfg.clone(),
            )?));
        }
    }
    for (name, cfg) in &project.sources.publicdocs {
        if wanted(SourceType::PublicDocs, name) {
            connectors.push(Box::new(publicdocs::PublicDocsConnector::new(
                project_id.to_string(),
                name.clone(),
                cfg.clone(),
            )?));
        }
    }
    Ok(connectors)
}

// ============ Shared file filtering ============

/// Directories excluded from every walk regardless of configuration.
pub(crate) const DEFAULT_EXCLUDES: &[&str] =
    &["**/.git/**", "**/target/**", "**/node_modules/**"];

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| SemIndexError::Config(format!("invalid glob '{pattern}': {e}")))?,
        );
    }
    builder
        .build()
        .map_err(|e| SemIndexError::Config(e.to_string()))
}

/// Compiled include/exclude/file-type filter shared by the file-walking
/// connectors.
pub(crate) struct FileFilter {
    include: GlobSet,
    exclude: GlobSet,
    file_types: Vec<String>,
    max_file_size: u64,
}

impl FileFilter {
    pub fn new(common: &CommonSourceConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(common.exclude_globs.clone());
        Ok(Self {
            include: build_globset(&common.include_globs)?,
            exclude: build_globset(&excludes)?,
            file_types: common
                .file_types
                .iter()
                .map(|t| t.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_file_size: common.max_file_size,
        })
    }

    /// Whether a relative path passes globs and the extension allow list.
    pub fn matches(&self, relative: &str) -> bool {
        if self.exclude.is_match(relative) || !self.include.is_match(relative) {
            return false;
        }
        if self.file_types.is_empty() {
            return true;
        }
        Path::new(relative)
            .extension()
            .map(|e| {
                self.file_types
                    .contains(&e.to_string_lossy().to_ascii_lowercase())
            })
            .unwrap_or(false)
    }

    /// Size gate; oversized files are skipped with a warning.
    pub fn size_ok(&self, relative: &str, size: u64) -> bool {
        if size > self.max_file_size {
            tracing::warn!(
                file = relative,
                size,
                limit = self.max_file_size,
                "file exceeds max_file_size, skipping"
            );
            false
        } else {
            true
        }
    }
}

// ============ Shared HTTP helpers ============

/// Authentication for remote source APIs.
#[derive(Debug, Clone)]
pub(crate) enum SourceAuth {
    None,
    /// Basic auth from email + API token (Atlassian cloud).
    Basic { email: String, token: String },
    /// Bearer personal access token (data center).
    Bearer(String),
}

impl SourceAuth {
    pub fn from_credentials(
        email: &Option<String>,
        token: &Option<String>,
        pat: &Option<String>,
    ) -> Self {
        if let Some(pat) = pat.as_ref().filter(|p| !p.is_empty()) {
            return SourceAuth::Bearer(pat.clone());
        }
        match (email, token) {
            (Some(e), Some(t)) if !e.is_empty() && !t.is_empty() => SourceAuth::Basic {
                email: e.clone(),
                token: t.clone(),
            },
            _ => SourceAuth::None,
        }
    }

    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            SourceAuth::None => request,
            SourceAuth::Basic { email, token } => {
                use base64::Engine;
                let encoded =
                    base64::engine::general_purpose::STANDARD.encode(format!("{email}:{token}"));
                request.header("Authorization", format!("Basic {encoded}"))
            }
            SourceAuth::Bearer(pat) => request.bearer_auth(pat),
        }
    }
}

const SOURCE_MAX_ATTEMPTS: u32 = 4;

/// GET with rate-limit-aware retry: 429 and 5xx back off and retry, other
/// failures surface immediately.
pub(crate) async fn get_with_retry(
    client: &reqwest::Client,
    url: &str,
    auth: &SourceAuth,
    target: &str,
) -> Result<reqwest::Response> {
    let mut last_err: Option<SemIndexError> = None;
    for attempt in 0..SOURCE_MAX_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(500 * (1 << attempt))).await;
        }
        let request = auth.apply(client.get(url));
        match request.send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }
                let err = SemIndexError::from_status(
                    status.as_u16(),
                    target,
                    resp.text().await.unwrap_or_default(),
                );
                if err.is_transient() {
                    tracing::warn!(%url, status = status.as_u16(), attempt, "transient source error");
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }
            Err(e) => {
                last_err = Some(SemIndexError::TransientNetwork {
                    target: target.to_string(),
                    detail: e.to_string(),
                });
            }
        }
    }
    Err(match last_err {
        Some(e) => SemIndexError::SourceStalled {
            source_name: target.to_string(),
            detail: e.to_string(),
        },
        None => SemIndexError::Other("request failed".into()),
    })
}

pub(crate) async fn get_json(
    client: &reqwest::Client,
    url: &str,
    auth: &SourceAuth,
    target: &str,
) -> Result<Value> {
    let resp = get_with_retry(client, url, auth, target).await?;
    Ok(resp.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(file_types: &[&str]) -> CommonSourceConfig {
        CommonSourceConfig {
            include_globs: vec!["**/*.md".to_string(), "**/*.rs".to_string()],
            exclude_globs: vec!["**/drafts/**".to_string()],
            file_types: file_types.iter().map(|s| s.to_string()).collect(),
            max_file_size: 100,
            enable_file_conversion: true,
            preserve_hierarchy: false,
        }
    }

    #[test]
    fn include_and_exclude_globs() {
        let filter = FileFilter::new(&common(&[])).unwrap();
        assert!(filter.matches("docs/guide.md"));
        assert!(filter.matches("src/lib.rs"));
        assert!(!filter.matches("docs/drafts/wip.md"));
        assert!(!filter.matches("image.png"));
        assert!(!filter.matches(".git/config.md"));
    }

    #[test]
    fn file_type_allow_list() {
        let filter = FileFilter::new(&common(&["md"])).unwrap();
        assert!(filter.matches("docs/guide.md"));
        assert!(!filter.matches("src/lib.rs"));
    }

    #[test]
    fn size_gate_boundary() {
        let filter = FileFilter::new(&common(&[])).unwrap();
        assert!(filter.size_ok("a.md", 100));
        assert!(!filter.size_ok("a.md", 101));
    }

    #[test]
    fn auth_prefers_pat() {
        let auth = SourceAuth::from_credentials(
            &Some("me@example.com".into()),
            &Some("tok".into()),
            &Some("pat-123".into()),
        );
        assert!(matches!(auth, SourceAuth::Bearer(_)));
    }

    #[test]
    fn auth_falls_back_to_basic_then_none() {
        let auth =
            SourceAuth::from_credentials(&Some("me@example.com".into()), &Some("tok".into()), &None);
        assert!(matches!(auth, SourceAuth::Basic { .. }));
        let none = SourceAuth::from_credentials(&None, &None, &None);
        assert!(matches!(none, SourceAuth::None));
    }
}
