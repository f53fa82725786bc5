//! Local filesystem connector.
//!
//! Walks a directory root, applies glob include/exclude patterns and the
//! extension allow list, and emits one document per matching file. Binary
//! office formats are read as bytes for conversion; everything else is read
//! as UTF-8 (files that decode as neither are skipped).
//!
//! With `preserve_hierarchy`, directories become lightweight folder
//! documents and every document carries `ancestors[]` plus a breadcrumb of
//! directory segments.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use walkdir::WalkDir;

use super::{FileFilter, SourceConnector};
use crate::config::LocalFileSourceConfig;
use crate::error::{Result, SemIndexError};
use crate::models::{document_id, Document, DocumentContent, SourceType};

/// Extensions read as raw bytes for the file converter.
const BINARY_EXTENSIONS: &[&str] = &["pdf", "docx", "pptx", "xlsx"];

pub(crate) fn binary_mime(ext: &str) -> Option<&'static str> {
    match ext {
        "pdf" => Some(crate::convert::MIME_PDF),
        "docx" => Some(crate::convert::MIME_DOCX),
        "pptx" => Some(crate::convert::MIME_PPTX),
        "xlsx" => Some(crate::convert::MIME_XLSX),
        _ => None,
    }
}

pub struct LocalFileConnector {
    project_id: String,
    name: String,
    config: LocalFileSourceConfig,
}

impl LocalFileConnector {
    pub fn new(project_id: String, name: String, config: LocalFileSourceConfig) -> Self {
        Self {
            project_id,
            name,
            config,
        }
    }
}

#[async_trait]
impl SourceConnector for LocalFileConnector {
    fn source_type(&self) -> SourceType {
        SourceType::LocalFile
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch_documents(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<Document>> {
        let root = &self.config.base_path;
        if !root.exists() {
            return Err(SemIndexError::Config(format!(
                "localfile root does not exist: {}",
                root.display()
            )));
        }

        let filter = FileFilter::new(&self.config.common)?;
        let mut documents = Vec::new();
        let mut folders: Vec<String> = Vec::new();

        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry.map_err(|e| SemIndexError::Other(e.to_string()))?;
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if entry.file_type().is_dir() {
                if self.config.common.preserve_hierarchy && !rel_str.is_empty() {
                    folders.push(rel_str.clone());
                }
                continue;
            }
            if !entry.file_type().is_file() || !filter.matches(&rel_str) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| SemIndexError::Other(e.to_string()))?;
            if !filter.size_ok(&rel_str, metadata.len()) {
                continue;
            }

            if let Some(doc) = self.file_document(path, &rel_str, &metadata)? {
                documents.push(doc);
            }
        }

        if self.config.common.preserve_hierarchy {
            for folder in folders {
                documents.push(self.folder_document(&folder));
            }
            self.link_hierarchy(&mut documents);
        }

        documents.sort_by(|a, b| a.source_uri.cmp(&b.source_uri));
        Ok(documents)
    }
}

impl LocalFileConnector {
    fn file_document(
        &self,
        path: &Path,
        rel_str: &str,
        metadata: &std::fs::Metadata,
    ) -> Result<Option<Document>> {
        let modified_secs = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let (content, content_type) = if let Some(mime) = binary_mime(&ext) {
            if self.config.common.enable_file_conversion {
                (DocumentContent::Binary(std::fs::read(path)?), mime.to_string())
            } else {
                tracing::debug!(file = rel_str, "conversion disabled, skipping binary file");
                return Ok(None);
            }
        } else {
            match std::fs::read_to_string(path) {
                Ok(text) => (DocumentContent::Text(text), rel_str.to_string()),
                Err(_) => {
                    tracing::debug!(file = rel_str, "not valid UTF-8, skipping");
                    return Ok(None);
                }
            }
        };

        let mut doc = Document::new(
            &self.project_id,
            SourceType::LocalFile,
            &self.name,
            rel_str,
            content,
            &content_type,
        );
        doc.metadata.title = path.file_name().map(|n| n.to_string_lossy().to_string());
        doc.metadata.updated_at = Utc.timestamp_opt(modified_secs, 0).single();
        doc.metadata.created_at = doc.metadata.updated_at;
        doc.metadata.url = Some(format!("file://{}", path.display()));
        if self.config.common.preserve_hierarchy {
            doc.metadata.breadcrumb = breadcrumb_of(rel_str);
        }
        Ok(Some(doc))
    }

    fn folder_document(&self, rel_str: &str) -> Document {
        let name = rel_str.rsplit('/').next().unwrap_or(rel_str);
        let mut doc = Document::new(
            &self.project_id,
            SourceType::LocalFile,
            &self.name,
            rel_str,
            DocumentContent::Text(format!("Folder: {name}")),
            "folder",
        );
        doc.metadata.title = Some(name.to_string());
        doc.metadata.breadcrumb = breadcrumb_of(rel_str);
        doc
    }

    /// Fill `ancestors[]`/`children_ids[]` from path structure; edges are
    /// materialized on both endpoints.
    fn link_hierarchy(&self, documents: &mut [Document]) {
        let id_of = |uri: &str| {
            document_id(&self.project_id, SourceType::LocalFile, &self.name, uri)
        };

        // Parent uri → child ids.
        let mut children: std::collections::BTreeMap<String, Vec<String>> = Default::default();
        for doc in documents.iter() {
            if let Some(parent) = parent_path(&doc.source_uri) {
                children
                    .entry(parent)
                    .or_default()
                    .push(doc.document_id.clone());
            }
        }

        for doc in documents.iter_mut() {
            let mut ancestors = Vec::new();
            let mut current = parent_path(&doc.source_uri);
            while let Some(p) = current {
                ancestors.push(id_of(&p));
                current = parent_path(&p);
            }
            ancestors.reverse();
            doc.metadata.ancestors = ancestors;
            if let Some(kids) = children.get(&doc.source_uri) {
                doc.metadata.children_ids = kids.clone();
            }
        }
    }
}

fn parent_path(rel: &str) -> Option<String> {
    rel.rfind('/').map(|i| rel[..i].to_string())
}

fn breadcrumb_of(rel: &str) -> Vec<String> {
    let mut parts: Vec<String> = rel.split('/').map(|s| s.to_string()).collect();
    parts.pop();
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommonSourceConfig;
    use std::fs;

    fn connector(root: &Path, common: CommonSourceConfig) -> LocalFileConnector {
        LocalFileConnector::new(
            "proj".to_string(),
            "docs".to_string(),
            LocalFileSourceConfig {
                base_path: root.to_path_buf(),
                follow_symlinks: false,
                common,
            },
        )
    }

    fn md_common() -> CommonSourceConfig {
        CommonSourceConfig {
            include_globs: vec!["**/*.md".to_string()],
            ..CommonSourceConfig::default()
        }
    }

    #[tokio::test]
    async fn walks_matching_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.md"), "# A").unwrap();
        fs::write(tmp.path().join("b.txt"), "ignored").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/c.md"), "# C").unwrap();

        let docs = connector(tmp.path(), md_common())
            .fetch_documents(None)
            .await
            .unwrap();
        let uris: Vec<&str> = docs.iter().map(|d| d.source_uri.as_str()).collect();
        assert_eq!(uris, vec!["a.md", "sub/c.md"]);
        assert!(docs[0].metadata.updated_at.is_some());
    }

    #[tokio::test]
    async fn oversized_files_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("big.md"), "x".repeat(200)).unwrap();
        fs::write(tmp.path().join("small.md"), "ok").unwrap();

        let mut common = md_common();
        common.max_file_size = 100;
        let docs = connector(tmp.path(), common).fetch_documents(None).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_uri, "small.md");
    }

    #[tokio::test]
    async fn file_at_exact_size_limit_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("edge.md"), "x".repeat(100)).unwrap();

        let mut common = md_common();
        common.max_file_size = 100;
        let docs = connector(tmp.path(), common).fetch_documents(None).await.unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn binary_extensions_become_binary_documents() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("r.pdf"), b"%PDF-junk").unwrap();

        let mut common = md_common();
        common.include_globs = vec!["**/*".to_string()];
        let docs = connector(tmp.path(), common).fetch_documents(None).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].needs_conversion());
        assert_eq!(docs[0].content_type, crate::convert::MIME_PDF);
    }

    #[tokio::test]
    async fn missing_root_is_a_config_error() {
        let err = connector(Path::new("/nonexistent/nowhere"), md_common())
            .fetch_documents(None)
            .await
            .unwrap_err();
        assert!(matches!(err, SemIndexError::Config(_)));
    }

    #[tokio::test]
    async fn hierarchy_synthesizes_folders_and_links() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("guide/install")).unwrap();
        fs::write(tmp.path().join("guide/install/steps.md"), "# Steps").unwrap();

        let mut common = md_common();
        common.preserve_hierarchy = true;
        let docs = connector(tmp.path(), common).fetch_documents(None).await.unwrap();

        let uris: Vec<&str> = docs.iter().map(|d| d.source_uri.as_str()).collect();
        assert!(uris.contains(&"guide"));
        assert!(uris.contains(&"guide/install"));
        assert!(uris.contains(&"guide/install/steps.md"));

        let file = docs.iter().find(|d| d.source_uri.ends_with(".md")).unwrap();
        assert_eq!(file.metadata.ancestors.len(), 2);
        assert_eq!(file.metadata.breadcrumb, vec!["guide", "install"]);

        let folder = docs.iter().find(|d| d.source_uri == "guide/install").unwrap();
        assert!(folder.metadata.children_ids.contains(&file.document_id));
    }
}
