//! Confluence connector (cloud and data center).
//!
//! Paginates the pages of one space via the REST API, emitting the storage
//! body as HTML documents with `ancestors[]`, `children_ids[]`, breadcrumb
//! titles, and labels. Attachments are fetched per page and emitted as
//! dependent binary documents with `parent_document_id` already set.
//!
//! Authentication is Basic (email + API token, cloud) or Bearer (personal
//! access token, data center). HTTP 429 responses back off and retry via
//! the shared source retry helper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{get_json, get_with_retry, SourceAuth, SourceConnector};
use crate::config::ConfluenceSourceConfig;
use crate::error::Result;
use crate::models::{document_id, Document, DocumentContent, SourceType};

pub struct ConfluenceConnector {
    project_id: String,
    name: String,
    config: ConfluenceSourceConfig,
    client: reqwest::Client,
    auth: SourceAuth,
}

impl ConfluenceConnector {
    pub fn new(project_id: String, name: String, config: ConfluenceSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        let auth = SourceAuth::from_credentials(&config.email, &config.token, &config.pat);
        Ok(Self {
            project_id,
            name,
            config,
            client,
            auth,
        })
    }

    fn base(&self) -> String {
        self.config.base_url.trim_end_matches('/').to_string()
    }

    fn doc_id_for(&self, page_id: &str) -> String {
        document_id(&self.project_id, SourceType::Confluence, &self.name, page_id)
    }

    async fn fetch_pages(&self) -> Result<Vec<Value>> {
        let mut pages = Vec::new();
        let mut start = 0usize;
        let limit = self.config.page_limit;

        loop {
            let url = format!(
                "{}/rest/api/content?spaceKey={}&type=page&start={}&limit={}&expand=body.storage,ancestors,version,metadata.labels,history",
                self.base(),
                self.config.space_key,
                start,
                limit
            );
            let body = get_json(&self.client, &url, &self.auth, "confluence").await?;
            let results = body
                .get("results")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            let count = results.len();
            pages.extend(results);
            if count < limit {
                break;
            }
            start += limit;
        }
        Ok(pages)
    }

    fn page_document(&self, page: &Value, children: &BTreeMap<String, Vec<String>>) -> Document {
        let page_id = page.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let title = page.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let html = page
            .pointer("/body/storage/value")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        let mut doc = Document::new(
            &self.project_id,
            SourceType::Confluence,
            &self.name,
            &page_id,
            DocumentContent::Text(html),
            "text/html",
        );
        doc.metadata.title = Some(title.to_string());
        doc.metadata.space_key = Some(self.config.space_key.clone());
        doc.metadata.url = page
            .pointer("/_links/webui")
            .and_then(|v| v.as_str())
            .map(|path| format!("{}{path}", self.base()));
        doc.metadata.author = page
            .pointer("/history/createdBy/displayName")
            .and_then(|v| v.as_str())
            .map(String::from);
        doc.metadata.updated_at = page
            .pointer("/version/when")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        doc.metadata.created_at = page
            .pointer("/history/createdDate")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        if let Some(ancestors) = page.get("ancestors").and_then(|a| a.as_array()) {
            doc.metadata.ancestors = ancestors
                .iter()
                .filter_map(|a| a.get("id").and_then(|v| v.as_str()))
                .map(|id| self.doc_id_for(id))
                .collect();
            doc.metadata.breadcrumb = ancestors
                .iter()
                .filter_map(|a| a.get("title").and_then(|v| v.as_str()))
                .map(String::from)
                .collect();
        }
        if let Some(kids) = children.get(&page_id) {
            doc.metadata.children_ids = kids.clone();
        }
        if let Some(labels) = page.pointer("/metadata/labels/results").and_then(|l| l.as_array()) {
            doc.metadata.labels = labels
                .iter()
                .filter_map(|l| l.get("name").and_then(|v| v.as_str()))
                .map(String::from)
                .collect();
        }
        doc
    }

    async fn fetch_attachments(&self, page_id: &str, parent: &Document) -> Result<Vec<Document>> {
        let url = format!(
            "{}/rest/api/content/{}/child/attachment?expand=version&limit=50",
            self.base(),
            page_id
        );
        let body = get_json(&self.client, &url, &self.auth, "confluence").await?;
        let results = body
            .get("results")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        let mut attachments = Vec::new();
        for attachment in results {
            let att_id = attachment.get("id").and_then(|v| v.as_str()).unwrap_or("");
            let filename = attachment
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or("attachment");
            let mime = attachment
                .pointer("/extensions/mediaType")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream");
            let size = attachment
                .pointer("/extensions/fileSize")
                .and_then(|v| v.as_u64());

            if size.map(|s| s > self.config.common.max_file_size).unwrap_or(false) {
                tracing::warn!(
                    file = filename,
                    size,
                    limit = self.config.common.max_file_size,
                    "attachment exceeds max_file_size, skipping"
                );
                continue;
            }

            let download = attachment
                .pointer("/_links/download")
                .and_then(|v| v.as_str())
                .map(|path| format!("{}{path}", self.base()));
            let bytes = match &download {
                Some(url) => {
                    let resp = get_with_retry(&self.client, url, &self.auth, "confluence").await?;
                    resp.bytes().await?.to_vec()
                }
                None => Vec::new(),
            };

            let mut doc = Document::new(
                &self.project_id,
                SourceType::Confluence,
                &self.name,
                att_id,
                DocumentContent::Binary(bytes),
                mime,
            );
            doc.is_attachment = true;
            doc.parent_document_id = Some(parent.document_id.clone());
            doc.metadata.title = Some(filename.to_string());
            doc.metadata.attachment_filename = Some(filename.to_string());
            doc.metadata.attachment_mime = Some(mime.to_string());
            doc.metadata.attachment_size = size;
            doc.metadata.url = download;
            doc.metadata.space_key = Some(self.config.space_key.clone());
            doc.metadata.breadcrumb = {
                let mut b = parent.metadata.breadcrumb.clone();
                b.push(parent.title().to_string());
                b
            };
            doc.metadata.ancestors = {
                let mut a = parent.metadata.ancestors.clone();
                a.push(parent.document_id.clone());
                a
            };
            attachments.push(doc);
        }
        Ok(attachments)
    }
}

#[async_trait]
impl SourceConnector for ConfluenceConnector {
    fn source_type(&self) -> SourceType {
        SourceType::Confluence
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch_documents(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Document>> {
        let pages = self.fetch_pages().await?;

        // Derive children edges from the ancestor lists: a page's direct
        // parent is its last ancestor.
        let mut children: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for page in &pages {
            let id = page.get("id").and_then(|v| v.as_str()).unwrap_or("");
            if let Some(parent_id) = page
                .get("ancestors")
                .and_then(|a| a.as_array())
                .and_then(|a| a.last())
                .and_then(|p| p.get("id"))
                .and_then(|v| v.as_str())
            {
                children
                    .entry(parent_id.to_string())
                    .or_default()
                    .push(self.doc_id_for(id));
            }
        }

        let mut documents = Vec::new();
        for page in &pages {
            let mut doc = self.page_document(page, &children);

            // The observed set must stay complete for tombstone detection;
            // `since` only skips attachment downloads for untouched pages.
            let unchanged_since = matches!(
                (since, doc.metadata.updated_at),
                (Some(s), Some(u)) if u <= s
            );

            let page_id = page.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
            if self.config.include_attachments && !unchanged_since {
                let attachments = self.fetch_attachments(&page_id, &doc).await?;
                if !attachments.is_empty() {
                    doc.metadata.has_attachments = true;
                }
                documents.push(doc);
                documents.extend(attachments);
            } else {
                documents.push(doc);
            }
        }
        Ok(documents)
    }
}
