//! Public documentation site connector.
//!
//! Crawls a site from `base_url`, following same-host links whose path
//! starts with `path_pattern`, up to `max_pages` pages. Main content is
//! extracted with the configured CSS selector, elements matching
//! `remove_selectors` are stripped, and attachments discovered through
//! `attachment_selectors` are downloaded as dependent documents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use super::{get_with_retry, SourceAuth, SourceConnector};
use crate::config::PublicDocsSourceConfig;
use crate::error::{Result, SemIndexError};
use crate::models::{Document, DocumentContent, SourceType};

pub struct PublicDocsConnector {
    project_id: String,
    name: String,
    config: PublicDocsSourceConfig,
    client: reqwest::Client,
}

impl PublicDocsConnector {
    pub fn new(project_id: String, name: String, config: PublicDocsSourceConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            project_id,
            name,
            config,
            client,
        })
    }

    fn origin(&self) -> Result<String> {
        let url = self.config.base_url.trim_end_matches('/');
        let scheme_end = url
            .find("://")
            .ok_or_else(|| SemIndexError::Config(format!("invalid base_url: {url}")))?;
        let host_end = url[scheme_end + 3..]
            .find('/')
            .map(|i| scheme_end + 3 + i)
            .unwrap_or(url.len());
        Ok(url[..host_end].to_string())
    }

    /// Resolve an href against the origin; `None` for off-site or
    /// non-crawlable links.
    fn resolve(&self, origin: &str, href: &str) -> Option<String> {
        let href = href.split('#').next().unwrap_or("");
        if href.is_empty()
            || href.starts_with("mailto:")
            || href.starts_with("javascript:")
        {
            return None;
        }
        if let Some(rest) = href.strip_prefix(origin) {
            return Some(format!("{origin}{rest}"));
        }
        if href.starts_with("http://") || href.starts_with("https://") {
            return None;
        }
        if href.starts_with('/') {
            return Some(format!("{origin}{href}"));
        }
        None
    }

    fn page_document(&self, url: &str, html: &str) -> (Option<Document>, Vec<String>, Vec<String>) {
        let document = Html::parse_document(html);

        // Links to crawl next.
        let link_selector = Selector::parse("a[href]").unwrap();
        let links: Vec<String> = document
            .select(&link_selector)
            .filter_map(|a| a.value().attr("href"))
            .map(String::from)
            .collect();

        // Attachment URLs.
        let mut attachment_urls = Vec::new();
        for selector_str in &self.config.attachment_selectors {
            if let Ok(selector) = Selector::parse(selector_str) {
                for el in document.select(&selector) {
                    if let Some(href) = el.value().attr("href") {
                        attachment_urls.push(href.to_string());
                    }
                }
            }
        }

        // Main content under the configured selector, minus removals.
        let content_selector = match Selector::parse(&self.config.content_selector) {
            Ok(s) => s,
            Err(_) => return (None, links, attachment_urls),
        };
        let removed: HashSet<_> = self
            .config
            .remove_selectors
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .flat_map(|sel| document.select(&sel).map(|el| el.id()).collect::<Vec<_>>())
            .collect();

        let mut content = String::new();
        for root in document.select(&content_selector) {
            for node in root.descendants() {
                if let Some(text) = node.value().as_text() {
                    let under_removed = node
                        .ancestors()
                        .any(|a| removed.contains(&a.id()));
                    if !under_removed {
                        content.push_str(text);
                    }
                } else if let Some(el) = node.value().as_element() {
                    if matches!(el.name(), "p" | "div" | "li" | "h1" | "h2" | "h3" | "h4" | "br") {
                        content.push('\n');
                    }
                }
            }
            content.push('\n');
        }
        let content = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("\n");

        if content.is_empty() {
            return (None, links, attachment_urls);
        }

        let title_selector = Selector::parse("title").unwrap();
        let title = document
            .select(&title_selector)
            .next()
            .map(|t| t.text().collect::<String>().trim().to_string());

        let mut doc = Document::new(
            &self.project_id,
            SourceType::PublicDocs,
            &self.name,
            url,
            DocumentContent::Text(content),
            "text/html",
        );
        doc.metadata.title = title;
        doc.metadata.url = Some(url.to_string());
        (Some(doc), links, attachment_urls)
    }
}

#[async_trait]
impl SourceConnector for PublicDocsConnector {
    fn source_type(&self) -> SourceType {
        SourceType::PublicDocs
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch_documents(&self, _since: Option<DateTime<Utc>>) -> Result<Vec<Document>> {
        let origin = self.origin()?;
        let auth = SourceAuth::None;

        let mut queue: VecDeque<String> = VecDeque::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut documents = Vec::new();

        let start = self.config.base_url.trim_end_matches('/').to_string();
        queue.push_back(start.clone());
        seen.insert(start);
        let mut fetched = 0usize;

        while let Some(url) = queue.pop_front() {
            if fetched >= self.config.max_pages {
                break;
            }
            fetched += 1;

            let response = match get_with_retry(&self.client, &url, &auth, "publicdocs").await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(%url, error = %e, "page fetch failed, skipping");
                    continue;
                }
            };
            let html = response.text().await.unwrap_or_default();
            let (page_doc, links, attachment_urls) = self.page_document(&url, &html);

            let parent = match page_doc {
                Some(mut doc) => {
                    // Fetch attachments before pushing so has_attachments is set.
                    let mut attachments = Vec::new();
                    for href in &attachment_urls {
                        if let Some(att_url) = self.resolve(&origin, href) {
                            if let Some(att) =
                                self.fetch_attachment(&att_url, &doc, &auth).await
                            {
                                attachments.push(att);
                            }
                        }
                    }
                    if !attachments.is_empty() {
                        doc.metadata.has_attachments = true;
                    }
                    documents.push(doc);
                    documents.extend(attachments);
                    true
                }
                None => false,
            };

            if !parent {
                tracing::debug!(%url, "no extractable content");
            }

            for href in links {
                if let Some(next) = self.resolve(&origin, &href) {
                    let path = next.strip_prefix(&origin).unwrap_or("/");
                    if !path.starts_with(&self.config.path_pattern) {
                        continue;
                    }
                    if seen.len() < self.config.max_pages && seen.insert(next.clone()) {
                        queue.push_back(next);
                    }
                }
            }
        }

        Ok(documents)
    }
}

impl PublicDocsConnector {
    async fn fetch_attachment(
        &self,
        url: &str,
        parent: &Document,
        auth: &SourceAuth,
    ) -> Option<Document> {
        let response = match get_with_retry(&self.client, url, auth, "publicdocs").await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%url, error = %e, "attachment fetch failed, skipping");
                return None;
            }
        };
        let mime = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .split(';')
            .next()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await.ok()?.to_vec();

        if bytes.len() as u64 > self.config.common.max_file_size {
            tracing::warn!(
                %url,
                size = bytes.len(),
                limit = self.config.common.max_file_size,
                "attachment exceeds max_file_size, skipping"
            );
            return None;
        }

        let filename = url.rsplit('/').next().unwrap_or("attachment").to_string();
        let mut doc = Document::new(
            &self.project_id,
            SourceType::PublicDocs,
            &self.name,
            url,
            DocumentContent::Binary(bytes.clone()),
            &mime,
        );
        doc.is_attachment = true;
        doc.parent_document_id = Some(parent.document_id.clone());
        doc.metadata.title = Some(filename.clone());
        doc.metadata.attachment_filename = Some(filename);
        doc.metadata.attachment_mime = Some(mime);
        doc.metadata.attachment_size = Some(bytes.len() as u64);
        doc.metadata.url = Some(url.to_string());
        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn connector(base_url: &str, max_pages: usize) -> PublicDocsConnector {
        PublicDocsConnector::new(
            "proj".into(),
            "site".into(),
            PublicDocsSourceConfig {
                base_url: base_url.to_string(),
                path_pattern: "/".into(),
                content_selector: "article".into(),
                remove_selectors: vec!["nav".into()],
                attachment_selectors: vec!["a.download".into()],
                max_pages,
                common: Default::default(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn crawls_same_host_links_and_extracts_content() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body(
                r#"<html><head><title>Home</title></head><body>
                   <article><p>Welcome to the docs.</p><nav>sidebar junk</nav></article>
                   <a href="/guide">guide</a>
                   <a href="https://elsewhere.example/x">offsite</a>
                   </body></html>"#,
            );
        });
        server.mock(|when, then| {
            when.method(GET).path("/guide");
            then.status(200).body(
                r#"<html><head><title>Guide</title></head><body>
                   <article><p>Guide content body.</p></article></body></html>"#,
            );
        });

        let docs = connector(&server.base_url(), 10).fetch_documents(None).await.unwrap();
        assert_eq!(docs.len(), 2);
        let home = &docs[0];
        assert_eq!(home.metadata.title.as_deref(), Some("Home"));
        let text = home.content.as_text().unwrap();
        assert!(text.contains("Welcome to the docs."));
        assert!(!text.contains("sidebar junk"), "remove_selectors must strip nav");
    }

    #[tokio::test]
    async fn max_pages_bounds_the_crawl() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body(
                r#"<html><body><article><p>root</p></article>
                   <a href="/p1">1</a><a href="/p2">2</a><a href="/p3">3</a></body></html>"#,
            );
        });
        for p in ["/p1", "/p2", "/p3"] {
            server.mock(move |when, then| {
                when.method(GET).path(p);
                then.status(200)
                    .body(format!("<html><body><article><p>page {p}</p></article></body></html>"));
            });
        }

        let docs = connector(&server.base_url(), 2).fetch_documents(None).await.unwrap();
        assert!(docs.len() <= 2, "crawled {} pages", docs.len());
    }

    #[tokio::test]
    async fn attachments_are_downloaded_and_linked() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/");
            then.status(200).body(
                r#"<html><body><article><p>with attachment</p></article>
                   <a class="download" href="/files/spec.pdf">spec</a></body></html>"#,
            );
        });
        server.mock(|when, then| {
            when.method(GET).path("/files/spec.pdf");
            then.status(200)
                .header("content-type", "application/pdf")
                .body("%PDF-fake");
        });

        let docs = connector(&server.base_url(), 5).fetch_documents(None).await.unwrap();
        let parent = docs.iter().find(|d| !d.is_attachment).unwrap();
        let att = docs.iter().find(|d| d.is_attachment).unwrap();
        assert!(parent.metadata.has_attachments);
        assert_eq!(att.parent_document_id.as_ref(), Some(&parent.document_id));
        assert_eq!(att.metadata.attachment_mime.as_deref(), Some("application/pdf"));
        assert_eq!(att.metadata.attachment_filename.as_deref(), Some("spec.pdf"));
    }
}
