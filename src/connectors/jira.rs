//! JIRA connector (cloud and data center).
//!
//! Paginates the issues of one project via the search API and emits one
//! document per issue: summary, description, comments (separator-joined)
//! and issue links. Attachments become dependent binary documents linked
//! back to the issue. Optional filters narrow by issue type and status.
//!
//! The connector throttles itself to `requests_per_minute` (default 60)
//! between API calls, on top of the shared 429 retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use super::{get_json, get_with_retry, SourceAuth, SourceConnector};
use crate::config::JiraSourceConfig;
use crate::error::Result;
use crate::models::{Document, DocumentContent, SourceType};

const PAGE_SIZE: usize = 50;

pub struct JiraConnector {
    project_id: String,
    name: String,
    config: JiraSourceConfig,
    client: reqwest::Client,
    auth: SourceAuth,
}

impl JiraConnector {
    pub fn new(project_id: String, name: String, config: JiraSourceConfig) -> Result<Self> {
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

    /// Pause between API calls to honor the configured request rate.
    async fn throttle(&self) {
        let rpm = self.config.requests_per_minute.max(1);
        tokio::time::sleep(Duration::from_secs_f64(60.0 / rpm as f64)).await;
    }

    fn jql(&self, since: Option<DateTime<Utc>>) -> String {
        let mut clauses = vec![format!("project={}", self.config.project_key)];
        if let Some(s) = since {
            clauses.push(format!("updated>='{}'", s.format("%Y-%m-%d %H:%M")));
        }
        clauses.join(" AND ")
    }

    fn issue_wanted(&self, issue: &Value) -> bool {
        let issue_type = issue
            .pointer("/fields/issuetype/name")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let status = issue
            .pointer("/fields/status/name")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let type_ok = self.config.issue_types.is_empty()
            || self.config.issue_types.iter().any(|t| t.eq_ignore_ascii_case(issue_type));
        let status_ok = self.config.include_statuses.is_empty()
            || self
                .config
                .include_statuses
                .iter()
                .any(|s| s.eq_ignore_ascii_case(status));
        type_ok && status_ok
    }

    fn issue_document(&self, issue: &Value) -> Document {
        let key = issue.get("key").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let fields = issue.get("fields").cloned().unwrap_or(Value::Null);

        let summary = fields.get("summary").and_then(|v| v.as_str()).unwrap_or("");
        let description = fields
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let mut body = format!("{summary}\n\n{description}");
        let comments: Vec<&str> = fields
            .pointer("/comment/comments")
            .and_then(|c| c.as_array())
            .map(|comments| {
                comments
                    .iter()
                    .filter_map(|c| c.get("body").and_then(|v| v.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        if !comments.is_empty() {
            body.push_str("\n\n--- Comments ---\n\n");
            body.push_str(&comments.join("\n\n---\n\n"));
        }

        let links: Vec<String> = fields
            .get("issuelinks")
            .and_then(|l| l.as_array())
            .map(|links| {
                links
                    .iter()
                    .filter_map(|l| {
                        let other = l.get("outwardIssue").or_else(|| l.get("inwardIssue"))?;
                        other.get("key").and_then(|v| v.as_str()).map(String::from)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut doc = Document::new(
            &self.project_id,
            SourceType::Jira,
            &self.name,
            &key,
            DocumentContent::Text(body),
            "text/plain",
        );
        doc.metadata.title = Some(format!("{key}: {summary}"));
        doc.metadata.space_key = Some(self.config.project_key.clone());
        doc.metadata.issue_links = links;
        doc.metadata.url = Some(format!("{}/browse/{key}", self.base()));
        doc.metadata.author = fields
            .pointer("/creator/displayName")
            .and_then(|v| v.as_str())
            .map(String::from);
        doc.metadata.created_at = parse_jira_time(fields.get("created"));
        doc.metadata.updated_at = parse_jira_time(fields.get("updated"));
        if let Some(labels) = fields.get("labels").and_then(|l| l.as_array()) {
            doc.metadata.labels = labels
                .iter()
                .filter_map(|l| l.as_str())
                .map(String::from)
                .collect();
        }
        doc
    }

    async fn attachment_documents(
        &self,
        issue: &Value,
        parent: &Document,
    ) -> Result<Vec<Document>> {
        let attachments = issue
            .pointer("/fields/attachment")
            .and_then(|a| a.as_array())
            .cloned()
            .unwrap_or_default();

        let mut docs = Vec::new();
        for attachment in attachments {
            let att_id = attachment.get("id").and_then(|v| v.as_str()).unwrap_or("");
            let filename = attachment
                .get("filename")
                .and_then(|v| v.as_str())
                .unwrap_or("attachment");
            let mime = attachment
                .get("mimeType")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream");
            let size = attachment.get("size").and_then(|v| v.as_u64());

            if size.map(|s| s > self.config.common.max_file_size).unwrap_or(false) {
                tracing::warn!(
                    file = filename,
                    size,
                    limit = self.config.common.max_file_size,
                    "attachment exceeds max_file_size, skipping"
                );
                continue;
            }

            let content_url = attachment.get("content").and_then(|v| v.as_str());
            let bytes = match content_url {
                Some(url) => {
                    self.throttle().await;
                    let resp = get_with_retry(&self.client, url, &self.auth, "jira").await?;
                    resp.bytes().await?.to_vec()
                }
                None => Vec::new(),
            };

            let mut doc = Document::new(
                &self.project_id,
                SourceType::Jira,
                &self.name,
                &format!("{}/attachment/{att_id}", parent.source_uri),
                DocumentContent::Binary(bytes),
                mime,
            );
            doc.is_attachment = true;
            doc.parent_document_id = Some(parent.document_id.clone());
            doc.metadata.title = Some(filename.to_string());
            doc.metadata.attachment_filename = Some(filename.to_string());
            doc.metadata.attachment_mime = Some(mime.to_string());
            doc.metadata.attachment_size = size;
            doc.metadata.url = content_url.map(String::from);
            doc.metadata.space_key = Some(self.config.project_key.clone());
            docs.push(doc);
        }
        Ok(docs)
    }
}

fn parse_jira_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        // JIRA timestamps look like 2024-03-01T10:00:00.000+0100.
        .and_then(|s| {
            DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.3f%z")
                .or_else(|_| DateTime::parse_from_rfc3339(s))
                .ok()
        })
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl SourceConnector for JiraConnector {
    fn source_type(&self) -> SourceType {
        SourceType::Jira
    }

    fn source_name(&self) -> &str {
        &self.name
    }

    async fn fetch_documents(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let mut start_at = 0usize;
        let jql = self.jql(since);

        loop {
            let url = format!(
                "{}/rest/api/2/search?jql={}&startAt={}&maxResults={}&fields=summary,description,comment,issuelinks,attachment,issuetype,status,labels,creator,created,updated",
                self.base(),
                urlencode(&jql),
                start_at,
                PAGE_SIZE
            );
            let body = get_json(&self.client, &url, &self.auth, "jira").await?;
            let issues = body
                .get("issues")
                .and_then(|i| i.as_array())
                .cloned()
                .unwrap_or_default();
            let count = issues.len();

            for issue in &issues {
                if !self.issue_wanted(issue) {
                    continue;
                }
                let mut doc = self.issue_document(issue);
                if self.config.include_attachments {
                    let attachments = self.attachment_documents(issue, &doc).await?;
                    if !attachments.is_empty() {
                        doc.metadata.has_attachments = true;
                    }
                    documents.push(doc);
                    documents.extend(attachments);
                } else {
                    documents.push(doc);
                }
            }

            let total = body.get("total").and_then(|t| t.as_u64()).unwrap_or(0) as usize;
            start_at += count;
            if count == 0 || start_at >= total {
                break;
            }
            self.throttle().await;
        }
        Ok(documents)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn connector(base_url: &str, issue_types: Vec<String>) -> JiraConnector {
        JiraConnector::new(
            "proj".into(),
            "tracker".into(),
            JiraSourceConfig {
                base_url: base_url.to_string(),
                project_key: "PLAT".into(),
                email: Some("me@example.com".into()),
                token: Some("tok".into()),
                pat: None,
                issue_types,
                include_statuses: vec![],
                requests_per_minute: 6000,
                include_attachments: true,
                common: Default::default(),
            },
        )
        .unwrap()
    }

    fn issue(key: &str, issue_type: &str, comments: Vec<&str>) -> Value {
        json!({
            "key": key,
            "fields": {
                "summary": format!("Summary of {key}"),
                "description": "Long description.",
                "issuetype": {"name": issue_type},
                "status": {"name": "Open"},
                "comment": {"comments": comments.iter().map(|c| json!({"body": c})).collect::<Vec<_>>()},
                "issuelinks": [{"outwardIssue": {"key": "PLAT-99"}}],
                "labels": ["backend"],
                "creator": {"displayName": "Dana"},
                "created": "2024-01-01T09:00:00.000+0000",
                "updated": "2024-02-01T09:00:00.000+0000",
                "attachment": []
            }
        })
    }

    #[tokio::test]
    async fn issues_become_documents_with_comments_and_links() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/search");
            then.status(200).json_body(json!({
                "total": 1,
                "issues": [issue("PLAT-1", "Bug", vec!["first comment", "second comment"])]
            }));
        });

        let docs = connector(&server.base_url(), vec![])
            .fetch_documents(None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.source_uri, "PLAT-1");
        let text = doc.content.as_text().unwrap();
        assert!(text.contains("Long description."));
        assert!(text.contains("first comment"));
        assert!(text.contains("---"));
        assert_eq!(doc.metadata.issue_links, vec!["PLAT-99"]);
        assert_eq!(doc.metadata.author.as_deref(), Some("Dana"));
        assert!(doc.metadata.updated_at.is_some());
    }

    #[tokio::test]
    async fn issue_type_filter_drops_non_matching() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/rest/api/2/search");
            then.status(200).json_body(json!({
                "total": 2,
                "issues": [
                    issue("PLAT-1", "Bug", vec![]),
                    issue("PLAT-2", "Epic", vec![])
                ]
            }));
        });

        let docs = connector(&server.base_url(), vec!["bug".to_string()])
            .fetch_documents(None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_uri, "PLAT-1");
    }

    #[tokio::test]
    async fn attachments_link_back_to_issue() {
        let server = MockServer::start();
        let download_url = format!("{}/secure/attachment/10/spec.pdf", server.base_url());
        server.mock(move |when, then| {
            when.method(GET).path("/rest/api/2/search");
            then.status(200).json_body(json!({
                "total": 1,
                "issues": [{
                    "key": "PLAT-1",
                    "fields": {
                        "summary": "With attachment",
                        "description": "",
                        "issuetype": {"name": "Bug"},
                        "status": {"name": "Open"},
                        "attachment": [{
                            "id": "10",
                            "filename": "spec.pdf",
                            "mimeType": "application/pdf",
                            "size": 100,
                            "content": download_url
                        }]
                    }
                }]
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/secure/attachment/10/spec.pdf");
            then.status(200).body("%PDF-fake");
        });

        let docs = connector(&server.base_url(), vec![])
            .fetch_documents(None)
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        let parent = docs.iter().find(|d| !d.is_attachment).unwrap();
        let att = docs.iter().find(|d| d.is_attachment).unwrap();
        assert!(parent.metadata.has_attachments);
        assert_eq!(att.parent_document_id.as_ref(), Some(&parent.document_id));
    }

    #[test]
    fn jql_includes_since() {
        let c = connector("http://localhost", vec![]);
        let jql = c.jql(Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap()));
        assert!(jql.contains("project=PLAT"));
        assert!(jql.contains("updated>='2024-03-01 10:30'"));
    }

    use chrono::TimeZone;

    #[test]
    fn jira_timestamps_parse() {
        let t = parse_jira_time(Some(&json!("2024-03-01T10:00:00.000+0100")));
        assert!(t.is_some());
    }

    #[test]
    fn urlencode_escapes_spaces_and_quotes() {
        assert_eq!(urlencode("a b'c"), "a%20b%27c");
    }
}
