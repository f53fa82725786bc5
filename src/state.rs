//! Ingestion state store.
//!
//! Tracks, per document: the content hash used for change detection, the
//! chunk-id set currently in the vector store, conversion outcomes, and
//! tombstones. All mutations are per-document transactional: a crash
//! mid-run leaves earlier documents committed and the in-flight document
//! either fully absent or fully replaced.
//!
//! Schema upgrades are additive; stale columns are tolerated.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::models::{ConversionOutcome, Document, SourceType};

/// Classification of one run's observations against the stored state.
#[derive(Debug, Default)]
pub struct DiffResult {
    pub new: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// Stored (non-tombstoned) documents absent from the observed set.
    pub deleted: Vec<String>,
}

/// Handle over the SQLite-backed state database.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables and indexes. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                document_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                source_uri TEXT NOT NULL,
                content_hash TEXT,
                converted INTEGER NOT NULL DEFAULT 0,
                last_seen_ts INTEGER NOT NULL,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                parent_document_id TEXT,
                is_attachment INTEGER NOT NULL DEFAULT 0,
                extras TEXT NOT NULL DEFAULT '{}',
                UNIQUE(project_id, source_type, source_name, source_uri)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                created_ts INTEGER NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents(document_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversion_events (
                document_id TEXT NOT NULL,
                ts INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS source_runs (
                project_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_name TEXT NOT NULL,
                last_success_ts INTEGER NOT NULL,
                PRIMARY KEY (project_id, source_type, source_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_scope \
             ON documents(project_id, source_type, source_name)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Classify observed documents against stored hashes.
    ///
    /// `observed` maps document id → freshly computed content hash. Stored
    /// rows under the same (project, source) scope that are missing from
    /// `observed` come back as `deleted` (tombstone candidates).
    pub async fn diff(
        &self,
        project_id: &str,
        source_type: SourceType,
        source_name: &str,
        observed: &HashMap<String, String>,
    ) -> Result<DiffResult> {
        let rows = sqlx::query(
            "SELECT document_id, content_hash, tombstoned FROM documents \
             WHERE project_id = ? AND source_type = ? AND source_name = ?",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(source_name)
        .fetch_all(&self.pool)
        .await?;

        let mut stored: HashMap<String, (Option<String>, bool)> = HashMap::new();
        for row in &rows {
            let id: String = row.get("document_id");
            let hash: Option<String> = row.get("content_hash");
            let tombstoned: bool = row.get::<i64, _>("tombstoned") != 0;
            stored.insert(id, (hash, tombstoned));
        }

        let mut result = DiffResult::default();
        for (id, hash) in observed {
            match stored.get(id) {
                None => result.new.push(id.clone()),
                Some((_, true)) => result.updated.push(id.clone()),
                Some((stored_hash, false)) => {
                    if stored_hash.as_deref() == Some(hash.as_str()) {
                        result.unchanged.push(id.clone());
                    } else {
                        result.updated.push(id.clone());
                    }
                }
            }
        }
        for (id, (_, tombstoned)) in &stored {
            if !tombstoned && !observed.contains_key(id) {
                result.deleted.push(id.clone());
            }
        }

        result.new.sort();
        result.updated.sort();
        result.unchanged.sort();
        result.deleted.sort();
        Ok(result)
    }

    /// Stored content hash for one document: `Some((hash, tombstoned))`
    /// when a row exists. Used by chunker workers for per-document change
    /// detection as documents stream through the pipeline.
    pub async fn stored_hash(&self, document_id: &str) -> Result<Option<(Option<String>, bool)>> {
        let row = sqlx::query(
            "SELECT content_hash, tombstoned FROM documents WHERE document_id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| {
            (
                r.get::<Option<String>, _>("content_hash"),
                r.get::<i64, _>("tombstoned") != 0,
            )
        }))
    }

    /// Chunk ids currently recorded for a document, in chunk order.
    pub async fn chunks_for(&self, document_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT chunk_id FROM chunks WHERE document_id = ? ORDER BY chunk_index",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("chunk_id")).collect())
    }

    /// Commit a document after its chunks were upserted: write the new
    /// content hash, replace the chunk-id set, refresh `last_seen_ts`, and
    /// clear any tombstone. One transaction.
    pub async fn commit_document(
        &self,
        doc: &Document,
        content_hash: &str,
        converted: bool,
        chunk_ids: &[String],
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let extras = serde_json::to_string(&doc.metadata)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO documents
                (document_id, project_id, source_type, source_name, source_uri,
                 content_hash, converted, last_seen_ts, tombstoned,
                 parent_document_id, is_attachment, extras)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                converted = excluded.converted,
                last_seen_ts = excluded.last_seen_ts,
                tombstoned = 0,
                parent_document_id = excluded.parent_document_id,
                is_attachment = excluded.is_attachment,
                extras = excluded.extras
            "#,
        )
        .bind(&doc.document_id)
        .bind(&doc.project_id)
        .bind(doc.source_type.as_str())
        .bind(&doc.source_name)
        .bind(&doc.source_uri)
        .bind(content_hash)
        .bind(converted as i64)
        .bind(now)
        .bind(&doc.parent_document_id)
        .bind(doc.is_attachment as i64)
        .bind(&extras)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(&doc.document_id)
            .execute(&mut *tx)
            .await?;

        for (index, chunk_id) in chunk_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chunks (chunk_id, document_id, chunk_index, created_ts) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(&doc.document_id)
            .bind(index as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Refresh `last_seen_ts` for an unchanged document.
    pub async fn touch_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET last_seen_ts = ? WHERE document_id = ?")
            .bind(Utc::now().timestamp())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark a document tombstoned and return the chunk ids to delete from
    /// the vector store. The chunk rows are removed in the same transaction,
    /// keeping the invariant that the stored chunk set mirrors the vector
    /// store after each commit.
    pub async fn tombstone(&self, document_id: &str) -> Result<Vec<String>> {
        let chunk_ids = self.chunks_for(document_id).await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE documents SET tombstoned = 1, content_hash = NULL, last_seen_ts = ? \
             WHERE document_id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(chunk_ids)
    }

    /// Append a conversion event for auditing and `project status`.
    pub async fn record_conversion(
        &self,
        document_id: &str,
        outcome: ConversionOutcome,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversion_events (document_id, ts, outcome, detail) VALUES (?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(Utc::now().timestamp())
        .bind(outcome.as_str())
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Live (non-tombstoned) document ids under a (project, source) scope.
    pub async fn live_documents(
        &self,
        project_id: &str,
        source_type: SourceType,
        source_name: &str,
    ) -> Result<HashSet<String>> {
        let rows = sqlx::query(
            "SELECT document_id FROM documents \
             WHERE project_id = ? AND source_type = ? AND source_name = ? AND tombstoned = 0",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(source_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("document_id")).collect())
    }

    /// Timestamp of the last successful run over a (project, source) scope,
    /// handed to connectors as their `since` hint.
    pub async fn last_run(
        &self,
        project_id: &str,
        source_type: SourceType,
        source_name: &str,
    ) -> Result<Option<chrono::DateTime<Utc>>> {
        let ts: Option<i64> = sqlx::query_scalar(
            "SELECT last_success_ts FROM source_runs \
             WHERE project_id = ? AND source_type = ? AND source_name = ?",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0)))
    }

    /// Record a successful run over a (project, source) scope.
    pub async fn mark_run_success(
        &self,
        project_id: &str,
        source_type: SourceType,
        source_name: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO source_runs (project_id, source_type, source_name, last_success_ts)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(project_id, source_type, source_name)
            DO UPDATE SET last_success_ts = excluded.last_success_ts
            "#,
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(source_name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Per-project counters for `semx project status`.
    pub async fn project_counts(&self, project_id: &str) -> Result<ProjectCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS documents,
                COALESCE(SUM(is_attachment), 0) AS attachments,
                COALESCE(SUM(tombstoned), 0) AS tombstoned
            FROM documents WHERE project_id = ?
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        let chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c \
             JOIN documents d ON d.document_id = c.document_id WHERE d.project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ProjectCounts {
            documents: row.get::<i64, _>("documents") as u64,
            attachments: row.get::<i64, _>("attachments") as u64,
            tombstoned: row.get::<i64, _>("tombstoned") as u64,
            chunks: chunks as u64,
        })
    }
}

/// Counters reported by `semx project status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProjectCounts {
    pub documents: u64,
    pub attachments: u64,
    pub tombstoned: u64,
    pub chunks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentContent, SourceType};

    // Pooled connections each get their own `:memory:` database, so tests
    // run against a real file in a scratch dir.
    async fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("state.sqlite")).await.unwrap();
        let store = StateStore::new(pool);
        store.migrate().await.unwrap();
        (dir, store)
    }

    fn doc(uri: &str) -> Document {
        Document::new(
            "proj",
            SourceType::LocalFile,
            "docs",
            uri,
            DocumentContent::Text("body".into()),
            "text/markdown",
        )
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let (_dir, store) = store().await;
        store.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn commit_then_diff_unchanged() {
        let (_dir, store) = store().await;
        let d = doc("a.md");
        store
            .commit_document(&d, "hash-1", false, &["c1".into(), "c2".into()])
            .await
            .unwrap();

        let mut observed = HashMap::new();
        observed.insert(d.document_id.clone(), "hash-1".to_string());
        let diff = store
            .diff("proj", SourceType::LocalFile, "docs", &observed)
            .await
            .unwrap();
        assert_eq!(diff.unchanged, vec![d.document_id.clone()]);
        assert!(diff.new.is_empty() && diff.updated.is_empty() && diff.deleted.is_empty());
    }

    #[tokio::test]
    async fn changed_hash_classifies_updated() {
        let (_dir, store) = store().await;
        let d = doc("a.md");
        store
            .commit_document(&d, "hash-1", false, &["c1".into()])
            .await
            .unwrap();

        let mut observed = HashMap::new();
        observed.insert(d.document_id.clone(), "hash-2".to_string());
        let diff = store
            .diff("proj", SourceType::LocalFile, "docs", &observed)
            .await
            .unwrap();
        assert_eq!(diff.updated, vec![d.document_id]);
    }

    #[tokio::test]
    async fn missing_document_classifies_deleted() {
        let (_dir, store) = store().await;
        let d = doc("a.md");
        store
            .commit_document(&d, "hash-1", false, &["c1".into()])
            .await
            .unwrap();

        let diff = store
            .diff("proj", SourceType::LocalFile, "docs", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(diff.deleted, vec![d.document_id]);
    }

    #[tokio::test]
    async fn commit_replaces_chunk_set() {
        let (_dir, store) = store().await;
        let d = doc("a.md");
        store
            .commit_document(&d, "hash-1", false, &["c1".into(), "c2".into()])
            .await
            .unwrap();
        store
            .commit_document(&d, "hash-2", false, &["c3".into()])
            .await
            .unwrap();

        let chunks = store.chunks_for(&d.document_id).await.unwrap();
        assert_eq!(chunks, vec!["c3".to_string()]);
    }

    #[tokio::test]
    async fn empty_document_commits_with_no_chunks() {
        let (_dir, store) = store().await;
        let d = doc("empty.md");
        store.commit_document(&d, "hash-e", false, &[]).await.unwrap();
        assert!(store.chunks_for(&d.document_id).await.unwrap().is_empty());

        let mut observed = HashMap::new();
        observed.insert(d.document_id.clone(), "hash-e".to_string());
        let diff = store
            .diff("proj", SourceType::LocalFile, "docs", &observed)
            .await
            .unwrap();
        assert_eq!(diff.unchanged.len(), 1);
    }

    #[tokio::test]
    async fn tombstone_returns_chunks_and_marks_row() {
        let (_dir, store) = store().await;
        let d = doc("a.md");
        store
            .commit_document(&d, "hash-1", false, &["c1".into(), "c2".into()])
            .await
            .unwrap();

        let removed = store.tombstone(&d.document_id).await.unwrap();
        assert_eq!(removed, vec!["c1".to_string(), "c2".to_string()]);
        assert!(store.chunks_for(&d.document_id).await.unwrap().is_empty());

        // Tombstoned row re-observed → updated, not new.
        let mut observed = HashMap::new();
        observed.insert(d.document_id.clone(), "hash-1".to_string());
        let diff = store
            .diff("proj", SourceType::LocalFile, "docs", &observed)
            .await
            .unwrap();
        assert_eq!(diff.updated, vec![d.document_id]);
    }

    #[tokio::test]
    async fn conversion_events_append() {
        let (_dir, store) = store().await;
        let d = doc("big.pdf");
        store
            .record_conversion(&d.document_id, ConversionOutcome::SkippedTooLarge, None)
            .await
            .unwrap();
        store
            .record_conversion(&d.document_id, ConversionOutcome::Converted, Some("ok"))
            .await
            .unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversion_events WHERE document_id = ?")
                .bind(&d.document_id)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn run_checkpoint_round_trips() {
        let (_dir, store) = store().await;
        assert!(store
            .last_run("proj", SourceType::LocalFile, "docs")
            .await
            .unwrap()
            .is_none());

        store
            .mark_run_success("proj", SourceType::LocalFile, "docs")
            .await
            .unwrap();
        let ts = store
            .last_run("proj", SourceType::LocalFile, "docs")
            .await
            .unwrap()
            .unwrap();
        assert!((Utc::now() - ts).num_seconds() < 5);

        // Upsert path: marking again replaces the row.
        store
            .mark_run_success("proj", SourceType::LocalFile, "docs")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn project_counts_aggregate() {
        let (_dir, store) = store().await;
        let d1 = doc("a.md");
        let mut d2 = doc("b.pdf");
        d2.is_attachment = true;
        d2.parent_document_id = Some(d1.document_id.clone());
        store
            .commit_document(&d1, "h1", false, &["c1".into()])
            .await
            .unwrap();
        store
            .commit_document(&d2, "h2", true, &["c2".into(), "c3".into()])
            .await
            .unwrap();

        let counts = store.project_counts("proj").await.unwrap();
        assert_eq!(counts.documents, 2);
        assert_eq!(counts.attachments, 1);
        assert_eq!(counts.chunks, 3);
    }
}
