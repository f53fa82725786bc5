//! Ingestion pipeline orchestration.
//!
//! Four stages wired by bounded queues:
//!
//! ```text
//! Connector → [docs_q] → Chunker workers → [chunks_q] → Embedder workers → [upsert_q] → Upserter workers
//! ```
//!
//! Chunker workers run change detection, conversion and chunking, and
//! forward all chunks of one document as a single envelope. Embedder
//! workers coalesce chunks across envelopes into provider batches under
//! `max_tokens_per_request`, then split the vectors back per envelope.
//! Upserter workers replace the document's points in the vector store and
//! only then commit the state row, so each document's chunk set is replaced
//! atomically.
//!
//! Normal end-of-stream drains every queue; cancellation abandons in-flight
//! documents without committing them. A closed upstream queue is the drain
//! signal and the cancellation token is the abandon signal; a worker that
//! confuses the two exits while work is still queued.
//!
//! At the end of a run, state rows absent from the connector's observed set
//! are tombstoned and their points deleted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunking::chunk_document;
use crate::config::Config;
use crate::convert::FileConverter;
use crate::error::{Result, SemIndexError};
use crate::llm::{batch_by_tokens, LlmProvider};
use crate::models::{content_hash, Chunk, Document, SourceType};
use crate::state::StateStore;
use crate::vector::{Distance, Point, VectorStore};

/// Everything a pipeline worker needs, threaded explicitly instead of
/// living in globals.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<Config>,
    pub state: StateStore,
    pub provider: Arc<dyn LlmProvider>,
    pub vector: Arc<dyn VectorStore>,
    pub converter: Arc<FileConverter>,
    pub cancel: CancellationToken,
}

/// All chunks of one document traveling between stages as a unit.
struct Envelope {
    doc: Document,
    content_hash: String,
    converted: bool,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

/// Per-run counters and failures; summarized in logs and surfaced to the CLI.
#[derive(Default)]
pub struct RunReport {
    pub documents_seen: AtomicU64,
    pub unchanged: AtomicU64,
    pub converted: AtomicU64,
    pub chunked: AtomicU64,
    pub embedded: AtomicU64,
    pub upserted: AtomicU64,
    pub tombstoned: AtomicU64,
    pub embed_requests: AtomicU64,
    pub embed_retries: AtomicU64,
    pub failures: Mutex<Vec<(String, String)>>,
    pub connector_secs: Mutex<f64>,
    pub chunker_secs: Mutex<f64>,
    pub embedder_secs: Mutex<f64>,
    pub upserter_secs: Mutex<f64>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.failures.lock().unwrap().len()
    }

    fn record_failure(&self, uri: &str, error: &SemIndexError) {
        tracing::error!(document = uri, %error, "document failed");
        self.failures
            .lock()
            .unwrap()
            .push((uri.to_string(), error.to_string()));
    }

    pub fn log_summary(&self) {
        tracing::info!(
            documents_seen = self.documents_seen.load(Ordering::Relaxed),
            unchanged = self.unchanged.load(Ordering::Relaxed),
            converted = self.converted.load(Ordering::Relaxed),
            chunked = self.chunked.load(Ordering::Relaxed),
            embedded = self.embedded.load(Ordering::Relaxed),
            upserted = self.upserted.load(Ordering::Relaxed),
            tombstoned = self.tombstoned.load(Ordering::Relaxed),
            failed = self.failed(),
            connector_secs = *self.connector_secs.lock().unwrap(),
            chunker_secs = *self.chunker_secs.lock().unwrap(),
            embedder_secs = *self.embedder_secs.lock().unwrap(),
            upserter_secs = *self.upserter_secs.lock().unwrap(),
            "ingestion run complete"
        );
    }
}

/// Run one ingestion pass over a project's sources.
pub async fn run_ingest(
    ctx: &PipelineContext,
    project_id: &str,
    source_type: Option<SourceType>,
    source_name: Option<&str>,
    force: bool,
) -> Result<Arc<RunReport>> {
    let collection = &ctx.config.global.qdrant.collection_name;
    ctx.vector
        .init_collection(
            collection,
            ctx.config.global.llm.embeddings.vector_size,
            Distance::Cosine,
            false,
        )
        .await?;

    let connectors =
        crate::connectors::build_connectors(&ctx.config, project_id, source_type, source_name)?;
    if connectors.is_empty() {
        return Err(SemIndexError::Config(format!(
            "no sources configured for project '{project_id}' matching the given filters"
        )));
    }

    let report = Arc::new(RunReport::default());

    for connector in connectors {
        if ctx.cancel.is_cancelled() {
            break;
        }
        run_source(ctx, connector.as_ref(), project_id, force, &report).await?;
    }

    report.log_summary();
    Ok(report)
}

async fn run_source(
    ctx: &PipelineContext,
    connector: &dyn crate::connectors::SourceConnector,
    project_id: &str,
    force: bool,
    report: &Arc<RunReport>,
) -> Result<()> {
    let source_type = connector.source_type();
    let source_name = connector.source_name().to_string();
    tracing::info!(project = project_id, source = %source_type, name = %source_name, "scanning source");

    // `since` hints connectors toward server-side incrementality; change
    // detection stays authoritative. A forced run rescans everything.
    let since = if force {
        None
    } else {
        ctx.state
            .last_run(project_id, source_type, &source_name)
            .await?
    };

    let connector_start = Instant::now();
    let documents = match connector.fetch_documents(since).await {
        Ok(docs) => docs,
        Err(e @ (SemIndexError::Auth { .. } | SemIndexError::SourceStalled { .. })) => {
            // A dead source kills this source's pass, not the run.
            report.record_failure(&format!("{source_type}:{source_name}"), &e);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    *report.connector_secs.lock().unwrap() += connector_start.elapsed().as_secs_f64();

    report
        .documents_seen
        .fetch_add(documents.len() as u64, Ordering::Relaxed);
    let observed: HashSet<String> = documents.iter().map(|d| d.document_id.clone()).collect();

    let pipeline_cfg = &ctx.config.global.pipeline;
    let (docs_tx, docs_rx) = mpsc::channel::<Document>(pipeline_cfg.docs_queue);
    let (chunks_tx, chunks_rx) = mpsc::channel::<Envelope>(pipeline_cfg.chunks_queue);
    let (upsert_tx, upsert_rx) = mpsc::channel::<Envelope>(pipeline_cfg.upsert_queue);

    let docs_rx = Arc::new(tokio::sync::Mutex::new(docs_rx));
    let chunks_rx = Arc::new(tokio::sync::Mutex::new(chunks_rx));
    let upsert_rx = Arc::new(tokio::sync::Mutex::new(upsert_rx));

    let mut workers = Vec::new();

    for _ in 0..pipeline_cfg.chunker_workers.max(1) {
        let ctx = ctx.clone();
        let rx = Arc::clone(&docs_rx);
        let tx = chunks_tx.clone();
        let report = Arc::clone(report);
        workers.push(tokio::spawn(async move {
            chunker_worker(ctx, rx, tx, report, force).await;
        }));
    }
    drop(chunks_tx);

    for _ in 0..pipeline_cfg.embedder_workers.max(1) {
        let ctx = ctx.clone();
        let rx = Arc::clone(&chunks_rx);
        let tx = upsert_tx.clone();
        let report = Arc::clone(report);
        workers.push(tokio::spawn(async move {
            embedder_worker(ctx, rx, tx, report).await;
        }));
    }
    drop(upsert_tx);

    for _ in 0..pipeline_cfg.upserter_workers.max(1) {
        let ctx = ctx.clone();
        let rx = Arc::clone(&upsert_rx);
        let report = Arc::clone(report);
        workers.push(tokio::spawn(async move {
            upserter_worker(ctx, rx, report).await;
        }));
    }

    // Producer: feed documents; backpressure when docs_q is full.
    for doc in documents {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            sent = docs_tx.send(doc) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    drop(docs_tx);

    for worker in workers {
        let _ = worker.await;
    }

    if ctx.cancel.is_cancelled() {
        tracing::warn!("run cancelled, skipping tombstone sweep");
        return Ok(());
    }

    // Tombstone sweep: stored documents the connector no longer reports.
    let live = ctx
        .state
        .live_documents(project_id, source_type, &source_name)
        .await?;
    let collection = &ctx.config.global.qdrant.collection_name;
    for document_id in live.difference(&observed) {
        let chunk_ids = ctx.state.tombstone(document_id).await?;
        ctx.vector.delete_ids(collection, &chunk_ids).await?;
        report.tombstoned.fetch_add(1, Ordering::Relaxed);
        tracing::info!(document = %document_id, chunks = chunk_ids.len(), "tombstoned");
    }

    if report.failed() == 0 {
        ctx.state
            .mark_run_success(project_id, source_type, &source_name)
            .await?;
    }

    Ok(())
}

// ============ Stage workers ============

async fn chunker_worker(
    ctx: PipelineContext,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Document>>>,
    tx: mpsc::Sender<Envelope>,
    report: Arc<RunReport>,
    force: bool,
) {
    loop {
        let doc = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            doc = async { rx.lock().await.recv().await } => match doc {
                Some(d) => d,
                None => return, // end of stream: drain complete
            },
        };

        let started = Instant::now();
        let uri = doc.source_uri.clone();
        match process_document(&ctx, doc, force, &report).await {
            Ok(Some(envelope)) => {
                *report.chunker_secs.lock().unwrap() += started.elapsed().as_secs_f64();
                if tx.send(envelope).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                *report.chunker_secs.lock().unwrap() += started.elapsed().as_secs_f64();
            }
            Err(e) => report.record_failure(&uri, &e),
        }
    }
}

/// Change detection + conversion + chunking for one document. `None` means
/// the document is unchanged and was dropped.
async fn process_document(
    ctx: &PipelineContext,
    mut doc: Document,
    force: bool,
    report: &RunReport,
) -> Result<Option<Envelope>> {
    // Conversion first: the change-detection hash is over post-conversion
    // text, so unchanged binaries don't re-chunk.
    let (text, converted, is_excel) = match &doc.content {
        crate::models::DocumentContent::Text(t) => (t.clone(), false, false),
        crate::models::DocumentContent::Binary(bytes) => {
            let filename = doc
                .metadata
                .attachment_filename
                .clone()
                .unwrap_or_else(|| doc.source_uri.clone());
            let conversion = ctx
                .converter
                .convert(bytes, &doc.content_type, &filename)
                .await;
            ctx.state
                .record_conversion(&doc.document_id, conversion.outcome, conversion.detail.as_deref())
                .await?;
            if conversion.outcome == crate::models::ConversionOutcome::Converted {
                report.converted.fetch_add(1, Ordering::Relaxed);
            }
            (conversion.markdown, true, conversion.is_excel_sheet)
        }
    };

    if is_excel {
        doc.metadata.is_excel_sheet = true;
    }
    let hash = content_hash(&text, &doc.metadata);

    if !force {
        if let Some((stored, tombstoned)) = ctx.state.stored_hash(&doc.document_id).await? {
            if !tombstoned && stored.as_deref() == Some(hash.as_str()) {
                ctx.state.touch_document(&doc.document_id).await?;
                report.unchanged.fetch_add(1, Ordering::Relaxed);
                return Ok(None);
            }
        }
    }

    let mut chunks = chunk_document(&doc, &text, converted, is_excel, &ctx.config.global.chunking);

    // Chunk sizes are character-based; the tokenizer only enforces the
    // provider's per-chunk ceiling.
    let max_chunk_tokens = ctx.config.global.llm.embeddings.max_tokens_per_chunk;
    for chunk in &mut chunks {
        while ctx.provider.count_tokens(&chunk.content) > max_chunk_tokens
            && chunk.content.len() > 1
        {
            let cut = crate::chunking::clamp_boundary(&chunk.content, chunk.content.len() * 9 / 10);
            tracing::warn!(
                document = %doc.document_id,
                chunk = chunk.chunk_index,
                "chunk exceeds max_tokens_per_chunk, truncating"
            );
            chunk.content.truncate(cut);
        }
    }
    report.chunked.fetch_add(1, Ordering::Relaxed);

    Ok(Some(Envelope {
        doc,
        content_hash: hash,
        converted,
        chunks,
        vectors: Vec::new(),
    }))
}

async fn embedder_worker(
    ctx: PipelineContext,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    tx: mpsc::Sender<Envelope>,
    report: Arc<RunReport>,
) {
    let max_tokens = ctx.config.global.llm.embeddings.max_tokens_per_request;

    loop {
        // Pull one envelope, then coalesce whatever else is immediately
        // available while the token budget lasts.
        let mut envelopes: Vec<Envelope> = Vec::new();
        {
            let mut guard = rx.lock().await;
            let first = tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                e = guard.recv() => match e {
                    Some(e) => e,
                    None => return,
                },
            };
            let mut budget: usize = first
                .chunks
                .iter()
                .map(|c| ctx.provider.count_tokens(&c.content))
                .sum();
            envelopes.push(first);

            while budget < max_tokens && envelopes.len() < 8 {
                match guard.try_recv() {
                    Ok(e) => {
                        budget += e
                            .chunks
                            .iter()
                            .map(|c| ctx.provider.count_tokens(&c.content))
                            .sum::<usize>();
                        envelopes.push(e);
                    }
                    Err(_) => break,
                }
            }
        }

        let started = Instant::now();
        match embed_envelopes(&ctx, &mut envelopes, &report).await {
            Ok(()) => {
                *report.embedder_secs.lock().unwrap() += started.elapsed().as_secs_f64();
                for envelope in envelopes {
                    if tx.send(envelope).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                *report.embedder_secs.lock().unwrap() += started.elapsed().as_secs_f64();
                for envelope in &envelopes {
                    report.record_failure(&envelope.doc.source_uri, &e);
                }
            }
        }
    }
}

/// Embed the chunks of several envelopes in shared provider batches, then
/// split vectors back to their envelopes.
async fn embed_envelopes(
    ctx: &PipelineContext,
    envelopes: &mut [Envelope],
    report: &RunReport,
) -> Result<()> {
    let texts: Vec<String> = envelopes
        .iter()
        .flat_map(|e| e.chunks.iter().map(|c| c.content.clone()))
        .collect();
    if texts.is_empty() {
        return Ok(());
    }

    let max_tokens = ctx.config.global.llm.embeddings.max_tokens_per_request;
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in batch_by_tokens(&texts, ctx.provider.as_ref(), max_tokens) {
        let batch_texts: Vec<String> = batch.into_iter().cloned().collect();
        report.embed_requests.fetch_add(1, Ordering::Relaxed);
        let embedded = ctx.provider.embed(&batch_texts).await?;
        vectors.extend(embedded);
    }

    report
        .embedded
        .fetch_add(vectors.len() as u64, Ordering::Relaxed);

    let mut offset = 0usize;
    for envelope in envelopes.iter_mut() {
        let n = envelope.chunks.len();
        envelope.vectors = vectors[offset..offset + n].to_vec();
        offset += n;
    }
    Ok(())
}

async fn upserter_worker(
    ctx: PipelineContext,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    report: Arc<RunReport>,
) {
    loop {
        let envelope = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            e = async { rx.lock().await.recv().await } => match e {
                Some(e) => e,
                None => return,
            },
        };

        let started = Instant::now();
        let uri = envelope.doc.source_uri.clone();
        let mut attempt = 0u32;
        loop {
            match upsert_envelope(&ctx, &envelope).await {
                Ok(()) => {
                    report.upserted.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if e.is_transient() && attempt < ctx.config.global.pipeline.max_upsert_retries => {
                    attempt += 1;
                    tracing::warn!(document = %uri, attempt, %e, "upsert retry");
                }
                Err(e) => {
                    report.record_failure(&uri, &e);
                    break;
                }
            }
        }
        *report.upserter_secs.lock().unwrap() += started.elapsed().as_secs_f64();
    }
}

/// Replace a document's chunk set in the vector store, then commit state.
/// Stale points are deleted by the chunk-id list from the previous commit.
async fn upsert_envelope(ctx: &PipelineContext, envelope: &Envelope) -> Result<()> {
    let collection = &ctx.config.global.qdrant.collection_name;
    let new_ids: HashSet<&str> = envelope.chunks.iter().map(|c| c.chunk_id.as_str()).collect();

    let old_ids = ctx.state.chunks_for(&envelope.doc.document_id).await?;
    let stale: Vec<String> = old_ids
        .into_iter()
        .filter(|id| !new_ids.contains(id.as_str()))
        .collect();

    let points: Vec<Point> = envelope
        .chunks
        .iter()
        .zip(envelope.vectors.iter())
        .map(|(chunk, vector)| Point {
            id: chunk.chunk_id.clone(),
            vector: vector.clone(),
            payload: payload_for(chunk),
        })
        .collect();

    ctx.vector.upsert(collection, points).await?;
    ctx.vector.delete_ids(collection, &stale).await?;

    let chunk_ids: Vec<String> = envelope.chunks.iter().map(|c| c.chunk_id.clone()).collect();
    ctx.state
        .commit_document(
            &envelope.doc,
            &envelope.content_hash,
            envelope.converted,
            &chunk_ids,
        )
        .await?;
    Ok(())
}

/// Vector-store payload for one chunk: the chunk metadata flattened to JSON
/// plus identity and content fields.
pub fn payload_for(chunk: &Chunk) -> serde_json::Value {
    let mut payload = serde_json::to_value(&chunk.metadata).unwrap_or_default();
    if let Some(map) = payload.as_object_mut() {
        map.insert("chunk_id".into(), chunk.chunk_id.clone().into());
        map.insert("document_id".into(), chunk.document_id.clone().into());
        map.insert("chunk_index".into(), chunk.chunk_index.into());
        map.insert("content".into(), chunk.content.clone().into());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;
    use crate::llm::FakeLlmProvider;
    use crate::vector::memory::MemoryVectorStore;
    use crate::vector::Filter;
    use std::path::Path;

    const CONFIG: &str = r#"
global:
  qdrant:
    url: "memory:"
    collection_name: test
  llm:
    provider: fake
    base_url: http://localhost
    models:
      embeddings: fake
    embeddings:
      vector_size: 16
  chunking:
    chunk_size: 200
    chunk_overlap: 20
    min_chunk_size: 1
projects:
  demo:
    sources:
      localfile:
        docs:
          base_path: PLACEHOLDER
"#;

    async fn context(docs_root: &Path) -> (tempfile::TempDir, PipelineContext) {
        let yaml = CONFIG.replace("PLACEHOLDER", &docs_root.display().to_string());
        let config = load_config_from_str(&yaml, Path::new("/tmp/ws")).unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&state_dir.path().join("state.sqlite"))
            .await
            .unwrap();
        let state = StateStore::new(pool);
        state.migrate().await.unwrap();
        let ctx = PipelineContext {
            config: Arc::new(config),
            state,
            provider: Arc::new(FakeLlmProvider::new(16)),
            vector: Arc::new(MemoryVectorStore::new()),
            converter: Arc::new(FileConverter::new(Default::default(), None)),
            cancel: CancellationToken::new(),
        };
        (state_dir, ctx)
    }

    #[tokio::test]
    async fn ingest_then_reingest_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# H1\n\npara\n\n## H2\n\npara").unwrap();

        let (_state_dir, ctx) = context(tmp.path()).await;
        let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        assert_eq!(report.documents_seen.load(Ordering::Relaxed), 1);
        assert_eq!(report.upserted.load(Ordering::Relaxed), 1);
        assert_eq!(report.failed(), 0);

        // State and vector store agree.
        let doc_id = crate::models::document_id("demo", SourceType::LocalFile, "docs", "a.md");
        let state_chunks = ctx.state.chunks_for(&doc_id).await.unwrap();
        let vector_count = ctx
            .vector
            .count("test", Some(&Filter::new().eq("document_id", doc_id.clone())))
            .await
            .unwrap();
        assert!(!state_chunks.is_empty());
        assert_eq!(state_chunks.len(), vector_count);

        // Second run: everything unchanged.
        let report2 = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        assert_eq!(report2.unchanged.load(Ordering::Relaxed), 1);
        assert_eq!(report2.chunked.load(Ordering::Relaxed), 0);
        assert_eq!(report2.embedded.load(Ordering::Relaxed), 0);
        assert_eq!(report2.upserted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn changed_document_replaces_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.md");
        std::fs::write(&file, "# One\n\noriginal body text").unwrap();

        let (_state_dir, ctx) = context(tmp.path()).await;
        run_ingest(&ctx, "demo", None, None, false).await.unwrap();

        let doc_id = crate::models::document_id("demo", SourceType::LocalFile, "docs", "a.md");
        let before = ctx.state.chunks_for(&doc_id).await.unwrap();

        std::fs::write(&file, "# One\n\ncompletely different and much longer body text that changes the hash").unwrap();
        let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        assert_eq!(report.upserted.load(Ordering::Relaxed), 1);

        let after = ctx.state.chunks_for(&doc_id).await.unwrap();
        let vector_count = ctx
            .vector
            .count("test", Some(&Filter::new().eq("document_id", doc_id)))
            .await
            .unwrap();
        assert_eq!(after.len(), vector_count);
        assert!(!before.is_empty() && !after.is_empty());
    }

    #[tokio::test]
    async fn deleted_document_is_tombstoned() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("gone.md");
        std::fs::write(&file, "# Doomed\n\nshort lived content").unwrap();

        let (_state_dir, ctx) = context(tmp.path()).await;
        run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        assert!(ctx.vector.count("test", None).await.unwrap() > 0);

        std::fs::remove_file(&file).unwrap();
        let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        assert_eq!(report.tombstoned.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.vector.count("test", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn force_reprocesses_unchanged_documents() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# Same\n\nnever changes").unwrap();

        let (_state_dir, ctx) = context(tmp.path()).await;
        run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        let report = run_ingest(&ctx, "demo", None, None, true).await.unwrap();
        assert_eq!(report.unchanged.load(Ordering::Relaxed), 0);
        assert_eq!(report.upserted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn empty_document_commits_empty_chunk_set() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("empty.md"), "").unwrap();

        let (_state_dir, ctx) = context(tmp.path()).await;
        let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        assert_eq!(report.upserted.load(Ordering::Relaxed), 1);

        let doc_id = crate::models::document_id("demo", SourceType::LocalFile, "docs", "empty.md");
        assert!(ctx.state.chunks_for(&doc_id).await.unwrap().is_empty());
        assert!(ctx.state.stored_hash(&doc_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn payload_carries_identity_and_content() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# Payload\n\nsearchable body").unwrap();

        let (_state_dir, ctx) = context(tmp.path()).await;
        run_ingest(&ctx, "demo", None, None, false).await.unwrap();

        let query = crate::llm::hash_vector("anything", 16);
        let hits = ctx.vector.search("test", &query, 10, None).await.unwrap();
        assert!(!hits.is_empty());
        let payload = &hits[0].payload;
        assert_eq!(payload["project_id"], "demo");
        assert_eq!(payload["source_type"], "localfile");
        assert!(payload["document_id"].as_str().is_some());
        assert!(payload["content"].as_str().unwrap().contains("searchable"));
        assert!(payload["chunk_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn cancelled_run_commits_nothing_partial() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::write(
                tmp.path().join(format!("f{i}.md")),
                format!("# Doc {i}\n\n{}", "body ".repeat(50)),
            )
            .unwrap();
        }

        let (_state_dir, ctx) = context(tmp.path()).await;
        ctx.cancel.cancel();
        let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
        // Cancellation before work: nothing chunked, nothing half-committed.
        assert_eq!(report.upserted.load(Ordering::Relaxed), 0);
        for i in 0..10 {
            let doc_id = crate::models::document_id(
                "demo",
                SourceType::LocalFile,
                "docs",
                &format!("f{i}.md"),
            );
            assert!(ctx.state.chunks_for(&doc_id).await.unwrap().is_empty());
        }
    }
}
