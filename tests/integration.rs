//! End-to-end tests over the library API: ingest a workspace with the fake
//! embedding provider and the in-process vector store, then query through
//! the retrieval engine and the MCP dispatcher.

use std::io::Write;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use semindex::config::load_config_from_str;
use semindex::convert::FileConverter;
use semindex::llm::FakeLlmProvider;
use semindex::mcp::{McpServer, Session};
use semindex::models::{document_id, SourceType};
use semindex::pipeline::{run_ingest, PipelineContext};
use semindex::retrieval::RetrievalEngine;
use semindex::state::StateStore;
use semindex::vector::memory::MemoryVectorStore;
use semindex::vector::{Filter, VectorStore};

const VECTOR_SIZE: usize = 32;

fn config_yaml(docs_root: &Path) -> String {
    format!(
        r#"
global:
  qdrant:
    url: "memory:"
    collection_name: kb
  llm:
    provider: fake
    base_url: http://localhost
    models:
      embeddings: fake
    embeddings:
      vector_size: {VECTOR_SIZE}
  chunking:
    chunk_size: 600
    chunk_overlap: 60
    min_chunk_size: 1
projects:
  demo:
    display_name: Demo
    sources:
      localfile:
        docs:
          base_path: "{}"
"#,
        docs_root.display()
    )
}

async fn build_context(
    docs_root: &Path,
    store: Arc<MemoryVectorStore>,
) -> (tempfile::TempDir, PipelineContext) {
    let config = load_config_from_str(&config_yaml(docs_root), Path::new("/tmp/ws")).unwrap();
    let state_dir = tempfile::tempdir().unwrap();
    let pool = semindex::db::connect(&state_dir.path().join("state.sqlite"))
        .await
        .unwrap();
    let state = StateStore::new(pool);
    state.migrate().await.unwrap();

    let ctx = PipelineContext {
        config: Arc::new(config),
        state,
        provider: Arc::new(FakeLlmProvider::new(VECTOR_SIZE)),
        vector: store,
        converter: Arc::new(FileConverter::new(Default::default(), None)),
        cancel: CancellationToken::new(),
    };
    (state_dir, ctx)
}

fn engine_for(ctx: &PipelineContext) -> RetrievalEngine {
    RetrievalEngine {
        provider: Arc::clone(&ctx.provider),
        vector: Arc::clone(&ctx.vector),
        collection: "kb".into(),
        weights: Default::default(),
    }
}

#[tokio::test]
async fn markdown_round_trip_and_rank_one() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("auth.md"),
        "# Authentication\n\nThe service uses token based authentication with rotating keys.",
    )
    .unwrap();
    std::fs::write(
        tmp.path().join("billing.md"),
        "# Billing\n\nInvoices are generated monthly from usage data.",
    )
    .unwrap();

    let store = Arc::new(MemoryVectorStore::new());
    let (_state_dir, ctx) = build_context(tmp.path(), Arc::clone(&store)).await;
    let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
    assert_eq!(report.documents_seen.load(Ordering::Relaxed), 2);
    assert_eq!(report.failed(), 0);

    // Smoke law: searching for a document's own content ranks it first.
    // The fake provider derives vectors from text, so the exact chunk text
    // is the strongest possible query.
    let engine = engine_for(&ctx);
    let hits = engine
        .semantic_search(
            "# Authentication\n\nThe service uses token based authentication with rotating keys.",
            3,
            &Default::default(),
        )
        .await
        .unwrap();
    assert!(!hits.is_empty());
    let auth_id = document_id("demo", SourceType::LocalFile, "docs", "auth.md");
    assert_eq!(hits[0].document_id, auth_id, "own content must rank first");

    // Vector dimensions match configuration.
    let points = store.get_points("kb", &[hits[0].chunk_id.clone()]).await.unwrap();
    assert_eq!(points[0].vector.len(), VECTOR_SIZE);
}

#[tokio::test]
async fn second_run_reports_unchanged_and_state_matches_store() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("a.md"), "# H1\n\npara\n\n## H2\n\npara").unwrap();

    let store = Arc::new(MemoryVectorStore::new());
    let (_state_dir, ctx) = build_context(tmp.path(), Arc::clone(&store)).await;

    run_ingest(&ctx, "demo", None, None, false).await.unwrap();
    let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
    assert_eq!(report.unchanged.load(Ordering::Relaxed), 1);
    assert_eq!(report.converted.load(Ordering::Relaxed), 0);
    assert_eq!(report.chunked.load(Ordering::Relaxed), 0);
    assert_eq!(report.embedded.load(Ordering::Relaxed), 0);
    assert_eq!(report.upserted.load(Ordering::Relaxed), 0);

    // |state.chunks_for(doc)| == |vector_store.query({document_id})|
    let doc_id = document_id("demo", SourceType::LocalFile, "docs", "a.md");
    let state_chunks = ctx.state.chunks_for(&doc_id).await.unwrap();
    let vector_chunks = store
        .count("kb", Some(&Filter::new().eq("document_id", doc_id)))
        .await
        .unwrap();
    assert_eq!(state_chunks.len(), vector_chunks);
    assert!((1..=2).contains(&state_chunks.len()));
}

#[tokio::test]
async fn tombstoning_a_source_empties_it() {
    let tmp = tempfile::tempdir().unwrap();
    for i in 0..3 {
        std::fs::write(
            tmp.path().join(format!("doc{i}.md")),
            format!("# Doc {i}\n\ncontent for document number {i}"),
        )
        .unwrap();
    }

    let store = Arc::new(MemoryVectorStore::new());
    let (_state_dir, ctx) = build_context(tmp.path(), Arc::clone(&store)).await;
    run_ingest(&ctx, "demo", None, None, false).await.unwrap();
    assert!(store.count("kb", None).await.unwrap() > 0);

    for i in 0..3 {
        std::fs::remove_file(tmp.path().join(format!("doc{i}.md"))).unwrap();
    }
    let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
    assert_eq!(report.tombstoned.load(Ordering::Relaxed), 3);

    // Zero chunks carrying that source remain.
    let remaining = store
        .count("kb", Some(&Filter::new().eq("source_name", "docs")))
        .await
        .unwrap();
    assert_eq!(remaining, 0);
    let live = ctx
        .state
        .live_documents("demo", SourceType::LocalFile, "docs")
        .await
        .unwrap();
    assert!(live.is_empty());
}

#[tokio::test]
async fn excel_workbook_chunks_at_sheet_headers_with_atomic_rows() {
    let tmp = tempfile::tempdir().unwrap();

    // Minimal xlsx: two sheets of 50 shared-string rows each.
    let mut strings: Vec<String> = Vec::new();
    let mut sheet_xml = |rows: &[(String, String)]| {
        let mut xml = String::from(
            r#"<?xml version="1.0"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
        );
        for (a, b) in rows {
            let ia = strings.len();
            strings.push(a.clone());
            let ib = strings.len();
            strings.push(b.clone());
            xml.push_str(&format!(
                r#"<row><c t="s"><v>{ia}</v></c><c t="s"><v>{ib}</v></c></row>"#
            ));
        }
        xml.push_str("</sheetData></worksheet>");
        xml
    };

    let rows1: Vec<(String, String)> = (0..50)
        .map(|i| (format!("item-{i}"), format!("value-{i}")))
        .collect();
    let rows2: Vec<(String, String)> = (0..50)
        .map(|i| (format!("entry-{i}"), format!("amount-{i}")))
        .collect();
    let sheet1 = sheet_xml(&rows1);
    let sheet2 = sheet_xml(&rows2);
    drop(sheet_xml);
    let shared: String = strings
        .iter()
        .map(|s| format!("<si><t>{s}</t></si>"))
        .collect();
    let shared_xml = format!(
        r#"<?xml version="1.0"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{shared}</sst>"#
    );

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let opts = zip::write::SimpleFileOptions::default();
        writer.start_file("xl/sharedStrings.xml", opts).unwrap();
        writer.write_all(shared_xml.as_bytes()).unwrap();
        writer.start_file("xl/worksheets/sheet1.xml", opts).unwrap();
        writer.write_all(sheet1.as_bytes()).unwrap();
        writer.start_file("xl/worksheets/sheet2.xml", opts).unwrap();
        writer.write_all(sheet2.as_bytes()).unwrap();
        writer.finish().unwrap();
    }
    std::fs::write(tmp.path().join("book.xlsx"), cursor.into_inner()).unwrap();

    let store = Arc::new(MemoryVectorStore::new());
    let (_state_dir, ctx) = build_context(tmp.path(), Arc::clone(&store)).await;
    let report = run_ingest(&ctx, "demo", None, None, false).await.unwrap();
    assert_eq!(report.converted.load(Ordering::Relaxed), 1);
    assert_eq!(report.failed(), 0);

    let doc_id = document_id("demo", SourceType::LocalFile, "docs", "book.xlsx");
    let chunk_ids = ctx.state.chunks_for(&doc_id).await.unwrap();
    assert!(chunk_ids.len() > 2, "two table-heavy sheets need several chunks");

    let points = store.get_points("kb", &chunk_ids).await.unwrap();
    for point in &points {
        let content = point.payload["content"].as_str().unwrap();
        // Sheets never share a chunk, and rows are never cut mid-line.
        assert!(
            !(content.contains("## Sheet1") && content.contains("## Sheet2")),
            "chunk crosses sheet boundary"
        );
        for line in content.lines() {
            let t = line.trim();
            if t.starts_with('|') {
                assert!(t.ends_with('|'), "table row cut: {t:?}");
            }
        }
        assert_eq!(
            point.payload["content_tags"]["strategy"], "markdown",
            "converted workbook must chunk as markdown"
        );
    }
}

#[tokio::test]
async fn mcp_search_over_ingested_corpus() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("auth.md"),
        "# Authentication\n\nHow clients authenticate against the gateway.",
    )
    .unwrap();

    let store = Arc::new(MemoryVectorStore::new());
    let (_state_dir, ctx) = build_context(tmp.path(), Arc::clone(&store)).await;
    run_ingest(&ctx, "demo", None, None, false).await.unwrap();

    let server = McpServer::new(engine_for(&ctx));
    let session = Arc::new(tokio::sync::Mutex::new(Session::new()));

    let init = server
        .handle_message(
            &session,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .await
        .unwrap();
    assert_eq!(init["result"]["serverInfo"]["name"], "semindex");

    let response = server
        .handle_message(
            &session,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"search","arguments":{"query":"authentication","limit":3}}}"#,
        )
        .await
        .unwrap();

    // Well-formed JSON-RPC with the documented result shape.
    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 2);
    let results = response["result"]["structuredContent"]["results"]
        .as_array()
        .unwrap();
    assert!(results.len() <= 3 && !results.is_empty());
    for hit in results {
        assert!(hit["score"].is_number());
        assert!(hit["document_id"].is_string());
        assert!(hit["source_type"].is_string());
    }
}

#[tokio::test]
async fn attachment_linkage_flows_to_search() {
    // Simulated Confluence-style parent + attachment committed through the
    // state store and vector gateway directly.
    let store = Arc::new(MemoryVectorStore::new());
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("placeholder.md"), "# x\n\nplaceholder").unwrap();
    let (_state_dir, ctx) = build_context(tmp.path(), Arc::clone(&store)).await;
    run_ingest(&ctx, "demo", None, None, false).await.unwrap();

    use semindex::models::{chunk_id, CHUNKER_VERSION};
    use semindex::vector::Point;
    use serde_json::json;

    let parent_doc = "parentdoc000000000000000000000000";
    let parent_chunk = chunk_id(parent_doc, 0, CHUNKER_VERSION);
    store
        .upsert(
            "kb",
            vec![
                Point {
                    id: parent_chunk.clone(),
                    vector: semindex::llm::hash_vector("design page body", VECTOR_SIZE),
                    payload: json!({
                        "chunk_id": parent_chunk, "document_id": parent_doc,
                        "project_id": "demo", "source_type": "confluence", "source_name": "wiki",
                        "title": "Design Page", "has_attachments": true,
                        "content": "design page body"
                    }),
                },
                Point {
                    id: "att-chunk".into(),
                    vector: semindex::llm::hash_vector("attachment pdf text", VECTOR_SIZE),
                    payload: json!({
                        "chunk_id": "att-chunk", "document_id": "attdoc",
                        "project_id": "demo", "source_type": "confluence", "source_name": "wiki",
                        "title": "design.pdf", "is_attachment": true,
                        "parent_document_id": parent_doc,
                        "attachment_filename": "design.pdf",
                        "attachment_mime": "application/pdf", "attachment_size": 4096,
                        "content": "attachment pdf text"
                    }),
                },
            ],
        )
        .await
        .unwrap();

    let engine = engine_for(&ctx);
    let hits = engine
        .attachment_search(
            "attachment pdf text",
            5,
            &Default::default(),
            true,
            &semindex::retrieval::AttachmentFilter {
                parent_document_title: Some("Design Page".into()),
                attachments_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].parent_document_id.as_deref(), Some(parent_doc));
    assert_eq!(hits[0].parent_context.as_ref().unwrap()["title"], "Design Page");
}

#[tokio::test]
async fn force_init_recreates_with_new_vector_size() {
    use semindex::vector::Distance;

    let store = MemoryVectorStore::new();
    store.init_collection("kb", 16, Distance::Cosine, false).await.unwrap();
    let err = store
        .init_collection("kb", 32, Distance::Cosine, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        semindex::error::SemIndexError::VectorDimensionMismatch { .. }
    ));

    store.init_collection("kb", 32, Distance::Cosine, true).await.unwrap();
    // New collection accepts the new size.
    store
        .upsert(
            "kb",
            vec![semindex::vector::Point {
                id: "p".into(),
                vector: vec![0.0; 32],
                payload: serde_json::json!({}),
            }],
        )
        .await
        .unwrap();
}
