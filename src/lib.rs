//! # semindex
//!
//! **A two-sided semantic knowledge base: multi-source ingestion into a
//! Qdrant collection, plus an MCP retrieval server.**
//!
//! The ingestion engine collects documents from heterogeneous sources (Git
//! repositories, Confluence spaces, JIRA projects, public documentation
//! sites, local directories), converts binary formats to Markdown, splits
//! documents with content-aware chunking strategies, embeds chunks through
//! a pluggable LLM provider, and upserts them into a vector collection.
//! The retrieval server exposes that collection over the Model Context
//! Protocol (JSON-RPC 2.0 on stdio or HTTP) as a set of search tools.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────────────────────────────┐   ┌─────────┐
//! │ Connectors │──▶│ Pipeline                         │──▶│ Qdrant  │
//! │ git/wiki/  │   │ diff → convert → chunk → embed   │   │ + SQLite│
//! │ jira/docs/ │   │ → upsert (bounded worker pools)  │   │  state  │
//! │ localfile  │   └──────────────────────────────────┘   └────┬────┘
//! └────────────┘                                              │
//!                              ┌───────────────────────────────┤
//!                              ▼                               ▼
//!                        ┌──────────┐                   ┌────────────┐
//!                        │   CLI    │                   │ MCP server │
//!                        │  (semx)  │                   │ stdio/http │
//!                        └──────────┘                   └────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Connectors** ([`connectors`]) observe external sources and produce
//!    [`models::Document`]s, attachments pre-linked to their parents.
//! 2. The **pipeline** ([`pipeline`]) diffs each document against the
//!    [`state`] store, converts binaries ([`convert`]), chunks
//!    ([`chunking`]), embeds ([`llm`]) and upserts ([`vector`]): one
//!    atomic envelope per document, bounded queues between stages.
//! 3. The **retrieval engine** ([`retrieval`]) embeds queries, searches
//!    with payload filters, and post-processes hierarchy, attachments and
//!    cross-document analyses.
//! 4. The **MCP server** ([`mcp`]) speaks JSON-RPC 2.0 over stdio and HTTP
//!    and dispatches the retrieval tool surface.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | YAML configuration (`global` + `projects`) with `${ENV}` expansion |
//! | [`error`] | Crate-wide error taxonomy |
//! | [`logging`] | tracing setup; stdout stays clean for the stdio transport |
//! | [`models`] | Documents, chunks, metadata, stable identifiers |
//! | [`db`] | SQLite pool (WAL) for the state store |
//! | [`state`] | Change detection, per-document commits, tombstones |
//! | [`llm`] | Provider abstraction: HTTP adapters, rate limiting, retry, fake |
//! | [`convert`] | PDF/OOXML → Markdown with timeout and size gates |
//! | [`chunking`] | Five content-aware chunking strategies |
//! | [`connectors`] | git, confluence, jira, publicdocs, localfile |
//! | [`vector`] | Vector store gateway: Qdrant REST + in-process memory store |
//! | [`pipeline`] | Worker pools, envelopes, cancellation, run report |
//! | [`retrieval`] | Search orchestration and cross-document intelligence |
//! | [`mcp`] | JSON-RPC 2.0 server: tools, sessions, stdio + HTTP transports |

pub mod chunking;
pub mod config;
pub mod connectors;
pub mod convert;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod state;
pub mod vector;
