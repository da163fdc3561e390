//! # chat-recall
//!
//! Question answering over an exported group chat: "what did Alice say
//! about crypto before 2022?", "did Bob change his mind on remote work?",
//! "show more".
//!
//! The pure logic (chunking, alias resolution, ranking, question parsing,
//! flip detection, conversation turns) lives in `chat-recall-core`. This
//! crate wires it to SQLite, HTTP embedding and stance providers, the
//! export file, and the `recall` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ export.json │──▶│   Indexer    │──▶│    SQLite    │
//! │  (stream)   │   │ chunk+embed  │   │ msgs+vectors │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                   ┌──────────────┐          │
//!   inbound text ──▶│    Engine    │◀─────────┘
//!   + reply ref     │ parse → plan │
//!                   │ search/flip  │──▶ formatted reply
//!                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`export`] | Streaming chat-export parser |
//! | [`ingest`] | Idempotent indexing pipeline |
//! | [`embedding`] | Embedding providers (hash, OpenAI, Ollama, local) |
//! | [`reasoning`] | Stance classifiers (keyword, OpenAI) |
//! | [`engine`] | `handle_inbound` and direct query operations |
//! | [`tracker`] | Reply-chain registry with per-chain locks |
//! | [`format`] | Chat-facing rendering |
//! | [`sqlite_store`] | SQLite `Store` + `VectorIndex` |
//! | [`index_lock`] | Advisory indexing lock |

pub mod commands;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod engine;
pub mod export;
pub mod format;
pub mod index_lock;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod progress;
pub mod reasoning;
pub mod retry;
pub mod sqlite_store;
pub mod stats;
pub mod tracker;
