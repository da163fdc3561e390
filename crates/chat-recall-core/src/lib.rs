//! # chat-recall core
//!
//! Pure logic for chat-recall: message and chunk models, the chunker,
//! the alias resolver, store and vector-index traits with in-memory
//! implementations, hybrid search, the question parser, the flip detector,
//! counting analytics, and the conversation-turn state machine.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Everything
//! that talks to the outside world (embedding providers, stance providers,
//! SQLite, the export file) lives in the `chat-recall` app crate and is
//! passed in through the traits defined here.

pub mod alias;
pub mod analytics;
pub mod chunk;
pub mod context;
pub mod embedding;
pub mod error;
pub mod flip;
pub mod models;
pub mod question;
pub mod search;
pub mod stance;
pub mod store;
