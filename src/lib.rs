//! # docrag
//!
//! A retrieval-augmented question-answering backend over classified documents.
//!
//! Uploaded files are converted to plain text, cut into fixed-size chunks and
//! stored in a blob container under `{classification}/{filename}_part{N}.txt`.
//! A managed search service indexes the container; chat requests retrieve the
//! most relevant chunks and ask a hosted chat model to answer strictly from
//! them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────┐
//! │  Upload  │──▶│  Extract   │──▶│   Chunk   │──▶│ Blob storage │
//! └──────────┘   │ (+ layout) │   └───────────┘   └──────┬───────┘
//!                └────────────┘                          │ indexer
//!                                                        ▼
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌──────────────┐
//! │   Chat   │──▶│  Retrieve  │◀──│  Search   │◀──│    Index     │
//! └──────────┘   └─────┬──────┘   └───────────┘   └──────────────┘
//!                      ▼
//!                ┌────────────┐
//!                │ Completion │
//!                └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`naming`] | Object naming convention |
//! | [`extract`] | Per-format text extraction |
//! | [`chunk`] | Fixed-size chunking |
//! | [`store`] | Blob storage abstraction |
//! | [`search`] | Retrieval and indexer runs |
//! | [`layout`] | Remote layout analysis |
//! | [`completion`] | Prompting the chat model |
//! | [`documents`] | Listing and deleting documents |
//! | [`ingest`] | Upload pipeline |
//! | [`chat`] | Question answering |
//! | [`services`] | Injected service handles |
//! | [`server`] | HTTP API |

pub mod chat;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod documents;
pub mod extract;
pub mod ingest;
pub mod layout;
pub mod models;
pub mod naming;
pub mod search;
pub mod server;
pub mod services;
pub mod store;
