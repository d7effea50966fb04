//! # Chat Relay
//!
//! Backend core for a multi-model chat application.
//!
//! - **Reconciliation**: after every model turn the full conversation is
//!   written back in one immediate SQLite transaction, applying only the
//!   deletes, inserts and updates that differ from what is stored.
//! - **Resumable streams**: model output is buffered per stream id so a
//!   client that lost its connection can replay it, or receive the finished
//!   message when the stream is already gone.
//! - **Titles, search and invalidation**: chats get titles from their first
//!   user message, are indexed for search, and changes are pushed to
//!   connected clients over a WebSocket.
//! - **Users and link previews**: identity-provider webhooks keep a user
//!   table in sync (deleting a user removes their chats), and cited source
//!   URLs are fetched for preview metadata behind a private-network guard.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_relay::config::{AppConfig, Overrides};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(&Overrides::default())?;
//!     chat_relay::server::start(config).await
//! }
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod logging;
pub mod metadata;
pub mod model;
pub mod provider;
pub mod search;
pub mod server;
pub mod storage;
pub mod stream;
pub mod title;

// Re-export main types for library consumers
pub use chat::{ChatService, SendRequest};
pub use error::{ChatError, ChatResult};
pub use model::{Chat, Message, MessageContent, MessagePart, Role};
pub use storage::{Database, Reconciler};
pub use stream::{ResumeCoordinator, ResumeOutcome, StreamHub};
pub use title::generate_title;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
