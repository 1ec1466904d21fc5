//! Docchat Storage crate - SQLite persistence and local accounts.
//!
//! Provides a WAL-mode SQLite database with migrations, repositories for
//! documents, conversations and messages, the insert feed that publishes
//! every new row, and an auth provider backed by the same database.

pub mod auth;
pub mod db;
pub mod feed;
pub mod migrations;
pub mod repository;

pub use auth::LocalAuthProvider;
pub use db::Database;
pub use feed::{message_for, InsertFeed};
pub use repository::{ConversationRepository, DocumentRepository, MessageRepository};
