//! Application state shared across all route handlers.
//!
//! AppState holds references to all services and shared resources.
//! It is passed to handlers via axum's State extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use docchat_backend::{BackendClient, StatusPoller};
use docchat_core::config::DocchatConfig;
use docchat_core::session::AuthProvider;
use docchat_storage::{
    ConversationRepository, Database, DocumentRepository, InsertFeed, LocalAuthProvider,
    MessageRepository,
};

/// Shared application state.
///
/// All fields use `Arc` (or are cheap handles) for cloning across handler
/// tasks.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<DocchatConfig>,
    /// Broadcast of every inserted row.
    pub feed: InsertFeed,
    pub documents: Arc<DocumentRepository>,
    pub conversations: Arc<ConversationRepository>,
    pub messages: Arc<MessageRepository>,
    /// Identity collaborator.
    pub auth: Arc<dyn AuthProvider>,
    /// Client for the indexing backend.
    pub backend: BackendClient,
    /// Crawl progress poller bound to `backend`.
    pub poller: StatusPoller,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Create state with the SQLite-backed auth provider.
    pub fn new(config: DocchatConfig, database: Database, backend: BackendClient) -> Self {
        let database = Arc::new(database);
        let auth = Arc::new(LocalAuthProvider::new(
            Arc::clone(&database),
            config.auth.clone(),
        ));
        Self::with_auth_provider(config, database, backend, auth)
    }

    /// Create state around an existing database and auth provider.
    pub fn with_auth_provider(
        config: DocchatConfig,
        database: Arc<Database>,
        backend: BackendClient,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        let feed = InsertFeed::default();
        let poller = StatusPoller::new(
            Arc::new(backend.clone()),
            Duration::from_millis(config.poller.interval_ms),
        );
        Self {
            documents: Arc::new(DocumentRepository::new(
                Arc::clone(&database),
                feed.clone(),
            )),
            conversations: Arc::new(ConversationRepository::new(
                Arc::clone(&database),
                feed.clone(),
            )),
            messages: Arc::new(MessageRepository::new(database, feed.clone())),
            config: Arc::new(config),
            feed,
            auth,
            backend,
            poller,
            start_time: Instant::now(),
        }
    }

    pub fn reveal_delay(&self) -> Duration {
        Duration::from_millis(self.config.chat.reveal_delay_ms)
    }
}
