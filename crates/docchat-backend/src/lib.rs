//! Docchat Backend crate - everything that talks to the indexing backend.
//!
//! Relays JSON requests to the backend, issues typed chat/crawl/status
//! calls, polls crawl progress on an interval, and reveals answers word by
//! word.

pub mod client;
pub mod error;
pub mod poller;
pub mod reveal;

pub use client::{
    BackendClient, ChatAnswer, ChatQuery, CrawlAccepted, CrawlRequest, DocumentStatus, IndexState,
    RelayResponse,
};
pub use error::BackendError;
pub use poller::{PollHandle, ProgressReport, StatusPoller, StatusSource};
pub use reveal::{reveal_words, word_prefixes};
