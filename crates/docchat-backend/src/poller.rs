//! Periodic crawl/index progress polling.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{BackendClient, DocumentStatus, IndexState};
use crate::error::BackendError;

/// Anything that can report a document's crawl status.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, doc_id: &str) -> Result<DocumentStatus, BackendError>;
}

#[async_trait]
impl StatusSource for BackendClient {
    async fn fetch_status(&self, doc_id: &str) -> Result<DocumentStatus, BackendError> {
        self.document_status(doc_id).await
    }
}

/// One progress observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub status: IndexState,
    pub processed_urls: u64,
    pub total_urls: u64,
    pub failed_urls: u64,
    pub percent: u32,
}

impl ProgressReport {
    pub fn is_complete(&self) -> bool {
        self.status == IndexState::Completed
    }

    /// Single-line progress text.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl From<&DocumentStatus> for ProgressReport {
    fn from(s: &DocumentStatus) -> Self {
        Self {
            status: s.status,
            processed_urls: s.processed_urls,
            total_urls: s.total_urls,
            failed_urls: s.failed_urls,
            percent: percent(s.processed_urls, s.total_urls),
        }
    }
}

impl fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status: {} {}% | Processed: {}/{} | Failed: {}",
            self.status.as_str(),
            self.percent,
            self.processed_urls,
            self.total_urls,
            self.failed_urls
        )
    }
}

/// `round(processed / total * 100)`, or 0 for an empty crawl.
pub fn percent(processed: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((processed as f64 / total as f64) * 100.0).round() as u32
}

/// Shortest accepted gap between two status fetches.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Starts pollers against one status source.
#[derive(Clone)]
pub struct StatusPoller {
    source: Arc<dyn StatusSource>,
    interval: Duration,
}

impl StatusPoller {
    /// A zero `interval` is raised to `MIN_INTERVAL`.
    pub fn new(source: Arc<dyn StatusSource>, interval: Duration) -> Self {
        Self {
            source,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll `doc_id` until the backend reports `completed`.
    ///
    /// The first fetch happens immediately. Failed fetches are logged and
    /// retried on the next tick. The returned handle owns the task.
    pub fn start<F>(&self, doc_id: impl Into<String>, mut on_progress: F) -> PollHandle
    where
        F: FnMut(ProgressReport) + Send + 'static,
    {
        let doc_id = doc_id.into();
        let source = Arc::clone(&self.source);
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match source.fetch_status(&doc_id).await {
                    Ok(status) => {
                        let report = ProgressReport::from(&status);
                        debug!(
                            doc_id = %doc_id,
                            status = report.status.as_str(),
                            percent = report.percent,
                            "Progress"
                        );
                        let done = report.is_complete();
                        on_progress(report.clone());
                        if done {
                            info!(doc_id = %doc_id, "Document processing completed");
                            return report;
                        }
                    }
                    Err(e) => {
                        warn!(doc_id = %doc_id, error = %e, "Status fetch failed");
                    }
                }
            }
        });

        PollHandle { task: Some(task) }
    }
}

/// Owns a running poll. Dropping it cancels the poll.
#[derive(Debug)]
pub struct PollHandle {
    task: Option<JoinHandle<ProgressReport>>,
}

impl PollHandle {
    /// Cancel the poll. No fetch starts afterwards.
    pub fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Wait for the `completed` report. `None` if the task was cancelled.
    pub async fn completed(mut self) -> Option<ProgressReport> {
        let task = self.task.take()?;
        task.await.ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const TICK: Duration = Duration::from_millis(2000);

    fn status(state: IndexState, processed: u64, total: u64) -> DocumentStatus {
        DocumentStatus {
            status: state,
            total_urls: total,
            processed_urls: processed,
            failed_urls: 0,
        }
    }

    /// Replays scripted results, then repeats the last one.
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<DocumentStatus, BackendError>>>,
        fallback: DocumentStatus,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(
            script: Vec<Result<DocumentStatus, BackendError>>,
            fallback: DocumentStatus,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StatusSource for ScriptedSource {
        async fn fetch_status(&self, _doc_id: &str) -> Result<DocumentStatus, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()))
        }
    }

    fn collector() -> (Arc<Mutex<Vec<ProgressReport>>>, impl FnMut(ProgressReport) + Send + 'static) {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        (reports, move |r| sink.lock().unwrap().push(r))
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(20, 50), 40);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(5, 0), 0);
        assert_eq!(percent(50, 50), 100);
    }

    #[test]
    fn test_render() {
        let report = ProgressReport::from(&DocumentStatus {
            status: IndexState::InProgress,
            total_urls: 50,
            processed_urls: 20,
            failed_urls: 2,
        });
        assert_eq!(
            report.render(),
            "Status: in_progress 40% | Processed: 20/50 | Failed: 2"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_completed_then_stops() {
        let source = ScriptedSource::new(
            vec![
                Ok(status(IndexState::InProgress, 10, 50)),
                Ok(status(IndexState::InProgress, 20, 50)),
                Ok(status(IndexState::Completed, 50, 50)),
            ],
            status(IndexState::Completed, 50, 50),
        );
        let poller = StatusPoller::new(source.clone(), TICK);
        let (reports, on_progress) = collector();

        let handle = poller.start("doc-1", on_progress);
        let last = handle.completed().await.unwrap();
        assert!(last.is_complete());
        assert_eq!(source.calls(), 3);

        tokio::time::sleep(TICK * 5).await;
        assert_eq!(source.calls(), 3);

        let percents: Vec<u32> = reports.lock().unwrap().iter().map(|r| r.percent).collect();
        assert_eq!(percents, vec![20, 40, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_fetch_is_immediate() {
        let source = ScriptedSource::new(vec![], status(IndexState::InProgress, 0, 10));
        let poller = StatusPoller::new(source.clone(), TICK);
        let (_reports, on_progress) = collector();

        let _handle = poller.start("doc-1", on_progress);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(TICK).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_status_does_not_stop_polling() {
        let source = ScriptedSource::new(
            vec![Ok(status(IndexState::Failed, 3, 10))],
            status(IndexState::InProgress, 3, 10),
        );
        let poller = StatusPoller::new(source.clone(), TICK);
        let (_reports, on_progress) = collector();

        let handle = poller.start("doc-1", on_progress);
        tokio::time::sleep(TICK * 2 + Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 3);
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_raised_and_still_completes() {
        let source = ScriptedSource::new(
            vec![Ok(status(IndexState::InProgress, 1, 2))],
            status(IndexState::Completed, 2, 2),
        );
        let poller = StatusPoller::new(source.clone(), Duration::ZERO);
        assert_eq!(poller.interval(), MIN_INTERVAL);

        let (_reports, on_progress) = collector();
        let last = poller.start("doc-1", on_progress).completed().await.unwrap();
        assert!(last.is_complete());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_are_skipped() {
        let source = ScriptedSource::new(
            vec![
                Err(BackendError::Transport("connection refused".into())),
                Ok(status(IndexState::Completed, 4, 4)),
            ],
            status(IndexState::Completed, 4, 4),
        );
        let poller = StatusPoller::new(source.clone(), TICK);
        let (reports, on_progress) = collector();

        let last = poller.start("doc-1", on_progress).completed().await.unwrap();
        assert_eq!(last.percent, 100);
        assert_eq!(source.calls(), 2);
        assert_eq!(reports.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_completion_halts_fetches() {
        let source = ScriptedSource::new(vec![], status(IndexState::InProgress, 1, 10));
        let poller = StatusPoller::new(source.clone(), TICK);
        let (_reports, on_progress) = collector();

        let handle = poller.start("doc-1", on_progress);
        tokio::time::sleep(TICK + Duration::from_millis(10)).await;
        assert_eq!(source.calls(), 2);

        handle.stop();
        tokio::time::sleep(TICK * 10).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_halts_fetches() {
        let source = ScriptedSource::new(vec![], status(IndexState::InProgress, 1, 10));
        let poller = StatusPoller::new(source.clone(), TICK);
        let (_reports, on_progress) = collector();

        let handle = poller.start("doc-1", on_progress);
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(handle);
        tokio::time::sleep(TICK * 10).await;
        assert_eq!(source.calls(), 1);
    }
}
