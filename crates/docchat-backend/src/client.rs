//! HTTP client for the indexing backend.
//!
//! Two layers: `relay_json`/`relay_bytes`/`relay_get` forward a request and
//! hand the downstream status and body back untouched, while the typed calls
//! (`chat`, `crawl_docs`, `document_status`) decode the backend's JSON
//! contracts.

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::BackendError;

/// Downstream status and body, relayed as-is.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Value,
}

/// `POST /chat` request body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatQuery {
    pub doc_id: String,
    pub query: String,
    pub top_k: u32,
}

/// `POST /chat` response body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatAnswer {
    pub answer: String,
}

/// `POST /crawl_docs` request body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub base_url: String,
    pub user_id: String,
}

/// `POST /crawl_docs` response body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrawlAccepted {
    pub doc_id: String,
}

/// Crawl/index state reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    InProgress,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::InProgress => "in_progress",
            IndexState::Completed => "completed",
            IndexState::Failed => "failed",
            IndexState::Unknown => "unknown",
        }
    }
}

/// `GET /document_status/{id}` response body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub status: IndexState,
    #[serde(default)]
    pub total_urls: u64,
    #[serde(default)]
    pub processed_urls: u64,
    #[serde(default)]
    pub failed_urls: u64,
}

/// Client bound to one indexing backend.
#[derive(Clone, Debug)]
pub struct BackendClient {
    http: Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BackendError> {
        let http = Client::builder()
            .build()
            .map_err(|e| BackendError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Base URL extended by `segments`, each percent-encoded as exactly one
    /// path segment.
    pub fn segment_url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| BackendError::Transport(format!("Invalid backend URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| {
                BackendError::Transport(format!("Backend URL cannot take a path: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn status_url(&self, doc_id: &str) -> Result<Url, BackendError> {
        self.segment_url(&["document_status", doc_id])
    }

    /// POST `payload` to `path` and relay whatever comes back.
    ///
    /// Only a transport failure is an error. Non-2xx statuses and non-JSON
    /// bodies are part of the relayed response.
    pub async fn relay_json(&self, path: &str, payload: &Value) -> Result<RelayResponse, BackendError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BackendError::Decode(format!("Unserializable payload: {}", e)))?;
        self.relay_bytes(path, body).await
    }

    /// POST an already-encoded JSON body to `path` and relay the reply.
    ///
    /// The body is sent as given, with `Content-Type: application/json`.
    pub async fn relay_bytes(
        &self,
        path: &str,
        body: impl Into<reqwest::Body>,
    ) -> Result<RelayResponse, BackendError> {
        let url = self.url(path);
        debug!(url = %url, "Relaying POST");

        let resp = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        relay_response(resp).await
    }

    /// GET `path` and relay whatever comes back.
    pub async fn relay_get(&self, path: &str) -> Result<RelayResponse, BackendError> {
        let url = Url::parse(&self.url(path))
            .map_err(|e| BackendError::Transport(format!("Invalid backend URL: {}", e)))?;
        self.relay_get_url(url).await
    }

    /// Relay `GET /document_status/{doc_id}`.
    pub async fn relay_document_status(&self, doc_id: &str) -> Result<RelayResponse, BackendError> {
        self.relay_get_url(self.status_url(doc_id)?).await
    }

    async fn relay_get_url(&self, url: Url) -> Result<RelayResponse, BackendError> {
        debug!(url = %url, "Relaying GET");

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        relay_response(resp).await
    }

    pub async fn chat(&self, query: &ChatQuery) -> Result<ChatAnswer, BackendError> {
        let resp = self
            .http
            .post(self.url("/chat"))
            .json(query)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        decode(resp).await
    }

    pub async fn crawl_docs(&self, request: &CrawlRequest) -> Result<CrawlAccepted, BackendError> {
        let resp = self
            .http
            .post(self.url("/crawl_docs"))
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        decode(resp).await
    }

    pub async fn document_status(&self, doc_id: &str) -> Result<DocumentStatus, BackendError> {
        let resp = self
            .http
            .get(self.status_url(doc_id)?)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        decode(resp).await
    }
}

async fn relay_response(resp: Response) -> Result<RelayResponse, BackendError> {
    let status = resp.status().as_u16();
    let is_json = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    let text = resp
        .text()
        .await
        .map_err(|e| BackendError::Transport(e.to_string()))?;

    let parsed = if is_json {
        serde_json::from_str::<Value>(&text).ok()
    } else {
        None
    };
    let body = match parsed {
        Some(body) => body,
        None => {
            warn!(status, "Backend returned a non-JSON body");
            non_json_body(text)
        }
    };
    Ok(RelayResponse { status, body })
}

/// Wrapper used when the downstream body is not JSON.
pub fn non_json_body(raw: String) -> Value {
    json!({ "error": "Non-JSON response", "body": raw })
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, BackendError> {
    let status = resp.status();
    let bytes = resp
        .bytes()
        .await
        .map_err(|e| BackendError::Transport(e.to_string()))?;
    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    #[derive(Clone, Default)]
    struct Recorded {
        requests: Arc<Mutex<Vec<(Option<String>, String)>>>,
    }

    async fn spawn_stub(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn recording_router(recorded: Recorded) -> Router {
        Router::new()
            .route(
                "/chat",
                post(move |headers: HeaderMap, body: String| {
                    let recorded = recorded.clone();
                    async move {
                        let ct = headers
                            .get("content-type")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        recorded.requests.lock().unwrap().push((ct, body));
                        Json(serde_json::json!({ "answer": "Use a bearer token." }))
                    }
                }),
            )
            .route(
                "/crawl_docs",
                post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "indexer warming up") }),
            )
            .route(
                "/broken",
                post(|| async {
                    (
                        [("content-type", "application/json")],
                        "{not json".to_string(),
                    )
                        .into_response()
                }),
            )
            .route(
                "/document_status/{id}",
                get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                    if id == "missing" {
                        return (StatusCode::NOT_FOUND, Json(serde_json::json!({"detail": "nope"})))
                            .into_response();
                    }
                    Json(serde_json::json!({
                        "status": "in_progress",
                        "total_urls": 50,
                        "processed_urls": 20,
                        "failed_urls": 1
                    }))
                    .into_response()
                }),
            )
    }

    #[tokio::test]
    async fn test_relay_json_forwards_body_once() {
        let recorded = Recorded::default();
        let base = spawn_stub(recording_router(recorded.clone())).await;
        let client = BackendClient::new(base).unwrap();

        let payload = serde_json::json!({ "doc_id": "d1", "query": "auth?", "top_k": 3 });
        let resp = client.relay_json("/chat", &payload).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["answer"], "Use a bearer token.");

        let requests = recorded.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let (ct, body) = &requests[0];
        assert_eq!(ct.as_deref(), Some("application/json"));
        assert_eq!(serde_json::from_str::<Value>(body).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_relay_wraps_non_json_and_keeps_status() {
        let base = spawn_stub(recording_router(Recorded::default())).await;
        let client = BackendClient::new(base).unwrap();

        let resp = client
            .relay_json("/crawl_docs", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(resp.status, 503);
        assert_eq!(
            resp.body,
            serde_json::json!({ "error": "Non-JSON response", "body": "indexer warming up" })
        );
    }

    #[tokio::test]
    async fn test_relay_wraps_unparsable_json() {
        let base = spawn_stub(recording_router(Recorded::default())).await;
        let client = BackendClient::new(base).unwrap();

        let resp = client
            .relay_json("/broken", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["error"], "Non-JSON response");
        assert_eq!(resp.body["body"], "{not json");
    }

    #[tokio::test]
    async fn test_relay_get_passes_through_error_json() {
        let base = spawn_stub(recording_router(Recorded::default())).await;
        let client = BackendClient::new(base).unwrap();

        let resp = client.relay_get("/document_status/missing").await.unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.body["detail"], "nope");
    }

    #[tokio::test]
    async fn test_transport_failure() {
        // Bind then drop to get a port nothing listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = BackendClient::new(format!("http://{}", addr)).unwrap();
        let err = client
            .relay_json("/chat", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Transport(_)));
    }

    #[tokio::test]
    async fn test_typed_calls() {
        let base = spawn_stub(recording_router(Recorded::default())).await;
        let client = BackendClient::new(format!("{}/", base)).unwrap();

        let answer = client
            .chat(&ChatQuery {
                doc_id: "d1".into(),
                query: "auth?".into(),
                top_k: 3,
            })
            .await
            .unwrap();
        assert_eq!(answer.answer, "Use a bearer token.");

        let status = client.document_status("d1").await.unwrap();
        assert_eq!(status.status, IndexState::InProgress);
        assert_eq!((status.processed_urls, status.total_urls), (20, 50));

        let err = client
            .crawl_docs(&CrawlRequest {
                base_url: "https://api.example.com".into(),
                user_id: "u1".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 503, .. }));
    }

    #[test]
    fn test_segment_url_encodes_each_segment() {
        let client = BackendClient::new("http://backend:8000/api/").unwrap();
        let url = client
            .segment_url(&["document_status", "../admin?x=1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://backend:8000/api/document_status/..%2Fadmin%3Fx=1"
        );
        assert_eq!(url.query(), None);
    }

    #[tokio::test]
    async fn test_doc_id_stays_one_path_segment() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorded = seen.clone();
        let router = Router::new().fallback(move |uri: axum::http::Uri| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(uri.to_string());
                (StatusCode::NOT_FOUND, Json(serde_json::json!({ "detail": "nope" })))
            }
        });
        let base = spawn_stub(router).await;
        let client = BackendClient::new(base).unwrap();

        let resp = client.relay_document_status("../admin?x=1").await.unwrap();
        assert_eq!(resp.status, 404);
        let err = client.document_status("a/b").await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 404, .. }));

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "/document_status/..%2Fadmin%3Fx=1".to_string(),
                "/document_status/a%2Fb".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_relay_bytes_sends_body_verbatim() {
        let recorded = Recorded::default();
        let base = spawn_stub(recording_router(recorded.clone())).await;
        let client = BackendClient::new(base).unwrap();

        let raw = br#"{"doc_id":"d1","query":"auth?"}"#.to_vec();
        let resp = client.relay_bytes("/chat", raw.clone()).await.unwrap();
        assert_eq!(resp.status, 200);

        let requests = recorded.requests.lock().unwrap();
        assert_eq!(requests[0].0.as_deref(), Some("application/json"));
        assert_eq!(requests[0].1.as_bytes(), raw.as_slice());
    }

    #[test]
    fn test_unknown_index_state() {
        let status: DocumentStatus =
            serde_json::from_str(r#"{"status": "queued", "total_urls": 3}"#).unwrap();
        assert_eq!(status.status, IndexState::Unknown);
        assert_eq!(status.processed_urls, 0);
    }
}
