use docchat_core::error::DocchatError;

/// Failures talking to the indexing backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The request never produced a response.
    #[error("Backend unreachable: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("Failed to decode backend response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}

impl From<BackendError> for DocchatError {
    fn from(e: BackendError) -> Self {
        DocchatError::Backend(e.to_string())
    }
}
