//! Error taxonomy shared by every component of the host

/// Errors surfaced by the orchestration engine
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("network error: {0}")]
    Network(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, HostError>;

impl From<reqwest::Error> for HostError {
    fn from(e: reqwest::Error) -> Self {
        HostError::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for HostError {
    fn from(e: zip::result::ZipError) -> Self {
        // Reads come from an in-memory buffer, so IO variants mean truncated content too
        HostError::Archive(e.to_string())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(e: serde_json::Error) -> Self {
        HostError::Config(e.to_string())
    }
}
