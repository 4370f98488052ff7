//! Error types for Aether Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session state requires a running Tokio runtime")]
    NoRuntime,

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not logged in")]
    NotLoggedIn,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}
