use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Everything that can go wrong between a report request and rendered rows.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("login form field `{field}` not found (tried {tried:?})")]
    LoginFieldNotFound {
        field: &'static str,
        tried: Vec<String>,
    },

    #[error("session cookie file {}: {reason}", path.display())]
    SessionFile { path: PathBuf, reason: String },

    #[error("report endpoint returned HTTP {status}")]
    UpstreamHttp { status: reqwest::StatusCode },

    #[error("unparseable date in {field}: {value}")]
    DateFormat { field: String, value: String },

    #[error("browser automation failed: {0}")]
    Browser(String),

    #[error("report request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected report body: {0}")]
    Decode(String),

    #[error("session cookies cannot be sent as an HTTP header: {0}")]
    CookieHeader(String),

    #[error("template rendering failed: {0}")]
    Render(#[from] minijinja::Error),
}

impl PortalError {
    pub fn session_file(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::SessionFile {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::UpstreamHttp { .. } | Self::Transport(_) | Self::Decode(_) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<chromiumoxide::error::CdpError> for PortalError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        Self::Browser(err.to_string())
    }
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::error!(error = %self, status = status.as_u16(), "Report request failed");
        (status, format!("Could not load the renewal report: {self}")).into_response()
    }
}
