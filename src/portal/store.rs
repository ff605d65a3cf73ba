//! Persistence for the single cached cookie jar.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::PortalError;

use super::cookies::SessionCookie;

/// Where the session cookie jar lives between requests.
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when nothing is cached.
    fn load(&self) -> Result<Option<Vec<SessionCookie>>, PortalError>;
    /// Replace whatever is cached with `cookies`.
    fn save(&self, cookies: &[SessionCookie]) -> Result<(), PortalError>;
    /// Drop the cached jar. No-op when nothing is cached.
    fn clear(&self) -> Result<(), PortalError>;

    /// Where the jar lives, for error messages.
    fn location(&self) -> PathBuf {
        PathBuf::from("<memory>")
    }
}

/// JSON file holding the cookie array.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<Vec<SessionCookie>>, PortalError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PortalError::session_file(&self.path, e)),
        };

        let cookies: Vec<SessionCookie> =
            serde_json::from_str(&raw).map_err(|e| PortalError::session_file(&self.path, e))?;
        Ok(Some(cookies))
    }

    fn save(&self, cookies: &[SessionCookie]) -> Result<(), PortalError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| PortalError::session_file(&self.path, e))?;
        }

        let body = serde_json::to_vec_pretty(cookies)
            .map_err(|e| PortalError::session_file(&self.path, e))?;

        // Readers only ever see the old jar or the complete new one.
        let staging = self.staging_path();
        fs::write(&staging, body).map_err(|e| PortalError::session_file(&staging, e))?;
        fs::rename(&staging, &self.path).map_err(|e| PortalError::session_file(&self.path, e))?;

        tracing::debug!(
            path = %self.path.display(),
            count = cookies.len(),
            "Saved session cookies"
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), PortalError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "Removed session cookies");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortalError::session_file(&self.path, e)),
        }
    }

    fn location(&self) -> PathBuf {
        self.path().to_path_buf()
    }
}
