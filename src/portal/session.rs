//! Session acquisition: cached cookie jar first, portal login when needed.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderValue;

use crate::error::PortalError;

use super::cookies::{Credentials, SessionCookie, cookie_header};
use super::store::SessionStore;

/// Turns credentials into an authenticated cookie jar.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<SessionCookie>, PortalError>;
}

/// Produces `Cookie` header values for the report endpoint.
#[derive(Clone)]
pub struct SessionManager {
    credentials: Credentials,
    store: Arc<dyn SessionStore>,
    authenticator: Arc<dyn Authenticator>,
}

impl SessionManager {
    pub fn new(
        credentials: Credentials,
        store: Arc<dyn SessionStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            credentials,
            store,
            authenticator,
        }
    }

    /// Header value for the cached session, logging in first when nothing is cached.
    pub async fn ensure_cookie_header(&self) -> Result<String, PortalError> {
        match self.store.load() {
            Ok(Some(cookies)) => match sendable_header(&cookies) {
                Ok(header) => {
                    tracing::debug!(count = cookies.len(), "Using cached session cookies");
                    return Ok(header);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding cached session");
                    self.store.clear()?;
                }
            },
            Ok(None) => tracing::info!("No cached session, logging in"),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session cache");
                self.store.clear()?;
            }
        }

        self.login().await?;
        self.read_back()
    }

    /// Discard the cached session and log in again; used when the portal
    /// rejects the cached jar.
    pub async fn renew(&self) -> Result<String, PortalError> {
        self.invalidate()?;
        self.login().await?;
        self.read_back()
    }

    /// Log in through the portal and replace the cached jar.
    pub async fn login(&self) -> Result<(), PortalError> {
        let cookies = self.authenticator.authenticate(&self.credentials).await?;
        if cookies.is_empty() {
            tracing::warn!("Portal login produced no cookies");
        }
        self.store.save(&cookies)?;
        tracing::info!(count = cookies.len(), "Portal login succeeded");
        Ok(())
    }

    /// Forget the cached session.
    pub fn invalidate(&self) -> Result<(), PortalError> {
        self.store.clear()
    }

    // A jar that cannot be read back right after login is not retried.
    fn read_back(&self) -> Result<String, PortalError> {
        match self.store.load()? {
            Some(cookies) => sendable_header(&cookies),
            None => Err(PortalError::session_file(
                self.store.location(),
                "missing right after a successful login",
            )),
        }
    }
}

fn sendable_header(cookies: &[SessionCookie]) -> Result<String, PortalError> {
    let header = cookie_header(cookies);
    HeaderValue::from_str(&header).map_err(|e| PortalError::CookieHeader(e.to_string()))?;
    Ok(header)
}
