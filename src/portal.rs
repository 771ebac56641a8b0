//! Authenticated session against the remote portal.
//!
//! The portal is an opaque source of markup: form-based login, a cookie as
//! proof of authentication, HTML pages per entity. The cookie itself is never
//! inspected — the only signal the engine reads is whether a response "looks
//! like the sign-in page", and that heuristic is a pluggable value.

use crate::config::PortalConfig;
use crate::model::{AuthError, FetchError, RawPage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What the sync engine needs from a portal. `PortalSession` is the real
/// implementation; tests substitute a scripted fake.
#[async_trait]
pub trait Portal: Send + Sync {
    /// Issue the login request. On success, subsequent fetches are made with
    /// the portal's session marker attached.
    async fn authenticate(&self) -> Result<(), AuthError>;

    /// Lightweight probe: does the portal still consider us signed in?
    async fn is_valid(&self) -> bool;

    /// Fetch the entity enumeration page.
    async fn fetch_listing(&self) -> Result<RawPage, FetchError>;

    /// Fetch one entity's detail page.
    async fn fetch_detail(&self, remote_id: &str) -> Result<RawPage, FetchError>;
}

/// Classifies a response body as the portal's sign-in page: the marker
/// appears, or the body is implausibly small for an authenticated page.
#[derive(Debug, Clone)]
pub struct SigninHeuristic {
    marker: String,
    min_body_bytes: usize,
}

impl SigninHeuristic {
    pub fn new(marker: impl Into<String>, min_body_bytes: usize) -> Self {
        Self {
            marker: marker.into(),
            min_body_bytes,
        }
    }

    pub fn from_config(cfg: &PortalConfig) -> Self {
        Self::new(cfg.signin_marker.clone(), cfg.min_page_bytes)
    }

    pub fn looks_signed_out(&self, body: &str) -> bool {
        body.len() < self.min_body_bytes || body.contains(&self.marker)
    }
}

/// Session lifecycle. `Failed` is terminal for the run: once the portal
/// rejects a login, further attempts short-circuit instead of hammering the
/// login endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Failed,
}

pub struct PortalSession {
    http: reqwest::Client,
    base_url: Url,
    cfg: PortalConfig,
    heuristic: SigninHeuristic,
    state: Mutex<SessionState>,
}

impl fmt::Debug for PortalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalSession")
            .field("base_url", &self.base_url)
            .field("username", &self.cfg.username)
            .finish_non_exhaustive()
    }
}

impl PortalSession {
    pub fn new(cfg: &PortalConfig) -> Result<Self> {
        let base_url = Url::parse(&cfg.base_url).context("invalid portal base_url")?;
        // The cookie jar carries the portal's session marker across requests.
        let http = reqwest::Client::builder()
            .user_agent("portal-sync/0.1")
            .cookie_store(true)
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            heuristic: SigninHeuristic::from_config(cfg),
            cfg: cfg.clone(),
            state: Mutex::new(SessionState::Unauthenticated),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.base_url
            .join(path)
            .map_err(|err| FetchError::Network(err.to_string()))
    }

    /// GET an authenticated page. A response that looks like the sign-in page
    /// is a failed fetch, never returned as data.
    async fn get_page(&self, path: &str) -> Result<RawPage, FetchError> {
        let url = self.endpoint(path)?;
        debug!(%url, "portal fetch");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|err| FetchError::Network(err.to_string()))?;
        if body.trim().is_empty() {
            return Err(FetchError::Http(status.as_u16()));
        }
        if self.heuristic.looks_signed_out(&body) {
            let mut state = self.state.lock().await;
            if *state == SessionState::Authenticated {
                *state = SessionState::Unauthenticated;
            }
            return Err(FetchError::SessionExpired);
        }
        Ok(RawPage::new(body))
    }
}

#[async_trait]
impl Portal for PortalSession {
    async fn authenticate(&self) -> Result<(), AuthError> {
        {
            let mut state = self.state.lock().await;
            if *state == SessionState::Failed {
                return Err(AuthError::Rejected);
            }
            *state = SessionState::Authenticating;
        }

        info!(username = %self.cfg.username, "authenticating against portal");
        let url = match self.base_url.join(&self.cfg.login_path) {
            Ok(url) => url,
            Err(err) => {
                *self.state.lock().await = SessionState::Unauthenticated;
                return Err(AuthError::Unreachable(err.to_string()));
            }
        };
        let form = [
            ("action", "auth"),
            ("username", self.cfg.username.as_str()),
            ("password", self.cfg.password.as_str()),
        ];
        let response = match self.http.post(url).form(&form).send().await {
            Ok(response) => response,
            Err(err) => {
                // Network trouble is retryable; only a rejection is terminal.
                *self.state.lock().await = SessionState::Unauthenticated;
                return Err(AuthError::Unreachable(err.to_string()));
            }
        };

        let final_url = response.url().clone();
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let rejected = !status.is_success()
            || final_url.as_str().contains("error")
            || self.heuristic.looks_signed_out(&body);

        let mut state = self.state.lock().await;
        if rejected {
            *state = SessionState::Failed;
            warn!(%final_url, %status, "portal login rejected");
            return Err(AuthError::Rejected);
        }
        *state = SessionState::Authenticated;
        info!("portal login succeeded");
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        self.get_page(&self.cfg.probe_path).await.is_ok()
    }

    async fn fetch_listing(&self) -> Result<RawPage, FetchError> {
        self.get_page(&self.cfg.listing_path).await
    }

    async fn fetch_detail(&self, remote_id: &str) -> Result<RawPage, FetchError> {
        let path = format!(
            "{}/{}",
            self.cfg.detail_path.trim_end_matches('/'),
            remote_id
        );
        self.get_page(&path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_flags_marker_and_short_bodies() {
        let heuristic = SigninHeuristic::new("Signin", 100);
        let long_filler = "x".repeat(200);

        assert!(heuristic.looks_signed_out("tiny"));
        assert!(heuristic.looks_signed_out(&format!("{long_filler}<h1>Signin</h1>")));
        assert!(!heuristic.looks_signed_out(&long_filler));
    }

    #[test]
    fn debug_output_redacts_password() {
        let cfg: crate::config::Config =
            serde_yaml::from_str(crate::config::example()).unwrap();
        let session = PortalSession::new(&cfg.portal).unwrap();
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("PORTAL_PASSWORD"));
    }
}
