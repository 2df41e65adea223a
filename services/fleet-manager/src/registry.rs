//! Registration registry port.
//!
//! Abstracts the job registry runners register with:
//! - Brokering single-use registration/removal tokens
//! - Listing registered runners with their online/busy flags
//! - Deleting registrations
//! - Best-effort job queue-duration lookups
//!
//! Tokens are short-lived and single-use: the operation that consumes a
//! stale token fails and the caller re-fetches on the next pass, never
//! silently retries. A mock implementation is provided for testing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The HTTP request itself failed (connect, timeout, protocol).
    #[error("registry API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The registry returned a non-success status.
    #[error("registry API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// A token was expired, invalid, or rejected.
    #[error("registry credential rejected: {0}")]
    Credential(String),

    /// The registry returned a payload this port could not validate.
    #[error("invalid registry API response: {0}")]
    InvalidResponse(String),
}

impl RegistryError {
    /// Whether this is an expired/invalid-credential failure.
    ///
    /// Under `FlushMode::Force` these are downgraded to warnings during
    /// deregistration so cloud deletion can proceed.
    pub fn is_credential(&self) -> bool {
        matches!(self, RegistryError::Credential(_))
    }

    /// Whether retrying at the next scheduled pass is worthwhile.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistryError::Http(err) => err.is_timeout() || err.is_connect(),
            RegistryError::Api { status, .. } => *status == 429 || *status >= 500,
            RegistryError::Credential(_) | RegistryError::InvalidResponse(_) => false,
        }
    }
}

/// Single-use registration or removal credential.
#[derive(Debug, Clone)]
pub struct Token {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A runner registration record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: u64,
    pub name: String,
    pub online: bool,
    pub busy: bool,
}

/// Job registry interface.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Fetch a fresh single-use registration token for `scope`.
    async fn get_registration_token(&self, scope: &str) -> Result<Token, RegistryError>;

    /// Fetch a fresh single-use removal token for `scope`.
    async fn get_removal_token(&self, scope: &str) -> Result<Token, RegistryError>;

    /// List runners registered under `scope`.
    async fn list_registered(&self, scope: &str) -> Result<Vec<Registration>, RegistryError>;

    /// Delete one registration, consuming `token`.
    async fn delete_registration(
        &self,
        scope: &str,
        worker_id: u64,
        token: &Token,
    ) -> Result<(), RegistryError>;

    /// How long job `run_id` waited in the queue, in seconds.
    ///
    /// Best-effort: `None` when the registry does not know the run.
    async fn job_queue_duration(
        &self,
        scope: &str,
        run_id: u64,
    ) -> Result<Option<f64>, RegistryError>;
}

// =============================================================================
// HTTP adapter
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenPayload {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct RunnerPayload {
    id: u64,
    name: String,
    online: bool,
    busy: bool,
}

#[derive(Debug, Deserialize)]
struct RunnerListPayload {
    runners: Vec<RunnerPayload>,
}

#[derive(Debug, Deserialize)]
struct RunPayload {
    #[serde(default)]
    queue_duration_secs: Option<f64>,
}

/// HTTP registry adapter.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpRegistry {
    /// Create a new adapter against `base_url`, authenticating with `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn error_for(response: reqwest::Response) -> RegistryError {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            RegistryError::Credential(message)
        } else {
            RegistryError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }

    async fn fetch_token(&self, scope: &str, kind: &str) -> Result<Token, RegistryError> {
        let url = format!("{}/{}/runners/{}-token", self.base_url, scope, kind);
        debug!(url = %url, "Fetching registry token");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let payload: TokenPayload = response.json().await?;
        if payload.token.is_empty() {
            return Err(RegistryError::InvalidResponse(
                "empty token in response".to_string(),
            ));
        }

        Ok(Token {
            value: payload.token,
            expires_at: payload.expires_at,
        })
    }
}

#[async_trait]
impl JobRegistry for HttpRegistry {
    async fn get_registration_token(&self, scope: &str) -> Result<Token, RegistryError> {
        self.fetch_token(scope, "registration").await
    }

    async fn get_removal_token(&self, scope: &str) -> Result<Token, RegistryError> {
        self.fetch_token(scope, "removal").await
    }

    async fn list_registered(&self, scope: &str) -> Result<Vec<Registration>, RegistryError> {
        let url = format!("{}/{}/runners", self.base_url, scope);
        debug!(url = %url, "Listing registered runners");

        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let payload: RunnerListPayload = response.json().await?;
        Ok(payload
            .runners
            .into_iter()
            .map(|r| Registration {
                id: r.id,
                name: r.name,
                online: r.online,
                busy: r.busy,
            })
            .collect())
    }

    async fn delete_registration(
        &self,
        scope: &str,
        worker_id: u64,
        token: &Token,
    ) -> Result<(), RegistryError> {
        let url = format!("{}/{}/runners/{}", self.base_url, scope, worker_id);
        debug!(url = %url, "Deleting runner registration");

        // The single-use removal token authenticates this call.
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&token.value)
            .send()
            .await?;

        // Already deregistered counts as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Ok(())
    }

    async fn job_queue_duration(
        &self,
        scope: &str,
        run_id: u64,
    ) -> Result<Option<f64>, RegistryError> {
        let url = format!("{}/{}/runs/{}", self.base_url, scope, run_id);
        debug!(url = %url, "Fetching job queue duration");

        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let payload: RunPayload = response.json().await?;
        Ok(payload.queue_duration_secs)
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Default)]
struct MockRegistryState {
    registrations: HashMap<String, Registration>,
    next_id: u64,
    token_counter: u64,
    fail_tokens: bool,
    fail_listing: bool,
    reject_removal: bool,
    queue_durations: HashMap<u64, f64>,
}

/// In-memory registry for testing and development.
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<MockRegistryState>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner directly, as a booted worker would.
    pub fn register(&self, name: &str, online: bool, busy: bool) -> u64 {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        state.next_id += 1;
        let id = state.next_id;
        state.registrations.insert(
            name.to_string(),
            Registration {
                id,
                name: name.to_string(),
                online,
                busy,
            },
        );
        id
    }

    pub fn set_online(&self, name: &str, online: bool) {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        if let Some(reg) = state.registrations.get_mut(name) {
            reg.online = online;
        }
    }

    pub fn set_busy(&self, name: &str, busy: bool) {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        if let Some(reg) = state.registrations.get_mut(name) {
            reg.busy = busy;
        }
    }

    /// Seed a queue-duration answer for a run id.
    pub fn set_queue_duration(&self, run_id: u64, secs: f64) {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        state.queue_durations.insert(run_id, secs);
    }

    /// Make all token fetches fail with a transient error.
    pub fn fail_token_fetches(&self, fail: bool) {
        self.state
            .lock()
            .expect("mock registry lock poisoned")
            .fail_tokens = fail;
    }

    /// Make runner listings fail with a transient error.
    pub fn fail_listings(&self, fail: bool) {
        self.state
            .lock()
            .expect("mock registry lock poisoned")
            .fail_listing = fail;
    }

    /// Make removal-token consumption fail as a rejected credential.
    pub fn reject_removal_credentials(&self, reject: bool) {
        self.state
            .lock()
            .expect("mock registry lock poisoned")
            .reject_removal = reject;
    }

    /// Names of all registrations, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock registry lock poisoned");
        let mut names: Vec<String> = state.registrations.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl JobRegistry for MockRegistry {
    async fn get_registration_token(&self, _scope: &str) -> Result<Token, RegistryError> {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        if state.fail_tokens {
            return Err(RegistryError::Api {
                status: 503,
                message: "mock registry configured to fail".to_string(),
            });
        }
        state.token_counter += 1;
        Ok(Token {
            value: format!("reg-{}", state.token_counter),
            expires_at: None,
        })
    }

    async fn get_removal_token(&self, _scope: &str) -> Result<Token, RegistryError> {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        if state.fail_tokens {
            return Err(RegistryError::Api {
                status: 503,
                message: "mock registry configured to fail".to_string(),
            });
        }
        state.token_counter += 1;
        Ok(Token {
            value: format!("rm-{}", state.token_counter),
            expires_at: None,
        })
    }

    async fn list_registered(&self, _scope: &str) -> Result<Vec<Registration>, RegistryError> {
        let state = self.state.lock().expect("mock registry lock poisoned");
        if state.fail_listing {
            return Err(RegistryError::Api {
                status: 503,
                message: "mock registry configured to fail".to_string(),
            });
        }
        let mut registrations: Vec<Registration> =
            state.registrations.values().cloned().collect();
        registrations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(registrations)
    }

    async fn delete_registration(
        &self,
        _scope: &str,
        worker_id: u64,
        _token: &Token,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().expect("mock registry lock poisoned");
        if state.reject_removal {
            return Err(RegistryError::Credential(
                "mock registry rejecting removal tokens".to_string(),
            ));
        }
        state.registrations.retain(|_, reg| reg.id != worker_id);
        Ok(())
    }

    async fn job_queue_duration(
        &self,
        _scope: &str,
        run_id: u64,
    ) -> Result<Option<f64>, RegistryError> {
        let state = self.state.lock().expect("mock registry lock poisoned");
        Ok(state.queue_durations.get(&run_id).copied())
    }
}
