//! Cloud backend port.
//!
//! Abstracts the cloud API the fleet manager launches runner instances on:
//! - Listing and inspecting instances under the fleet's naming prefix
//! - Creating instances with a boot script
//! - Deleting instances (idempotent on absent ids)
//!
//! Backend payloads are validated at this boundary so the reconciler never
//! inspects backend-specific shapes. A mock implementation is provided for
//! testing and development.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::registry::MockRegistry;

/// Errors from cloud backend operations.
#[derive(Debug, Error)]
pub enum CloudError {
    /// The HTTP request itself failed (connect, timeout, protocol).
    #[error("cloud API request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend returned a non-success status.
    #[error("cloud API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The backend returned a payload this port could not validate.
    #[error("invalid cloud API response: {0}")]
    InvalidResponse(String),
}

impl CloudError {
    /// Whether retrying at the next scheduled pass is worthwhile.
    pub fn is_retryable(&self) -> bool {
        match self {
            CloudError::Http(err) => err.is_timeout() || err.is_connect(),
            CloudError::Api { status, .. } => *status == 429 || *status >= 500,
            CloudError::InvalidResponse(_) => false,
        }
    }
}

/// Opaque cloud instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a cloud instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Building,
    Active,
    Error,
    Deleting,
}

impl InstanceStatus {
    fn from_wire(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "building" | "build" => Some(Self::Building),
            "active" => Some(Self::Active),
            "error" => Some(Self::Error),
            "deleting" => Some(Self::Deleting),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Building => write!(f, "building"),
            InstanceStatus::Active => write!(f, "active"),
            InstanceStatus::Error => write!(f, "error"),
            InstanceStatus::Deleting => write!(f, "deleting"),
        }
    }
}

/// A cloud instance as seen through the port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: ServerId,
    pub name: String,
    pub status: InstanceStatus,
}

/// Request to create one runner instance.
#[derive(Debug, Clone, Serialize)]
pub struct CreateInstance {
    pub name: String,
    pub image: String,
    pub flavor: String,
    pub network: String,
    pub boot_script: String,
}

/// Cloud backend interface.
///
/// `create_instance` is synchronous from the engine's point of view: it
/// either returns a usable instance record or fails, with
/// [`CloudError::is_retryable`] distinguishing transient failures.
/// `delete_instance` on an absent id succeeds.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// List instances whose name starts with `name_prefix`.
    async fn list_instances(&self, name_prefix: &str) -> Result<Vec<Instance>, CloudError>;

    /// Fetch one instance. Absence is a value, not an error.
    async fn get_instance(&self, id: &ServerId) -> Result<Option<Instance>, CloudError>;

    /// Create one instance.
    async fn create_instance(&self, req: &CreateInstance) -> Result<Instance, CloudError>;

    /// Delete one instance. Succeeds if the instance no longer exists.
    async fn delete_instance(&self, id: &ServerId) -> Result<(), CloudError>;
}

// =============================================================================
// HTTP adapter
// =============================================================================

#[derive(Debug, Deserialize)]
struct InstancePayload {
    id: String,
    name: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct InstanceListPayload {
    instances: Vec<InstancePayload>,
}

/// HTTP cloud backend adapter.
pub struct HttpCloud {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpCloud {
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

    fn validate(payload: InstancePayload) -> Result<Instance, CloudError> {
        if payload.id.is_empty() || payload.name.is_empty() {
            return Err(CloudError::InvalidResponse(
                "instance payload missing id or name".to_string(),
            ));
        }

        // Unknown status strings downgrade to Building: grace, never destructive.
        let status = InstanceStatus::from_wire(&payload.status).unwrap_or_else(|| {
            warn!(
                instance = %payload.name,
                status = %payload.status,
                "Unknown instance status from cloud backend, treating as building"
            );
            InstanceStatus::Building
        });

        Ok(Instance {
            id: ServerId::new(payload.id),
            name: payload.name,
            status,
        })
    }

    async fn error_for(response: reqwest::Response) -> CloudError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        CloudError::Api { status, message }
    }
}

#[async_trait]
impl CloudBackend for HttpCloud {
    async fn list_instances(&self, name_prefix: &str) -> Result<Vec<Instance>, CloudError> {
        let url = format!("{}/v1/instances", self.base_url);
        debug!(url = %url, prefix = %name_prefix, "Listing cloud instances");

        let response = self
            .client
            .get(&url)
            .query(&[("name_prefix", name_prefix)])
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let payload: InstanceListPayload = response.json().await?;
        payload
            .instances
            .into_iter()
            .map(Self::validate)
            .collect()
    }

    async fn get_instance(&self, id: &ServerId) -> Result<Option<Instance>, CloudError> {
        let url = format!("{}/v1/instances/{}", self.base_url, id);
        debug!(url = %url, "Fetching cloud instance");

        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let payload: InstancePayload = response.json().await?;
        Ok(Some(Self::validate(payload)?))
    }

    async fn create_instance(&self, req: &CreateInstance) -> Result<Instance, CloudError> {
        let url = format!("{}/v1/instances", self.base_url);
        info!(runner = %req.name, flavor = %req.flavor, "Creating cloud instance");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(req)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        let payload: InstancePayload = response.json().await?;
        Self::validate(payload)
    }

    async fn delete_instance(&self, id: &ServerId) -> Result<(), CloudError> {
        let url = format!("{}/v1/instances/{}", self.base_url, id);
        debug!(url = %url, "Deleting cloud instance");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        // Already gone counts as deleted.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::error_for(response).await);
        }

        Ok(())
    }
}

// =============================================================================
// Mock
// =============================================================================

#[derive(Default)]
struct MockCloudState {
    instances: HashMap<String, Instance>,
    next_id: u64,
    fail_creates: usize,
    deleted: Vec<ServerId>,
}

/// In-memory cloud backend for testing and development.
///
/// When linked to a [`MockRegistry`], a successful create also registers
/// the runner online and idle, modeling a zero-latency boot.
#[derive(Default)]
pub struct MockCloud {
    state: Mutex<MockCloudState>,
    registry: Option<Arc<MockRegistry>>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock whose instances register themselves on boot.
    pub fn with_registry(registry: Arc<MockRegistry>) -> Self {
        Self {
            state: Mutex::new(MockCloudState::default()),
            registry: Some(registry),
        }
    }

    /// Insert an instance directly, bypassing the create path.
    pub fn seed(&self, name: &str, status: InstanceStatus) -> ServerId {
        let mut state = self.state.lock().expect("mock cloud lock poisoned");
        state.next_id += 1;
        let id = ServerId::new(format!("srv-{:06}", state.next_id));
        state.instances.insert(
            id.as_str().to_string(),
            Instance {
                id: id.clone(),
                name: name.to_string(),
                status,
            },
        );
        id
    }

    /// Make the next `n` create calls fail with a retryable error.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().expect("mock cloud lock poisoned").fail_creates = n;
    }

    /// Names of all live instances, sorted.
    pub fn instance_names(&self) -> Vec<String> {
        let state = self.state.lock().expect("mock cloud lock poisoned");
        let mut names: Vec<String> =
            state.instances.values().map(|i| i.name.clone()).collect();
        names.sort();
        names
    }

    /// Ids passed to successful delete calls, in order.
    pub fn deleted_ids(&self) -> Vec<ServerId> {
        self.state
            .lock()
            .expect("mock cloud lock poisoned")
            .deleted
            .clone()
    }
}

#[async_trait]
impl CloudBackend for MockCloud {
    async fn list_instances(&self, name_prefix: &str) -> Result<Vec<Instance>, CloudError> {
        let state = self.state.lock().expect("mock cloud lock poisoned");
        let mut instances: Vec<Instance> = state
            .instances
            .values()
            .filter(|i| i.name.starts_with(name_prefix))
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    async fn get_instance(&self, id: &ServerId) -> Result<Option<Instance>, CloudError> {
        let state = self.state.lock().expect("mock cloud lock poisoned");
        Ok(state.instances.get(id.as_str()).cloned())
    }

    async fn create_instance(&self, req: &CreateInstance) -> Result<Instance, CloudError> {
        let instance = {
            let mut state = self.state.lock().expect("mock cloud lock poisoned");
            if state.fail_creates > 0 {
                state.fail_creates -= 1;
                return Err(CloudError::Api {
                    status: 503,
                    message: "mock cloud configured to fail".to_string(),
                });
            }

            state.next_id += 1;
            let id = ServerId::new(format!("srv-{:06}", state.next_id));
            let instance = Instance {
                id: id.clone(),
                name: req.name.clone(),
                status: InstanceStatus::Active,
            };
            state.instances.insert(id.as_str().to_string(), instance.clone());
            instance
        };

        if let Some(registry) = &self.registry {
            registry.register(&instance.name, true, false);
        }

        debug!(runner = %instance.name, id = %instance.id, "[MOCK] Instance created");
        Ok(instance)
    }

    async fn delete_instance(&self, id: &ServerId) -> Result<(), CloudError> {
        let mut state = self.state.lock().expect("mock cloud lock poisoned");
        state.instances.remove(id.as_str());
        state.deleted.push(id.clone());
        Ok(())
    }
}
