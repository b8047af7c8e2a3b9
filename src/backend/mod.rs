//! Backend driver (C3): the uniform contract two backend variants implement.
//!
//! `local` shells out to Docker/Podman. `cluster` drives Kubernetes
//! Deployments, feature-gated behind `cluster` since it pulls in the
//! `kube`/`k8s-openapi` stack.

#[cfg(feature = "cluster")]
pub mod cluster;
pub mod local;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Structured error categories a backend driver surfaces, distinct from the
/// ad-hoc `anyhow::Error` each backend uses internally for transport failures.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("instance not found: {0}")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("quota exceeded at backend: {current}/{max}")]
    QuotaExceededAtBackend { current: u64, max: u64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BackendError {
    pub fn other(msg: impl Into<String>) -> Self {
        BackendError::Other(anyhow::anyhow!(msg.into()))
    }
}

impl From<String> for BackendError {
    fn from(value: String) -> Self {
        BackendError::other(value)
    }
}

/// Options passed to `start`/`resume`, matching the §4.3 `StartOptions` shape.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub namespace: Option<String>,
    pub shared_disk_handle: Option<String>,
    pub agent_token: String,
    pub proxy_token: String,
    pub flavor: String,
    pub secondary_token: Option<String>,
    pub cpu_limit_millicores: u64,
    pub memory_limit_bytes: u64,
}

/// Outcome of a successful `start`/`resume` call.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub pod_address: String,
    pub instance_name: String,
}

/// Two-backend uniform contract. Every state-changing call is async and may
/// take seconds (cluster scheduling, container pulls); callers invoke these
/// from a spawned task rather than blocking an HTTP handler.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn start(
        &self,
        sandbox_id: Uuid,
        opts: StartOptions,
    ) -> Result<StartResult, BackendError>;

    async fn stop(&self, sandbox_id: Uuid) -> Result<(), BackendError>;

    /// Stops an instance identified only by its backend-scoped handle, used
    /// when the catalog record's pod address is already gone (paused sandboxes).
    async fn stop_by_instance_name(
        &self,
        namespace: Option<&str>,
        instance_name: &str,
    ) -> Result<(), BackendError>;

    /// Scans every instance the driver owns, deletes any whose instance name
    /// is absent from `known_instance_names`. Run once at startup.
    async fn reconcile_orphans(
        &self,
        known_instance_names: &[String],
        known_namespaces: &[String],
    ) -> Result<(), BackendError>;

    /// Shuts down all managed instances. Called on graceful process exit.
    async fn close(&self) -> Result<(), BackendError>;

    /// Scales a paused instance back to one replica and waits for a ready pod
    /// address. Optional capability: the local-runtime variant never pauses a
    /// workload to zero replicas, so it has no use for this.
    async fn resume(&self, _sandbox_id: Uuid) -> Result<StartResult, BackendError> {
        Err(BackendError::Unsupported("resume"))
    }

    /// Scales an instance to zero replicas without deleting it. Optional
    /// capability; the local-runtime variant stops the container outright instead.
    async fn pause(&self, _sandbox_id: Uuid) -> Result<(), BackendError> {
        Err(BackendError::Unsupported("pause"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_maps_quota_fields() {
        let err = BackendError::QuotaExceededAtBackend { current: 3, max: 2 };
        assert_eq!(err.to_string(), "quota exceeded at backend: 3/2");
    }
}
