//! Sandbox catalog (C2): the durable record of sandboxes and workspaces.
//!
//! The relational schema itself is out of scope; this module defines the
//! `SandboxCatalog` contract and an in-memory reference implementation behind
//! it. A SQL-backed store is a drop-in replacement implementing the same trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("duplicate {0}")]
    Conflict(&'static str),
    #[error("not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxStatus {
    Creating,
    Running,
    Pausing,
    Paused,
    Resuming,
    Offline,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: Uuid,
    pub short_id: String,
    pub workspace_id: Uuid,
    pub name: String,
    pub flavor: String,
    pub status: SandboxStatus,
    pub is_local: bool,
    pub pod_address: Option<String>,
    pub instance_name: Option<String>,
    pub proxy_token: String,
    pub agent_token: String,
    pub tunnel_token: Option<String>,
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub idle_timeout_seconds: Option<u64>,
    pub last_activity_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub display_name: String,
    pub isolation_namespace: Option<String>,
    pub disk_handle: Option<String>,
}

/// Aggregate resource totals for a workspace, used for quota checks. Sandboxes
/// with status `offline` are excluded, matching the §4.2 `sum_resources` contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSum {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
}

#[async_trait]
pub trait SandboxCatalog: Send + Sync {
    async fn create(&self, record: Sandbox) -> Result<(), CatalogError>;
    async fn get(&self, id: Uuid) -> Option<Sandbox>;
    async fn get_by_short_id(&self, short_id: &str) -> Option<Sandbox>;
    async fn get_by_proxy_token(&self, token: &str) -> Option<Sandbox>;
    async fn get_by_tunnel_token(&self, id: Uuid, token: &str) -> Option<Sandbox>;

    async fn list_by_workspace(&self, workspace_id: Uuid) -> Vec<Sandbox>;
    async fn list_all_active_instance_names(&self) -> Vec<String>;
    async fn list_idle(&self, default_timeout_seconds: u64) -> Vec<Sandbox>;

    async fn update_status(&self, id: Uuid, new: SandboxStatus) -> Result<(), CatalogError>;
    async fn update_pod_address(
        &self,
        id: Uuid,
        addr: Option<String>,
    ) -> Result<(), CatalogError>;
    async fn set_instance_name(
        &self,
        id: Uuid,
        instance_name: Option<String>,
    ) -> Result<(), CatalogError>;
    async fn touch_activity(&self, id: Uuid) -> Result<(), CatalogError>;
    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), CatalogError>;
    async fn delete(&self, id: Uuid) -> Result<(), CatalogError>;

    async fn create_workspace(&self, workspace: Workspace) -> Result<(), CatalogError>;
    async fn get_workspace(&self, id: Uuid) -> Option<Workspace>;
    async fn delete_workspace(&self, id: Uuid) -> Result<(), CatalogError>;

    async fn count_workspaces_owned_by(&self, user_id: Uuid) -> u64;
    async fn count_sandboxes_in(&self, workspace_id: Uuid) -> u64;
    async fn sum_resources(&self, workspace_id: Uuid) -> ResourceSum;

    /// Records the owning user for a workspace so `count_workspaces_owned_by`
    /// can be answered without inventing a separate membership table here.
    async fn record_workspace_owner(&self, workspace_id: Uuid, user_id: Uuid);
}

#[derive(Default)]
struct Inner {
    sandboxes: HashMap<Uuid, Sandbox>,
    short_ids: HashMap<String, Uuid>,
    proxy_tokens: HashMap<String, Uuid>,
    tunnel_tokens: HashMap<String, Uuid>,
    workspaces: HashMap<Uuid, Workspace>,
    workspace_owners: HashMap<Uuid, Uuid>,
}

/// In-memory reference implementation of [`SandboxCatalog`], guarded by a
/// single `RwLock`. This is the "connection pool" the concurrency model
/// refers to: one lock stands in for the durable store's per-row atomicity.
pub struct InMemoryCatalog {
    inner: RwLock<Inner>,
}

impl InMemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner::default()),
        })
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

#[async_trait]
impl SandboxCatalog for InMemoryCatalog {
    async fn create(&self, record: Sandbox) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        if inner.short_ids.contains_key(&record.short_id) {
            return Err(CatalogError::Conflict("short_id"));
        }
        if inner.proxy_tokens.contains_key(&record.proxy_token) {
            return Err(CatalogError::Conflict("proxy_token"));
        }
        if let Some(tunnel_token) = &record.tunnel_token
            && inner.tunnel_tokens.contains_key(tunnel_token)
        {
            return Err(CatalogError::Conflict("tunnel_token"));
        }

        inner.short_ids.insert(record.short_id.clone(), record.id);
        inner
            .proxy_tokens
            .insert(record.proxy_token.clone(), record.id);
        if let Some(tunnel_token) = &record.tunnel_token {
            inner.tunnel_tokens.insert(tunnel_token.clone(), record.id);
        }
        inner.sandboxes.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Option<Sandbox> {
        self.inner.read().await.sandboxes.get(&id).cloned()
    }

    async fn get_by_short_id(&self, short_id: &str) -> Option<Sandbox> {
        let inner = self.inner.read().await;
        let id = inner.short_ids.get(short_id)?;
        inner.sandboxes.get(id).cloned()
    }

    async fn get_by_proxy_token(&self, token: &str) -> Option<Sandbox> {
        let inner = self.inner.read().await;
        let id = inner.proxy_tokens.get(token)?;
        inner.sandboxes.get(id).cloned()
    }

    async fn get_by_tunnel_token(&self, id: Uuid, token: &str) -> Option<Sandbox> {
        let inner = self.inner.read().await;
        let sandbox = inner.sandboxes.get(&id)?;
        if sandbox.tunnel_token.as_deref() == Some(token) {
            Some(sandbox.clone())
        } else {
            None
        }
    }

    async fn list_by_workspace(&self, workspace_id: Uuid) -> Vec<Sandbox> {
        self.inner
            .read()
            .await
            .sandboxes
            .values()
            .filter(|s| s.workspace_id == workspace_id)
            .cloned()
            .collect()
    }

    async fn list_all_active_instance_names(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .sandboxes
            .values()
            .filter_map(|s| s.instance_name.clone())
            .collect()
    }

    async fn list_idle(&self, default_timeout_seconds: u64) -> Vec<Sandbox> {
        let now = Utc::now();
        self.inner
            .read()
            .await
            .sandboxes
            .values()
            .filter(|s| {
                if s.is_local || s.status != SandboxStatus::Running {
                    return false;
                }
                let effective_timeout = s.idle_timeout_seconds.unwrap_or(default_timeout_seconds);
                if effective_timeout == 0 {
                    return false;
                }
                let elapsed = (now - s.last_activity_at).num_seconds().max(0) as u64;
                elapsed > effective_timeout
            })
            .cloned()
            .collect()
    }

    async fn update_status(&self, id: Uuid, new: SandboxStatus) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner.sandboxes.get_mut(&id).ok_or(CatalogError::NotFound)?;
        sandbox.status = new;
        match new {
            SandboxStatus::Paused => sandbox.paused_at = Some(Utc::now()),
            SandboxStatus::Running => sandbox.paused_at = None,
            _ => {}
        }
        Ok(())
    }

    async fn update_pod_address(
        &self,
        id: Uuid,
        addr: Option<String>,
    ) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner.sandboxes.get_mut(&id).ok_or(CatalogError::NotFound)?;
        sandbox.pod_address = addr;
        Ok(())
    }

    async fn set_instance_name(
        &self,
        id: Uuid,
        instance_name: Option<String>,
    ) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner.sandboxes.get_mut(&id).ok_or(CatalogError::NotFound)?;
        sandbox.instance_name = instance_name;
        Ok(())
    }

    async fn touch_activity(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner.sandboxes.get_mut(&id).ok_or(CatalogError::NotFound)?;
        sandbox.last_activity_at = Utc::now();
        Ok(())
    }

    async fn touch_heartbeat(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner.sandboxes.get_mut(&id).ok_or(CatalogError::NotFound)?;
        sandbox.last_heartbeat_at = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        let sandbox = inner.sandboxes.remove(&id).ok_or(CatalogError::NotFound)?;
        inner.short_ids.remove(&sandbox.short_id);
        inner.proxy_tokens.remove(&sandbox.proxy_token);
        if let Some(tunnel_token) = &sandbox.tunnel_token {
            inner.tunnel_tokens.remove(tunnel_token);
        }
        Ok(())
    }

    async fn create_workspace(&self, workspace: Workspace) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        inner.workspaces.insert(workspace.id, workspace);
        Ok(())
    }

    async fn get_workspace(&self, id: Uuid) -> Option<Workspace> {
        self.inner.read().await.workspaces.get(&id).cloned()
    }

    async fn delete_workspace(&self, id: Uuid) -> Result<(), CatalogError> {
        let mut inner = self.inner.write().await;
        inner.workspaces.remove(&id).ok_or(CatalogError::NotFound)?;
        inner.workspace_owners.remove(&id);
        Ok(())
    }

    async fn count_workspaces_owned_by(&self, user_id: Uuid) -> u64 {
        self.inner
            .read()
            .await
            .workspace_owners
            .values()
            .filter(|&&owner| owner == user_id)
            .count() as u64
    }

    async fn count_sandboxes_in(&self, workspace_id: Uuid) -> u64 {
        self.inner
            .read()
            .await
            .sandboxes
            .values()
            .filter(|s| s.workspace_id == workspace_id && s.status != SandboxStatus::Deleting)
            .count() as u64
    }

    async fn sum_resources(&self, workspace_id: Uuid) -> ResourceSum {
        self.inner.read().await.sandboxes.values().fold(
            ResourceSum::default(),
            |mut acc, s| {
                if s.workspace_id == workspace_id && s.status != SandboxStatus::Offline {
                    acc.cpu_millicores += s.cpu_millicores;
                    acc.memory_bytes += s.memory_bytes;
                }
                acc
            },
        )
    }

    async fn record_workspace_owner(&self, workspace_id: Uuid, user_id: Uuid) {
        self.inner
            .write()
            .await
            .workspace_owners
            .insert(workspace_id, user_id);
    }
}
