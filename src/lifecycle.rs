//! Lifecycle controller (C4): owns every sandbox status transition and
//! sequences catalog updates with backend calls.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, StartOptions};
use crate::catalog::{Sandbox, SandboxCatalog, SandboxStatus, Workspace};
use crate::errors::CoreError;
use crate::settings::SettingsResolver;
use crate::tunnel::TunnelRegistry;

/// One-time registration codes for local/tunneled agent onboarding: a
/// 24-hex-char token mapping to `(user_id, workspace_id, expires_at, used)`.
#[derive(Debug, Clone)]
pub struct RegistrationCode {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub expires_at: chrono::DateTime<Utc>,
    pub used: bool,
}

#[derive(Default)]
pub struct RegistrationCodeStore {
    codes: tokio::sync::Mutex<HashMap<String, RegistrationCode>>,
}

impl RegistrationCodeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn issue(&self, user_id: Uuid, workspace_id: Uuid) -> String {
        let code = hex::encode(rand::thread_rng().r#gen::<[u8; 12]>());
        self.codes.lock().await.insert(
            code.clone(),
            RegistrationCode {
                user_id,
                workspace_id,
                expires_at: Utc::now() + chrono::Duration::minutes(10),
                used: false,
            },
        );
        code
    }

    /// Atomically consumes a code: valid only if unused and unexpired.
    pub async fn consume(&self, code: &str) -> Result<(Uuid, Uuid), CoreError> {
        let mut codes = self.codes.lock().await;
        let entry = codes.get_mut(code).ok_or(CoreError::NotFound)?;
        if entry.used {
            return Err(CoreError::Conflict("registration code already used".into()));
        }
        if entry.expires_at < Utc::now() {
            return Err(CoreError::Conflict("registration code expired".into()));
        }
        entry.used = true;
        Ok((entry.user_id, entry.workspace_id))
    }
}

fn legal_transition(from: SandboxStatus, to: SandboxStatus, is_local: bool) -> bool {
    use SandboxStatus::*;
    match (from, to) {
        (Creating, Running) | (Creating, Deleting) => true,
        (Running, Pausing) | (Running, Deleting) => true,
        (Running, Offline) => is_local,
        (Pausing, Running) | (Pausing, Paused) => true,
        (Paused, Resuming) | (Paused, Deleting) => true,
        (Resuming, Running) | (Resuming, Paused) => true,
        (Offline, Creating) => is_local,
        (Offline, Deleting) => true,
        _ => false,
    }
}

/// Generates a short, case-insensitive subdomain token.
fn generate_short_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn generate_token() -> String {
    hex::encode(rand::thread_rng().r#gen::<[u8; 20]>())
}

pub struct LifecycleController<B: Backend> {
    catalog: Arc<dyn SandboxCatalog>,
    backend: Arc<B>,
    settings: Arc<SettingsResolver>,
    tunnels: Arc<TunnelRegistry>,
}

/// Parameters for creating a cloud-backed sandbox, gathered by the caller
/// (HTTP layer) before handing off to the controller.
pub struct CreateCloudRequest {
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub flavor: String,
    pub cpu_millicores: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
    pub namespace: Option<String>,
    pub shared_disk_handle: Option<String>,
}

impl<B: Backend + 'static> LifecycleController<B> {
    pub fn new(
        catalog: Arc<dyn SandboxCatalog>,
        backend: Arc<B>,
        settings: Arc<SettingsResolver>,
        tunnels: Arc<TunnelRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            backend,
            settings,
            tunnels,
        })
    }

    /// Validates and writes a status transition. Rejected synchronously if
    /// the table in §4.4 disallows it; the caller never blocks on backend I/O
    /// here — that happens via the spawned tasks below.
    async fn transition(&self, sandbox: &Sandbox, to: SandboxStatus) -> Result<(), CoreError> {
        if !legal_transition(sandbox.status, to, sandbox.is_local) {
            return Err(CoreError::Conflict(format!(
                "illegal transition {:?} -> {:?}",
                sandbox.status, to
            )));
        }
        self.catalog.update_status(sandbox.id, to).await?;
        Ok(())
    }

    /// Create flow (cloud): validates quotas, reserves unique tokens, inserts
    /// a `creating` record, then spawns the backend call in the background.
    pub async fn create_cloud(self: &Arc<Self>, req: CreateCloudRequest) -> Result<Uuid, CoreError> {
        let settings = self
            .settings
            .effective_for(Some(req.user_id), Some(req.workspace_id))
            .await;

        let workspace_count = self.catalog.count_workspaces_owned_by(req.user_id).await;
        if settings.max_workspaces_per_user > 0 && workspace_count >= settings.max_workspaces_per_user {
            return Err(CoreError::QuotaExceeded {
                current: workspace_count,
                max: settings.max_workspaces_per_user,
            });
        }

        let sandbox_count = self.catalog.count_sandboxes_in(req.workspace_id).await;
        if settings.max_sandboxes_per_workspace > 0
            && sandbox_count >= settings.max_sandboxes_per_workspace
        {
            return Err(CoreError::QuotaExceeded {
                current: sandbox_count,
                max: settings.max_sandboxes_per_workspace,
            });
        }

        let cpu_millicores = req.cpu_millicores.unwrap_or(settings.default_cpu_millicores);
        let memory_bytes = req.memory_bytes.unwrap_or(settings.default_memory_bytes);

        let sum = self.catalog.sum_resources(req.workspace_id).await;
        if settings.workspace_max_total_cpu_millicores > 0
            && sum.cpu_millicores + cpu_millicores > settings.workspace_max_total_cpu_millicores
        {
            return Err(CoreError::QuotaExceeded {
                current: sum.cpu_millicores + cpu_millicores,
                max: settings.workspace_max_total_cpu_millicores,
            });
        }
        if settings.workspace_max_total_memory_bytes > 0
            && sum.memory_bytes + memory_bytes > settings.workspace_max_total_memory_bytes
        {
            return Err(CoreError::QuotaExceeded {
                current: sum.memory_bytes + memory_bytes,
                max: settings.workspace_max_total_memory_bytes,
            });
        }

        let sandbox_id = Uuid::new_v4();
        let proxy_token = generate_token();
        let agent_token = generate_token();

        let mut short_id = generate_short_id();
        let mut attempts = 0;
        let record = loop {
            let candidate = Sandbox {
                id: sandbox_id,
                short_id: short_id.clone(),
                workspace_id: req.workspace_id,
                name: req.name.clone(),
                flavor: req.flavor.clone(),
                status: SandboxStatus::Creating,
                is_local: false,
                pod_address: None,
                instance_name: None,
                proxy_token: proxy_token.clone(),
                agent_token: agent_token.clone(),
                tunnel_token: None,
                cpu_millicores,
                memory_bytes,
                idle_timeout_seconds: req.idle_timeout_seconds,
                last_activity_at: Utc::now(),
                last_heartbeat_at: None,
                created_at: Utc::now(),
                paused_at: None,
            };
            match self.catalog.create(candidate.clone()).await {
                Ok(()) => break candidate,
                Err(_) if attempts < 3 => {
                    attempts += 1;
                    short_id = generate_short_id();
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.catalog
            .record_workspace_owner(req.workspace_id, req.user_id)
            .await;

        let controller = Arc::clone(self);
        let opts = StartOptions {
            namespace: req.namespace,
            shared_disk_handle: req.shared_disk_handle,
            agent_token: record.agent_token.clone(),
            proxy_token: record.proxy_token.clone(),
            flavor: record.flavor.clone(),
            secondary_token: None,
            cpu_limit_millicores: cpu_millicores,
            memory_limit_bytes: memory_bytes,
        };
        tokio::spawn(async move {
            controller.run_start(sandbox_id, opts).await;
        });

        Ok(sandbox_id)
    }

    async fn run_start(self: Arc<Self>, sandbox_id: Uuid, opts: StartOptions) {
        match self.backend.start(sandbox_id, opts).await {
            Ok(result) => {
                if let Err(e) = self
                    .catalog
                    .update_pod_address(sandbox_id, Some(result.pod_address))
                    .await
                {
                    error!(sandbox_id = %sandbox_id, error = %e, "failed writing pod address");
                    return;
                }
                let _ = self
                    .catalog
                    .set_instance_name(sandbox_id, Some(result.instance_name))
                    .await;
                if let Err(e) = self
                    .catalog
                    .update_status(sandbox_id, SandboxStatus::Running)
                    .await
                {
                    error!(sandbox_id = %sandbox_id, error = %e, "failed marking sandbox running");
                }
                info!(sandbox_id = %sandbox_id, "sandbox started");
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "backend start failed, deleting record");
                let _ = self.catalog.delete(sandbox_id).await;
            }
        }
    }

    /// Create flow (local/tunneled): consumes a registration code, mints
    /// tokens, inserts a record that is already `running` with no backend
    /// instance behind it.
    pub async fn create_local(
        &self,
        workspace_id: Uuid,
        name: String,
        flavor: String,
    ) -> Result<Sandbox, CoreError> {
        let sandbox = Sandbox {
            id: Uuid::new_v4(),
            short_id: generate_short_id(),
            workspace_id,
            name,
            flavor,
            status: SandboxStatus::Running,
            is_local: true,
            pod_address: None,
            instance_name: None,
            proxy_token: generate_token(),
            agent_token: generate_token(),
            tunnel_token: Some(generate_token()),
            cpu_millicores: 0,
            memory_bytes: 0,
            idle_timeout_seconds: None,
            last_activity_at: Utc::now(),
            last_heartbeat_at: Some(Utc::now()),
            created_at: Utc::now(),
            paused_at: None,
        };
        self.catalog.create(sandbox.clone()).await?;
        Ok(sandbox)
    }

    /// Pauses a running cloud sandbox: stages `pausing`, calls the backend,
    /// publishes `paused` on success (clearing the pod address first) or
    /// reverts to `running` on failure.
    pub async fn pause(self: &Arc<Self>, sandbox_id: Uuid) -> Result<(), CoreError> {
        let sandbox = self.catalog.get(sandbox_id).await.ok_or(CoreError::NotFound)?;
        if sandbox.is_local {
            return Err(CoreError::Conflict("local sandboxes cannot be paused".into()));
        }
        self.transition(&sandbox, SandboxStatus::Pausing).await?;

        match self.backend.pause(sandbox_id).await {
            Ok(()) => {
                self.catalog.update_pod_address(sandbox_id, None).await?;
                self.catalog
                    .update_status(sandbox_id, SandboxStatus::Paused)
                    .await?;
                Ok(())
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "pause failed, reverting to running");
                let _ = self
                    .catalog
                    .update_status(sandbox_id, SandboxStatus::Running)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Resumes a paused sandbox, staging `resuming`, waiting (via the
    /// backend) for a pod address, then publishing `running` and touching
    /// activity so it is not immediately re-paused by the idle watcher.
    pub async fn resume(self: &Arc<Self>, sandbox_id: Uuid) -> Result<(), CoreError> {
        let sandbox = self.catalog.get(sandbox_id).await.ok_or(CoreError::NotFound)?;
        if sandbox.is_local {
            return Err(CoreError::Conflict("local sandboxes cannot be resumed".into()));
        }
        self.transition(&sandbox, SandboxStatus::Resuming).await?;

        match self.backend.resume(sandbox_id).await {
            Ok(result) => {
                self.catalog
                    .update_pod_address(sandbox_id, Some(result.pod_address))
                    .await?;
                self.catalog
                    .update_status(sandbox_id, SandboxStatus::Running)
                    .await?;
                self.catalog.touch_activity(sandbox_id).await?;
                Ok(())
            }
            Err(e) => {
                warn!(sandbox_id = %sandbox_id, error = %e, "resume failed, reverting to paused");
                let _ = self
                    .catalog
                    .update_status(sandbox_id, SandboxStatus::Paused)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Deletes a sandbox: stops the backend instance using whichever handle
    /// is available for its current state, then removes the catalog record.
    pub async fn delete(&self, sandbox_id: Uuid) -> Result<(), CoreError> {
        let sandbox = self.catalog.get(sandbox_id).await.ok_or(CoreError::NotFound)?;

        if sandbox.is_local {
            self.tunnels.close(sandbox_id).await;
        } else if sandbox.status == SandboxStatus::Running || sandbox.status == SandboxStatus::Creating {
            self.backend.stop(sandbox_id).await?;
        } else if let Some(instance_name) = &sandbox.instance_name {
            self.backend
                .stop_by_instance_name(None, instance_name)
                .await?;
        }

        self.catalog.delete(sandbox_id).await?;
        Ok(())
    }

    /// Cascades a workspace deletion through every sandbox it owns, then
    /// removes the workspace record. Tolerates concurrent sandbox operations
    /// racing to delete the same records.
    pub async fn delete_workspace(&self, workspace_id: Uuid) -> Result<(), CoreError> {
        let sandboxes = self.catalog.list_by_workspace(workspace_id).await;
        for sandbox in sandboxes {
            if let Err(e) = self.delete(sandbox.id).await
                && !matches!(e, CoreError::NotFound)
            {
                return Err(e);
            }
        }
        self.catalog.delete_workspace(workspace_id).await?;
        Ok(())
    }

    pub fn catalog(&self) -> &Arc<dyn SandboxCatalog> {
        &self.catalog
    }

    pub fn settings(&self) -> &Arc<SettingsResolver> {
        &self.settings
    }

    pub async fn create_workspace(&self, workspace: Workspace) -> Result<(), CoreError> {
        self.catalog.create_workspace(workspace).await?;
        Ok(())
    }

    /// Runs orphan reconciliation against the backend once at startup.
    pub async fn reconcile_orphans(&self) -> Result<(), BackendError> {
        let known_instance_names = self.catalog.list_all_active_instance_names().await;
        self.backend.reconcile_orphans(&known_instance_names, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StartResult;
    use crate::catalog::InMemoryCatalog;
    use crate::settings::OverrideStore;

    struct AlwaysFailBackend;

    #[async_trait::async_trait]
    impl Backend for AlwaysFailBackend {
        async fn start(&self, _id: Uuid, _opts: StartOptions) -> Result<StartResult, BackendError> {
            Err(BackendError::other("boom"))
        }
        async fn stop(&self, _id: Uuid) -> Result<(), BackendError> {
            Ok(())
        }
        async fn stop_by_instance_name(&self, _ns: Option<&str>, _name: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn reconcile_orphans(&self, _known: &[String], _ns: &[String]) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct AlwaysOkBackend;

    #[async_trait::async_trait]
    impl Backend for AlwaysOkBackend {
        async fn start(&self, _id: Uuid, _opts: StartOptions) -> Result<StartResult, BackendError> {
            Ok(StartResult {
                pod_address: "10.0.0.5".into(),
                instance_name: "inst".into(),
            })
        }
        async fn stop(&self, _id: Uuid) -> Result<(), BackendError> {
            Ok(())
        }
        async fn stop_by_instance_name(&self, _ns: Option<&str>, _name: &str) -> Result<(), BackendError> {
            Ok(())
        }
        async fn reconcile_orphans(&self, _known: &[String], _ns: &[String]) -> Result<(), BackendError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn make_controller<B: Backend + 'static>(backend: B) -> Arc<LifecycleController<B>> {
        let catalog = InMemoryCatalog::new();
        let settings = Arc::new(SettingsResolver::new(OverrideStore::new()));
        LifecycleController::new(catalog, Arc::new(backend), settings, TunnelRegistry::new())
    }

    #[test]
    fn legal_transition_table_matches_spec() {
        use SandboxStatus::*;
        assert!(legal_transition(Creating, Running, false));
        assert!(legal_transition(Running, Pausing, false));
        assert!(!legal_transition(Running, Paused, false));
        assert!(legal_transition(Running, Offline, true));
        assert!(!legal_transition(Running, Offline, false));
        assert!(legal_transition(Paused, Resuming, false));
        assert!(!legal_transition(Paused, Running, false));
        assert!(legal_transition(Offline, Creating, true));
        assert!(!legal_transition(Offline, Creating, false));
        assert!(legal_transition(Paused, Deleting, false));
    }

    #[tokio::test]
    async fn registration_code_is_single_use() {
        let store = RegistrationCodeStore::new();
        let user_id = Uuid::new_v4();
        let workspace_id = Uuid::new_v4();
        let code = store.issue(user_id, workspace_id).await;

        store.consume(&code).await.unwrap();
        let err = store.consume(&code).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn create_cloud_deletes_record_on_backend_failure() {
        let controller = make_controller(AlwaysFailBackend);
        let req = CreateCloudRequest {
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "test".into(),
            flavor: "a".into(),
            cpu_millicores: None,
            memory_bytes: None,
            idle_timeout_seconds: None,
            namespace: None,
            shared_disk_handle: None,
        };
        let id = controller.create_cloud(req).await.unwrap();

        // Give the spawned background task a chance to run.
        for _ in 0..50 {
            if controller.catalog().get(id).await.is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(controller.catalog().get(id).await.is_none());
    }

    #[tokio::test]
    async fn create_cloud_reaches_running_on_backend_success() {
        let controller = make_controller(AlwaysOkBackend);
        let req = CreateCloudRequest {
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            name: "test".into(),
            flavor: "a".into(),
            cpu_millicores: None,
            memory_bytes: None,
            idle_timeout_seconds: None,
            namespace: None,
            shared_disk_handle: None,
        };
        let id = controller.create_cloud(req).await.unwrap();

        let mut status = None;
        for _ in 0..50 {
            if let Some(sandbox) = controller.catalog().get(id).await {
                status = Some(sandbox.status);
                if sandbox.status == SandboxStatus::Running {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(status, Some(SandboxStatus::Running));
    }

    #[tokio::test]
    async fn resume_timeout_reverts_to_paused() {
        struct TimeoutOnResume;
        #[async_trait::async_trait]
        impl Backend for TimeoutOnResume {
            async fn start(&self, _id: Uuid, _opts: StartOptions) -> Result<StartResult, BackendError> {
                Ok(StartResult { pod_address: "10.0.0.1".into(), instance_name: "inst".into() })
            }
            async fn stop(&self, _id: Uuid) -> Result<(), BackendError> { Ok(()) }
            async fn stop_by_instance_name(&self, _ns: Option<&str>, _name: &str) -> Result<(), BackendError> { Ok(()) }
            async fn reconcile_orphans(&self, _known: &[String], _ns: &[String]) -> Result<(), BackendError> { Ok(()) }
            async fn close(&self) -> Result<(), BackendError> { Ok(()) }
            async fn resume(&self, _id: Uuid) -> Result<StartResult, BackendError> {
                Err(BackendError::Timeout("pod address".into()))
            }
        }

        let controller = make_controller(TimeoutOnResume);
        let catalog = controller.catalog().clone();
        let sandbox = Sandbox {
            id: Uuid::new_v4(),
            short_id: "abcdefgh".into(),
            workspace_id: Uuid::new_v4(),
            name: "test".into(),
            flavor: "a".into(),
            status: SandboxStatus::Paused,
            is_local: false,
            pod_address: None,
            instance_name: Some("inst".into()),
            proxy_token: "p".into(),
            agent_token: "a".into(),
            tunnel_token: None,
            cpu_millicores: 100,
            memory_bytes: 100,
            idle_timeout_seconds: None,
            last_activity_at: Utc::now(),
            last_heartbeat_at: None,
            created_at: Utc::now(),
            paused_at: Some(Utc::now()),
        };
        catalog.create(sandbox.clone()).await.unwrap();

        let err = controller.resume(sandbox.id).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
        assert_eq!(
            catalog.get(sandbox.id).await.unwrap().status,
            SandboxStatus::Paused
        );
    }
}
