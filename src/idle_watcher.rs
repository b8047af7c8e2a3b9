//! Idle watcher (C5): periodically pauses cloud sandboxes that have been
//! inactive past their effective idle timeout.
//!
//! Runs as a `tokio::spawn` background task on a `tokio::time::interval`
//! loop; never blocks on backend I/O itself, instead handing each candidate
//! off to [`LifecycleController::pause`] which owns that sequencing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::backend::Backend;
use crate::catalog::SandboxCatalog;
use crate::lifecycle::LifecycleController;
use crate::settings::SettingsResolver;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runs the idle sweep forever. Intended to be spawned once at process
/// startup alongside the HTTP server.
pub async fn run<B: Backend + 'static>(
    catalog: Arc<dyn SandboxCatalog>,
    settings: Arc<SettingsResolver>,
    lifecycle: Arc<LifecycleController<B>>,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        sweep_once(&catalog, &settings, &lifecycle).await;
    }
}

async fn sweep_once<B: Backend + 'static>(
    catalog: &Arc<dyn SandboxCatalog>,
    settings: &Arc<SettingsResolver>,
    lifecycle: &Arc<LifecycleController<B>>,
) {
    let default_timeout = settings.effective().await.default_idle_timeout_seconds;
    let candidates = catalog.list_idle(default_timeout).await;
    for sandbox in candidates {
        info!(sandbox_id = %sandbox.id, "idle timeout exceeded, pausing");
        if let Err(e) = lifecycle.pause(sandbox.id).await {
            warn!(sandbox_id = %sandbox.id, error = %e, "idle pause failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, StartOptions, StartResult};
    use crate::catalog::{InMemoryCatalog, Sandbox, SandboxStatus, Workspace};
    use crate::settings::OverrideStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    struct AlwaysOkBackend;

    #[async_trait]
    impl Backend for AlwaysOkBackend {
        async fn start(&self, _id: Uuid, _opts: StartOptions) -> Result<StartResult, BackendError> {
            unreachable!("idle watcher never starts sandboxes")
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
        async fn pause(&self, _id: Uuid) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn idle_sandbox(workspace_id: Uuid, idle_timeout_seconds: Option<u64>) -> Sandbox {
        Sandbox {
            id: Uuid::new_v4(),
            short_id: format!("s{}", Uuid::new_v4().simple()),
            workspace_id,
            name: "test".into(),
            flavor: "default".into(),
            status: SandboxStatus::Running,
            is_local: false,
            pod_address: Some("10.0.0.1:8080".into()),
            instance_name: Some("inst".into()),
            proxy_token: format!("p{}", Uuid::new_v4().simple()),
            agent_token: format!("a{}", Uuid::new_v4().simple()),
            tunnel_token: None,
            cpu_millicores: 100,
            memory_bytes: 1 << 20,
            idle_timeout_seconds,
            last_activity_at: Utc::now() - chrono::Duration::hours(2),
            last_heartbeat_at: None,
            created_at: Utc::now() - chrono::Duration::hours(3),
            paused_at: None,
        }
    }

    async fn setup_workspace(catalog: &Arc<dyn SandboxCatalog>) -> Uuid {
        let workspace_id = Uuid::new_v4();
        catalog
            .create_workspace(Workspace {
                id: workspace_id,
                display_name: "test".into(),
                isolation_namespace: None,
                disk_handle: None,
            })
            .await
            .unwrap();
        workspace_id
    }

    #[tokio::test]
    async fn sweep_pauses_idle_cloud_sandboxes() {
        let catalog: Arc<dyn SandboxCatalog> = InMemoryCatalog::new();
        let settings = Arc::new(SettingsResolver::new(OverrideStore::new()));
        let lifecycle = LifecycleController::new(catalog.clone(), Arc::new(AlwaysOkBackend), settings.clone(), crate::tunnel::TunnelRegistry::new());

        let workspace_id = setup_workspace(&catalog).await;
        let sandbox = idle_sandbox(workspace_id, Some(60));
        let id = sandbox.id;
        catalog.create(sandbox).await.unwrap();

        sweep_once(&catalog, &settings, &lifecycle).await;

        let updated = catalog.get(id).await.unwrap();
        assert_eq!(updated.status, SandboxStatus::Paused);
    }

    #[tokio::test]
    async fn sweep_skips_sandbox_with_zero_override() {
        let catalog: Arc<dyn SandboxCatalog> = InMemoryCatalog::new();
        let settings = Arc::new(SettingsResolver::new(OverrideStore::new()));
        let lifecycle = LifecycleController::new(catalog.clone(), Arc::new(AlwaysOkBackend), settings.clone(), crate::tunnel::TunnelRegistry::new());

        let workspace_id = setup_workspace(&catalog).await;
        let sandbox = idle_sandbox(workspace_id, Some(0));
        let id = sandbox.id;
        catalog.create(sandbox).await.unwrap();

        sweep_once(&catalog, &settings, &lifecycle).await;

        let updated = catalog.get(id).await.unwrap();
        assert_eq!(updated.status, SandboxStatus::Running);
    }
}
