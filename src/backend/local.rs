//! Local-runtime backend variant: one Docker/Podman container per sandbox.
//!
//! Detects the available container runtime, names each container by sandbox
//! id, overrides the entrypoint to keep the container alive, and execs/stops
//! by that container name.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Backend, BackendError, StartOptions, StartResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    fn cmd(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

/// Detects the best available container runtime, preferring Podman
/// (rootless, daemonless) over Docker.
pub async fn detect_container_runtime() -> Option<ContainerRuntime> {
    if runtime_available(ContainerRuntime::Podman).await {
        Some(ContainerRuntime::Podman)
    } else if runtime_available(ContainerRuntime::Docker).await {
        Some(ContainerRuntime::Docker)
    } else {
        None
    }
}

async fn runtime_available(runtime: ContainerRuntime) -> bool {
    Command::new(runtime.cmd())
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

fn container_name(sandbox_id: Uuid) -> String {
    format!("sandboxd-{sandbox_id}")
}

/// Container-based backend. Tracks each instance by sandbox id; `image` is
/// the base image used for every sandbox (selected per-flavor by the caller
/// via `StartOptions::flavor`, resolved to an image by the lifecycle layer).
pub struct LocalBackend {
    runtime: ContainerRuntime,
    image: String,
    instances: Mutex<HashMap<Uuid, String>>,
}

impl LocalBackend {
    pub fn new(runtime: ContainerRuntime, image: impl Into<String>) -> Self {
        Self {
            runtime,
            image: image.into(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, BackendError> {
        Command::new(self.runtime.cmd())
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn start(
        &self,
        sandbox_id: Uuid,
        opts: StartOptions,
    ) -> Result<StartResult, BackendError> {
        let name = container_name(sandbox_id);

        // Remove any stale container with the same name from a prior crash.
        let existing = self
            .run(&["ps", "-aq", "-f", &format!("name={name}")])
            .await?;
        let existing_id = String::from_utf8_lossy(&existing.stdout).trim().to_string();
        if !existing_id.is_empty() {
            let _ = self.run(&["rm", "-f", &existing_id]).await;
        }

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.clone(),
            "--hostname".into(),
            "sandboxd".into(),
            "-e".into(),
            format!("AGENT_TOKEN={}", opts.agent_token),
            "-e".into(),
            format!("PROXY_TOKEN={}", opts.proxy_token),
        ];
        if opts.cpu_limit_millicores > 0 {
            args.push("--cpus".into());
            args.push(format!("{:.2}", opts.cpu_limit_millicores as f64 / 1000.0));
        }
        if opts.memory_limit_bytes > 0 {
            args.push("--memory".into());
            args.push(format!("{}", opts.memory_limit_bytes));
        }
        args.push(self.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(BackendError::other(format!(
                "failed to start container: {stderr}"
            )));
        }

        let pod_address = inspect_ip_address(self.runtime, &name).await?;
        self.instances.lock().await.insert(sandbox_id, name.clone());
        info!(sandbox_id = %sandbox_id, container = %name, "started local container");

        Ok(StartResult {
            pod_address,
            instance_name: name,
        })
    }

    async fn stop(&self, sandbox_id: Uuid) -> Result<(), BackendError> {
        let name = {
            let mut instances = self.instances.lock().await;
            instances.remove(&sandbox_id)
        }
        .unwrap_or_else(|| container_name(sandbox_id));
        self.stop_by_instance_name(None, &name).await
    }

    async fn stop_by_instance_name(
        &self,
        _namespace: Option<&str>,
        instance_name: &str,
    ) -> Result<(), BackendError> {
        // Idempotent: stopping/removing a container that doesn't exist succeeds.
        let _ = self.run(&["rm", "-f", instance_name]).await;
        Ok(())
    }

    async fn reconcile_orphans(
        &self,
        known_instance_names: &[String],
        _known_namespaces: &[String],
    ) -> Result<(), BackendError> {
        let output = self
            .run(&["ps", "-aq", "-f", "name=sandboxd-", "--format", "{{.Names}}"])
            .await?;
        let names: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();

        for name in names {
            if !known_instance_names.contains(&name) {
                warn!(container = %name, "reconciling orphaned container");
                let _ = self.run(&["rm", "-f", &name]).await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        let instances: Vec<String> = self.instances.lock().await.values().cloned().collect();
        for name in instances {
            let _ = self.run(&["rm", "-f", &name]).await;
        }
        Ok(())
    }
}

async fn inspect_ip_address(
    runtime: ContainerRuntime,
    name: &str,
) -> Result<String, BackendError> {
    let output = Command::new(runtime.cmd())
        .args([
            "inspect",
            "-f",
            "{{.NetworkSettings.IPAddress}}",
            name,
        ])
        .output()
        .await
        .map_err(|e| BackendError::Unavailable(e.to_string()))?;

    let addr = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if addr.is_empty() {
        return Err(BackendError::other("container has no IP address"));
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_name_is_stable_for_an_id() {
        let id = Uuid::new_v4();
        assert_eq!(container_name(id), container_name(id));
        assert!(container_name(id).starts_with("sandboxd-"));
    }
}
