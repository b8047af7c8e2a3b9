//! Cluster backend variant: one Deployment per sandbox, scaled to zero on
//! pause so resume doesn't need to recreate the workload from scratch.
//!
//! Client construction, naming/labeling, and the deny-all network policy
//! follow the same shape as a Pod-per-sandbox backend, adapted here to
//! Deployment-per-sandbox so pause/resume is a replica-count flip rather
//! than a full teardown/recreate.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config as KubeConfig};
use uuid::Uuid;

use super::{Backend, BackendError, StartOptions, StartResult};

const LABEL_MANAGED_BY: &str = "sandboxd.io/managed-by";
const LABEL_SANDBOX_ID: &str = "sandboxd.io/sandbox-id";
const MANAGED_BY_VALUE: &str = "sandboxd";
const START_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ClusterBackend {
    client: Client,
    default_namespace: String,
    image: String,
    kubeconfig_path: Option<String>,
    context: Option<String>,
    runtime_class: Option<String>,
    service_account: Option<String>,
}

impl ClusterBackend {
    pub async fn connect(
        default_namespace: impl Into<String>,
        image: impl Into<String>,
        kubeconfig_path: Option<String>,
        context: Option<String>,
    ) -> Result<Self, BackendError> {
        let client = build_client(kubeconfig_path.as_deref(), context.as_deref()).await?;
        Ok(Self {
            client,
            default_namespace: default_namespace.into(),
            image: image.into(),
            kubeconfig_path,
            context,
            runtime_class: None,
            service_account: None,
        })
    }

    pub fn with_runtime_class(mut self, runtime_class: Option<String>) -> Self {
        self.runtime_class = runtime_class;
        self
    }

    pub fn with_service_account(mut self, service_account: Option<String>) -> Self {
        self.service_account = service_account;
        self
    }

    fn namespace_for(&self, opts_namespace: Option<&str>) -> String {
        opts_namespace
            .map(str::to_string)
            .unwrap_or_else(|| self.default_namespace.clone())
    }

    fn deployment_name(sandbox_id: Uuid) -> String {
        format!("sandbox-{sandbox_id}")
    }

    fn labels(sandbox_id: Uuid) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string());
        labels
    }

    fn build_deployment(&self, sandbox_id: Uuid, namespace: &str, opts: &StartOptions) -> Deployment {
        let name = Self::deployment_name(sandbox_id);
        let labels = Self::labels(sandbox_id);

        let mut limits = BTreeMap::new();
        if opts.memory_limit_bytes > 0 {
            limits.insert("memory".to_string(), Quantity(format!("{}Mi", opts.memory_limit_bytes / (1024 * 1024))));
        }
        if opts.cpu_limit_millicores > 0 {
            limits.insert("cpu".to_string(), Quantity(format!("{}m", opts.cpu_limit_millicores)));
        }

        let security_context = k8s_openapi::api::core::v1::SecurityContext {
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = Container {
            name: "sandbox".to_string(),
            image: Some(self.image.clone()),
            command: Some(vec!["sh".to_string(), "-c".to_string(), "sleep infinity".to_string()]),
            env: Some(vec![
                k8s_openapi::api::core::v1::EnvVar {
                    name: "AGENT_TOKEN".to_string(),
                    value: Some(opts.agent_token.clone()),
                    ..Default::default()
                },
                k8s_openapi::api::core::v1::EnvVar {
                    name: "PROXY_TOKEN".to_string(),
                    value: Some(opts.proxy_token.clone()),
                    ..Default::default()
                },
            ]),
            security_context: Some(security_context),
            resources: Some(k8s_openapi::api::core::v1::ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![container],
            restart_policy: Some("Always".to_string()),
            automount_service_account_token: Some(false),
            runtime_class_name: self.runtime_class.clone(),
            service_account_name: self.service_account.clone(),
            ..Default::default()
        };

        Deployment {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(namespace.to_string()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create_network_policy(&self, namespace: &str, sandbox_id: Uuid) -> Result<(), BackendError> {
        let np_api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let np_name = format!("{}-deny-all", Self::deployment_name(sandbox_id));

        let mut match_labels = BTreeMap::new();
        match_labels.insert(LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string());

        let np = NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(np_name),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(match_labels),
                    ..Default::default()
                },
                ingress: Some(vec![]),
                egress: Some(vec![]),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            }),
        };

        np_api
            .create(&PostParams::default(), &np)
            .await
            .map_err(|e| BackendError::other(format!("failed to create network policy: {e}")))?;
        Ok(())
    }

    async fn delete_network_policy(&self, namespace: &str, sandbox_id: Uuid) {
        let np_api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), namespace);
        let np_name = format!("{}-deny-all", Self::deployment_name(sandbox_id));
        let _ = np_api.delete(&np_name, &DeleteParams::default()).await;
    }

    /// Polls the deployment's pods until one reports `Running` with an IP,
    /// bounded by `START_TIMEOUT`. Used by both `start` and `resume`.
    async fn wait_for_pod_address(&self, namespace: &str, sandbox_id: Uuid) -> Result<String, BackendError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let label_selector = format!("{}={}", LABEL_SANDBOX_ID, sandbox_id);
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            let list = pods
                .list(&ListParams::default().labels(&label_selector))
                .await
                .map_err(|e| BackendError::other(format!("failed to list pods: {e}")))?;

            for pod in &list.items {
                let ready = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    .map(|phase| phase == "Running")
                    .unwrap_or(false);
                let address = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
                if ready && let Some(address) = address {
                    return Ok(address);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(BackendError::Timeout(format!(
            "pod for sandbox {sandbox_id} did not become ready within {START_TIMEOUT:?}"
        )))
    }

    async fn scale(&self, namespace: &str, sandbox_id: Uuid, replicas: i32) -> Result<(), BackendError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let name = Self::deployment_name(sandbox_id);
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        deployments
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) if resp.code == 404 => {
                    BackendError::NotFound(format!("deployment {name}"))
                }
                other => BackendError::other(format!("failed to scale deployment {name}: {other}")),
            })?;
        Ok(())
    }
}

async fn build_client(kubeconfig_path: Option<&str>, context: Option<&str>) -> Result<Client, BackendError> {
    if let Ok(config) = KubeConfig::incluster() {
        return Client::try_from(config)
            .map_err(|e| BackendError::Unavailable(format!("in-cluster client: {e}")));
    }

    let kubeconfig = if let Some(path) = kubeconfig_path {
        Kubeconfig::read_from(tilde_expand(path))
            .map_err(|e| BackendError::Unavailable(format!("reading kubeconfig: {e}")))?
    } else {
        Kubeconfig::read().map_err(|e| BackendError::Unavailable(format!("reading kubeconfig: {e}")))?
    };

    let mut options = KubeConfigOptions::default();
    if let Some(ctx) = context {
        options.context = Some(ctx.to_string());
    }

    let kube_config = KubeConfig::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| BackendError::Unavailable(format!("building kube config: {e}")))?;

    Client::try_from(kube_config).map_err(|e| BackendError::Unavailable(format!("client: {e}")))
}

fn tilde_expand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return format!("{}/{}", home.to_string_lossy(), rest);
    }
    path.to_string()
}

#[async_trait]
impl Backend for ClusterBackend {
    async fn start(
        &self,
        sandbox_id: Uuid,
        opts: StartOptions,
    ) -> Result<StartResult, BackendError> {
        let namespace = self.namespace_for(opts.namespace.as_deref());

        let ns_api: Api<Namespace> = Api::all(self.client.clone());
        let _ = ns_api
            .create(
                &PostParams::default(),
                &Namespace {
                    metadata: ObjectMeta {
                        name: Some(namespace.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await;

        let deployment = self.build_deployment(sandbox_id, &namespace, &opts);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        deployments
            .create(&PostParams::default(), &deployment)
            .await
            .map_err(|e| BackendError::other(format!("failed to create deployment: {e}")))?;

        self.create_network_policy(&namespace, sandbox_id).await?;

        let pod_address = self.wait_for_pod_address(&namespace, sandbox_id).await?;

        Ok(StartResult {
            pod_address,
            instance_name: Self::deployment_name(sandbox_id),
        })
    }

    async fn stop(&self, sandbox_id: Uuid) -> Result<(), BackendError> {
        // Namespace isn't tracked on the backend past start; callers that
        // need a non-default namespace use `stop_by_instance_name` instead.
        self.stop_by_instance_name(Some(&self.default_namespace), &Self::deployment_name(sandbox_id))
            .await
    }

    async fn stop_by_instance_name(
        &self,
        namespace: Option<&str>,
        instance_name: &str,
    ) -> Result<(), BackendError> {
        let namespace = self.namespace_for(namespace);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        // Idempotent: deleting an already-gone deployment is a no-op.
        let _ = deployments.delete(instance_name, &DeleteParams::default()).await;

        let np_api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &namespace);
        let _ = np_api
            .delete(&format!("{instance_name}-deny-all"), &DeleteParams::default())
            .await;
        Ok(())
    }

    async fn reconcile_orphans(
        &self,
        known_instance_names: &[String],
        known_namespaces: &[String],
    ) -> Result<(), BackendError> {
        let namespaces = if known_namespaces.is_empty() {
            vec![self.default_namespace.clone()]
        } else {
            known_namespaces.to_vec()
        };

        for namespace in namespaces {
            let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
            let list = deployments
                .list(&ListParams::default().labels(&format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}")))
                .await
                .map_err(|e| BackendError::other(format!("failed to list deployments: {e}")))?;

            for deployment in list.items {
                let Some(name) = deployment.metadata.name else {
                    continue;
                };
                if !known_instance_names.contains(&name) {
                    tracing::warn!(deployment = %name, namespace = %namespace, "reconciling orphaned deployment");
                    let _ = self.stop_by_instance_name(Some(&namespace), &name).await;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.reconcile_orphans(&[], &[]).await
    }

    async fn resume(&self, sandbox_id: Uuid) -> Result<StartResult, BackendError> {
        self.scale(&self.default_namespace, sandbox_id, 1).await?;
        let pod_address = self
            .wait_for_pod_address(&self.default_namespace, sandbox_id)
            .await?;
        Ok(StartResult {
            pod_address,
            instance_name: Self::deployment_name(sandbox_id),
        })
    }

    async fn pause(&self, sandbox_id: Uuid) -> Result<(), BackendError> {
        self.scale(&self.default_namespace, sandbox_id, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_name_is_prefixed() {
        let id = Uuid::new_v4();
        assert!(ClusterBackend::deployment_name(id).starts_with("sandbox-"));
    }

    #[test]
    fn labels_carry_sandbox_id() {
        let id = Uuid::new_v4();
        let labels = ClusterBackend::labels(id);
        assert_eq!(labels.get(LABEL_SANDBOX_ID), Some(&id.to_string()));
    }
}
