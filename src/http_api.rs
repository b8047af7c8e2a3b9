//! HTTP server: wires C1–C7 into one hyper listener. Every inbound request
//! is classified by its `Host` header into the asset router, the subdomain
//! router, or the management API (which owns the upstream-API proxy and the
//! tunnel WebSocket upgrade endpoint as path prefixes).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::Backend;
use crate::catalog::SandboxCatalog;
use crate::config::Config;
use crate::dataplane::subdomain::SubdomainRouter;
use crate::dataplane::upstream_proxy::UpstreamProxy;
use crate::dataplane::{classify_host, full_body, Body, HostClass, MembershipOracle, SessionAuthenticator, StaticAssetServer};
use crate::errors::CoreError;
use crate::lifecycle::{CreateCloudRequest, LifecycleController, RegistrationCodeStore};
use crate::tunnel::TunnelRegistry;

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<Body> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .expect("static response is well-formed")
}

fn error_response(err: CoreError) -> Response<Body> {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_response(status, &ApiResponse::<()>::error(err.to_string()))
}

async fn read_json_body<T: for<'de> Deserialize<'de>>(
    req: Request<Incoming>,
) -> Result<T, Response<Body>> {
    use http_body_util::BodyExt;
    let bytes = req
        .collect()
        .await
        .map_err(|_| json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("failed to read body")))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error(format!("invalid JSON: {e}"))))
}

fn sandbox_view(sandbox: &crate::catalog::Sandbox) -> serde_json::Value {
    serde_json::json!({
        "id": sandbox.id,
        "short_id": sandbox.short_id,
        "workspace_id": sandbox.workspace_id,
        "name": sandbox.name,
        "flavor": sandbox.flavor,
        "status": format!("{:?}", sandbox.status).to_lowercase(),
        "is_local": sandbox.is_local,
    })
}

/// No-op static asset server: the embedded UI bundle is out of scope (an
/// explicit non-goal), so the seam simply reports every path as absent.
pub struct NullAssetServer;

#[async_trait]
impl StaticAssetServer for NullAssetServer {
    async fn serve(&self, _path: &str) -> Option<Response<Body>> {
        None
    }
}

/// Shared state behind every request, generic over the backend driver so the
/// same server wires either the local or cluster variant.
pub struct AppState<B: Backend + 'static> {
    pub config: Arc<Config>,
    pub catalog: Arc<dyn SandboxCatalog>,
    pub lifecycle: Arc<LifecycleController<B>>,
    pub tunnels: Arc<TunnelRegistry>,
    pub registration_codes: Arc<RegistrationCodeStore>,
    pub assets: Arc<dyn StaticAssetServer>,
    pub subdomain_router: Arc<SubdomainRouter>,
    pub upstream_proxy: Arc<UpstreamProxy>,
}

impl<B: Backend + 'static> AppState<B> {
    pub fn new(
        config: Arc<Config>,
        catalog: Arc<dyn SandboxCatalog>,
        lifecycle: Arc<LifecycleController<B>>,
        tunnels: Arc<TunnelRegistry>,
        sessions: Arc<dyn SessionAuthenticator>,
        membership: Arc<dyn MembershipOracle>,
        assets: Arc<dyn StaticAssetServer>,
    ) -> Self {
        let subdomain_router = Arc::new(SubdomainRouter::new(
            catalog.clone(),
            tunnels.clone(),
            crate::activity::ActivityThrottle::new(),
            sessions,
            membership,
            config.clone(),
        ));
        let upstream_proxy = Arc::new(UpstreamProxy::new(catalog.clone(), config.clone()));
        Self {
            config,
            catalog,
            lifecycle,
            tunnels,
            registration_codes: RegistrationCodeStore::new(),
            assets,
            subdomain_router,
            upstream_proxy,
        }
    }
}

/// Exposed for integration tests that need to drive the full request
/// dispatch without going through [`run_server`]'s TCP accept loop.
pub async fn handle_request_for_tests<B: Backend + 'static>(
    req: Request<Incoming>,
    state: Arc<AppState<B>>,
) -> Result<Response<Body>, hyper::Error> {
    handle_request(req, state).await
}

async fn handle_request<B: Backend + 'static>(
    mut req: Request<Incoming>,
    state: Arc<AppState<B>>,
) -> Result<Response<Body>, hyper::Error> {
    let host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let class = classify_host(&host, &state.config);
    let response = match class {
        HostClass::Asset => state
            .assets
            .serve(req.uri().path())
            .await
            .unwrap_or_else(|| json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::error("asset not found"))),
        HostClass::Subdomain { flavor, short_id } => {
            state.subdomain_router.handle(&flavor, &short_id, req).await
        }
        HostClass::Management => {
            if req.uri().path().starts_with("/api/tunnel/") {
                handle_tunnel_upgrade(&mut req, &state).await
            } else if let Some(downstream) = req.uri().path().strip_prefix("/api/upstream") {
                let downstream = downstream.to_string();
                state.upstream_proxy.handle(req, &downstream).await
            } else {
                handle_management_api(req, &state).await
            }
        }
    };

    Ok(response)
}

async fn handle_tunnel_upgrade<B: Backend + 'static>(
    req: &mut Request<Incoming>,
    state: &Arc<AppState<B>>,
) -> Response<Body> {
    let path = req.uri().path().to_string();
    let Some(sandbox_id_str) = path.strip_prefix("/api/tunnel/") else {
        return json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::error("not found"));
    };
    let Ok(sandbox_id) = Uuid::parse_str(sandbox_id_str) else {
        return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid sandbox id"));
    };
    let token = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|p| p.split_once('=').filter(|(k, _)| *k == "token").map(|(_, v)| v.to_string())));
    let Some(token) = token else {
        return json_response(StatusCode::UNAUTHORIZED, &ApiResponse::<()>::error("missing tunnel token"));
    };

    if !hyper_tungstenite::is_upgrade_request(req) {
        return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("expected websocket upgrade"));
    }

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "websocket upgrade negotiation failed");
            return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("upgrade failed"));
        }
    };

    let tunnels = state.tunnels.clone();
    let catalog = state.catalog.clone();
    tokio::spawn(async move {
        match websocket.await {
            Ok(socket) => {
                if let Err(e) = tunnels.accept(catalog, sandbox_id, &token, socket).await {
                    warn!(sandbox_id = %sandbox_id, error = %e, "tunnel accept rejected");
                }
            }
            Err(e) => warn!(sandbox_id = %sandbox_id, error = %e, "websocket upgrade failed"),
        }
    });

    let (parts, body) = response.into_parts();
    let body: Body = http_body_util::BodyExt::boxed(http_body_util::BodyExt::map_err(body, |never| match never {}));
    Response::from_parts(parts, body)
}

#[derive(Deserialize)]
struct CreateWorkspaceRequest {
    display_name: String,
    owner_user_id: Uuid,
}

#[derive(Deserialize)]
struct IssueCodeRequest {
    user_id: Uuid,
}

#[derive(Deserialize)]
struct CreateCloudSandboxRequest {
    user_id: Uuid,
    workspace_id: Uuid,
    name: String,
    flavor: String,
    cpu_millicores: Option<u64>,
    memory_bytes: Option<u64>,
    idle_timeout_seconds: Option<u64>,
}

#[derive(Deserialize)]
struct CreateLocalSandboxRequest {
    code: String,
    name: String,
    flavor: String,
}

async fn handle_management_api<B: Backend + 'static>(
    req: Request<Incoming>,
    state: &Arc<AppState<B>>,
) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &ApiResponse::success("ok")),

        (Method::POST, ["api", "workspaces"]) => {
            let body: CreateWorkspaceRequest = match read_json_body(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            let workspace_id = Uuid::new_v4();
            let workspace = crate::catalog::Workspace {
                id: workspace_id,
                display_name: body.display_name,
                isolation_namespace: None,
                disk_handle: None,
            };
            match state.lifecycle.create_workspace(workspace).await {
                Ok(()) => {
                    state
                        .catalog
                        .record_workspace_owner(workspace_id, body.owner_user_id)
                        .await;
                    json_response(StatusCode::CREATED, &ApiResponse::success(serde_json::json!({ "id": workspace_id })))
                }
                Err(e) => error_response(e),
            }
        }

        (Method::POST, ["api", "workspaces", workspace_id, "registration-codes"]) => {
            let Ok(workspace_id) = Uuid::parse_str(workspace_id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid workspace id"));
            };
            let body: IssueCodeRequest = match read_json_body(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            let code = state.registration_codes.issue(body.user_id, workspace_id).await;
            json_response(StatusCode::CREATED, &ApiResponse::success(serde_json::json!({ "code": code })))
        }

        (Method::POST, ["api", "sandboxes"]) => {
            let body: CreateCloudSandboxRequest = match read_json_body(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            let create_req = CreateCloudRequest {
                user_id: body.user_id,
                workspace_id: body.workspace_id,
                name: body.name,
                flavor: body.flavor,
                cpu_millicores: body.cpu_millicores,
                memory_bytes: body.memory_bytes,
                idle_timeout_seconds: body.idle_timeout_seconds,
                namespace: None,
                shared_disk_handle: None,
            };
            match state.lifecycle.create_cloud(create_req).await {
                Ok(id) => json_response(StatusCode::ACCEPTED, &ApiResponse::success(serde_json::json!({ "id": id }))),
                Err(e) => error_response(e),
            }
        }

        (Method::POST, ["api", "sandboxes", "local"]) => {
            let body: CreateLocalSandboxRequest = match read_json_body(req).await {
                Ok(b) => b,
                Err(resp) => return resp,
            };
            let (_, workspace_id) = match state.registration_codes.consume(&body.code).await {
                Ok(pair) => pair,
                Err(e) => return error_response(e),
            };
            match state.lifecycle.create_local(workspace_id, body.name, body.flavor).await {
                Ok(sandbox) => json_response(
                    StatusCode::CREATED,
                    &ApiResponse::success(serde_json::json!({
                        "id": sandbox.id,
                        "agent_token": sandbox.agent_token,
                        "proxy_token": sandbox.proxy_token,
                        "tunnel_token": sandbox.tunnel_token,
                    })),
                ),
                Err(e) => error_response(e),
            }
        }

        (Method::GET, ["api", "workspaces", workspace_id, "sandboxes"]) => {
            let Ok(workspace_id) = Uuid::parse_str(workspace_id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid workspace id"));
            };
            let sandboxes = state.catalog.list_by_workspace(workspace_id).await;
            let views: Vec<_> = sandboxes.iter().map(sandbox_view).collect();
            json_response(StatusCode::OK, &ApiResponse::success(views))
        }

        (Method::GET, ["api", "sandboxes", id]) => {
            let Ok(id) = Uuid::parse_str(id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid sandbox id"));
            };
            match state.catalog.get(id).await {
                Some(sandbox) => json_response(StatusCode::OK, &ApiResponse::success(sandbox_view(&sandbox))),
                None => json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::error("not found")),
            }
        }

        (Method::DELETE, ["api", "sandboxes", id]) => {
            let Ok(id) = Uuid::parse_str(id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid sandbox id"));
            };
            match state.lifecycle.delete(id).await {
                Ok(()) => json_response(StatusCode::OK, &ApiResponse::success("deleted")),
                Err(e) => error_response(e),
            }
        }

        (Method::DELETE, ["api", "workspaces", workspace_id]) => {
            let Ok(workspace_id) = Uuid::parse_str(workspace_id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid workspace id"));
            };
            match state.lifecycle.delete_workspace(workspace_id).await {
                Ok(()) => json_response(StatusCode::OK, &ApiResponse::success("deleted")),
                Err(e) => error_response(e),
            }
        }

        (Method::POST, ["api", "sandboxes", id, "pause"]) => {
            let Ok(id) = Uuid::parse_str(id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid sandbox id"));
            };
            match state.lifecycle.pause(id).await {
                Ok(()) => json_response(StatusCode::OK, &ApiResponse::success("paused")),
                Err(e) => error_response(e),
            }
        }

        (Method::POST, ["api", "sandboxes", id, "resume"]) => {
            let Ok(id) = Uuid::parse_str(id) else {
                return json_response(StatusCode::BAD_REQUEST, &ApiResponse::<()>::error("invalid sandbox id"));
            };
            match state.lifecycle.resume(id).await {
                Ok(()) => json_response(StatusCode::OK, &ApiResponse::success("resumed")),
                Err(e) => error_response(e),
            }
        }

        _ => json_response(StatusCode::NOT_FOUND, &ApiResponse::<()>::error("not found")),
    }
}

/// Runs the HTTP server until the process is killed, accepting connections
/// and dispatching each through [`handle_request`].
pub async fn run_server<B: Backend + 'static>(addr: SocketAddr, state: Arc<AppState<B>>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "sandboxd HTTP server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                error!(error = %err, "connection error");
            }
        });
    }
}
