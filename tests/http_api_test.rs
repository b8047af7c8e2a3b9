//! End-to-end tests against a real `sandboxd` HTTP server: workspace and
//! sandbox lifecycle through the management API, and data-plane host
//! classification for unknown subdomains.
//!
//! Drives the built server from the outside over a real TCP socket rather
//! than calling handlers directly, the same way a CLI integration test would
//! shell out to the built binary.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

use sandboxd::backend::{Backend, BackendError, StartOptions, StartResult};
use sandboxd::catalog::InMemoryCatalog;
use sandboxd::config::Config;
use sandboxd::dataplane::{DenyAllMembership, RejectAllSessions};
use sandboxd::http_api::{AppState, NullAssetServer};
use sandboxd::lifecycle::LifecycleController;
use sandboxd::settings::{OverrideStore, SettingsResolver};
use sandboxd::tunnel::TunnelRegistry;

/// A backend that always succeeds immediately, standing in for a real
/// container/cluster driver so the lifecycle controller can be exercised
/// without Docker or Kubernetes.
struct FakeBackend;

#[async_trait::async_trait]
impl Backend for FakeBackend {
    async fn start(&self, _id: Uuid, _opts: StartOptions) -> Result<StartResult, BackendError> {
        Ok(StartResult {
            pod_address: "10.0.0.9".into(),
            instance_name: "fake-instance".into(),
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

async fn spawn_server() -> SocketAddr {
    let config = Arc::new(Config::minimal());
    let catalog = InMemoryCatalog::new();
    let settings = Arc::new(SettingsResolver::new(OverrideStore::new()));
    let tunnels = TunnelRegistry::new();
    let lifecycle = LifecycleController::new(catalog.clone(), Arc::new(FakeBackend), settings, tunnels.clone());
    let state = Arc::new(AppState::new(
        config,
        catalog,
        lifecycle,
        tunnels,
        Arc::new(RejectAllSessions),
        Arc::new(DenyAllMembership),
        Arc::new(NullAssetServer),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let state = state.clone();
            tokio::spawn(async move {
                let service = hyper::service::service_fn(move |req| {
                    let state = state.clone();
                    sandboxd::http_api::handle_request_for_tests(req, state)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await;
            });
        }
    });

    addr
}

type HttpClient = Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>;

fn client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn request(
    client: &HttpClient,
    addr: SocketAddr,
    method: Method,
    path: &str,
    host: &str,
    body: Value,
) -> (hyper::StatusCode, Value) {
    let body_bytes = if body.is_null() {
        Bytes::new()
    } else {
        Bytes::from(serde_json::to_vec(&body).unwrap())
    };
    let req: Request<Full<Bytes>> = Request::builder()
        .method(method)
        .uri(format!("http://{addr}{path}"))
        .header("host", host)
        .header("content-type", "application/json")
        .body(Full::new(body_bytes))
        .unwrap();
    let resp: Response<Incoming> = client.request(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let parsed = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, parsed)
}

#[tokio::test]
async fn full_workspace_and_sandbox_lifecycle() {
    let addr = spawn_server().await;
    let c = client();
    let mgmt_host = "api.localhost";

    let owner_id = Uuid::new_v4();
    let (status, body) = request(
        &c,
        addr,
        Method::POST,
        "/api/workspaces",
        mgmt_host,
        json!({ "display_name": "acme", "owner_user_id": owner_id }),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::CREATED);
    let workspace_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = request(
        &c,
        addr,
        Method::POST,
        &format!("/api/workspaces/{workspace_id}/registration-codes"),
        mgmt_host,
        json!({ "user_id": owner_id }),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::CREATED);
    let code = body["data"]["code"].as_str().unwrap().to_string();

    let (status, body) = request(
        &c,
        addr,
        Method::POST,
        "/api/sandboxes/local",
        mgmt_host,
        json!({ "code": code, "name": "my-box", "flavor": "agent" }),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::CREATED);
    let sandbox_id = body["data"]["id"].as_str().unwrap().to_string();
    assert!(body["data"]["agent_token"].is_string());

    // the registration code is single-use
    let (status, _) = request(
        &c,
        addr,
        Method::POST,
        "/api/sandboxes/local",
        mgmt_host,
        json!({ "code": code, "name": "again", "flavor": "agent" }),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::CONFLICT);

    let (status, body) = request(
        &c,
        addr,
        Method::GET,
        &format!("/api/sandboxes/{sandbox_id}"),
        mgmt_host,
        Value::Null,
    )
    .await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body["data"]["flavor"], "agent");

    let (status, _) = request(
        &c,
        addr,
        Method::GET,
        &format!("/api/workspaces/{workspace_id}/sandboxes"),
        mgmt_host,
        Value::Null,
    )
    .await;
    assert_eq!(status, hyper::StatusCode::OK);

    let (status, _) = request(
        &c,
        addr,
        Method::DELETE,
        &format!("/api/sandboxes/{sandbox_id}"),
        mgmt_host,
        Value::Null,
    )
    .await;
    assert_eq!(status, hyper::StatusCode::OK);

    let (status, _) = request(
        &c,
        addr,
        Method::GET,
        &format!("/api/sandboxes/{sandbox_id}"),
        mgmt_host,
        Value::Null,
    )
    .await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cloud_sandbox_create_reaches_running() {
    let addr = spawn_server().await;
    let c = client();
    let mgmt_host = "api.localhost";

    let owner_id = Uuid::new_v4();
    let (_, body) = request(
        &c,
        addr,
        Method::POST,
        "/api/workspaces",
        mgmt_host,
        json!({ "display_name": "acme", "owner_user_id": owner_id }),
    )
    .await;
    let workspace_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = request(
        &c,
        addr,
        Method::POST,
        "/api/sandboxes",
        mgmt_host,
        json!({
            "user_id": owner_id,
            "workspace_id": workspace_id,
            "name": "cloud-box",
            "flavor": "agent",
        }),
    )
    .await;
    assert_eq!(status, hyper::StatusCode::ACCEPTED);
    let sandbox_id = body["data"]["id"].as_str().unwrap().to_string();

    let mut last_status = String::new();
    for _ in 0..50 {
        let (_, body) = request(
            &c,
            addr,
            Method::GET,
            &format!("/api/sandboxes/{sandbox_id}"),
            mgmt_host,
            Value::Null,
        )
        .await;
        last_status = body["data"]["status"].as_str().unwrap_or("").to_string();
        if last_status == "running" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(last_status, "running");
}

#[tokio::test]
async fn unknown_subdomain_returns_not_found() {
    let addr = spawn_server().await;
    let c = client();
    let (status, _) = request(
        &c,
        addr,
        Method::GET,
        "/",
        "agent-doesnotexist.sandboxes.localhost",
        Value::Null,
    )
    .await;
    assert_eq!(status, hyper::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_check_ok() {
    let addr = spawn_server().await;
    let c = client();
    let (status, body) = request(&c, addr, Method::GET, "/health", "api.localhost", Value::Null).await;
    assert_eq!(status, hyper::StatusCode::OK);
    assert_eq!(body["data"], "ok");
}
