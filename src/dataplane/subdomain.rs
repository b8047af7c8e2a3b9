//! Subdomain handler: cookie-gated reverse proxy onto a running sandbox.
//!
//! Strips hop-by-hop headers and rebuilds the outbound URI the way any
//! reverse proxy hop must; exposed as a plain async method the raw-hyper
//! service calls directly rather than a framework handler.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::activity::ActivityThrottle;
use crate::catalog::{SandboxCatalog, SandboxStatus};
use crate::config::{AuthScheme, Config};
use crate::dataplane::{empty_body, error_page, Body, MembershipOracle, SessionAuthenticator};
use crate::tunnel::TunnelRegistry;

const SUBDOMAIN_COOKIE_PREFIX: &str = "sbx_session_";

// Headers that must not be forwarded across a proxy hop, either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

pub struct SubdomainRouter {
    pub catalog: Arc<dyn SandboxCatalog>,
    pub tunnels: Arc<TunnelRegistry>,
    pub activity: Arc<ActivityThrottle>,
    pub sessions: Arc<dyn SessionAuthenticator>,
    pub membership: Arc<dyn MembershipOracle>,
    pub config: Arc<Config>,
    pub http_client: Client<hyper_util::client::legacy::connect::HttpConnector, Body>,
}

impl SubdomainRouter {
    pub fn new(
        catalog: Arc<dyn SandboxCatalog>,
        tunnels: Arc<TunnelRegistry>,
        activity: Arc<ActivityThrottle>,
        sessions: Arc<dyn SessionAuthenticator>,
        membership: Arc<dyn MembershipOracle>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog,
            tunnels,
            activity,
            sessions,
            membership,
            config,
            http_client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub async fn handle(
        &self,
        flavor: &str,
        short_id: &str,
        req: Request<Incoming>,
    ) -> Response<Body> {
        let Some(sandbox) = self.catalog.get_by_short_id(short_id).await else {
            return error_page(404, "Sandbox not found", "This sandbox does not exist.", false);
        };
        if sandbox.flavor != flavor {
            return error_page(404, "Sandbox not found", "This sandbox does not exist.", false);
        }

        if req.uri().path() == "/auth" {
            return self.handle_auth_exchange(&sandbox, &req).await;
        }

        let cookie_name = subdomain_cookie_name(flavor);
        let cookies = parse_cookies(&req);
        match cookies.get(&cookie_name) {
            Some(value) if self.cookie_authorizes(&sandbox, value).await => {}
            _ => return redirect_to_main_site(&self.config),
        }

        match sandbox.status {
            SandboxStatus::Paused | SandboxStatus::Pausing | SandboxStatus::Offline => {
                return error_page(
                    503,
                    "Sandbox is paused",
                    "This sandbox is not currently running. It will resume shortly if you continue working.",
                    true,
                );
            }
            SandboxStatus::Deleting => {
                return error_page(404, "Sandbox not found", "This sandbox has been removed.", false);
            }
            _ => {}
        }

        if sandbox.is_local && !self.tunnels.is_connected(sandbox.id).await {
            return error_page(
                503,
                "Agent offline",
                "The agent for this sandbox is not currently connected.",
                true,
            );
        }
        if !sandbox.is_local && sandbox.pod_address.is_none() {
            return error_page(
                503,
                "Starting up",
                "This sandbox is still starting. This page will refresh automatically.",
                true,
            );
        }

        if self.activity.should_write(sandbox.id).await
            && let Err(e) = self.catalog.touch_activity(sandbox.id).await
        {
            warn!(sandbox_id = %sandbox.id, error = %e, "failed to record activity");
        }

        let Some(flavor_config) = self.config.flavor(flavor) else {
            return error_page(503, "Misconfigured", "This sandbox flavor is not configured.", false);
        };

        let (mut parts, body) = req.into_parts();
        let path = parts.uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".into());
        strip_hop_by_hop(&mut parts.headers);
        inject_credential(&mut parts.headers, flavor_config.auth_scheme, &sandbox.agent_token);

        if sandbox.is_local {
            let body_bytes = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "failed to read request body for tunnel proxy");
                    return error_page(502, "Bad gateway", "Failed to read request body.", false);
                }
            };
            let mut headers = HashMap::new();
            for (name, value) in parts.headers.iter() {
                if let Ok(v) = value.to_str() {
                    headers.insert(name.as_str().to_string(), v.to_string());
                }
            }
            return match self
                .tunnels
                .proxy_via_tunnel(sandbox.id, parts.method.as_str(), &path, headers, body_bytes)
                .await
            {
                Ok((status, resp_headers, body_rx)) => build_streamed_response(status, resp_headers, body_rx),
                Err(e) => error_page(e.status_code(), "Proxy error", "Failed to reach the sandbox.", e.should_auto_refresh()),
            };
        }

        let pod_address = sandbox.pod_address.clone().expect("checked above");
        let target: Uri = match format!("http://{}:{}{}", pod_address, flavor_config.internal_port, path).parse() {
            Ok(uri) => uri,
            Err(_) => return error_page(502, "Bad gateway", "Invalid upstream address.", false),
        };
        parts.uri = target;

        let proxied_req = Request::from_parts(parts, body.boxed());
        match self.http_client.request(proxied_req).await {
            Ok(resp) => {
                let (mut parts, body) = resp.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(error = %e, sandbox_id = %sandbox.id, "reverse proxy request failed");
                error_page(502, "Bad gateway", "Failed to reach the sandbox.", false)
            }
        }
    }

    /// Checks a subdomain session cookie's *value* against the sandbox it
    /// claims to belong to, mirroring the precedence `handle_auth_exchange`
    /// used to set it (tunnel token for local sandboxes, proxy token
    /// otherwise). A cookie that merely exists but doesn't resolve back to
    /// this sandbox's id is treated as absent.
    async fn cookie_authorizes(&self, sandbox: &crate::catalog::Sandbox, cookie_value: &str) -> bool {
        if sandbox.tunnel_token.is_some() {
            matches!(
                self.catalog.get_by_tunnel_token(sandbox.id, cookie_value).await,
                Some(found) if found.id == sandbox.id
            )
        } else {
            matches!(
                self.catalog.get_by_proxy_token(cookie_value).await,
                Some(found) if found.id == sandbox.id
            )
        }
    }

    async fn handle_auth_exchange(
        &self,
        sandbox: &crate::catalog::Sandbox,
        req: &Request<Incoming>,
    ) -> Response<Body> {
        let token = req
            .uri()
            .query()
            .and_then(|q| query_param(q, "token"));
        let Some(token) = token else {
            return error_page(401, "Unauthorized", "Missing authentication token.", false);
        };

        let Some(user_id) = self.sessions.authenticate(&token).await else {
            return error_page(401, "Unauthorized", "Invalid or expired token.", false);
        };

        if self.membership.role(sandbox.workspace_id, user_id).await.is_none() {
            return error_page(403, "Forbidden", "You are not a member of this workspace.", false);
        }

        let cookie_name = subdomain_cookie_name(&sandbox.flavor);
        let cookie_value = format!(
            "{}={}; Max-Age=604800; Path=/; HttpOnly; SameSite=Lax",
            cookie_name, sandbox.tunnel_token.clone().unwrap_or_else(|| sandbox.proxy_token.clone())
        );

        Response::builder()
            .status(StatusCode::FOUND)
            .header("location", "/")
            .header("set-cookie", cookie_value)
            .body(empty_body())
            .expect("static response is well-formed")
    }
}

fn subdomain_cookie_name(flavor: &str) -> String {
    format!("{SUBDOMAIN_COOKIE_PREFIX}{flavor}")
}

fn redirect_to_main_site(config: &Config) -> Response<Body> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header("location", format!("https://{}/", config.asset_domain))
        .body(empty_body())
        .expect("static response is well-formed")
}

fn parse_cookies<B>(req: &Request<B>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(header) = req.headers().get("cookie").and_then(|v| v.to_str().ok()) else {
        return out;
    };
    for part in header.split(';') {
        if let Some((k, v)) = part.trim().split_once('=') {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            Some(v.to_string())
        } else {
            None
        }
    })
}

fn strip_hop_by_hop(headers: &mut hyper::HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn inject_credential(headers: &mut hyper::HeaderMap, scheme: AuthScheme, credential: &str) {
    match scheme {
        AuthScheme::Bearer => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {credential}")) {
                headers.insert(HeaderName::from_static("authorization"), value);
            }
        }
        AuthScheme::Basic => {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(format!("agent:{credential}"));
            if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
                headers.insert(HeaderName::from_static("authorization"), value);
            }
        }
    }
}

fn build_streamed_response(
    status: u16,
    headers: HashMap<String, String>,
    body_rx: tokio::sync::mpsc::Receiver<Bytes>,
) -> Response<Body> {
    let stream = ReceiverStream::new(body_rx).map(|chunk| Ok::<_, hyper::Error>(hyper::body::Frame::data(chunk)));
    let body = BodyExt::boxed(http_body_util::StreamBody::new(stream));
    let mut builder = Response::builder().status(status);
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder.body(body).unwrap_or_else(|_| error_page(502, "Bad gateway", "Malformed upstream response.", false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn cookie_name_is_distinct_per_flavor() {
        assert_ne!(subdomain_cookie_name("agent"), subdomain_cookie_name("shell"));
    }

    #[test]
    fn parses_query_param() {
        assert_eq!(query_param("a=1&token=abc&b=2", "token"), Some("abc".into()));
        assert_eq!(query_param("a=1", "token"), None);
    }

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("connection").is_none());
        assert!(headers.get("content-type").is_some());
    }

    #[test]
    fn redirect_targets_asset_domain() {
        let mut config = Config::minimal();
        config.asset_domain = "app.example.com".into();
        let resp = redirect_to_main_site(&config);
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(
            resp.headers().get("location").unwrap().to_str().unwrap(),
            "https://app.example.com/"
        );
    }

    fn make_router(catalog: Arc<dyn SandboxCatalog>) -> SubdomainRouter {
        SubdomainRouter::new(
            catalog,
            TunnelRegistry::new(),
            crate::activity::ActivityThrottle::new(),
            Arc::new(crate::dataplane::RejectAllSessions),
            Arc::new(crate::dataplane::DenyAllMembership),
            Arc::new(Config::minimal()),
        )
    }

    fn sandbox_with_tokens(
        workspace_id: uuid::Uuid,
        proxy_token: &str,
        tunnel_token: Option<&str>,
    ) -> crate::catalog::Sandbox {
        let now = chrono::Utc::now();
        crate::catalog::Sandbox {
            id: uuid::Uuid::new_v4(),
            short_id: format!("s{}", uuid::Uuid::new_v4().simple()),
            workspace_id,
            name: "test".into(),
            flavor: "agent".into(),
            status: SandboxStatus::Running,
            is_local: tunnel_token.is_some(),
            pod_address: Some("10.0.0.1".into()),
            instance_name: None,
            proxy_token: proxy_token.to_string(),
            agent_token: "agent-tok".into(),
            tunnel_token: tunnel_token.map(str::to_string),
            cpu_millicores: 100,
            memory_bytes: 1 << 20,
            idle_timeout_seconds: None,
            last_activity_at: now,
            last_heartbeat_at: None,
            created_at: now,
            paused_at: None,
        }
    }

    async fn catalog_with_workspace() -> (Arc<dyn SandboxCatalog>, uuid::Uuid) {
        let catalog: Arc<dyn SandboxCatalog> = crate::catalog::InMemoryCatalog::new();
        let workspace_id = uuid::Uuid::new_v4();
        catalog
            .create_workspace(crate::catalog::Workspace {
                id: workspace_id,
                display_name: "acme".into(),
                isolation_namespace: None,
                disk_handle: None,
            })
            .await
            .unwrap();
        (catalog, workspace_id)
    }

    #[tokio::test]
    async fn cookie_authorizes_rejects_forged_value_for_cloud_sandbox() {
        let (catalog, workspace_id) = catalog_with_workspace().await;
        let sandbox = sandbox_with_tokens(workspace_id, "real-proxy-token", None);
        catalog.create(sandbox.clone()).await.unwrap();
        let router = make_router(catalog);

        assert!(router.cookie_authorizes(&sandbox, "real-proxy-token").await);
        assert!(!router.cookie_authorizes(&sandbox, "anything").await);
    }

    #[tokio::test]
    async fn cookie_authorizes_rejects_forged_value_for_local_sandbox() {
        let (catalog, workspace_id) = catalog_with_workspace().await;
        let sandbox = sandbox_with_tokens(workspace_id, "proxy-tok", Some("real-tunnel-token"));
        catalog.create(sandbox.clone()).await.unwrap();
        let router = make_router(catalog);

        assert!(router.cookie_authorizes(&sandbox, "real-tunnel-token").await);
        assert!(!router.cookie_authorizes(&sandbox, "proxy-tok").await);
        assert!(!router.cookie_authorizes(&sandbox, "forged").await);
    }
}
