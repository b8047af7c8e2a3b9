//! Data-plane router (C6): subdomain reverse proxy and upstream-API proxy.
//!
//! [`classify_host`] is the single entry point the HTTP server (C-http)
//! consults to decide which of three routers handles a request: the static
//! asset bundle, a sandbox subdomain, or the management API (which the
//! upstream-API proxy in [`upstream_proxy`] hangs off of as a path prefix).

pub mod subdomain;
pub mod upstream_proxy;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::Response;
use uuid::Uuid;

use crate::config::Config;

pub type Body = BoxBody<Bytes, hyper::Error>;

pub fn full_body<T: Into<Bytes>>(chunk: T) -> Body {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> Body {
    full_body(Bytes::new())
}

/// Which router a request's `Host` header should be dispatched to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostClass {
    Asset,
    Subdomain { flavor: String, short_id: String },
    Management,
}

/// Classifies a request's host into one of the three router classes.
///
/// A subdomain match requires both a registered flavor prefix and a matching
/// base domain suffix; anything else — including the asset domain itself —
/// falls through to [`HostClass::Management`] or [`HostClass::Asset`].
pub fn classify_host(host: &str, config: &Config) -> HostClass {
    let host = host.split(':').next().unwrap_or(host);

    if host == config.asset_domain {
        return HostClass::Asset;
    }

    let suffix = format!(".{}", config.base_domain);
    if let Some(label) = host.strip_suffix(&suffix) {
        for flavor in &config.flavors {
            let prefix = format!("{}-", flavor.subdomain_prefix);
            if let Some(short_id) = label.strip_prefix(&prefix)
                && !short_id.is_empty()
            {
                return HostClass::Subdomain {
                    flavor: flavor.name.clone(),
                    short_id: short_id.to_string(),
                };
            }
        }
    }

    HostClass::Management
}

/// Serves files out of the built static asset bundle for the asset domain.
#[async_trait]
pub trait StaticAssetServer: Send + Sync {
    async fn serve(&self, path: &str) -> Option<Response<Body>>;
}

/// Resolves a user's membership role within a workspace, backing the
/// subdomain cookie-exchange flow's authorization check.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn role(&self, workspace_id: Uuid, user_id: Uuid) -> Option<String>;
}

/// Validates a main-site session token into the user it belongs to.
#[async_trait]
pub trait SessionAuthenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<Uuid>;
}

/// Builds a styled HTML error page. `refresh` adds a meta refresh tag, used
/// for the 503 cases where the sandbox is expected to become reachable soon.
pub fn error_page(status: u16, title: &str, message: &str, refresh: bool) -> Response<Body> {
    let refresh_tag = if refresh {
        r#"<meta http-equiv="refresh" content="5">"#
    } else {
        ""
    };
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>{title}</title>
{refresh_tag}
<style>
body {{ font-family: -apple-system, sans-serif; background: #0b0d12; color: #e6e6e6;
       display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; }}
.card {{ max-width: 28rem; text-align: center; padding: 2rem; }}
h1 {{ font-size: 1.5rem; margin-bottom: 0.5rem; }}
p {{ color: #9aa0ab; }}
</style>
</head>
<body>
<div class="card">
<h1>{title}</h1>
<p>{message}</p>
</div>
</body>
</html>"#
    );

    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .body(full_body(html))
        .expect("static response is well-formed")
}

/// Membership/session seams with no external collaborator wired in: every
/// lookup fails closed. A real deployment replaces these with adapters onto
/// its existing auth/membership service, per §6.1.
pub struct DenyAllMembership;

#[async_trait]
impl MembershipOracle for DenyAllMembership {
    async fn role(&self, _workspace_id: Uuid, _user_id: Uuid) -> Option<String> {
        None
    }
}

pub struct RejectAllSessions;

#[async_trait]
impl SessionAuthenticator for RejectAllSessions {
    async fn authenticate(&self, _token: &str) -> Option<Uuid> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut config = Config::minimal();
        config.base_domain = "sandboxes.example.com".into();
        config.asset_domain = "app.example.com".into();
        config
    }

    #[test]
    fn classifies_asset_domain() {
        let config = test_config();
        assert_eq!(classify_host("app.example.com", &config), HostClass::Asset);
    }

    #[test]
    fn classifies_subdomain() {
        let config = test_config();
        assert_eq!(
            classify_host("agent-ab12cd34.sandboxes.example.com", &config),
            HostClass::Subdomain {
                flavor: "agent".into(),
                short_id: "ab12cd34".into(),
            }
        );
    }

    #[test]
    fn classifies_management_fallthrough() {
        let config = test_config();
        assert_eq!(
            classify_host("api.sandboxes.example.com", &config),
            HostClass::Management
        );
        assert_eq!(
            classify_host("unknown-prefix-x.sandboxes.example.com", &config),
            HostClass::Management
        );
    }

    #[test]
    fn strips_port_before_matching() {
        let config = test_config();
        assert_eq!(
            classify_host("app.example.com:8443", &config),
            HostClass::Asset
        );
    }
}
