//! Upstream-API proxy: a path prefix under the management-API host that lets
//! an authenticated sandbox call out to the configured upstream API (e.g. the
//! model provider) without holding its own copy of the shared credential.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use tracing::warn;

use crate::catalog::{SandboxCatalog, SandboxStatus};
use crate::config::Config;
use crate::dataplane::{error_page, Body};

/// Request body type for calls made out to the upstream API: `Limited`'s
/// error type already satisfies the client's bound without reboxing into
/// `hyper::Error`, which cannot be constructed from arbitrary causes.
type ReqBody = BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub struct UpstreamProxy {
    pub catalog: Arc<dyn SandboxCatalog>,
    pub config: Arc<Config>,
    pub http_client: Client<hyper_util::client::legacy::connect::HttpConnector, ReqBody>,
}

impl UpstreamProxy {
    pub fn new(catalog: Arc<dyn SandboxCatalog>, config: Arc<Config>) -> Self {
        Self {
            catalog,
            config,
            http_client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    pub async fn handle(&self, req: Request<Incoming>, downstream_path: &str) -> Response<Body> {
        let Some(proxy_token) = req
            .headers()
            .get("x-sandbox-proxy-token")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
        else {
            return error_page(401, "Unauthorized", "Missing proxy token.", false);
        };

        let Some(sandbox) = self.catalog.get_by_proxy_token(&proxy_token).await else {
            return error_page(401, "Unauthorized", "Invalid proxy token.", false);
        };

        if !matches!(sandbox.status, SandboxStatus::Running | SandboxStatus::Creating) {
            return error_page(
                403,
                "Forbidden",
                "This sandbox is not in a state that can call the upstream API.",
                false,
            );
        }

        let (mut parts, body) = req.into_parts();
        let limited = Limited::new(body, MAX_BODY_BYTES);

        let target: Uri = match format!("{}{}", self.config.upstream.base_url, downstream_path).parse() {
            Ok(uri) => uri,
            Err(_) => return error_page(502, "Bad gateway", "Invalid upstream target.", false),
        };
        parts.uri = target;
        parts.headers.remove("x-sandbox-proxy-token");
        parts.headers.remove("host");

        let Ok(credential) = std::env::var("SANDBOXD_UPSTREAM_CREDENTIAL") else {
            return error_page(502, "Bad gateway", "Upstream credential is not configured.", false);
        };
        let Ok(header_value) = hyper::header::HeaderValue::from_str(&credential) else {
            return error_page(502, "Bad gateway", "Invalid upstream credential.", false);
        };
        parts.headers.insert(
            hyper::header::HeaderName::from_bytes(self.config.upstream.header_name.as_bytes())
                .unwrap_or(hyper::header::HeaderName::from_static("x-api-key")),
            header_value,
        );

        if !parts.headers.contains_key(self.config.upstream.version_header_name.as_str())
            && let Ok(name) = hyper::header::HeaderName::from_bytes(self.config.upstream.version_header_name.as_bytes())
            && let Ok(value) = hyper::header::HeaderValue::from_str(&self.config.upstream.version_header_value)
        {
            parts.headers.insert(name, value);
        }

        let proxied_req = Request::from_parts(parts, limited.boxed());

        match self.http_client.request(proxied_req).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(error = %e, sandbox_id = %sandbox.id, "upstream proxy request failed");
                error_page(502, "Bad gateway", "Failed to reach the upstream API.", false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_body_bytes_matches_configured_cap() {
        assert_eq!(MAX_BODY_BYTES, 10 * 1024 * 1024);
    }
}
