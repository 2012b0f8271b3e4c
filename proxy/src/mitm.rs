use crate::admin;
use crate::filter::Access;
use crate::filter::normalize_host;
use crate::http_proxy::client_addr;
use crate::responses::block_page_redirect;
use crate::responses::hard_block_response;
use crate::responses::text_response;
use crate::schedule::now_local;
use crate::state::ProxyState;
use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use rama_core::Layer;
use rama_core::Service;
use rama_core::extensions::ExtensionsRef;
use rama_core::layer::AddInputExtensionLayer;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::HeaderValue;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::Uri;
use rama_http::header::HOST;
use rama_http::layer::remove_header::RemoveRequestHeaderLayer;
use rama_http::layer::remove_header::RemoveResponseHeaderLayer;
use rama_http_backend::server::HttpServer;
use rama_http_backend::server::layer::upgrade::Upgraded;
use rama_net::http::RequestContext;
use rama_net::proxy::ProxyTarget;
use rama_tcp::server::TcpListener;
use rama_tls_rustls::server::TlsAcceptorLayer;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

/// Per-tunnel context: the CONNECT (or SNI) target the client asked for.
struct MitmContext {
    host: String,
    port: u16,
    state: Arc<ProxyState>,
}

/// Terminates an upgraded CONNECT stream with a minted leaf certificate and
/// proxies the inner HTTPS requests through the filter and logger.
pub(crate) async fn mitm_tunnel(upgraded: Upgraded) -> Result<()> {
    let state = upgraded
        .extensions()
        .get::<Arc<ProxyState>>()
        .cloned()
        .context("missing proxy state")?;
    let target = upgraded
        .extensions()
        .get::<ProxyTarget>()
        .context("missing proxy target")?
        .0
        .clone();
    let host = normalize_host(&target.host.to_string());
    let port = target.port;
    // A mint failure tears the tunnel down before the inner handshake; the
    // client sees the TLS connection fail rather than a forged-looking cert.
    let acceptor_data = state.authority.acceptor_for_host(&host)?;
    let ctx = Arc::new(MitmContext { host, port, state });

    let executor = upgraded
        .extensions()
        .get::<Executor>()
        .cloned()
        .unwrap_or_default();

    let http_service = HttpServer::auto(executor).service(
        (
            RemoveResponseHeaderLayer::hop_by_hop(),
            RemoveRequestHeaderLayer::hop_by_hop(),
        )
            .into_layer(service_fn({
                let ctx = ctx.clone();
                move |req| {
                    let ctx = ctx.clone();
                    async move { handle_mitm_request(req, ctx).await }
                }
            })),
    );

    let https_service = TlsAcceptorLayer::new(acceptor_data).into_layer(http_service);

    https_service
        .serve(upgraded)
        .await
        .map_err(|err| anyhow!("MITM serve error: {err}"))?;
    Ok(())
}

/// The transparent TLS listener: accepted connections are TLS-terminated
/// directly (no CONNECT), with the leaf minted from the client hello's SNI.
/// Used for router-redirected traffic and testing.
pub async fn run_transparent_tls(state: Arc<ProxyState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::build()
        .bind(addr)
        .await
        // See `http_proxy.rs` for why `BoxError` is wrapped before anyhow.
        .map_err(rama_core::error::OpaqueError::from)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("bind transparent TLS listener: {addr}"))?;

    let local_addr = listener
        .local_addr()
        .context("read transparent TLS listener local addr")?;

    let acceptor_data = state.authority.sni_acceptor_data();
    let http_service = HttpServer::auto(Executor::new()).service(
        (
            RemoveResponseHeaderLayer::hop_by_hop(),
            RemoveRequestHeaderLayer::hop_by_hop(),
        )
            .into_layer(service_fn(handle_transparent_request)),
    );
    let https_service = TlsAcceptorLayer::new(acceptor_data).into_layer(http_service);

    info!("transparent TLS listener on {local_addr}");

    listener
        .serve(AddInputExtensionLayer::new(state).into_layer(https_service))
        .await;
    Ok(())
}

async fn handle_transparent_request(req: Request) -> Result<Response, Infallible> {
    let state = match req.extensions().get::<Arc<ProxyState>>().cloned() {
        Some(state) => state,
        None => {
            warn!("missing proxy state");
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "error"));
        }
    };

    let authority = match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => authority,
        Err(err) => {
            warn!("transparent request missing host: {err}");
            return Ok(text_response(StatusCode::BAD_REQUEST, "missing host"));
        }
    };
    let host = normalize_host(&authority.host.to_string());
    if host.is_empty() {
        return Ok(text_response(StatusCode::BAD_REQUEST, "missing host"));
    }

    let ctx = Arc::new(MitmContext {
        host,
        port: authority.port,
        state,
    });
    handle_mitm_request(req, ctx).await
}

async fn handle_mitm_request(
    req: Request,
    ctx: Arc<MitmContext>,
) -> Result<Response, Infallible> {
    if let Some(response) = mitm_blocking_response(&req, &ctx) {
        return Ok(response);
    }

    // Inside an intercepted tunnel, the management hostname resolves to the
    // proxy itself, so the self-service UI works over plain browsing.
    if ctx.host == ctx.state.api_host {
        return Ok(admin::handle_management_request(&ctx.state, req).await);
    }

    match forward_request(req, &ctx).await {
        Ok(resp) => Ok(resp),
        Err(err) => {
            warn!("MITM request handling failed: {err}");
            Ok(text_response(StatusCode::BAD_GATEWAY, "mitm upstream error"))
        }
    }
}

/// Decisions that short-circuit forwarding: nested CONNECTs, host
/// mismatches between the tunnel target and the inner request, and filter
/// denials.
fn mitm_blocking_response(req: &Request, ctx: &MitmContext) -> Option<Response> {
    if req.method().as_str() == "CONNECT" {
        return Some(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "CONNECT not supported inside MITM",
        ));
    }

    if let Some(request_host) = extract_request_host(req) {
        let normalized = normalize_host(&request_host);
        if !normalized.is_empty() && normalized != ctx.host {
            warn!(
                "MITM host mismatch (target={}, request_host={normalized})",
                ctx.host
            );
            return Some(text_response(StatusCode::BAD_REQUEST, "host mismatch"));
        }
    }

    let client = client_addr(req).unwrap_or_default();
    let decision = ctx.state.filter.evaluate(
        req.method().as_str(),
        &ctx.host,
        req.uri().path(),
        &ctx.state.api_host,
        now_local(),
    );
    match decision {
        Access::Blocked => {
            warn!("request blocked (client={client}, host={})", ctx.host);
            Some(hard_block_response())
        }
        Access::Denied { id } => {
            info!(
                "request denied by policy (client={client}, host={}, entry={id})",
                ctx.host
            );
            Some(block_page_redirect(&ctx.state.api_host, id))
        }
        Access::Skip | Access::Allowed => None,
    }
}

async fn forward_request(req: Request, ctx: &MitmContext) -> Result<Response> {
    let authority = authority_header_value(&ctx.host, ctx.port);
    let path = path_and_query(req.uri());
    let url = format!("https://{authority}{path}");
    let log_path = req.uri().path().to_string();
    let client = client_addr(&req);

    let (log_handle, req) =
        ctx.state
            .access_log
            .snapshot_request(req, client, &ctx.host, &log_path, url);

    let (mut parts, body) = req.into_parts();
    parts.uri = build_https_uri(&authority, &path)?;
    parts
        .headers
        .insert(HOST, HeaderValue::from_str(&authority)?);
    let upstream_req = Request::from_parts(parts, body);

    let resp = ctx.state.upstream.serve(upstream_req).await?;
    Ok(match log_handle {
        Some(handle) => handle.complete(resp),
        None => resp,
    })
}

fn extract_request_host(req: &Request) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
}

fn authority_header_value(host: &str, port: u16) -> String {
    if host.contains(':') {
        if port == 443 {
            format!("[{host}]")
        } else {
            format!("[{host}]:{port}")
        }
    } else if port == 443 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

fn build_https_uri(authority: &str, path: &str) -> Result<Uri> {
    let target = format!("https://{authority}{path}");
    Ok(target.parse()?)
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(rama_http::uri::PathAndQuery::as_str)
        .unwrap_or("/")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::config::Policy;
    use crate::state::proxy_state_for_config;
    use pretty_assertions::assert_eq;
    use rama_http::Body;
    use rama_http::Method;
    use rama_http::header;

    fn ctx(state: Arc<ProxyState>, host: &str, port: u16) -> Arc<MitmContext> {
        Arc::new(MitmContext {
            host: host.to_string(),
            port,
            state,
        })
    }

    fn inner_request(method: Method, path: &str, host: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(path)
            .header(HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn nested_connect_is_rejected() {
        let state = proxy_state_for_config(Config::default());
        let ctx = ctx(state, "example.com", 443);
        let req = inner_request(Method::CONNECT, "/", "example.com");

        let response = mitm_blocking_response(&req, &ctx).expect("CONNECT should be rejected");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn host_mismatch_is_rejected() {
        let state = proxy_state_for_config(Config::default());
        let ctx = ctx(state, "example.com", 443);
        let req = inner_request(Method::GET, "/", "evil.example");

        let response = mitm_blocking_response(&req, &ctx).expect("mismatch should be rejected");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn denied_policy_redirects_to_the_block_page() {
        let state = proxy_state_for_config(Config {
            policies: vec![Policy {
                path: "youtube.com".to_string(),
                ..Policy::default()
            }],
            ..Config::default()
        });
        let ctx = ctx(state, "youtube.com", 443);
        let req = inner_request(Method::GET, "/watch?v=1", "youtube.com");

        let response = mitm_blocking_response(&req, &ctx).expect("policy should deny");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://clarity.proxy/filter/blocked.html#0"
        );
    }

    #[tokio::test]
    async fn blocked_host_gets_hard_block() {
        let state = proxy_state_for_config(Config {
            blocked: vec!["tracker.example".to_string()],
            ..Config::default()
        });
        let ctx = ctx(state, "tracker.example", 443);
        let req = inner_request(Method::GET, "/pixel", "tracker.example");

        let response = mitm_blocking_response(&req, &ctx).expect("blocked host should deny");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONNECTION),
            Some(&rama_http::HeaderValue::from_static("close"))
        );
    }

    #[tokio::test]
    async fn unmatched_requests_pass_the_blocking_checks() {
        let state = proxy_state_for_config(Config::default());
        let ctx = ctx(state, "example.com", 443);
        let req = inner_request(Method::GET, "/index.html", "example.com");

        assert!(mitm_blocking_response(&req, &ctx).is_none());
    }

    #[tokio::test]
    async fn management_host_is_served_inside_the_tunnel() {
        let state = proxy_state_for_config(Config::default());
        let ctx = ctx(state, "clarity.proxy", 443);
        let req = inner_request(Method::GET, "/config/settings", "clarity.proxy");

        let response = handle_mitm_request(req, ctx).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn authority_header_value_formats_ports_and_ipv6() {
        assert_eq!(authority_header_value("example.com", 443), "example.com");
        assert_eq!(
            authority_header_value("example.com", 8443),
            "example.com:8443"
        );
        assert_eq!(authority_header_value("::1", 443), "[::1]");
        assert_eq!(authority_header_value("::1", 8443), "[::1]:8443");
    }

    #[test]
    fn https_uri_is_rebuilt_from_authority_and_path() {
        let uri = build_https_uri("example.com", "/watch?v=1").unwrap();
        assert_eq!(uri.to_string(), "https://example.com/watch?v=1");
    }
}
