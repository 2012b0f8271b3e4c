use crate::admin;
use crate::filter::Access;
use crate::filter::normalize_host;
use crate::mitm;
use crate::responses::block_page_redirect;
use crate::responses::hard_block_response;
use crate::responses::text_response;
use crate::schedule::now_local;
use crate::state::ProxyState;
use anyhow::Context;
use anyhow::Result;
use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::error::ErrorExt as _;
use rama_core::error::OpaqueError;
use rama_core::extensions::ExtensionsMut;
use rama_core::extensions::ExtensionsRef;
use rama_core::layer::AddInputExtensionLayer;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::Body;
use rama_http::HeaderMap;
use rama_http::HeaderName;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::header;
use rama_http::layer::remove_header::RemoveResponseHeaderLayer;
use rama_http::matcher::MethodMatcher;
use rama_http_backend::server::HttpServer;
use rama_http_backend::server::layer::upgrade::UpgradeLayer;
use rama_http_backend::server::layer::upgrade::Upgraded;
use rama_net::Protocol;
use rama_net::client::ConnectorService;
use rama_net::client::EstablishedClientConnection;
use rama_net::http::RequestContext;
use rama_net::proxy::ProxyRequest;
use rama_net::proxy::ProxyTarget;
use rama_net::proxy::StreamForwardService;
use rama_net::stream::SocketInfo;
use rama_tcp::client::Request as TcpRequest;
use rama_tcp::client::service::TcpConnector;
use rama_tcp::server::TcpListener;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing::warn;

const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Marks a CONNECT session whose bytes are spliced to the origin without
/// TLS termination (pinned-certificate hosts).
#[derive(Debug, Clone, Copy)]
struct SpliceTunnel;

pub async fn run_http_proxy(state: Arc<ProxyState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::build()
        .bind(addr)
        .await
        // Rama's `BoxError` lacks an explicit `'static` bound, so it does
        // not satisfy `anyhow::Context`'s constraint directly; wrap it in
        // `OpaqueError` first to keep the source chain.
        .map_err(OpaqueError::from)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("bind HTTP proxy: {addr}"))?;

    let local_addr = listener
        .local_addr()
        .context("read HTTP proxy listener local addr")?;

    let http_service = HttpServer::auto(Executor::new()).service(
        (
            UpgradeLayer::new(
                MethodMatcher::CONNECT,
                service_fn(http_connect_accept),
                service_fn(http_connect_tunnel),
            ),
            RemoveResponseHeaderLayer::hop_by_hop(),
        )
            .into_layer(service_fn(http_plain_proxy)),
    );

    info!("HTTP proxy listening on {local_addr}");

    listener
        .serve(AddInputExtensionLayer::new(state).into_layer(http_service))
        .await;
    Ok(())
}

async fn http_connect_accept(mut req: Request) -> Result<(Response, Request), Response> {
    let state = req
        .extensions()
        .get::<Arc<ProxyState>>()
        .cloned()
        .ok_or_else(|| text_response(StatusCode::INTERNAL_SERVER_ERROR, "missing state"))?;

    let authority = match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => authority,
        Err(err) => {
            warn!("CONNECT missing authority: {err}");
            return Err(text_response(StatusCode::BAD_REQUEST, "missing authority"));
        }
    };

    let host = normalize_host(&authority.host.to_string());
    if host.is_empty() {
        return Err(text_response(StatusCode::BAD_REQUEST, "invalid host"));
    }
    let client = client_addr(&req).unwrap_or_default();

    if state.filter.is_skipped(&host, "") {
        info!("CONNECT spliced without interception (client={client}, host={host})");
        req.extensions_mut().insert(SpliceTunnel);
    } else if state.filter.is_blocked(&host, "") {
        warn!("CONNECT blocked (client={client}, host={host})");
        return Err(hard_block_response());
    } else {
        info!("CONNECT intercepted (client={client}, host={host})");
    }

    req.extensions_mut().insert(ProxyTarget(authority));

    Ok((
        Response::builder()
            .status(StatusCode::OK)
            .body(Body::empty())
            .unwrap_or_else(|_| Response::new(Body::empty())),
        req,
    ))
}

async fn http_connect_tunnel(upgraded: Upgraded) -> Result<(), Infallible> {
    if upgraded.extensions().get::<ProxyTarget>().is_none() {
        warn!("CONNECT missing proxy target");
        return Ok(());
    }

    let result = if upgraded.extensions().get::<SpliceTunnel>().is_some() {
        splice_tunnel(upgraded).await
    } else {
        mitm::mitm_tunnel(upgraded)
            .await
            .map_err(|err| OpaqueError::from_display(format!("{err:#}")).into_boxed())
    };
    if let Err(err) = result {
        warn!("tunnel error: {err}");
    }
    Ok(())
}

/// Forwards the raw tunnel bytes to the origin: no certificate is minted
/// and the client completes TLS with the origin itself.
async fn splice_tunnel(upgraded: Upgraded) -> Result<(), BoxError> {
    let authority = upgraded
        .extensions()
        .get::<ProxyTarget>()
        .map(|target| target.0.clone())
        .ok_or_else(|| OpaqueError::from_display("missing forward authority").into_boxed())?;

    let extensions = upgraded.extensions().clone();
    let req = TcpRequest::new_with_extensions(authority.clone(), extensions)
        .with_protocol(Protocol::HTTPS);
    let tcp_connector = TcpConnector::new();
    let connect = tcp_connector.connect(req);
    let EstablishedClientConnection { conn: target, .. } =
        tokio::time::timeout(TUNNEL_CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| {
                OpaqueError::from_display(format!("timed out connecting to {authority}"))
                    .into_boxed()
            })?
            .map_err(|err| {
                OpaqueError::from_boxed(err.into())
                    .with_context(|| format!("establish CONNECT tunnel to {authority}"))
                    .into_boxed()
            })?;

    let proxy_req = ProxyRequest {
        source: upgraded,
        target,
    };
    StreamForwardService::default()
        .serve(proxy_req)
        .await
        .map_err(|err| {
            OpaqueError::from_boxed(err.into())
                .with_context(|| format!("forward CONNECT tunnel to {authority}"))
                .into_boxed()
        })
}

async fn http_plain_proxy(req: Request) -> Result<Response, Infallible> {
    let state = match req.extensions().get::<Arc<ProxyState>>().cloned() {
        Some(state) => state,
        None => {
            warn!("missing app state");
            return Ok(text_response(StatusCode::INTERNAL_SERVER_ERROR, "error"));
        }
    };

    let authority = match RequestContext::try_from(&req).map(|ctx| ctx.host_with_port()) {
        Ok(authority) => authority,
        Err(err) => {
            warn!("missing host: {err}");
            return Ok(text_response(StatusCode::BAD_REQUEST, "missing host"));
        }
    };
    let host = normalize_host(&authority.host.to_string());

    // Requests addressed to the proxy's own hostname go to the management
    // mux instead of an origin.
    if host == state.api_host {
        return Ok(admin::handle_management_request(&state, req).await);
    }

    let client = client_addr(&req);
    let path = req.uri().path().to_string();
    let url = req.uri().to_string();

    // The log snapshot happens before any other processing so the record
    // sees the request exactly as the client sent it.
    let (log_handle, mut req) =
        state
            .access_log
            .snapshot_request(req, client.clone(), &host, &path, url);

    let decision = state
        .filter
        .evaluate(req.method().as_str(), &host, &path, &state.api_host, now_local());
    let client = client.unwrap_or_default();
    match decision {
        Access::Blocked => {
            warn!("request blocked (client={client}, host={host})");
            return Ok(hard_block_response());
        }
        Access::Denied { id } => {
            info!("request denied by policy (client={client}, host={host}, entry={id})");
            return Ok(block_page_redirect(&state.api_host, id));
        }
        Access::Skip | Access::Allowed => {}
    }

    remove_hop_by_hop_request_headers(req.headers_mut());
    match state.upstream.serve(req).await {
        Ok(resp) => Ok(match log_handle {
            Some(handle) => handle.complete(resp),
            None => resp,
        }),
        Err(err) => {
            warn!("upstream request failed: {err}");
            Ok(text_response(StatusCode::BAD_GATEWAY, "upstream failure"))
        }
    }
}

pub(crate) fn client_addr<T: ExtensionsRef>(input: &T) -> Option<String> {
    input
        .extensions()
        .get::<SocketInfo>()
        .map(|info| info.peer_addr().to_string())
}

pub(crate) fn remove_hop_by_hop_request_headers(headers: &mut HeaderMap) {
    while let Some(raw_connection) = headers.get(header::CONNECTION).cloned() {
        headers.remove(header::CONNECTION);
        if let Ok(raw_connection) = raw_connection.to_str() {
            let connection_headers: Vec<String> = raw_connection
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned)
                .collect();
            for token in connection_headers {
                if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
                    headers.remove(name);
                }
            }
        }
    }
    for name in [
        &header::KEEP_ALIVE,
        &header::PROXY_CONNECTION,
        &header::PROXY_AUTHORIZATION,
        &header::TRAILER,
        &header::TRANSFER_ENCODING,
        &header::UPGRADE,
    ] {
        headers.remove(name);
    }

    // 0x74,0x65 is ASCII "te" (the HTTP TE hop-by-hop header).
    if let Ok(short_hop_header_name) = HeaderName::from_bytes(&[0x74, 0x65]) {
        headers.remove(short_hop_header_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;
    use crate::state::proxy_state_for_config;
    use pretty_assertions::assert_eq;
    use rama_http::HeaderValue;
    use rama_http::Method;

    fn connect_request(state: Arc<ProxyState>, authority: &str) -> Request {
        let mut req = Request::builder()
            .method(Method::CONNECT)
            .uri(format!("https://{authority}"))
            .header("host", authority)
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(state);
        req
    }

    #[tokio::test]
    async fn connect_to_skip_listed_host_is_spliced() {
        let state = proxy_state_for_config(Config {
            skip_proxy: vec!["*.icloud.com".to_string()],
            ..Config::default()
        });

        let req = connect_request(state, "p01.icloud.com:443");
        let (response, req) = http_connect_accept(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(req.extensions().get::<SpliceTunnel>().is_some());
        assert!(req.extensions().get::<ProxyTarget>().is_some());
    }

    #[tokio::test]
    async fn connect_to_blocked_host_is_refused() {
        let state = proxy_state_for_config(Config {
            blocked: vec!["tracker.example".to_string()],
            ..Config::default()
        });

        let req = connect_request(state, "tracker.example:443");
        let response = http_connect_accept(req).await.unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONNECTION),
            Some(&HeaderValue::from_static("close"))
        );
    }

    #[tokio::test]
    async fn connect_to_ordinary_host_is_intercepted() {
        let state = proxy_state_for_config(Config::default());

        let req = connect_request(state, "example.com:443");
        let (response, req) = http_connect_accept(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(req.extensions().get::<SpliceTunnel>().is_none());
        assert!(req.extensions().get::<ProxyTarget>().is_some());
    }

    #[tokio::test]
    async fn plain_request_to_denied_policy_is_redirected() {
        let state = proxy_state_for_config(Config {
            policies: vec![crate::config::Policy {
                path: "youtube.com".to_string(),
                ..crate::config::Policy::default()
            }],
            ..Config::default()
        });

        let mut req = Request::builder()
            .method(Method::GET)
            .uri("http://youtube.com/watch")
            .header("host", "youtube.com")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(state);

        let response = http_plain_proxy(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://clarity.proxy/filter/blocked.html#0"
        );
    }

    #[tokio::test]
    async fn plain_request_to_blocked_host_gets_bad_request() {
        let state = proxy_state_for_config(Config {
            blocked: vec!["tracker.example".to_string()],
            ..Config::default()
        });

        let mut req = Request::builder()
            .method(Method::GET)
            .uri("http://tracker.example/pixel")
            .header("host", "tracker.example")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(state);

        let response = http_plain_proxy(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn management_host_routes_to_the_admin_mux() {
        let state = proxy_state_for_config(Config::default());

        let mut req = Request::builder()
            .method(Method::GET)
            .uri("http://clarity.proxy/config/settings")
            .header("host", "clarity.proxy")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(state);

        let response = http_plain_proxy(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn remove_hop_by_hop_request_headers_keeps_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONNECTION,
            HeaderValue::from_static("x-hop, keep-alive"),
        );
        headers.insert("x-hop", HeaderValue::from_static("1"));
        headers.insert(
            header::PROXY_AUTHORIZATION,
            HeaderValue::from_static("Basic abc"),
        );
        headers.insert(
            &header::X_FORWARDED_FOR,
            HeaderValue::from_static("127.0.0.1"),
        );
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));

        remove_hop_by_hop_request_headers(&mut headers);

        assert_eq!(headers.get(header::CONNECTION), None);
        assert_eq!(headers.get("x-hop"), None);
        assert_eq!(headers.get(header::PROXY_AUTHORIZATION), None);
        assert_eq!(
            headers.get(&header::X_FORWARDED_FOR),
            Some(&HeaderValue::from_static("127.0.0.1"))
        );
        assert_eq!(
            headers.get(header::HOST),
            Some(&HeaderValue::from_static("example.com"))
        );
    }
}
