use crate::responses::json_response;
use crate::responses::text_response;
use crate::schedule::now_local;
use crate::state::ProxyState;
use anyhow::Context;
use anyhow::Result;
use rama_core::rt::Executor;
use rama_core::service::service_fn;
use rama_http::Body;
use rama_http::HeaderValue;
use rama_http::Request;
use rama_http::Response;
use rama_http::StatusCode;
use rama_http::header;
use rama_http_backend::server::HttpServer;
use rama_tcp::server::TcpListener;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Component;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing::warn;

/// Temporary grants are capped at one hour.
const MAX_GRANT_MINUTES: i64 = 60;

/// Directory the self-service UI is served from.
const PUBLIC_DIR: &str = "./public";

/// Serves the management API on its own listener. The same handler is also
/// reachable through the proxy when a request's authority equals the
/// configured management hostname.
pub async fn run_admin_api(state: Arc<ProxyState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::build()
        .bind(addr)
        .await
        // See `http_proxy.rs` for why `BoxError` is wrapped before anyhow.
        .map_err(rama_core::error::OpaqueError::from)
        .map_err(anyhow::Error::from)
        .with_context(|| format!("bind management API: {addr}"))?;

    let local_addr = listener
        .local_addr()
        .context("read management API listener local addr")?;

    let server_state = state.clone();
    let server = HttpServer::auto(Executor::new()).service(service_fn(move |req| {
        let state = server_state.clone();
        async move { Ok::<_, Infallible>(handle_management_request(&state, req).await) }
    }));
    info!("management API listening on {local_addr}");
    listener.serve(server).await;
    Ok(())
}

pub(crate) async fn handle_management_request(state: &ProxyState, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let mut response = match (method.as_str(), path.as_str()) {
        ("GET", "/health") => Response::new(Body::from("ok")),
        ("GET", "/authority.cer") => authority_response(state),
        ("GET", "/config/settings") => json_response(&state.filter.entry_views()),
        ("GET", "/config/blocked") => blocked_entry(state, &req),
        ("GET", "/config/set") => set_temporary_grant(state, &req),
        ("GET", _) if path.starts_with("/filter/") => serve_static(&path).await,
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    if state.cors {
        apply_cors(&mut response);
    }
    response
}

#[derive(Debug, Serialize)]
struct ApiError {
    result: bool,
    message: String,
}

/// Validation failures are ordinary JSON records with HTTP 200, so the web
/// UI can render the message without special-casing status codes.
fn api_error(message: impl Into<String>) -> Response {
    json_response(&ApiError {
        result: false,
        message: message.into(),
    })
}

/// The CA certificate for client trust-store installation.
fn authority_response(state: &ProxyState) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-x509-ca-cert")
        .body(Body::from(state.authority.ca_cert_der().to_vec()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn blocked_entry(state: &ProxyState, req: &Request) -> Response {
    let id = match entry_id(req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.filter.entry(id) {
        Some(entry) => json_response(&entry.view()),
        None => api_error(format!("couldn't find the config for id {id}")),
    }
}

fn set_temporary_grant(state: &ProxyState, req: &Request) -> Response {
    let id = match entry_id(req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let minutes: i64 = match query_param(req, "t").map(|t| t.parse()) {
        Some(Ok(minutes)) => minutes,
        Some(Err(err)) => return api_error(format!("minutes is not an integer: {err}")),
        None => return api_error("missing parameter t"),
    };
    if !(1..=MAX_GRANT_MINUTES).contains(&minutes) {
        return api_error(format!(
            "minutes must be between 1 and {MAX_GRANT_MINUTES}"
        ));
    }
    let Some(entry) = state.filter.entry(id) else {
        return api_error(format!("couldn't find the config for id {id}"));
    };

    let until = now_local() + time::Duration::minutes(minutes);
    entry.grant_until(until);
    info!(
        "temporary grant installed (id={id}, path={}, minutes={minutes})",
        entry.policy.path
    );
    json_response(&entry.view())
}

fn entry_id(req: &Request) -> Result<u32, Response> {
    match query_param(req, "id").map(|id| id.parse()) {
        Some(Ok(id)) => Ok(id),
        Some(Err(err)) => Err(api_error(format!("id is not an integer: {err}"))),
        None => Err(api_error("missing parameter id")),
    }
}

fn query_param(req: &Request, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Static files for the self-service UI, mapped under `./public`.
async fn serve_static(request_path: &str) -> Response {
    let rel = request_path
        .trim_start_matches("/filter")
        .trim_start_matches('/');
    let rel = if rel.is_empty() { "index.html" } else { rel };

    // Only plain path components; anything like `..` falls through to 404.
    if Path::new(rel)
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }

    let file = Path::new(PUBLIC_DIR).join(rel);
    match tokio::fs::read(&file).await {
        Ok(contents) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", content_type_for(rel))
            .body(Body::from(contents))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(err) => {
            warn!("static file {} not served: {err}", file.display());
            text_response(StatusCode::NOT_FOUND, "not found")
        }
    }
}

fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
}
