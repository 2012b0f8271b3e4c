use rama_core::Layer;
use rama_core::Service;
use rama_core::error::BoxError;
use rama_core::error::ErrorContext as _;
use rama_core::error::OpaqueError;
use rama_core::extensions::ExtensionsMut;
use rama_core::extensions::ExtensionsRef;
use rama_core::service::BoxService;
use rama_http::Body;
use rama_http::Request;
use rama_http::Response;
use rama_http::layer::version_adapter::RequestVersionAdapter;
use rama_http_backend::client::HttpClientService;
use rama_http_backend::client::HttpConnector;
use rama_net::client::EstablishedClientConnection;
use rama_tcp::client::service::TcpConnector;
use rama_tls_rustls::client::TlsConnectorDataBuilder;
use rama_tls_rustls::client::TlsConnectorLayer;
use std::time::Duration;

/// Upper bound on establishing the origin connection (TCP connect plus TLS
/// handshake).
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP(S) client used to reach origin servers; dials directly, optionally
/// without verifying the upstream certificate chain.
#[derive(Clone)]
pub struct UpstreamClient {
    connector: BoxService<
        Request<Body>,
        EstablishedClientConnection<HttpClientService<Body>, Request<Body>>,
        BoxError,
    >,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient").finish_non_exhaustive()
    }
}

impl UpstreamClient {
    pub fn new(skip_tls_verify: bool) -> Self {
        Self {
            connector: build_http_connector(skip_tls_verify),
        }
    }
}

impl Service<Request<Body>> for UpstreamClient {
    type Output = Response;
    type Error = OpaqueError;

    async fn serve(&self, req: Request<Body>) -> Result<Self::Output, Self::Error> {
        let uri = req.uri().clone();
        let established = tokio::time::timeout(ESTABLISH_TIMEOUT, self.connector.serve(req))
            .await
            .map_err(|_| {
                OpaqueError::from_display(format!(
                    "timed out establishing upstream connection for uri: {uri}"
                ))
            })?
            .map_err(OpaqueError::from_boxed)?;
        let EstablishedClientConnection {
            input: mut req,
            conn: http_connection,
        } = established;

        req.extensions_mut()
            .extend(http_connection.extensions().clone());

        http_connection
            .serve(req)
            .await
            .map_err(OpaqueError::from_boxed)
            .with_context(|| format!("http request failure for uri: {uri}"))
    }
}

fn build_http_connector(
    skip_tls_verify: bool,
) -> BoxService<
    Request<Body>,
    EstablishedClientConnection<HttpClientService<Body>, Request<Body>>,
    BoxError,
> {
    let transport = TcpConnector::default();
    let mut tls_builder = TlsConnectorDataBuilder::new().with_alpn_protocols_http_auto();
    if skip_tls_verify {
        tls_builder = tls_builder.with_no_cert_verifier();
    }
    let tls = TlsConnectorLayer::auto()
        .with_connector_data(tls_builder.build())
        .into_layer(transport);
    let tls = RequestVersionAdapter::new(tls);
    HttpConnector::new(tls).boxed()
}
