use crate::certs::CertAuthority;
use crate::filter::Filter;
use crate::logging::AccessLog;
use crate::upstream::UpstreamClient;
use std::sync::Arc;

/// Everything a connection task needs, shared through request extensions.
///
/// All of it is built once in `main` from the parsed config and CLI flags;
/// the only interior mutability lives inside [`Filter`] entries (temporary
/// grants) and the [`CertAuthority`] leaf cache.
pub struct ProxyState {
    pub filter: Filter,
    pub access_log: AccessLog,
    pub authority: Arc<CertAuthority>,
    pub upstream: UpstreamClient,
    /// Hostname that routes to the management mux when it appears as a
    /// request authority on the proxy listeners.
    pub api_host: String,
    pub cors: bool,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("api_host", &self.api_host)
            .field("cors", &self.cors)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) fn proxy_state_for_config(config: crate::config::Config) -> Arc<ProxyState> {
    proxy_state_with_cors(config, false)
}

#[cfg(test)]
pub(crate) fn proxy_state_with_cors(config: crate::config::Config, cors: bool) -> Arc<ProxyState> {
    use crate::certs::ensure_rustls_crypto_provider;
    use crate::schedule::now_local;
    use std::time::Duration;

    ensure_rustls_crypto_provider();

    let authority = Arc::new(
        CertAuthority::load_or_generate(
            None,
            None,
            "Clarity Proxy".to_string(),
            Duration::from_secs(3600),
        )
        .expect("generate test CA"),
    );
    Arc::new(ProxyState {
        filter: Filter::new(&config, now_local()),
        access_log: AccessLog::new(&config).expect("console access log"),
        authority,
        upstream: UpstreamClient::new(false),
        api_host: "clarity.proxy".to_string(),
        cors,
    })
}
