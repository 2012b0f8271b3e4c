use crate::admin;
use crate::certs::CertAuthority;
use crate::certs::ensure_rustls_crypto_provider;
use crate::config::Config;
use crate::config::parse_duration;
use crate::filter::Filter;
use crate::http_proxy;
use crate::logging::AccessLog;
use crate::mitm;
use crate::schedule::now_local;
use crate::state::ProxyState;
use crate::upstream::UpstreamClient;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Parser)]
#[command(name = "clarity-proxy", about = "Time-of-day filtering MITM proxy")]
pub struct Args {
    /// host:port of the proxy listener
    #[arg(long, default_value = ":8080")]
    pub addr: String,

    /// host:port of the management API listener
    #[arg(long = "api-addr", default_value = ":8181")]
    pub api_addr: String,

    /// host:port of the transparent TLS listener
    #[arg(long = "tls-addr", default_value = ":4443")]
    pub tls_addr: String,

    /// hostname that routes to the management API through the proxy
    #[arg(long = "api", default_value = "clarity.proxy")]
    pub api_host: String,

    /// path to the YAML policy configuration
    #[arg(long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// CA certificate used to sign MITM certificates (PEM); generated
    /// ephemerally when omitted
    #[arg(long, requires = "key")]
    pub cert: Option<PathBuf>,

    /// private key of the MITM CA (PEM)
    #[arg(long, requires = "cert")]
    pub key: Option<PathBuf>,

    /// organization name embedded in minted certificates
    #[arg(long, default_value = "Clarity Proxy")]
    pub organization: String,

    /// validity window for minted leaf certificates
    #[arg(long, default_value = "1h", value_parser = parse_duration)]
    pub validity: Duration,

    /// allow CORS requests against the management endpoints
    #[arg(long)]
    pub cors: bool,

    /// skip upstream TLS verification; insecure
    #[arg(long = "skip-tls-verify")]
    pub skip_tls_verify: bool,

    /// log verbosity (0 = info, 1 = debug, 2 = trace)
    #[arg(short = 'v', value_name = "LEVEL", default_value_t = 0)]
    pub verbosity: u8,
}

/// The assembled proxy: shared state plus the three listener addresses.
pub struct Proxy {
    state: Arc<ProxyState>,
    addr: SocketAddr,
    api_addr: SocketAddr,
    tls_addr: SocketAddr,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("addr", &self.addr)
            .field("api_addr", &self.api_addr)
            .field("tls_addr", &self.tls_addr)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    /// Builds the full dependency graph from flags and the YAML config.
    /// Every failure here (bad config, unreadable CA, bad sink) is fatal.
    pub fn new(args: &Args) -> Result<Self> {
        ensure_rustls_crypto_provider();

        let config = Config::load(&args.config)?;
        let authority = Arc::new(CertAuthority::load_or_generate(
            args.cert.as_deref(),
            args.key.as_deref(),
            args.organization.clone(),
            args.validity,
        )?);
        let state = Arc::new(ProxyState {
            filter: Filter::new(&config, now_local()),
            access_log: AccessLog::new(&config)?,
            authority,
            upstream: UpstreamClient::new(args.skip_tls_verify),
            api_host: args.api_host.clone(),
            cors: args.cors,
        });

        Ok(Self {
            state,
            addr: parse_listen_addr(&args.addr)
                .with_context(|| format!("invalid --addr {}", args.addr))?,
            api_addr: parse_listen_addr(&args.api_addr)
                .with_context(|| format!("invalid --api-addr {}", args.api_addr))?,
            tls_addr: parse_listen_addr(&args.tls_addr)
                .with_context(|| format!("invalid --tls-addr {}", args.tls_addr))?,
        })
    }

    /// Spawns the proxy, management and transparent TLS listeners.
    pub async fn run(&self) -> Result<ProxyHandle> {
        let proxy_task = tokio::spawn(http_proxy::run_http_proxy(self.state.clone(), self.addr));
        let admin_task = tokio::spawn(admin::run_admin_api(self.state.clone(), self.api_addr));
        let tls_task = tokio::spawn(mitm::run_transparent_tls(self.state.clone(), self.tls_addr));

        Ok(ProxyHandle {
            proxy_task: Some(proxy_task),
            admin_task: Some(admin_task),
            tls_task: Some(tls_task),
            completed: false,
        })
    }
}

/// Accepts `:8080` (all interfaces), `localhost:8080` and plain socket
/// addresses.
fn parse_listen_addr(addr: &str) -> Result<SocketAddr> {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        let port: u16 = port.parse().context("invalid port")?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Some(port) = addr.strip_prefix("localhost:") {
        let port: u16 = port.parse().context("invalid port")?;
        return Ok(SocketAddr::from(([127, 0, 0, 1], port)));
    }
    addr.parse().context("invalid listen address")
}

pub struct ProxyHandle {
    proxy_task: Option<JoinHandle<Result<()>>>,
    admin_task: Option<JoinHandle<Result<()>>>,
    tls_task: Option<JoinHandle<Result<()>>>,
    completed: bool,
}

impl ProxyHandle {
    /// Waits for the listeners; returns the first startup or serve error.
    pub async fn wait(mut self) -> Result<()> {
        let proxy_task = self.proxy_task.take().context("missing proxy task")?;
        let admin_task = self.admin_task.take().context("missing admin task")?;
        let tls_task = self.tls_task.take().context("missing TLS task")?;
        let proxy_result = proxy_task.await;
        let admin_result = admin_task.await;
        let tls_result = tls_task.await;
        self.completed = true;
        proxy_result??;
        admin_result??;
        tls_result??;
        Ok(())
    }

    pub async fn shutdown(mut self) -> Result<()> {
        abort_tasks(
            self.proxy_task.take(),
            self.admin_task.take(),
            self.tls_task.take(),
        )
        .await;
        self.completed = true;
        Ok(())
    }
}

async fn abort_task(task: Option<JoinHandle<Result<()>>>) {
    if let Some(task) = task {
        task.abort();
        let _ = task.await;
    }
}

async fn abort_tasks(
    proxy_task: Option<JoinHandle<Result<()>>>,
    admin_task: Option<JoinHandle<Result<()>>>,
    tls_task: Option<JoinHandle<Result<()>>>,
) {
    abort_task(proxy_task).await;
    abort_task(admin_task).await;
    abort_task(tls_task).await;
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let proxy_task = self.proxy_task.take();
        let admin_task = self.admin_task.take();
        let tls_task = self.tls_task.take();
        tokio::spawn(async move {
            abort_tasks(proxy_task, admin_task, tls_task).await;
        });
    }
}
