use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use rama_net::tls::ApplicationProtocol;
use rama_tls_rustls::dep::rcgen::BasicConstraints;
use rama_tls_rustls::dep::rcgen::CertificateParams;
use rama_tls_rustls::dep::rcgen::DistinguishedName;
use rama_tls_rustls::dep::rcgen::DnType;
use rama_tls_rustls::dep::rcgen::ExtendedKeyUsagePurpose;
use rama_tls_rustls::dep::rcgen::IsCa;
use rama_tls_rustls::dep::rcgen::Issuer;
use rama_tls_rustls::dep::rcgen::KeyPair;
use rama_tls_rustls::dep::rcgen::KeyUsagePurpose;
use rama_tls_rustls::dep::rcgen::PKCS_ECDSA_P256_SHA256;
use rama_tls_rustls::dep::rcgen::SanType;
use rama_tls_rustls::server::TlsAcceptorData;
use rustls::ServerConfig;
use rustls::pki_types::CertificateDer;
use rustls::pki_types::PrivateKeyDer;
use rustls::pki_types::PrivatePkcs8KeyDer;
use rustls::pki_types::pem::PemObject;
use rustls::server::ClientHello;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::sync::PoisonError;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;
use tracing::warn;

/// Re-minting starts this close to a cached leaf's NotAfter, so a cert is
/// never handed out right at its expiry edge.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Ensures a process-wide rustls crypto provider is installed.
///
/// rustls cannot auto-select a provider when both `ring` and `aws-lc-rs`
/// features end up enabled in the dependency graph.
pub fn ensure_rustls_crypto_provider() {
    static RUSTLS_PROVIDER_INIT: Once = Once::new();
    RUSTLS_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// The MITM certificate authority: a root CA plus a host-keyed cache of
/// minted leaf certificates.
pub struct CertAuthority {
    issuer: Issuer<'static, KeyPair>,
    ca_cert_der: CertificateDer<'static>,
    organization: String,
    validity: Duration,
    cache: Mutex<HashMap<String, Arc<Mutex<Option<CachedLeaf>>>>>,
}

#[derive(Clone)]
struct CachedLeaf {
    certified: Arc<CertifiedKey>,
    cert_der: CertificateDer<'static>,
    key_der: Arc<PrivateKeyDer<'static>>,
    not_after: OffsetDateTime,
}

impl CachedLeaf {
    fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.not_after - time_duration(EXPIRY_SKEW) > now
    }
}

impl std::fmt::Debug for CertAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never dump CA key material or the minted-cert cache into logs.
        f.debug_struct("CertAuthority")
            .field("organization", &self.organization)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl CertAuthority {
    /// Loads the CA from the given PEM files, or generates an ephemeral one
    /// when no paths are supplied. A generated CA lives only as long as the
    /// process; operators who want clients to keep trusting the proxy across
    /// restarts pass `--cert`/`--key`.
    pub fn load_or_generate(
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        organization: String,
        validity: Duration,
    ) -> Result<Self> {
        let (ca_cert_pem, ca_key_pem) = match (cert_path, key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert_pem = std::fs::read_to_string(cert_path)
                    .with_context(|| format!("failed to read CA cert {}", cert_path.display()))?;
                let key_pem = std::fs::read_to_string(key_path)
                    .with_context(|| format!("failed to read CA key {}", key_path.display()))?;
                (cert_pem, key_pem)
            }
            (None, None) => {
                info!(
                    "generating an ephemeral root CA; supply --cert and --key to use a persistent one"
                );
                generate_ca(&organization)?
            }
            _ => {
                return Err(anyhow!(
                    "--cert and --key must be supplied together (or neither)"
                ));
            }
        };

        let ca_key = KeyPair::from_pem(&ca_key_pem).context("failed to parse CA key")?;
        let issuer: Issuer<'static, KeyPair> =
            Issuer::from_ca_cert_pem(&ca_cert_pem, ca_key).context("failed to parse CA cert")?;
        let ca_cert_der = CertificateDer::from_pem_slice(ca_cert_pem.as_bytes())
            .context("failed to decode CA cert PEM")?;

        Ok(Self {
            issuer,
            ca_cert_der,
            organization,
            validity,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// The root certificate in DER form, served at `/authority.cer` for
    /// client trust-store installation.
    pub fn ca_cert_der(&self) -> &[u8] {
        &self.ca_cert_der
    }

    /// TLS acceptor configuration presenting a minted leaf for `host`.
    pub fn acceptor_for_host(&self, host: &str) -> Result<TlsAcceptorData> {
        let leaf = self.leaf_for_host(host)?;
        let mut server_config =
            ServerConfig::builder_with_protocol_versions(rustls::ALL_VERSIONS)
                .with_no_client_auth()
                .with_single_cert(vec![leaf.cert_der.clone()], leaf.key_der.clone_key())
                .context("failed to build rustls server config")?;
        server_config.alpn_protocols = alpn_protocols();
        Ok(TlsAcceptorData::from(server_config))
    }

    /// TLS acceptor configuration that mints per-host leaves on demand from
    /// the client hello's SNI. Used by the transparent TLS listener, where
    /// the target host is not known until the handshake starts.
    pub fn sni_acceptor_data(self: &Arc<Self>) -> TlsAcceptorData {
        let mut server_config = ServerConfig::builder_with_protocol_versions(rustls::ALL_VERSIONS)
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(MintingResolver {
                authority: self.clone(),
            }));
        server_config.alpn_protocols = alpn_protocols();
        TlsAcceptorData::from(server_config)
    }

    /// Returns the cached leaf for `host`, minting one when absent or about
    /// to expire. Each host has its own slot lock, so concurrent requests
    /// for one uncached host mint a single certificate without serializing
    /// mints across hosts.
    fn leaf_for_host(&self, host: &str) -> Result<CachedLeaf> {
        let slot = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.entry(host.to_string()).or_default().clone()
        };
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let now = OffsetDateTime::now_utc();
        if let Some(leaf) = guard.as_ref()
            && leaf.is_fresh(now)
        {
            return Ok(leaf.clone());
        }
        let leaf = self.mint(host, now)?;
        *guard = Some(leaf.clone());
        Ok(leaf)
    }

    fn mint(&self, host: &str, now: OffsetDateTime) -> Result<CachedLeaf> {
        let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
            let mut params = CertificateParams::new(Vec::new())
                .map_err(|err| anyhow!("failed to create cert params: {err}"))?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![host.to_string()])
                .map_err(|err| anyhow!("failed to create cert params: {err}"))?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        dn.push(DnType::OrganizationName, self.organization.as_str());
        params.distinguished_name = dn;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        // Backdate NotBefore slightly so clients with minor clock drift
        // accept a just-minted leaf.
        let not_after = now + time_duration(self.validity);
        params.not_before = now - time::Duration::minutes(1);
        params.not_after = not_after;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|err| anyhow!("failed to generate host key pair: {err}"))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|err| anyhow!("failed to sign host cert: {err}"))?;

        let cert_der = cert.der().clone();
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|err| anyhow!("unusable host key for {host}: {err}"))?;
        let certified = Arc::new(CertifiedKey::new(vec![cert_der.clone()], signing_key));

        info!("minted leaf certificate for {host}");
        Ok(CachedLeaf {
            certified,
            cert_der,
            key_der: Arc::new(key_der),
            not_after,
        })
    }
}

fn alpn_protocols() -> Vec<Vec<u8>> {
    vec![
        ApplicationProtocol::HTTP_2.as_bytes().to_vec(),
        ApplicationProtocol::HTTP_11.as_bytes().to_vec(),
    ]
}

fn generate_ca(organization: &str) -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{organization} CA"));
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|err| anyhow!("failed to generate CA key pair: {err}"))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| anyhow!("failed to generate CA cert: {err}"))?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn time_duration(d: Duration) -> time::Duration {
    time::Duration::seconds(d.as_secs() as i64)
}

#[derive(Debug)]
struct MintingResolver {
    authority: Arc<CertAuthority>,
}

impl ResolvesServerCert for MintingResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?;
        match self.authority.leaf_for_host(host) {
            Ok(leaf) => Some(leaf.certified),
            Err(err) => {
                warn!("failed to mint certificate for {host}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(validity: Duration) -> CertAuthority {
        CertAuthority::load_or_generate(None, None, "Clarity Proxy".to_string(), validity)
            .expect("generate ephemeral CA")
    }

    #[test]
    fn generated_ca_produces_a_der_certificate() {
        let ca = authority(Duration::from_secs(3600));
        assert!(!ca.ca_cert_der().is_empty());
    }

    #[test]
    fn leaf_cache_returns_the_same_cert_within_validity() {
        let ca = authority(Duration::from_secs(3600));
        let first = ca.leaf_for_host("example.com").unwrap();
        let second = ca.leaf_for_host("example.com").unwrap();
        assert_eq!(first.cert_der, second.cert_der);
    }

    #[test]
    fn leaf_cache_remints_inside_the_expiry_skew() {
        // A validity shorter than the skew makes every cached leaf stale on
        // the next lookup.
        let ca = authority(Duration::from_secs(1));
        let first = ca.leaf_for_host("example.com").unwrap();
        let second = ca.leaf_for_host("example.com").unwrap();
        assert_ne!(first.cert_der, second.cert_der);
    }

    #[test]
    fn distinct_hosts_get_distinct_leaves() {
        let ca = authority(Duration::from_secs(3600));
        let a = ca.leaf_for_host("a.example.com").unwrap();
        let b = ca.leaf_for_host("b.example.com").unwrap();
        assert_ne!(a.cert_der, b.cert_der);
    }

    #[test]
    fn ip_hosts_are_minted_with_ip_sans() {
        let ca = authority(Duration::from_secs(3600));
        assert!(ca.leaf_for_host("192.168.1.10").is_ok());
    }

    #[test]
    fn cert_and_key_flags_must_come_together() {
        let err = CertAuthority::load_or_generate(
            Some(Path::new("/nonexistent/ca.pem")),
            None,
            "Clarity Proxy".to_string(),
            Duration::from_secs(3600),
        )
        .unwrap_err();
        assert!(err.to_string().contains("together"));
    }

    #[test]
    fn loading_from_missing_files_fails() {
        let err = CertAuthority::load_or_generate(
            Some(Path::new("/nonexistent/ca.pem")),
            Some(Path::new("/nonexistent/ca.key")),
            "Clarity Proxy".to_string(),
            Duration::from_secs(3600),
        )
        .unwrap_err();
        assert!(err.to_string().contains("failed to read CA cert"));
    }
}
