//! Channel and call credentials.
//!
//! [`ChannelCredentials`] decide how the connection is secured: plaintext,
//! TLS (optionally with a client certificate), or a secure channel combined
//! with [`CallCredentials`] that attach authentication metadata to every
//! call.
//!
//! ```ignore
//! use wirecall_client::{CallCredentials, ChannelCredentials, TlsCredentials};
//!
//! let credentials = ChannelCredentials::tls(TlsCredentials::new().root_certificates(ca_pem))
//!     .with_call_credentials(CallCredentials::access_token("s3cr3t"));
//! ```

use std::fmt;
use std::sync::Arc;

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::ClientConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use wirecall_core::{Metadata, MetadataValue};

use crate::ClientError;
use crate::transport::DnsResolver;

pub(crate) type PlainConnector = HttpConnector<DnsResolver>;
pub(crate) type SecureConnector = HttpsConnector<PlainConnector>;

/// Connector produced by [`ChannelCredentials::negotiate`].
pub(crate) enum Connector {
    Plain(PlainConnector),
    Secure(SecureConnector),
}

/// PEM material for a TLS channel.
///
/// Without root certificates the platform trust store (`tls-native-roots`)
/// or the bundled Mozilla roots (`tls-webpki-roots`) are used. A private key
/// and certificate chain enable mutual TLS and must be given together.
#[derive(Clone, Default)]
pub struct TlsCredentials {
    root_certificates: Option<Vec<u8>>,
    private_key: Option<Vec<u8>>,
    certificate_chain: Option<Vec<u8>>,
}

impl fmt::Debug for TlsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCredentials")
            .field("root_certificates", &self.root_certificates.is_some())
            .field("client_auth", &self.private_key.is_some())
            .finish()
    }
}

impl TlsCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_certificates(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_certificates = Some(pem.into());
        self
    }

    pub fn client_identity(mut self, certificate_chain: impl Into<Vec<u8>>, private_key: impl Into<Vec<u8>>) -> Self {
        self.certificate_chain = Some(certificate_chain.into());
        self.private_key = Some(private_key.into());
        self
    }

    pub(crate) fn client_config(&self) -> Result<ClientConfig, ClientError> {
        let builder = crypto_provider_builder()?;
        let builder = builder.with_root_certificates(self.root_store()?);

        match (&self.certificate_chain, &self.private_key) {
            (Some(chain), Some(key)) => {
                let chain = CertificateDer::pem_slice_iter(chain)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ClientError::invalid_argument(format!("invalid certificate chain: {e}")))?;
                let key = PrivateKeyDer::from_pem_slice(key)
                    .map_err(|e| ClientError::invalid_argument(format!("invalid private key: {e}")))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| ClientError::invalid_argument(format!("invalid client identity: {e}")))
            }
            (None, None) => Ok(builder.with_no_client_auth()),
            _ => Err(ClientError::invalid_argument(
                "a private key and a certificate chain must be given together",
            )),
        }
    }

    fn root_store(&self) -> Result<rustls::RootCertStore, ClientError> {
        let Some(pem) = &self.root_certificates else {
            return default_root_store();
        };
        let mut roots = rustls::RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(pem) {
            let cert = cert.map_err(|e| ClientError::invalid_argument(format!("invalid root certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ClientError::invalid_argument(format!("invalid root certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(ClientError::invalid_argument("no root certificates found in PEM"));
        }
        Ok(roots)
    }
}

/// Feature-selected crypto provider, or the process-wide default.
fn crypto_provider_builder() -> Result<rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>, ClientError> {
    #[cfg(feature = "tls-ring")]
    let provider = Some(Arc::new(rustls::crypto::ring::default_provider()));

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    let provider = Some(Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    let provider = rustls::crypto::CryptoProvider::get_default().cloned();

    let provider = provider.ok_or_else(|| {
        ClientError::invalid_argument(
            "TLS requires a crypto provider: enable `tls-ring` or `tls-aws-lc`, \
             or install one with `CryptoProvider::install_default()`",
        )
    })?;
    ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::invalid_argument(format!("unusable crypto provider: {e}")))
}

fn default_root_store() -> Result<rustls::RootCertStore, ClientError> {
    #[allow(unused_mut)]
    let mut roots = rustls::RootCertStore::empty();

    #[cfg(feature = "tls-native-roots")]
    {
        let native = rustls_native_certs::load_native_certs();
        #[cfg(feature = "tracing")]
        {
            if !native.errors.is_empty() {
                tracing::debug!(errors = ?native.errors, "errors loading native certificates");
            }
        }
        roots.add_parsable_certificates(native.certs);
    }

    #[cfg(all(feature = "tls-webpki-roots", not(feature = "tls-native-roots")))]
    {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    if roots.is_empty() {
        return Err(ClientError::invalid_argument(
            "no trust roots available: pass root certificates or enable `tls-native-roots` / `tls-webpki-roots`",
        ));
    }
    Ok(roots)
}

/// Information handed to call credential plugins.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// `scheme://authority/service` of the call.
    pub service_url: String,
    pub method_name: String,
}

type Plugin = Arc<dyn Fn(&AuthContext) -> Result<Metadata, String> + Send + Sync>;

#[derive(Clone)]
enum CallSource {
    AccessToken(String),
    Metadata(Metadata),
    Plugin(Plugin),
}

/// Per-call authentication metadata.
#[derive(Clone)]
pub struct CallCredentials {
    source: CallSource,
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.source {
            CallSource::AccessToken(_) => "access_token",
            CallSource::Metadata(_) => "metadata",
            CallSource::Plugin(_) => "plugin",
        };
        f.debug_struct("CallCredentials").field("kind", &kind).finish()
    }
}

impl CallCredentials {
    /// Send `authorization: Bearer <token>`.
    pub fn access_token<S: Into<String>>(token: S) -> Self {
        Self {
            source: CallSource::AccessToken(token.into()),
        }
    }

    /// Send fixed metadata.
    pub fn metadata(metadata: Metadata) -> Self {
        Self {
            source: CallSource::Metadata(metadata),
        }
    }

    /// Compute metadata per call. An `Err` fails the call with `UNAVAILABLE`.
    pub fn plugin<F>(plugin: F) -> Self
    where
        F: Fn(&AuthContext) -> Result<Metadata, String> + Send + Sync + 'static,
    {
        Self {
            source: CallSource::Plugin(Arc::new(plugin)),
        }
    }

    pub(crate) fn apply(&self, context: &AuthContext, metadata: &mut Metadata) -> Result<(), ClientError> {
        let failed = |reason: String| ClientError::unavailable(format!("call credentials failed: {reason}"));
        match &self.source {
            CallSource::AccessToken(token) => metadata
                .insert("authorization", MetadataValue::Ascii(format!("Bearer {token}")))
                .map_err(|e| failed(e.to_string())),
            CallSource::Metadata(extra) => {
                metadata.extend(extra.clone());
                Ok(())
            }
            CallSource::Plugin(plugin) => {
                metadata.extend(plugin(context).map_err(failed)?);
                Ok(())
            }
        }
    }
}

/// How a channel secures its connection.
#[derive(Clone, Debug)]
pub enum ChannelCredentials {
    Insecure,
    Tls(TlsCredentials),
    /// A channel credential combined with call credentials.
    Composite {
        channel: Box<ChannelCredentials>,
        call: Vec<CallCredentials>,
    },
}

impl ChannelCredentials {
    pub fn insecure() -> Self {
        ChannelCredentials::Insecure
    }

    pub fn tls(credentials: TlsCredentials) -> Self {
        ChannelCredentials::Tls(credentials)
    }

    /// Attach call credentials. They are only accepted on a secure channel;
    /// opening an insecure composite fails.
    pub fn with_call_credentials(self, call: CallCredentials) -> Self {
        match self {
            ChannelCredentials::Composite { channel, call: mut existing } => {
                existing.push(call);
                ChannelCredentials::Composite { channel, call: existing }
            }
            other => ChannelCredentials::Composite {
                channel: Box::new(other),
                call: vec![call],
            },
        }
    }

    pub fn is_secure(&self) -> bool {
        match self {
            ChannelCredentials::Insecure => false,
            ChannelCredentials::Tls(_) => true,
            ChannelCredentials::Composite { channel, .. } => channel.is_secure(),
        }
    }

    pub(crate) fn scheme(&self) -> &'static str {
        if self.is_secure() { "https" } else { "http" }
    }

    /// Call credentials in the order they were attached.
    pub fn call_credentials(&self) -> Vec<&CallCredentials> {
        match self {
            ChannelCredentials::Composite { channel, call } => {
                let mut all = channel.call_credentials();
                all.extend(call.iter());
                all
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if !self.is_secure() && !self.call_credentials().is_empty() {
            return Err(ClientError::invalid_argument(
                "call credentials require a secure channel",
            ));
        }
        Ok(())
    }

    fn tls_credentials(&self) -> Option<&TlsCredentials> {
        match self {
            ChannelCredentials::Insecure => None,
            ChannelCredentials::Tls(tls) => Some(tls),
            ChannelCredentials::Composite { channel, .. } => channel.tls_credentials(),
        }
    }

    /// Turn a plain TCP connector into the connector these credentials need.
    pub(crate) fn negotiate(&self, mut http: PlainConnector) -> Result<Connector, ClientError> {
        self.validate()?;
        let Some(tls) = self.tls_credentials() else {
            return Ok(Connector::Plain(http));
        };
        http.enforce_http(false);
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls.client_config()?)
            .https_only()
            .enable_all_versions()
            .wrap_connector(http);
        Ok(Connector::Secure(connector))
    }
}
