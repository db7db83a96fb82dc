//! Mutual-auth TLS layer over any enclosed stream layer.
//!
//! Both peers authenticate with X.509 certificates issued by the configured
//! CA: the server requires a client certificate, the client verifies the
//! server against the same trust root. Established streams are wrapped in a
//! read-ahead pump ([`PumpedStream`]) so small application reads do not
//! round-trip into record decryption.
//!
//! Descriptor parameters mirror the `ssf.tls` configuration section:
//! `ca_cert_path`, `cert_path`, `key_path`, `key_password`, `dh_path`,
//! `cipher_alg`, plus an optional `peer_name` override for certificate
//! verification.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::LayerError;
use crate::layer::{
    Acceptor, BoxedAcceptor, BoxedStream, Endpoint, Layer, Parameters, PumpedStream,
};

/// Shared, immutable TLS material: certificate chain, private key, trusted
/// CA set. Built once per stack and shared by every socket.
#[derive(Debug)]
pub struct TlsContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl TlsContext {
    /// Build a context from a `tls` descriptor block.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidArgument`] for missing paths,
    /// [`LayerError::CertificateInvalid`] when material cannot be loaded or
    /// is rejected by the backend.
    pub fn from_params(params: &Parameters) -> Result<Self, LayerError> {
        let path = |key: &'static str| -> Result<&str, LayerError> {
            params
                .get(key)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| LayerError::InvalidArgument(format!("tls: missing parameter {key}")))
        };

        let ca_path = path("ca_cert_path")?;
        let cert_path = path("cert_path")?;
        let key_path = path("key_path")?;

        if params.get("key_password").is_some_and(|p| !p.is_empty()) {
            tracing::warn!("tls: encrypted private keys are not supported; decrypt the key file");
        }
        if let Some(dh) = params.get("dh_path").filter(|p| !p.is_empty()) {
            tracing::debug!(dh_path = %dh, "tls: dh parameters accepted but unused by this backend");
        }
        if let Some(ciphers) = params.get("cipher_alg").filter(|c| !c.is_empty()) {
            tracing::debug!(cipher_alg = %ciphers, "tls: backend negotiates its own cipher suites");
        }

        let ca_certs = load_certs(ca_path)?;
        let chain = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| LayerError::CertificateInvalid(format!("{ca_path}: {e}")))?;
        }
        let roots = Arc::new(roots);

        let client = ClientConfig::builder()
            .with_root_certificates(Arc::clone(&roots))
            .with_client_auth_cert(chain.clone(), key.clone_key())
            .map_err(|e| LayerError::CertificateInvalid(e.to_string()))?;

        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| LayerError::CertificateInvalid(e.to_string()))?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| LayerError::CertificateInvalid(e.to_string()))?;

        Ok(Self { client: Arc::new(client), server: Arc::new(server) })
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, LayerError> {
    let file = File::open(Path::new(path))
        .map_err(|e| LayerError::CertificateInvalid(format!("{path}: {e}")))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| LayerError::CertificateInvalid(format!("{path}: {e}")))?;
    if certs.is_empty() {
        return Err(LayerError::CertificateInvalid(format!("{path}: no certificates found")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, LayerError> {
    let file = File::open(Path::new(path))
        .map_err(|e| LayerError::CertificateInvalid(format!("{path}: {e}")))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| LayerError::CertificateInvalid(format!("{path}: {e}")))?
        .ok_or_else(|| LayerError::CertificateInvalid(format!("{path}: no private key found")))
}

/// TLS layer wrapping the enclosed stream layer.
pub struct TlsLayer {
    next: Arc<dyn Layer>,
    context: Arc<TlsContext>,
}

impl TlsLayer {
    /// Wrap the enclosed layer with a shared context.
    #[must_use]
    pub fn new(next: Arc<dyn Layer>, context: Arc<TlsContext>) -> Self {
        Self { next, context }
    }

    /// The name the server certificate is verified against: an explicit
    /// `peer_name`, else the CONNECT target, else the TCP host.
    fn peer_name(endpoint: &Endpoint) -> Result<String, LayerError> {
        if let Some(name) = endpoint.get("peer_name") {
            return Ok(name.to_string());
        }
        let mut next = endpoint.next.as_deref();
        while let Some(e) = next {
            if let Some(name) = e.get("target_host").or_else(|| e.get("host")) {
                return Ok(name.to_string());
            }
            next = e.next.as_deref();
        }
        Err(LayerError::InvalidArgument(
            "tls: no peer_name and no host in enclosed endpoints".to_string(),
        ))
    }
}

#[async_trait]
impl Layer for TlsLayer {
    fn id(&self) -> &'static str {
        "tls"
    }

    fn mtu(&self) -> usize {
        // Record framing is hidden behind the stream interface.
        self.next.mtu()
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, LayerError> {
        let peer_name = Self::peer_name(endpoint)?;
        let server_name = ServerName::try_from(peer_name.clone())
            .map_err(|_| LayerError::InvalidArgument(format!("tls: bad peer name {peer_name:?}")))?;

        let stream = self.next.connect(endpoint.next_layer()?).await?;

        let connector = TlsConnector::from(Arc::clone(&self.context.client));
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| LayerError::HandshakeFailed(e.to_string()))?;
        tracing::debug!(peer = %peer_name, "tls handshake complete");

        let (read, write) = tokio::io::split(tls);
        Ok(Box::new(PumpedStream::new(read, write)))
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<BoxedAcceptor, LayerError> {
        let inner = self.next.listen(endpoint.next_layer()?).await?;
        Ok(Box::new(TlsLayerAcceptor {
            inner,
            acceptor: TlsAcceptor::from(Arc::clone(&self.context.server)),
        }))
    }
}

struct TlsLayerAcceptor {
    inner: BoxedAcceptor,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl Acceptor for TlsLayerAcceptor {
    async fn accept(&mut self) -> Result<BoxedStream, LayerError> {
        let stream = self.inner.accept().await?;
        let tls = self
            .acceptor
            .accept(stream)
            .await
            .map_err(|e| LayerError::HandshakeFailed(e.to_string()))?;
        tracing::debug!("tls accept complete");

        let (read, write) = tokio::io::split(tls);
        Ok(Box::new(PumpedStream::new(read, write)))
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, &str)]) -> Parameters {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn missing_paths_are_invalid_arguments() {
        let err = TlsContext::from_params(&Parameters::new()).expect_err("no params");
        assert!(matches!(err, LayerError::InvalidArgument(_)));
    }

    #[test]
    fn unreadable_material_is_certificate_invalid() {
        let err = TlsContext::from_params(&params(&[
            ("ca_cert_path", "/nonexistent/ca.crt"),
            ("cert_path", "/nonexistent/cert.crt"),
            ("key_path", "/nonexistent/key.pem"),
        ]))
        .expect_err("missing files");
        assert!(matches!(err, LayerError::CertificateInvalid(_)));
    }

    #[test]
    fn peer_name_falls_back_through_the_chain() {
        let tcp = Endpoint {
            layer: "tcp".to_string(),
            params: params(&[("host", "funnel.example.org"), ("port", "8011")]),
            next: None,
        };
        let tls = Endpoint {
            layer: "tls".to_string(),
            params: Parameters::new(),
            next: Some(Box::new(tcp)),
        };
        assert_eq!(TlsLayer::peer_name(&tls).expect("name"), "funnel.example.org");

        let explicit = Endpoint {
            layer: "tls".to_string(),
            params: params(&[("peer_name", "cn.example.org")]),
            next: tls.next.clone(),
        };
        assert_eq!(TlsLayer::peer_name(&explicit).expect("name"), "cn.example.org");
    }
}
