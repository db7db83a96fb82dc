//! Physical TCP layer: address resolution, connect and accept.

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpListener, TcpStream};

use crate::error::LayerError;
use crate::layer::{Acceptor, BoxedAcceptor, BoxedStream, Endpoint, Layer};

/// Bottom-of-stack TCP layer.
///
/// Endpoint parameters: `host`, `port`. For listening, `host` defaults to
/// all interfaces.
pub struct TcpLayer {
    _private: (),
}

/// Nominal MTU exposed to the layers above; TCP itself is a byte stream,
/// this bounds the fiber frame size (`payload_len` is u16).
const TCP_MTU: usize = 65535;

impl TcpLayer {
    /// Create the layer.
    #[must_use]
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn parse_port(endpoint: &Endpoint) -> Result<u16, LayerError> {
        let port = endpoint.require("port")?;
        port.parse::<u16>().map_err(|_| {
            LayerError::InvalidArgument(format!("layer tcp: invalid port {port:?}"))
        })
    }
}

impl Default for TcpLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Layer for TcpLayer {
    fn id(&self) -> &'static str {
        "tcp"
    }

    fn mtu(&self) -> usize {
        TCP_MTU
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, LayerError> {
        let host = endpoint.require("host")?;
        let port = Self::parse_port(endpoint)?;

        let mut addrs = lookup_host((host, port)).await?;
        let addr = addrs.next().ok_or_else(|| {
            LayerError::InvalidArgument(format!("layer tcp: {host} resolved to no addresses"))
        })?;

        tracing::debug!(%addr, "tcp connect");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, endpoint: &Endpoint) -> Result<BoxedAcceptor, LayerError> {
        let host = endpoint.get("host").unwrap_or("0.0.0.0");
        let port = Self::parse_port(endpoint)?;

        let listener = TcpListener::bind((host, port)).await?;
        tracing::debug!(addr = %listener.local_addr()?, "tcp listen");
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&mut self) -> Result<BoxedStream, LayerError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%peer, "tcp accept");
        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.local_addr().ok()
    }
}
