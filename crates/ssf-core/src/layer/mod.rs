//! Composable protocol stack.
//!
//! The funnel's transport is assembled at runtime from a **stack
//! descriptor**: an ordered list of parameter blocks, top layer first. Each
//! block names a layer (`tls`, `http_proxy`, `tcp`) and parameterizes it;
//! lower blocks parameterize the enclosed layers. Both peers use identical
//! descriptors modulo role-specific fields (listen vs. connect addresses).
//!
//! Layers are concrete values behind the [`Layer`] trait; composition is a
//! chain of `Arc<dyn Layer>` values, each wrapping its next layer. A
//! layer's `connect` first establishes the next-layer connection with the
//! next-layer endpoint, then performs its own handshake; `accept` is
//! symmetric. After connect/accept the stream is an opaque byte pipe
//! ([`BoxedStream`]).

mod physical;
mod proxy;
mod pump;
mod tls;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use physical::TcpLayer;
pub use proxy::ProxyLayer;
pub use pump::PumpedStream;
pub use tls::{TlsContext, TlsLayer};

use crate::error::LayerError;

/// One layer parameter block: string keys to string values.
pub type Parameters = BTreeMap<String, String>;

/// A stack descriptor block naming a layer and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlock {
    /// Layer id: `tcp`, `http_proxy` or `tls`
    pub layer: String,
    /// Layer parameters
    pub params: Parameters,
}

impl LayerBlock {
    /// Convenience constructor.
    #[must_use]
    pub fn new(layer: &str, params: Parameters) -> Self {
        Self { layer: layer.to_string(), params }
    }
}

/// A resolved endpoint: this layer's context plus, recursively, the
/// next-layer endpoint. Endpoints are plain values; they do not own
/// sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Layer id this endpoint belongs to
    pub layer: String,
    /// This layer's endpoint context
    pub params: Parameters,
    /// Enclosed layer's endpoint
    pub next: Option<Box<Endpoint>>,
}

impl Endpoint {
    /// Build an endpoint chain by consuming descriptor blocks top-down.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidArgument`] on an empty descriptor.
    pub fn from_descriptor(blocks: &[LayerBlock]) -> Result<Self, LayerError> {
        let (head, rest) = blocks
            .split_first()
            .ok_or_else(|| LayerError::InvalidArgument("empty stack descriptor".to_string()))?;

        let next = if rest.is_empty() {
            None
        } else {
            Some(Box::new(Self::from_descriptor(rest)?))
        };

        Ok(Self {
            layer: head.layer.clone(),
            params: head.params.clone(),
            next,
        })
    }

    /// The enclosed layer's endpoint.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidArgument`] when this is the bottom of the stack;
    /// a mid-stack layer without a next block means the descriptor was
    /// malformed.
    pub fn next_layer(&self) -> Result<&Endpoint, LayerError> {
        self.next.as_deref().ok_or_else(|| {
            LayerError::InvalidArgument(format!(
                "layer {} requires an enclosed layer endpoint",
                self.layer
            ))
        })
    }

    /// Fetch a required parameter.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidArgument`] naming the missing key.
    pub fn require(&self, key: &str) -> Result<&str, LayerError> {
        self.params.get(key).map(String::as_str).ok_or_else(|| {
            LayerError::InvalidArgument(format!("layer {}: missing parameter {key}", self.layer))
        })
    }

    /// Fetch an optional parameter.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Object-safe byte stream: what every established layer hands upward.
pub trait StreamSocket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamSocket for T {}

/// Boxed established stream.
pub type BoxedStream = Box<dyn StreamSocket>;

/// One protocol layer.
///
/// `read_some`/`write_some` are not part of the trait: an established
/// layer's data path is the returned [`BoxedStream`], defined only after
/// the handshake succeeded.
#[async_trait]
pub trait Layer: Send + Sync {
    /// Stable layer id, matching descriptor blocks.
    fn id(&self) -> &'static str;

    /// Maximum transfer unit: the next layer's MTU minus this layer's
    /// framing overhead.
    fn mtu(&self) -> usize;

    /// Establish the next-layer connection for `endpoint`, then perform
    /// this layer's handshake.
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxedStream, LayerError>;

    /// Bind an acceptor for `endpoint`.
    async fn listen(&self, endpoint: &Endpoint) -> Result<BoxedAcceptor, LayerError>;
}

/// One bound acceptor; yields established streams.
#[async_trait]
pub trait Acceptor: Send {
    /// Accept the next connection, running this layer's handshake.
    async fn accept(&mut self) -> Result<BoxedStream, LayerError>;

    /// The bound local address, where the bottom layer has one.
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

/// Boxed acceptor.
pub type BoxedAcceptor = Box<dyn Acceptor>;

/// A fully composed protocol stack: the top layer plus the endpoint chain
/// resolved from the descriptor it was built from.
pub struct LayerStack {
    top: Arc<dyn Layer>,
    endpoint: Endpoint,
}

impl LayerStack {
    /// Compose a stack from a descriptor, bottom layer last.
    ///
    /// Recognized layer ids: `tcp` (bottom only), `http_proxy`, `tls`.
    ///
    /// # Errors
    ///
    /// [`LayerError::InvalidArgument`] for unknown ids, a non-`tcp` bottom
    /// block or an empty descriptor;
    /// [`LayerError::CertificateInvalid`] when the `tls` block's material
    /// cannot be loaded.
    pub fn from_descriptor(blocks: &[LayerBlock]) -> Result<Self, LayerError> {
        if blocks.is_empty() {
            return Err(LayerError::InvalidArgument("empty stack descriptor".to_string()));
        }

        let endpoint = Endpoint::from_descriptor(blocks)?;

        // Layers compose bottom-up.
        let mut layer: Option<Arc<dyn Layer>> = None;
        for block in blocks.iter().rev() {
            layer = Some(match block.layer.as_str() {
                "tcp" => {
                    if layer.is_some() {
                        return Err(LayerError::InvalidArgument(
                            "tcp must be the bottom layer".to_string(),
                        ));
                    }
                    Arc::new(TcpLayer::new())
                }
                "http_proxy" => {
                    let next = layer.take().ok_or_else(|| {
                        LayerError::InvalidArgument(
                            "http_proxy requires an enclosed layer".to_string(),
                        )
                    })?;
                    Arc::new(ProxyLayer::new(next))
                }
                "tls" => {
                    let next = layer.take().ok_or_else(|| {
                        LayerError::InvalidArgument("tls requires an enclosed layer".to_string())
                    })?;
                    let context = TlsContext::from_params(&block.params)?;
                    Arc::new(TlsLayer::new(next, Arc::new(context)))
                }
                other => {
                    return Err(LayerError::InvalidArgument(format!("unknown layer id: {other}")));
                }
            });
        }

        let top = layer.expect("descriptor verified non-empty");
        Ok(Self { top, endpoint })
    }

    /// The composed stack's MTU.
    #[must_use]
    pub fn mtu(&self) -> usize {
        self.top.mtu()
    }

    /// Connect bottom-up through every layer.
    ///
    /// # Errors
    ///
    /// The failing layer's error, forwarded unchanged unless the semantics
    /// differ (see [`LayerError`]).
    pub async fn connect(&self) -> Result<BoxedStream, LayerError> {
        self.top.connect(&self.endpoint).await
    }

    /// Bind the stack's acceptor.
    ///
    /// # Errors
    ///
    /// The failing layer's error.
    pub async fn listen(&self) -> Result<BoxedAcceptor, LayerError> {
        self.top.listen(&self.endpoint).await
    }
}
