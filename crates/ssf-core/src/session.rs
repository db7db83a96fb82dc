//! Client and server session orchestration.
//!
//! Ties the pieces together: build the layer stack from a descriptor,
//! connect or accept, stand up the fiber demux, and start the admin
//! control plane. The CLI sits above this module; per spec the server
//! keeps listening when one connection fails, while a client connect
//! failure is returned to the caller for a one-line diagnostic.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::admin::{self, AdminClient, AdminEvent, UserServiceSpec};
use crate::config::{Config, ServiceEntry};
use crate::demux::FiberDemux;
use crate::error::{AdminError, ConfigError, DemuxError, LayerError};
use crate::services::{ServiceRegistry, ServiceManager, ECHO_FACTORY_ID};
use crate::layer::{LayerBlock, LayerStack};

/// Session-level failures.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Configuration problems
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Stack construction or connect/accept failures
    #[error(transparent)]
    Layer(#[from] LayerError),
    /// Demux failures
    #[error(transparent)]
    Demux(#[from] DemuxError),
    /// Admin control-plane failures
    #[error(transparent)]
    Admin(#[from] AdminError),
}

/// Map configured service names to factory ids.
///
/// Only built-ins are known here; custom factories come with a custom
/// [`ServiceRegistry`] on the server side and matching specs on the
/// client side.
fn factory_id_for(name: &str) -> Option<u32> {
    match name {
        "echo" => Some(ECHO_FACTORY_ID),
        _ => None,
    }
}

/// Build the client's user-service request list from configuration.
///
/// Unknown service names are skipped with a warning so an old client can
/// carry forward a newer configuration.
#[must_use]
pub fn user_services_from_config(config: &Config) -> Vec<UserServiceSpec> {
    let mut specs = Vec::new();
    for (name, entry) in &config.ssf.services {
        if !entry.enabled {
            continue;
        }
        let Some(factory_id) = factory_id_for(name) else {
            tracing::warn!(service = %name, "unknown service in configuration, skipping");
            continue;
        };
        specs.push(UserServiceSpec {
            name: name.clone(),
            factory_id,
            parameters: entry.parameters.clone(),
        });
    }
    specs
}

/// Build a service entry list usable in tests and by the CLI.
#[must_use]
pub fn service_entry(enabled: bool, parameters: &[(&str, &str)]) -> ServiceEntry {
    ServiceEntry {
        enabled,
        parameters: parameters
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect(),
    }
}

/// An established client session.
#[derive(Debug)]
pub struct ClientSession {
    demux: Arc<FiberDemux>,
    _admin: AdminClient,
    events: mpsc::UnboundedReceiver<AdminEvent>,
}

impl ClientSession {
    /// Connect the full stack, start the demux and the admin client, and
    /// request `user_services` on the server.
    ///
    /// # Errors
    ///
    /// The failing layer's error; [`AdminError::AdminUnreachable`] when
    /// the admin fiber cannot be established.
    pub async fn connect(
        descriptor: &[LayerBlock],
        user_services: Vec<UserServiceSpec>,
    ) -> Result<Self, SessionError> {
        let stack = LayerStack::from_descriptor(descriptor)?;
        let stream = stack.connect().await?;
        let demux = Arc::new(FiberDemux::new(stream, stack.mtu()));

        let (events_tx, events) = mpsc::unbounded_channel();
        let admin = admin::start_client(Arc::clone(&demux), user_services, events_tx).await?;
        tracing::info!("client session established");

        Ok(Self { demux, _admin: admin, events })
    }

    /// The session's demux, for opening application fibers.
    #[must_use]
    pub fn demux(&self) -> &Arc<FiberDemux> {
        &self.demux
    }

    /// Next admin event (service outcomes, initialization, closure).
    pub async fn next_event(&mut self) -> Option<AdminEvent> {
        self.events.recv().await
    }

    /// Tear the session down.
    pub fn close(&self) {
        self.demux.close();
    }
}

/// A running server: accept loop plus per-connection service plumbing.
pub struct ServerSession {
    accept_task: JoinHandle<()>,
    local_addr: Option<std::net::SocketAddr>,
}

impl ServerSession {
    /// Bind the stack and serve connections until dropped.
    ///
    /// Each accepted connection gets its own demux, service manager
    /// (from `registry_factory`) and admin driver. Per-connection
    /// failures are logged and the listener continues.
    ///
    /// # Errors
    ///
    /// Stack construction or bind failures.
    pub async fn serve<F>(
        descriptor: &[LayerBlock],
        registry_factory: F,
    ) -> Result<Self, SessionError>
    where
        F: Fn() -> ServiceRegistry + Send + Sync + 'static,
    {
        let stack = LayerStack::from_descriptor(descriptor)?;
        let mtu = stack.mtu();
        let mut acceptor = stack.listen().await?;
        let local_addr = acceptor.local_addr();

        let accept_task = tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok(stream) => {
                        let registry = registry_factory();
                        tokio::spawn(handle_connection(stream, mtu, registry));
                    }
                    Err(err) => {
                        // Handshake and transport failures are
                        // per-connection; keep listening.
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
            }
        });

        tracing::info!(?local_addr, "server listening");
        Ok(Self { accept_task, local_addr })
    }

    /// Bound address of the bottom layer, when it has one.
    #[must_use]
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_connection(
    stream: crate::layer::BoxedStream,
    mtu: usize,
    registry: ServiceRegistry,
) {
    let demux = Arc::new(FiberDemux::new(stream, mtu));
    let manager = Arc::new(ServiceManager::new(registry, Arc::clone(&demux)));

    let admin = match admin::start_server(Arc::clone(&demux), Arc::clone(&manager)) {
        Ok(admin) => admin,
        Err(err) => {
            tracing::warn!(error = %err, "admin server failed to start");
            demux.close();
            return;
        }
    };

    let reason = demux.until_closed().await;
    tracing::info!(%reason, "connection closed");
    admin.abort();
    manager.stop_all().await;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::SsfConfig;

    #[test]
    fn enabled_known_services_become_specs() {
        let mut services = BTreeMap::new();
        services.insert("echo".to_string(), service_entry(true, &[("local_port", "7")]));
        services.insert("disabled".to_string(), service_entry(false, &[]));
        services.insert("mystery".to_string(), service_entry(true, &[]));

        let config = Config { ssf: SsfConfig { services, ..Default::default() } };
        let specs = user_services_from_config(&config);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
        assert_eq!(specs[0].factory_id, ECHO_FACTORY_ID);
        assert_eq!(specs[0].parameters.get("local_port").map(String::as_str), Some("7"));
    }
}
