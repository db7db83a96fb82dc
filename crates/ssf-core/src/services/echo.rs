//! Built-in echo microservice.
//!
//! Listens on a fiber port and writes every received byte back. Exists to
//! exercise the service framework end-to-end and as the loopback target
//! for diagnostics.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::demux::{Fiber, FiberDemux};
use crate::services::{Microservice, ServiceError, ServiceParameters};

/// Stable factory id of the echo service.
pub const ECHO_FACTORY_ID: u32 = 7;

/// Fiber port the echo service listens on unless `local_port` says
/// otherwise.
const DEFAULT_ECHO_PORT: u32 = 7;

/// Echo microservice instance.
pub struct EchoService {
    demux: Arc<FiberDemux>,
    port: u32,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl EchoService {
    /// Build from `CreateService` parameters (`local_port`, default 7).
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidParameters`] for a malformed `local_port`.
    pub fn from_params(
        demux: Arc<FiberDemux>,
        params: &ServiceParameters,
    ) -> Result<Self, ServiceError> {
        let port = match params.get("local_port") {
            Some(value) => value.parse::<u32>().map_err(|_| {
                ServiceError::InvalidParameters(format!("local_port {value:?} is not a port"))
            })?,
            None => DEFAULT_ECHO_PORT,
        };
        Ok(Self { demux, port, accept_task: Mutex::new(None) })
    }
}

async fn echo_fiber(mut fiber: Fiber) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match fiber.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if fiber.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    fiber.shutdown();
}

#[async_trait]
impl Microservice for EchoService {
    fn service_id(&self) -> u32 {
        ECHO_FACTORY_ID
    }

    async fn start(&self) -> Result<(), ServiceError> {
        let mut slot = self.accept_task.lock().expect("echo lock");
        if slot.is_some() {
            return Ok(());
        }

        let mut listener = self
            .demux
            .listen(self.port)
            .map_err(|e| ServiceError::Start(e.to_string()))?;
        tracing::info!(port = self.port, "echo service listening");

        *slot = Some(tokio::spawn(async move {
            while let Ok(fiber) = listener.accept().await {
                tokio::spawn(echo_fiber(fiber));
            }
        }));
        Ok(())
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        if let Some(task) = self.accept_task.lock().expect("echo lock").take() {
            task.abort();
            tracing::info!(port = self.port, "echo service stopped");
        }
        Ok(())
    }
}
