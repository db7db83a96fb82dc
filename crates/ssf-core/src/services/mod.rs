//! Microservice framework.
//!
//! A microservice is a pluggable unit (SOCKS server, port forwarder,
//! shell, copy, echo) started on demand over the fiber demux. Each service
//! type registers a factory under a stable factory id; the admin service
//! asks the [`ServiceManager`] to create and stop instances.
//!
//! The registry is an explicit value handed to the manager at
//! construction; there is no global factory singleton.

mod echo;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use ssf_proto::ServiceStatusCode;

pub use echo::{EchoService, ECHO_FACTORY_ID};

use crate::demux::FiberDemux;

/// Free-form service parameters carried in `CreateService` requests.
pub type ServiceParameters = BTreeMap<String, String>;

/// Errors from microservice construction and lifecycle.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// No factory registered under the requested id
    #[error("unknown factory id {0}")]
    UnknownFactory(u32),

    /// A parameter is missing or malformed
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The instance failed to start
    #[error("start failed: {0}")]
    Start(String),
}

/// One runnable microservice instance.
#[async_trait]
pub trait Microservice: Send + Sync {
    /// The stable factory id this instance was created from.
    fn service_id(&self) -> u32;

    /// Start serving. Idempotent: starting a running instance is a no-op.
    async fn start(&self) -> Result<(), ServiceError>;

    /// Stop serving. Idempotent.
    async fn stop(&self) -> Result<(), ServiceError>;
}

type FactoryFn =
    Box<dyn Fn(Arc<FiberDemux>, &ServiceParameters) -> Result<Arc<dyn Microservice>, ServiceError>
        + Send
        + Sync>;

/// Factory registry: factory id → constructor.
#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<u32, FactoryFn>,
}

impl ServiceRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in services registered.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ECHO_FACTORY_ID, |demux, params| {
            EchoService::from_params(demux, params).map(|s| Arc::new(s) as Arc<dyn Microservice>)
        });
        registry
    }

    /// Register a factory; replaces any previous registration for the id.
    pub fn register<F>(&mut self, factory_id: u32, factory: F)
    where
        F: Fn(Arc<FiberDemux>, &ServiceParameters) -> Result<Arc<dyn Microservice>, ServiceError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(factory_id, Box::new(factory));
    }

    /// Whether a factory is registered.
    #[must_use]
    pub fn contains(&self, factory_id: u32) -> bool {
        self.factories.contains_key(&factory_id)
    }

    fn create(
        &self,
        factory_id: u32,
        demux: Arc<FiberDemux>,
        params: &ServiceParameters,
    ) -> Result<Arc<dyn Microservice>, ServiceError> {
        let factory = self
            .factories
            .get(&factory_id)
            .ok_or(ServiceError::UnknownFactory(factory_id))?;
        factory(demux, params)
    }
}

struct ManagedInstance {
    service: Arc<dyn Microservice>,
    status: ServiceStatusCode,
}

/// Owns running service instances for one connection.
///
/// Start and stop are idempotent; a failed start is reported through the
/// returned status and the instance is not retained.
pub struct ServiceManager {
    registry: ServiceRegistry,
    demux: Arc<FiberDemux>,
    instances: Mutex<HashMap<u32, ManagedInstance>>,
    next_instance_id: AtomicU32,
}

impl ServiceManager {
    /// Create a manager bound to one demux.
    #[must_use]
    pub fn new(registry: ServiceRegistry, demux: Arc<FiberDemux>) -> Self {
        Self {
            registry,
            demux,
            instances: Mutex::new(HashMap::new()),
            next_instance_id: AtomicU32::new(1),
        }
    }

    /// Create and start an instance. Returns the assigned instance id and
    /// resulting status; a failed start yields `(0, Failed)`.
    pub async fn create(
        &self,
        factory_id: u32,
        params: &ServiceParameters,
    ) -> (u32, ServiceStatusCode) {
        let service = match self.registry.create(factory_id, Arc::clone(&self.demux), params) {
            Ok(service) => service,
            Err(err) => {
                tracing::warn!(factory_id, error = %err, "service create failed");
                return (0, ServiceStatusCode::Failed);
            }
        };

        let instance_id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        self.instances.lock().expect("service lock").insert(
            instance_id,
            ManagedInstance { service: Arc::clone(&service), status: ServiceStatusCode::Starting },
        );

        match service.start().await {
            Ok(()) => {
                if let Some(instance) =
                    self.instances.lock().expect("service lock").get_mut(&instance_id)
                {
                    instance.status = ServiceStatusCode::Running;
                }
                tracing::info!(factory_id, instance_id, "service running");
                (instance_id, ServiceStatusCode::Running)
            }
            Err(err) => {
                self.instances.lock().expect("service lock").remove(&instance_id);
                tracing::warn!(factory_id, error = %err, "service start failed");
                (0, ServiceStatusCode::Failed)
            }
        }
    }

    /// Stop an instance. Stopping an unknown or already stopped instance
    /// reports `Stopped`.
    pub async fn stop(&self, instance_id: u32) -> ServiceStatusCode {
        let service = {
            let mut instances = self.instances.lock().expect("service lock");
            match instances.remove(&instance_id) {
                Some(instance) => instance.service,
                None => return ServiceStatusCode::Stopped,
            }
        };

        match service.stop().await {
            Ok(()) => {
                tracing::info!(instance_id, "service stopped");
                ServiceStatusCode::Stopped
            }
            Err(err) => {
                tracing::warn!(instance_id, error = %err, "service stop failed");
                ServiceStatusCode::Failed
            }
        }
    }

    /// Current status of an instance; unknown ids report `Stopped`.
    #[must_use]
    pub fn status(&self, instance_id: u32) -> ServiceStatusCode {
        self.instances
            .lock()
            .expect("service lock")
            .get(&instance_id)
            .map_or(ServiceStatusCode::Stopped, |instance| instance.status)
    }

    /// Number of live instances.
    #[must_use]
    pub fn count(&self) -> usize {
        self.instances.lock().expect("service lock").len()
    }

    /// Stop every instance (connection teardown).
    pub async fn stop_all(&self) {
        let services: Vec<_> = {
            let mut instances = self.instances.lock().expect("service lock");
            instances.drain().map(|(_, instance)| instance.service).collect()
        };
        for service in services {
            let _ = service.stop().await;
        }
    }
}
