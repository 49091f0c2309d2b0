//! The port registry: registration entry points and request-handle creation.

use crate::consts;
use crate::error::{Error, Result};
use crate::interface::{Interface, InterfaceKind};
use crate::interrupt::InterruptSource;
use crate::port::{Port, PortConfig};
use crate::request::{RequestCallback, RequestHandle};
use crate::timer::TimerQueue;
use crate::trace::DeviceTrace;
use log::debug;
use parking_lot::{ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// State shared by a registry, its ports and every handle it created.
pub(crate) struct RegistryShared {
    ports: RwLock<Vec<Arc<Port>>>,
    pub(crate) timers: TimerQueue,
    pub(crate) trace_lock: ReentrantMutex<()>,
    /// Trace settings of unconnected handles, inherited by new ports.
    pub(crate) default_trace: DeviceTrace,
    next_handle_id: AtomicU64,
}

impl RegistryShared {
    pub(crate) fn next_handle_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn find_port(&self, name: &str) -> Option<Arc<Port>> {
        self.ports
            .read()
            .iter()
            .find(|p| p.name() == name)
            .map(Arc::clone)
    }
}

/// Registry of ports.
///
/// Cloning is cheap and yields another reference to the same registry. Use
/// [`PortRegistry::global`] for the process-wide instance, or
/// [`PortRegistry::new`] for an isolated one (tests, embedded use).
///
/// Ports live as long as the process: there is no way to unregister one and
/// their worker threads are never joined.
#[derive(Clone)]
pub struct PortRegistry {
    shared: Arc<RegistryShared>,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRegistry {
    /// Creates an empty registry with its own timer thread and trace lock.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                ports: RwLock::new(Vec::new()),
                timers: TimerQueue::new(),
                trace_lock: ReentrantMutex::new(()),
                default_trace: DeviceTrace::default(),
                next_handle_id: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> &'static PortRegistry {
        static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PortRegistry::new)
    }

    /// Registers a port and starts its worker thread.
    ///
    /// # Errors
    /// `PortAlreadyRegistered` if the name is taken (the existing port is left
    /// untouched), or `Io` if the worker thread cannot be spawned.
    pub fn register_port(&self, name: &str, config: PortConfig) -> Result<()> {
        if config.priority_levels == 0 {
            return Err(Error::Generic(format!(
                "registerPort {}: priority_levels must be at least 1",
                name
            )));
        }
        let mut ports = self.shared.ports.write();
        if ports.iter().any(|p| p.name() == name) {
            return Err(Error::PortAlreadyRegistered(name.to_string()));
        }
        let port = Arc::new(Port::new(name, config));
        let handle = self.create_internal_handle()?;
        handle.connect_to(&port, consts::PORT_ADDR)?;
        port.spawn_worker(handle)?;
        ports.push(port);
        debug!("Registered port '{}'", name);
        Ok(())
    }

    /// Adds a port-wide interface binding, replacing one of the same kind.
    pub fn register_interface(&self, port: &str, interface: Interface) -> Result<()> {
        self.port(port)?.register_interface(interface);
        Ok(())
    }

    /// Registers interface overrides for one address of a port.
    ///
    /// # Errors
    /// `ProcessModuleExists` if that address already has a process module.
    pub fn register_process_module(
        &self,
        module: &str,
        port: &str,
        addr: i32,
        interfaces: Vec<Interface>,
    ) -> Result<()> {
        self.port(port)?
            .register_process_module(module, addr, interfaces, &self.shared.default_trace)
    }

    /// Makes `kind` on `port` an interrupt source that clients can add
    /// themselves to.
    ///
    /// # Errors
    /// `InterfaceNotFound` if the port has no such interface, or
    /// `InterruptSourceExists` if it already is a source.
    pub fn register_interrupt_source(&self, port: &str, kind: &InterfaceKind) -> Result<InterruptSource> {
        self.port(port)?.register_interrupt_source(kind)
    }

    /// Looks up a port-wide interface without a connected handle.
    pub fn find_port_interface(&self, port: &str, kind: &InterfaceKind) -> Result<Interface> {
        self.port(port)?
            .interface(kind)
            .ok_or_else(|| Error::InterfaceNotFound {
                port: port.to_string(),
                kind: kind.to_string(),
            })
    }

    /// Creates a request handle whose completion callback is `queue`.
    pub fn create_request_handle<F>(&self, queue: F) -> Result<RequestHandle>
    where
        F: Fn(&RequestHandle) + Send + Sync + 'static,
    {
        RequestHandle::new(Arc::clone(&self.shared), Some(Box::new(queue)), None)
    }

    /// Like [`create_request_handle`](Self::create_request_handle), with a
    /// callback run instead of `queue` when a queued request times out.
    pub fn create_request_handle_with_timeout<F, T>(
        &self,
        queue: F,
        timeout: T,
    ) -> Result<RequestHandle>
    where
        F: Fn(&RequestHandle) + Send + Sync + 'static,
        T: Fn(&RequestHandle) + Send + Sync + 'static,
    {
        let timeout: RequestCallback = Box::new(timeout);
        RequestHandle::new(Arc::clone(&self.shared), Some(Box::new(queue)), Some(timeout))
    }

    /// A handle that can be connected, locked and traced but never queued.
    pub(crate) fn create_internal_handle(&self) -> Result<RequestHandle> {
        RequestHandle::new(Arc::clone(&self.shared), None, None)
    }

    /// Asks the port's worker to disconnect (if connected) and connect again.
    pub fn reconnect(&self, port: &str) -> Result<()> {
        self.port(port)?.request_reconnect();
        Ok(())
    }

    /// Names of all registered ports, in registration order.
    pub fn port_names(&self) -> Vec<String> {
        self.shared
            .ports
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    pub(crate) fn ports(&self) -> Vec<Arc<Port>> {
        self.shared.ports.read().clone()
    }

    fn port(&self, name: &str) -> Result<Arc<Port>> {
        self.shared
            .find_port(name)
            .ok_or_else(|| Error::PortNotFound(name.to_string()))
    }
}
