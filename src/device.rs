//! Device entries: one per (port, address) pair that has been used.

use crate::exception::ExceptionCallback;
use crate::interface::Interface;
use crate::request::HandleInner;
use crate::trace::DeviceTrace;
use std::sync::{Arc, Weak};

/// The immutable part of a device, shared with bound request handles.
pub(crate) struct Device {
    addr: i32,
    pub(crate) trace: DeviceTrace,
}

impl Device {
    pub(crate) fn new(addr: i32, trace: DeviceTrace) -> Self {
        Self { addr, trace }
    }

    pub(crate) fn addr(&self) -> i32 {
        self.addr
    }
}

/// Per-device state guarded by the owning port's mutex.
pub(crate) struct DeviceState {
    pub(crate) device: Arc<Device>,
    /// Id of the handle holding the exclusive lock.
    pub(crate) lock_holder: Option<u64>,
    pub(crate) connected: bool,
    /// Requests for a disabled device stay queued.
    pub(crate) enabled: bool,
    pub(crate) auto_connect: bool,
    pub(crate) process_module: Option<ProcessModule>,
    pub(crate) exception_users: Vec<ExceptionUser>,
}

impl DeviceState {
    pub(crate) fn new(device: Arc<Device>, auto_connect: bool) -> Self {
        Self {
            device,
            lock_holder: None,
            connected: false,
            enabled: true,
            auto_connect,
            process_module: None,
            exception_users: Vec::new(),
        }
    }

    /// Whether a request from handle `id` may be dispatched now.
    pub(crate) fn eligible(&self, id: u64) -> bool {
        self.enabled && self.lock_holder.map_or(true, |holder| holder == id)
    }
}

/// Interface overrides registered for a single address.
pub(crate) struct ProcessModule {
    pub(crate) name: String,
    pub(crate) interfaces: Vec<Interface>,
}

pub(crate) struct ExceptionUser {
    pub(crate) id: u64,
    pub(crate) handle: Weak<HandleInner>,
    pub(crate) callback: ExceptionCallback,
}
