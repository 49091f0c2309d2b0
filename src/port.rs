//! Ports: priority queues, the device table and the worker thread that
//! drains the queues.

use crate::consts;
use crate::device::{Device, DeviceState, ProcessModule};
use crate::error::{Error, Result};
use crate::exception::Exception;
use crate::interface::{self, Common, Interface, InterfaceKind};
use crate::interrupt::InterruptSource;
use crate::request::{HandleInner, RequestHandle};
use crate::trace::{DeviceTrace, TraceMask};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

/// Parameters of [`PortRegistry::register_port`](crate::PortRegistry::register_port).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    /// Number of priority queues. Valid priorities are `0..priority_levels`.
    pub priority_levels: usize,
    /// Connect through the port's [`Common`] interface when the worker
    /// starts and whenever a `Common` binding is registered.
    pub auto_connect: bool,
    /// Scheduling priority hint for the worker thread. Recorded and reported
    /// only; threads are spawned with the platform default priority.
    pub thread_priority: u32,
    /// Worker stack size in bytes, 0 for the platform default.
    pub stack_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            priority_levels: consts::DEFAULT_PRIORITY_LEVELS,
            auto_connect: true,
            thread_priority: consts::DEFAULT_THREAD_PRIORITY,
            stack_size: consts::DEFAULT_STACK_SIZE,
        }
    }
}

impl PortConfig {
    /// Same as [`PortConfig::default`]: three priority levels, auto-connect
    /// on, platform stack size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of priority queues; must be at least 1.
    pub fn with_priority_levels(mut self, levels: usize) -> Self {
        self.priority_levels = levels;
        self
    }

    /// Sets the initial auto-connect setting of the port and its devices.
    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_thread_priority(mut self, priority: u32) -> Self {
        self.thread_priority = priority;
        self
    }

    /// Sets the worker stack size in bytes; 0 keeps the platform default.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }
}

/// Queue priority level. Higher levels are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(usize);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);

    /// Priority at an arbitrary level, for ports with more than three queues.
    pub const fn new(level: usize) -> Self {
        Priority(level)
    }

    /// Index of the queue this priority selects.
    pub fn level(self) -> usize {
        self.0
    }
}

impl From<usize> for Priority {
    fn from(level: usize) -> Self {
        Priority(level)
    }
}

/// Binary wake-up signal for the worker thread.
struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            signalled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
        *signalled = false;
    }
}

pub(crate) struct QueueEntry {
    pub(crate) handle: Arc<HandleInner>,
    pub(crate) slot: usize,
}

/// Everything the port mutex guards.
pub(crate) struct PortState {
    pub(crate) queues: Vec<VecDeque<QueueEntry>>,
    pub(crate) devices: Vec<DeviceState>,
    connect_pending: bool,
    reconnect_pending: bool,
}

impl PortState {
    pub(crate) fn queued_count(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn port_device(&self) -> Option<&DeviceState> {
        self.devices.iter().find(|d| d.device.addr() == consts::PORT_ADDR)
    }

    /// A disabled port device holds back every queued request.
    pub(crate) fn port_enabled(&self) -> bool {
        self.port_device().map_or(true, |d| d.enabled)
    }

    fn port_auto_connect(&self, default: bool) -> bool {
        self.port_device().map_or(default, |d| d.auto_connect)
    }

    /// Removes the entry queued by `handle`, if any.
    pub(crate) fn remove_entry(&mut self, handle: &Arc<HandleInner>) -> bool {
        for queue in self.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|e| Arc::ptr_eq(&e.handle, handle)) {
                queue.remove(pos);
                return true;
            }
        }
        false
    }
}

pub(crate) struct Port {
    name: String,
    config: PortConfig,
    thread_name: String,
    pub(crate) state: Mutex<PortState>,
    wake: Event,
    interfaces: RwLock<Vec<Interface>>,
    interrupts: RwLock<Vec<InterruptSource>>,
}

impl Port {
    pub(crate) fn new(name: &str, config: PortConfig) -> Self {
        let queues = (0..config.priority_levels).map(|_| VecDeque::new()).collect();
        Self {
            name: name.to_string(),
            thread_name: format!("asyn-{}", name),
            state: Mutex::new(PortState {
                queues,
                devices: Vec::new(),
                connect_pending: config.auto_connect,
                reconnect_pending: false,
            }),
            config,
            wake: Event::new(),
            interfaces: RwLock::new(Vec::new()),
            interrupts: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &PortConfig {
        &self.config
    }

    pub(crate) fn wake(&self) {
        self.wake.signal();
    }

    /// Looks up the device for `addr`, creating it on first use.
    ///
    /// A new device copies the trace settings of the port device (address
    /// -1), or `defaults` when that does not exist yet.
    pub(crate) fn device_slot(&self, addr: i32, defaults: &DeviceTrace) -> (Arc<Device>, usize) {
        let mut state = self.state.lock();
        if let Some(slot) = state.devices.iter().position(|d| d.device.addr() == addr) {
            return (Arc::clone(&state.devices[slot].device), slot);
        }
        let parent = state
            .devices
            .iter()
            .find(|d| d.device.addr() == consts::PORT_ADDR)
            .map(|d| Arc::clone(&d.device));
        let trace = match &parent {
            Some(port_device) => DeviceTrace::inherit(&port_device.trace),
            None => DeviceTrace::inherit(defaults),
        };
        let auto_connect = state.port_auto_connect(self.config.auto_connect);
        let device = Arc::new(Device::new(addr, trace));
        state
            .devices
            .push(DeviceState::new(Arc::clone(&device), auto_connect));
        debug!("Port '{}' created device entry for addr {}", self.name, addr);
        (device, state.devices.len() - 1)
    }

    pub(crate) fn register_interface(&self, interface: Interface) {
        let is_common = matches!(interface, Interface::Common(_));
        debug!("Port '{}' registering {}", self.name, interface.kind());
        interface::upsert(&mut self.interfaces.write(), interface);
        if is_common {
            let connect = {
                let mut state = self.state.lock();
                let auto_connect = state.port_auto_connect(self.config.auto_connect);
                state.connect_pending |= auto_connect;
                auto_connect
            };
            if connect {
                self.wake();
            }
        }
    }

    pub(crate) fn interface(&self, kind: &InterfaceKind) -> Option<Interface> {
        interface::find(&self.interfaces.read(), kind)
    }

    pub(crate) fn common(&self) -> Option<Arc<dyn Common>> {
        self.interface(&InterfaceKind::Common)
            .and_then(|i| i.as_common().cloned())
    }

    /// Creates the interrupt source for a registered port-wide interface.
    pub(crate) fn register_interrupt_source(&self, kind: &InterfaceKind) -> Result<InterruptSource> {
        if self.interface(kind).is_none() {
            return Err(Error::InterfaceNotFound {
                port: self.name.clone(),
                kind: kind.to_string(),
            });
        }
        let mut sources = self.interrupts.write();
        if sources.iter().any(|s| s.kind() == kind) {
            return Err(Error::InterruptSourceExists {
                port: self.name.clone(),
                kind: kind.to_string(),
            });
        }
        let source = InterruptSource::new(&self.name, kind.clone());
        sources.push(source.clone());
        debug!("Port '{}' registered interrupt source for {}", self.name, kind);
        Ok(source)
    }

    pub(crate) fn interrupt_source(&self, kind: &InterfaceKind) -> Option<InterruptSource> {
        self.interrupts.read().iter().find(|s| s.kind() == kind).cloned()
    }

    pub(crate) fn register_process_module(
        &self,
        module: &str,
        addr: i32,
        interfaces: Vec<Interface>,
        defaults: &DeviceTrace,
    ) -> Result<()> {
        let (_, slot) = self.device_slot(addr, defaults);
        let mut state = self.state.lock();
        let device = &mut state.devices[slot];
        if let Some(existing) = &device.process_module {
            return Err(Error::ProcessModuleExists {
                port: self.name.clone(),
                addr,
                module: existing.name.clone(),
            });
        }
        let mut bindings = Vec::new();
        for interface in interfaces {
            interface::upsert(&mut bindings, interface);
        }
        device.process_module = Some(ProcessModule {
            name: module.to_string(),
            interfaces: bindings,
        });
        debug!("Port '{}' addr {} registered process module '{}'", self.name, addr, module);
        Ok(())
    }

    /// Looks up a process-module binding for the device in `slot`.
    pub(crate) fn module_interface(&self, slot: usize, kind: &InterfaceKind) -> Option<Interface> {
        let state = self.state.lock();
        let found = state
            .devices
            .get(slot)
            .and_then(|d| d.process_module.as_ref())
            .and_then(|m| interface::find(&m.interfaces, kind));
        found
    }

    pub(crate) fn set_enabled(&self, slot: usize, enabled: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(slot) {
            device.enabled = enabled;
        }
        debug!("Port '{}' device slot {} enabled {}", self.name, slot, enabled);
        self.wake();
    }

    /// Turning auto-connect on for a disconnected port device schedules a
    /// connect attempt.
    pub(crate) fn set_auto_connect(&self, slot: usize, auto_connect: bool) {
        let connect = {
            let mut state = self.state.lock();
            let Some(device) = state.devices.get_mut(slot) else {
                return;
            };
            device.auto_connect = auto_connect;
            let connect =
                auto_connect && !device.connected && device.device.addr() == consts::PORT_ADDR;
            state.connect_pending |= connect;
            connect
        };
        debug!("Port '{}' device slot {} autoConnect {}", self.name, slot, auto_connect);
        if connect {
            self.wake();
        }
    }

    pub(crate) fn request_reconnect(&self) {
        self.state.lock().reconnect_pending = true;
        self.wake();
    }

    /// Calls every exception callback registered on the device in `slot`.
    /// The callbacks run without the port mutex held.
    pub(crate) fn exception_occurred(&self, slot: usize, exception: Exception) {
        let users: Vec<_> = {
            let state = self.state.lock();
            match state.devices.get(slot) {
                Some(device) => device
                    .exception_users
                    .iter()
                    .map(|u| (u.handle.clone(), Arc::clone(&u.callback)))
                    .collect(),
                None => Vec::new(),
            }
        };
        trace!(
            "Port '{}' {} for {} exception user(s)",
            self.name,
            exception,
            users.len()
        );
        for (handle, callback) in users {
            if let Some(inner) = handle.upgrade() {
                callback(&RequestHandle::from_inner(inner), exception);
            }
        }
    }

    pub(crate) fn spawn_worker(self: &Arc<Self>, handle: RequestHandle) -> Result<()> {
        let mut builder = thread::Builder::new().name(self.thread_name.clone());
        if self.config.stack_size > 0 {
            builder = builder.stack_size(self.config.stack_size);
        }
        let port = Arc::clone(self);
        builder.spawn(move || port.run(handle))?;
        debug!(
            "Port '{}' worker thread '{}' spawned (priority hint {})",
            self.name, self.thread_name, self.config.thread_priority
        );
        Ok(())
    }

    fn run(self: Arc<Self>, handle: RequestHandle) {
        debug!("Port '{}' worker thread started", self.name);
        loop {
            self.manage_connection(&handle);
            while let Some(entry) = self.next_request() {
                trace!("Port '{}' dispatching request", self.name);
                RequestHandle::from_inner(entry.handle).dispatch();
            }
            self.wake.wait();
        }
    }

    /// Runs a pending connect or reconnect through the port's own handle.
    fn manage_connection(&self, handle: &RequestHandle) {
        let (connect, reconnect) = {
            let mut state = self.state.lock();
            if !state.port_enabled() {
                return;
            }
            let auto_connect = state.port_auto_connect(self.config.auto_connect);
            (
                std::mem::take(&mut state.connect_pending) && auto_connect,
                std::mem::take(&mut state.reconnect_pending),
            )
        };
        if !connect && !reconnect {
            return;
        }
        let Some(common) = self.common() else {
            debug!("Port '{}' has no {} interface yet", self.name, InterfaceKind::Common);
            return;
        };
        if reconnect && handle.is_connected() {
            match common.disconnect(handle) {
                Ok(()) => {
                    if handle.is_connected() {
                        let _ = handle.exception_disconnect();
                    }
                }
                Err(e) => {
                    warn!("Port '{}' disconnect failed: {}", self.name, e);
                    handle.trace_print(
                        TraceMask::ERROR,
                        format_args!("{} disconnect failed: {}\n", self.name, e),
                    );
                }
            }
        }
        if handle.is_connected() {
            return;
        }
        match common.connect(handle) {
            Ok(()) => {
                if !handle.is_connected() {
                    let _ = handle.exception_connect();
                }
                debug!("Port '{}' connected", self.name);
            }
            Err(e) => {
                warn!("Port '{}' connect failed: {}", self.name, e);
                handle.set_error_message(&e);
                handle.trace_print(
                    TraceMask::ERROR,
                    format_args!("{} connect failed: {}\n", self.name, e),
                );
            }
        }
    }

    /// Takes the highest-priority request whose device is enabled and not
    /// locked by another handle.
    fn next_request(&self) -> Option<QueueEntry> {
        let mut guard = self.state.lock();
        if !guard.port_enabled() {
            return None;
        }
        let PortState { queues, devices, .. } = &mut *guard;
        for queue in queues.iter_mut().rev() {
            let Some(pos) = queue
                .iter()
                .position(|e| devices[e.slot].eligible(e.handle.id()))
            else {
                continue;
            };
            let entry = queue.remove(pos)?;
            entry.handle.mark_dispatched(&mut devices[entry.slot]);
            return Some(entry);
        }
        None
    }

    pub(crate) fn report(&self, out: &mut dyn Write, details: i32) -> io::Result<()> {
        let (queued, connected, enabled, auto_connect, devices) = {
            let state = self.state.lock();
            let connected = state.port_device().is_some_and(|d| d.connected);
            let enabled = state.port_enabled();
            let auto_connect = state.port_auto_connect(self.config.auto_connect);
            let devices: Vec<_> = state
                .devices
                .iter()
                .map(|d| {
                    let module = d.process_module.as_ref().map(|m| {
                        let kinds: Vec<String> =
                            m.interfaces.iter().map(|i| i.kind().to_string()).collect();
                        (m.name.clone(), kinds)
                    });
                    let flags = [d.connected, d.enabled, d.auto_connect, d.lock_holder.is_some()];
                    (Arc::clone(&d.device), flags, module)
                })
                .collect();
            (state.queued_count(), connected, enabled, auto_connect, devices)
        };
        writeln!(
            out,
            "{} thread {} priority {} connected {} enabled {} autoConnect {}",
            self.name,
            self.thread_name,
            self.config.thread_priority,
            yes_no(connected),
            yes_no(enabled),
            yes_no(auto_connect)
        )?;
        writeln!(
            out,
            "    priority levels {} devices {} queued requests {}",
            self.config.priority_levels,
            devices.len(),
            queued
        )?;
        let kinds: Vec<String> = self
            .interfaces
            .read()
            .iter()
            .map(|i| i.kind().to_string())
            .collect();
        writeln!(out, "    interfaces: {}", kinds.join(" "))?;
        let sources: Vec<String> = self
            .interrupts
            .read()
            .iter()
            .map(|s| format!("{}({})", s.kind(), s.user_count()))
            .collect();
        if !sources.is_empty() {
            writeln!(out, "    interrupt sources: {}", sources.join(" "))?;
        }
        if details >= 1 {
            for (device, [connected, enabled, auto_connect, locked], module) in &devices {
                writeln!(
                    out,
                    "    addr {} connected {} enabled {} autoConnect {} locked {} traceMask {:#x} traceIOMask {:#x} truncateSize {}",
                    device.addr(),
                    yes_no(*connected),
                    yes_no(*enabled),
                    yes_no(*auto_connect),
                    yes_no(*locked),
                    device.trace.mask().bits(),
                    device.trace.io_mask().bits(),
                    device.trace.truncate_size()
                )?;
                if let Some((name, kinds)) = module {
                    writeln!(out, "        process module {}: {}", name, kinds.join(" "))?;
                }
            }
        }
        if let Some(common) = self.common() {
            common.report(out, details)?;
        }
        Ok(())
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}
