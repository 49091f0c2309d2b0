//! Request handles: the per-caller context used to queue work on a port,
//! hold a device's exclusive lock and emit trace output.

use crate::consts;
use crate::device::{Device, DeviceState, ExceptionUser};
use crate::error::{self, Error, FreeError, Result};
use crate::exception::Exception;
use crate::interface::{Interface, InterfaceKind};
use crate::interrupt::{InterruptSource, InterruptUserId};
use crate::port::{Port, Priority, QueueEntry};
use crate::registry::RegistryShared;
use crate::timer::{Timer, TimerCallback};
use crate::trace::{self, TraceFile, TraceIoMask, TraceMask};
use log::{debug, trace, warn};
use parking_lot::{Mutex, ReentrantMutexGuard};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Completion or timeout callback of a request handle.
pub type RequestCallback = Box<dyn Fn(&RequestHandle) + Send + Sync>;

#[derive(Clone)]
struct Binding {
    port: Arc<Port>,
    device: Arc<Device>,
    slot: usize,
}

pub(crate) struct HandleInner {
    id: u64,
    shared: Arc<RegistryShared>,
    queue_callback: Option<RequestCallback>,
    timeout_callback: Option<RequestCallback>,
    timer: Option<Timer>,
    binding: Mutex<Option<Binding>>,
    // Both only change under the bound port's mutex.
    is_queued: AtomicBool,
    lock_count: AtomicU32,
    error_message: Mutex<String>,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    io_timeout: Mutex<Duration>,
}

impl HandleInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Bookkeeping when the worker takes this handle's entry off a queue.
    pub(crate) fn mark_dispatched(&self, device: &mut DeviceState) {
        self.is_queued.store(false, Ordering::Release);
        if self.lock_count.load(Ordering::Acquire) > 0 {
            device.lock_holder = Some(self.id);
        }
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}

impl Drop for HandleInner {
    /// A handle dropped while still bound gives up its device lock and its
    /// exception callback.
    fn drop(&mut self) {
        let Some(binding) = self.binding.get_mut().take() else {
            return;
        };
        let (released, callbacks) = {
            let mut state = binding.port.state.lock();
            let device = &mut state.devices[binding.slot];
            let users = std::mem::take(&mut device.exception_users);
            let (mine, others): (Vec<_>, Vec<_>) =
                users.into_iter().partition(|u| u.id == self.id);
            device.exception_users = others;
            let released = device.lock_holder == Some(self.id);
            if released {
                device.lock_holder = None;
            }
            (released, mine)
        };
        // Dropped outside the port mutex: a callback may own another handle.
        drop(callbacks);
        warn!(
            "Request handle {} dropped while connected to port '{}' addr {}{}",
            self.id,
            binding.port.name(),
            binding.device.addr(),
            if released { ", device lock released" } else { "" }
        );
        if released {
            binding.port.wake();
        }
    }
}

/// A caller's context for queueing requests on one device.
///
/// Created by [`PortRegistry::create_request_handle`](crate::PortRegistry::create_request_handle),
/// bound with [`connect_device`](Self::connect_device) and released with
/// [`free`](Self::free). Callbacks receive a reference to the handle they
/// were registered on and may call back into it (queue again, unlock).
pub struct RequestHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.inner.id)
            .field("is_queued", &self.is_queued())
            .field("lock_count", &self.lock_count())
            .finish()
    }
}

impl RequestHandle {
    pub(crate) fn new(
        shared: Arc<RegistryShared>,
        queue_callback: Option<RequestCallback>,
        timeout_callback: Option<RequestCallback>,
    ) -> Result<Self> {
        let id = shared.next_handle_id();
        let mut timer_error = None;
        let inner = Arc::new_cyclic(|weak: &Weak<HandleInner>| {
            let timer = match &timeout_callback {
                Some(_) => {
                    let weak = weak.clone();
                    let fired: TimerCallback =
                        Arc::new(move |generation: u64| timeout_fired(&weak, generation));
                    match shared.timers.create_timer(fired) {
                        Ok(timer) => Some(timer),
                        Err(e) => {
                            timer_error = Some(e);
                            None
                        }
                    }
                }
                None => None,
            };
            HandleInner {
                id,
                shared,
                queue_callback,
                timeout_callback,
                timer,
                binding: Mutex::new(None),
                is_queued: AtomicBool::new(false),
                lock_count: AtomicU32::new(0),
                error_message: Mutex::new(String::new()),
                user_data: Mutex::new(None),
                io_timeout: Mutex::new(consts::DEFAULT_IO_TIMEOUT),
            }
        });
        if let Some(e) = timer_error {
            return Err(e);
        }
        trace!("Created request handle {}", id);
        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn dispatch(&self) {
        if let Some(callback) = &self.inner.queue_callback {
            callback(self);
        }
    }

    // --- Lifecycle ---

    /// Binds the handle to `addr` on `port`, creating the device entry on
    /// first use. Address -1 means the port itself.
    ///
    /// # Errors
    /// `PortNotFound`, or `AlreadyConnected` if the handle is already bound.
    pub fn connect_device(&self, port: &str, addr: i32) -> Result<()> {
        match self.inner.shared.find_port(port) {
            Some(port) => self.connect_to(&port, addr),
            None => self.fail(None, Error::PortNotFound(port.to_string())),
        }
    }

    pub(crate) fn connect_to(&self, port: &Arc<Port>, addr: i32) -> Result<()> {
        let mut guard = self.inner.binding.lock();
        if let Some(binding) = guard.as_ref() {
            let error = Error::AlreadyConnected {
                port: binding.port.name().to_string(),
                addr: binding.device.addr(),
            };
            return self.fail(Some(binding), error);
        }
        let (device, slot) = port.device_slot(addr, &self.inner.shared.default_trace);
        *guard = Some(Binding {
            port: Arc::clone(port),
            device,
            slot,
        });
        debug!("Handle {} connected to port '{}' addr {}", self.inner.id, port.name(), addr);
        Ok(())
    }

    /// Unbinds the handle from its device.
    ///
    /// # Errors
    /// Fails without side effects if the handle is not connected, is queued,
    /// holds a lock, or still has an exception callback registered.
    pub fn disconnect_device(&self) -> Result<()> {
        const OP: &str = "disconnectDevice";
        let mut guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: OP });
        };
        let error = {
            let state = binding.port.state.lock();
            let count = self.lock_count();
            if self.is_queued() {
                Some(Error::AlreadyQueued { op: OP })
            } else if count > 0 {
                Some(Error::AlreadyLocked { op: OP, count })
            } else if state.devices[binding.slot]
                .exception_users
                .iter()
                .any(|u| u.id == self.inner.id)
            {
                Some(Error::ExceptionCallbackRegistered { op: OP })
            } else {
                None
            }
        };
        if let Some(error) = error {
            return self.fail(Some(binding), error);
        }
        debug!(
            "Handle {} disconnected from port '{}' addr {}",
            self.inner.id,
            binding.port.name(),
            binding.device.addr()
        );
        *guard = None;
        Ok(())
    }

    /// Releases the handle.
    ///
    /// A still-connected handle is returned unchanged inside the error.
    pub fn free(self) -> std::result::Result<(), FreeError> {
        let bound = self
            .inner
            .binding
            .lock()
            .as_ref()
            .map(|b| (b.port.name().to_string(), b.device.addr()));
        if let Some((port, addr)) = bound {
            let error = error::still_connected(&port, addr);
            self.set_error_message(&error);
            warn!("freeRequestHandle: {}", error);
            return Err(FreeError {
                handle: self,
                error,
            });
        }
        trace!("Freed request handle {}", self.inner.id);
        Ok(())
    }

    /// Finds an interface for the bound device.
    ///
    /// With `allow_process_module`, a binding registered for this exact
    /// address wins over the port-wide one.
    pub fn find_interface(&self, kind: &InterfaceKind, allow_process_module: bool) -> Result<Interface> {
        let binding = self.binding("findInterface")?;
        if allow_process_module {
            if let Some(found) = binding.port.module_interface(binding.slot, kind) {
                return Ok(found);
            }
        }
        binding.port.interface(kind).ok_or_else(|| {
            let error = Error::InterfaceNotFound {
                port: binding.port.name().to_string(),
                kind: kind.to_string(),
            };
            self.set_error_message(&error);
            error
        })
    }

    // --- Queueing ---

    /// Queues a request on the bound port; the completion callback runs later
    /// on the port's worker thread.
    ///
    /// If this handle currently holds the device's lock the request goes to
    /// the front of its priority queue. A non-zero `timeout` arms the handle's
    /// timer; when it expires before dispatch the timeout callback runs
    /// instead of the completion callback.
    pub fn queue_request(&self, priority: Priority, timeout: Option<Duration>) -> Result<()> {
        const OP: &str = "queueRequest";
        let guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: OP });
        };
        if self.inner.queue_callback.is_none() {
            return self.fail(Some(binding), Error::MissingCallback);
        }
        let levels = binding.port.config().priority_levels;
        if priority.level() >= levels {
            let error = Error::InvalidPriority {
                priority: priority.level(),
                port: binding.port.name().to_string(),
                levels,
            };
            return self.fail(Some(binding), error);
        }
        let front = {
            let mut state = binding.port.state.lock();
            if self.is_queued() {
                None
            } else {
                let front = state.devices[binding.slot].lock_holder == Some(self.inner.id);
                let entry = QueueEntry {
                    handle: Arc::clone(&self.inner),
                    slot: binding.slot,
                };
                let queue = &mut state.queues[priority.level()];
                if front {
                    queue.push_front(entry);
                } else {
                    queue.push_back(entry);
                }
                self.inner.is_queued.store(true, Ordering::Release);
                match (timeout, &self.inner.timer) {
                    (Some(delay), Some(timer)) if !delay.is_zero() => {
                        timer.start(delay);
                    }
                    (Some(delay), None) if !delay.is_zero() => {
                        warn!(
                            "queueRequest: handle {} has no timeout callback, ignoring timeout {:?}",
                            self.inner.id, delay
                        );
                    }
                    _ => {}
                }
                Some(front)
            }
        };
        let Some(front) = front else {
            return self.fail(Some(binding), Error::AlreadyQueued { op: OP });
        };
        binding.port.wake();
        trace!(
            "Handle {} queued on port '{}' priority {}{}",
            self.inner.id,
            binding.port.name(),
            priority.level(),
            if front { " (front)" } else { "" }
        );
        Ok(())
    }

    /// Removes the handle's pending request, if any.
    ///
    /// Returns `Ok(true)` if a queued request was removed (its completion
    /// callback will not run) and `Ok(false)` if nothing was queued, e.g.
    /// because dispatch already started.
    pub fn cancel_request(&self) -> Result<bool> {
        let guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: "cancelRequest" });
        };
        let removed = self.dequeue(binding, None);
        if removed {
            trace!("Handle {} request cancelled on port '{}'", self.inner.id, binding.port.name());
        }
        Ok(removed)
    }

    /// Removes this handle's queue entry. With a timer `generation`, only if
    /// the timer has not been re-armed or cancelled since that arming.
    fn dequeue(&self, binding: &Binding, generation: Option<u64>) -> bool {
        let mut state = binding.port.state.lock();
        if let (Some(generation), Some(timer)) = (generation, &self.inner.timer) {
            if !timer.is_current(generation) {
                return false;
            }
        }
        if !state.remove_entry(&self.inner) {
            return false;
        }
        self.inner.is_queued.store(false, Ordering::Release);
        if let Some(timer) = &self.inner.timer {
            timer.cancel();
        }
        true
    }

    // --- Locking ---

    /// Increments the lock count.
    ///
    /// The handle becomes the device's lock holder when its next queued
    /// request is dispatched.
    pub fn lock(&self) -> Result<()> {
        const OP: &str = "lock";
        let guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: OP });
        };
        let locked = {
            let _state = binding.port.state.lock();
            if self.is_queued() {
                false
            } else {
                self.inner.lock_count.fetch_add(1, Ordering::AcqRel);
                true
            }
        };
        if !locked {
            return self.fail(Some(binding), Error::AlreadyQueued { op: OP });
        }
        trace!("Handle {} lock count {}", self.inner.id, self.lock_count());
        Ok(())
    }

    /// Decrements the lock count. When it reaches zero and this handle holds
    /// the device, the device is released and the worker is woken.
    pub fn unlock(&self) -> Result<()> {
        const OP: &str = "unlock";
        let guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: OP });
        };
        let outcome = {
            let mut state = binding.port.state.lock();
            if self.is_queued() {
                Err(Error::AlreadyQueued { op: OP })
            } else if self.lock_count() == 0 {
                Err(Error::NotLocked)
            } else {
                let remaining = self.inner.lock_count.fetch_sub(1, Ordering::AcqRel) - 1;
                let device = &mut state.devices[binding.slot];
                if remaining == 0 && device.lock_holder == Some(self.inner.id) {
                    device.lock_holder = None;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        };
        match outcome {
            Ok(released) => {
                if released {
                    trace!(
                        "Handle {} released port '{}' addr {}",
                        self.inner.id,
                        binding.port.name(),
                        binding.device.addr()
                    );
                    binding.port.wake();
                }
                Ok(())
            }
            Err(error) => self.fail(Some(binding), error),
        }
    }

    // --- Exceptions ---

    /// Registers the handle's exception callback on its device.
    pub fn exception_callback_add<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(&RequestHandle, Exception) + Send + Sync + 'static,
    {
        const OP: &str = "exceptionCallbackAdd";
        let guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: OP });
        };
        let added = {
            let mut state = binding.port.state.lock();
            let users = &mut state.devices[binding.slot].exception_users;
            if users.iter().any(|u| u.id == self.inner.id) {
                false
            } else {
                users.push(ExceptionUser {
                    id: self.inner.id,
                    handle: Arc::downgrade(&self.inner),
                    callback: Arc::new(callback),
                });
                true
            }
        };
        if !added {
            return self.fail(Some(binding), Error::ExceptionCallbackRegistered { op: OP });
        }
        Ok(())
    }

    /// Unregisters the handle's exception callback.
    ///
    /// # Errors
    /// `NotConnected`, or `NoExceptionCallback` if none was registered.
    pub fn exception_callback_remove(&self) -> Result<()> {
        let guard = self.inner.binding.lock();
        let Some(binding) = guard.as_ref() else {
            return self.fail(None, Error::NotConnected { op: "exceptionCallbackRemove" });
        };
        let removed = {
            let mut state = binding.port.state.lock();
            let users = &mut state.devices[binding.slot].exception_users;
            let before = users.len();
            users.retain(|u| u.id != self.inner.id);
            users.len() != before
        };
        if !removed {
            return self.fail(Some(binding), Error::NoExceptionCallback);
        }
        Ok(())
    }

    /// Reports that the bound device (or port, at address -1) is now connected.
    pub fn exception_connect(&self) -> Result<()> {
        self.set_connected(true, "exceptionConnect")
    }

    /// Reports that the bound device (or port) is now disconnected.
    pub fn exception_disconnect(&self) -> Result<()> {
        self.set_connected(false, "exceptionDisconnect")
    }

    fn set_connected(&self, connected: bool, op: &'static str) -> Result<()> {
        let binding = self.binding(op)?;
        let changed = {
            let mut state = binding.port.state.lock();
            let device = &mut state.devices[binding.slot];
            let changed = device.connected != connected;
            device.connected = connected;
            changed
        };
        if !changed {
            let port = binding.port.name().to_string();
            let addr = binding.device.addr();
            let error = if connected {
                Error::TransportAlreadyConnected { port, addr }
            } else {
                Error::TransportNotConnected { port, addr }
            };
            return self.fail(Some(&binding), error);
        }
        debug!(
            "Port '{}' addr {} {}",
            binding.port.name(),
            binding.device.addr(),
            if connected { "connected" } else { "disconnected" }
        );
        binding.port.exception_occurred(binding.slot, Exception::Connect);
        Ok(())
    }

    /// Whether the bound device is connected. False when unbound.
    pub fn is_connected(&self) -> bool {
        let Some(binding) = self.current_binding() else {
            return false;
        };
        let state = binding.port.state.lock();
        let connected = state.devices[binding.slot].connected;
        connected
    }

    /// Enables or disables the bound device; at address -1 the whole port.
    ///
    /// Requests for a disabled device stay queued and are dispatched once it
    /// is enabled again.
    pub fn enable(&self, enabled: bool) -> Result<()> {
        let binding = self.binding("enable")?;
        binding.port.set_enabled(binding.slot, enabled);
        binding.port.exception_occurred(binding.slot, Exception::Enable);
        Ok(())
    }

    /// Whether the bound device is enabled. False when unbound.
    pub fn is_enabled(&self) -> bool {
        let Some(binding) = self.current_binding() else {
            return false;
        };
        let state = binding.port.state.lock();
        let enabled = state.devices[binding.slot].enabled;
        enabled
    }

    /// Turns auto-connect on or off for the bound device. Devices created
    /// later on the port start with the port device's setting.
    ///
    /// Switching it on for a disconnected port makes the worker connect
    /// through the port's [`Common`](crate::Common) interface.
    pub fn set_auto_connect(&self, auto_connect: bool) -> Result<()> {
        let binding = self.binding("autoConnect")?;
        binding.port.set_auto_connect(binding.slot, auto_connect);
        binding.port.exception_occurred(binding.slot, Exception::AutoConnect);
        Ok(())
    }

    pub fn is_auto_connect(&self) -> bool {
        let Some(binding) = self.current_binding() else {
            return false;
        };
        let state = binding.port.state.lock();
        let auto_connect = state.devices[binding.slot].auto_connect;
        auto_connect
    }

    // --- Interrupts ---

    /// The interrupt source for `kind` on the bound port.
    ///
    /// # Errors
    /// `InterfaceNotFound` if the port has no such interface,
    /// `NoInterruptSource` if the driver never registered it as a source.
    pub fn interrupt_source(&self, kind: &InterfaceKind) -> Result<InterruptSource> {
        let binding = self.binding("getInterruptPvt")?;
        let port = binding.port.name().to_string();
        if binding.port.interface(kind).is_none() {
            let error = Error::InterfaceNotFound {
                port,
                kind: kind.to_string(),
            };
            return self.fail(Some(&binding), error);
        }
        match binding.port.interrupt_source(kind) {
            Some(source) => Ok(source),
            None => {
                let error = Error::NoInterruptSource {
                    port,
                    kind: kind.to_string(),
                };
                self.fail(Some(&binding), error)
            }
        }
    }

    /// Adds this handle to `source`. The callback runs on the driver's thread
    /// for each walk that includes it.
    ///
    /// While a walk is in progress the user joins the list when the walk ends.
    pub fn add_interrupt_user<F>(&self, source: &InterruptSource, callback: F) -> Result<InterruptUserId>
    where
        F: Fn(&RequestHandle, &dyn Any) + Send + Sync + 'static,
    {
        const OP: &str = "addInterruptUser";
        let binding = self.binding(OP)?;
        let bound_here = binding
            .port
            .interrupt_source(source.kind())
            .is_some_and(|s| s.same_source(source));
        if !bound_here {
            let error = Error::Generic(format!(
                "{}: handle is bound to port '{}', source belongs to port '{}'",
                OP,
                binding.port.name(),
                source.port_name()
            ));
            return self.fail(Some(&binding), error);
        }
        let id = source.insert(
            binding.device.addr(),
            Arc::downgrade(&self.inner),
            Arc::new(callback),
        );
        debug!("Handle {} added as interrupt user of {}", self.inner.id, source);
        Ok(id)
    }

    /// Removes a user added with [`add_interrupt_user`](Self::add_interrupt_user).
    /// During a walk the removal takes effect when the walk ends.
    ///
    /// # Errors
    /// `InterruptUserNotFound` if `id` is not on the list or is already
    /// being removed.
    pub fn remove_interrupt_user(&self, source: &InterruptSource, id: InterruptUserId) -> Result<()> {
        if !source.remove(id) {
            let binding = self.current_binding();
            return self.fail(binding.as_ref(), Error::InterruptUserNotFound);
        }
        debug!("Handle {} removed interrupt user from {}", self.inner.id, source);
        Ok(())
    }

    // --- Accessors ---

    /// Address of the bound device, or -1 if unconnected.
    pub fn addr(&self) -> i32 {
        self.current_binding()
            .map_or(consts::PORT_ADDR, |b| b.device.addr())
    }

    /// Name of the bound port.
    pub fn port_name(&self) -> Option<String> {
        self.current_binding().map(|b| b.port.name().to_string())
    }

    /// True between a successful `queue_request` and dispatch, cancel or
    /// timeout.
    pub fn is_queued(&self) -> bool {
        self.inner.is_queued.load(Ordering::Acquire)
    }

    /// Current re-entrant lock depth.
    pub fn lock_count(&self) -> u32 {
        self.inner.lock_count.load(Ordering::Acquire)
    }

    /// Text of the last error recorded on this handle.
    pub fn error_message(&self) -> String {
        self.inner.error_message.lock().clone()
    }

    /// Replaces the error message, truncated to fit the fixed-size buffer.
    pub fn set_error_message(&self, message: impl fmt::Display) {
        let mut text = message.to_string();
        let max = consts::ERROR_MESSAGE_SIZE - 1;
        if text.len() > max {
            let mut end = max;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        *self.inner.error_message.lock() = text;
    }

    /// Attaches caller-owned data, replacing any previous value.
    pub fn set_user_data<T: Any + Send + Sync>(&self, data: T) {
        *self.inner.user_data.lock() = Some(Arc::new(data));
    }

    /// Returns the attached data if it has type `T`.
    pub fn user_data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.inner.user_data.lock().clone()?;
        data.downcast::<T>().ok()
    }

    /// Per-I/O timeout for drivers. The core itself never reads it.
    pub fn timeout(&self) -> Duration {
        *self.inner.io_timeout.lock()
    }

    /// Sets the per-I/O timeout, see [`timeout`](Self::timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        *self.inner.io_timeout.lock() = timeout;
    }

    // --- Trace ---

    /// Trace reasons enabled on the bound device, or the registry default
    /// when unconnected.
    pub fn trace_mask(&self) -> TraceMask {
        match self.current_binding() {
            Some(b) => b.device.trace.mask(),
            None => self.inner.shared.default_trace.mask(),
        }
    }

    /// Sets the trace mask of the bound device. On an unconnected handle
    /// this sets the default inherited by ports registered afterwards.
    pub fn set_trace_mask(&self, mask: TraceMask) {
        self.update_trace(Exception::TraceMask, |t| t.set_mask(mask));
    }

    /// How I/O payloads are rendered by [`trace_print_io`](Self::trace_print_io).
    pub fn trace_io_mask(&self) -> TraceIoMask {
        match self.current_binding() {
            Some(b) => b.device.trace.io_mask(),
            None => self.inner.shared.default_trace.io_mask(),
        }
    }

    /// Raises [`Exception::TraceIoMask`] on a bound device.
    pub fn set_trace_io_mask(&self, mask: TraceIoMask) {
        self.update_trace(Exception::TraceIoMask, |t| t.set_io_mask(mask));
    }

    /// The device's trace sink; `None` means standard output.
    pub fn trace_file(&self) -> Option<TraceFile> {
        match self.current_binding() {
            Some(b) => b.device.trace.file(),
            None => self.inner.shared.default_trace.file(),
        }
    }

    /// Redirects trace output; `None` restores standard output.
    pub fn set_trace_file(&self, file: Option<TraceFile>) {
        self.update_trace(Exception::TraceFile, |t| t.set_file(file));
    }

    /// Maximum number of payload bytes dumped per I/O trace line.
    pub fn trace_io_truncate_size(&self) -> usize {
        match self.current_binding() {
            Some(b) => b.device.trace.truncate_size(),
            None => self.inner.shared.default_trace.truncate_size(),
        }
    }

    /// Raises [`Exception::TraceIoTruncateSize`] on a bound device.
    pub fn set_trace_io_truncate_size(&self, size: usize) {
        self.update_trace(Exception::TraceIoTruncateSize, |t| t.set_truncate_size(size));
    }

    /// Exception callbacks run after `apply`, with no lock held.
    fn update_trace(&self, exception: Exception, apply: impl FnOnce(&trace::DeviceTrace)) {
        match self.current_binding() {
            Some(binding) => {
                apply(&binding.device.trace);
                binding.port.exception_occurred(binding.slot, exception);
            }
            None => apply(&self.inner.shared.default_trace),
        }
    }

    /// Writes a trace line if `reason` is enabled on the bound device.
    /// Unconnected handles always write to standard output.
    ///
    /// Returns the number of bytes written. See also [`asyn_print!`](crate::asyn_print).
    pub fn trace_print(&self, reason: TraceMask, args: fmt::Arguments<'_>) -> usize {
        let binding = self.current_binding();
        trace::print(
            &self.inner.shared.trace_lock,
            binding.as_ref().map(|b| &b.device.trace),
            reason,
            args,
        )
    }

    /// Like [`trace_print`](Self::trace_print), followed by a dump of `data`
    /// rendered according to the device's I/O mask and truncate size.
    pub fn trace_print_io(&self, reason: TraceMask, data: &[u8], args: fmt::Arguments<'_>) -> usize {
        let binding = self.current_binding();
        trace::print_io(
            &self.inner.shared.trace_lock,
            binding.as_ref().map(|b| &b.device.trace),
            reason,
            data,
            args,
        )
    }

    /// Holds the global trace lock so several trace calls come out together.
    /// The lock is re-entrant: trace calls on this thread still proceed.
    pub fn trace_guard(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.shared.trace_lock.lock()
    }

    // --- Internal helpers ---

    fn current_binding(&self) -> Option<Binding> {
        self.inner.binding.lock().clone()
    }

    fn binding(&self, op: &'static str) -> Result<Binding> {
        match self.current_binding() {
            Some(binding) => Ok(binding),
            None => self.fail(None, Error::NotConnected { op }),
        }
    }

    /// Records `error` in the message buffer and, for a bound handle, emits
    /// an error trace line.
    fn fail<T>(&self, binding: Option<&Binding>, error: Error) -> Result<T> {
        self.set_error_message(&error);
        warn!("Handle {}: {}", self.inner.id, error);
        if let Some(binding) = binding {
            trace::print(
                &self.inner.shared.trace_lock,
                Some(&binding.device.trace),
                TraceMask::ERROR,
                format_args!(
                    "{} addr {} {}\n",
                    binding.port.name(),
                    binding.device.addr(),
                    error
                ),
            );
        }
        Err(error)
    }
}

fn timeout_fired(handle: &Weak<HandleInner>, generation: u64) {
    let Some(inner) = handle.upgrade() else {
        return;
    };
    let handle = RequestHandle::from_inner(inner);
    let Some(binding) = handle.current_binding() else {
        return;
    };
    if handle.dequeue(&binding, Some(generation)) {
        debug!(
            "Handle {} request timed out on port '{}'",
            handle.inner.id,
            binding.port.name()
        );
        if let Some(callback) = &handle.inner.timeout_callback {
            callback(&handle);
        }
    }
}
