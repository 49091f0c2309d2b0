use crate::request::RequestHandle;
use thiserror::Error;

/// Errors that can occur when using the port manager.
///
/// Every fallible operation on a [`RequestHandle`] returns one of these and
/// also copies its rendered text into the handle's error-message buffer, so
/// callers that only keep the handle around can still inspect what went wrong.
#[derive(Error, Debug)]
pub enum Error {
    /// The operation needs a handle bound to a device, but it has none.
    #[error("{op}: request handle is not connected to a device")]
    NotConnected {
        /// Name of the operation that was attempted.
        op: &'static str,
    },
    /// The handle is already bound to a device.
    #[error("connectDevice: already connected to port '{port}' addr {addr}")]
    AlreadyConnected {
        /// Port the handle is currently bound to.
        port: String,
        /// Address the handle is currently bound to.
        addr: i32,
    },
    /// The handle already has an entry on one of the port queues.
    #[error("{op}: request handle is queued")]
    AlreadyQueued {
        /// Name of the operation that was attempted.
        op: &'static str,
    },
    /// The handle still holds (or has requested) the device lock.
    #[error("{op}: request handle is locked (lock count {count})")]
    AlreadyLocked {
        /// Name of the operation that was attempted.
        op: &'static str,
        /// Current re-entrant lock depth.
        count: u32,
    },
    /// `unlock` was called on a handle with a lock count of zero.
    #[error("unlock: request handle is not locked")]
    NotLocked,
    /// No port with the given name has been registered.
    #[error("port '{0}' not found")]
    PortNotFound(String),
    /// A port with the given name is already registered.
    #[error("port '{0}' already registered")]
    PortAlreadyRegistered(String),
    /// The requested interface is not registered for the port or device.
    #[error("interface '{kind}' not found for port '{port}'")]
    InterfaceNotFound {
        /// Port that was searched.
        port: String,
        /// Interface type name that was requested.
        kind: String,
    },
    /// The device already has a process module registered.
    #[error("port '{port}' addr {addr} already has process module '{module}' registered")]
    ProcessModuleExists {
        /// Port name.
        port: String,
        /// Device address.
        addr: i32,
        /// Name of the module that is already registered.
        module: String,
    },
    /// An interrupt source already exists for this interface of the port.
    #[error("registerInterruptSource: port '{port}' already has an interrupt source for '{kind}'")]
    InterruptSourceExists {
        /// Port name.
        port: String,
        /// Interface type name.
        kind: String,
    },
    /// The interface is registered but the driver offers no interrupts on it.
    #[error("port '{port}' does not support interrupts on interface '{kind}'")]
    NoInterruptSource {
        /// Port name.
        port: String,
        /// Interface type name.
        kind: String,
    },
    /// The interrupt user is not on the source's list, or its removal is
    /// already pending.
    #[error("removeInterruptUser: interrupt user is not registered")]
    InterruptUserNotFound,
    /// Queue priority is outside the levels configured for the port.
    #[error("priority {priority} out of range (port '{port}' has {levels} levels)")]
    InvalidPriority {
        /// Requested priority level.
        priority: usize,
        /// Port name.
        port: String,
        /// Number of priority levels on the port.
        levels: usize,
    },
    /// The handle was created without a queue callback and cannot be queued.
    #[error("queueRequest: request handle has no queue callback")]
    MissingCallback,
    /// An exception callback is registered (or must be removed first).
    #[error("{op}: exception callback already registered")]
    ExceptionCallbackRegistered {
        /// Name of the operation that was attempted.
        op: &'static str,
    },
    /// No exception callback is registered for this handle.
    #[error("exceptionCallbackRemove: no exception callback registered")]
    NoExceptionCallback,
    /// The transport reported a connect while already connected.
    #[error("port '{port}' addr {addr} is already connected")]
    TransportAlreadyConnected {
        /// Port name.
        port: String,
        /// Device address (-1 for the port itself).
        addr: i32,
    },
    /// The transport reported a disconnect while not connected.
    #[error("port '{port}' addr {addr} is not connected")]
    TransportNotConnected {
        /// Port name.
        port: String,
        /// Device address (-1 for the port itself).
        addr: i32,
    },
    /// A blocking transport operation or a queued request exceeded its deadline.
    #[error("Timeout")]
    Timeout,
    /// The interface does not implement the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
    /// I/O error while writing reports or trace output, or spawning a thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Transport-reported failure with a human readable message.
    #[error("{0}")]
    Generic(String),
}

/// Result type alias for port manager operations.
///
/// This is a convenience alias for `std::result::Result<T, Error>` used
/// throughout the crate to reduce boilerplate.
pub type Result<T> = std::result::Result<T, Error>;

/// Returned by [`RequestHandle::free`] when the handle is still connected.
///
/// The handle is given back untouched so the caller can disconnect it and
/// try again.
#[derive(Error, Debug)]
#[error("freeRequestHandle: {error}")]
pub struct FreeError {
    /// The handle that could not be freed.
    pub handle: RequestHandle,
    /// Why it could not be freed.
    #[source]
    pub error: Error,
}

// Helpers for errors built in more than one place
pub(crate) fn still_connected(port: &str, addr: i32) -> Error {
    Error::Generic(format!(
        "request handle is still connected to port '{}' addr {}",
        port, addr
    ))
}
