//! # asyn-manager
//!
//! Port queueing, device locking and trace core for asynchronous instrument
//! I/O drivers.
//!
//! A *port* is a named transport (serial line, GPIB board, TCP socket) with a
//! fixed number of priority queues and one worker thread. Callers queue
//! requests through *request handles*; the worker drains the queues from the
//! highest priority down and runs each request's completion callback, one at
//! a time, so all I/O for a transport is serialized onto that thread.
//!
//! ## Features
//!
//! *   Port registration (`register_port`) with configurable priority levels,
//!     auto-connect and worker stack size (`PortConfig`).
//! *   Interface registry:
//!     *   Port-wide bindings (`register_interface`, `find_port_interface`).
//!     *   Per-address overrides (`register_process_module`).
//!     *   Capability traits `Common` and `Octet`, plus driver-defined
//!         `Interface::Custom` tables.
//! *   Request handles:
//!     *   Creation with completion and optional timeout callbacks
//!         (`create_request_handle`, `create_request_handle_with_timeout`).
//!     *   Binding to a device (`connect_device`, `disconnect_device`, `free`).
//!     *   Queueing with priority and timeout (`queue_request`, `cancel_request`).
//!     *   Re-entrant exclusive device locking (`lock`, `unlock`). A lock
//!         holder's follow-up requests jump to the front of their queue, so
//!         multi-step transactions run without interleaving.
//! *   Connection management: auto-connect through `Common`, `reconnect`,
//!     `exception_connect`/`exception_disconnect` and exception callbacks.
//!     Devices and whole ports can be disabled and re-enabled at run time
//!     (`enable`, `set_auto_connect`).
//! *   Interrupt fan-out (`register_interrupt_source`, `add_interrupt_user`,
//!     `interrupt_start`): drivers push readings to every registered user.
//! *   Per-device trace output gated by `TraceMask`, with ASCII, escaped and
//!     hex dumps of I/O payloads (`TraceIoMask`).
//! *   Administrative commands in [`shell`]: report, port options and trace
//!     settings by port name and address.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use asyn_manager::{PortConfig, PortRegistry, Priority, Result};
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     // Optional: Initialize logging
//!     // env_logger::init();
//!
//!     let registry = PortRegistry::global();
//!     registry.register_port("L0", PortConfig::default())?;
//!
//!     let (tx, rx) = mpsc::channel();
//!     let handle = registry.create_request_handle(move |handle| {
//!         // Runs on the port's worker thread.
//!         let _ = tx.send(handle.addr());
//!     })?;
//!     handle.connect_device("L0", 3)?;
//!     handle.queue_request(Priority::MEDIUM, None)?;
//!     assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
//!
//!     handle.disconnect_device()?;
//!     handle.free().map_err(|e| e.error)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Locking
//!
//! ```no_run
//! # use asyn_manager::{PortRegistry, Priority, Result};
//! # fn demo(registry: &PortRegistry) -> Result<()> {
//! let handle = registry.create_request_handle(|handle| {
//!     // ... talk to the device ...
//!     // Release once the transaction is complete; other handles waiting
//!     // on this device are dispatched after this.
//!     let _ = handle.unlock();
//! })?;
//! handle.connect_device("L0", 3)?;
//! handle.lock()?;
//! handle.queue_request(Priority::LOW, None)?;
//! # Ok(())
//! # }
//! ```

// Declare modules
pub mod consts;
mod device;
pub mod error;
pub mod exception;
pub mod interface;
pub mod interrupt;
mod port;
mod registry;
mod request;
pub mod shell;
mod timer;
pub mod trace;

// Re-export key types for convenience
pub use error::{Error, FreeError, Result};
pub use exception::{Exception, ExceptionCallback};
pub use interface::{Common, Interface, InterfaceKind, Octet};
pub use interrupt::{InterruptCallback, InterruptSource, InterruptUser, InterruptUserId, InterruptWalk};
pub use port::{PortConfig, Priority};
pub use registry::PortRegistry;
pub use request::{RequestCallback, RequestHandle};
pub use trace::{TraceFile, TraceIoMask, TraceMask};

/// Writes a formatted trace line through a request handle.
///
/// ```no_run
/// # use asyn_manager::{asyn_print, RequestHandle, TraceMask};
/// # fn demo(handle: &RequestHandle) {
/// asyn_print!(handle, TraceMask::FLOW, "starting read of {} bytes\n", 16);
/// # }
/// ```
#[macro_export]
macro_rules! asyn_print {
    ($handle:expr, $reason:expr, $($arg:tt)+) => {
        $handle.trace_print($reason, format_args!($($arg)+))
    };
}

/// Writes a formatted trace line followed by a dump of an I/O buffer.
///
/// ```no_run
/// # use asyn_manager::{asyn_print_io, RequestHandle, TraceMask};
/// # fn demo(handle: &RequestHandle, data: &[u8]) {
/// asyn_print_io!(handle, TraceMask::IO_DRIVER, data, "read {} bytes\n", data.len());
/// # }
/// ```
#[macro_export]
macro_rules! asyn_print_io {
    ($handle:expr, $reason:expr, $data:expr, $($arg:tt)+) => {
        $handle.trace_print_io($reason, $data, format_args!($($arg)+))
    };
}
