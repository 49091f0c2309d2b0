//! Administrative commands: port report, option pass-through and trace
//! settings addressed by port name and address.

use crate::consts;
use crate::error::{Error, Result};
use crate::interface::{Common, InterfaceKind};
use crate::port::Priority;
use crate::registry::PortRegistry;
use crate::request::RequestHandle;
use crate::trace::{TraceFile, TraceIoMask, TraceMask};
use log::debug;
use std::io::Write;
use std::sync::{mpsc, Arc};

/// Writes a report of every registered port.
///
/// `details` 0 gives one block per port; 1 or more adds a line per device
/// (connection, lock and trace state, process modules). The port's
/// `Common::report` is called with the same level.
pub fn report(registry: &PortRegistry, out: &mut dyn Write, details: i32) -> Result<()> {
    for port in registry.ports() {
        port.report(out, details)?;
    }
    Ok(())
}

/// Sets a driver option through the port's `Common` interface.
///
/// The call is made from the port's worker thread via a low-priority queued
/// request; this function blocks until it has run.
pub fn set_port_option(
    registry: &PortRegistry,
    port: &str,
    addr: i32,
    key: &str,
    value: &str,
) -> Result<()> {
    let key = key.to_string();
    let value = value.to_string();
    run_on_port(registry, port, addr, move |handle| {
        let common = common_interface(handle)?;
        common.set_option(handle, &key, &value)?;
        Ok(String::new())
    })
    .map(|_| ())
}

/// Reads a driver option through the port's `Common` interface.
pub fn show_port_option(registry: &PortRegistry, port: &str, addr: i32, key: &str) -> Result<String> {
    let key = key.to_string();
    run_on_port(registry, port, addr, move |handle| {
        let common = common_interface(handle)?;
        common.get_option(handle, &key)
    })
}

/// Sets the trace mask of a device; address -1 addresses the port device.
pub fn set_trace_mask(registry: &PortRegistry, port: &str, addr: i32, mask: TraceMask) -> Result<()> {
    with_device(registry, port, addr, |handle| handle.set_trace_mask(mask))
}

/// Sets how I/O payloads of a device are rendered in trace output.
pub fn set_trace_io_mask(
    registry: &PortRegistry,
    port: &str,
    addr: i32,
    mask: TraceIoMask,
) -> Result<()> {
    with_device(registry, port, addr, |handle| handle.set_trace_io_mask(mask))
}

pub fn set_trace_io_truncate_size(
    registry: &PortRegistry,
    port: &str,
    addr: i32,
    size: usize,
) -> Result<()> {
    with_device(registry, port, addr, |handle| {
        handle.set_trace_io_truncate_size(size)
    })
}

/// Redirects trace output of a device; `None` restores standard output.
pub fn set_trace_file(
    registry: &PortRegistry,
    port: &str,
    addr: i32,
    file: Option<TraceFile>,
) -> Result<()> {
    with_device(registry, port, addr, |handle| handle.set_trace_file(file))
}

fn common_interface(handle: &RequestHandle) -> Result<Arc<dyn Common>> {
    handle
        .find_interface(&InterfaceKind::Common, true)?
        .as_common()
        .cloned()
        .ok_or_else(|| Error::Generic("asynCommon binding has the wrong type".to_string()))
}

/// Runs `f` with a short-lived handle bound to `port`/`addr`.
fn with_device<T>(
    registry: &PortRegistry,
    port: &str,
    addr: i32,
    f: impl FnOnce(&RequestHandle) -> T,
) -> Result<T> {
    let handle = registry.create_internal_handle()?;
    handle.connect_device(port, addr)?;
    let result = f(&handle);
    release(handle)?;
    Ok(result)
}

/// Queues `f` on the port's worker and waits for its result.
fn run_on_port<F>(registry: &PortRegistry, port: &str, addr: i32, f: F) -> Result<String>
where
    F: Fn(&RequestHandle) -> Result<String> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel();
    let timeout_tx = tx.clone();
    let handle = registry.create_request_handle_with_timeout(
        move |handle| {
            let _ = tx.send(f(handle));
        },
        move |_| {
            let _ = timeout_tx.send(Err(Error::Timeout));
        },
    )?;
    handle.connect_device(port, addr)?;
    if let Err(e) = handle.queue_request(Priority::LOW, Some(consts::shell::OPTION_QUEUE_TIMEOUT)) {
        release(handle)?;
        return Err(e);
    }
    // Exactly one of the two callbacks sends.
    let result = rx
        .recv()
        .unwrap_or_else(|_| Err(Error::Generic("option request dropped".to_string())));
    release(handle)?;
    debug!("Option request on port '{}' addr {} finished", port, addr);
    result
}

fn release(handle: RequestHandle) -> Result<()> {
    handle.disconnect_device()?;
    handle.free().map_err(|e| e.error)
}
