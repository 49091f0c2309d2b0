//! Integration tests for per-device tracing: mask gating, I/O rendering,
//! inheritance of defaults and the trace macros.

mod common;

use asyn_manager::{
    asyn_print, asyn_print_io, PortConfig, PortRegistry, TraceFile, TraceIoMask, TraceMask,
};
use common::*;
use std::sync::mpsc;
use std::thread;

fn traced_handle(registry: &PortRegistry, addr: i32) -> (asyn_manager::RequestHandle, SharedBuf) {
    let buf = SharedBuf::default();
    let handle = connected_handle(registry, "T1", addr);
    handle.set_trace_file(Some(TraceFile::new(buf.clone())));
    (handle, buf)
}

/// Strips the timestamp prefix from every trace line.
fn bodies(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.split_once(' ') {
            Some((stamp, rest)) if stamp.contains('.') && stamp.chars().next().is_some_and(|c| c.is_ascii_digit()) => {
                rest.to_string()
            }
            _ => line.to_string(),
        })
        .collect()
}

#[test]
fn test_default_trace_settings() {
    let registry = registry_with_port("T1");
    let handle = connected_handle(&registry, "T1", 0);
    assert_eq!(handle.trace_mask(), TraceMask::ERROR);
    assert_eq!(handle.trace_io_mask(), TraceIoMask::empty());
    assert_eq!(handle.trace_io_truncate_size(), 80);
    assert!(handle.trace_file().is_none());
}

#[test]
fn test_mask_gates_output() {
    let registry = registry_with_port("T1");
    let (handle, buf) = traced_handle(&registry, 0);

    assert_eq!(handle.trace_print(TraceMask::FLOW, format_args!("hidden\n")), 0);
    assert!(buf.text().is_empty());

    handle.set_trace_mask(TraceMask::ERROR | TraceMask::FLOW);
    let written = asyn_print!(handle, TraceMask::FLOW, "step {}\n", 3);
    assert!(written > 0);
    assert_eq!(written, buf.text().len());
    assert_eq!(bodies(&buf.text()), vec!["step 3"]);

    buf.clear();
    asyn_print!(handle, TraceMask::WARNING | TraceMask::FLOW, "either\n");
    assert_eq!(bodies(&buf.text()), vec!["either"]);
}

#[test]
fn test_io_rendering_modes() {
    let registry = registry_with_port("T1");
    let (handle, buf) = traced_handle(&registry, 0);
    handle.set_trace_mask(TraceMask::IO_DRIVER);
    let data = b"OK\r\n";

    handle.set_trace_io_mask(TraceIoMask::ESCAPE);
    asyn_print_io!(handle, TraceMask::IO_DRIVER, data, "read {}\n", data.len());
    assert_eq!(bodies(&buf.text()), vec!["read 4", "OK\\r\\n"]);

    buf.clear();
    handle.set_trace_io_mask(TraceIoMask::HEX);
    asyn_print_io!(handle, TraceMask::IO_DRIVER, data, "read\n");
    assert_eq!(bodies(&buf.text()), vec!["read", "", "4f 4b 0d 0a "]);

    buf.clear();
    handle.set_trace_io_mask(TraceIoMask::empty());
    asyn_print_io!(handle, TraceMask::IO_DRIVER, data, "header only\n");
    assert_eq!(bodies(&buf.text()), vec!["header only"]);
}

#[test]
fn test_truncate_size_limits_dump() {
    let registry = registry_with_port("T1");
    let (handle, buf) = traced_handle(&registry, 0);
    handle.set_trace_mask(TraceMask::IO_DEVICE);
    handle.set_trace_io_mask(TraceIoMask::ASCII);
    handle.set_trace_io_truncate_size(3);

    asyn_print_io!(handle, TraceMask::IO_DEVICE, b"abcdef", "w\n");
    assert_eq!(bodies(&buf.text()), vec!["w", "abc"]);

    buf.clear();
    handle.set_trace_io_mask(TraceIoMask::HEX);
    handle.set_trace_io_truncate_size(0);
    asyn_print_io!(handle, TraceMask::IO_DEVICE, b"abcdef", "none\n");
    assert_eq!(bodies(&buf.text()), vec!["none"]);
}

#[test]
fn test_precondition_failure_traces_error() {
    let registry = registry_with_port("T1");
    let (handle, buf) = traced_handle(&registry, 0);

    assert!(handle.exception_callback_remove().is_err());
    let text = buf.text();
    assert!(text.contains("T1 addr 0"), "trace was: {}", text);
    assert!(!handle.error_message().is_empty());

    buf.clear();
    handle.set_trace_mask(TraceMask::FLOW);
    assert!(handle.exception_callback_remove().is_err());
    assert!(buf.text().is_empty());
}

#[test]
fn test_devices_inherit_port_trace_settings() {
    let registry = registry_with_port("T1");
    let port_level = connected_handle(&registry, "T1", -1);
    port_level.set_trace_mask(TraceMask::ERROR | TraceMask::IO_FILTER);
    port_level.set_trace_io_truncate_size(16);

    let device = connected_handle(&registry, "T1", 7);
    assert_eq!(device.trace_mask(), TraceMask::ERROR | TraceMask::IO_FILTER);
    assert_eq!(device.trace_io_truncate_size(), 16);

    device.set_trace_mask(TraceMask::FLOW);
    assert_eq!(port_level.trace_mask(), TraceMask::ERROR | TraceMask::IO_FILTER);
}

#[test]
fn test_unconnected_handle_sets_registry_defaults() {
    init_logging();
    let registry = PortRegistry::new();
    let loose = registry.create_request_handle(|_| {}).unwrap();
    loose.set_trace_mask(TraceMask::ERROR | TraceMask::WARNING);
    assert_eq!(loose.trace_mask(), TraceMask::ERROR | TraceMask::WARNING);

    registry
        .register_port("T1", PortConfig::default().with_auto_connect(false))
        .unwrap();
    let device = connected_handle(&registry, "T1", 0);
    assert_eq!(device.trace_mask(), TraceMask::ERROR | TraceMask::WARNING);
}

#[test]
fn test_unconnected_print_is_unconditional() {
    init_logging();
    let registry = PortRegistry::new();
    let loose = registry.create_request_handle(|_| {}).unwrap();
    loose.set_trace_mask(TraceMask::empty());
    assert!(asyn_print!(loose, TraceMask::FLOW, "to stdout\n") > 0);
}

#[test]
fn test_trace_guard_keeps_lines_together() {
    let registry = registry_with_port("T1");
    let (first, buf) = traced_handle(&registry, 0);
    let second = connected_handle(&registry, "T1", 1);
    second.set_trace_file(first.trace_file());
    assert!(second
        .trace_file()
        .is_some_and(|file| first.trace_file().is_some_and(|f| f.same_sink(&file))));
    first.set_trace_mask(TraceMask::FLOW);
    second.set_trace_mask(TraceMask::FLOW);

    let (started_tx, started_rx) = mpsc::channel();
    let guard = first.trace_guard();
    asyn_print!(first, TraceMask::FLOW, "block-a\n");
    let writer = thread::spawn(move || {
        let _ = started_tx.send(());
        asyn_print!(second, TraceMask::FLOW, "other\n");
    });
    started_rx.recv_timeout(WAIT).unwrap();
    thread::sleep(QUIET);
    asyn_print!(first, TraceMask::FLOW, "block-b\n");
    drop(guard);
    writer.join().unwrap();

    assert_eq!(bodies(&buf.text()), vec!["block-a", "block-b", "other"]);
}

#[test]
fn test_trace_settings_fire_exceptions() {
    let registry = registry_with_port("T1");
    let (tx, rx) = mpsc::channel();
    let watcher = connected_handle(&registry, "T1", 0);
    watcher
        .exception_callback_add(move |_, exception| {
            let _ = tx.send(exception.to_string());
        })
        .unwrap();

    watcher.set_trace_io_mask(TraceIoMask::HEX);
    watcher.set_trace_file(Some(TraceFile::stderr()));
    watcher.set_trace_io_truncate_size(10);
    assert_eq!(
        collect(&rx, 3),
        vec![
            "asynExceptionTraceIOMask",
            "asynExceptionTraceFile",
            "asynExceptionTraceIOTruncateSize"
        ]
    );
}
