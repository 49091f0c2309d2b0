//! Per-device diagnostic trace output.
//!
//! Each device carries a reason mask, an I/O dump mask, an optional output
//! sink and a truncate size for payload dumps. All output is written under one
//! process-wide re-entrant trace lock that is separate from the port locks, so
//! lines from different ports never interleave and tracing never waits on a
//! scheduler.

use crate::consts::trace::{DEFAULT_TRUNCATE_SIZE, HEX_BYTES_PER_LINE};
use bitflags::bitflags;
use log::warn;
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

bitflags! {
    /// Reasons a trace line may be emitted for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TraceMask: u32 {
        /// Errors, including failed preconditions on request handles.
        const ERROR = 0x0001;
        /// I/O as seen by device support.
        const IO_DEVICE = 0x0002;
        /// I/O as seen by interpose filters.
        const IO_FILTER = 0x0004;
        /// I/O as seen by the low-level driver.
        const IO_DRIVER = 0x0008;
        /// Flow of control, e.g. queueing and dispatch.
        const FLOW = 0x0010;
        /// Warnings that are not errors.
        const WARNING = 0x0020;
    }
}

impl Default for TraceMask {
    fn default() -> Self {
        TraceMask::ERROR
    }
}

bitflags! {
    /// How I/O payloads are rendered by `trace_print_io`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TraceIoMask: u32 {
        /// Raw bytes, as text.
        const ASCII = 0x0001;
        /// Backslash-escaped text.
        const ESCAPE = 0x0002;
        /// Hex dump, 20 bytes per line.
        const HEX = 0x0004;
    }
}

/// A shared trace output sink.
///
/// Cloning shares the same writer. A device with no trace file writes to
/// standard output.
#[derive(Clone)]
pub struct TraceFile {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl TraceFile {
    /// Wraps any writer as a trace destination.
    pub fn new<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Trace destination writing to standard error.
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }

    /// True if both values share the same underlying writer.
    pub fn same_sink(&self, other: &TraceFile) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }

    fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()
    }
}

impl fmt::Debug for TraceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceFile")
            .field("writer", &Arc::as_ptr(&self.writer))
            .finish()
    }
}

/// Trace settings of one device.
pub(crate) struct DeviceTrace {
    mask: AtomicU32,
    io_mask: AtomicU32,
    output: Mutex<TraceOutput>,
}

struct TraceOutput {
    file: Option<TraceFile>,
    truncate_size: usize,
    // Scratch space for escaped dumps; grows with the truncate size.
    scratch: Vec<u8>,
}

impl Default for DeviceTrace {
    fn default() -> Self {
        Self {
            mask: AtomicU32::new(TraceMask::default().bits()),
            io_mask: AtomicU32::new(TraceIoMask::default().bits()),
            output: Mutex::new(TraceOutput {
                file: None,
                truncate_size: DEFAULT_TRUNCATE_SIZE,
                scratch: Vec::with_capacity(DEFAULT_TRUNCATE_SIZE),
            }),
        }
    }
}

impl DeviceTrace {
    /// New settings copied from `other`, used when a device inherits the
    /// port's configuration.
    pub(crate) fn inherit(other: &DeviceTrace) -> Self {
        let trace = DeviceTrace::default();
        trace.set_mask(other.mask());
        trace.set_io_mask(other.io_mask());
        trace.set_file(other.file());
        trace.set_truncate_size(other.truncate_size());
        trace
    }

    pub(crate) fn mask(&self) -> TraceMask {
        TraceMask::from_bits_truncate(self.mask.load(Ordering::Acquire))
    }

    pub(crate) fn set_mask(&self, mask: TraceMask) {
        self.mask.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn io_mask(&self) -> TraceIoMask {
        TraceIoMask::from_bits_truncate(self.io_mask.load(Ordering::Acquire))
    }

    pub(crate) fn set_io_mask(&self, mask: TraceIoMask) {
        self.io_mask.store(mask.bits(), Ordering::Release);
    }

    pub(crate) fn file(&self) -> Option<TraceFile> {
        self.output.lock().file.clone()
    }

    pub(crate) fn set_file(&self, file: Option<TraceFile>) {
        self.output.lock().file = file;
    }

    pub(crate) fn truncate_size(&self) -> usize {
        self.output.lock().truncate_size
    }

    pub(crate) fn set_truncate_size(&self, size: usize) {
        let mut output = self.output.lock();
        if size > output.scratch.capacity() {
            let additional = size - output.scratch.len();
            output.scratch.reserve(additional);
        }
        output.truncate_size = size;
    }
}

/// Writes one formatted trace message.
///
/// With a device the message is emitted only if `reason` intersects the
/// device's mask. Without one (unconnected handle) it always goes to standard
/// output. Returns the number of bytes written.
pub(crate) fn print(
    lock: &ReentrantMutex<()>,
    trace: Option<&DeviceTrace>,
    reason: TraceMask,
    args: fmt::Arguments<'_>,
) -> usize {
    if let Some(trace) = trace {
        if !reason.intersects(trace.mask()) {
            return 0;
        }
    }
    let _guard = lock.lock();
    let mut line = Vec::new();
    write_prefix(&mut line);
    let _ = line.write_fmt(args);
    emit(trace.and_then(DeviceTrace::file), &line)
}

/// Like [`print`], then renders up to the truncate size of `data` according
/// to the device's I/O mask.
pub(crate) fn print_io(
    lock: &ReentrantMutex<()>,
    trace: Option<&DeviceTrace>,
    reason: TraceMask,
    data: &[u8],
    args: fmt::Arguments<'_>,
) -> usize {
    let Some(trace) = trace else {
        return print(lock, None, reason, args);
    };
    if !reason.intersects(trace.mask()) {
        return 0;
    }
    let io_mask = trace.io_mask();
    let _guard = lock.lock();
    let mut output = trace.output.lock();
    let truncate_size = output.truncate_size;
    let count = data.len().min(truncate_size);
    let payload = &data[..count];

    let mut text = Vec::new();
    write_prefix(&mut text);
    let _ = text.write_fmt(args);
    if io_mask.contains(TraceIoMask::ASCII) && count > 0 {
        text.extend_from_slice(payload);
        text.push(b'\n');
    }
    if io_mask.contains(TraceIoMask::ESCAPE) && count > 0 {
        output.scratch.clear();
        escape_into(&mut output.scratch, payload);
        text.extend_from_slice(&output.scratch);
        text.push(b'\n');
    }
    if io_mask.contains(TraceIoMask::HEX) && truncate_size > 0 {
        hex_dump_into(&mut text, payload);
    }
    let file = output.file.clone();
    drop(output);
    emit(file, &text)
}

/// Appends `data` with control and non-ASCII bytes backslash-escaped.
pub(crate) fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &byte in data {
        match byte {
            0x07 => out.extend_from_slice(b"\\a"),
            0x08 => out.extend_from_slice(b"\\b"),
            0x0c => out.extend_from_slice(b"\\f"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x0b => out.extend_from_slice(b"\\v"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'"' => out.extend_from_slice(b"\\\""),
            0x20..=0x7e => out.push(byte),
            _ => {
                let _ = write!(out, "\\x{:02x}", byte);
            }
        }
    }
}

/// Appends a hex dump, starting a new line every 20 bytes.
pub(crate) fn hex_dump_into(out: &mut Vec<u8>, data: &[u8]) {
    for (i, byte) in data.iter().enumerate() {
        if i % HEX_BYTES_PER_LINE == 0 {
            out.push(b'\n');
        }
        let _ = write!(out, "{:02x} ", byte);
    }
    out.push(b'\n');
}

fn write_prefix(out: &mut Vec<u8>) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let _ = write!(out, "{}.{:03} ", now.as_secs(), now.subsec_millis());
}

fn emit(file: Option<TraceFile>, bytes: &[u8]) -> usize {
    let result = match file {
        Some(file) => file.write_all(bytes),
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes).and_then(|_| stdout.flush())
        }
    };
    match result {
        Ok(()) => bytes.len(),
        Err(e) => {
            warn!("Failed to write trace output: {}", e);
            0
        }
    }
}
