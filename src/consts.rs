//! Internal constants, defaults and limits.

// --- Request handles ---
/// Capacity of the per-handle error-message buffer, in bytes.
pub const ERROR_MESSAGE_SIZE: usize = 160;

/// Per-I/O timeout a new handle starts with (drivers read it, the core does not).
pub const DEFAULT_IO_TIMEOUT: std::time::Duration = std::time::Duration::ZERO;

// --- Ports ---
/// Default number of queue priority levels (low, medium, high).
pub const DEFAULT_PRIORITY_LEVELS: usize = 3;
/// Default scheduling priority hint recorded for port worker threads.
pub const DEFAULT_THREAD_PRIORITY: u32 = 50;
/// Stack size value meaning "use the platform default".
pub const DEFAULT_STACK_SIZE: usize = 0;
/// Address that denotes the port itself rather than a sub-device.
pub const PORT_ADDR: i32 = -1;

// --- Trace ---
pub mod trace {
    /// Default number of payload bytes dumped by `trace_print_io`.
    pub const DEFAULT_TRUNCATE_SIZE: usize = 80;
    /// Bytes per line in the hex dump.
    pub const HEX_BYTES_PER_LINE: usize = 20;
}

// --- Timer queue ---
pub mod timer {
    use std::time::Duration;

    /// Longest the timer thread sleeps before checking whether it is still needed.
    pub const IDLE_POLL: Duration = Duration::from_millis(500);
}

// --- Shell ---
pub mod shell {
    use std::time::Duration;

    /// How long option requests may wait on a port queue before giving up.
    pub const OPTION_QUEUE_TIMEOUT: Duration = Duration::from_secs(2);
}
