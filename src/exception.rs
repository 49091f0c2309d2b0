use crate::request::RequestHandle;
use std::fmt;
use std::sync::Arc;

/// State changes reported to exception callbacks of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    /// The device (or port) connected or disconnected.
    Connect,
    /// The device (or port) was enabled or disabled.
    Enable,
    AutoConnect,
    TraceMask,
    TraceIoMask,
    TraceFile,
    TraceIoTruncateSize,
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Exception::Connect => "asynExceptionConnect",
            Exception::Enable => "asynExceptionEnable",
            Exception::AutoConnect => "asynExceptionAutoConnect",
            Exception::TraceMask => "asynExceptionTraceMask",
            Exception::TraceIoMask => "asynExceptionTraceIOMask",
            Exception::TraceFile => "asynExceptionTraceFile",
            Exception::TraceIoTruncateSize => "asynExceptionTraceIOTruncateSize",
        };
        f.write_str(name)
    }
}

/// Called with the handle that registered it and the exception that occurred.
pub type ExceptionCallback = Arc<dyn Fn(&RequestHandle, Exception) + Send + Sync>;
