//! Capability interfaces that drivers register against ports and devices.

use crate::error::{Error, Result};
use crate::request::RequestHandle;
use std::any::Any;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

/// Connection management and options, implemented by every port driver.
///
/// `connect` and `disconnect` are called on the port's worker thread through
/// an internal handle bound to address -1. A driver may report the new state
/// itself with [`RequestHandle::exception_connect`]; if it returns `Ok`
/// without doing so, the port is marked connected for it.
pub trait Common: Send + Sync {
    /// Writes a driver-specific report.
    fn report(&self, out: &mut dyn Write, details: i32) -> io::Result<()> {
        let _ = (out, details);
        Ok(())
    }

    /// Opens the transport (or the device, for `handle.addr() >= 0`).
    fn connect(&self, handle: &RequestHandle) -> Result<()>;

    /// Closes the transport (or the device).
    fn disconnect(&self, handle: &RequestHandle) -> Result<()>;

    /// Sets a named driver option.
    fn set_option(&self, handle: &RequestHandle, key: &str, value: &str) -> Result<()> {
        let _ = (handle, value);
        Err(Error::Unsupported(format!("setOption '{}'", key)))
    }

    /// Reads back a named driver option.
    fn get_option(&self, handle: &RequestHandle, key: &str) -> Result<String> {
        let _ = handle;
        Err(Error::Unsupported(format!("getOption '{}'", key)))
    }
}

/// Byte-stream I/O.
///
/// Implementations are called from completion callbacks on the port's worker
/// thread and should honour [`RequestHandle::timeout`].
pub trait Octet: Send + Sync {
    /// Reads into `buf`, returning the number of bytes read.
    fn read(&self, handle: &RequestHandle, buf: &mut [u8]) -> Result<usize>;

    /// Writes `data`, returning the number of bytes written.
    fn write(&self, handle: &RequestHandle, data: &[u8]) -> Result<usize>;

    /// Discards any buffered input.
    fn flush(&self, handle: &RequestHandle) -> Result<()> {
        let _ = handle;
        Ok(())
    }
}

/// Key used to look up an interface binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    /// [`Common`]
    Common,
    /// [`Octet`]
    Octet,
    /// A driver-defined capability, by name.
    Custom(String),
}

impl InterfaceKind {
    /// Conventional type name of the interface.
    pub fn name(&self) -> &str {
        match self {
            InterfaceKind::Common => "asynCommon",
            InterfaceKind::Octet => "asynOctet",
            InterfaceKind::Custom(name) => name.as_str(),
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One registered capability of a port or device.
#[derive(Clone)]
pub enum Interface {
    Common(Arc<dyn Common>),
    Octet(Arc<dyn Octet>),
    /// Any other capability. `table` is handed back to callers that know its
    /// concrete type, see [`Interface::downcast`].
    Custom {
        name: String,
        table: Arc<dyn Any + Send + Sync>,
    },
}

impl Interface {
    /// Wraps a driver-defined capability.
    pub fn custom<T: Any + Send + Sync>(name: impl Into<String>, table: Arc<T>) -> Self {
        Interface::Custom {
            name: name.into(),
            table,
        }
    }

    /// Lookup key of this binding.
    pub fn kind(&self) -> InterfaceKind {
        match self {
            Interface::Common(_) => InterfaceKind::Common,
            Interface::Octet(_) => InterfaceKind::Octet,
            Interface::Custom { name, .. } => InterfaceKind::Custom(name.clone()),
        }
    }

    pub(crate) fn is_kind(&self, kind: &InterfaceKind) -> bool {
        match (self, kind) {
            (Interface::Common(_), InterfaceKind::Common) => true,
            (Interface::Octet(_), InterfaceKind::Octet) => true,
            (Interface::Custom { name, .. }, InterfaceKind::Custom(wanted)) => name == wanted,
            _ => false,
        }
    }

    /// The [`Common`] implementation, if this is one.
    pub fn as_common(&self) -> Option<&Arc<dyn Common>> {
        match self {
            Interface::Common(common) => Some(common),
            _ => None,
        }
    }

    pub fn as_octet(&self) -> Option<&Arc<dyn Octet>> {
        match self {
            Interface::Octet(octet) => Some(octet),
            _ => None,
        }
    }

    /// Returns the table of a custom interface if it has type `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Interface::Custom { table, .. } => Arc::clone(table).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interface({})", self.kind())
    }
}

/// Adds `interface` to `list`, replacing any binding of the same kind.
pub(crate) fn upsert(list: &mut Vec<Interface>, interface: Interface) {
    let kind = interface.kind();
    match list.iter_mut().find(|existing| existing.is_kind(&kind)) {
        Some(existing) => *existing = interface,
        None => list.push(interface),
    }
}

pub(crate) fn find(list: &[Interface], kind: &InterfaceKind) -> Option<Interface> {
    list.iter().find(|i| i.is_kind(kind)).cloned()
}
