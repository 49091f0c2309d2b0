//! Shared helpers for the integration tests: an in-process mock transport,
//! a capture buffer for trace output and a gate that holds a port's worker
//! thread inside a callback.

#![allow(dead_code)]

use asyn_manager::{
    Common, Error, Octet, PortConfig, PortRegistry, Priority, RequestHandle, Result,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound for anything the tests wait on.
pub const WAIT: Duration = Duration::from_secs(2);
/// How long to watch for something that must not happen.
pub const QUIET: Duration = Duration::from_millis(100);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A fresh registry with one port that does not auto-connect.
pub fn registry_with_port(name: &str) -> PortRegistry {
    init_logging();
    let registry = PortRegistry::new();
    registry
        .register_port(name, PortConfig::default().with_auto_connect(false))
        .expect("register port");
    registry
}

/// Polls `condition` until it holds or `WAIT` elapses.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Receives exactly `count` values or panics.
pub fn collect<T>(rx: &mpsc::Receiver<T>, count: usize) -> Vec<T> {
    (0..count)
        .map(|i| {
            rx.recv_timeout(WAIT)
                .unwrap_or_else(|_| panic!("timed out waiting for message {}", i))
        })
        .collect()
}

/// Asserts nothing arrives for a short while.
pub fn assert_quiet<T: std::fmt::Debug>(rx: &mpsc::Receiver<T>) {
    if let Ok(value) = rx.recv_timeout(QUIET) {
        panic!("unexpected message: {:?}", value);
    }
}

/// A handle that reports its label on `tx` each time it is dispatched.
pub fn labelled_handle(
    registry: &PortRegistry,
    port: &str,
    addr: i32,
    label: &'static str,
    tx: &mpsc::Sender<&'static str>,
) -> RequestHandle {
    let tx = tx.clone();
    let handle = registry
        .create_request_handle(move |_| {
            let _ = tx.send(label);
        })
        .expect("create handle");
    handle.connect_device(port, addr).expect("connect handle");
    handle
}

/// A connected handle whose completion callback does nothing.
pub fn connected_handle(registry: &PortRegistry, port: &str, addr: i32) -> RequestHandle {
    let handle = registry.create_request_handle(|_| {}).expect("create handle");
    handle.connect_device(port, addr).expect("connect handle");
    handle
}

/// Thread-safe in-memory writer for trace output.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Mock transport standing in for a serial or socket driver.
#[derive(Default)]
pub struct MockTransport {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub fail_connect: AtomicBool,
    options: Mutex<HashMap<String, String>>,
    written: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let mock = Self::default();
        mock.fail_connect.store(true, Ordering::SeqCst);
        Arc::new(mock)
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn push_input(&self, data: &[u8]) {
        self.input.lock().extend(data.iter().copied());
    }
}

impl Common for MockTransport {
    fn report(&self, out: &mut dyn Write, details: i32) -> io::Result<()> {
        writeln!(
            out,
            "    mock transport connects {} details {}",
            self.connects.load(Ordering::SeqCst),
            details
        )
    }

    fn connect(&self, _handle: &RequestHandle) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Generic("mock connect refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&self, _handle: &RequestHandle) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn set_option(&self, _handle: &RequestHandle, key: &str, value: &str) -> Result<()> {
        self.options.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_option(&self, _handle: &RequestHandle, key: &str) -> Result<String> {
        self.options
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Generic(format!("unknown option '{}'", key)))
    }
}

impl Octet for MockTransport {
    fn read(&self, _handle: &RequestHandle, buf: &mut [u8]) -> Result<usize> {
        let mut input = self.input.lock();
        let count = buf.len().min(input.len());
        for (slot, byte) in buf.iter_mut().zip(input.drain(..count)) {
            *slot = byte;
        }
        if count == 0 {
            return Err(Error::Timeout);
        }
        Ok(count)
    }

    fn write(&self, _handle: &RequestHandle, data: &[u8]) -> Result<usize> {
        self.written.lock().extend_from_slice(data);
        Ok(data.len())
    }
}

/// Holds a port's worker thread inside a completion callback until opened.
pub struct WorkerGate {
    release: mpsc::Sender<()>,
    handle: RequestHandle,
}

/// Queues a blocking request on `port`/`addr` and waits until the worker is
/// inside it.
pub fn block_worker(registry: &PortRegistry, port: &str, addr: i32) -> WorkerGate {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = Mutex::new(release_rx);
    let handle = registry
        .create_request_handle(move |_| {
            let _ = started_tx.send(());
            let _ = release_rx.lock().recv_timeout(WAIT * 5);
        })
        .expect("create gate handle");
    handle.connect_device(port, addr).expect("connect gate");
    handle
        .queue_request(Priority::HIGH, None)
        .expect("queue gate");
    started_rx
        .recv_timeout(WAIT)
        .expect("worker never entered the gate");
    WorkerGate {
        release: release_tx,
        handle,
    }
}

impl WorkerGate {
    pub fn open(self) {
        let _ = self.release.send(());
    }
}
