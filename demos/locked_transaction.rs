use asyn_manager::{
    asyn_print, asyn_print_io, Common, Interface, InterfaceKind, Octet, PortConfig, PortRegistry,
    Priority, RequestHandle, Result, TraceIoMask, TraceMask,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const PORT: &str = "dmm";
const ADDR: i32 = 0;

/// Simulated multimeter: answers every `MEAS?` with the next reading.
#[derive(Default)]
struct Multimeter {
    reply: Mutex<VecDeque<u8>>,
    readings: AtomicUsize,
}

impl Common for Multimeter {
    fn connect(&self, _handle: &RequestHandle) -> Result<()> {
        println!("multimeter: connected");
        Ok(())
    }

    fn disconnect(&self, _handle: &RequestHandle) -> Result<()> {
        println!("multimeter: disconnected");
        Ok(())
    }
}

impl Octet for Multimeter {
    fn read(&self, _handle: &RequestHandle, buf: &mut [u8]) -> Result<usize> {
        let mut reply = self.reply.lock();
        let count = buf.len().min(reply.len());
        for (slot, byte) in buf.iter_mut().zip(reply.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write(&self, _handle: &RequestHandle, data: &[u8]) -> Result<usize> {
        if data.starts_with(b"MEAS?") {
            let n = self.readings.fetch_add(1, Ordering::SeqCst);
            let text = format!("{:.3}\r\n", 1.5 + n as f64 * 0.25);
            self.reply.lock().extend(text.bytes());
        }
        Ok(data.len())
    }
}

fn octet(handle: &RequestHandle) -> Result<Arc<dyn Octet>> {
    let interface = handle.find_interface(&InterfaceKind::Octet, true)?;
    interface
        .as_octet()
        .cloned()
        .ok_or_else(|| asyn_manager::Error::Generic("asynOctet binding has the wrong type".into()))
}

/// Two-step transaction: the first dispatch writes the query, the second
/// reads the answer. The device stays locked in between.
fn transaction_client(registry: &PortRegistry, done: mpsc::Sender<String>) -> Result<RequestHandle> {
    let step = AtomicUsize::new(0);
    let handle = registry.create_request_handle(move |handle| {
        let result = (|| -> Result<()> {
            let octet = octet(handle)?;
            if step.fetch_add(1, Ordering::SeqCst) == 0 {
                octet.write(handle, b"MEAS?\n")?;
                asyn_print!(handle, TraceMask::FLOW, "query sent, waiting for next dispatch\n");
                handle.queue_request(Priority::MEDIUM, None)?;
                let _ = done.send("locked client: query sent".to_string());
            } else {
                let mut buf = [0u8; 32];
                let n = octet.read(handle, &mut buf)?;
                asyn_print_io!(handle, TraceMask::IO_DEVICE, &buf[..n], "read {} bytes\n", n);
                handle.unlock()?;
                let _ = done.send(format!("locked client: {}", String::from_utf8_lossy(&buf[..n]).trim()));
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _ = done.send(format!("locked client failed: {}", e));
        }
    })?;
    handle.connect_device(PORT, ADDR)?;
    Ok(handle)
}

fn main() -> Result<()> {
    env_logger::init();
    let registry = PortRegistry::global();
    registry.register_port(PORT, PortConfig::default())?;
    let meter = Arc::new(Multimeter::default());
    registry.register_interface(PORT, Interface::Common(meter.clone()))?;
    registry.register_interface(PORT, Interface::Octet(meter))?;

    let (tx, rx) = mpsc::channel();
    let locked = transaction_client(registry, tx.clone())?;
    locked.set_trace_mask(TraceMask::ERROR | TraceMask::FLOW | TraceMask::IO_DEVICE);
    locked.set_trace_io_mask(TraceIoMask::ESCAPE);

    let other_tx = tx.clone();
    let other = registry.create_request_handle(move |handle| {
        let _ = other_tx.send(format!("high-priority client ran on addr {}", handle.addr()));
    })?;
    other.connect_device(PORT, ADDR)?;

    locked.lock()?;
    locked.queue_request(Priority::LOW, None)?;
    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(line) => println!("{}", line),
        Err(_) => eprintln!("timed out waiting for the port"),
    }
    // The transaction now holds the device, so this waits for its unlock
    // despite the higher priority.
    other.queue_request(Priority::HIGH, None)?;

    for _ in 0..2 {
        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(line) => println!("{}", line),
            Err(_) => {
                eprintln!("timed out waiting for the port");
                break;
            }
        }
    }

    let mut report = Vec::new();
    asyn_manager::shell::report(registry, &mut report, 1)?;
    print!("{}", String::from_utf8_lossy(&report));

    for handle in [locked, other] {
        handle.disconnect_device()?;
        handle.free().map_err(|e| e.error)?;
    }
    Ok(())
}
