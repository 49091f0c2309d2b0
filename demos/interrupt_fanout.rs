use asyn_manager::{Interface, InterfaceKind, PortConfig, PortRegistry, Result};
use std::any::Any;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const PORT: &str = "adc";
const CHANNELS: i32 = 2;

/// Marker table for the port's integer-reading interface.
struct Int32Table;

fn main() -> Result<()> {
    env_logger::init();
    let registry = PortRegistry::global();
    registry.register_port(PORT, PortConfig::default().with_auto_connect(false))?;
    registry.register_interface(PORT, Interface::custom("asynInt32", std::sync::Arc::new(Int32Table)))?;
    let kind = InterfaceKind::Custom("asynInt32".to_string());
    let source = registry.register_interrupt_source(PORT, &kind)?;

    let (tx, rx) = mpsc::channel();
    let mut clients = Vec::new();
    for addr in 0..CHANNELS {
        let handle = registry.create_request_handle(|_| {})?;
        handle.connect_device(PORT, addr)?;
        let found = handle.interrupt_source(&kind)?;
        let tx = tx.clone();
        let id = handle.add_interrupt_user(&found, move |handle, payload: &dyn Any| {
            if let Some(value) = payload.downcast_ref::<i32>() {
                let _ = tx.send(format!("channel {} got {}", handle.addr(), value));
            }
        })?;
        clients.push((handle, id));
    }
    drop(tx);

    // Driver side: one scan per tick, each channel's reading goes to its users.
    let driver_source = source.clone();
    let driver = thread::spawn(move || {
        for tick in 0..3 {
            let walk = driver_source.interrupt_start();
            for addr in 0..CHANNELS {
                walk.notify_addr(addr, &(tick * 100 + addr));
            }
            walk.end();
            thread::sleep(Duration::from_millis(20));
        }
    });

    let _ = driver.join();
    for line in rx.try_iter() {
        println!("{}", line);
    }

    for (handle, id) in clients {
        handle.remove_interrupt_user(&source, id)?;
        handle.disconnect_device()?;
        handle.free().map_err(|e| e.error)?;
    }
    println!("users left on {}: {}", source, source.user_count());
    Ok(())
}
