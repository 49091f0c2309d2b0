//! Integration tests for queue timeouts and their interaction with dispatch
//! and cancellation.

mod common;

use approx::assert_abs_diff_eq;
use asyn_manager::{PortRegistry, Priority, RequestHandle};
use common::*;
use std::sync::mpsc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Completed,
    TimedOut,
}

fn timed_handle(registry: &PortRegistry, port: &str, addr: i32) -> (RequestHandle, mpsc::Receiver<(Outcome, bool)>) {
    let (tx, rx) = mpsc::channel();
    let timeout_tx = tx.clone();
    let handle = registry
        .create_request_handle_with_timeout(
            move |handle| {
                let _ = tx.send((Outcome::Completed, handle.is_queued()));
            },
            move |handle| {
                let _ = timeout_tx.send((Outcome::TimedOut, handle.is_queued()));
            },
        )
        .unwrap();
    handle.connect_device(port, addr).unwrap();
    (handle, rx)
}

#[test]
fn test_timeout_fires_while_worker_is_busy() {
    let registry = registry_with_port("P1");
    let (handle, rx) = timed_handle(&registry, "P1", 0);

    let gate = block_worker(&registry, "P1", 99);
    let start = Instant::now();
    handle
        .queue_request(Priority::LOW, Some(Duration::from_millis(10)))
        .unwrap();

    let (outcome, queued) = rx.recv_timeout(WAIT).unwrap();
    let elapsed = start.elapsed().as_secs_f64();
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(!queued);
    assert!(!handle.is_queued());
    assert!(elapsed >= 0.010);
    assert_abs_diff_eq!(elapsed, 0.010, epsilon = 0.5);

    gate.open();
    assert_quiet(&rx);
}

#[test]
fn test_dispatch_disarms_timeout() {
    let registry = registry_with_port("P1");
    let (handle, rx) = timed_handle(&registry, "P1", 0);

    handle
        .queue_request(Priority::MEDIUM, Some(Duration::from_millis(50)))
        .unwrap();

    assert_eq!(collect(&rx, 1), vec![(Outcome::Completed, false)]);
    std::thread::sleep(Duration::from_millis(80));
    assert_quiet(&rx);
}

#[test]
fn test_cancel_disarms_timeout() {
    let registry = registry_with_port("P1");
    let (handle, rx) = timed_handle(&registry, "P1", 0);

    let gate = block_worker(&registry, "P1", 99);
    handle
        .queue_request(Priority::LOW, Some(Duration::from_millis(30)))
        .unwrap();
    assert!(handle.cancel_request().unwrap());
    std::thread::sleep(Duration::from_millis(60));
    gate.open();

    assert_quiet(&rx);
}

#[test]
fn test_requeue_after_timeout_is_not_cancelled() {
    let registry = registry_with_port("P1");
    let (handle, rx) = timed_handle(&registry, "P1", 0);

    let gate = block_worker(&registry, "P1", 99);
    handle
        .queue_request(Priority::LOW, Some(Duration::from_millis(10)))
        .unwrap();
    assert_eq!(collect(&rx, 1), vec![(Outcome::TimedOut, false)]);

    handle.queue_request(Priority::LOW, None).unwrap();
    std::thread::sleep(Duration::from_millis(40));
    assert!(handle.is_queued());
    gate.open();

    assert_eq!(collect(&rx, 1), vec![(Outcome::Completed, false)]);
}

#[test]
fn test_timeout_without_callback_still_queues() {
    let registry = registry_with_port("P1");
    let (tx, rx) = mpsc::channel();
    let handle = labelled_handle(&registry, "P1", 0, "served", &tx);

    handle
        .queue_request(Priority::LOW, Some(Duration::from_millis(5)))
        .unwrap();
    assert_eq!(collect(&rx, 1), vec!["served"]);
}

#[test]
fn test_zero_timeout_means_none() {
    let registry = registry_with_port("P1");
    let (handle, rx) = timed_handle(&registry, "P1", 0);

    let gate = block_worker(&registry, "P1", 99);
    handle.queue_request(Priority::LOW, Some(Duration::ZERO)).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert!(handle.is_queued());
    gate.open();

    assert_eq!(collect(&rx, 1), vec![(Outcome::Completed, false)]);
}
