//! Integration tests for interrupt sources and their user lists.

mod common;

use asyn_manager::{
    shell, Error, Interface, InterfaceKind, InterruptSource, InterruptUserId, PortRegistry,
    RequestHandle,
};
use common::*;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::{mpsc, Arc};

fn int32() -> InterfaceKind {
    InterfaceKind::Custom("asynInt32".to_string())
}

/// A port with an `asynInt32` interface registered as interrupt source.
fn registry_with_source(port: &str) -> (PortRegistry, InterruptSource) {
    let registry = registry_with_port(port);
    registry
        .register_interface(port, Interface::custom("asynInt32", Arc::new(0u32)))
        .unwrap();
    let source = registry.register_interrupt_source(port, &int32()).unwrap();
    (registry, source)
}

/// Adds `handle` as a user that reports `(label, value)` for i32 payloads.
fn listen(
    handle: &RequestHandle,
    source: &InterruptSource,
    label: &'static str,
    tx: &mpsc::Sender<(&'static str, i32)>,
) -> InterruptUserId {
    let tx = tx.clone();
    handle
        .add_interrupt_user(source, move |_, payload: &dyn Any| {
            if let Some(value) = payload.downcast_ref::<i32>() {
                let _ = tx.send((label, *value));
            }
        })
        .unwrap()
}

#[test]
fn test_register_interrupt_source_rules() {
    let registry = registry_with_port("I1");
    assert!(matches!(
        registry.register_interrupt_source("I1", &int32()),
        Err(Error::InterfaceNotFound { .. })
    ));

    registry
        .register_interface("I1", Interface::custom("asynInt32", Arc::new(0u32)))
        .unwrap();
    let source = registry.register_interrupt_source("I1", &int32()).unwrap();
    assert_eq!(source.port_name(), "I1");
    assert_eq!(source.kind(), &int32());
    assert_eq!(source.user_count(), 0);

    assert!(matches!(
        registry.register_interrupt_source("I1", &int32()),
        Err(Error::InterruptSourceExists { .. })
    ));
    assert!(matches!(
        registry.register_interrupt_source("nowhere", &int32()),
        Err(Error::PortNotFound(_))
    ));
}

#[test]
fn test_handle_finds_interrupt_source() {
    let (registry, source) = registry_with_source("I1");
    registry
        .register_interface("I1", Interface::Octet(MockTransport::new()))
        .unwrap();
    let handle = connected_handle(&registry, "I1", 0);

    let found = handle.interrupt_source(&int32()).unwrap();
    assert_eq!(found.kind(), source.kind());
    assert_eq!(found.port_name(), "I1");

    assert!(matches!(
        handle.interrupt_source(&InterfaceKind::Octet),
        Err(Error::NoInterruptSource { .. })
    ));
    assert!(handle.error_message().contains("does not support interrupts"));
    assert!(matches!(
        handle.interrupt_source(&InterfaceKind::Custom("asynFloat64".into())),
        Err(Error::InterfaceNotFound { .. })
    ));

    let unbound = registry.create_request_handle(|_| {}).unwrap();
    assert!(matches!(
        unbound.interrupt_source(&int32()),
        Err(Error::NotConnected { .. })
    ));
}

#[test]
fn test_walk_reaches_users_by_addr() {
    let (registry, source) = registry_with_source("I1");
    let (tx, rx) = mpsc::channel();
    let h0 = connected_handle(&registry, "I1", 0);
    let h1 = connected_handle(&registry, "I1", 1);
    listen(&h0, &source, "addr0", &tx);
    listen(&h1, &source, "addr1", &tx);
    assert_eq!(source.user_count(), 2);

    let walk = source.interrupt_start();
    assert_eq!(walk.users().len(), 2);
    assert_eq!(walk.notify(&42i32), 2);
    assert_eq!(walk.notify_addr(1, &7i32), 1);
    walk.end();

    let mut seen = collect(&rx, 3);
    seen.sort_unstable();
    assert_eq!(seen, vec![("addr0", 42), ("addr1", 7), ("addr1", 42)]);

    let mut out = Vec::new();
    shell::report(&registry, &mut out, 0).unwrap();
    let report = String::from_utf8(out).unwrap();
    assert!(report.contains("interrupt sources: asynInt32(2)"), "{}", report);
}

#[test]
fn test_changes_during_walk_are_deferred() {
    let (registry, source) = registry_with_source("I1");
    let (tx, rx) = mpsc::channel();
    let early = connected_handle(&registry, "I1", 0);
    let late = connected_handle(&registry, "I1", 0);
    let early_id = listen(&early, &source, "early", &tx);

    let walk = source.interrupt_start();
    assert!(source.is_walking());
    listen(&late, &source, "late", &tx);
    early.remove_interrupt_user(&source, early_id).unwrap();
    assert_eq!(source.user_count(), 1);

    // The walk still sees the list as it was when it started.
    assert_eq!(walk.notify(&1i32), 1);
    assert_eq!(collect(&rx, 1), vec![("early", 1)]);
    drop(walk);
    assert!(!source.is_walking());
    assert_eq!(source.user_count(), 1);

    assert_eq!(source.interrupt_start().notify(&2i32), 1);
    assert_eq!(collect(&rx, 1), vec![("late", 2)]);
    assert_quiet(&rx);
}

#[test]
fn test_callback_may_remove_itself() {
    let (registry, source) = registry_with_source("I1");
    let (tx, rx) = mpsc::channel();
    let handle = connected_handle(&registry, "I1", 0);
    let own_id: Arc<Mutex<Option<InterruptUserId>>> = Arc::default();

    let slot = Arc::clone(&own_id);
    let list = source.clone();
    let id = handle
        .add_interrupt_user(&source, move |handle, _| {
            if let Some(id) = slot.lock().take() {
                handle.remove_interrupt_user(&list, id).unwrap();
            }
            let _ = tx.send(list.user_count());
        })
        .unwrap();
    *own_id.lock() = Some(id);

    assert_eq!(source.interrupt_start().notify(&()), 1);
    // The removal was only queued while the walk ran.
    assert_eq!(collect(&rx, 1), vec![1]);
    assert_eq!(source.user_count(), 0);
    assert_eq!(source.interrupt_start().notify(&()), 0);
}

#[test]
fn test_remove_unknown_user() {
    let (registry, source) = registry_with_source("I1");
    let (tx, _rx) = mpsc::channel();
    let handle = connected_handle(&registry, "I1", 0);
    let id = listen(&handle, &source, "once", &tx);

    handle.remove_interrupt_user(&source, id).unwrap();
    assert!(matches!(
        handle.remove_interrupt_user(&source, id),
        Err(Error::InterruptUserNotFound)
    ));
    assert!(handle.error_message().contains("not registered"));
}

#[test]
fn test_user_must_be_bound_to_source_port() {
    let (registry, source) = registry_with_source("I1");
    registry
        .register_port("I2", asyn_manager::PortConfig::default().with_auto_connect(false))
        .unwrap();
    let elsewhere = connected_handle(&registry, "I2", 0);
    let err = elsewhere
        .add_interrupt_user(&source, |_, _| {})
        .unwrap_err();
    assert!(matches!(err, Error::Generic(_)));
    assert!(elsewhere.error_message().contains("addInterruptUser"));

    let unbound = registry.create_request_handle(|_| {}).unwrap();
    assert!(matches!(
        unbound.add_interrupt_user(&source, |_, _| {}),
        Err(Error::NotConnected { op: "addInterruptUser" })
    ));
    assert_eq!(source.user_count(), 0);
}

#[test]
fn test_dropped_handle_is_skipped_and_pruned() {
    let (registry, source) = registry_with_source("I1");
    let (tx, rx) = mpsc::channel();
    let handle = connected_handle(&registry, "I1", 0);
    listen(&handle, &source, "gone", &tx);
    drop(handle);

    let walk = source.interrupt_start();
    assert_eq!(walk.notify(&5i32), 0);
    walk.end();
    assert_quiet(&rx);
    assert_eq!(source.user_count(), 0);
}
