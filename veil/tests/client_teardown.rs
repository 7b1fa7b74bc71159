//! Channel teardown and client disconnect

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{device, grant_request, PEER, SELF};
use nyx_veil::cleanup::CleanupReport;
use nyx_veil::types::ClientId;

#[test]
fn no_event_after_close_returns() {
    let (lb, device) = device();
    let client = ClientId(1);

    for _ in 0..20 {
        let (handle, event) = lb.create_event(client);
        let port = device.bind_unbound_channel(client, PEER, false, handle).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let injector = {
            let lb = lb.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut cpu = 0;
                while !stop.load(Ordering::Relaxed) {
                    let _ = lb.inject(port, cpu);
                    cpu += 1;
                }
            })
        };

        thread::sleep(Duration::from_millis(2));
        device.close_channel(client, port).unwrap();
        event.reset();

        thread::sleep(Duration::from_millis(5));
        assert!(!event.is_set(), "event set after close of {port}");

        stop.store(true, Ordering::Relaxed);
        injector.join().unwrap();
    }
}

#[test]
fn signal_reaches_event_through_interdomain_loop() {
    let (lb, device) = device();
    let a = ClientId(1);
    let b = ClientId(2);
    let (ha, ea) = lb.create_event(a);
    let (hb, _) = lb.create_event(b);

    let a_port = device.bind_unbound_channel(a, SELF, false, ha).unwrap();
    let b_port = device
        .bind_interdomain_channel(b, SELF, a_port, false, hb)
        .unwrap();

    device.notify_channel(b, b_port).unwrap();
    assert!(ea.wait_timeout(Duration::from_secs(5)));

    // delivery re-arms, so a second notify arrives too
    device.notify_channel(b, b_port).unwrap();
    assert!(ea.wait_timeout(Duration::from_secs(5)));
}

#[test]
fn disconnect_tears_down_exactly_once() {
    let (lb, device) = device();
    let client = ClientId(1);
    let bystander = ClientId(2);
    let (handle, _) = lb.create_event(client);
    let (other, _) = lb.create_event(bystander);

    for i in 0..4 {
        device.add_watch(client, &format!("device/{i}"), handle).unwrap();
    }
    for _ in 0..3 {
        device.bind_unbound_channel(client, PEER, false, handle).unwrap();
    }
    device.add_watch(bystander, "device", other).unwrap();
    device.bind_unbound_channel(bystander, PEER, false, other).unwrap();
    device
        .permit_foreign_access(client, &grant_request(PEER, 1, 1))
        .unwrap();

    let report = device.cleanup_client(client);
    assert_eq!(report, CleanupReport { watches: 4, channels: 3 });
    assert_eq!(device.cleanup_client(client), CleanupReport::default());

    let stats = lb.stats();
    assert_eq!(stats.watches, 1);
    assert_eq!(stats.open_channels, 1);
    assert_eq!(stats.violations, 0);

    // parked grants need a cancel
    assert_eq!(device.pending_count(), 1);
    assert_eq!(device.cancel_client(client), 1);
    device.flush();
    assert_eq!(lb.stats().active_grants, 0);
}
