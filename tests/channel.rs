// End-to-end channel behaviour over the in-process fabric: handshake,
// pool exhaustion, timeout semantics, edge-triggered doorbells, poll.
#![cfg(target_os = "linux")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sblock_ipc::{
    ChannelGeometry, SblockChannel, SblockError, SblockEvent, SblockManager, Side, SipcFabric,
};

const CP: u8 = 5; // destination core id as seen from the host
const AP: u8 = 0; // destination core id as seen from the client
const CHAN: u8 = 3;

const GEO: ChannelGeometry = ChannelGeometry {
    tx_count: 4,
    tx_size: 128,
    rx_count: 4,
    rx_size: 128,
};

struct Pair {
    _host_mgr: SblockManager,
    _client_mgr: SblockManager,
    host: Arc<SblockChannel>,
    client: Arc<SblockChannel>,
    fabric: Arc<SipcFabric>,
}

fn connect(geo: ChannelGeometry, client_cb: Option<sblock_ipc::EventCallback>) -> Pair {
    let fabric = SipcFabric::new(0x8000_0000);
    let host_mgr = SblockManager::new();
    host_mgr.attach_core(CP, fabric.attach(Side::Local)).unwrap();
    let client_mgr = SblockManager::new();
    client_mgr
        .attach_core(AP, fabric.attach(Side::Remote))
        .unwrap();

    let host = host_mgr.create_host(CP, CHAN, geo, None).unwrap();
    let client = client_mgr.create_client(AP, CHAN, client_cb).unwrap();

    assert!(host.wait_until_ready(5000), "host handshake timed out");
    assert!(client.wait_until_ready(5000), "client handshake timed out");

    Pair {
        _host_mgr: host_mgr,
        _client_mgr: client_mgr,
        host,
        client,
        fabric,
    }
}

#[test]
fn handshake_brings_both_ends_ready() {
    let pair = connect(GEO, None);
    assert!(pair.host.is_ready());
    assert!(pair.client.is_ready());
    assert_eq!(pair.host.free_count(), 4);
    assert_eq!(pair.client.free_count(), 4);
    assert_eq!(pair.host.arrived_count(), 0);
}

#[test]
fn client_ops_fail_before_handshake() {
    let fabric = SipcFabric::new(0x8000_0000);
    let client_mgr = SblockManager::new();
    client_mgr
        .attach_core(AP, fabric.attach(Side::Remote))
        .unwrap();
    // No host: the client stays Idle.
    let client = client_mgr.create_client(AP, CHAN, None).unwrap();
    assert!(matches!(client.get(0), Err(SblockError::NotReady)));
    assert!(matches!(client.receive(0), Err(SblockError::NotReady)));
}

#[test]
fn pool_exhaustion_and_put() {
    // Four gets drain the pool; the fifth poll-mode get reports NoData
    // until one buffer is handed back.
    let pair = connect(GEO, None);
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pair.host.get(0).unwrap());
    }
    assert_eq!(pair.host.free_count(), 0);
    assert!(matches!(pair.host.get(0), Err(SblockError::NoData)));

    pair.host.put(held.pop().unwrap()).unwrap();
    assert_eq!(pair.host.free_count(), 1);
    let again = pair.host.get(0).unwrap();
    assert_eq!(again.capacity(), 128);
}

#[test]
fn roundtrip_send_receive_release() {
    let pair = connect(GEO, None);

    let mut buf = pair.host.get(0).unwrap();
    buf.write(b"hello companion core").unwrap();
    pair.host.send(buf).unwrap();

    assert_eq!(pair.client.arrived_count(), 1);
    let rx = pair.client.receive(1000).unwrap();
    assert_eq!(rx.as_slice(), b"hello companion core");
    pair.client.release(rx).unwrap();

    // The released block is free for the producer again.
    assert_eq!(pair.host.free_count(), 4);
}

#[test]
fn timeout_semantics() {
    let pair = connect(GEO, None);
    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pair.host.get(0).unwrap());
    }

    // Poll mode returns immediately.
    let start = Instant::now();
    assert!(matches!(pair.host.get(0), Err(SblockError::NoData)));
    assert!(start.elapsed() < Duration::from_millis(10));

    // A bounded wait on a pool that stays empty expires at the bound.
    let start = Instant::now();
    assert!(matches!(pair.host.get(100), Err(SblockError::Timeout)));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1000), "woke late: {elapsed:?}");

    // A bounded wait succeeds when a buffer shows up mid-wait.
    let host = pair.host.clone();
    let returner = thread::spawn({
        let buf = held.pop().unwrap();
        move || {
            thread::sleep(Duration::from_millis(50));
            host.put(buf).unwrap();
        }
    });
    let start = Instant::now();
    let buf = pair.host.get(1000).unwrap();
    assert!(start.elapsed() < Duration::from_millis(1000));
    returner.join().unwrap();
    pair.host.put(buf).unwrap();
}

#[test]
fn send_prepare_signals_only_on_the_empty_edge() {
    // Three buffers published without an explicit doorbell: the consumer
    // side is signalled exactly once (empty→non-empty edge) and then
    // drains all three without any further signal.
    let wakeups = Arc::new(AtomicUsize::new(0));
    let cb_wakeups = wakeups.clone();
    let pair = connect(
        GEO,
        Some(Box::new(move |event| {
            if event == SblockEvent::DataReady {
                cb_wakeups.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    for i in 0u8..3 {
        let mut buf = pair.host.get(1000).unwrap();
        buf.write(&[i; 16]).unwrap();
        pair.host.send_prepare(buf).unwrap();
    }

    // Give the doorbell time to arrive, then check it rang exactly once.
    let deadline = Instant::now() + Duration::from_secs(5);
    while wakeups.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);

    for i in 0u8..3 {
        let rx = pair.client.receive(0).unwrap();
        assert_eq!(rx.as_slice(), &[i; 16]);
        pair.client.release(rx).unwrap();
    }
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn send_finish_flushes_a_parked_batch() {
    let wakeups = Arc::new(AtomicUsize::new(0));
    let cb_wakeups = wakeups.clone();
    let pair = connect(
        GEO,
        Some(Box::new(move |event| {
            if event == SblockEvent::DataReady {
                cb_wakeups.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    // First publish edge-signals; the second sits in the ring silently.
    let mut buf = pair.host.get(0).unwrap();
    buf.write(b"head").unwrap();
    pair.host.send_prepare(buf).unwrap();
    let mut buf = pair.host.get(0).unwrap();
    buf.write(b"tail").unwrap();
    pair.host.send_prepare(buf).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while wakeups.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(wakeups.load(Ordering::SeqCst), 1);

    // Flushing a non-empty ring rings the doorbell again.
    pair.host.send_finish().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while wakeups.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(wakeups.load(Ordering::SeqCst), 2);

    let rx = pair.client.receive(1000).unwrap();
    assert_eq!(rx.as_slice(), b"head");
    let rx2 = pair.client.receive(1000).unwrap();
    assert_eq!(rx2.as_slice(), b"tail");
    pair.client.release(rx).unwrap();
    pair.client.release(rx2).unwrap();
}

#[test]
fn poll_reflects_both_directions() {
    let pair = connect(GEO, None);

    let flags = pair.host.poll();
    assert!(flags.writable);
    assert!(!flags.readable);

    let mut buf = pair.host.get(0).unwrap();
    buf.write(b"x").unwrap();
    pair.host.send(buf).unwrap();

    let flags = pair.client.poll();
    assert!(flags.readable);

    let rx = pair.client.receive(1000).unwrap();
    pair.client.release(rx).unwrap();
    assert!(!pair.client.poll().readable);
}

#[test]
fn graceful_destroy_notifies_the_peer() {
    let closed = Arc::new(AtomicUsize::new(0));
    let cb_closed = closed.clone();
    let pair = connect(
        GEO,
        Some(Box::new(move |event| {
            if event == SblockEvent::Closed {
                cb_closed.fetch_add(1, Ordering::SeqCst);
            }
        })),
    );

    pair._host_mgr.destroy(CP, CHAN).unwrap();

    // The client hears the CLOSE and drops to Idle.
    let deadline = Instant::now() + Duration::from_secs(5);
    while pair.client.is_ready() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!pair.client.is_ready());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(matches!(pair.client.get(0), Err(SblockError::NotReady)));
}

#[test]
fn resource_gate_blocks_acquisition_until_resumed() {
    // With the shared-memory domain gated, a get parks inside the
    // resource acquisition even though free buffers exist.
    let pair = connect(GEO, None);
    pair.fabric.resource().suspend();

    let host = pair.host.clone();
    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    let getter = thread::spawn(move || {
        let buf = host.get(-1).unwrap();
        done2.fetch_add(1, Ordering::SeqCst);
        host.put(buf).unwrap();
    });

    thread::sleep(Duration::from_millis(100));
    assert_eq!(done.load(Ordering::SeqCst), 0, "get ran through a gated domain");

    pair.fabric.resource().resume();
    getter.join().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
}
