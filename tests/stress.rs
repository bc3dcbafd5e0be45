// Concurrency stress: FIFO ordering, block conservation, and uniqueness
// of handed-out blocks under many producer/consumer threads.
#![cfg(target_os = "linux")]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use sblock_ipc::{
    ChannelGeometry, SblockChannel, SblockError, SblockManager, Side, SipcFabric,
};

const CP: u8 = 5;
const AP: u8 = 0;
const CHAN: u8 = 1;

struct Pair {
    _host_mgr: SblockManager,
    _client_mgr: SblockManager,
    host: Arc<SblockChannel>,
    client: Arc<SblockChannel>,
}

fn connect(geo: ChannelGeometry) -> Pair {
    let fabric = SipcFabric::new(0x8000_0000);
    let host_mgr = SblockManager::new();
    host_mgr.attach_core(CP, fabric.attach(Side::Local)).unwrap();
    let client_mgr = SblockManager::new();
    client_mgr
        .attach_core(AP, fabric.attach(Side::Remote))
        .unwrap();

    let host = host_mgr.create_host(CP, CHAN, geo, None).unwrap();
    let client = client_mgr.create_client(AP, CHAN, None).unwrap();
    assert!(host.wait_until_ready(5000));
    assert!(client.wait_until_ready(5000));

    Pair {
        _host_mgr: host_mgr,
        _client_mgr: client_mgr,
        host,
        client,
    }
}

#[test]
fn fifo_order_is_preserved() {
    let pair = connect(ChannelGeometry {
        tx_count: 8,
        tx_size: 64,
        rx_count: 8,
        rx_size: 64,
    });
    let count = 500u32;

    let host = pair.host.clone();
    let producer = thread::spawn(move || {
        for i in 0..count {
            let mut buf = loop {
                match host.get(-1) {
                    Ok(buf) => break buf,
                    Err(SblockError::WouldBlock) => continue,
                    Err(e) => panic!("get failed: {e}"),
                }
            };
            buf.write(&i.to_le_bytes()).unwrap();
            host.send(buf).unwrap();
        }
    });

    let client = pair.client.clone();
    let consumer = thread::spawn(move || {
        for expected in 0..count {
            let rx = loop {
                match client.receive(-1) {
                    Ok(rx) => break rx,
                    Err(SblockError::WouldBlock) => continue,
                    Err(e) => panic!("receive failed: {e}"),
                }
            };
            let got = u32::from_le_bytes(rx.as_slice().try_into().unwrap());
            assert_eq!(got, expected, "publish order must match receive order");
            client.release(rx).unwrap();
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();

    assert_eq!(pair.host.free_count(), 8);
    assert_eq!(pair.client.arrived_count(), 0);
}

#[test]
fn mpmc_conserves_blocks_and_never_duplicates() {
    let geo = ChannelGeometry {
        tx_count: 8,
        tx_size: 64,
        rx_count: 8,
        rx_size: 64,
    };
    let pair = connect(geo);

    let producers = 4u32;
    let per_producer = 250u32;
    let total = (producers * per_producer) as usize;

    let mut handles = vec![];
    for p_id in 0..producers {
        let host = pair.host.clone();
        handles.push(thread::spawn(move || {
            let mut sent = 0u32;
            while sent < per_producer {
                let mut buf = match host.get(-1) {
                    Ok(buf) => buf,
                    Err(SblockError::WouldBlock) => continue,
                    Err(e) => panic!("get failed: {e}"),
                };
                // Occasionally back out to exercise the put path.
                if fastrand::u32(..10) == 0 {
                    host.put(buf).unwrap();
                    continue;
                }
                let id = p_id << 16 | sent;
                buf.write(&id.to_le_bytes()).unwrap();
                host.send(buf).unwrap();
                sent += 1;
            }
        }));
    }

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let received = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let client = pair.client.clone();
        let seen = seen.clone();
        let received = received.clone();
        handles.push(thread::spawn(move || loop {
            if received.load(Ordering::SeqCst) >= total {
                break;
            }
            let rx = match client.receive(200) {
                Ok(rx) => rx,
                Err(SblockError::WouldBlock) | Err(SblockError::Timeout) => continue,
                Err(e) => panic!("receive failed: {e}"),
            };
            let id = u32::from_le_bytes(rx.as_slice().try_into().unwrap());
            client.release(rx).unwrap();
            assert!(
                seen.lock().insert(id),
                "block payload {id:#x} delivered twice"
            );
            received.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Spot-check invariants while traffic is flowing.
    for _ in 0..20 {
        if let Ok(stats) = pair.host.stats() {
            let ring_occ = stats.tx.ring_write.wrapping_sub(stats.tx.ring_read);
            let pool_occ = stats.tx.pool_write.wrapping_sub(stats.tx.pool_read);
            assert!(ring_occ <= geo.tx_count, "ring over capacity: {ring_occ}");
            assert!(pool_occ <= geo.tx_count, "pool over capacity: {pool_occ}");
        }
        thread::sleep(std::time::Duration::from_millis(5));
    }

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(received.load(Ordering::SeqCst), total);
    assert_eq!(seen.lock().len(), total);

    // At rest, every block is back in the pool: nothing leaked, nothing
    // was minted.
    assert_eq!(pair.host.free_count(), geo.tx_count);
    assert_eq!(pair.client.arrived_count(), 0);
    let stats = pair.host.stats().unwrap();
    assert_eq!(stats.tx.pending, 0);
}
