// Loopback demo: a host producer and a client consumer on one channel,
// streaming SHA-256-checksummed frames until the count is reached or
// Ctrl-C is pressed.
//
// Usage: cargo run --example loopback [num_frames]

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use sha2::{Digest, Sha256};

use sblock_ipc::{ChannelGeometry, SblockError, SblockManager, Side, SipcFabric};

const CP: u8 = 5;
const AP: u8 = 0;
const CHAN: u8 = 0;

const DATA_LEN: usize = 64;

fn main() -> sblock_ipc::Result<()> {
    let args: Vec<String> = env::args().collect();
    let num_frames: u64 = args
        .get(1)
        .map(|s| s.parse().expect("Invalid number of frames"))
        .unwrap_or(10_000);

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let fabric = SipcFabric::new(0x8000_0000);
    let host_mgr = SblockManager::new();
    host_mgr.attach_core(CP, fabric.attach(Side::Local))?;
    let client_mgr = SblockManager::new();
    client_mgr.attach_core(AP, fabric.attach(Side::Remote))?;

    let host = host_mgr.create_host(
        CP,
        CHAN,
        ChannelGeometry {
            tx_count: 64,
            tx_size: 256,
            rx_count: 64,
            rx_size: 256,
        },
        None,
    )?;
    let client = client_mgr.create_client(AP, CHAN, None)?;
    assert!(host.wait_until_ready(5000), "handshake timed out");
    assert!(client.wait_until_ready(5000), "handshake timed out");
    println!("Channel ready, streaming {num_frames} frames of {DATA_LEN} bytes...");

    let consumer_running = running.clone();
    let consumer = thread::spawn(move || {
        let mut verified = 0u64;
        loop {
            let rx = match client.receive(200) {
                Ok(rx) => rx,
                Err(SblockError::Timeout) | Err(SblockError::WouldBlock) => {
                    if !consumer_running.load(Ordering::SeqCst) {
                        break;
                    }
                    continue;
                }
                Err(_) => break,
            };
            let frame = rx.as_slice();
            let (digest, data) = frame.split_at(32);
            let mut hasher = Sha256::new();
            hasher.update(data);
            if hasher.finalize().as_slice() != digest {
                eprintln!("Checksum mismatch at frame {verified}!");
                client.release(rx).unwrap();
                break;
            }
            verified += 1;
            client.release(rx).unwrap();
            if verified % 1000 == 0 {
                println!("Consumer: verified {verified} frames");
            }
        }
        verified
    });

    let start = Instant::now();
    let mut sent = 0u64;
    while sent < num_frames && running.load(Ordering::SeqCst) {
        let mut buf = match host.get(200) {
            Ok(buf) => buf,
            Err(SblockError::Timeout) | Err(SblockError::WouldBlock) => continue,
            Err(e) => return Err(e),
        };
        let mut data = [0u8; DATA_LEN];
        data[..8].copy_from_slice(&sent.to_le_bytes());
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();

        let mut frame = Vec::with_capacity(32 + DATA_LEN);
        frame.extend_from_slice(&digest);
        frame.extend_from_slice(&data);
        buf.write(&frame)?;
        host.send(buf)?;
        sent += 1;
    }
    let elapsed = start.elapsed();

    // Let the consumer drain, then stop it.
    while host.free_count() < 64 && running.load(Ordering::SeqCst) {
        thread::sleep(std::time::Duration::from_millis(10));
    }
    running.store(false, Ordering::SeqCst);
    let verified = consumer.join().unwrap();

    println!(
        "Sent {sent} frames in {:.2?} ({:.0} frames/sec), verified {verified}",
        elapsed,
        sent as f64 / elapsed.as_secs_f64()
    );
    host_mgr.destroy(CP, CHAN)?;
    Ok(())
}
