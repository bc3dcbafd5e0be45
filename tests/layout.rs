// Layout conformance tests for the shared channel header.
// These assert sizes, alignments, and field offsets for the structs both
// cores read out of shared memory, and print the observed values to aid
// debugging when a mismatch occurs on a given platform.

use memoffset::offset_of;
use sblock_ipc::sblock::layout::{BlockDesc, ChannelGeometry, RingHalf, RingHeader, SblockHeader};
use std::mem::{align_of, size_of};

#[test]
fn test_block_desc_layout() {
    let size = size_of::<BlockDesc>();
    let align = align_of::<BlockDesc>();
    let off_addr = offset_of!(BlockDesc, addr);
    let off_length = offset_of!(BlockDesc, length);

    println!(
        "BlockDesc => size: {size}, align: {align}, offsets: [addr:{off_addr}, length:{off_length}]"
    );

    assert_eq!(size, 8);
    assert_eq!(align, align_of::<u32>());
    assert_eq!(off_addr, 0);
    assert_eq!(off_length, 4);
}

#[test]
fn test_ring_half_layout() {
    // Six u32 words, no padding.
    let size = size_of::<RingHalf>();
    let align = align_of::<RingHalf>();
    let off_block_addr = offset_of!(RingHalf, block_addr);
    let off_block_count = offset_of!(RingHalf, block_count);
    let off_block_size = offset_of!(RingHalf, block_size);
    let off_blks_addr = offset_of!(RingHalf, blks_addr);
    let off_read_ptr = offset_of!(RingHalf, read_ptr);
    let off_write_ptr = offset_of!(RingHalf, write_ptr);

    println!(
        "RingHalf => size: {size}, align: {align}, offsets: [block_addr:{off_block_addr}, block_count:{off_block_count}, block_size:{off_block_size}, blks_addr:{off_blks_addr}, read_ptr:{off_read_ptr}, write_ptr:{off_write_ptr}]"
    );

    assert_eq!(size, 24);
    assert_eq!(align, align_of::<u32>());
    assert_eq!(off_block_addr, 0);
    assert_eq!(off_block_count, 4);
    assert_eq!(off_block_size, 8);
    assert_eq!(off_blks_addr, 12);
    assert_eq!(off_read_ptr, 16);
    assert_eq!(off_write_ptr, 20);
}

#[test]
fn test_channel_header_layout() {
    // Ring header first, pool header second, tx before rx inside each.
    assert_eq!(size_of::<RingHeader>(), 48);
    assert_eq!(offset_of!(RingHeader, tx), 0);
    assert_eq!(offset_of!(RingHeader, rx), 24);

    let size = size_of::<SblockHeader>();
    let off_ring = offset_of!(SblockHeader, ring);
    let off_pool = offset_of!(SblockHeader, pool);
    println!("SblockHeader => size: {size}, offsets: [ring:{off_ring}, pool:{off_pool}]");

    assert_eq!(size, 96);
    assert_eq!(off_ring, 0);
    assert_eq!(off_pool, 48);
}

#[test]
fn test_region_size_formula() {
    // header + both descriptor runs (ring view and pool view) + data.
    let geo = ChannelGeometry {
        tx_count: 16,
        tx_size: 256,
        rx_count: 8,
        rx_size: 512,
    };
    let layout = geo.layout();
    let expected =
        size_of::<SblockHeader>() + (16 + 8) * size_of::<BlockDesc>() * 2 + 16 * 256 + 8 * 512;
    println!(
        "RegionLayout => total: {}, expected: {}",
        layout.total, expected
    );
    assert_eq!(layout.total, expected);

    // Descriptor runs must not overlap each other or the data bands.
    assert!(layout.ring_tx_blks < layout.ring_rx_blks);
    assert!(layout.ring_rx_blks < layout.pool_tx_blks);
    assert!(layout.pool_tx_blks < layout.pool_rx_blks);
    assert!(layout.pool_rx_blks < layout.tx_data);
    assert!(layout.tx_data < layout.rx_data);
}
