//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use bfdd::packet::{Packet, PacketFlags, RejectReason, State};

//
// Helper functions.
//

fn test_decode_packet(bytes: &[u8], packet_expected: &Packet) {
    let packet_actual = Packet::parse_and_validate(bytes, Some(255)).unwrap();
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//
// A real captured wire packet. Its Required Min Echo RX Interval is
// nonzero, which this daemon happily decodes but never echoes back:
// `Packet::encode` always writes that field as zero, since the Echo
// function isn't implemented (§4 Non-goals). The two directions are
// tested separately below rather than as a single round trip.
//

static PACKET1: Lazy<(Vec<u8>, Packet)> = Lazy::new(|| {
    (
        vec![
            0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23,
            0x57, 0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0,
            0x00, 0x00, 0xc3, 0x50,
        ],
        Packet {
            version: 1,
            diag: 0,
            state: State::Up,
            flags: PacketFlags::empty(),
            detect_mult: 3,
            my_discr: 0x9fb205d6,
            your_discr: 0x4a2357dc,
            desired_min_tx: 300000,
            req_min_rx: 300000,
            req_min_echo_rx: 50000,
        },
    )
});

//
// Tests.
//

#[test]
fn test_decode_packet1() {
    let (ref bytes, ref packet) = *PACKET1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_packet1() {
    let expected = [
        0x20, 0xc0, 0x03, 0x18, 0x9f, 0xb2, 0x05, 0xd6, 0x4a, 0x23, 0x57,
        0xdc, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x04, 0x93, 0xe0, 0x00, 0x00,
        0x00, 0x00,
    ];
    let packet = Packet {
        req_min_echo_rx: 0,
        ..PACKET1.1.clone()
    };
    assert_eq!(packet.encode().as_ref(), &expected[..]);
}

#[test]
fn rejects_packet_with_bad_ttl() {
    let (ref bytes, _) = *PACKET1;
    assert_eq!(
        Packet::parse_and_validate(bytes, Some(1)),
        Err(RejectReason::Gtsm { ttl: 1 }),
    );
}

#[test]
fn rejects_truncated_packet() {
    let (ref bytes, _) = *PACKET1;
    let truncated = &bytes[..23];
    assert_eq!(
        Packet::parse_and_validate(truncated, Some(255)),
        Err(RejectReason::TooShort),
    );
}
