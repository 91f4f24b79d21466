//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use derive_new::new;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

//
// BFD Control Packet Format (RFC 5880 §4.1). No optional sections: this
// daemon never authenticates and never implements the Echo function, so
// the mandatory 24-byte section is the whole packet.
//
//  0                   1                   2                   3
//  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |Vers |  Diag   |Sta|P|F|C|A|D|M|  Detect Mult  |    Length     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                       My Discriminator                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                      Your Discriminator                       |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                    Desired Min TX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                   Required Min RX Interval                    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                 Required Min Echo RX Interval                 |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, new, PartialEq)]
pub struct Packet {
    #[new(value = "1")]
    pub version: u8,
    pub diag: u8,
    pub state: State,
    pub flags: PacketFlags,
    pub detect_mult: u8,
    pub my_discr: u32,
    pub your_discr: u32,
    pub desired_min_tx: u32,
    pub req_min_rx: u32,
    pub req_min_echo_rx: u32,
}

// Local/remote session state, carried on the wire as a 2-bit field.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
pub enum State {
    AdminDown = 0,
    Down = 1,
    Init = 2,
    Up = 3,
}

// BFD Diagnostic Codes. This daemon validates against the 0..=8 range
// keepalived's `BFD_VALID_DIAG` macro uses; a packet carrying the
// IANA-registered value 9 (MisConnectivity) is rejected as out of range,
// same as any other unassigned value (see DESIGN.md Open Question 1).
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq)]
pub enum DiagnosticCode {
    Nothing = 0,
    TimeExpired = 1,
    EchoFailed = 2,
    NbrDown = 3,
    FwdPlaneReset = 4,
    PathDown = 5,
    ConcatPathDown = 6,
    AdminDown = 7,
    RevConcatPathDown = 8,
}

// BFD packet flags (byte 1, low 6 bits).
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct PacketFlags: u8 {
        const P = 1 << 5;
        const F = 1 << 4;
        const C = 1 << 3;
        const A = 1 << 2;
        const D = 1 << 1;
        const M = 1 << 0;
    }
}

// Reasons a received buffer is rejected before it can affect any session
// state. Every variant here corresponds to one bullet of §4.1 Validate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    TooShort,
    LengthMismatch,
    Gtsm { ttl: u8 },
    VersionMismatch(u8),
    DetectMultZero,
    MultipointSet,
    MyDiscrZero,
    YourDiscrZero,
    PollAndFinal,
    StateOutOfRange(u8),
    DiagOutOfRange(u8),
    AuthUnsupported,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooShort => write!(f, "packet shorter than 24 bytes"),
            RejectReason::LengthMismatch => {
                write!(f, "header length does not match received length")
            }
            RejectReason::Gtsm { ttl } => {
                write!(f, "GTSM violation: received TTL {ttl} != 255")
            }
            RejectReason::VersionMismatch(v) => {
                write!(f, "unsupported version {v}")
            }
            RejectReason::DetectMultZero => write!(f, "detect mult is zero"),
            RejectReason::MultipointSet => write!(f, "multipoint bit set"),
            RejectReason::MyDiscrZero => write!(f, "my discriminator is zero"),
            RejectReason::YourDiscrZero => {
                write!(f, "your discriminator is zero outside Down/AdminDown")
            }
            RejectReason::PollAndFinal => write!(f, "poll and final both set"),
            RejectReason::StateOutOfRange(s) => {
                write!(f, "state {s} out of range")
            }
            RejectReason::DiagOutOfRange(d) => {
                write!(f, "diagnostic {d} out of range")
            }
            RejectReason::AuthUnsupported => {
                write!(f, "authentication bit set, unsupported")
            }
        }
    }
}

impl std::error::Error for RejectReason {}

// ===== impl Packet =====

impl Packet {
    pub const VERSION: u8 = 1;
    pub const MANDATORY_SECTION_LEN: u8 = 24;

    // Encodes the packet into a fresh 24-byte buffer. Reserved bits
    // (cplane, auth, multipoint, echo_rx) are always written as zero.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::MANDATORY_SECTION_LEN as usize);

        buf.put_u8((self.version << 5) | self.diag);
        buf.put_u8(((self.state as u8) << 6) | self.flags.bits());
        buf.put_u8(self.detect_mult);
        buf.put_u8(Self::MANDATORY_SECTION_LEN);
        buf.put_u32(self.my_discr);
        buf.put_u32(self.your_discr);
        buf.put_u32(self.desired_min_tx);
        buf.put_u32(self.req_min_rx);
        buf.put_u32(0);

        buf
    }

    // Parses and validates a received buffer in one pass, in the exact
    // order keepalived's `bfd_check_packet` uses. `ttl` is the ancillary
    // TTL/hop-limit retrieved from the socket, if the kernel supplied it;
    // `None` (no ancillary data delivered) is tolerated, not rejected.
    pub fn parse_and_validate(
        data: &[u8],
        ttl: Option<u8>,
    ) -> Result<Packet, RejectReason> {
        if data.len() < Self::MANDATORY_SECTION_LEN as usize {
            return Err(RejectReason::TooShort);
        }

        let length = data[3];
        if length as usize != data.len() {
            return Err(RejectReason::LengthMismatch);
        }

        if let Some(ttl) = ttl {
            if ttl != 255 {
                return Err(RejectReason::Gtsm { ttl });
            }
        }

        let version = data[0] >> 5;
        if version != Self::VERSION {
            return Err(RejectReason::VersionMismatch(version));
        }

        let detect_mult = data[2];
        if detect_mult == 0 {
            return Err(RejectReason::DetectMultZero);
        }

        let flags = PacketFlags::from_bits_truncate(data[1] & 0x3F);
        if flags.contains(PacketFlags::M) {
            return Err(RejectReason::MultipointSet);
        }

        let my_discr = u32::from_be_bytes(data[4..8].try_into().unwrap());
        if my_discr == 0 {
            return Err(RejectReason::MyDiscrZero);
        }

        let your_discr = u32::from_be_bytes(data[8..12].try_into().unwrap());
        let state_raw = data[1] >> 6;
        let Some(state) = State::from_u8(state_raw) else {
            return Err(RejectReason::StateOutOfRange(state_raw));
        };
        if your_discr == 0 && !matches!(state, State::Down | State::AdminDown) {
            return Err(RejectReason::YourDiscrZero);
        }

        if flags.contains(PacketFlags::P) && flags.contains(PacketFlags::F) {
            return Err(RejectReason::PollAndFinal);
        }

        let diag = data[0] & 0x1F;
        if DiagnosticCode::from_u8(diag).is_none() {
            return Err(RejectReason::DiagOutOfRange(diag));
        }

        if flags.contains(PacketFlags::A) {
            return Err(RejectReason::AuthUnsupported);
        }

        let desired_min_tx = u32::from_be_bytes(data[12..16].try_into().unwrap());
        let req_min_rx = u32::from_be_bytes(data[16..20].try_into().unwrap());
        let req_min_echo_rx = u32::from_be_bytes(data[20..24].try_into().unwrap());

        Ok(Packet {
            version,
            diag,
            state,
            flags,
            detect_mult,
            my_discr,
            your_discr,
            desired_min_tx,
            req_min_rx,
            req_min_echo_rx,
        })
    }
}
