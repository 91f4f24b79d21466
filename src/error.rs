//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::SocketAddr;

use tracing::warn;

use crate::packet::RejectReason;

// BFD errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors.
    IoError(IoError),
    // A received packet demuxed to no known session (by discriminator nor
    // by source address). The responder never synthesises a session.
    SessionNotFound { src: SocketAddr, your_discr: u32 },
}

// BFD I/O errors.
#[derive(Debug)]
pub enum IoError {
    UdpSocketOpenError(std::io::Error),
    UdpRecvError(std::io::Error),
    UdpSendError(std::io::Error),
    UdpRecvTruncated,
    UdpRecvMissingSourceAddr,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::SessionNotFound { src, your_discr } => {
                warn!(%src, %your_discr, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::SessionNotFound { .. } => {
                write!(f, "no session matches received packet")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::SessionNotFound { .. } => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::UdpSocketOpenError(error)
            | IoError::UdpRecvError(error)
            | IoError::UdpSendError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::UdpRecvTruncated | IoError::UdpRecvMissingSourceAddr => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::UdpSocketOpenError(..) => {
                write!(f, "failed to open UDP socket")
            }
            IoError::UdpRecvError(..) => {
                write!(f, "failed to receive UDP packet")
            }
            IoError::UdpSendError(..) => {
                write!(f, "failed to send UDP packet")
            }
            IoError::UdpRecvTruncated => {
                write!(f, "received packet truncated before the mandatory section")
            }
            IoError::UdpRecvMissingSourceAddr => {
                write!(
                    f,
                    "failed to retrieve source address from received packet"
                )
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::UdpSocketOpenError(error)
            | IoError::UdpRecvError(error)
            | IoError::UdpSendError(error) => Some(error),
            IoError::UdpRecvTruncated | IoError::UdpRecvMissingSourceAddr => {
                None
            }
        }
    }
}

// Logs a malformed packet's rejection reason at verbose (debug) level,
// not as a warn-level `Error` — see DESIGN.md on the distinction between
// this module and `debug.rs`.
pub(crate) fn log_rejected(name: &str, reason: RejectReason) {
    crate::debug::Debug::PacketRejected(name, &reason.to_string()).log();
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
