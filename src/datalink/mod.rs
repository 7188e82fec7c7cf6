//! BACnet Data Link Layer Module
//!
//! This module defines the uniform contract between the network layer and
//! the data link back-ends: the token-passing MS/TP link over RS-485 and
//! the UDP datagram transport (Annex J). Upper layers hand a finished NPDU
//! and a destination to [`DataLink::send_frame`] and poll
//! [`DataLink::receive_frame`]; everything below that line (tokens, BVLL
//! headers, CRCs) is the back-end's business.
//!
//! # Supported back-ends
//!
//! ## MS/TP (Master-Slave/Token-Passing)
//! - RS-485 half-duplex serial, token-passing medium access
//! - Master addresses 0-127, slave addresses 128-254, broadcast 255
//! - See [`mstp`]
//!
//! ## BACnet/IP datagram transport (Annex J)
//! - UDP on port 47808 (0xBAC0) with the minimal BVLL forms
//! - See [`bip`]

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(feature = "std")]
use std::net::SocketAddr;

#[cfg(not(feature = "std"))]
use alloc::{string::String, vec::Vec};

/// Result type for data link operations.
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, DataLinkError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, DataLinkError>;

/// Errors surfaced by data link back-ends.
///
/// Wire-level problems (CRC mismatches, aborted receptions, overruns) are
/// absorbed inside the MS/TP engine and show up only in its statistics;
/// this enum covers the conditions a caller can actually act on.
#[derive(Debug)]
pub enum DataLinkError {
    /// Network I/O error from the underlying socket or UART.
    #[cfg(feature = "std")]
    IoError(std::io::Error),

    /// A received frame does not conform to the expected format.
    InvalidFrame,

    /// Payload longer than the data link can carry (501 octets for MS/TP).
    FrameTooLong,

    /// Computed check sequence does not match the received one.
    CrcMismatch,

    /// Address invalid for this data link type, with context.
    AddressError(String),

    /// Requested baud rate is not in the MS/TP enumerated set.
    InvalidBaudRate(u32),

    /// Mutually exclusive configuration options were both enabled.
    ConfigConflict(&'static str),

    /// Outbound queue is full; retry after the next token hold.
    QueueFull,

    /// No frame available within the polling window.
    WouldBlock,
}

impl fmt::Display for DataLinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "std")]
            DataLinkError::IoError(e) => write!(f, "I/O error: {}", e),
            DataLinkError::InvalidFrame => write!(f, "Invalid frame format"),
            DataLinkError::FrameTooLong => write!(f, "Frame payload too long"),
            DataLinkError::CrcMismatch => write!(f, "CRC check failed"),
            DataLinkError::AddressError(msg) => write!(f, "Address error: {}", msg),
            DataLinkError::InvalidBaudRate(baud) => write!(f, "Unsupported baud rate: {}", baud),
            DataLinkError::ConfigConflict(msg) => write!(f, "Configuration conflict: {}", msg),
            DataLinkError::QueueFull => write!(f, "Outbound queue full"),
            DataLinkError::WouldBlock => write!(f, "No frame available"),
        }
    }
}

#[cfg(feature = "std")]
impl Error for DataLinkError {}

#[cfg(feature = "std")]
impl From<std::io::Error> for DataLinkError {
    fn from(error: std::io::Error) -> Self {
        DataLinkError::IoError(error)
    }
}

/// Data link technologies implemented by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataLinkType {
    /// BACnet/IP datagram transport (Annex J).
    BacnetIp,
    /// MS/TP over RS-485 (Clause 9).
    MsTP,
}

/// Common trait for data link back-ends.
///
/// Frame payloads passed through this trait are whole NPDUs: the caller
/// never sees preambles, BVLL headers, or check sequences. Implementations
/// must be `Send` so a link can be driven from a dedicated thread while the
/// application task owns the upper layers.
pub trait DataLink: Send {
    /// Queue or transmit a frame (a finished NPDU) to the destination.
    ///
    /// MS/TP queues the frame until the node next holds the token; the
    /// datagram transport sends immediately. Returns an error if the
    /// destination address type does not fit this link or the payload
    /// exceeds the link's MPDU limit.
    fn send_frame(&mut self, frame: &[u8], dest: &DataLinkAddress) -> Result<()>;

    /// Poll for a received frame.
    ///
    /// Drives the link's internal state machines where applicable and
    /// returns the oldest pending NPDU together with its source address,
    /// or [`DataLinkError::WouldBlock`] when nothing is pending.
    fn receive_frame(&mut self) -> Result<(Vec<u8>, DataLinkAddress)>;

    /// The technology behind this link.
    fn link_type(&self) -> DataLinkType;

    /// The address identifying this node on the link.
    fn local_address(&self) -> DataLinkAddress;

    /// Largest NPDU this link can carry in one frame.
    fn max_npdu(&self) -> usize;
}

/// Data link layer address.
///
/// Each variant corresponds to the addressing scheme of one back-end;
/// `Broadcast` is the logical broadcast translated by each back-end into
/// its native form (MS/TP station 255, UDP broadcast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLinkAddress {
    /// IP endpoint for the datagram transport.
    #[cfg(feature = "std")]
    Ip(SocketAddr),

    /// MS/TP station address (masters 0-127, slaves 128-254).
    MsTP(u8),

    /// Local broadcast on whatever link carries the frame.
    Broadcast,
}

impl DataLinkAddress {
    /// True if this is the logical or native broadcast address.
    pub fn is_broadcast(&self) -> bool {
        match self {
            DataLinkAddress::Broadcast => true,
            DataLinkAddress::MsTP(mac) => *mac == mstp::frame::BROADCAST_ADDRESS,
            #[cfg(feature = "std")]
            DataLinkAddress::Ip(_) => false,
        }
    }
}

/// BACnet/IP datagram transport (Annex J, minimal BVLL).
#[cfg(feature = "std")]
pub mod bip;

/// MS/TP (Master-Slave/Token-Passing) implementation: framing, CRCs,
/// RS-485 driver contract, and the receive/master/slave state machines.
pub mod mstp;

#[cfg(feature = "std")]
pub use bip::BacnetIpDataLink;

pub use mstp::{MstpConfig, MstpPort};
