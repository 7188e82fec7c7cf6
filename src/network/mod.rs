//! BACnet Network Layer Module
//!
//! The network layer wraps every APDU in an NPDU header (ASHRAE 135
//! Clause 6): a protocol version octet, a control octet describing what
//! follows, optional destination and source network addresses for routed
//! traffic, and a hop count. Network-layer protocol messages
//! (Who-Is-Router-To-Network and friends) travel in the same envelope with
//! the network-message control bit set and a message type octet instead of
//! an APDU.
//!
//! This module is a pure codec. Routing itself is out of scope; the
//! dispatcher hands decoded network-layer messages to a registered handler
//! and everything else down the APDU path.

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{format, string::String, string::ToString, vec::Vec};

use crate::util::Buffer;

/// Result type for network layer operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, NetworkError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, NetworkError>;

/// NPDU protocol version, constant since the original standard.
pub const NPDU_PROTOCOL_VERSION: u8 = 0x01;

/// Network number meaning "every network" in a destination specifier.
pub const GLOBAL_BROADCAST_NETWORK: u16 = 0xFFFF;

/// Longest MAC address carried in a DADR/SADR field.
pub const MAX_MAC_LEN: usize = 7;

/// Errors that can occur in network layer operations
#[derive(Debug)]
pub enum NetworkError {
    /// Header could not be parsed; the PDU is dropped.
    Malformed(String),
    /// Address fields violate the addressing invariants.
    InvalidAddress(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Malformed(msg) => write!(f, "Malformed NPDU: {}", msg),
            NetworkError::InvalidAddress(msg) => write!(f, "Invalid network address: {}", msg),
        }
    }
}

#[cfg(feature = "std")]
impl Error for NetworkError {}

/// Network layer message types (Clause 6.2.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetworkMessageType {
    WhoIsRouterToNetwork = 0x00,
    IAmRouterToNetwork = 0x01,
    ICouldBeRouterToNetwork = 0x02,
    RejectMessageToNetwork = 0x03,
    RouterBusyToNetwork = 0x04,
    RouterAvailableToNetwork = 0x05,
    InitializeRoutingTable = 0x06,
    InitializeRoutingTableAck = 0x07,
    EstablishConnectionToNetwork = 0x08,
    DisconnectConnectionToNetwork = 0x09,
    WhatIsNetworkNumber = 0x12,
    NetworkNumberIs = 0x13,
}

impl NetworkMessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::WhoIsRouterToNetwork),
            0x01 => Some(Self::IAmRouterToNetwork),
            0x02 => Some(Self::ICouldBeRouterToNetwork),
            0x03 => Some(Self::RejectMessageToNetwork),
            0x04 => Some(Self::RouterBusyToNetwork),
            0x05 => Some(Self::RouterAvailableToNetwork),
            0x06 => Some(Self::InitializeRoutingTable),
            0x07 => Some(Self::InitializeRoutingTableAck),
            0x08 => Some(Self::EstablishConnectionToNetwork),
            0x09 => Some(Self::DisconnectConnectionToNetwork),
            0x12 => Some(Self::WhatIsNetworkNumber),
            0x13 => Some(Self::NetworkNumberIs),
            _ => None,
        }
    }
}

/// NPDU control octet flags (Clause 6.2.2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpduControl {
    /// Payload is a network layer message, not an APDU
    pub network_message: bool,
    /// Destination specifier (DNET/DLEN/DADR, hop count) present
    pub destination_present: bool,
    /// Source specifier (SNET/SLEN/SADR) present
    pub source_present: bool,
    /// Originator expects a reply to this PDU
    pub expecting_reply: bool,
    /// Network priority (0-3, 0 = normal)
    pub priority: u8,
}

impl NpduControl {
    /// Pack the flags into the control octet.
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.network_message {
            byte |= 0x80;
        }
        if self.destination_present {
            byte |= 0x20;
        }
        if self.source_present {
            byte |= 0x08;
        }
        if self.expecting_reply {
            byte |= 0x04;
        }
        byte |= self.priority & 0x03;
        byte
    }

    /// Unpack a control octet. Bits 6 and 4 are reserved and ignored.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            network_message: (byte & 0x80) != 0,
            destination_present: (byte & 0x20) != 0,
            source_present: (byte & 0x08) != 0,
            expecting_reply: (byte & 0x04) != 0,
            priority: byte & 0x03,
        }
    }
}

/// A network number plus a MAC address on that network.
///
/// Addressing invariants: network 0 means "this network" and carries no
/// MAC; a broadcast on a remote network is written with an empty MAC
/// (`len = 0`); MACs are at most [`MAX_MAC_LEN`] octets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    /// Network number (0 = local, 0xFFFF = every network)
    pub network: u16,
    /// MAC address on that network; empty means broadcast
    pub address: Vec<u8>,
}

impl NetworkAddress {
    pub fn new(network: u16, address: Vec<u8>) -> Self {
        Self { network, address }
    }

    /// Broadcast on every network.
    pub fn global_broadcast() -> Self {
        Self {
            network: GLOBAL_BROADCAST_NETWORK,
            address: Vec::new(),
        }
    }

    /// Broadcast on a specific remote network.
    pub fn remote_broadcast(network: u16) -> Self {
        Self {
            network,
            address: Vec::new(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.address.is_empty()
    }

    pub fn is_global_broadcast(&self) -> bool {
        self.network == GLOBAL_BROADCAST_NETWORK
    }

    pub fn is_local(&self) -> bool {
        self.network == 0
    }

    /// Enforce the addressing invariants above.
    pub fn validate(&self) -> Result<()> {
        if self.address.len() > MAX_MAC_LEN {
            return Err(NetworkError::InvalidAddress(
                "MAC longer than 7 octets".to_string(),
            ));
        }
        if self.network == 0 && !self.address.is_empty() {
            return Err(NetworkError::InvalidAddress(
                "local network carries no MAC in the NPDU".to_string(),
            ));
        }
        if self.is_global_broadcast() && !self.address.is_empty() {
            return Err(NetworkError::InvalidAddress(
                "global broadcast carries no MAC".to_string(),
            ));
        }
        Ok(())
    }
}

/// Network Protocol Data Unit header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npdu {
    /// Protocol version, always [`NPDU_PROTOCOL_VERSION`]
    pub version: u8,
    /// Control information
    pub control: NpduControl,
    /// Destination network address for routed traffic
    pub destination: Option<NetworkAddress>,
    /// Source network address filled in by routers
    pub source: Option<NetworkAddress>,
    /// Hop count, present exactly when a destination is
    pub hop_count: Option<u8>,
}

impl Npdu {
    /// A local, normal-priority NPDU with no routing information.
    pub fn new() -> Self {
        Self {
            version: NPDU_PROTOCOL_VERSION,
            control: NpduControl::default(),
            destination: None,
            source: None,
            hop_count: None,
        }
    }

    /// An NPDU addressed to every device on every network.
    pub fn global_broadcast() -> Self {
        Self {
            version: NPDU_PROTOCOL_VERSION,
            control: NpduControl {
                destination_present: true,
                ..Default::default()
            },
            destination: Some(NetworkAddress::global_broadcast()),
            source: None,
            hop_count: Some(255),
        }
    }

    /// An NPDU for a confirmed request, expecting the peer to answer.
    pub fn expecting_reply() -> Self {
        let mut npdu = Self::new();
        npdu.control.expecting_reply = true;
        npdu
    }

    pub fn is_network_message(&self) -> bool {
        self.control.network_message
    }

    /// Encode the header. The control flags are derived from which
    /// specifiers are actually present, so the octet can never disagree
    /// with the fields.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        buffer.push(self.version);

        let mut control = self.control;
        control.destination_present = self.destination.is_some();
        control.source_present = self.source.is_some();
        buffer.push(control.to_byte());

        if let Some(ref dest) = self.destination {
            buffer.extend_from_slice(&dest.network.to_be_bytes());
            buffer.push(dest.address.len() as u8);
            buffer.extend_from_slice(&dest.address);
        }

        if let Some(ref src) = self.source {
            buffer.extend_from_slice(&src.network.to_be_bytes());
            buffer.push(src.address.len() as u8);
            buffer.extend_from_slice(&src.address);
        }

        if self.destination.is_some() {
            buffer.push(self.hop_count.unwrap_or(255));
        }

        buffer
    }

    /// Decode a header, returning it and the number of octets consumed.
    /// The remainder of the buffer is the APDU or network message.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut buffer = Buffer::new(data);

        let version = buffer
            .read_u8()
            .ok_or_else(|| NetworkError::Malformed("NPDU too short".to_string()))?;
        if version != NPDU_PROTOCOL_VERSION {
            return Err(NetworkError::Malformed(format!(
                "unsupported NPDU version {}",
                version
            )));
        }

        let control = NpduControl::from_byte(
            buffer
                .read_u8()
                .ok_or_else(|| NetworkError::Malformed("NPDU too short".to_string()))?,
        );

        let destination = if control.destination_present {
            Some(Self::decode_specifier(&mut buffer, "destination")?)
        } else {
            None
        };

        let source = if control.source_present {
            let address = Self::decode_specifier(&mut buffer, "source")?;
            if address.is_broadcast() {
                return Err(NetworkError::Malformed(
                    "source specifier with empty MAC".to_string(),
                ));
            }
            Some(address)
        } else {
            None
        };

        let hop_count = if destination.is_some() {
            let hc = buffer
                .read_u8()
                .ok_or_else(|| NetworkError::Malformed("missing hop count".to_string()))?;
            Some(hc)
        } else {
            None
        };

        Ok((
            Npdu {
                version,
                control,
                destination,
                source,
                hop_count,
            },
            buffer.position(),
        ))
    }

    fn decode_specifier(buffer: &mut Buffer<'_>, which: &str) -> Result<NetworkAddress> {
        let network = buffer.read_u16().ok_or_else(|| {
            NetworkError::Malformed(format!("truncated {} specifier", which))
        })?;
        let len = usize::from(buffer.read_u8().ok_or_else(|| {
            NetworkError::Malformed(format!("truncated {} specifier", which))
        })?);
        if len > MAX_MAC_LEN {
            return Err(NetworkError::Malformed(format!(
                "{} MAC length {} above limit",
                which, len
            )));
        }
        let address = buffer
            .read_bytes(len)
            .ok_or_else(|| NetworkError::Malformed(format!("truncated {} MAC", which)))?
            .to_vec();
        Ok(NetworkAddress::new(network, address))
    }
}

impl Default for Npdu {
    fn default() -> Self {
        Self::new()
    }
}

/// A network layer protocol message: one type octet plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLayerMessage {
    /// Message type; proprietary types (0x80+) keep their raw value
    pub message_type: u8,
    /// Vendor id, present for proprietary message types
    pub vendor_id: Option<u16>,
    /// Message parameters
    pub data: Vec<u8>,
}

impl NetworkLayerMessage {
    pub fn new(message_type: NetworkMessageType, data: Vec<u8>) -> Self {
        Self {
            message_type: message_type as u8,
            vendor_id: None,
            data,
        }
    }

    /// Well-known message type, if this is one.
    pub fn known_type(&self) -> Option<NetworkMessageType> {
        NetworkMessageType::from_u8(self.message_type)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(1 + self.data.len());
        buffer.push(self.message_type);
        if let Some(vendor_id) = self.vendor_id {
            buffer.extend_from_slice(&vendor_id.to_be_bytes());
        }
        buffer.extend_from_slice(&self.data);
        buffer
    }

    /// Decode the octets following a network-message NPDU header.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (&message_type, rest) = data
            .split_first()
            .ok_or_else(|| NetworkError::Malformed("empty network message".to_string()))?;

        // Proprietary message types carry the vendor id first.
        let (vendor_id, rest) = if message_type >= 0x80 {
            if rest.len() < 2 {
                return Err(NetworkError::Malformed(
                    "proprietary message without vendor id".to_string(),
                ));
            }
            (Some(u16::from_be_bytes([rest[0], rest[1]])), &rest[2..])
        } else {
            (None, rest)
        };

        Ok(Self {
            message_type,
            vendor_id,
            data: rest.to_vec(),
        })
    }
}
