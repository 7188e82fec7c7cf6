//! BACnet/IP datagram transport (ASHRAE 135 Annex J)
//!
//! The UDP back-end of the [`DataLink`] contract: every NPDU rides in a
//! BVLL envelope on port 47808 (0xBAC0). Only the original-unicast,
//! original-broadcast, and forwarded-NPDU functions are handled; broadcast
//! management devices and foreign-device registration are out of scope for
//! this crate.
//!
//! Where MS/TP queues frames until the node holds the token, this
//! transport sends immediately and receives with a short socket timeout,
//! so the same polling loop drives either link.

use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::Duration,
};

use log::{debug, trace};

use crate::datalink::{DataLink, DataLinkAddress, DataLinkError, DataLinkType, Result};

/// BACnet/IP well-known port number (0xBAC0)
pub const BACNET_IP_PORT: u16 = 47808;

/// Largest NPDU a BACnet/IP frame may carry.
pub const BIP_MAX_NPDU: usize = 1497;

/// BVLL type octet for BACnet/IP.
const BVLL_TYPE_BACNET_IP: u8 = 0x81;

/// BVLL functions (Annex J.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BvllFunction {
    /// NPDU sent directly to one peer
    OriginalUnicastNpdu = 0x0A,
    /// NPDU sent to the local broadcast domain
    OriginalBroadcastNpdu = 0x0B,
    /// NPDU relayed by a broadcast management device
    ForwardedNpdu = 0x04,
}

impl BvllFunction {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0A => Some(Self::OriginalUnicastNpdu),
            0x0B => Some(Self::OriginalBroadcastNpdu),
            0x04 => Some(Self::ForwardedNpdu),
            _ => None,
        }
    }
}

/// BVLL envelope: type, function, total length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BvllHeader {
    pub function: BvllFunction,
    pub length: u16,
}

impl BvllHeader {
    pub fn new(function: BvllFunction, npdu_len: usize) -> Self {
        Self {
            function,
            length: (4 + npdu_len) as u16,
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        [
            BVLL_TYPE_BACNET_IP,
            self.function as u8,
            (self.length >> 8) as u8,
            (self.length & 0xFF) as u8,
        ]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 || data[0] != BVLL_TYPE_BACNET_IP {
            return Err(DataLinkError::InvalidFrame);
        }
        let function = BvllFunction::from_u8(data[1]).ok_or(DataLinkError::InvalidFrame)?;
        let length = u16::from_be_bytes([data[2], data[3]]);
        Ok(Self { function, length })
    }
}

/// UDP datagram transport carrying BACnet NPDUs.
pub struct BacnetIpDataLink {
    socket: UdpSocket,
    local_addr: SocketAddr,
    broadcast_addr: SocketAddr,
}

impl BacnetIpDataLink {
    /// Bind a socket and derive the local broadcast address.
    pub fn new<A: ToSocketAddrs>(bind_addr: A) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        let local_addr = socket.local_addr()?;

        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(Duration::from_millis(10)))?;

        let broadcast_addr = match local_addr {
            SocketAddr::V4(addr) => {
                let ip = addr.ip().octets();
                // /24 assumption; deployments with another mask pass the
                // subnet broadcast explicitly via send_frame destinations.
                let broadcast_ip = Ipv4Addr::new(ip[0], ip[1], ip[2], 255);
                SocketAddr::new(broadcast_ip.into(), BACNET_IP_PORT)
            }
            SocketAddr::V6(_) => {
                return Err(DataLinkError::AddressError(
                    "BACnet/IPv6 uses multicast, not this transport".into(),
                ))
            }
        };

        debug!("bip: bound {} (broadcast {})", local_addr, broadcast_addr);

        Ok(Self {
            socket,
            local_addr,
            broadcast_addr,
        })
    }

    fn send_bvll(&self, function: BvllFunction, npdu: &[u8], dest: SocketAddr) -> Result<()> {
        if npdu.len() > BIP_MAX_NPDU {
            return Err(DataLinkError::FrameTooLong);
        }
        let mut frame = Vec::with_capacity(4 + npdu.len());
        frame.extend_from_slice(&BvllHeader::new(function, npdu.len()).encode());
        frame.extend_from_slice(npdu);
        self.socket.send_to(&frame, dest)?;
        trace!("bip: tx {:?} {} octets to {}", function, frame.len(), dest);
        Ok(())
    }

    /// Unwrap a received BVLL envelope down to the NPDU and its true
    /// source.
    fn unwrap_bvll(data: &[u8], source: SocketAddr) -> Result<(Vec<u8>, SocketAddr)> {
        let header = BvllHeader::decode(data)?;
        if usize::from(header.length) != data.len() {
            return Err(DataLinkError::InvalidFrame);
        }
        match header.function {
            BvllFunction::OriginalUnicastNpdu | BvllFunction::OriginalBroadcastNpdu => {
                Ok((data[4..].to_vec(), source))
            }
            BvllFunction::ForwardedNpdu => {
                // Six octets of original endpoint follow the header.
                if data.len() < 10 {
                    return Err(DataLinkError::InvalidFrame);
                }
                let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
                let port = u16::from_be_bytes([data[8], data[9]]);
                Ok((data[10..].to_vec(), SocketAddr::new(ip.into(), port)))
            }
        }
    }
}

impl DataLink for BacnetIpDataLink {
    fn send_frame(&mut self, frame: &[u8], dest: &DataLinkAddress) -> Result<()> {
        match dest {
            DataLinkAddress::Ip(addr) => {
                self.send_bvll(BvllFunction::OriginalUnicastNpdu, frame, *addr)
            }
            DataLinkAddress::Broadcast => {
                self.send_bvll(BvllFunction::OriginalBroadcastNpdu, frame, self.broadcast_addr)
            }
            DataLinkAddress::MsTP(_) => Err(DataLinkError::AddressError(
                "MS/TP address on an IP link".into(),
            )),
        }
    }

    fn receive_frame(&mut self) -> Result<(Vec<u8>, DataLinkAddress)> {
        let mut buffer = [0u8; 1500];
        match self.socket.recv_from(&mut buffer) {
            Ok((len, source)) => {
                let (npdu, origin) = Self::unwrap_bvll(&buffer[..len], source)?;
                Ok((npdu, DataLinkAddress::Ip(origin)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Err(DataLinkError::WouldBlock)
            }
            Err(e) => Err(DataLinkError::IoError(e)),
        }
    }

    fn link_type(&self) -> DataLinkType {
        DataLinkType::BacnetIp
    }

    fn local_address(&self) -> DataLinkAddress {
        DataLinkAddress::Ip(self.local_addr)
    }

    fn max_npdu(&self) -> usize {
        BIP_MAX_NPDU
    }
}
