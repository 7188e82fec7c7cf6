//! MS/TP frame format (ASHRAE 135 Clause 9.3)
//!
//! Every MS/TP frame starts with the two-octet preamble `55 FF` followed by
//! frame type, destination, source, a big-endian data length, and the header
//! CRC. Frames carrying data append the payload and a 16-bit data CRC:
//!
//! ```text
//! 55 FF | type | dest | src | len-hi len-lo | hcrc | [data... dcrc-lo dcrc-hi]
//! ```
//!
//! Encoding whole frames lives here; decoding on a live wire is done octet
//! by octet in the receive state machine, which shares the CRC routines.
//! [`MstpFrame::decode`] parses a complete captured frame and is used by
//! tests and the loopback paths.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::datalink::{DataLinkError, Result};
use crate::generate_ranged_enum;

use super::crc::{data_crc, header_crc, header_crc_valid};

/// First preamble octet.
pub const PREAMBLE_55: u8 = 0x55;
/// Second preamble octet.
pub const PREAMBLE_FF: u8 = 0xFF;

/// Maximum data portion of a frame.
pub const MAX_DATA_LENGTH: usize = 501;

/// Octets from preamble through header CRC.
pub const HEADER_SIZE: usize = 8;

/// Largest possible frame: header, full data portion, data CRC.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_DATA_LENGTH + 2;

/// Destination meaning "all stations". Never valid as a source.
pub const BROADCAST_ADDRESS: u8 = 255;

/// Highest master station address.
pub const MAX_MASTER_ADDRESS: u8 = 127;

generate_ranged_enum! {
    /// MS/TP frame types. 8-127 are reserved to ASHRAE, 128-255 carry
    /// vendor-proprietary frames whose data portion begins with the vendor
    /// identifier.
    FrameType {
        Token = 0,
        PollForMaster = 1,
        ReplyToPollForMaster = 2,
        TestRequest = 3,
        TestResponse = 4,
        DataExpectingReply = 5,
        DataNotExpectingReply = 6,
        ReplyPostponed = 7,
    },
    u8,
    128..=255
}

impl FrameType {
    /// True for the two frame types whose data portion is an NPDU.
    pub fn is_data(&self) -> bool {
        matches!(self, FrameType::DataExpectingReply | FrameType::DataNotExpectingReply)
    }
}

/// A complete MS/TP frame.
///
/// Check sequences are not stored; they are computed during encoding and
/// verified during decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MstpFrame {
    pub frame_type: FrameType,
    pub destination: u8,
    pub source: u8,
    pub data: Vec<u8>,
}

impl MstpFrame {
    /// Create a frame, validating payload length and source address.
    pub fn new(frame_type: FrameType, destination: u8, source: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLong);
        }
        if source == BROADCAST_ADDRESS {
            return Err(DataLinkError::AddressError(
                "broadcast address is not a valid source".into(),
            ));
        }

        Ok(Self {
            frame_type,
            destination,
            source,
            data,
        })
    }

    /// Create a token frame.
    pub fn token(destination: u8, source: u8) -> Result<Self> {
        Self::new(FrameType::Token, destination, source, Vec::new())
    }

    /// Create a data frame carrying an NPDU.
    pub fn npdu(destination: u8, source: u8, data: Vec<u8>, expecting_reply: bool) -> Result<Self> {
        let frame_type = if expecting_reply {
            FrameType::DataExpectingReply
        } else {
            FrameType::DataNotExpectingReply
        };
        Self::new(frame_type, destination, source, data)
    }

    /// Encode to wire octets, including preamble and check sequences.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + self.data.len() + 2);

        frame.push(PREAMBLE_55);
        frame.push(PREAMBLE_FF);

        let data_length = self.data.len() as u16;
        frame.push(u8::from(self.frame_type));
        frame.push(self.destination);
        frame.push(self.source);
        frame.push((data_length >> 8) as u8);
        frame.push((data_length & 0xFF) as u8);
        frame.push(header_crc(&frame[2..7]));

        if !self.data.is_empty() {
            frame.extend_from_slice(&self.data);
            let crc = data_crc(&self.data);
            frame.push((crc & 0xFF) as u8);
            frame.push((crc >> 8) as u8);
        }

        frame
    }

    /// Decode a complete captured frame, verifying both check sequences.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(DataLinkError::InvalidFrame);
        }
        if data[0] != PREAMBLE_55 || data[1] != PREAMBLE_FF {
            return Err(DataLinkError::InvalidFrame);
        }
        if !header_crc_valid(&data[2..8]) {
            return Err(DataLinkError::CrcMismatch);
        }

        let frame_type = FrameType::from(data[2]);
        let destination = data[3];
        let source = data[4];
        let data_length = usize::from(u16::from_be_bytes([data[5], data[6]]));

        if source == BROADCAST_ADDRESS {
            return Err(DataLinkError::AddressError(
                "broadcast address is not a valid source".into(),
            ));
        }
        if data_length > MAX_DATA_LENGTH {
            return Err(DataLinkError::FrameTooLong);
        }

        // A zero-length frame omits the data CRC entirely.
        let expected = HEADER_SIZE + data_length + if data_length > 0 { 2 } else { 0 };
        if data.len() != expected {
            return Err(DataLinkError::InvalidFrame);
        }

        let payload = if data_length > 0 {
            let payload = &data[HEADER_SIZE..HEADER_SIZE + data_length];
            let received =
                u16::from_le_bytes([data[HEADER_SIZE + data_length], data[HEADER_SIZE + data_length + 1]]);
            if data_crc(payload) != received {
                return Err(DataLinkError::CrcMismatch);
            }
            payload.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            frame_type,
            destination,
            source,
            data: payload,
        })
    }
}

/// Check if a station address may act as a master node.
pub fn is_master_address(address: u8) -> bool {
    address <= MAX_MASTER_ADDRESS
}

/// Check if a station address is slave-only.
pub fn is_slave_address(address: u8) -> bool {
    (128..=254).contains(&address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn token_wire_vector() {
        let frame = MstpFrame::token(1, 2).unwrap();
        assert_eq!(frame.encode(), [0x55, 0xFF, 0x00, 0x01, 0x02, 0x00, 0x00, 0x40]);

        let decoded = MstpFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Token);
        assert_eq!(decoded.destination, 1);
        assert_eq!(decoded.source, 2);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn data_frame_round_trip() {
        let payload = vec![0x01, 0x02, 0x03, 0x04];
        let frame = MstpFrame::npdu(10, 20, payload.clone(), true).unwrap();
        let wire = frame.encode();

        // Data CRC transmitted low octet first.
        assert_eq!(&wire[wire.len() - 2..], &[0x91, 0x39]);

        let decoded = MstpFrame::decode(&wire).unwrap();
        assert_eq!(decoded.frame_type, FrameType::DataExpectingReply);
        assert_eq!(decoded.data, payload);
    }

    #[test]
    fn zero_length_frame_omits_data_crc() {
        let frame = MstpFrame::token(5, 3).unwrap();
        assert_eq!(frame.encode().len(), HEADER_SIZE);
    }

    #[test]
    fn length_bounds() {
        let at_limit = vec![0u8; MAX_DATA_LENGTH];
        assert!(MstpFrame::npdu(10, 20, at_limit, false).is_ok());

        let over = vec![0u8; MAX_DATA_LENGTH + 1];
        assert!(matches!(
            MstpFrame::npdu(10, 20, over, false),
            Err(DataLinkError::FrameTooLong)
        ));
    }

    #[test]
    fn broadcast_source_rejected() {
        assert!(MstpFrame::token(1, BROADCAST_ADDRESS).is_err());

        // Same rule on the decode side.
        let mut wire = MstpFrame::token(1, 2).unwrap().encode();
        wire[4] = BROADCAST_ADDRESS;
        wire[7] = super::header_crc(&wire[2..7]);
        assert!(MstpFrame::decode(&wire).is_err());
    }

    #[test]
    fn corrupted_header_detected() {
        let mut wire = MstpFrame::token(1, 2).unwrap().encode();
        wire[3] ^= 0x01;
        assert!(matches!(MstpFrame::decode(&wire), Err(DataLinkError::CrcMismatch)));
    }

    #[test]
    fn corrupted_data_detected() {
        let mut wire = MstpFrame::npdu(10, 20, vec![1, 2, 3, 4], false).unwrap().encode();
        wire[HEADER_SIZE] ^= 0x01;
        assert!(matches!(MstpFrame::decode(&wire), Err(DataLinkError::CrcMismatch)));
    }

    #[test]
    fn proprietary_type_survives_round_trip() {
        let frame = MstpFrame::new(FrameType::from(200u8), 7, 3, vec![0x00, 0x2A, 0xAB]).unwrap();
        let decoded = MstpFrame::decode(&frame.encode()).unwrap();
        assert_eq!(u8::from(decoded.frame_type), 200);
        assert_eq!(decoded.data, frame.data);
    }

    #[test]
    fn address_classes() {
        assert!(is_master_address(0));
        assert!(is_master_address(127));
        assert!(!is_master_address(128));
        assert!(is_slave_address(128));
        assert!(is_slave_address(254));
        assert!(!is_slave_address(255));
    }

    proptest! {
        #[test]
        fn encode_decode_identity(
            frame_type in 0u8..=7,
            destination in 0u8..=255,
            source in 0u8..=254,
            data in proptest::collection::vec(any::<u8>(), 0..=MAX_DATA_LENGTH),
        ) {
            let frame =
                MstpFrame::new(FrameType::from(frame_type), destination, source, data).unwrap();
            prop_assert_eq!(MstpFrame::decode(&frame.encode()).unwrap(), frame);
        }
    }
}
