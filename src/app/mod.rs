//! BACnet Application Layer Module
//!
//! The application layer frames every service exchange in an APDU header
//! (ASHRAE 135 Clause 20): four bits of PDU type, per-type control bits,
//! and the bookkeeping a confirmed exchange needs (invoke id, segmentation
//! window, service choice). This module encodes and decodes those headers
//! bit-exactly for all eight PDU types; service payloads pass through as
//! opaque octet strings.
//!
//! The transaction state machine that drives confirmed exchanges lives in
//! [`tsm`].
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, string::ToString, vec::Vec};

pub mod tsm;

/// Result type for application layer operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ApplicationError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug)]
pub enum ApplicationError {
    /// Header could not be parsed; the PDU is dropped.
    Malformed(String),
    /// PDU type nibble outside the defined range.
    UnsupportedApduType(u8),
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationError::Malformed(msg) => write!(f, "Malformed APDU: {}", msg),
            ApplicationError::UnsupportedApduType(t) => {
                write!(f, "Unsupported APDU type: {}", t)
            }
        }
    }
}

#[cfg(feature = "std")]
impl Error for ApplicationError {}

/// APDU type nibble values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

/// Maximum segments the sender can accept in a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }
}

/// Maximum APDU size the sender can accept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// The actual size in octets.
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Smallest encodable size that fits `max_apdu` octets.
    pub fn for_size(max_apdu: usize) -> Self {
        match max_apdu {
            0..=50 => MaxApduSize::Up50,
            51..=128 => MaxApduSize::Up128,
            129..=206 => MaxApduSize::Up206,
            207..=480 => MaxApduSize::Up480,
            481..=1024 => MaxApduSize::Up1024,
            _ => MaxApduSize::Up1476,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }
}

/// Application Protocol Data Unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Vec<u8>,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        actual_window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u8,
        error_code: u8,
    },

    /// Reject PDU
    Reject { invoke_id: u8, reject_reason: u8 },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: u8,
    },
}

impl Apdu {
    /// The type nibble of this PDU.
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// Invoke id correlating this PDU with a transaction, if it has one.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
        }
    }

    /// Encode the APDU to octets.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();

        match self {
            Apdu::ConfirmedRequest {
                segmented,
                more_follows,
                segmented_response_accepted,
                max_segments,
                max_response_size,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut octet = (ApduType::ConfirmedRequest as u8) << 4;
                if *segmented {
                    octet |= 0x08;
                }
                if *more_follows {
                    octet |= 0x04;
                }
                if *segmented_response_accepted {
                    octet |= 0x02;
                }
                buffer.push(octet);
                buffer.push(((*max_segments as u8) << 4) | (*max_response_size as u8));
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                buffer.push((ApduType::UnconfirmedRequest as u8) << 4);
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SimpleAck {
                invoke_id,
                service_choice,
            } => {
                buffer.push((ApduType::SimpleAck as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
            }

            Apdu::ComplexAck {
                segmented,
                more_follows,
                invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice,
                service_data,
            } => {
                let mut octet = (ApduType::ComplexAck as u8) << 4;
                if *segmented {
                    octet |= 0x08;
                }
                if *more_follows {
                    octet |= 0x04;
                }
                buffer.push(octet);
                buffer.push(*invoke_id);
                if *segmented {
                    buffer.push(sequence_number.unwrap_or(0));
                    buffer.push(proposed_window_size.unwrap_or(1));
                }
                buffer.push(*service_choice);
                buffer.extend_from_slice(service_data);
            }

            Apdu::SegmentAck {
                negative,
                server,
                invoke_id,
                sequence_number,
                actual_window_size,
            } => {
                let mut octet = (ApduType::SegmentAck as u8) << 4;
                if *negative {
                    octet |= 0x02;
                }
                if *server {
                    octet |= 0x01;
                }
                buffer.push(octet);
                buffer.push(*invoke_id);
                buffer.push(*sequence_number);
                buffer.push(*actual_window_size);
            }

            Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            } => {
                buffer.push((ApduType::Error as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*service_choice);
                buffer.push(*error_class);
                buffer.push(*error_code);
            }

            Apdu::Reject {
                invoke_id,
                reject_reason,
            } => {
                buffer.push((ApduType::Reject as u8) << 4);
                buffer.push(*invoke_id);
                buffer.push(*reject_reason);
            }

            Apdu::Abort {
                server,
                invoke_id,
                abort_reason,
            } => {
                let mut octet = (ApduType::Abort as u8) << 4;
                if *server {
                    octet |= 0x01;
                }
                buffer.push(octet);
                buffer.push(*invoke_id);
                buffer.push(*abort_reason);
            }
        }

        buffer
    }

    /// Decode an APDU header; the payload (where the type has one) is
    /// returned uninterpreted in `service_data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let first = *data
            .first()
            .ok_or_else(|| ApplicationError::Malformed("empty APDU".to_string()))?;
        let type_nibble = (first >> 4) & 0x0F;

        match type_nibble {
            0 => {
                if data.len() < 4 {
                    return Err(ApplicationError::Malformed(
                        "confirmed request too short".to_string(),
                    ));
                }
                let segmented = (first & 0x08) != 0;
                let more_follows = (first & 0x04) != 0;
                let segmented_response_accepted = (first & 0x02) != 0;
                let max_segments = MaxSegments::from_bits(data[1] >> 4);
                let max_response_size = MaxApduSize::from_bits(data[1]);
                let invoke_id = data[2];
                let mut pos = 3;

                let (sequence_number, proposed_window_size) = if segmented {
                    if data.len() < 6 {
                        return Err(ApplicationError::Malformed(
                            "segmented request without window".to_string(),
                        ));
                    }
                    let pair = (Some(data[pos]), Some(data[pos + 1]));
                    pos += 2;
                    pair
                } else {
                    (None, None)
                };

                let service_choice = *data.get(pos).ok_or_else(|| {
                    ApplicationError::Malformed("missing service choice".to_string())
                })?;
                pos += 1;

                Ok(Apdu::ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted,
                    max_segments,
                    max_response_size,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice,
                    service_data: data[pos..].to_vec(),
                })
            }

            1 => {
                if data.len() < 2 {
                    return Err(ApplicationError::Malformed(
                        "unconfirmed request too short".to_string(),
                    ));
                }
                Ok(Apdu::UnconfirmedRequest {
                    service_choice: data[1],
                    service_data: data[2..].to_vec(),
                })
            }

            2 => {
                if data.len() < 3 {
                    return Err(ApplicationError::Malformed("SimpleAck too short".to_string()));
                }
                Ok(Apdu::SimpleAck {
                    invoke_id: data[1],
                    service_choice: data[2],
                })
            }

            3 => {
                if data.len() < 3 {
                    return Err(ApplicationError::Malformed("ComplexAck too short".to_string()));
                }
                let segmented = (first & 0x08) != 0;
                let more_follows = (first & 0x04) != 0;
                let invoke_id = data[1];
                let mut pos = 2;

                let (sequence_number, proposed_window_size) = if segmented {
                    if data.len() < 5 {
                        return Err(ApplicationError::Malformed(
                            "segmented ack without window".to_string(),
                        ));
                    }
                    let pair = (Some(data[pos]), Some(data[pos + 1]));
                    pos += 2;
                    pair
                } else {
                    (None, None)
                };

                let service_choice = *data.get(pos).ok_or_else(|| {
                    ApplicationError::Malformed("missing service choice".to_string())
                })?;
                pos += 1;

                Ok(Apdu::ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id,
                    sequence_number,
                    proposed_window_size,
                    service_choice,
                    service_data: data[pos..].to_vec(),
                })
            }

            4 => {
                if data.len() < 4 {
                    return Err(ApplicationError::Malformed("SegmentAck too short".to_string()));
                }
                Ok(Apdu::SegmentAck {
                    negative: (first & 0x02) != 0,
                    server: (first & 0x01) != 0,
                    invoke_id: data[1],
                    sequence_number: data[2],
                    actual_window_size: data[3],
                })
            }

            5 => {
                if data.len() < 5 {
                    return Err(ApplicationError::Malformed("Error PDU too short".to_string()));
                }
                Ok(Apdu::Error {
                    invoke_id: data[1],
                    service_choice: data[2],
                    error_class: data[3],
                    error_code: data[4],
                })
            }

            6 => {
                if data.len() < 3 {
                    return Err(ApplicationError::Malformed("Reject PDU too short".to_string()));
                }
                Ok(Apdu::Reject {
                    invoke_id: data[1],
                    reject_reason: data[2],
                })
            }

            7 => {
                if data.len() < 3 {
                    return Err(ApplicationError::Malformed("Abort PDU too short".to_string()));
                }
                Ok(Apdu::Abort {
                    server: (first & 0x01) != 0,
                    invoke_id: data[1],
                    abort_reason: data[2],
                })
            }

            other => Err(ApplicationError::UnsupportedApduType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(apdu: Apdu) {
        let encoded = apdu.encode();
        assert_eq!(Apdu::decode(&encoded).unwrap(), apdu);
    }

    #[test]
    fn confirmed_request_wire_layout() {
        let apdu = Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id: 42,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 12,
            service_data: vec![0x0C, 0x02, 0x00, 0x00, 0x08],
        };
        let encoded = apdu.encode();
        assert_eq!(&encoded[..4], &[0x02, 0x05, 0x2A, 0x0C]);
        round_trip(apdu);
    }

    #[test]
    fn segmented_confirmed_request_carries_window() {
        let apdu = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Four,
            max_response_size: MaxApduSize::Up480,
            invoke_id: 7,
            sequence_number: Some(2),
            proposed_window_size: Some(4),
            service_choice: 12,
            service_data: vec![0xAA],
        };
        let encoded = apdu.encode();
        assert_eq!(&encoded[..6], &[0x0E, 0x23, 0x07, 0x02, 0x04, 0x0C]);
        round_trip(apdu);
    }

    #[test]
    fn all_pdu_types_round_trip() {
        round_trip(Apdu::UnconfirmedRequest {
            service_choice: 8,
            service_data: vec![],
        });
        round_trip(Apdu::SimpleAck {
            invoke_id: 1,
            service_choice: 15,
        });
        round_trip(Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id: 9,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: 12,
            service_data: vec![0x3E, 0x3F],
        });
        round_trip(Apdu::ComplexAck {
            segmented: true,
            more_follows: true,
            invoke_id: 9,
            sequence_number: Some(0),
            proposed_window_size: Some(4),
            service_choice: 12,
            service_data: vec![0x11, 0x22],
        });
        round_trip(Apdu::SegmentAck {
            negative: true,
            server: true,
            invoke_id: 9,
            sequence_number: 3,
            actual_window_size: 4,
        });
        round_trip(Apdu::Error {
            invoke_id: 3,
            service_choice: 12,
            error_class: 1,
            error_code: 31,
        });
        round_trip(Apdu::Reject {
            invoke_id: 4,
            reject_reason: 9,
        });
        round_trip(Apdu::Abort {
            server: false,
            invoke_id: 5,
            abort_reason: 4,
        });
    }

    #[test]
    fn simple_ack_wire_layout() {
        let encoded = Apdu::SimpleAck {
            invoke_id: 42,
            service_choice: 15,
        }
        .encode();
        assert_eq!(encoded, [0x20, 0x2A, 0x0F]);
    }

    #[test]
    fn abort_server_bit() {
        let encoded = Apdu::Abort {
            server: true,
            invoke_id: 1,
            abort_reason: 4,
        }
        .encode();
        assert_eq!(encoded[0], 0x71);
    }

    #[test]
    fn truncated_pdus_rejected() {
        assert!(Apdu::decode(&[]).is_err());
        assert!(Apdu::decode(&[0x00, 0x05]).is_err());
        assert!(Apdu::decode(&[0x20, 0x01]).is_err());
        assert!(Apdu::decode(&[0x50, 0x01, 0x0C]).is_err());
        // Segmented request whose window octets are missing.
        assert!(Apdu::decode(&[0x08, 0x23, 0x07, 0x02]).is_err());
        // Type nibbles 8-15 are undefined.
        assert!(matches!(
            Apdu::decode(&[0x80, 0x00, 0x00]),
            Err(ApplicationError::UnsupportedApduType(8))
        ));
    }

    #[test]
    fn max_apdu_size_mapping() {
        assert_eq!(MaxApduSize::for_size(480), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::for_size(481), MaxApduSize::Up1024);
        assert_eq!(MaxApduSize::for_size(50000), MaxApduSize::Up1476);
        assert_eq!(MaxApduSize::Up206.size(), 206);
    }
}
