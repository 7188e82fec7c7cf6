//! BACnet Service Definitions Module
//!
//! The core treats service payloads as opaque octet strings; what it does
//! need are the service choice numbers to route by, the reject/abort/error
//! reason code spaces, and the two device-discovery services that feed the
//! address binding cache: Who-Is and I-Am. Those two are encoded and
//! decoded here with the minimal application/context tag forms they use
//! (Clause 20.2); everything else stays with the application's own service
//! codec.

#[cfg(feature = "std")]
use std::error::Error;

#[cfg(feature = "std")]
use std::fmt;

#[cfg(not(feature = "std"))]
use core::fmt;

#[cfg(not(feature = "std"))]
use alloc::{string::String, string::ToString, vec::Vec};

use crate::generate_ranged_enum;

/// Result type for service codec operations
#[cfg(feature = "std")]
pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(not(feature = "std"))]
pub type Result<T> = core::result::Result<T, ServiceError>;

/// Errors that can occur when coding service payloads
#[derive(Debug)]
pub enum ServiceError {
    /// Payload does not parse as the expected service
    Malformed(String),
    /// Service choice octet has no assigned meaning
    UnknownChoice(u8),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Malformed(msg) => write!(f, "Malformed service payload: {}", msg),
            ServiceError::UnknownChoice(choice) => {
                write!(f, "Unknown service choice: {}", choice)
            }
        }
    }
}

#[cfg(feature = "std")]
impl Error for ServiceError {}

/// Confirmed service choices (Clause 21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedCovNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCov = 5,

    // File Access Services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object Access Services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,

    // Remote Device Management Services
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,

    // Virtual Terminal Services
    VtOpen = 21,
    VtClose = 22,
    VtData = 23,

    // Other Services
    ReadRange = 26,
    LifeSafetyOperation = 27,
    SubscribeCovProperty = 28,
    GetEventInformation = 29,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCovNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCov),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            18 => Ok(Self::ConfirmedPrivateTransfer),
            19 => Ok(Self::ConfirmedTextMessage),
            20 => Ok(Self::ReinitializeDevice),
            21 => Ok(Self::VtOpen),
            22 => Ok(Self::VtClose),
            23 => Ok(Self::VtData),
            26 => Ok(Self::ReadRange),
            27 => Ok(Self::LifeSafetyOperation),
            28 => Ok(Self::SubscribeCovProperty),
            29 => Ok(Self::GetEventInformation),
            other => Err(ServiceError::UnknownChoice(other)),
        }
    }
}

/// Unconfirmed service choices (Clause 21)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCovNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCovNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            other => Err(ServiceError::UnknownChoice(other)),
        }
    }
}

generate_ranged_enum! {
    /// Reject reasons (Clause 18.8); 64-255 are vendor-proprietary.
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

generate_ranged_enum! {
    /// Abort reasons (Clause 18.9); 64-255 are vendor-proprietary.
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
    },
    u8,
    64..=255
}

generate_ranged_enum! {
    /// Error classes (Clause 18); 64-255 are vendor-proprietary.
    ErrorClass {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    },
    u8,
    64..=255
}

/// Object type plus instance, packed into 32 bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectIdentifier {
    /// Object type (10 bits); Device is 8
    pub object_type: u16,
    /// Instance number (22 bits)
    pub instance: u32,
}

/// Object type number of Device objects.
pub const OBJECT_TYPE_DEVICE: u16 = 8;

impl ObjectIdentifier {
    pub fn new(object_type: u16, instance: u32) -> Self {
        Self {
            object_type,
            instance,
        }
    }

    pub fn device(instance: u32) -> Self {
        Self::new(OBJECT_TYPE_DEVICE, instance)
    }

    pub fn is_valid(&self) -> bool {
        self.object_type <= 0x3FF && self.instance <= 0x3FFFFF
    }

    fn to_u32(self) -> u32 {
        (u32::from(self.object_type) << 22) | (self.instance & 0x3FFFFF)
    }

    fn from_u32(value: u32) -> Self {
        Self {
            object_type: (value >> 22) as u16,
            instance: value & 0x3FFFFF,
        }
    }
}

/// Who-Is request (unconfirmed service choice 8)
///
/// Either no parameters at all (every device answers) or both range
/// limits as context-tagged unsigned values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    pub device_instance_range_low_limit: Option<u32>,
    pub device_instance_range_high_limit: Option<u32>,
}

impl WhoIsRequest {
    /// Who-Is for every device.
    pub fn new() -> Self {
        Self::default()
    }

    /// Who-Is for a single device instance.
    pub fn for_device(device_instance: u32) -> Self {
        Self::for_range(device_instance, device_instance)
    }

    /// Who-Is for an instance range.
    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            device_instance_range_low_limit: Some(low),
            device_instance_range_high_limit: Some(high),
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        // Limits travel together or not at all.
        if let (Some(low), Some(high)) = (
            self.device_instance_range_low_limit,
            self.device_instance_range_high_limit,
        ) {
            encode_context_unsigned(buffer, 0, low);
            encode_context_unsigned(buffer, 1, high);
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::new());
        }
        let (low, consumed) = decode_context_unsigned(data, 0)?;
        let (high, _) = decode_context_unsigned(&data[consumed..], 1)
            .map_err(|_| ServiceError::Malformed("low limit without high limit".to_string()))?;
        Ok(Self::for_range(low, high))
    }

    /// Whether a device with this instance should answer.
    pub fn matches(&self, device_instance: u32) -> bool {
        match (
            self.device_instance_range_low_limit,
            self.device_instance_range_high_limit,
        ) {
            (Some(low), Some(high)) => (low..=high).contains(&device_instance),
            _ => true,
        }
    }
}

/// I-Am announcement (unconfirmed service choice 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    /// The announcing Device object
    pub device_identifier: ObjectIdentifier,
    /// Largest APDU the device accepts
    pub max_apdu_length_accepted: u32,
    /// Segmentation support (0 both, 1 transmit, 2 receive, 3 none)
    pub segmentation_supported: u32,
    pub vendor_identifier: u32,
}

impl IAmRequest {
    pub fn new(
        device_identifier: ObjectIdentifier,
        max_apdu_length_accepted: u32,
        segmentation_supported: u32,
        vendor_identifier: u32,
    ) -> Self {
        Self {
            device_identifier,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        }
    }

    pub fn encode(&self, buffer: &mut Vec<u8>) {
        encode_application_object_id(buffer, self.device_identifier);
        encode_application_unsigned(buffer, self.max_apdu_length_accepted);
        encode_application_enumerated(buffer, self.segmentation_supported);
        encode_application_unsigned(buffer, self.vendor_identifier);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (device_identifier, consumed) = decode_application_object_id(data)?;
        let mut pos = consumed;

        let (max_apdu_length_accepted, consumed) = decode_application_unsigned(&data[pos..])?;
        pos += consumed;

        let (segmentation_supported, consumed) = decode_application_enumerated(&data[pos..])?;
        pos += consumed;

        let (vendor_identifier, _) = decode_application_unsigned(&data[pos..])?;

        Ok(Self {
            device_identifier,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        })
    }
}

// Tag primitives (Clause 20.2), restricted to the forms Who-Is and I-Am
// actually use: small application-tagged values and context-tagged
// unsigned integers.

const TAG_UNSIGNED: u8 = 2;
const TAG_ENUMERATED: u8 = 9;
const TAG_OBJECT_ID: u8 = 12;
const CONTEXT_CLASS: u8 = 0x08;

fn unsigned_length(value: u32) -> u8 {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

fn push_unsigned(buffer: &mut Vec<u8>, value: u32, length: u8) {
    buffer.extend_from_slice(&value.to_be_bytes()[4 - usize::from(length)..]);
}

fn encode_application_unsigned(buffer: &mut Vec<u8>, value: u32) {
    let length = unsigned_length(value);
    buffer.push((TAG_UNSIGNED << 4) | length);
    push_unsigned(buffer, value, length);
}

fn encode_application_enumerated(buffer: &mut Vec<u8>, value: u32) {
    let length = unsigned_length(value);
    buffer.push((TAG_ENUMERATED << 4) | length);
    push_unsigned(buffer, value, length);
}

fn encode_application_object_id(buffer: &mut Vec<u8>, id: ObjectIdentifier) {
    buffer.push((TAG_OBJECT_ID << 4) | 4);
    buffer.extend_from_slice(&id.to_u32().to_be_bytes());
}

fn encode_context_unsigned(buffer: &mut Vec<u8>, tag_number: u8, value: u32) {
    let length = unsigned_length(value);
    buffer.push((tag_number << 4) | CONTEXT_CLASS | length);
    push_unsigned(buffer, value, length);
}

fn read_unsigned(data: &[u8], length: usize) -> Result<u32> {
    if length == 0 || length > 4 || data.len() < length {
        return Err(ServiceError::Malformed("bad unsigned length".to_string()));
    }
    let mut value = 0u32;
    for &octet in &data[..length] {
        value = (value << 8) | u32::from(octet);
    }
    Ok(value)
}

fn decode_application_unsigned(data: &[u8]) -> Result<(u32, usize)> {
    let &tag = data
        .first()
        .ok_or_else(|| ServiceError::Malformed("truncated unsigned".to_string()))?;
    if (tag >> 4) != TAG_UNSIGNED || (tag & CONTEXT_CLASS) != 0 {
        return Err(ServiceError::Malformed("expected unsigned tag".to_string()));
    }
    let length = usize::from(tag & 0x07);
    let value = read_unsigned(&data[1..], length)?;
    Ok((value, 1 + length))
}

fn decode_application_enumerated(data: &[u8]) -> Result<(u32, usize)> {
    let &tag = data
        .first()
        .ok_or_else(|| ServiceError::Malformed("truncated enumerated".to_string()))?;
    if (tag >> 4) != TAG_ENUMERATED || (tag & CONTEXT_CLASS) != 0 {
        return Err(ServiceError::Malformed("expected enumerated tag".to_string()));
    }
    let length = usize::from(tag & 0x07);
    let value = read_unsigned(&data[1..], length)?;
    Ok((value, 1 + length))
}

fn decode_application_object_id(data: &[u8]) -> Result<(ObjectIdentifier, usize)> {
    let &tag = data
        .first()
        .ok_or_else(|| ServiceError::Malformed("truncated object id".to_string()))?;
    if (tag >> 4) != TAG_OBJECT_ID || (tag & CONTEXT_CLASS) != 0 || (tag & 0x07) != 4 {
        return Err(ServiceError::Malformed("expected object id tag".to_string()));
    }
    let value = read_unsigned(&data[1..], 4)?;
    Ok((ObjectIdentifier::from_u32(value), 5))
}

fn decode_context_unsigned(data: &[u8], tag_number: u8) -> Result<(u32, usize)> {
    let &tag = data
        .first()
        .ok_or_else(|| ServiceError::Malformed("truncated context tag".to_string()))?;
    if (tag >> 4) != tag_number || (tag & CONTEXT_CLASS) == 0 {
        return Err(ServiceError::Malformed("unexpected context tag".to_string()));
    }
    let length = usize::from(tag & 0x07);
    let value = read_unsigned(&data[1..], length)?;
    Ok((value, 1 + length))
}
