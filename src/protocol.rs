//! DIRCON packet codec.
//!
//! Every packet starts with a fixed 6-byte header followed by `body_length`
//! body bytes:
//!
//! ```text
//! +---------+-----------+----------+---------------+-------------------+
//! | version | messageId | sequence | response code | body length (BE)  |
//! |   (1)   |    (1)    |   (1)    |      (1)      |        (2)        |
//! +---------+-----------+----------+---------------+-------------------+
//! ```
//!
//! Characteristic and service UUIDs travel as full 16-byte UUIDs built from a
//! 4-byte big-endian short id and the Bluetooth base UUID suffix. Only the
//! short id is kept after parsing.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::{DirconError, Result},
    DIRCON_UUID_SUFFIX,
};

/// Header size in bytes
pub const HEADER_SIZE: usize = 6;

/// Size of one UUID on the wire
pub const UUID_BLOCK_SIZE: usize = 16;

/// Size of one discovered characteristic: UUID followed by its property byte
pub const CHARACTERISTIC_BLOCK_SIZE: usize = UUID_BLOCK_SIZE + 1;

/// Protocol version written into every request
pub const PROTOCOL_VERSION: u8 = 1;

/// DIRCON message identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// List the services exposed by the device
    DiscoverServices,
    /// List the characteristics of one service
    DiscoverCharacteristics,
    /// Read the current value of a characteristic
    ReadCharacteristic,
    /// Write a value to a characteristic
    WriteCharacteristic,
    /// Subscribe to notifications of a characteristic
    EnableNotifications,
    /// Notification pushed by the device
    UnsolicitedNotification,
    /// Error report
    Error,
    /// Identifier this client does not know
    Unknown(u8),
}

impl From<u8> for MessageId {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::DiscoverServices,
            0x02 => Self::DiscoverCharacteristics,
            0x03 => Self::ReadCharacteristic,
            0x04 => Self::WriteCharacteristic,
            0x05 => Self::EnableNotifications,
            0x06 => Self::UnsolicitedNotification,
            0xFF => Self::Error,
            other => Self::Unknown(other),
        }
    }
}

impl From<MessageId> for u8 {
    fn from(id: MessageId) -> Self {
        match id {
            MessageId::DiscoverServices => 0x01,
            MessageId::DiscoverCharacteristics => 0x02,
            MessageId::ReadCharacteristic => 0x03,
            MessageId::WriteCharacteristic => 0x04,
            MessageId::EnableNotifications => 0x05,
            MessageId::UnsolicitedNotification => 0x06,
            MessageId::Error => 0xFF,
            MessageId::Unknown(other) => other,
        }
    }
}

/// Response codes reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// Request succeeded
    Success,
    /// Device did not recognise the message id
    UnknownMessageType,
    /// Unspecified failure, also used for unreadable headers
    UnexpectedError,
    /// Requested service does not exist
    ServiceNotFound,
    /// Requested characteristic does not exist
    CharacteristicNotFound,
    /// Characteristic does not support the operation
    OperationNotSupported,
    /// Characteristic write was rejected
    WriteFailed,
    /// Device speaks a different protocol
    UnknownProtocol,
    /// Code this client does not know
    Other(u8),
}

impl From<u8> for ResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::UnknownMessageType,
            0x02 => Self::UnexpectedError,
            0x03 => Self::ServiceNotFound,
            0x04 => Self::CharacteristicNotFound,
            0x05 => Self::OperationNotSupported,
            0x06 => Self::WriteFailed,
            0x07 => Self::UnknownProtocol,
            other => Self::Other(other),
        }
    }
}

impl From<ResponseCode> for u8 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Success => 0x00,
            ResponseCode::UnknownMessageType => 0x01,
            ResponseCode::UnexpectedError => 0x02,
            ResponseCode::ServiceNotFound => 0x03,
            ResponseCode::CharacteristicNotFound => 0x04,
            ResponseCode::OperationNotSupported => 0x05,
            ResponseCode::WriteFailed => 0x06,
            ResponseCode::UnknownProtocol => 0x07,
            ResponseCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::UnknownMessageType => write!(f, "unknown message type"),
            Self::UnexpectedError => write!(f, "unexpected error"),
            Self::ServiceNotFound => write!(f, "service not found"),
            Self::CharacteristicNotFound => write!(f, "characteristic not found"),
            Self::OperationNotSupported => write!(f, "operation not supported"),
            Self::WriteFailed => write!(f, "write failed"),
            Self::UnknownProtocol => write!(f, "unknown protocol"),
            Self::Other(code) => write!(f, "response code 0x{code:02X}"),
        }
    }
}

/// GATT property bits reported for each discovered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    /// Characteristic can be read
    pub const READ: u8 = 0x01;
    /// Characteristic can be written
    pub const WRITE: u8 = 0x02;
    /// Characteristic can notify
    pub const NOTIFY: u8 = 0x04;

    /// Whether the read bit is set
    #[must_use]
    pub const fn can_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    /// Whether the write bit is set
    #[must_use]
    pub const fn can_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Whether the notify bit is set
    #[must_use]
    pub const fn can_notify(self) -> bool {
        self.0 & Self::NOTIFY != 0
    }
}

/// Expand a short characteristic/service id into its full 128-bit UUID
#[must_use]
pub fn expand_uuid(short: u32) -> Uuid {
    let mut bytes = [0u8; UUID_BLOCK_SIZE];
    bytes[..4].copy_from_slice(&short.to_be_bytes());
    bytes[4..].copy_from_slice(&DIRCON_UUID_SUFFIX);
    Uuid::from_bytes(bytes)
}

/// Recover the short id of a UUID built on the Bluetooth base UUID
#[must_use]
pub fn short_uuid(uuid: &Uuid) -> Option<u32> {
    let bytes = uuid.as_bytes();
    if bytes[4..] != DIRCON_UUID_SUFFIX {
        return None;
    }
    Some(short_id(bytes))
}

fn short_id(block: &[u8]) -> u32 {
    u32::from_be_bytes([block[0], block[1], block[2], block[3]])
}

/// Body length announced by a header
#[must_use]
pub fn body_length(header: &[u8; HEADER_SIZE]) -> usize {
    usize::from(u16::from_be_bytes([header[4], header[5]]))
}

/// A single DIRCON request or response
///
/// Discovery messages carry `uuids` only. Read, write and notification
/// messages carry exactly one uuid plus `payload`. Characteristic discovery
/// responses store each characteristic's property byte in `payload`,
/// index-aligned with `uuids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Protocol version
    pub version: u8,
    /// Message identifier
    pub message_id: MessageId,
    /// Sequence number
    pub sequence: u8,
    /// Response code, `Success` for requests
    pub response_code: ResponseCode,
    /// Short ids of the UUIDs carried by the packet
    pub uuids: Vec<u32>,
    /// Characteristic value or property bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a request packet
    #[must_use]
    pub fn request(message_id: MessageId, sequence: u8, uuids: Vec<u32>, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id,
            sequence,
            response_code: ResponseCode::Success,
            uuids,
            payload,
        }
    }

    /// Create a service discovery request
    #[must_use]
    pub fn discover_services(sequence: u8) -> Self {
        Self::request(MessageId::DiscoverServices, sequence, Vec::new(), Bytes::new())
    }

    /// Create a characteristic discovery request for one service
    #[must_use]
    pub fn discover_characteristics(sequence: u8, service: u32) -> Self {
        Self::request(
            MessageId::DiscoverCharacteristics,
            sequence,
            vec![service],
            Bytes::new(),
        )
    }

    /// Create a characteristic read request
    #[must_use]
    pub fn read_characteristic(sequence: u8, characteristic: u32) -> Self {
        Self::request(
            MessageId::ReadCharacteristic,
            sequence,
            vec![characteristic],
            Bytes::new(),
        )
    }

    /// Create a notification subscription request
    #[must_use]
    pub fn enable_notifications(sequence: u8, characteristic: u32) -> Self {
        Self::request(
            MessageId::EnableNotifications,
            sequence,
            vec![characteristic],
            Bytes::new(),
        )
    }

    /// Create a characteristic write request
    #[must_use]
    pub fn write_characteristic(sequence: u8, characteristic: u32, payload: Bytes) -> Self {
        Self::request(
            MessageId::WriteCharacteristic,
            sequence,
            vec![characteristic],
            payload,
        )
    }

    /// Packet used in place of a header that could not be read completely
    #[must_use]
    pub fn unexpected_error() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_id: MessageId::Error,
            sequence: 0,
            response_code: ResponseCode::UnexpectedError,
            uuids: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Whether the device reported success
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.response_code == ResponseCode::Success
    }

    /// First uuid carried by the packet
    #[must_use]
    pub fn uuid(&self) -> Option<u32> {
        self.uuids.first().copied()
    }

    /// Discovered characteristics with their properties
    pub fn characteristics(&self) -> impl Iterator<Item = (u32, CharacteristicProperties)> + '_ {
        self.uuids
            .iter()
            .zip(self.payload.iter())
            .map(|(uuid, flags)| (*uuid, CharacteristicProperties(*flags)))
    }

    /// Serialize a request to bytes
    ///
    /// # Errors
    ///
    /// Returns [`DirconError::InvalidParameters`] if a write carries no
    /// characteristic or the body does not fit the 16-bit length field, and
    /// [`DirconError::Protocol`] for message ids that are never sent by a client.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();

        match self.message_id {
            MessageId::DiscoverServices => {}
            MessageId::DiscoverCharacteristics
            | MessageId::ReadCharacteristic
            | MessageId::EnableNotifications => {
                for uuid in &self.uuids {
                    body.put_slice(expand_uuid(*uuid).as_bytes());
                }
            }
            MessageId::WriteCharacteristic => {
                let uuid = self.uuid().ok_or_else(|| {
                    DirconError::InvalidParameters(
                        "Write request needs a characteristic".to_string(),
                    )
                })?;
                body.put_slice(expand_uuid(uuid).as_bytes());
                body.put_slice(&self.payload);
            }
            other => {
                return Err(DirconError::Protocol(format!(
                    "{other:?} is not a request message"
                )));
            }
        }

        let body_len = u16::try_from(body.len()).map_err(|_| {
            DirconError::InvalidParameters(format!("Body of {} bytes is too long", body.len()))
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
        buf.put_u8(self.version);
        buf.put_u8(self.message_id.into());
        buf.put_u8(self.sequence);
        buf.put_u8(self.response_code.into());
        buf.put_u16(body_len);
        buf.extend_from_slice(&body);

        Ok(buf.freeze())
    }

    /// Parse a response from its header and body bytes
    ///
    /// A header shorter than [`HEADER_SIZE`] yields [`Packet::unexpected_error`].
    /// A non-success response keeps only the header fields; deciding what to
    /// do with it is up to the caller.
    #[must_use]
    pub fn parse(header: &[u8], body: &[u8]) -> Self {
        if header.len() < HEADER_SIZE {
            warn!("Unexpected header size: {} bytes", header.len());
            return Self::unexpected_error();
        }

        let mut packet = Self {
            version: header[0],
            message_id: MessageId::from(header[1]),
            sequence: header[2],
            response_code: ResponseCode::from(header[3]),
            uuids: Vec::new(),
            payload: Bytes::new(),
        };

        if !packet.is_success() {
            return packet;
        }

        match packet.message_id {
            MessageId::DiscoverServices | MessageId::EnableNotifications => {
                packet.uuids = body.chunks_exact(UUID_BLOCK_SIZE).map(short_id).collect();
            }
            MessageId::DiscoverCharacteristics => {
                // Parent service UUID comes first
                let blocks = body.get(UUID_BLOCK_SIZE..).unwrap_or_default();
                let mut flags = BytesMut::new();
                for block in blocks.chunks_exact(CHARACTERISTIC_BLOCK_SIZE) {
                    packet.uuids.push(short_id(block));
                    flags.put_u8(block[UUID_BLOCK_SIZE]);
                }
                packet.payload = flags.freeze();
            }
            MessageId::ReadCharacteristic
            | MessageId::UnsolicitedNotification
            | MessageId::WriteCharacteristic => {
                if body.len() < 4 {
                    warn!(
                        "Characteristic message without uuid: header {:02X?}, body {:02X?}",
                        header, body
                    );
                    return Self {
                        sequence: packet.sequence,
                        ..Self::unexpected_error()
                    };
                }
                packet.uuids.push(short_id(body));
                packet.payload =
                    Bytes::copy_from_slice(body.get(UUID_BLOCK_SIZE..).unwrap_or_default());
            }
            MessageId::Error | MessageId::Unknown(_) => {
                warn!("Unknown packet: header {:02X?}, body {:02X?}", header, body);
            }
        }

        packet
    }
}
