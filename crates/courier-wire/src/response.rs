// Error response the gateway sends right before it drops the connection.
use bytes::Buf;

use crate::{Error, Result};

/// Size of an error response on the wire.
pub const ERROR_RESPONSE_LEN: usize = 6;
/// Command byte the gateway uses for error responses.
pub const ERROR_COMMAND: u8 = 8;

/// Status code carried by an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStatus {
    NoErrors,
    ProcessingError,
    MissingDeviceToken,
    MissingTopic,
    MissingPayload,
    InvalidTokenSize,
    InvalidTopicSize,
    InvalidPayloadSize,
    InvalidToken,
    /// The identifier names the last notification the gateway processed
    /// before it went away; it is not a failure.
    Shutdown,
    Unknown,
    Other(u8),
}

impl ErrorStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NoErrors,
            1 => Self::ProcessingError,
            2 => Self::MissingDeviceToken,
            3 => Self::MissingTopic,
            4 => Self::MissingPayload,
            5 => Self::InvalidTokenSize,
            6 => Self::InvalidTopicSize,
            7 => Self::InvalidPayloadSize,
            8 => Self::InvalidToken,
            10 => Self::Shutdown,
            255 => Self::Unknown,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::NoErrors => 0,
            Self::ProcessingError => 1,
            Self::MissingDeviceToken => 2,
            Self::MissingTopic => 3,
            Self::MissingPayload => 4,
            Self::InvalidTokenSize => 5,
            Self::InvalidTopicSize => 6,
            Self::InvalidPayloadSize => 7,
            Self::InvalidToken => 8,
            Self::Shutdown => 10,
            Self::Unknown => 255,
            Self::Other(code) => *code,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::NoErrors => "No errors encountered",
            Self::ProcessingError => "Processing error",
            Self::MissingDeviceToken => "Missing device token",
            Self::MissingTopic => "Missing topic",
            Self::MissingPayload => "Missing payload",
            Self::InvalidTokenSize => "Invalid token size",
            Self::InvalidTopicSize => "Invalid topic size",
            Self::InvalidPayloadSize => "Invalid payload size",
            Self::InvalidToken => "Invalid token",
            Self::Shutdown => "Shutdown",
            Self::Unknown => "None (unknown)",
            Self::Other(_) => "Unrecognized status",
        }
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl std::fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.code())
    }
}

/// `command (u8) | status (u8) | identifier (u32 BE)`
///
/// ```
/// use courier_wire::{ErrorResponse, ErrorStatus};
///
/// let response = ErrorResponse::decode(&[8, 8, 0, 0, 0, 42]).expect("decode");
/// assert_eq!(response.status, ErrorStatus::InvalidToken);
/// assert_eq!(response.identifier, 42);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub command: u8,
    pub status: ErrorStatus,
    pub identifier: u32,
}

impl ErrorResponse {
    pub fn new(status: ErrorStatus, identifier: u32) -> Self {
        Self {
            command: ERROR_COMMAND,
            status,
            identifier,
        }
    }

    // The command byte is reported as-is; some gateways and test servers do
    // not send the canonical value.
    pub fn decode(mut input: &[u8]) -> Result<Self> {
        if input.len() < ERROR_RESPONSE_LEN {
            return Err(Error::MalformedResponse {
                needed: ERROR_RESPONSE_LEN,
                available: input.len(),
            });
        }
        let command = input.get_u8();
        let status = ErrorStatus::from_code(input.get_u8());
        let identifier = input.get_u32();
        Ok(Self {
            command,
            status,
            identifier,
        })
    }

    pub fn encode(&self) -> [u8; ERROR_RESPONSE_LEN] {
        let mut buf = [0u8; ERROR_RESPONSE_LEN];
        buf[0] = self.command;
        buf[1] = self.status.code();
        buf[2..].copy_from_slice(&self.identifier.to_be_bytes());
        buf
    }
}
