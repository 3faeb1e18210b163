// Binary frame format spoken by the legacy push notification gateway.
//
// A notification travels as one frame:
//
//   command (u8 = 2) | frame length (u32 BE) | item*
//
// and every item is
//
//   item type (u8) | item length (u16 BE) | item bytes
//
// The gateway answers only when something goes wrong, with a fixed 6-byte
// error response (see `response`). The feedback channel streams fixed 38-byte
// records (see `feedback`).
use bytes::{Buf, BufMut, Bytes, BytesMut};

mod feedback;
mod response;
mod token;

pub use feedback::{FEEDBACK_RECORD_LEN, FeedbackRecord};
pub use response::{ERROR_COMMAND, ERROR_RESPONSE_LEN, ErrorResponse, ErrorStatus};
pub use token::{DeviceToken, TOKEN_LEN};

/// Command byte that opens every notification frame.
pub const NOTIFICATION_COMMAND: u8 = 2;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("malformed response: needed {needed} bytes, got {available}")]
    MalformedResponse { needed: usize, available: usize },
    #[error("incomplete frame")]
    Incomplete,
    #[error("unexpected command {0}")]
    UnexpectedCommand(u8),
    #[error("unknown item type {0}")]
    UnknownItem(u8),
    #[error("item {item:?} has invalid length {length}")]
    InvalidItemLength { item: ItemType, length: usize },
    #[error("frame is missing the {0:?} item")]
    MissingItem(ItemType),
    #[error("item too large: {0} bytes")]
    ItemTooLarge(usize),
}

/// Item tags understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ItemType {
    DeviceToken = 1,
    Payload = 2,
    Identifier = 3,
    Expiry = 4,
    Priority = 5,
}

impl ItemType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::DeviceToken),
            2 => Some(Self::Payload),
            3 => Some(Self::Identifier),
            4 => Some(Self::Expiry),
            5 => Some(Self::Priority),
            _ => None,
        }
    }
}

/// Fixed 5-byte prefix of a notification frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u8,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 5;

    pub fn new(length: u32) -> Self {
        Self {
            command: NOTIFICATION_COMMAND,
            length,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0] = self.command;
        buf[1..].copy_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let command = buf.get_u8();
        if command != NOTIFICATION_COMMAND {
            return Err(Error::UnexpectedCommand(command));
        }
        let length = buf.get_u32();
        Ok(Self { command, length })
    }
}

/// One notification in wire form.
///
/// Optional items are omitted from the encoding entirely when unset, and a
/// decoded frame reports a missing item as `None` rather than zero.
///
/// ```
/// use bytes::Bytes;
/// use courier_wire::{DeviceToken, Frame};
///
/// let frame = Frame::new(DeviceToken::parse("<ce8be627 2e43e855>"), Bytes::from_static(b"{}"))
///     .with_identifier(7);
/// let encoded = frame.encode().expect("encode");
/// let decoded = Frame::decode(encoded).expect("decode");
/// assert_eq!(decoded.identifier, Some(7));
/// assert_eq!(decoded.expiry, None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub token: DeviceToken,
    pub payload: Bytes,
    pub identifier: Option<u32>,
    pub expiry: Option<u32>,
    pub priority: Option<u8>,
}

impl Frame {
    const ITEM_HEADER_LEN: usize = 3;

    pub fn new(token: DeviceToken, payload: Bytes) -> Self {
        Self {
            token,
            payload,
            identifier: None,
            expiry: None,
            priority: None,
        }
    }

    pub fn with_identifier(mut self, identifier: u32) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn with_expiry(mut self, expiry: u32) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Length of the item section, i.e. the value carried in the header.
    pub fn items_len(&self) -> usize {
        let mut len = Self::ITEM_HEADER_LEN + TOKEN_LEN;
        len += Self::ITEM_HEADER_LEN + self.payload.len();
        if self.identifier.is_some() {
            len += Self::ITEM_HEADER_LEN + 4;
        }
        if self.expiry.is_some() {
            len += Self::ITEM_HEADER_LEN + 4;
        }
        if self.priority.is_some() {
            len += Self::ITEM_HEADER_LEN + 1;
        }
        len
    }

    pub fn encoded_len(&self) -> usize {
        FrameHeader::LEN + self.items_len()
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the full frame (header and items) to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<()> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| Error::ItemTooLarge(self.payload.len()))?;
        let items_len = self.items_len();
        let length = u32::try_from(items_len).map_err(|_| Error::ItemTooLarge(items_len))?;
        buf.reserve(FrameHeader::LEN + items_len);

        buf.put_u8(NOTIFICATION_COMMAND);
        buf.put_u32(length);

        buf.put_u8(ItemType::DeviceToken as u8);
        buf.put_u16(TOKEN_LEN as u16);
        buf.extend_from_slice(self.token.as_bytes());

        buf.put_u8(ItemType::Payload as u8);
        buf.put_u16(payload_len);
        buf.extend_from_slice(&self.payload);

        if let Some(identifier) = self.identifier {
            buf.put_u8(ItemType::Identifier as u8);
            buf.put_u16(4);
            buf.put_u32(identifier);
        }
        if let Some(expiry) = self.expiry {
            buf.put_u8(ItemType::Expiry as u8);
            buf.put_u16(4);
            buf.put_u32(expiry);
        }
        if let Some(priority) = self.priority {
            buf.put_u8(ItemType::Priority as u8);
            buf.put_u16(1);
            buf.put_u8(priority);
        }
        Ok(())
    }

    /// Decode a complete frame, header included.
    pub fn decode(input: Bytes) -> Result<Self> {
        let header = FrameHeader::decode(&input)?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        Self::decode_items(input.slice(FrameHeader::LEN..FrameHeader::LEN + length))
    }

    /// Decode the item section that follows a `FrameHeader`.
    ///
    /// Item order is not significant; a repeated item overwrites the earlier one.
    pub fn decode_items(mut items: Bytes) -> Result<Self> {
        let mut token = None;
        let mut payload = None;
        let mut identifier = None;
        let mut expiry = None;
        let mut priority = None;
        while items.has_remaining() {
            if items.remaining() < Self::ITEM_HEADER_LEN {
                return Err(Error::Incomplete);
            }
            let tag = items.get_u8();
            let length = items.get_u16() as usize;
            if items.remaining() < length {
                return Err(Error::Incomplete);
            }
            let data = items.split_to(length);
            let item = ItemType::from_u8(tag).ok_or(Error::UnknownItem(tag))?;
            match item {
                ItemType::DeviceToken => token = Some(DeviceToken::from_bytes(&data)),
                ItemType::Payload => payload = Some(data),
                ItemType::Identifier => identifier = Some(fixed_u32(item, &data)?),
                ItemType::Expiry => expiry = Some(fixed_u32(item, &data)?),
                ItemType::Priority => {
                    if data.len() != 1 {
                        return Err(Error::InvalidItemLength {
                            item,
                            length: data.len(),
                        });
                    }
                    priority = Some(data[0]);
                }
            }
        }
        Ok(Self {
            token: token.ok_or(Error::MissingItem(ItemType::DeviceToken))?,
            payload: payload.ok_or(Error::MissingItem(ItemType::Payload))?,
            identifier,
            expiry,
            priority,
        })
    }
}

fn fixed_u32(item: ItemType, mut data: &[u8]) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::InvalidItemLength {
            item,
            length: data.len(),
        });
    }
    Ok(data.get_u32())
}
