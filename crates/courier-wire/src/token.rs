// Fixed-width device tokens.
use std::fmt;

/// Width of a device token on the wire.
pub const TOKEN_LEN: usize = 32;

/// Binary device identifier, always exactly `TOKEN_LEN` bytes.
///
/// Construction never fails: shorter inputs are zero-padded and longer inputs
/// are truncated. The gateway has always tolerated this, so it is kept as a
/// pass-through behavior rather than a validation step.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken([u8; TOKEN_LEN]);

impl DeviceToken {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut token = [0u8; TOKEN_LEN];
        let len = bytes.len().min(TOKEN_LEN);
        token[..len].copy_from_slice(&bytes[..len]);
        Self(token)
    }

    /// Parse a hex-like rendering such as `<ce8be627 2e43e855 ...>`.
    ///
    /// Every character that is not a hex digit is dropped first. A trailing
    /// odd nibble becomes the high half of the last byte.
    ///
    /// ```
    /// use courier_wire::DeviceToken;
    ///
    /// let token = DeviceToken::parse("<ce8be627 2e43e855>");
    /// assert_eq!(&token.as_bytes()[..4], &[0xce, 0x8b, 0xe6, 0x27]);
    /// assert_eq!(token.as_bytes()[31], 0);
    /// ```
    pub fn parse(input: &str) -> Self {
        let mut token = [0u8; TOKEN_LEN];
        let nibbles = input.chars().filter_map(|c| c.to_digit(16));
        for (index, nibble) in nibbles.take(TOKEN_LEN * 2).enumerate() {
            let shift = if index % 2 == 0 { 4 } else { 0 };
            token[index / 2] |= (nibble as u8) << shift;
        }
        Self(token)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Lowercase hex with no separators.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl From<[u8; TOKEN_LEN]> for DeviceToken {
    fn from(value: [u8; TOKEN_LEN]) -> Self {
        Self(value)
    }
}

// Groups of eight hex digits separated by spaces, the way device tokens are
// usually printed.
impl fmt::Display for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, group) in self.0.chunks(4).enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            for byte in group {
                write!(f, "{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceToken({})", self.to_hex())
    }
}
