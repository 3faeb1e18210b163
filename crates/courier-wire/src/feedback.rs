// Decommissioned-device records read from the feedback channel.
use bytes::Buf;
use std::time::{Duration, SystemTime};

use crate::token::{DeviceToken, TOKEN_LEN};
use crate::{Error, Result};

/// `timestamp (u32 BE) | token length (u16 BE) | token (32 bytes)`
pub const FEEDBACK_RECORD_LEN: usize = 4 + 2 + TOKEN_LEN;

/// A device the gateway reported as no longer accepting notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackRecord {
    /// Seconds since the Unix epoch at which the device was marked invalid.
    pub timestamp: u32,
    pub token: DeviceToken,
}

impl FeedbackRecord {
    pub fn decode(mut input: &[u8]) -> Result<Self> {
        if input.len() < FEEDBACK_RECORD_LEN {
            return Err(Error::Incomplete);
        }
        let timestamp = input.get_u32();
        // The declared length never exceeds the fixed token slot.
        let token_len = (input.get_u16() as usize).min(TOKEN_LEN);
        let token = DeviceToken::from_bytes(&input[..token_len]);
        Ok(Self { timestamp, token })
    }

    pub fn encode(&self) -> [u8; FEEDBACK_RECORD_LEN] {
        let mut buf = [0u8; FEEDBACK_RECORD_LEN];
        buf[..4].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[4..6].copy_from_slice(&(TOKEN_LEN as u16).to_be_bytes());
        buf[6..].copy_from_slice(self.token.as_bytes());
        buf
    }

    pub fn time(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(u64::from(self.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reads_timestamp_and_token() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&443_779_200u32.to_be_bytes());
        raw.extend_from_slice(&32u16.to_be_bytes());
        raw.extend_from_slice(
            DeviceToken::parse("ce8be6272e43e85516033e24b4c289220eeda4879c477160b2545e95b68b5969")
                .as_bytes(),
        );
        let record = FeedbackRecord::decode(&raw).expect("decode");
        assert_eq!(record.timestamp, 443_779_200);
        assert_eq!(
            record.token.to_string(),
            "ce8be627 2e43e855 16033e24 b4c28922 0eeda487 9c477160 b2545e95 b68b5969"
        );
        assert_eq!(FeedbackRecord::decode(&record.encode()).expect("decode"), record);
    }

    #[test]
    fn decode_honors_short_declared_length() {
        let mut raw = [0xffu8; FEEDBACK_RECORD_LEN];
        raw[..4].copy_from_slice(&1u32.to_be_bytes());
        raw[4..6].copy_from_slice(&4u16.to_be_bytes());
        let record = FeedbackRecord::decode(&raw).expect("decode");
        assert_eq!(&record.token.as_bytes()[..5], &[0xff, 0xff, 0xff, 0xff, 0]);
    }

    #[test]
    fn decode_rejects_partial_record() {
        let err = FeedbackRecord::decode(&[0u8; 20]).expect_err("partial");
        assert_eq!(err, Error::Incomplete);
    }

    #[test]
    fn time_is_seconds_since_epoch() {
        let record = FeedbackRecord {
            timestamp: 60,
            token: DeviceToken::from_bytes(&[]),
        };
        assert_eq!(
            record.time(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(60)
        );
    }
}
