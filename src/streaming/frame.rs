//! Stream framing
//!
//! Binary frames carry a one-byte channel prefix (the kubelet streaming
//! convention): stdin/stdout/stderr data, an error channel, and a resize
//! control channel. Ordering within a channel is preserved; interleaving
//! across channels carries no guarantee.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Channel discriminator, the first byte of every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
    /// Terminal error/status reports
    Error = 3,
    /// TTY resize requests, JSON `{"Width":..,"Height":..}`
    Resize = 4,
}

impl Channel {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Channel::Stdin),
            1 => Some(Channel::Stdout),
            2 => Some(Channel::Stderr),
            3 => Some(Channel::Error),
            4 => Some(Channel::Resize),
            _ => None,
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: Channel, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Serialize with the channel prefix
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.channel as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a prefixed frame; empty input and unknown channels are None
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (&first, rest) = data.split_first()?;
        Some(Self {
            channel: Channel::from_byte(first)?,
            payload: Bytes::copy_from_slice(rest),
        })
    }
}

/// Resize control payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeRequest {
    #[serde(rename = "Width")]
    pub width: u16,

    #[serde(rename = "Height")]
    pub height: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let frame = Frame::new(Channel::Stdout, &b"hello"[..]);
        let encoded = frame.encode();
        assert_eq!(encoded[0], 1);

        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.channel, Channel::Stdout);
        assert_eq!(&decoded.payload[..], b"hello");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode(&[]).is_none());
        assert!(Frame::decode(&[9, 1, 2]).is_none());
    }

    #[test]
    fn test_resize_payload() {
        let parsed: ResizeRequest = serde_json::from_str(r#"{"Width":80,"Height":24}"#).unwrap();
        assert_eq!(parsed.width, 80);
        assert_eq!(parsed.height, 24);
    }
}
