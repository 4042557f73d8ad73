//! Remote-control framing.
//!
//! The wire format is an ASCII decimal byte length, a colon, then exactly that
//! many bytes of UTF-8 JSON:
//!
//! ```text
//! <len>:<payload of len bytes><len>:<payload of len bytes>...
//! ```
//!
//! Frames are pulled out of an append-only [`BytesMut`] filled by the socket
//! reader. A partial frame leaves the buffer untouched, so any split of the
//! byte stream across reads reassembles to the same frames.

use crate::config::RemoteConfig;
use crate::error::Result;
use crate::protocol::packet::Packet;
use bytes::{Buf, BytesMut};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Framing failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The length prefix cannot be parsed. The stream cannot be resynchronised.
    #[error("unparsable length prefix: {message}")]
    Fatal { message: String },

    /// The payload was consumed but is not a JSON object. Reading may continue.
    #[error("unparsable payload: {message}")]
    Payload { message: String },
}

impl FrameError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Fatal { .. })
    }

    fn fatal(message: impl Into<String>) -> Self {
        FrameError::Fatal {
            message: message.into(),
        }
    }
}

/// Try to take one frame off the front of `buf`.
///
/// - `Ok(None)`: no complete frame yet, `buf` is unchanged.
/// - `Ok(Some(packet))`: the frame was consumed.
/// - `Err(Payload)`: the frame was consumed but its payload did not decode.
/// - `Err(Fatal)`: the prefix is garbage; `buf` is left as is and the caller
///   must drop the connection.
pub fn try_read_frame(buf: &mut BytesMut) -> std::result::Result<Option<Packet>, FrameError> {
    let colon = match buf.iter().position(|b| *b == b':') {
        Some(idx) => idx,
        None => {
            // Still waiting for the separator; reject early if what we have
            // can never become a valid prefix.
            if let Some(bad) = buf.iter().find(|b| !b.is_ascii_digit()) {
                return Err(FrameError::fatal(format!(
                    "unexpected byte 0x{:02x} in length prefix",
                    bad
                )));
            }
            if buf.len() > RemoteConfig::MAX_PREFIX_DIGITS {
                return Err(FrameError::fatal(format!(
                    "length prefix longer than {} digits",
                    RemoteConfig::MAX_PREFIX_DIGITS
                )));
            }
            return Ok(None);
        }
    };

    let prefix = &buf[..colon];
    if prefix.is_empty() {
        return Err(FrameError::fatal("empty length prefix"));
    }
    if prefix.len() > RemoteConfig::MAX_PREFIX_DIGITS || !prefix.iter().all(u8::is_ascii_digit)
    {
        return Err(FrameError::fatal(format!(
            "invalid length prefix {:?}",
            String::from_utf8_lossy(prefix)
        )));
    }

    // All digits, so this is valid UTF-8; parse can still overflow.
    let len: usize = std::str::from_utf8(prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| FrameError::fatal("length prefix out of range"))?;

    if len > RemoteConfig::MAX_FRAME_SIZE {
        return Err(FrameError::fatal(format!(
            "frame size {} exceeds maximum {}",
            len,
            RemoteConfig::MAX_FRAME_SIZE
        )));
    }

    let total = colon + 1 + len;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(colon + 1);
    let payload = buf.split_to(len);
    decode_payload(&payload).map(Some)
}

fn decode_payload(payload: &[u8]) -> std::result::Result<Packet, FrameError> {
    let text = std::str::from_utf8(payload).map_err(|e| FrameError::Payload {
        message: format!("invalid UTF-8: {}", e),
    })?;

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(Packet::from(map)),
        Ok(other) => Err(FrameError::Payload {
            message: format!("expected a JSON object, got {}", json_kind(&other)),
        }),
        Err(e) => Err(FrameError::Payload {
            message: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Serialize a packet into one frame.
///
/// The prefix counts bytes, not characters.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(packet)?;
    let mut frame = format!("{}:", json.len()).into_bytes();
    frame.extend_from_slice(&json);
    Ok(frame)
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    let frame = encode_frame(packet)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(payload: &str) -> Vec<u8> {
        format!("{}:{}", payload.len(), payload).into_bytes()
    }

    #[test]
    fn test_single_frame() {
        let mut buf = BytesMut::from(&raw(r#"{"from":"root","type":"hello"}"#)[..]);
        let packet = try_read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(packet.sender(), Some("root"));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_fill() {
        let mut bytes = raw(r#"{"from":"a","type":"x"}"#);
        bytes.extend(raw(r#"{"from":"b","type":"y"}"#));
        bytes.extend_from_slice(b"12:{\"fr"); // start of a third frame
        let mut buf = BytesMut::from(&bytes[..]);

        let first = try_read_frame(&mut buf).unwrap().unwrap();
        let second = try_read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(first.sender(), Some("a"));
        assert_eq!(second.sender(), Some("b"));
        assert!(try_read_frame(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"12:{\"fr");
    }

    #[test]
    fn test_every_split_point_reassembles() {
        let mut bytes = raw(r#"{"from":"server1.conn0.addonsActor2","type":"ok","n":"é"}"#);
        bytes.extend(raw(r#"{"from":"root","type":"done"}"#));

        for split in 0..=bytes.len() {
            let mut buf = BytesMut::new();
            let mut frames = Vec::new();
            for chunk in [&bytes[..split], &bytes[split..]] {
                buf.extend_from_slice(chunk);
                while let Some(packet) = try_read_frame(&mut buf).unwrap() {
                    frames.push(packet);
                }
            }
            assert_eq!(frames.len(), 2, "split at {}", split);
            assert_eq!(frames[0].sender(), Some("server1.conn0.addonsActor2"));
            assert_eq!(frames[0].get_str("n"), Some("é"));
            assert_eq!(frames[1].kind(), Some("done"));
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let bytes = raw(r#"{"from":"root","applicationType":"browser"}"#);
        let mut buf = BytesMut::new();
        let mut got = None;
        for (i, b) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            let result = try_read_frame(&mut buf).unwrap();
            if i + 1 < bytes.len() {
                assert!(result.is_none());
            } else {
                got = result;
            }
        }
        assert_eq!(got.unwrap().get_str("applicationType"), Some("browser"));
    }

    #[test]
    fn test_non_numeric_prefix_is_fatal() {
        let mut buf = BytesMut::from(&b"abc:{}"[..]);
        let err = try_read_frame(&mut buf).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_garbage_before_separator_is_fatal() {
        let mut buf = BytesMut::from(&b"12x"[..]);
        assert!(try_read_frame(&mut buf).unwrap_err().is_fatal());
    }

    #[test]
    fn test_empty_prefix_is_fatal() {
        let mut buf = BytesMut::from(&b":{}"[..]);
        assert!(try_read_frame(&mut buf).unwrap_err().is_fatal());
    }

    #[test]
    fn test_overlong_prefix_is_fatal() {
        let mut buf = BytesMut::from(&b"999999999999999999999999"[..]);
        assert!(try_read_frame(&mut buf).unwrap_err().is_fatal());
    }

    #[test]
    fn test_oversized_frame_is_fatal() {
        let header = format!("{}:", RemoteConfig::MAX_FRAME_SIZE + 1);
        let mut buf = BytesMut::from(header.as_bytes());
        assert!(try_read_frame(&mut buf).unwrap_err().is_fatal());
    }

    #[test]
    fn test_bad_payload_is_not_fatal_and_advances() {
        let mut bytes = raw("not json");
        bytes.extend(raw(r#"{"from":"root","type":"next"}"#));
        let mut buf = BytesMut::from(&bytes[..]);

        let err = try_read_frame(&mut buf).unwrap_err();
        assert!(!err.is_fatal());

        let next = try_read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(next.kind(), Some("next"));
    }

    #[test]
    fn test_non_object_payload_is_not_fatal() {
        let mut buf = BytesMut::from(&raw("[1,2,3]")[..]);
        let err = try_read_frame(&mut buf).unwrap_err();
        assert_eq!(
            err,
            FrameError::Payload {
                message: "expected a JSON object, got an array".into()
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_counts_bytes() {
        let packet = Packet::new("root", "echo").with("text", "héllo");
        let frame = encode_frame(&packet).unwrap();
        let colon = frame.iter().position(|b| *b == b':').unwrap();
        let len: usize = std::str::from_utf8(&frame[..colon]).unwrap().parse().unwrap();
        assert_eq!(len, frame.len() - colon - 1);

        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(try_read_frame(&mut buf).unwrap().unwrap(), packet);
    }

    #[tokio::test]
    async fn test_write_frame() {
        let mut out = Vec::new();
        write_frame(&mut out, &Packet::new("root", "getRoot"))
            .await
            .unwrap();
        assert!(out.starts_with(b"30:"));
    }
}
