//! Length-prefixed envelope framing for the TCP transport.
//!
//! Each frame is a 4-byte big-endian length followed by one JSON envelope.
//! A frame that fails to decode is yielded as an item, not an error, so one
//! bad message never ends the stream. Oversized frames are a stream error.

use std::io;

use argus_core::{DecodeFailure, Envelope, decode_frame};
use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default upper bound on a single frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec turning length-prefixed frames into envelopes.
#[derive(Debug)]
pub struct EnvelopeFrameCodec {
    inner: LengthDelimitedCodec,
}

impl EnvelopeFrameCodec {
    /// Codec with the default frame limit.
    pub fn new() -> Self {
        Self::with_max_frame(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Codec rejecting frames above `max_frame_bytes`.
    pub fn with_max_frame(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .big_endian()
                .max_frame_length(max_frame_bytes)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeFrameCodec {
    type Item = Result<Envelope, DecodeFailure>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(|frame| decode_frame(&frame)))
    }
}

impl Encoder<Bytes> for EnvelopeFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_core::errors::MALFORMED_ENVELOPE;
    use argus_core::{EnvelopeKind, encode};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn frame(body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        EnvelopeFrameCodec::new()
            .encode(Bytes::copy_from_slice(body), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn length_prefix_is_big_endian_u32() {
        let buf = frame(b"{}");
        assert_eq!(&buf[..4], &[0, 0, 0, 2]);
        assert_eq!(&buf[4..], b"{}");
    }

    #[test]
    fn decodes_consecutive_frames() {
        let a = encode(&Envelope::heartbeat()).unwrap();
        let b = encode(&Envelope::command("c1", "scene", "spawn", json!({}))).unwrap();
        let mut buf = frame(&a);
        buf.extend_from_slice(&frame(&b));

        let mut codec = EnvelopeFrameCodec::new();
        let first = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(first.kind, EnvelopeKind::Heartbeat);
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second.id, "c1");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let full = frame(&encode(&Envelope::heartbeat()).unwrap());
        let mut buf = BytesMut::from(&full[..full.len() - 3]);
        let mut codec = EnvelopeFrameCodec::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 3..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn bad_frame_is_an_item_and_stream_continues() {
        let mut buf = frame(br#"{"v":1,"id":"x1","kind":"teleport"}"#);
        buf.extend_from_slice(&frame(&encode(&Envelope::heartbeat()).unwrap()));

        let mut codec = EnvelopeFrameCodec::new();
        let failure = codec.decode(&mut buf).unwrap().unwrap().unwrap_err();
        assert_eq!(failure.id.as_deref(), Some("x1"));
        assert_eq!(failure.error.code(), MALFORMED_ENVELOPE);
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_ok());
    }

    #[test]
    fn oversized_frame_is_a_stream_error() {
        let mut buf = frame(&[b' '; 64]);
        let mut codec = EnvelopeFrameCodec::with_max_frame(16);
        assert_matches!(codec.decode(&mut buf), Err(e) if e.kind() == io::ErrorKind::InvalidData);
    }
}
