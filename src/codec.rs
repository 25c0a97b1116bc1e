//! BLIP frame codec boundary
//!
//! Turns buffered wire frames into structured [`Message`]s and back. Each
//! WebSocket binary payload carries one BLIP frame: a varint message
//! number, varint flags, a varint-length-prefixed properties blob (first
//! frame of a message only), the body chunk, and a 4-byte CRC32 trailer.
//! A frame flagged `MoreComing` means the message continues in following
//! frames; the pipeline keeps buffering until a terminating frame arrives.
//! Checksums are carried through, never verified or recomputed.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::message::{FrameFlags, Message, MessageKind, Properties};

/// Upper bound on the properties blob, mirrored from the reference
/// implementation's frame limits.
pub const MAX_PROPERTIES_SIZE: usize = 16384;

/// Errors produced while decoding or encoding BLIP frames.
#[derive(Error, Debug)]
pub enum CodecError {
    /// A varint ran past the end of the frame or exceeded 64 bits.
    #[error("invalid varint in frame")]
    InvalidVarint,
    /// Frame ended before a declared section was complete.
    #[error("truncated frame: {0}")]
    Truncated(&'static str),
    /// Properties blob length exceeds the frame limit.
    #[error("properties blob too large: {0} > {MAX_PROPERTIES_SIZE}")]
    PropertiesTooLarge(usize),
    /// The type bits of the flags byte do not name a message kind.
    #[error("unrecognized message type bits: 0x{0:02x}")]
    BadTypeBits(u8),
    /// Properties blob was not valid UTF-8.
    #[error("properties blob is not UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),
}

/// The interface the tamper pipeline uses to cross the codec boundary.
pub trait FrameCodec: Send {
    /// Decode the buffered frames of one direction. `Ok(None)` means the
    /// message is not complete yet (a frame still carries `MoreComing`).
    fn decode(&self, frames: &[Vec<u8>]) -> Result<Option<Message>, CodecError>;

    /// Encode a message as a single terminating frame.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError>;
}

/// Accumulates the wire frames of one socket direction until the codec
/// reports a complete message.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: Vec<Vec<u8>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Vec<u8>) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Vec<u8>] {
        &self.frames
    }

    /// Discard buffered frames after a complete message was consumed (or
    /// after a failed cycle, so corrupt input cannot poison the next one).
    pub fn reset(&mut self) {
        self.frames.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(CodecError::InvalidVarint)?;
        *pos += 1;
        if shift >= 64 {
            return Err(CodecError::InvalidVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// The default wire codec.
#[derive(Debug, Default)]
pub struct BlipWireCodec;

struct FrameHeader {
    number: u64,
    flags: FrameFlags,
}

impl BlipWireCodec {
    fn read_header(data: &[u8], pos: &mut usize) -> Result<FrameHeader, CodecError> {
        let number = read_varint(data, pos)?;
        let flag_bits = read_varint(data, pos)?;
        let flags = FrameFlags::from_bits_retain(flag_bits as u8);
        Ok(FrameHeader { number, flags })
    }

    fn body_chunk<'a>(data: &'a [u8], pos: usize) -> Result<(&'a [u8], u32), CodecError> {
        let rest = data.get(pos..).ok_or(CodecError::Truncated("body"))?;
        if rest.len() < 4 {
            return Err(CodecError::Truncated("checksum"));
        }
        let (chunk, trailer) = rest.split_at(rest.len() - 4);
        Ok((chunk, BigEndian::read_u32(trailer)))
    }
}

impl FrameCodec for BlipWireCodec {
    fn decode(&self, frames: &[Vec<u8>]) -> Result<Option<Message>, CodecError> {
        let first = match frames.first() {
            Some(f) => f,
            None => return Ok(None),
        };

        let mut pos = 0;
        let header = Self::read_header(first, &mut pos)?;
        let kind = MessageKind::from_type_bits(header.flags.bits())
            .ok_or_else(|| CodecError::BadTypeBits(header.flags.bits()))?;

        let props_len = read_varint(first, &mut pos)? as usize;
        if props_len > MAX_PROPERTIES_SIZE {
            return Err(CodecError::PropertiesTooLarge(props_len));
        }
        let props_end = pos
            .checked_add(props_len)
            .filter(|&end| end <= first.len())
            .ok_or(CodecError::Truncated("properties"))?;
        let properties = Properties::parse(std::str::from_utf8(&first[pos..props_end])?);

        let (chunk, mut checksum) = Self::body_chunk(first, props_end)?;
        let mut body = chunk.to_vec();
        let mut more_coming = header.flags.contains(FrameFlags::MORE_COMING);

        // Continuation frames repeat the number/flags header but carry no
        // properties section.
        for frame in &frames[1..] {
            let mut pos = 0;
            let cont = Self::read_header(frame, &mut pos)?;
            let (chunk, trailer) = Self::body_chunk(frame, pos)?;
            body.extend_from_slice(chunk);
            checksum = trailer;
            more_coming = cont.flags.contains(FrameFlags::MORE_COMING);
        }

        if more_coming {
            return Ok(None);
        }

        Ok(Some(Message {
            number: header.number,
            kind,
            flags: header.flags - FrameFlags::MORE_COMING,
            properties,
            body,
            checksum,
        }))
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let blob = message.properties.to_blob();
        if blob.len() > MAX_PROPERTIES_SIZE {
            return Err(CodecError::PropertiesTooLarge(blob.len()));
        }

        let flags = message.flags - FrameFlags::MORE_COMING;
        let mut out = Vec::with_capacity(blob.len() + message.body.len() + 16);
        write_varint(&mut out, message.number);
        write_varint(&mut out, u64::from(flags.bits()));
        write_varint(&mut out, blob.len() as u64);
        out.extend_from_slice(blob.as_bytes());
        out.extend_from_slice(&message.body);

        let mut trailer = [0u8; 4];
        BigEndian::write_u32(&mut trailer, message.checksum);
        out.extend_from_slice(&trailer);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_message() -> Message {
        let mut msg = Message::new(42, MessageKind::Request);
        msg.properties.insert("Profile", "echo");
        msg.properties.insert("Client-ID", "abc");
        msg.body = b"hello there".to_vec();
        msg.checksum = 0xdeadbeef;
        msg
    }

    #[test]
    fn test_roundtrip() {
        let codec = BlipWireCodec;
        let msg = sample_message();
        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&[bytes]).unwrap().expect("complete");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_empty_properties_and_body() {
        let codec = BlipWireCodec;
        let msg = Message::new(0, MessageKind::AckResponse);
        let bytes = codec.encode(&msg).unwrap();
        let decoded = codec.decode(&[bytes]).unwrap().expect("complete");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_more_coming_defers_completion() {
        let codec = BlipWireCodec;
        let mut msg = sample_message();
        msg.flags |= FrameFlags::MORE_COMING;

        // Build the fragment by hand since encode always terminates
        let blob = msg.properties.to_blob();
        let mut first = Vec::new();
        write_varint(&mut first, msg.number);
        write_varint(&mut first, u64::from(msg.flags.bits()));
        write_varint(&mut first, blob.len() as u64);
        first.extend_from_slice(blob.as_bytes());
        first.extend_from_slice(b"hel");
        first.extend_from_slice(&[0u8; 4]);

        assert!(codec.decode(&[first.clone()]).unwrap().is_none());

        let mut last = Vec::new();
        write_varint(&mut last, msg.number);
        write_varint(&mut last, u64::from((msg.flags - FrameFlags::MORE_COMING).bits()));
        last.extend_from_slice(b"lo");
        let mut trailer = [0u8; 4];
        BigEndian::write_u32(&mut trailer, 7);
        last.extend_from_slice(&trailer);

        let decoded = codec
            .decode(&[first, last])
            .unwrap()
            .expect("complete after terminator");
        assert_eq!(decoded.body, b"hello".to_vec());
        assert_eq!(decoded.checksum, 7);
        assert!(!decoded.flags.contains(FrameFlags::MORE_COMING));
    }

    #[test]
    fn test_empty_buffer_is_incomplete() {
        let codec = BlipWireCodec;
        assert!(codec.decode(&[]).unwrap().is_none());
    }

    #[test]
    fn test_reject_bad_type_bits() {
        let codec = BlipWireCodec;
        let mut frame = Vec::new();
        write_varint(&mut frame, 1);
        write_varint(&mut frame, 0x03); // 3 is not a message kind
        write_varint(&mut frame, 0);
        frame.extend_from_slice(&[0u8; 4]);
        assert!(matches!(
            codec.decode(&[frame]),
            Err(CodecError::BadTypeBits(_))
        ));
    }

    #[test]
    fn test_reject_oversized_properties_length() {
        let codec = BlipWireCodec;
        let mut frame = Vec::new();
        write_varint(&mut frame, 1);
        write_varint(&mut frame, 0);
        write_varint(&mut frame, (MAX_PROPERTIES_SIZE + 1) as u64);
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            codec.decode(&[frame]),
            Err(CodecError::PropertiesTooLarge(_))
        ));
    }

    #[test]
    fn test_reject_truncated_frame() {
        let codec = BlipWireCodec;
        let mut frame = Vec::new();
        write_varint(&mut frame, 1);
        write_varint(&mut frame, 0);
        write_varint(&mut frame, 100); // declares more properties than exist
        frame.extend_from_slice(b"short");
        assert!(codec.decode(&[frame]).is_err());
    }

    #[test]
    fn test_varint_roundtrip_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_frame_buffer_reset() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.is_empty());
        buffer.push(vec![1, 2, 3]);
        assert_eq!(buffer.frames().len(), 1);
        buffer.reset();
        assert!(buffer.is_empty());
    }

    proptest! {
        #[test]
        fn test_decode_arbitrary_frame_doesnt_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let codec = BlipWireCodec;
            let _ = codec.decode(&[data]);
        }

        #[test]
        fn test_roundtrip_arbitrary_body(
            number in any::<u64>(),
            body in prop::collection::vec(any::<u8>(), 0..1024),
            checksum in any::<u32>(),
        ) {
            let codec = BlipWireCodec;
            let mut msg = Message::new(number, MessageKind::Response);
            msg.body = body;
            msg.checksum = checksum;
            let bytes = codec.encode(&msg).unwrap();
            let decoded = codec.decode(&[bytes]).unwrap().expect("complete");
            prop_assert_eq!(decoded, msg);
        }
    }
}
