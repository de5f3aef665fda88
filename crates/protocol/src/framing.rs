//! Packet framing over a byte stream.
//!
//! # Packet Format
//!
//! Each packet consists of:
//! - 1 byte: version (currently 1)
//! - 4 bytes: payload length (big-endian)
//! - 11 bytes: reserved, zero on send and ignored on receive
//! - N bytes: MessagePack-encoded [`Message`]
//!
//! A [`Packet`] is both the reassembly buffer used on receive and the send
//! cursor used on transmit, so partial reads and partial writes resume where
//! they stopped.

use crate::error::{ProtocolError, Result};
use crate::messages::Message;

/// Packet header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Version byte written in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size (16 MB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet version.
    pub version: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl PacketHeader {
    /// Header for a payload of `length` bytes at the current version.
    pub fn new(length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            length,
        }
    }

    /// Encode the header into its 16-byte wire form.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1..5].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Decode and validate a header.
    ///
    /// Fails on short input, a foreign version, or a length above
    /// [`MAX_PAYLOAD_SIZE`]. The last two are stream-fatal.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::Incomplete {
                need: HEADER_SIZE,
                have: data.len(),
            });
        }

        if data[0] != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                got: data[0],
            });
        }

        let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        if length as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: length as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            version: data[0],
            length,
        })
    }
}

/// A packet being received or sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    header: [u8; HEADER_SIZE],
    length: usize,
    payload: Vec<u8>,
    header_sent: usize,
    payload_sent: usize,
}

impl Packet {
    /// Build a complete outbound packet from a message.
    pub fn from_message(message: &Message) -> Result<Self> {
        let payload = message.to_msgpack()?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        Ok(Self {
            header: PacketHeader::new(payload.len() as u32).encode(),
            length: payload.len(),
            payload,
            header_sent: 0,
            payload_sent: 0,
        })
    }

    /// Start reassembling an inbound packet from its header bytes.
    pub fn from_header(data: &[u8]) -> Result<Self> {
        let header = PacketHeader::decode(data)?;
        let length = header.length as usize;

        Ok(Self {
            header: header.encode(),
            length,
            payload: Vec::with_capacity(length),
            header_sent: 0,
            payload_sent: 0,
        })
    }

    /// Declared payload length.
    #[inline]
    pub fn payload_length(&self) -> usize {
        self.length
    }

    /// Payload bytes received so far.
    #[inline]
    pub fn received(&self) -> usize {
        self.payload.len()
    }

    /// Payload bytes still missing.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.length - self.payload.len()
    }

    /// Whether every payload byte has been received.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.payload.len() == self.length
    }

    /// Append received payload bytes.
    ///
    /// Copies at most [`remaining`](Self::remaining) bytes and returns how many
    /// were taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.remaining());
        self.payload.extend_from_slice(&data[..take]);
        take
    }

    /// Raw payload bytes received so far.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload into a message.
    pub fn decode_message(&self) -> Result<Message> {
        if !self.is_complete() {
            return Err(ProtocolError::PacketIncomplete {
                received: self.payload.len(),
                length: self.length,
            });
        }
        Ok(Message::from_msgpack(&self.payload)?)
    }

    /// Full wire form: header followed by payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Next slice that still has to be written.
    ///
    /// The header goes out first, then the payload. Empty once fully sent.
    pub fn unsent(&self) -> &[u8] {
        if self.header_sent < HEADER_SIZE {
            &self.header[self.header_sent..]
        } else {
            &self.payload[self.payload_sent..]
        }
    }

    /// Record that `n` bytes of [`unsent`](Self::unsent) were written.
    pub fn advance(&mut self, n: usize) {
        if self.header_sent < HEADER_SIZE {
            self.header_sent = (self.header_sent + n).min(HEADER_SIZE);
        } else {
            self.payload_sent = (self.payload_sent + n).min(self.payload.len());
        }
    }

    /// Whether the header and the whole payload have been written.
    pub fn is_sent(&self) -> bool {
        self.header_sent == HEADER_SIZE && self.payload_sent == self.payload.len()
    }
}

/// Encode a message into an outbound packet.
pub fn encode(message: &Message) -> Result<Packet> {
    Packet::from_message(message)
}

/// Decode a 16-byte packet header.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<PacketHeader> {
    PacketHeader::decode(header)
}

/// Decode the message carried by a complete packet.
pub fn decode(packet: &Packet) -> Result<Message> {
    packet.decode_message()
}

/// Stateless encoder and decoder for whole packets in a buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self
    }

    /// Encode a message into header and payload bytes.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(Packet::from_message(message)?.to_bytes())
    }

    /// Decode one packet from the start of `data`.
    ///
    /// Returns the message and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Message, usize)> {
        let header = PacketHeader::decode(data)?;
        let total = HEADER_SIZE + header.length as usize;

        // Check we have the whole payload
        if data.len() < total {
            return Err(ProtocolError::Incomplete {
                need: total,
                have: data.len(),
            });
        }

        let message = Message::from_msgpack(&data[HEADER_SIZE..total])?;
        Ok((message, total))
    }

    /// Like [`decode`](Self::decode) but returns `None` while data is short.
    ///
    /// Header validation errors are still reported.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Message, usize)>> {
        if data.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::decode(data)?;
        if data.len() < HEADER_SIZE + header.length as usize {
            return Ok(None);
        }

        self.decode(data).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;
    use crate::messages::{ResponsePacket, Status};

    fn sample() -> Message {
        Message::response(
            "1234",
            Command::DownloadDataResp,
            ResponsePacket::DownloadData(vec![7u8; 100]),
        )
    }

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(0x0102_0304).encode();
        assert_eq!(header[0], PROTOCOL_VERSION);
        assert_eq!(&header[1..5], &[0x01, 0x02, 0x03, 0x04]);
        assert!(header[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_header_ignores_reserved_bytes() {
        let mut raw = PacketHeader::new(5).encode();
        raw[10] = 0xAA;
        raw[15] = 0x55;
        let header = PacketHeader::decode(&raw).unwrap();
        assert_eq!(header.length, 5);
    }

    #[test]
    fn test_header_rejects_version() {
        let mut raw = PacketHeader::new(5).encode();
        raw[0] = 2;
        let err = PacketHeader::decode(&raw).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedVersion {
                expected: 1,
                got: 2
            }
        ));
        assert!(err.is_stream_fatal());
    }

    #[test]
    fn test_header_rejects_oversized_length() {
        let raw = PacketHeader::new(MAX_PAYLOAD_SIZE as u32 + 1).encode();
        let err = PacketHeader::decode(&raw).unwrap_err();
        assert!(matches!(err, ProtocolError::PacketTooLarge { .. }));
    }

    #[test]
    fn test_header_accepts_max_length() {
        let raw = PacketHeader::new(MAX_PAYLOAD_SIZE as u32).encode();
        assert!(PacketHeader::decode(&raw).is_ok());
    }

    #[test]
    fn test_header_short_input() {
        let err = PacketHeader::decode(&[1, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete { need: 16, have: 3 }));
    }

    #[test]
    fn test_reassembly_in_pieces() {
        let bytes = Packet::from_message(&sample()).unwrap().to_bytes();
        let mut packet = Packet::from_header(&bytes[..HEADER_SIZE]).unwrap();
        let body = &bytes[HEADER_SIZE..];

        for chunk in body.chunks(7) {
            assert!(!packet.is_complete());
            assert_eq!(packet.append(chunk), chunk.len());
        }

        assert!(packet.is_complete());
        assert_eq!(packet.remaining(), 0);
        assert_eq!(packet.decode_message().unwrap(), sample());
    }

    #[test]
    fn test_append_stops_at_declared_length() {
        let bytes = Packet::from_message(&sample()).unwrap().to_bytes();
        let mut packet = Packet::from_header(&bytes[..HEADER_SIZE]).unwrap();

        let mut extended = bytes[HEADER_SIZE..].to_vec();
        extended.extend_from_slice(&[0xFF; 10]);
        let taken = packet.append(&extended);

        assert_eq!(taken, bytes.len() - HEADER_SIZE);
        assert!(packet.is_complete());
    }

    #[test]
    fn test_decode_incomplete_packet() {
        let bytes = Packet::from_message(&sample()).unwrap().to_bytes();
        let mut packet = Packet::from_header(&bytes[..HEADER_SIZE]).unwrap();
        packet.append(&bytes[HEADER_SIZE..HEADER_SIZE + 3]);

        let err = packet.decode_message().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PacketIncomplete { received: 3, .. }
        ));
    }

    #[test]
    fn test_garbage_payload_is_not_stream_fatal() {
        let mut packet = Packet::from_header(&PacketHeader::new(3).encode()).unwrap();
        packet.append(&[0xc1, 0xc1, 0xc1]);
        let err = packet.decode_message().unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedPayload(_)));
        assert!(!err.is_stream_fatal());
    }

    #[test]
    fn test_send_cursor_with_partial_writes() {
        let mut packet = Packet::from_message(&sample()).unwrap();
        let expected = packet.to_bytes();
        let mut written = Vec::new();

        // Write at most 5 bytes at a time
        while !packet.is_sent() {
            let chunk = packet.unsent();
            let n = chunk.len().min(5);
            written.extend_from_slice(&chunk[..n]);
            packet.advance(n);
        }

        assert_eq!(written, expected);
        assert!(packet.unsent().is_empty());
    }

    #[test]
    fn test_codec_decode_multiple() {
        let codec = FrameCodec::new();
        let first = sample();
        let second = Message::status("1234", Command::DownloadError, Status::new(2, "ENOENT"));

        let mut combined = codec.encode(&first).unwrap();
        let first_len = combined.len();
        combined.extend_from_slice(&codec.encode(&second).unwrap());

        let (decoded, consumed) = codec.decode(&combined).unwrap();
        assert_eq!(decoded, first);
        assert_eq!(consumed, first_len);

        let (decoded, _) = codec.decode(&combined[consumed..]).unwrap();
        assert_eq!(decoded, second);
    }

    #[test]
    fn test_codec_try_decode_partial() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&sample()).unwrap();

        for i in 0..encoded.len() {
            assert!(
                codec.try_decode(&encoded[..i]).unwrap().is_none(),
                "should return None for partial data (len={})",
                i
            );
        }

        let (decoded, consumed) = codec.try_decode(&encoded).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_codec_try_decode_bad_version() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(&sample()).unwrap();
        encoded[0] = 9;
        assert!(codec.try_decode(&encoded).is_err());
    }
}
