//! HYPER wire messages.
//!
//! Four message kinds, all integers little-endian.
//! Strings are length-prefixed (7-bit varint len + UTF-8).
//! Frame format: len:u32 | kind:u8 | payload, where `len` counts the kind
//! byte plus the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::config::Role;
use crate::error::{HyperError, Result};
use crate::hyper::buffer_pool::PooledBuf;

/// Bytes taken by the length prefix
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Length prefix plus kind tag
pub const FRAME_HEADER_SIZE: usize = LENGTH_FIELD_SIZE + 1;

/// Length prefix, kind tag and request token of a SegmentData frame
pub const SEGMENT_HEADER_SIZE: usize = FRAME_HEADER_SIZE + 4;

/// Largest `len` accepted for anything but SegmentData. Larger values mean
/// the stream is corrupt or out of sync.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024;

/// Request length asking for the file size instead of data
pub const FILE_CHECK_LENGTH: i32 = -1;

/// File size reported for missing files
pub const FILE_NOT_FOUND: i64 = -1;

// =============================================================================
// Message Kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 1,
    FileCheckResult = 2,
    Request = 3,
    SegmentData = 4,
}

impl MessageKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Handshake),
            2 => Some(Self::FileCheckResult),
            3 => Some(Self::Request),
            4 => Some(Self::SegmentData),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Handshake => "Handshake",
            Self::FileCheckResult => "FileCheckResult",
            Self::Request => "Request",
            Self::SegmentData => "SegmentData",
        }
    }
}

// =============================================================================
// HANDSHAKE (1)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub session_token: i64,
    pub role: Role,
}

impl Handshake {
    const PAYLOAD_LEN: usize = 8 + 1;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + Self::PAYLOAD_LEN);
        buf.put_u32_le((1 + Self::PAYLOAD_LEN) as u32);
        buf.put_u8(MessageKind::Handshake as u8);
        buf.put_i64_le(self.session_token);
        buf.put_u8(self.role.is_control() as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.remaining() < Self::PAYLOAD_LEN {
            return Err(HyperError::malformed("Handshake", "payload too short"));
        }
        let session_token = payload.get_i64_le();
        let is_control = match payload.get_u8() {
            0 => false,
            1 => true,
            _ => return Err(HyperError::malformed("Handshake", "role flag is not 0/1")),
        };
        Ok(Self {
            session_token,
            role: Role::from_control_flag(is_control),
        })
    }
}

// =============================================================================
// FILE_CHECK_RESULT (2)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCheckResult {
    pub token: u32,
    /// File length, or [`FILE_NOT_FOUND`]
    pub size: i64,
}

impl FileCheckResult {
    const PAYLOAD_LEN: usize = 4 + 8;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + Self::PAYLOAD_LEN);
        buf.put_u32_le((1 + Self::PAYLOAD_LEN) as u32);
        buf.put_u8(MessageKind::FileCheckResult as u8);
        buf.put_u32_le(self.token);
        buf.put_i64_le(self.size);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.remaining() < Self::PAYLOAD_LEN {
            return Err(HyperError::malformed("FileCheckResult", "payload too short"));
        }
        Ok(Self {
            token: payload.get_u32_le(),
            size: payload.get_i64_le(),
        })
    }
}

// =============================================================================
// REQUEST (3)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub token: u32,
    pub path: String,
    pub offset: i64,
    /// Bytes wanted, or [`FILE_CHECK_LENGTH`] for a size check
    pub length: i32,
}

impl Request {
    pub fn file_check(token: u32, path: impl Into<String>) -> Self {
        Self {
            token,
            path: path.into(),
            offset: 0,
            length: FILE_CHECK_LENGTH,
        }
    }

    pub fn is_file_check(&self) -> bool {
        self.length < 0
    }

    pub fn encode(&self) -> Bytes {
        let path_bytes = self.path.as_bytes();
        let mut body = BytesMut::with_capacity(4 + 5 + path_bytes.len() + 8 + 4);
        body.put_u32_le(self.token);
        body.put_u32_varint(path_bytes.len() as u32);
        body.put_slice(path_bytes);
        body.put_i64_le(self.offset);
        body.put_i32_le(self.length);

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.put_u32_le((1 + body.len()) as u32);
        buf.put_u8(MessageKind::Request as u8);
        buf.put_slice(&body);
        buf.freeze()
    }

    #[allow(deprecated)]
    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.remaining() < 4 {
            return Err(HyperError::malformed("Request", "payload too short"));
        }
        let token = payload.get_u32_le();
        let path_len = payload
            .get_u32_varint()
            .map_err(|_| HyperError::malformed("Request", "bad path length"))?
            as usize;
        if payload.remaining() < path_len + 12 {
            return Err(HyperError::malformed("Request", "payload truncated"));
        }
        let path = String::from_utf8(payload[..path_len].to_vec())?;
        payload.advance(path_len);
        let offset = payload.get_i64_le();
        let length = payload.get_i32_le();

        Ok(Self {
            token,
            path,
            offset,
            length,
        })
    }
}

// =============================================================================
// SEGMENT_DATA (4)
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
pub struct SegmentData {
    pub token: u32,
    pub data: PooledBuf,
}

impl SegmentData {
    /// Header written ahead of the raw payload, so the payload itself can be
    /// written straight from its pooled buffer.
    pub fn header(token: u32, payload_len: usize) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut hdr = [0u8; SEGMENT_HEADER_SIZE];
        let mut cursor = &mut hdr[..];
        cursor.put_u32_le((5 + payload_len) as u32);
        cursor.put_u8(MessageKind::SegmentData as u8);
        cursor.put_u32_le(token);
        hdr
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_SIZE + self.data.len());
        buf.put_slice(&Self::header(self.token, self.data.len()));
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

// =============================================================================
// Message
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    FileCheckResult(FileCheckResult),
    Request(Request),
    SegmentData(SegmentData),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake(_) => MessageKind::Handshake,
            Message::FileCheckResult(_) => MessageKind::FileCheckResult,
            Message::Request(_) => MessageKind::Request,
            Message::SegmentData(_) => MessageKind::SegmentData,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Message::Handshake(m) => m.encode(),
            Message::FileCheckResult(m) => m.encode(),
            Message::Request(m) => m.encode(),
            Message::SegmentData(m) => m.encode(),
        }
    }

    /// Decode the payload of an ordinary (non segment) message.
    pub fn decode_ordinary(kind: MessageKind, payload: &[u8]) -> Result<Self> {
        match kind {
            MessageKind::Handshake => Ok(Message::Handshake(Handshake::decode(payload)?)),
            MessageKind::FileCheckResult => {
                Ok(Message::FileCheckResult(FileCheckResult::decode(payload)?))
            }
            MessageKind::Request => Ok(Message::Request(Request::decode(payload)?)),
            MessageKind::SegmentData => Err(HyperError::UnexpectedMessage("SegmentData")),
        }
    }

    /// Decode one complete frame held entirely in memory.
    /// Returns the message and the number of bytes it occupied.
    pub fn decode_frame(frame: &[u8]) -> Result<(Self, usize)> {
        let header = match FrameHeader::parse(frame, usize::MAX)? {
            Some(header) => header,
            None => return Err(HyperError::malformed("frame", "header truncated")),
        };
        let total = header.frame_len();
        if frame.len() < total {
            return Err(HyperError::malformed(header.kind.name(), "frame truncated"));
        }
        let msg = match header.kind {
            MessageKind::SegmentData => {
                if frame.len() < SEGMENT_HEADER_SIZE {
                    return Err(HyperError::malformed("SegmentData", "token missing"));
                }
                let token = u32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]);
                Message::SegmentData(SegmentData {
                    token,
                    data: PooledBuf::from_vec(frame[SEGMENT_HEADER_SIZE..total].to_vec()),
                })
            }
            kind => Message::decode_ordinary(kind, &frame[FRAME_HEADER_SIZE..total])?,
        };
        Ok((msg, total))
    }
}

// =============================================================================
// Frame header
// =============================================================================

/// The length and kind at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Bytes following the length field, kind tag included
    pub len: usize,
    pub kind: MessageKind,
}

impl FrameHeader {
    /// Parse a header from the start of `buf`. `Ok(None)` means more bytes
    /// are needed. `max_segment` bounds SegmentData payloads.
    pub fn parse(buf: &[u8], max_segment: usize) -> Result<Option<Self>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let tag = buf[LENGTH_FIELD_SIZE];
        let kind = MessageKind::from_u8(tag).ok_or(HyperError::UnknownKind(tag))?;

        match kind {
            MessageKind::SegmentData => {
                if len < 5 {
                    return Err(HyperError::malformed("SegmentData", "length below header"));
                }
                if len - 5 > max_segment {
                    return Err(HyperError::SegmentTooLarge {
                        len: len - 5,
                        max: max_segment,
                    });
                }
            }
            _ => {
                if len == 0 {
                    return Err(HyperError::malformed(kind.name(), "zero length"));
                }
                if len > MAX_MESSAGE_SIZE {
                    return Err(HyperError::FrameTooLarge {
                        kind: tag,
                        len,
                        max: MAX_MESSAGE_SIZE,
                    });
                }
            }
        }
        Ok(Some(Self { len, kind }))
    }

    pub fn frame_len(&self) -> usize {
        LENGTH_FIELD_SIZE + self.len
    }

    pub fn segment_payload_len(&self) -> usize {
        self.len - 5
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode();
        let (decoded, used) = Message::decode_frame(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_handshake_layout() {
        let hs = Handshake {
            session_token: -2,
            role: Role::Control,
        };
        let encoded = hs.encode();
        assert_eq!(encoded.len(), 14);
        assert_eq!(&encoded[..4], &10u32.to_le_bytes());
        assert_eq!(encoded[4], 1);
        assert_eq!(&encoded[5..13], &(-2i64).to_le_bytes());
        assert_eq!(encoded[13], 1);
    }

    #[test]
    fn test_handshake_roundtrip() {
        roundtrip(Message::Handshake(Handshake {
            session_token: 0x1234_5678_9abc_def0,
            role: Role::Transfer,
        }));
    }

    #[test]
    fn test_file_check_result_roundtrip() {
        roundtrip(Message::FileCheckResult(FileCheckResult {
            token: 7,
            size: FILE_NOT_FOUND,
        }));
    }

    #[test]
    fn test_request_roundtrip() {
        roundtrip(Message::Request(Request {
            token: 42,
            path: "/share/video.avi".to_string(),
            offset: 1 << 33,
            length: 65536,
        }));
        roundtrip(Message::Request(Request::file_check(43, "/share/missing.bin")));
    }

    #[test]
    fn test_request_long_path_uses_multibyte_prefix() {
        let path = "/share/".to_string() + &"x".repeat(300);
        let req = Request {
            token: 1,
            path,
            offset: 0,
            length: 10,
        };
        let encoded = req.encode();
        // token(4) then varint 300 = 0xAC 0x02
        assert_eq!(&encoded[9..11], &[0xAC, 0x02]);
        roundtrip(Message::Request(req));
    }

    #[test]
    fn test_segment_roundtrip() {
        roundtrip(Message::SegmentData(SegmentData {
            token: 9,
            data: PooledBuf::from_vec(vec![]),
        }));
        roundtrip(Message::SegmentData(SegmentData {
            token: 10,
            data: PooledBuf::from_vec((0..=255u8).collect()),
        }));
    }

    #[test]
    fn test_segment_header_matches_encode() {
        let seg = SegmentData {
            token: 5,
            data: PooledBuf::from_vec(vec![1, 2, 3]),
        };
        let encoded = seg.encode();
        assert_eq!(&encoded[..SEGMENT_HEADER_SIZE], &SegmentData::header(5, 3));
        assert_eq!(&encoded[..4], &8u32.to_le_bytes());
    }

    #[test]
    fn test_request_is_file_check() {
        assert!(Request::file_check(1, "/a").is_file_check());
        let req = Request {
            token: 1,
            path: "/a".into(),
            offset: 0,
            length: 0,
        };
        assert!(!req.is_file_check());
    }

    #[test]
    fn test_message_kind_from_u8() {
        assert_eq!(MessageKind::from_u8(1), Some(MessageKind::Handshake));
        assert_eq!(MessageKind::from_u8(4), Some(MessageKind::SegmentData));
        assert_eq!(MessageKind::from_u8(0), None);
        assert_eq!(MessageKind::from_u8(5), None);
    }

    #[test]
    fn test_header_rejects_oversized_ordinary_frame() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes());
        buf.push(MessageKind::Request as u8);
        let err = FrameHeader::parse(&buf, 1024).unwrap_err();
        assert!(matches!(err, HyperError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_header_allows_large_segment_within_pool() {
        let buf = SegmentData::header(1, 1024);
        let header = FrameHeader::parse(&buf, 1024).unwrap().unwrap();
        assert_eq!(header.segment_payload_len(), 1024);
        let err = FrameHeader::parse(&buf, 1023).unwrap_err();
        assert!(matches!(err, HyperError::SegmentTooLarge { .. }));
    }

    #[test]
    fn test_header_unknown_kind() {
        let buf = [5, 0, 0, 0, 0x7f];
        let err = FrameHeader::parse(&buf, 1024).unwrap_err();
        assert!(matches!(err, HyperError::UnknownKind(0x7f)));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let err = FileCheckResult::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, HyperError::Malformed { .. }));
    }
}
