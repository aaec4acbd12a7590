//! Binary frame encoding and resumable decoding
//!
//! Layout of every frame (all integers big-endian):
//!
//! ```text
//! +-------+--------+---------+-----------+-----------+---------------+
//! | magic | opcode | key_len | extra_len | data_type | status/vbucket|
//! | 1B    | 1B     | 2B      | 1B        | 1B        | 2B            |
//! +-------+--------+---------+-----------+-----------+---------------+
//! | total_body_len (4B) | opaque (4B) | cas (8B)                     |
//! +---------------------+-------------+------------------------------+
//! | extras (extra_len) | key (key_len) | value (remaining body)      |
//! +--------------------+---------------+-----------------------------+
//! ```
use super::{Magic, HEADER_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Upper bound on a single frame body; anything larger is treated as corruption
pub const MAX_BODY_LEN: usize = 128 * 1024 * 1024;

/// One protocol frame, request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub magic: Magic,
    pub opcode: u8,
    pub data_type: u8,
    /// vbucket id on requests, status code on responses
    pub vbucket_or_status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    pub fn request(opcode: u8, opaque: u32) -> Self {
        Self {
            magic: Magic::Request,
            opcode,
            data_type: 0,
            vbucket_or_status: 0,
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn response(opcode: u8, status: u16, opaque: u32) -> Self {
        Self {
            magic: Magic::Response,
            vbucket_or_status: status,
            ..Self::request(opcode, opaque)
        }
    }

    /// Total encoded length, header included
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }
}

/// Result of a decode attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame and the number of bytes it occupied
    Frame { frame: Frame, consumed: usize },
    /// The buffer holds a prefix of a frame; this many more bytes are needed
    NeedMoreData(usize),
}

/// Codec error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Invalid magic byte: 0x{0:02x}")]
    BadMagic(u8),
    #[error("Body length {total} is shorter than key ({key}) plus extras ({extras})")]
    BodyLength { total: u32, key: u16, extras: u8 },
    #[error("Frame body of {0} bytes exceeds the frame size limit")]
    BodyTooLong(usize),
    #[error("Key of {0} bytes does not fit the header")]
    KeyTooLong(usize),
    #[error("Extras of {0} bytes do not fit the header")]
    ExtrasTooLong(usize),
}

struct Header {
    magic: Magic,
    opcode: u8,
    key_len: u16,
    extras_len: u8,
    data_type: u8,
    vbucket_or_status: u16,
    total_body_len: u32,
    opaque: u32,
    cas: u64,
}

/// Stateless frame encoder/decoder
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame to a fresh buffer
    pub fn encode(frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        Self::encode_into(&mut buf, frame)?;
        Ok(buf.freeze())
    }

    /// Append an encoded frame to an existing buffer
    pub fn encode_into(buf: &mut BytesMut, frame: &Frame) -> Result<(), CodecError> {
        let key_len =
            u16::try_from(frame.key.len()).map_err(|_| CodecError::KeyTooLong(frame.key.len()))?;
        let extras_len = u8::try_from(frame.extras.len())
            .map_err(|_| CodecError::ExtrasTooLong(frame.extras.len()))?;
        let body_len = frame.extras.len() + frame.key.len() + frame.value.len();
        if body_len > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLong(body_len));
        }

        buf.reserve(HEADER_LEN + body_len);
        buf.put_u8(frame.magic.as_u8());
        buf.put_u8(frame.opcode);
        buf.put_u16(key_len);
        buf.put_u8(extras_len);
        buf.put_u8(frame.data_type);
        buf.put_u16(frame.vbucket_or_status);
        buf.put_u32(body_len as u32);
        buf.put_u32(frame.opaque);
        buf.put_u64(frame.cas);
        buf.put_slice(&frame.extras);
        buf.put_slice(&frame.key);
        buf.put_slice(&frame.value);
        Ok(())
    }

    /// Decode one frame from the front of `buf` without consuming it
    pub fn decode(buf: &[u8]) -> Result<Decoded, CodecError> {
        let frame_len = match Self::frame_len(buf)? {
            Ok(len) => len,
            Err(missing) => return Ok(Decoded::NeedMoreData(missing)),
        };
        let header = Self::parse_header(buf)?;
        let body = Bytes::copy_from_slice(&buf[HEADER_LEN..frame_len]);
        Ok(Decoded::Frame {
            frame: Self::assemble(header, body),
            consumed: frame_len,
        })
    }

    /// Decode and consume one frame from a connection read buffer
    ///
    /// Returns `Ok(None)` when the buffer only holds a partial frame; the
    /// buffer is left untouched in that case.
    pub fn decode_buf(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        let frame_len = match Self::frame_len(buf)? {
            Ok(len) => len,
            Err(_) => return Ok(None),
        };
        let header = Self::parse_header(buf)?;
        let mut frame_bytes = buf.split_to(frame_len);
        frame_bytes.advance(HEADER_LEN);
        Ok(Some(Self::assemble(header, frame_bytes.freeze())))
    }

    /// Length of the frame at the front of `buf`, or how many bytes are missing
    fn frame_len(buf: &[u8]) -> Result<Result<usize, usize>, CodecError> {
        if let Some(&first) = buf.first() {
            if Magic::from_u8(first).is_none() {
                return Err(CodecError::BadMagic(first));
            }
        }
        if buf.len() < HEADER_LEN {
            return Ok(Err(HEADER_LEN - buf.len()));
        }

        let header = Self::parse_header(buf)?;
        let frame_len = HEADER_LEN + header.total_body_len as usize;
        if buf.len() < frame_len {
            return Ok(Err(frame_len - buf.len()));
        }
        Ok(Ok(frame_len))
    }

    /// Parse and validate the fixed header; `buf` must hold at least 24 bytes
    fn parse_header(buf: &[u8]) -> Result<Header, CodecError> {
        let mut header = &buf[..HEADER_LEN];
        let magic_byte = header.get_u8();
        let magic = Magic::from_u8(magic_byte).ok_or(CodecError::BadMagic(magic_byte))?;
        let opcode = header.get_u8();
        let key_len = header.get_u16();
        let extras_len = header.get_u8();
        let data_type = header.get_u8();
        let vbucket_or_status = header.get_u16();
        let total_body_len = header.get_u32();
        let opaque = header.get_u32();
        let cas = header.get_u64();

        if (total_body_len as usize) < key_len as usize + extras_len as usize {
            return Err(CodecError::BodyLength {
                total: total_body_len,
                key: key_len,
                extras: extras_len,
            });
        }
        if total_body_len as usize > MAX_BODY_LEN {
            return Err(CodecError::BodyTooLong(total_body_len as usize));
        }

        Ok(Header {
            magic,
            opcode,
            key_len,
            extras_len,
            data_type,
            vbucket_or_status,
            total_body_len,
            opaque,
            cas,
        })
    }

    fn assemble(header: Header, mut body: Bytes) -> Frame {
        let extras = body.split_to(header.extras_len as usize);
        let key = body.split_to(header.key_len as usize);
        Frame {
            magic: header.magic,
            opcode: header.opcode,
            data_type: header.data_type,
            vbucket_or_status: header.vbucket_or_status,
            opaque: header.opaque,
            cas: header.cas,
            extras,
            key,
            value: body,
        }
    }
}
