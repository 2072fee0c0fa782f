//! Chunk framing for the gwatch transport.
//!
//! Every chunk on the wire has the format:
//!
//! ```text
//! flags: u8      (FrameKind)
//! len:   leb128  (number of data bytes that follow)
//! data bytes
//! ```
//!
//! A logical message is written as one `FirstOnly` chunk, or as a
//! `FirstMore` chunk followed by zero or more `Middle` chunks and a final
//! `Last` chunk. The first chunk a client writes on a fresh connection is a
//! `Handshake` chunk carrying the connection URI (`/capsule/main` etc).

use crate::CodecError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default payload bytes per chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Upper bound on a reassembled message.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

const FLAG_FIRST: u8 = 0x01;
const FLAG_FINAL: u8 = 0x02;
const FLAG_HANDSHAKE: u8 = 0x10;

/// Position of a chunk within its logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Connection URI, sent once by the connecting side.
    Handshake,
    /// Standalone chunk: the whole message.
    FirstOnly,
    /// Start of a message with continuation chunks to follow.
    FirstMore,
    /// Continuation with more to follow.
    Middle,
    /// Final continuation.
    Last,
}

impl FrameKind {
    /// Classify a chunk from its byte offset and size within a message of
    /// `total` bytes.
    #[must_use]
    pub fn for_chunk(offset: usize, size: usize, total: usize) -> Self {
        let first = offset == 0;
        let last = offset + size >= total;
        match (first, last) {
            (true, true) => Self::FirstOnly,
            (true, false) => Self::FirstMore,
            (false, false) => Self::Middle,
            (false, true) => Self::Last,
        }
    }

    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Handshake => FLAG_HANDSHAKE | FLAG_FIRST | FLAG_FINAL,
            Self::FirstOnly => FLAG_FIRST | FLAG_FINAL,
            Self::FirstMore => FLAG_FIRST,
            Self::Middle => 0,
            Self::Last => FLAG_FINAL,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, CodecError> {
        const HANDSHAKE: u8 = FLAG_HANDSHAKE | FLAG_FIRST | FLAG_FINAL;
        const FIRST_ONLY: u8 = FLAG_FIRST | FLAG_FINAL;
        match byte {
            HANDSHAKE => Ok(Self::Handshake),
            FIRST_ONLY => Ok(Self::FirstOnly),
            FLAG_FIRST => Ok(Self::FirstMore),
            0 => Ok(Self::Middle),
            FLAG_FINAL => Ok(Self::Last),
            other => Err(CodecError::BadFlags(other)),
        }
    }

    /// True when this chunk starts a new message.
    #[must_use]
    pub fn is_first(self) -> bool {
        matches!(self, Self::FirstOnly | Self::FirstMore)
    }

    /// True when this chunk completes a message.
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, Self::FirstOnly | Self::Last)
    }
}

/// One chunk as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(kind: FrameKind, data: Vec<u8>) -> Self {
        Self { kind, data }
    }

    #[must_use]
    pub fn handshake(uri: &str) -> Self {
        Self::new(FrameKind::Handshake, uri.as_bytes().to_vec())
    }
}

/// Returns the encoded length of the leb128 representation of value
fn encoded_length(value: u64) -> usize {
    let mut len = 1;
    let mut value = value >> 7;
    while value != 0 {
        len += 1;
        value >>= 7;
    }
    len
}

/// Encode a single chunk into a contiguous buffer so the header and data
/// go out in one write.
pub fn encode_frame(kind: FrameKind, data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = data.len() as u64;
    let mut buffer = Vec::with_capacity(1 + encoded_length(len) + data.len());
    buffer.push(kind.to_byte());
    leb128::write::unsigned(&mut buffer, len)?;
    buffer.extend_from_slice(data);
    metrics::histogram!("frame.encode.size").record(buffer.len() as f64);
    Ok(buffer)
}

fn read_len<R: std::io::Read>(mut r: R) -> Result<u64, CodecError> {
    leb128::read::unsigned(&mut r).map_err(|err| match err {
        leb128::read::Error::IoError(ioerr) => CodecError::Io(ioerr),
        leb128::read::Error::Overflow => CodecError::Leb128("leb128 is too large".to_string()),
    })
}

/// Decode a single chunk from a blocking reader.
pub fn decode_frame<R: std::io::Read>(mut r: R, max_chunk: usize) -> Result<Frame, CodecError> {
    let mut flags = [0u8];
    r.read_exact(&mut flags)?;
    let kind = FrameKind::from_byte(flags[0])?;
    let len = read_len(r.by_ref())? as usize;
    if len > max_chunk {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_chunk,
        });
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data)?;
    Ok(Frame { kind, data })
}

/// Attempt to decode a chunk from the front of `buffer`. Consumed bytes are
/// drained. Returns `Ok(None)` when the buffer does not yet hold a complete
/// chunk.
pub fn stream_decode(buffer: &mut Vec<u8>, max_chunk: usize) -> Result<Option<Frame>, CodecError> {
    let mut cursor = std::io::Cursor::new(buffer.as_slice());
    match decode_frame(&mut cursor, max_chunk) {
        Ok(frame) => {
            let consumed = cursor.position() as usize;
            buffer.drain(..consumed);
            Ok(Some(frame))
        }
        Err(CodecError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err),
    }
}

/// Read a single leb128 encoded value from the stream
async fn read_u64_async<R>(r: &mut R) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![];
    loop {
        let byte = r.read_u8().await?;
        buf.push(byte);

        match leb128::read::unsigned(&mut buf.as_slice()) {
            Ok(n) => return Ok(n),
            Err(leb128::read::Error::IoError(_)) => continue,
            Err(leb128::read::Error::Overflow) => {
                return Err(CodecError::Leb128("leb128 is too large".to_string()));
            }
        }
    }
}

/// Read one chunk from an async stream.
pub async fn read_frame<R>(r: &mut R, max_chunk: usize) -> Result<Frame, CodecError>
where
    R: AsyncRead + Unpin,
{
    let kind = FrameKind::from_byte(r.read_u8().await?)?;
    let len = read_u64_async(r).await? as usize;
    if len > max_chunk {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_chunk,
        });
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    Ok(Frame { kind, data })
}

/// Write one chunk to an async stream.
pub async fn write_frame<W>(w: &mut W, kind: FrameKind, data: &[u8]) -> Result<usize, CodecError>
where
    W: AsyncWrite + Unpin,
{
    let buffer = encode_frame(kind, data)?;
    w.write_all(&buffer).await?;
    Ok(buffer.len())
}

/// Split a message into chunk descriptors `(kind, range)` in send order.
#[must_use]
pub fn split_chunks(total: usize, chunk_size: usize) -> Vec<(FrameKind, std::ops::Range<usize>)> {
    let chunk_size = chunk_size.max(1);
    if total == 0 {
        return vec![(FrameKind::FirstOnly, 0..0)];
    }
    let mut chunks = Vec::with_capacity(total.div_ceil(chunk_size));
    let mut offset = 0;
    while offset < total {
        let size = chunk_size.min(total - offset);
        chunks.push((FrameKind::for_chunk(offset, size, total), offset..offset + size));
        offset += size;
    }
    chunks
}
