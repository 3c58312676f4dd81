//! Frame reading and writing
//!
//! Every frame after startup has a 5-byte header:
//! - 1 byte: message tag
//! - 4 bytes: length (big-endian, counts itself but not the tag)
//!
//! The startup frame carries no tag, only the 4-byte length.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{ProtocolError, ProtocolResult};

/// Tag byte plus length word
pub const HEADER_LEN: usize = 5;

/// Size of the length word
pub const LENGTH_LEN: usize = 4;

/// Maximum accepted frame length (256 MB)
/// Keeps a misbehaving client from making the bridge allocate without bound.
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// One tagged protocol frame, kept as the exact bytes read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    /// Wrap raw frame bytes, validating the header against the buffer length
    pub fn from_raw(bytes: Vec<u8>) -> ProtocolResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFrame(format!(
                "frame of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let declared = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        if declared < LENGTH_LEN || declared + 1 != bytes.len() {
            return Err(ProtocolError::InvalidFrame(format!(
                "declared length {} does not match frame of {} bytes",
                declared,
                bytes.len()
            )));
        }
        Ok(Frame { bytes })
    }

    /// Build a frame from a tag and body
    pub fn new(tag: u8, body: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.push(tag);
        bytes.extend_from_slice(&((body.len() + LENGTH_LEN) as u32).to_be_bytes());
        bytes.extend_from_slice(body);
        Frame { bytes }
    }

    /// Leading message tag
    pub fn tag(&self) -> u8 {
        self.bytes[0]
    }

    /// Payload after the header
    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// The full frame as read off the wire
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Reads protocol frames from an async stream
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a new frame reader
    pub fn new(reader: R) -> Self {
        FrameReader {
            reader,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Override the maximum accepted frame length
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Read the untagged startup frame, returning the bytes after the length word
    pub async fn read_startup(&mut self) -> ProtocolResult<Vec<u8>> {
        let mut header = [0u8; LENGTH_LEN];
        self.read_header(&mut header).await?;

        let length = u32::from_be_bytes(header) as usize;
        let body_len = self.body_len(length)?;

        let mut body = vec![0u8; body_len];
        if body_len > 0 {
            self.reader.read_exact(&mut body).await?;
        }
        Ok(body)
    }

    /// Read one complete tagged frame
    pub async fn read_frame(&mut self) -> ProtocolResult<Frame> {
        let mut header = [0u8; HEADER_LEN];
        self.read_header(&mut header).await?;

        let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let body_len = self.body_len(length)?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + body_len);
        bytes.extend_from_slice(&header);
        bytes.resize(HEADER_LEN + body_len, 0);
        if body_len > 0 {
            self.reader.read_exact(&mut bytes[HEADER_LEN..]).await?;
        }

        Ok(Frame { bytes })
    }

    async fn read_header(&mut self, header: &mut [u8]) -> ProtocolResult<()> {
        match self.reader.read_exact(header).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(ProtocolError::ConnectionClosed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn body_len(&self, length: usize) -> ProtocolResult<usize> {
        if length < LENGTH_LEN {
            return Err(ProtocolError::InvalidFrame(format!(
                "length {} is smaller than the length word",
                length
            )));
        }
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        Ok(length - LENGTH_LEN)
    }
}

/// Writes raw backend bytes to an async stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a new frame writer
    pub fn new(writer: W) -> Self {
        FrameWriter { writer }
    }

    /// Write already-encoded backend messages verbatim
    pub async fn write_raw(&mut self, bytes: &[u8]) -> ProtocolResult<()> {
        if !bytes.is_empty() {
            self.writer.write_all(bytes).await?;
        }
        Ok(())
    }

    /// Flush the underlying writer
    pub async fn flush(&mut self) -> ProtocolResult<()> {
        self.writer.flush().await?;
        Ok(())
    }
}
