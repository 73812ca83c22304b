use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{DuorpcError, Result};

/// Maximum frame size (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Reads length-prefixed frames from the receiving half of a transport.
///
/// The reader starts in plaintext mode; [`FrameReader::set_compressed`] is
/// called once, after a successful handshake that negotiated compression,
/// and from then on every payload is gunzipped before being returned.
pub struct FrameReader {
    io: Box<dyn AsyncRead + Send + Unpin>,
    compressed: bool,
}

impl FrameReader {
    pub fn new(io: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            io,
            compressed: false,
        }
    }

    /// Switches the reader to gunzip every subsequent payload.
    pub fn set_compressed(&mut self) {
        self.compressed = true;
    }

    /// Reads exactly one frame and returns its decoded payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DuorpcError::Disconnected`] on a clean EOF at a frame
    /// boundary, [`DuorpcError::InvalidMessage`] for oversized frames or
    /// corrupt gzip data, and a connection error otherwise.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.io
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| map_io_error(e, "reading length prefix"))?;

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(DuorpcError::InvalidMessage(format!(
                "frame too large: {} bytes (max {} bytes)",
                len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = vec![0u8; len];
        self.io
            .read_exact(&mut buf)
            .await
            .map_err(|e| map_io_error(e, "reading frame payload"))?;

        if self.compressed {
            let mut decoded = Vec::with_capacity(buf.len() * 2);
            GzDecoder::new(&buf[..])
                .read_to_end(&mut decoded)
                .map_err(|e| DuorpcError::InvalidMessage(format!("gzip decode failed: {}", e)))?;
            Ok(decoded)
        } else {
            Ok(buf)
        }
    }
}

/// Writes length-prefixed frames to the sending half of a transport.
///
/// Mirrors [`FrameReader`]: plaintext until [`FrameWriter::set_compressed`]
/// is called after the handshake, gzip for every frame afterwards. Each
/// write flushes so the frame is immediately visible to the peer.
pub struct FrameWriter {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    compressed: bool,
}

impl FrameWriter {
    pub fn new(io: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        Self {
            io,
            compressed: false,
        }
    }

    /// Switches the writer to gzip every subsequent payload.
    pub fn set_compressed(&mut self) {
        self.compressed = true;
    }

    /// Writes one frame and flushes the transport.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        if self.compressed {
            let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2 + 16), Compression::default());
            encoder.write_all(payload)?;
            let body = encoder.finish()?;
            self.write_raw(&body).await
        } else {
            self.write_raw(payload).await
        }
    }

    async fn write_raw(&mut self, body: &[u8]) -> Result<()> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(DuorpcError::InvalidMessage(format!(
                "frame too large: {} bytes (max {} bytes)",
                body.len(),
                MAX_FRAME_SIZE
            )));
        }

        let len = body.len() as u32;
        self.io
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| map_io_error(e, "writing length prefix"))?;
        self.io
            .write_all(body)
            .await
            .map_err(|e| map_io_error(e, "writing frame payload"))?;
        self.io
            .flush()
            .await
            .map_err(|e| map_io_error(e, "flushing transport"))?;

        Ok(())
    }

    /// Shuts down the sending half of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.io
            .shutdown()
            .await
            .map_err(|e| map_io_error(e, "shutting down transport"))?;
        Ok(())
    }
}

/// Map IO errors to domain errors.
///
/// A clean EOF means the peer went away; connection resets and aborts are
/// reported as connection errors with context, everything else passes
/// through as an IO error.
fn map_io_error(err: std::io::Error, context: &str) -> DuorpcError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof => DuorpcError::Disconnected,
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe => {
            DuorpcError::Connection(format!("{}: connection lost", context))
        }
        _ => DuorpcError::Io(err),
    }
}
