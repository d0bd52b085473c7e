//! Length-prefixed frame codec
//!
//! Every message is `[u32 big-endian length][payload]`. The payload is a JSON
//! document, deflate-compressed as a whole when both sides agree on it out of
//! band (the frame itself does not say whether it is compressed).

use crate::error::{Result, TesseraError};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix
pub const HEADER_LEN: usize = 4;

/// Default maximum frame payload (16 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Settings both ends of a connection must agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSettings {
    /// Largest accepted payload in either direction
    pub max_message_size: usize,
    /// Whole-message deflate compression
    pub compression: bool,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            compression: false,
        }
    }
}

/// Encodes documents into frames and reads frames off a stream
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    settings: ProtocolSettings,
}

impl FrameCodec {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> ProtocolSettings {
        self.settings
    }

    pub fn max_message_size(&self) -> usize {
        self.settings.max_message_size
    }

    /// Serialize (and compress) a document into a frame payload.
    ///
    /// The payload is returned even when it exceeds the maximum so the caller
    /// can decide how to degrade; use [`FrameCodec::check_size`] before writing.
    pub fn encode<T: Serialize>(&self, document: &T) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(document)?;
        if !self.settings.compression {
            return Ok(json);
        }
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(json.len() / 2), Compression::fast());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    /// Decode a frame payload into a document
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        if !self.settings.compression {
            return Ok(serde_json::from_slice(payload)?);
        }
        // Bound the inflated size so a small frame cannot expand without limit
        let limit = self.settings.max_message_size as u64 * 8;
        let mut json = Vec::new();
        DeflateDecoder::new(payload)
            .take(limit + 1)
            .read_to_end(&mut json)
            .map_err(|e| TesseraError::Serialization(format!("invalid compressed payload: {}", e)))?;
        if json.len() as u64 > limit {
            return Err(TesseraError::MessageTooLarge {
                size: json.len(),
                max: limit as usize,
            });
        }
        Ok(serde_json::from_slice(&json)?)
    }

    /// Reject empty or oversized payloads
    pub fn check_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(TesseraError::Serialization("zero-length frame".into()));
        }
        if size > self.settings.max_message_size {
            return Err(TesseraError::MessageTooLarge {
                size,
                max: self.settings.max_message_size,
            });
        }
        Ok(())
    }

    /// Read exactly one frame. The length is validated before the payload is
    /// read, so an oversized frame never allocates its declared size.
    pub async fn read_frame<R>(&self, reader: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header) as usize;
        self.check_size(len)?;

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Write one frame and flush
    pub async fn write_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.check_size(payload.len())?;
        let len = u32::try_from(payload.len()).map_err(|_| TesseraError::MessageTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        })?;
        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(ProtocolSettings::default())
    }
}
