//! Wire-level records: the per-frame header and the connection handshake.
//!
//! The handshake is one line of JSON sent before any codec exists, so both
//! ends can parse it without agreeing on anything else. Everything after it
//! is header+body pairs encoded by the negotiated codec.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecKind;
use crate::error::{Result, RpcError};

/// Protocol family constant; must match exactly or the connection is dead.
pub const MAGIC: u32 = 0x3bef5c;

/// Upper bound on the handshake line, in bytes.
const MAX_HANDSHAKE_LEN: u64 = 1024;

/// Per-message metadata, written/read immediately before its body.
///
/// A non-empty `error` on a response means the body is a placeholder and the
/// caller should take the error instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Method identifier in `"Service.Method"` shape.
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,
    /// Sequence number, unique and monotonically increasing per connection.
    #[serde(rename = "Seq")]
    pub seq: u64,
    /// Error string; empty means success.
    #[serde(rename = "Error")]
    pub error: String,
}

impl Header {
    /// Build a request header (empty error field).
    pub fn request(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    /// True when this header carries an error.
    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// The negotiation record, sent exactly once as the first bytes on a
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub magic: u32,
    pub codec: CodecKind,
}

/// On-the-wire shape of the handshake. The codec rides as its string tag so
/// the record stays self-describing.
#[derive(Serialize, Deserialize)]
struct HandshakeWire {
    #[serde(rename = "MagicNumber")]
    magic_number: u32,
    #[serde(rename = "CodecType")]
    codec_type: String,
}

impl Handshake {
    /// Handshake for the given codec with the protocol magic filled in.
    pub fn new(codec: CodecKind) -> Self {
        Self {
            magic: MAGIC,
            codec,
        }
    }

    /// Write the record as one newline-terminated JSON line and flush.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        let mut line = serde_json::to_vec(&HandshakeWire {
            magic_number: self.magic,
            codec_type: self.codec.as_tag().to_string(),
        })?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read and validate one handshake line.
    ///
    /// The read is bounded and consumes exactly up to the terminating
    /// newline, so the bytes of the first frame stay in `reader`'s buffer.
    pub async fn read_from<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut line = Vec::new();
        let n = reader
            .take(MAX_HANDSHAKE_LEN)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(RpcError::Negotiation(
                "connection closed before handshake".into(),
            ));
        }
        if line.last() != Some(&b'\n') {
            return Err(RpcError::Negotiation(
                "handshake line truncated or too long".into(),
            ));
        }
        line.pop();
        let wire: HandshakeWire = serde_json::from_slice(&line)
            .map_err(|e| RpcError::Negotiation(format!("malformed handshake: {e}")))?;
        if wire.magic_number != MAGIC {
            return Err(RpcError::Negotiation(format!(
                "invalid magic number {:#x}",
                wire.magic_number
            )));
        }
        let codec = CodecKind::from_tag(&wire.codec_type)
            .ok_or_else(|| RpcError::Negotiation(format!("unknown codec tag {:?}", wire.codec_type)))?;
        Ok(Self {
            magic: wire.magic_number,
            codec,
        })
    }
}
