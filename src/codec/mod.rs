//! Wire codecs: negotiated value encoding plus length-delimited framing.
//!
//! A connection carries a stream of header+body pairs. Each value is framed
//! as a `u32` big-endian length followed by the encoded bytes; the encoding
//! itself is selected once per connection by [`CodecKind`] during the
//! handshake.
//!
//! A codec is split into a read half and a write half so one task can sit in
//! a blocking read loop while other tasks write. Neither half is safe for
//! concurrent use on its own; callers serialize writes with an external lock.
//!
//! # Example
//!
//! ```ignore
//! let (mut reader, mut writer) = CodecKind::MessagePack.split(stream);
//! writer.write(&Header::request("Foo.Sum", 0), "req:0").await?;
//! let header = reader.read_header().await?;
//! let reply: String = reader.read_body().await?;
//! ```

mod json;
mod msgpack;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

use crate::error::{Result, RpcError};
use crate::wire::Header;

/// Maximum encoded length for a single header or body value (16 MiB).
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The closed set of negotiable wire encodings.
///
/// An unknown tag at negotiation time is a hard failure; there is no dynamic
/// codec registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// MessagePack via `rmp-serde` (struct-as-map encoding). The default.
    MessagePack,
    /// JSON via `serde_json`.
    Json,
}

impl CodecKind {
    /// Resolve a negotiation tag to a codec kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "application/msgpack" => Some(Self::MessagePack),
            "application/json" => Some(Self::Json),
            _ => None,
        }
    }

    /// The tag carried inside the handshake record.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::MessagePack => "application/msgpack",
            Self::Json => "application/json",
        }
    }

    /// Encode one value with this kind's encoding.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::MessagePack => msgpack::encode(value),
            Self::Json => json::encode(value),
        }
    }

    /// Decode one value with this kind's encoding.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::MessagePack => msgpack::decode(bytes),
            Self::Json => json::decode(bytes),
        }
    }

    /// Split a freshly negotiated stream into framed read/write halves.
    #[allow(clippy::type_complexity)]
    pub fn split<S>(self, stream: S) -> (CodecReader<ReadHalf<S>>, CodecWriter<WriteHalf<S>>)
    where
        S: AsyncRead + AsyncWrite,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        (
            CodecReader::new(self, read_half),
            CodecWriter::new(self, write_half),
        )
    }
}

impl Default for CodecKind {
    fn default() -> Self {
        Self::MessagePack
    }
}

/// Read half of a codec. Consumes exactly one frame value per call; callers
/// must alternate header-then-body.
pub struct CodecReader<R> {
    kind: CodecKind,
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(kind: CodecKind, reader: R) -> Self {
        Self {
            kind,
            reader: BufReader::new(reader),
        }
    }

    /// Wrap a reader that already buffered bytes past the handshake; the
    /// server hands over its handshake buffer here so no frame bytes are
    /// lost.
    pub fn from_buffered(kind: CodecKind, reader: BufReader<R>) -> Self {
        Self { kind, reader }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    async fn read_value(&mut self) -> Result<Bytes> {
        // The length prefix is read in two steps so that a peer hanging up
        // exactly between frames surfaces as a plain EOF, while running dry
        // anywhere inside a frame is reported as truncation.
        let mut prefix = [0u8; 4];
        let n = self.reader.read(&mut prefix).await?;
        if n == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed at frame boundary",
            )));
        }
        self.reader
            .read_exact(&mut prefix[n..])
            .await
            .map_err(truncated)?;
        let len = u32::from_be_bytes(prefix);
        if len > MAX_FRAME_LEN {
            return Err(RpcError::Frame(format!(
                "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf).await.map_err(truncated)?;
        Ok(Bytes::from(buf))
    }

    /// Read the header half of the next frame.
    pub async fn read_header(&mut self) -> Result<Header> {
        let raw = self.read_value().await?;
        self.kind.decode(&raw)
    }

    /// Read the body half as raw encoded bytes, deferring the decode.
    pub async fn read_body_raw(&mut self) -> Result<Bytes> {
        self.read_value().await
    }

    /// Read and decode the body half.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let raw = self.read_value().await?;
        self.kind.decode(&raw)
    }

    /// Consume and discard the body half, keeping the stream aligned.
    pub async fn drain_body(&mut self) -> Result<()> {
        self.read_value().await.map(|_| ())
    }
}

/// Write half of a codec. A header and its body are written back-to-back and
/// flushed before `write` returns.
pub struct CodecWriter<W> {
    kind: CodecKind,
    writer: BufWriter<W>,
    poisoned: bool,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(kind: CodecKind, writer: W) -> Self {
        Self {
            kind,
            writer: BufWriter::new(writer),
            poisoned: false,
        }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// Write one header+body pair and flush.
    pub async fn write<T: Serialize + ?Sized>(&mut self, header: &Header, body: &T) -> Result<()> {
        let body = self.kind.encode(body)?;
        self.write_raw(header, &body).await
    }

    /// Like [`write`](Self::write), with a pre-encoded body.
    ///
    /// A failed write poisons the writer: a partially written frame
    /// desynchronizes the stream, so every later write fails fast.
    pub async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if self.poisoned {
            return Err(RpcError::Frame(
                "codec writer poisoned by an earlier write failure".into(),
            ));
        }
        let head = self.kind.encode(header)?;
        if let Err(e) = self.write_frame_pair(&head, body).await {
            self.poisoned = true;
            return Err(e);
        }
        Ok(())
    }

    async fn write_frame_pair(&mut self, head: &[u8], body: &[u8]) -> Result<()> {
        write_value(&mut self.writer, head).await?;
        write_value(&mut self.writer, body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Flush buffered bytes and shut the underlying stream down.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn truncated(err: std::io::Error) -> RpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::Frame("stream truncated mid-frame".into())
    } else {
        RpcError::Io(err)
    }
}

async fn write_value<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    if bytes.len() > MAX_FRAME_LEN as usize {
        return Err(RpcError::Frame(format!(
            "encoded value of {} bytes exceeds maximum {MAX_FRAME_LEN}",
            bytes.len()
        )));
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    Ok(())
}
