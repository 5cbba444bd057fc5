//! RPC server: connection acceptance, codec negotiation, and concurrent
//! per-request dispatch with serialized response writes.
//!
//! Each accepted connection gets its own task. Within a connection, the serve
//! loop reads request frames and spawns one task per request; all responses
//! funnel through a shared write lock so frames from racing handlers never
//! interleave. Replies may leave in any order; callers correlate by sequence
//! number.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = ServiceRegistry::new();
//! registry.register("Foo.Sum", |args: String| async move { Ok(args) });
//!
//! let listener = TcpListener::bind("127.0.0.1:9733").await?;
//! Server::new(registry).serve(listener).await;
//! ```

use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::codec::{CodecKind, CodecReader, CodecWriter};
use crate::error::RpcError;
use crate::service::ServiceRegistry;
use crate::wire::{Handshake, Header};

/// Transient record for one in-flight request; lives only until its
/// response is written.
struct Request {
    header: Header,
    args: Bytes,
}

/// RPC server over a registry of typed method handlers.
///
/// Constructed explicitly by the caller; there is no process-wide default
/// instance.
#[derive(Clone)]
pub struct Server {
    services: Arc<ServiceRegistry>,
}

impl Server {
    pub fn new(services: ServiceRegistry) -> Self {
        Self {
            services: Arc::new(services),
        }
    }

    /// Accept loop: every connection is served on its own task.
    ///
    /// Returns when the listener fails; connections already being served keep
    /// running.
    pub async fn serve(&self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "accept error");
                    return;
                }
            };
            tracing::debug!(%peer, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                server.serve_connection(stream).await;
            });
        }
    }

    /// Serve one connection: negotiate the codec, then dispatch requests
    /// until the stream ends.
    ///
    /// A rejected handshake aborts the connection before any frame is
    /// written.
    pub async fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut buffered = BufReader::new(read_half);

        let handshake = match Handshake::read_from(&mut buffered).await {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(error = %e, "handshake rejected");
                return;
            }
        };

        let kind = handshake.codec;
        let reader = CodecReader::from_buffered(kind, buffered);
        let writer = CodecWriter::new(kind, write_half);
        self.serve_codec(reader, writer).await;
    }

    /// Per-connection serve loop.
    ///
    /// The reader belongs to this loop; the writer is shared with handler
    /// tasks behind the per-connection write lock. The codec is closed only
    /// after every spawned handler has finished.
    async fn serve_codec<R, W>(&self, mut reader: CodecReader<R>, writer: CodecWriter<W>)
    where
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let kind = reader.kind();
        let writer = Arc::new(Mutex::new(writer));
        let mut handlers: JoinSet<()> = JoinSet::new();

        loop {
            // Reap handlers that already finished so the set does not grow
            // with the lifetime of the connection.
            while handlers.try_join_next().is_some() {}

            let header = match reader.read_header().await {
                Ok(h) => h,
                Err(e) => {
                    if !is_clean_eof(&e) {
                        tracing::error!(error = %e, "request header read failed");
                    }
                    break;
                }
            };

            // The body must come off the wire even if we cannot use it;
            // losing it would desynchronize every later frame.
            let args = match reader.read_body_raw().await {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(error = %e, seq = header.seq, "request body read failed");
                    break;
                }
            };

            // Unknown methods are answered inline; there is nothing to run.
            if !self.services.contains(&header.service_method) {
                let mut reply = header;
                reply.error = RpcError::MethodNotFound(reply.service_method.clone()).to_string();
                send_response(&writer, &reply, &[]).await;
                continue;
            }

            let request = Request { header, args };
            let services = self.services.clone();
            let writer = writer.clone();
            handlers.spawn(async move {
                handle_request(services, writer, kind, request).await;
            });
        }

        // Drain in-flight handlers before the codec closes under them.
        while handlers.join_next().await.is_some() {}

        let mut writer = writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(error = %e, "codec shutdown failed");
        }
    }
}

/// Resolve and run one request, then write the response.
///
/// Argument decode failures and handler errors come back through the header's
/// error string; neither touches connection liveness.
async fn handle_request<W>(
    services: Arc<ServiceRegistry>,
    writer: Arc<Mutex<CodecWriter<W>>>,
    kind: CodecKind,
    request: Request,
) where
    W: AsyncWrite + Send + Unpin,
{
    let Request { header, args } = request;
    let mut reply = header;
    match services.dispatch(&reply.service_method, kind, args).await {
        Ok(body) => {
            send_response(&writer, &reply, &body).await;
        }
        Err(e) => {
            tracing::debug!(error = %e, seq = reply.seq, method = %reply.service_method, "handler failed");
            reply.error = e.to_string();
            send_response(&writer, &reply, &[]).await;
        }
    }
}

/// The single shared write path: one lock acquisition around exactly one
/// codec write, so response frames from concurrent handlers never interleave.
async fn send_response<W>(writer: &Arc<Mutex<CodecWriter<W>>>, header: &Header, body: &[u8])
where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = writer.lock().await;
    if let Err(e) = writer.write_raw(header, body).await {
        tracing::error!(error = %e, seq = header.seq, "response write failed");
    }
}

/// Whether a header-read failure is the peer simply hanging up between
/// frames, which is not worth logging. The codec reports an EOF inside a
/// frame as [`RpcError::Frame`], so truncation never lands here.
fn is_clean_eof(err: &RpcError) -> bool {
    matches!(
        err,
        RpcError::Io(e) if matches!(
            e.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
        )
    )
}
