//! RPC client: pending-call registry and asynchronous reply correlation.
//!
//! One background task per client reads header+body pairs off the connection
//! and completes the matching pending call; issuing tasks await each call's
//! one-shot completion slot. When the connection fails, the fatal error fans
//! out to every outstanding call exactly once and the client refuses new
//! registrations.
//!
//! # Example
//!
//! ```ignore
//! let client = Client::connect("127.0.0.1:9733").await?;
//! let reply: String = client.call("Foo.Sum", "req:0").await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;

use crate::codec::{CodecKind, CodecReader, CodecWriter};
use crate::error::{Result, RpcError};
use crate::wire::{Handshake, Header};

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;
type CallResult = Result<Bytes>;

/// One in-flight request. Await [`Call::wait`] for the reply.
#[derive(Debug)]
pub struct Call {
    seq: u64,
    service_method: String,
    kind: CodecKind,
    done: oneshot::Receiver<CallResult>,
}

impl Call {
    /// Sequence number assigned at registration.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The `"Service.Method"` name this call was issued against.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Wait for completion and decode the reply.
    ///
    /// Completion fires exactly once, from the receive loop: a reply body, an
    /// error carried in the response header, or the connection's fatal error.
    /// A reply that fails to decode surfaces as this call's error.
    pub async fn wait<T: DeserializeOwned>(self) -> Result<T> {
        let Call { kind, done, .. } = self;
        match done.await {
            Ok(Ok(body)) => kind.decode(&body),
            Ok(Err(e)) => Err(e),
            // Sender dropped without completing; only reachable if the
            // receive loop itself was torn down.
            Err(_) => Err(RpcError::Shutdown),
        }
    }
}

struct ClientState {
    /// Next sequence number; minted only inside `register_call`.
    seq: u64,
    /// Calls awaiting a reply, keyed by sequence number.
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
    /// User asked to close.
    closing: bool,
    /// Receive loop hit a fatal error.
    shutdown: bool,
}

struct ClientInner {
    kind: CodecKind,
    /// Send-ordering lock. The shutdown fan-out takes this first so it can
    /// never race an in-flight outbound write.
    writer: tokio::sync::Mutex<CodecWriter<BoxedWrite>>,
    /// State lock: sequence counter, pending registry, lifecycle flags.
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn register_call(&self, tx: oneshot::Sender<CallResult>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.closing || state.shutdown {
            return Err(RpcError::Shutdown);
        }
        let seq = state.seq;
        state.pending.insert(seq, tx);
        state.seq += 1;
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallResult>> {
        self.state.lock().pending.remove(&seq)
    }

    /// Mark the client shut down and complete every pending call with the
    /// fatal error. Runs once, when the receive loop exits.
    async fn terminate_calls(&self, err: RpcError) {
        let _sending = self.writer.lock().await;
        let mut state = self.state.lock();
        state.shutdown = true;
        let msg = err.to_string();
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(RpcError::Disconnected(msg.clone())));
        }
    }
}

/// Handle to one RPC connection.
///
/// Cheap to clone; all clones share the pending registry and the connection.
/// Calls may be issued concurrently from any number of tasks.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect over TCP with the default codec.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, CodecKind::default()).await
    }

    /// Connect over TCP with an explicit codec kind.
    pub async fn connect_with<A: ToSocketAddrs>(addr: A, kind: CodecKind) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, kind).await
    }

    /// Negotiate the codec on an established stream and start the receive
    /// loop. The handshake record is the first bytes on the wire.
    pub async fn handshake<S>(mut stream: S, kind: CodecKind) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Handshake::new(kind).write_to(&mut stream).await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = CodecReader::new(kind, Box::new(read_half) as BoxedRead);
        let writer = CodecWriter::new(kind, Box::new(write_half) as BoxedWrite);

        let inner = Arc::new(ClientInner {
            kind,
            writer: tokio::sync::Mutex::new(writer),
            state: Mutex::new(ClientState {
                seq: 0,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });

        tokio::spawn(Self::receive_loop(inner.clone(), reader));

        Ok(Self { inner })
    }

    /// True iff the client is neither closing nor shut down.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock();
        !state.closing && !state.shutdown
    }

    /// Register and send one request, returning the in-flight [`Call`].
    ///
    /// Registration assigns the sequence number; the header+body pair is then
    /// written under the send lock so concurrent senders never interleave.
    pub async fn send_call<A>(&self, service_method: &str, args: &A) -> Result<Call>
    where
        A: Serialize + ?Sized,
    {
        let (tx, rx) = oneshot::channel();
        let seq = self.inner.register_call(tx)?;
        let header = Header::request(service_method, seq);

        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.write(&header, args).await {
            drop(writer);
            // Never made it onto the wire; forget the registration so the
            // receive loop cannot complete it later.
            self.inner.remove_call(seq);
            return Err(e);
        }

        Ok(Call {
            seq,
            service_method: service_method.to_string(),
            kind: self.inner.kind,
            done: rx,
        })
    }

    /// Issue a call and wait for its reply.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.send_call(service_method, args).await?.wait().await
    }

    /// Issue a call with a deadline.
    ///
    /// On expiry the pending entry is removed, so a reply that arrives later
    /// is drained as a stray frame; the connection itself stays usable.
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        deadline: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = self.send_call(service_method, args).await?;
        let seq = call.seq();
        match tokio::time::timeout(deadline, call.wait()).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.remove_call(seq);
                Err(RpcError::Timeout)
            }
        }
    }

    /// Close the connection. Fails with [`RpcError::Shutdown`] if already
    /// closing. Pending calls complete when the receive loop observes the
    /// closed stream.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await
    }

    async fn receive_loop(inner: Arc<ClientInner>, mut reader: CodecReader<BoxedRead>) {
        let err = Self::receive(&inner, &mut reader).await;
        tracing::debug!(error = %err, "receive loop ended");
        inner.terminate_calls(err).await;
    }

    /// Read replies until the stream fails; returns the fatal error.
    async fn receive(inner: &ClientInner, reader: &mut CodecReader<BoxedRead>) -> RpcError {
        loop {
            let header = match reader.read_header().await {
                Ok(h) => h,
                Err(e) => return e,
            };

            match inner.remove_call(header.seq) {
                // Stray or duplicate reply. Drain the body so framing stays
                // aligned, then carry on.
                None => {
                    tracing::debug!(seq = header.seq, "reply for unknown call");
                    if let Err(e) = reader.drain_body().await {
                        return e;
                    }
                }
                Some(tx) if header.is_error() => {
                    let drained = reader.drain_body().await;
                    let _ = tx.send(Err(RpcError::Application(header.error)));
                    if let Err(e) = drained {
                        return e;
                    }
                }
                Some(tx) => match reader.read_body_raw().await {
                    Ok(body) => {
                        let _ = tx.send(Ok(body));
                    }
                    Err(e) => {
                        let _ = tx.send(Err(RpcError::Disconnected(e.to_string())));
                        return e;
                    }
                },
            }
        }
    }
}
