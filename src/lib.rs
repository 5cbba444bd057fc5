//! # seamrpc
//!
//! A minimal call/reply RPC transport over byte streams.
//!
//! A client issues calls over one connection and correlates asynchronous
//! replies by sequence number; a server negotiates a wire encoding per
//! connection and dispatches requests concurrently while serializing
//! response writes.
//!
//! ## Protocol
//!
//! - **Handshake**: one JSON line (`{"MagicNumber": ..., "CodecType": ...}`)
//!   sent by the client before anything else, selecting the codec for the
//!   rest of the connection.
//! - **Frames**: header+body pairs encoded by the negotiated codec, each
//!   value length-prefixed. The header carries the method name, sequence
//!   number, and an error string (empty means success).
//!
//! ## Example
//!
//! ```ignore
//! use seamrpc::{Client, Server, ServiceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> seamrpc::Result<()> {
//!     let mut registry = ServiceRegistry::new();
//!     registry.register("Foo.Sum", |args: String| async move {
//!         Ok(format!("resp:{args}"))
//!     });
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { Server::new(registry).serve(listener).await });
//!
//!     let client = Client::connect(addr).await?;
//!     let reply: String = client.call("Foo.Sum", "req:0").await?;
//!     assert_eq!(reply, "resp:req:0");
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod service;
pub mod wire;

mod client;
mod server;

pub use client::{Call, Client};
pub use codec::CodecKind;
pub use error::{Result, RpcError};
pub use server::Server;
pub use service::ServiceRegistry;
pub use wire::{Handshake, Header, MAGIC};
