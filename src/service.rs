//! Method registry: maps `"Service.Method"` names to typed handlers.
//!
//! This is the pluggable dispatch collaborator behind the server's
//! per-request hook; the protocol core only ever sees opaque payload bytes.
//! Handlers decode their argument with the connection's negotiated codec and
//! encode the reply with the same codec.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = ServiceRegistry::new();
//! registry.register("Foo.Sum", |args: String| async move {
//!     Ok(format!("resp:{args}"))
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecKind;
use crate::error::{Result, RpcError};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered method, invoked with the raw encoded argument.
pub trait Handler: Send + Sync + 'static {
    /// Decode the argument, run the method, and return the encoded reply.
    fn call(&self, kind: CodecKind, args: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// Wrapper that decodes the argument and encodes the reply around a typed
/// handler function.
struct TypedHandler<F, A, Fut, R>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(A) -> (Fut, R)>,
}

impl<F, A, Fut, R> Handler for TypedHandler<F, A, Fut, R>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Serialize + Send + 'static,
{
    fn call(&self, kind: CodecKind, args: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        let parsed: A = match kind.decode(&args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed);
        Box::pin(async move {
            let reply = fut.await?;
            kind.encode(&reply).map(Bytes::from)
        })
    }
}

/// Registry mapping `"Service.Method"` names to handlers.
#[derive(Default)]
pub struct ServiceRegistry {
    methods: HashMap<String, Box<dyn Handler>>,
}

impl ServiceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a typed handler under a `"Service.Method"` name.
    ///
    /// The handler receives the deserialized argument and returns the reply
    /// value; serialization on both sides follows the connection's codec.
    pub fn register<F, A, Fut, R>(&mut self, name: &str, handler: F)
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Box::new(TypedHandler {
                handler,
                _phantom: PhantomData,
            }),
        );
    }

    /// Whether a method is registered under this name.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Resolve and invoke one method.
    pub async fn dispatch(&self, name: &str, kind: CodecKind, args: Bytes) -> Result<Bytes> {
        let handler = self
            .methods
            .get(name)
            .ok_or_else(|| RpcError::MethodNotFound(name.to_string()))?;

        handler.call(kind, args).await
    }
}
