use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use crate::{
    codec::{Pack, SerializeType, Unpack},
    error::RpcError,
    share::Metadata,
};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered method behind an erased vtable: decodes the argument with
/// the request's serialize type, runs the handler, and encodes the reply
/// with the same serialize type.
pub(crate) type ErasedHandler =
    Arc<dyn Fn(SerializeType, Vec<u8>, Metadata) -> BoxFuture<Result<Vec<u8>, RpcError>> + Send + Sync>;

/// A named service: a service path and its registered methods.
///
/// ```no_run
/// # use serde::{Deserialize, Serialize};
/// # use trellis::{wire_serde, RpcError, Service};
/// #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// struct Args { a: i64, b: i64 }
/// #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// struct Reply { c: i64 }
/// wire_serde!(Args, Reply);
///
/// let arith = Service::new("Arith")
///     .method("Mul", |args: Args, _metadata| async move {
///         Ok::<_, RpcError>(Reply { c: args.a * args.b })
///     });
/// ```
pub struct Service {
    path: String,
    methods: HashMap<String, ErasedHandler>,
}

impl Service {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            methods: HashMap::new(),
        }
    }

    /// Registers an async handler under `name`.
    pub fn method<A, R, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        A: Unpack + Default + Send + 'static,
        R: Pack + 'static,
        F: Fn(A, Metadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ErasedHandler = Arc::new(move |serialize_type, payload, metadata| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let mut args = A::default();
                args.unpack(serialize_type, &payload)?;
                let reply = handler(args, metadata).await?;
                reply.pack(serialize_type)
            })
        });
        self.methods.insert(name.to_string(), erased);
        self
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn handler(&self, method: &str) -> Option<ErasedHandler> {
        self.methods.get(method).cloned()
    }
}
