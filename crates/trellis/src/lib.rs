#![forbid(unsafe_code)]
//! Multiplexing RPC framework: a compact binary wire protocol with pluggable
//! serialization and compression, a call-multiplexing client, and a smart
//! client layering service discovery, server selection, failure handling and
//! fan-out calls over cached connections.
//!
//! ## Wire format
//! Every frame is a 12-byte header (magic `0x08`, version, packed flag bits,
//! big-endian sequence number) followed by four length-prefixed sections:
//! service path, service method, metadata and payload. The flag bits select
//! the payload encoding ([`SerializeType`]: raw bytes, JSON, Protobuf,
//! MessagePack) and compression ([`CompressType`]: none, gzip). Responses
//! are correlated to requests purely by sequence number, so one connection
//! carries any number of concurrent calls.
//!
//! ## Payload types
//! Argument and reply types implement the [`Pack`]/[`Unpack`] capabilities.
//! Serde types opt in with one line via [`wire_serde!`], prost messages via
//! [`wire_proto!`], and `Vec<u8>` is the raw-bytes payload.
//!
//! ## Surfaces
//! - [`Client`]: one connection, many in-flight calls: `call`, `go`
//!   (asynchronous, returns a [`CallHandle`]), `send_oneway`, `heartbeat`.
//! - [`XClient`]: one `(service path, method)` pair over a discovered
//!   server set: unicast `call` with [`FailMode`] retry policies,
//!   [`XClient::broadcast`] (all servers must succeed) and
//!   [`XClient::fork`] (first success wins), with per-endpoint connection
//!   caching and a [`Selector`] chosen by [`SelectMode`].
//! - [`Server`]: registers [`Service`]s and dispatches framed requests to
//!   async handlers.
//! - [`Discovery`]: snapshot plus change stream of `(server key, metadata)`
//!   pairs; [`StaticDiscovery`] serves fixed or test-controlled sets.
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use trellis::{wire_serde, Client, ClientConfig, RpcError, Metadata};
//!
//! #[derive(Clone, Debug, Default, Serialize, Deserialize)]
//! struct Args { a: i64, b: i64 }
//! #[derive(Clone, Debug, Default, Serialize, Deserialize)]
//! struct Reply { c: i64 }
//! wire_serde!(Args, Reply);
//!
//! # async fn run() -> Result<(), RpcError> {
//! let client = Client::connect("tcp", "127.0.0.1:9000", ClientConfig::default()).await?;
//! let reply: Reply = client
//!     .call("Arith", "Mul", &Args { a: 10, b: 20 }, Metadata::new())
//!     .await?;
//! assert_eq!(reply.c, 200);
//! # Ok(()) }
//! ```

mod client;
pub mod codec;
pub mod compress;
mod error;
mod plugin;
pub mod protocol;
mod server;
pub mod share;

#[cfg(test)]
mod tests;

pub use client::{
    calculate_weight, CallHandle, Client, ClientConfig, ConsistentHashSelector, Discovery,
    FailMode, GeoSelector, KvPair, PingWeightedSelector, RandomSelector, RoundRobinSelector,
    SelectMode, Selector, StaticDiscovery, WeightedRoundRobinSelector, XClient,
};
pub use codec::{Pack, SerializeType, Unpack};
pub use compress::CompressType;
pub use error::{MultiError, RpcError};
pub use plugin::{Plugin, PluginContainer};
pub use protocol::{Message, MessageStatus, MessageType};
pub use server::{AuthFn, Server, ServerConfig, Service};
pub use share::Metadata;
