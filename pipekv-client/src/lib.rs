//! # PipeKV Sync Client
//!
//! Purpose: Provide a synchronous, Redis-compatible client whose main job is
//! pipelining: queue commands, send them in one write over a pooled TCP
//! connection, and read the replies back in order.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections to avoid repeated connects.
//! 2. **Strict Ordering**: Reply `i` always belongs to command `i`.
//! 3. **Minimal Allocation**: One encode buffer per batch, reused read buffers
//!    per connection.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Usage
//!
//! ```no_run
//! use pipekv_client::KVClient;
//!
//! let client = KVClient::connect("127.0.0.1:6379");
//! let mut pipeline = client.pipeline();
//! pipeline.set(b"k", b"1").incr(b"k").get(b"k");
//! for reply in pipeline.execute()? {
//!     println!("{:?}", reply?);
//! }
//! # Ok::<(), pipekv_client::ClientError>(())
//! ```

mod client;
mod command;
mod config;
mod error;
mod pipeline;
mod pool;
mod resp;

pub use client::KVClient;
pub use command::Command;
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use pipeline::{Pipeline, Reply};
pub use pool::{ConnectionPool, PooledConnection};
pub use resp::{encode_command, read_response, RespValue};
