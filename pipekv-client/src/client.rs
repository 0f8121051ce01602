//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking entry point that owns the connection
//! pool and hands out pipelines bound to it.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Explicit Sharing**: The pool is a handle owned by the client, never
//!    global state; clone the client to share it.
//! 3. **One Code Path**: Single commands run through the pipeline executor and
//!    get the same stale-connection handling.

use crate::command::Command;
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::pipeline::Pipeline;
use crate::pool::ConnectionPool;
use crate::resp::RespValue;

/// Synchronous client with connection pooling.
///
/// `KVClient` is `Send + Sync` and cheap to clone. Each thread builds its own
/// `Pipeline`; pipelines on different threads check out different connections.
#[derive(Clone)]
pub struct KVClient {
    pool: ConnectionPool,
}

impl KVClient {
    /// Creates a client with default configuration.
    pub fn connect(addr: impl Into<String>) -> Self {
        Self::with_config(ClientConfig {
            addr: addr.into(),
            ..ClientConfig::default()
        })
    }

    /// Creates a client with a custom configuration.
    ///
    /// Connections are dialed lazily, so an unreachable server is reported by
    /// the first command rather than here.
    pub fn with_config(config: ClientConfig) -> Self {
        KVClient {
            pool: ConnectionPool::new(config),
        }
    }

    /// Starts an empty pipeline that borrows connections from this client's pool.
    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.pool.clone())
    }

    /// Shared pool handle, mainly for inspecting idle/total counts.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs one command and returns its reply.
    ///
    /// An error reply becomes `ClientError::Server`.
    pub fn query(&self, command: Command) -> ClientResult<RespValue> {
        let mut pipeline = self.pipeline();
        pipeline.cmd(command);
        let reply = pipeline
            .execute()?
            .pop()
            .ok_or(ClientError::UnexpectedResponse)??;
        match reply {
            RespValue::Error(message) => Err(ClientError::Server { message }),
            other => Ok(other),
        }
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        match self.query(Command::new("GET").arg(key))? {
            RespValue::Bulk(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        match self.query(Command::new("SET").arg(key).arg(value))? {
            RespValue::Simple(_) => Ok(()),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }

    /// Pings the server. Returns the raw response payload.
    pub fn ping(&self) -> ClientResult<Vec<u8>> {
        match self.query(Command::new("PING"))? {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse),
        }
    }
}
