//! # Command Pipelining
//!
//! Purpose: Queue many commands, send them in one write, and read back exactly
//! one reply per command in the order they were queued.
//!
//! ## Design Principles
//! 1. **Closed Command Set**: Every supported command is a typed method that
//!    builds a `Command`; `cmd` covers anything else.
//! 2. **One Write, N Reads**: The batch is encoded into a single buffer and the
//!    replies are demultiplexed purely by order.
//! 3. **Single Retry**: A connection that turns out to be closed by the peer
//!    is replaced once and the whole buffer is resent.
//! 4. **Slot-Local Failures**: Error replies and malformed single-line frames
//!    stay in their own slot. Transport failures, and malformed frames that
//!    leave the stream misaligned, fail the whole call.
//!
//! ## Execute Flow
//!
//! ```text
//! commands ──encode──▶ payload ──acquire──▶ attempt ──ok──▶ results
//!                                             │
//!                                   EOF before 1st reply
//!                                             ▼
//!                               evict, acquire_fresh, attempt once more
//! ```

use std::mem;

use tracing::{debug, warn};

use crate::command::Command;
use crate::error::{ClientError, ClientResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resp::RespValue;

/// One reply slot: the decoded value, or the framing error for that slot.
pub type Reply = ClientResult<RespValue>;

/// An ordered batch of commands bound to a connection pool.
///
/// Appending takes `&mut self`, so one pipeline cannot be shared between
/// threads while it is being built or executed. Create one per thread.
pub struct Pipeline {
    pool: ConnectionPool,
    commands: Vec<Command>,
}

impl Pipeline {
    pub(crate) fn new(pool: ConnectionPool) -> Self {
        Pipeline {
            pool,
            commands: Vec::new(),
        }
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queued commands, in send order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Discards every queued command without sending anything.
    pub fn reset(&mut self) {
        self.commands.clear();
    }

    /// Queues an arbitrary command.
    pub fn cmd(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    /// Sends every queued command and returns one reply per command.
    ///
    /// An empty pipeline returns `Ok(vec![])` without touching the pool.
    /// Otherwise the queue is emptied whether or not the call succeeds.
    ///
    /// `Err` means a transport failure: no connection could be obtained, the
    /// stream broke, or a malformed reply left the stream misaligned
    /// (`ClientError::Desync`). If the very first write or read hits end-of-stream,
    /// the batch is resent once on a new connection. That resend is not
    /// deduplicated: when the server had already applied the first attempt,
    /// non-idempotent commands such as `INCR` or `LPUSH` run twice.
    pub fn execute(&mut self) -> ClientResult<Vec<Reply>> {
        if self.commands.is_empty() {
            return Ok(Vec::new());
        }

        let commands = mem::take(&mut self.commands);
        let capacity = commands.iter().map(Command::encoded_len_hint).sum();
        let mut payload = Vec::with_capacity(capacity);
        for command in &commands {
            command.encode(&mut payload);
        }

        debug!(commands = commands.len(), bytes = payload.len(), "executing pipeline");
        send_batch(&self.pool, &payload, commands.len())
    }

    // --- keys ---

    /// Queues `EXISTS key`.
    pub fn exists(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("EXISTS").arg(key))
    }

    /// Queues `DEL key`.
    pub fn del(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("DEL").arg(key))
    }

    /// Queues `TYPE key`.
    pub fn key_type(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("TYPE").arg(key))
    }

    /// Queues `KEYS pattern`.
    pub fn keys(&mut self, pattern: &[u8]) -> &mut Self {
        self.cmd(Command::new("KEYS").arg(pattern))
    }

    /// Queues `EXPIRE key seconds`.
    pub fn expire(&mut self, key: &[u8], seconds: i64) -> &mut Self {
        self.cmd(Command::new("EXPIRE").arg(key).int_arg(seconds))
    }

    // --- strings ---

    /// Queues `SET key value`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.cmd(Command::new("SET").arg(key).arg(value))
    }

    /// Queues `GET key`; a missing key replies with an absent bulk.
    pub fn get(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("GET").arg(key))
    }

    /// Queues `INCR key`.
    pub fn incr(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("INCR").arg(key))
    }

    /// Queues `INCRBY key delta`.
    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> &mut Self {
        self.cmd(Command::new("INCRBY").arg(key).int_arg(delta))
    }

    /// Queues `DECR key`.
    pub fn decr(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("DECR").arg(key))
    }

    /// Queues `DECRBY key delta`.
    pub fn decr_by(&mut self, key: &[u8], delta: i64) -> &mut Self {
        self.cmd(Command::new("DECRBY").arg(key).int_arg(delta))
    }

    /// Queues `APPEND key value`.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.cmd(Command::new("APPEND").arg(key).arg(value))
    }

    // --- lists ---

    /// Queues `RPUSH key value`.
    pub fn rpush(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.cmd(Command::new("RPUSH").arg(key).arg(value))
    }

    /// Queues `LPUSH key value`.
    pub fn lpush(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.cmd(Command::new("LPUSH").arg(key).arg(value))
    }

    /// Queues `LLEN key`.
    pub fn llen(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("LLEN").arg(key))
    }

    /// Queues `LRANGE key start stop`; negative indices count from the tail.
    pub fn lrange(&mut self, key: &[u8], start: i64, stop: i64) -> &mut Self {
        self.cmd(Command::new("LRANGE").arg(key).int_arg(start).int_arg(stop))
    }

    /// Queues `LTRIM key start stop`.
    pub fn ltrim(&mut self, key: &[u8], start: i64, stop: i64) -> &mut Self {
        self.cmd(Command::new("LTRIM").arg(key).int_arg(start).int_arg(stop))
    }

    /// Queues `LINDEX key index`.
    pub fn lindex(&mut self, key: &[u8], index: i64) -> &mut Self {
        self.cmd(Command::new("LINDEX").arg(key).int_arg(index))
    }

    /// Queues `LSET key index value`.
    pub fn lset(&mut self, key: &[u8], index: i64, value: &[u8]) -> &mut Self {
        self.cmd(Command::new("LSET").arg(key).int_arg(index).arg(value))
    }

    /// Queues `LREM key count value`.
    pub fn lrem(&mut self, key: &[u8], count: i64, value: &[u8]) -> &mut Self {
        self.cmd(Command::new("LREM").arg(key).int_arg(count).arg(value))
    }

    /// Queues `LPOP key`.
    pub fn lpop(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("LPOP").arg(key))
    }

    /// Queues `RPOP key`.
    pub fn rpop(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("RPOP").arg(key))
    }

    /// Queues `RPOPLPUSH source destination`.
    pub fn rpoplpush(&mut self, source: &[u8], destination: &[u8]) -> &mut Self {
        self.cmd(Command::new("RPOPLPUSH").arg(source).arg(destination))
    }

    // --- hashes ---

    /// Queues `HSET key field value`.
    pub fn hset(&mut self, key: &[u8], field: &[u8], value: &[u8]) -> &mut Self {
        self.cmd(Command::new("HSET").arg(key).arg(field).arg(value))
    }

    /// Queues `HGET key field`.
    pub fn hget(&mut self, key: &[u8], field: &[u8]) -> &mut Self {
        self.cmd(Command::new("HGET").arg(key).arg(field))
    }

    /// Queues `HGETALL key`; see `RespValue::into_pairs` for the reply.
    pub fn hgetall(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("HGETALL").arg(key))
    }

    /// Queues `HDEL key field`.
    pub fn hdel(&mut self, key: &[u8], field: &[u8]) -> &mut Self {
        self.cmd(Command::new("HDEL").arg(key).arg(field))
    }

    /// Queues `HLEN key`.
    pub fn hlen(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("HLEN").arg(key))
    }

    /// Queues `HKEYS key`.
    pub fn hkeys(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("HKEYS").arg(key))
    }

    /// Queues `HVALS key`.
    pub fn hvals(&mut self, key: &[u8]) -> &mut Self {
        self.cmd(Command::new("HVALS").arg(key))
    }

    // --- server ---

    /// Queues `PING`.
    pub fn ping(&mut self) -> &mut Self {
        self.cmd(Command::new("PING"))
    }
}

/// Why an attempt failed, and whether a fresh connection may fix it.
enum AttemptError {
    Stale(ClientError),
    Fatal(ClientError),
}

fn send_batch(pool: &ConnectionPool, payload: &[u8], count: usize) -> ClientResult<Vec<Reply>> {
    let mut conn = pool.acquire().map_err(|err| {
        warn!(error = %err, "pipeline failed to obtain a connection");
        err
    })?;
    let mut retried = false;

    loop {
        let err = match attempt(&mut conn, payload, count) {
            Ok(replies) => return Ok(replies),
            Err(AttemptError::Stale(err)) if !retried => err,
            Err(AttemptError::Stale(err)) | Err(AttemptError::Fatal(err)) => {
                warn!(error = %err, "pipeline failed");
                return Err(err);
            }
        };

        warn!(error = %err, commands = count, "connection closed by peer, resending pipeline on a new connection");
        retried = true;
        // The stale guard must release its slot before the fresh dial reserves one.
        drop(conn);
        conn = pool.acquire_fresh().map_err(|err| {
            warn!(error = %err, "pipeline failed to open a replacement connection");
            err
        })?;
    }
}

fn attempt(conn: &mut PooledConnection, payload: &[u8], count: usize) -> Result<Vec<Reply>, AttemptError> {
    conn.send(payload).map_err(classify)?;

    let mut replies = Vec::with_capacity(count);
    for idx in 0..count {
        match conn.read_reply() {
            Ok(value) => replies.push(Ok(value)),
            Err(err @ ClientError::Protocol(_)) => replies.push(Err(err)),
            // Later replies can no longer be matched to their commands.
            Err(err @ ClientError::Desync(_)) => return Err(AttemptError::Fatal(err)),
            Err(err) if idx == 0 => return Err(classify(err)),
            Err(err) => return Err(AttemptError::Fatal(err)),
        }
    }
    Ok(replies)
}

fn classify(err: ClientError) -> AttemptError {
    if err.is_end_of_stream() {
        AttemptError::Stale(err)
    } else {
        AttemptError::Fatal(err)
    }
}
