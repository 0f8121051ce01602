//! # Connection Pool
//!
//! Purpose: Reuse TCP connections across pipelines to avoid a handshake per
//! batch, and hand out brand-new connections when a pooled one went stale.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections
//!    or adjusting the slot count; never across network I/O.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Guaranteed Release**: `PooledConnection` gives its connection back (or
//!    frees its slot) in `Drop`, on every exit path.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::{read_response, RespValue};

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    config: ClientConfig,
    state: Mutex<PoolState>,
}

/// Connection pool handle.
///
/// Cloning is cheap and every clone shares the same idle queue, so one pool
/// can back any number of pipelines on any number of threads.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool. No connection is dialed until first use.
    pub fn new(config: ClientConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Checks out an idle connection, dialing a new one if none is idle.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.pop_idle() {
            debug!(addr = %self.inner.config.addr, "reusing idle connection");
            return Ok(PooledConnection::new(self.clone(), conn));
        }
        self.acquire_fresh()
    }

    /// Dials a brand-new connection, ignoring any idle ones.
    pub fn acquire_fresh(&self) -> ClientResult<PooledConnection> {
        if !self.try_reserve() {
            return Err(ClientError::PoolExhausted);
        }

        match Connection::connect(&self.inner.config) {
            Ok(conn) => {
                debug!(addr = %self.inner.config.addr, "opened connection");
                Ok(PooledConnection::new(self.clone(), conn))
            }
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Number of connections waiting in the idle queue.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Number of live connections, idle or checked out.
    pub fn total_count(&self) -> usize {
        self.inner.state.lock().total
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.inner.state.lock().idle.pop_front()
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.config.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.inner.state.lock();
        if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: ConnectionPool,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: ConnectionPool, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Marks the connection unusable; it is closed instead of recycled.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Sends `payload` in a single write.
    pub fn send(&mut self, payload: &[u8]) -> ClientResult<()> {
        let result = self.connection()?.send(payload);
        self.observe(result)
    }

    /// Reads the next reply from the stream.
    pub fn read_reply(&mut self) -> ClientResult<RespValue> {
        let result = self.connection()?.read_reply();
        self.observe(result)
    }

    fn connection(&mut self) -> ClientResult<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or(ClientError::Io(std::io::ErrorKind::NotConnected.into()))
    }

    fn observe<T>(&mut self, result: ClientResult<T>) -> ClientResult<T> {
        if let Err(err) = &result {
            if err.is_connection_fatal() {
                self.valid = false;
            }
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid {
            self.pool.return_connection(conn);
        } else {
            debug!(addr = %self.pool.inner.config.addr, "evicting connection");
            self.pool.release_slot();
        }
    }
}

/// Single TCP connection with reusable buffers.
struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
}

impl Connection {
    fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        stream.set_read_timeout(config.read_timeout)?;
        stream.set_write_timeout(config.write_timeout)?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
        })
    }

    fn send(&mut self, payload: &[u8]) -> ClientResult<()> {
        let stream = self.reader.get_mut();
        stream.write_all(payload)?;
        stream.flush()?;
        Ok(())
    }

    fn read_reply(&mut self) -> ClientResult<RespValue> {
        read_response(&mut self.reader, &mut self.line_buf)
    }
}

fn connect_stream(config: &ClientConfig) -> ClientResult<TcpStream> {
    let addr = resolve(&config.addr)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    Ok(stream)
}

fn resolve(addr: &str) -> ClientResult<SocketAddr> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ClientError::InvalidAddress(addr.to_string()))
}
