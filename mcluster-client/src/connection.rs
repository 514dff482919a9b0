//! # Node Connection
//!
//! Purpose: One persistent TCP socket to one node, with framed reads and
//! writes under fixed deadlines.
//!
//! ## Design Principles
//! 1. **Fail Closed**: Any I/O, protocol, or oversize failure marks the
//!    connection `Closed`; its byte stream is in an unknown position.
//! 2. **No Self-Healing**: A closed connection never reconnects; the pool
//!    drops it and the dispatcher asks for a fresh one.
//! 3. **Buffer Reuse**: The write buffer and scratch buffer live on the
//!    connection to keep the request path allocation-light.

use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use bytes::BytesMut;
use tracing::debug;

use mcluster_common::{McError, McResult, ProtocolVariant};

use crate::codec::{self, Frame, Request};
use crate::config::{ServerAddr, Timeouts};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Parked in the node's idle set.
    Idle,
    /// Held by exactly one operation.
    InUse,
    /// Unusable; will be dropped rather than pooled.
    Closed,
}

/// Single TCP connection with reusable buffers.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    write_buf: BytesMut,
    scratch: Vec<u8>,
    variant: ProtocolVariant,
    state: ConnState,
    peer: String,
}

impl Connection {
    /// Opens a socket to `addr` and applies the deadlines.
    pub fn connect(addr: &ServerAddr, variant: ProtocolVariant, timeouts: &Timeouts) -> McResult<Self> {
        let stream = connect_stream(addr, timeouts)?;
        stream.set_read_timeout(Some(timeouts.read))?;
        stream.set_write_timeout(Some(timeouts.write))?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        debug!(node = %addr, "connection opened");
        Ok(Connection {
            reader: BufReader::new(stream),
            write_buf: BytesMut::with_capacity(256),
            scratch: Vec::with_capacity(128),
            variant,
            state: ConnState::Idle,
            peer: addr.label(),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Returns true once the connection may no longer be used.
    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        if self.state != ConnState::Closed {
            self.state = state;
        }
    }

    /// Encodes and writes `request`.
    pub fn send_request(&mut self, request: &Request<'_>) -> McResult<()> {
        self.write_buf.clear();
        codec::encode(self.variant, request, &mut self.write_buf)?;
        let buf = std::mem::take(&mut self.write_buf);
        let result = self.send(&buf);
        self.write_buf = buf;
        result
    }

    /// Writes raw bytes and flushes.
    pub fn send(&mut self, bytes: &[u8]) -> McResult<()> {
        self.ensure_open()?;
        let stream = self.reader.get_mut();
        let result = stream.write_all(bytes).and_then(|_| stream.flush());
        result.map_err(|err| self.fail(err.into()))
    }

    /// Reads one response frame; `limit` caps value lengths.
    pub fn read_frame(&mut self, limit: Option<usize>) -> McResult<Frame> {
        self.ensure_open()?;
        codec::read_frame(self.variant, &mut self.reader, &mut self.scratch, limit)
            .map_err(|err| self.fail(err))
    }

    /// Lazily yields frames until the terminal marker.
    pub fn frames(&mut self, limit: Option<usize>) -> Frames<'_> {
        Frames {
            conn: self,
            limit,
            done: false,
        }
    }

    /// Shuts the socket down. Calling it again is a no-op.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
        debug!(node = %self.peer, "connection closed");
    }

    fn ensure_open(&self) -> McResult<()> {
        if self.is_closed() {
            return Err(McError::Connection(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }
        Ok(())
    }

    fn fail(&mut self, err: McError) -> McError {
        debug!(node = %self.peer, error = %err, "connection failed");
        self.close();
        err
    }
}

/// Iterator over the frames of one multi-frame response.
///
/// Stops after the terminal marker (which is not yielded) or after the first
/// error.
pub struct Frames<'c> {
    conn: &'c mut Connection,
    limit: Option<usize>,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = McResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.conn.read_frame(self.limit) {
            Ok(Frame::End) => {
                self.done = true;
                None
            }
            Ok(frame) => Some(Ok(frame)),
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

fn connect_stream(addr: &ServerAddr, timeouts: &Timeouts) -> McResult<TcpStream> {
    let resolved: Vec<SocketAddr> = (addr.host.as_str(), addr.port).to_socket_addrs()?.collect();
    if resolved.is_empty() {
        return Err(McError::Configuration(format!("{addr} resolved to no addresses")));
    }

    let mut last_err = None;
    for socket in resolved {
        match TcpStream::connect_timeout(&socket, timeouts.connect) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.map(McError::from).unwrap_or(McError::NoServers))
}
