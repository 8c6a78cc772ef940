// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! One peer connection: a non-blocking stream, its input and output
//! byte buffers, and the link protocol state. The state machine runs
//! starting → started on the first successful I/O, and any error or
//! shutdown moves it through stopping (recovery of buffered kernels)
//! to stopped.

use bytes::{Buf, BytesMut};
use kernel::{Link, SocketAddress};
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::time::Instant;
use tracing::trace;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ConnState {
    Starting,
    Started,
    Stopped,
}

impl ConnState {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ConnState::Starting => "starting",
            ConnState::Started => "started",
            ConnState::Stopped => "stopped",
        }
    }
}

pub(crate) enum Stream {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
}

impl Stream {
    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }

    fn write_some(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry, token: Token, interest: Interest) {
        let _ = match self {
            Stream::Tcp(s) => registry.register(s, token, interest),
            Stream::Unix(s) => registry.register(s, token, interest),
        };
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interest: Interest) {
        let _ = match self {
            Stream::Tcp(s) => registry.reregister(s, token, interest),
            Stream::Unix(s) => registry.reregister(s, token, interest),
        };
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        let _ = match self {
            Stream::Tcp(s) => registry.deregister(s),
            Stream::Unix(s) => registry.deregister(s),
        };
    }
}

/// Outcome of draining the readable side.
pub(crate) enum FillOutcome {
    /// More bytes may arrive later.
    Open,
    /// The peer closed in an orderly fashion.
    Closed,
}

pub(crate) struct Connection {
    pub(crate) stream: Stream,
    pub(crate) token: Token,
    pub(crate) address: SocketAddress,
    pub(crate) link: Link,
    pub(crate) out: BytesMut,
    pub(crate) inbuf: BytesMut,
    pub(crate) state: ConnState,
    pub(crate) weight: u64,
    pub(crate) opened_at: Instant,
    writable_interest: bool,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        token: Token,
        address: SocketAddress,
        link: Link,
        state: ConnState,
    ) -> Self {
        Self {
            stream,
            token,
            address,
            link,
            out: BytesMut::new(),
            inbuf: BytesMut::new(),
            state,
            weight: 1,
            opened_at: Instant::now(),
            writable_interest: true,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state == ConnState::Started
    }

    /// Drain the socket into the input buffer.
    pub(crate) fn fill(&mut self) -> io::Result<FillOutcome> {
        let mut chunk = [0u8; 16 * 1024];
        loop {
            match self.stream.read_some(&mut chunk) {
                Ok(0) => return Ok(FillOutcome::Closed),
                Ok(n) => {
                    trace!(address = %self.address, n, "read");
                    self.inbuf.extend_from_slice(&chunk[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FillOutcome::Open);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Push buffered output bytes; keeps WRITABLE interest only while
    /// something is left over.
    pub(crate) fn flush(&mut self, registry: &Registry) -> io::Result<()> {
        while !self.out.is_empty() {
            match self.stream.write_some(&self.out) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    trace!(address = %self.address, n, "wrote");
                    self.out.advance(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        let want_write = !self.out.is_empty();
        if want_write != self.writable_interest {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            self.stream.reregister(registry, self.token, interest);
            self.writable_interest = want_write;
        }
        Ok(())
    }
}
