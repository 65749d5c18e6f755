//! Blocking/polled TCP transport.
//!
//! One listen socket stays bound for the lifetime of the session; one
//! connection socket serves the single attached client. Any transport
//! error tears down the connection socket only, so the runtime resumes
//! accepting without a restart. Polled (non-blocking) accept and recv
//! realize the zero-timeout readiness checks of the original select()
//! loop via `set_nonblocking`.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::params::NetworkParams;
use crate::Result;

/// Short readiness window applied to sends, standing in for the
/// original's select-for-write timeout.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct Transport {
    params: NetworkParams,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    connected: bool,
}

impl Transport {
    #[must_use]
    pub const fn new(params: NetworkParams) -> Self {
        Self {
            params,
            listener: None,
            stream: None,
            connected: false,
        }
    }

    #[must_use]
    pub const fn params(&self) -> &NetworkParams {
        &self.params
    }

    #[must_use]
    pub const fn is_networking(&self) -> bool {
        self.listener.is_some()
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connected
    }

    /// Port the listen socket is bound to. Useful when the configured
    /// port was 0.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|addr| addr.port())
    }

    /// Bind the listen socket on all interfaces.
    ///
    /// # Errors
    ///
    /// [`Error::TcpListenFail`] if the bind/listen fails.
    pub fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.params.port)).map_err(|err| {
            warn!(port = self.params.port, %err, "tcp listen failed");
            Error::TcpListenFail
        })?;
        debug!(port = self.params.port, "listening");
        self.listener = Some(listener);
        Ok(())
    }

    /// Accept one client.
    ///
    /// Blocking mode waits for a connection. Polled mode returns
    /// [`Error::NotNetworking`] when no connection is pending, which the
    /// caller treats as "poll again next tick".
    ///
    /// # Errors
    ///
    /// [`Error::NotNetworking`] while no client is waiting (polled mode),
    /// [`Error::TcpNonBlockingFail`] / [`Error::TcpSocketInitFail`] on
    /// socket failures.
    pub fn accept(&mut self, blocking: bool) -> Result<()> {
        let listener = self.listener.as_ref().ok_or(Error::NotNetworking)?;
        listener
            .set_nonblocking(!blocking)
            .map_err(|_| Error::TcpNonBlockingFail)?;
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "client connected");
                stream.set_nodelay(true).ok();
                stream
                    .set_nonblocking(false)
                    .map_err(|_| Error::TcpNonBlockingFail)?;
                self.stream = Some(stream);
                self.connected = true;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(Error::NotNetworking),
            Err(err) => {
                warn!(%err, "accept failed");
                Err(Error::TcpSocketInitFail)
            }
        }
    }

    /// Send all of `data`. A transport failure drops the connection
    /// socket; the listen socket stays bound.
    ///
    /// # Errors
    ///
    /// [`Error::TcpNotConnected`] when no client is attached or the
    /// connection died, [`Error::TcpFailSelectWrite`] on a send timeout.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::TcpNotConnected)?;
        // The socket may be left non-blocking by a polled recv; sends are
        // always blocking with a bounded timeout.
        stream
            .set_nonblocking(false)
            .map_err(|_| Error::TcpNonBlockingFail)?;
        stream.set_write_timeout(Some(SEND_TIMEOUT)).ok();
        match stream.write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                warn!(%err, "send timed out");
                self.drop_connection();
                Err(Error::TcpFailSelectWrite)
            }
            Err(err) => {
                warn!(%err, "send failed");
                self.drop_connection();
                Err(Error::TcpNotConnected)
            }
        }
    }

    /// Receive up to `buf.len()` bytes.
    ///
    /// Blocking mode waits for data. Polled mode returns `Ok(0)` when
    /// nothing is pending. A closed or failed connection drops the
    /// connection socket and reports [`Error::TcpNotConnected`].
    ///
    /// # Errors
    ///
    /// [`Error::TcpNotConnected`] on disconnect or when no client is
    /// attached, [`Error::TcpNonBlockingFail`] if the mode switch fails.
    pub fn recv(&mut self, buf: &mut [u8], blocking: bool) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::TcpNotConnected)?;
        stream
            .set_nonblocking(!blocking)
            .map_err(|_| Error::TcpNonBlockingFail)?;
        if blocking {
            stream.set_read_timeout(None).ok();
        }
        match stream.read(buf) {
            Ok(0) => {
                debug!("peer closed connection");
                self.drop_connection();
                Err(Error::TcpNotConnected)
            }
            Ok(count) => Ok(count),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                warn!(%err, "recv failed");
                self.drop_connection();
                Err(Error::TcpNotConnected)
            }
        }
    }

    /// Drop the connection socket and mark disconnected; the listen
    /// socket remains bound for the next client.
    pub fn disconnect(&mut self) {
        self.drop_connection();
    }

    /// Close both sockets.
    pub fn stop(&mut self) {
        self.drop_connection();
        self.listener = None;
    }

    fn drop_connection(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown(Shutdown::Both).ok();
        }
        self.connected = false;
    }
}
