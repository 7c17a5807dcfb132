//! Connection configuration.

use std::marker::PhantomData;
use std::net::TcpListener;

use softrdma::{AccessFlags, DEFAULT_PORT};

use crate::connection::Connection;
use crate::error::Result;
use crate::transport::{Role, SoftRdma, Transport};

/// Default working buffer size, which is also the largest single transfer.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Operating mode of a connection.
///
/// Decides what the peer may do to this side's working buffer. Both modes
/// can issue READs and WRITEs against the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Peer may read the working buffer but not write it.
    Read,
    /// Peer may read and write the working buffer.
    #[default]
    Write,
}

impl Mode {
    /// Access rights the working buffer is registered with.
    pub fn access_flags(self) -> AccessFlags {
        match self {
            Mode::Read => AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
            Mode::Write => {
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
            }
        }
    }
}

/// Configuration for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Operating mode.
    pub mode: Mode,
    /// TCP port: listened on by the server, used by the client when the
    /// peer string carries no port.
    pub port: u16,
    /// Working buffer size in bytes (max transfer size).
    pub buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            port: DEFAULT_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    pub fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Builder for [`Connection`].
///
/// # Example
///
/// ```ignore
/// let conn = ConnectionBuilder::new()
///     .mode(Mode::Write)
///     .port(18515)
///     .connect("server")?;
/// ```
pub struct ConnectionBuilder<X = SoftRdma> {
    config: ConnectionConfig,
    seed: Vec<u8>,
    listener: Option<TcpListener>,
    _marker: PhantomData<fn() -> X>,
}

impl<X> Default for ConnectionBuilder<X> {
    fn default() -> Self {
        Self {
            config: ConnectionConfig::default(),
            seed: Vec::new(),
            listener: None,
            _marker: PhantomData,
        }
    }
}

impl ConnectionBuilder {
    /// Create a builder for the TCP software transport.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<X: Transport> ConnectionBuilder<X> {
    /// Set the operating mode.
    pub fn mode(mut self, mode: Mode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the TCP port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the working buffer size.
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.config.buffer_size = size;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial contents of the working buffer, in place before its
    /// credential is sent to the peer.
    pub fn seed(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.seed = bytes.into();
        self
    }

    /// Accept on an already bound listener instead of binding `port`.
    pub fn listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Connect to `peer` (`host` or `host:port`) and run the handshake.
    pub fn connect(self, peer: &str) -> Result<Connection<X>> {
        Connection::establish(
            Role::Client {
                peer: peer.to_string(),
            },
            self.config,
            &self.seed,
        )
    }

    /// Wait for one peer and run the handshake.
    pub fn accept(self) -> Result<Connection<X>> {
        Connection::establish(
            Role::Server {
                listener: self.listener,
            },
            self.config,
            &self.seed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_access_flags() {
        assert!(!Mode::Read.access_flags().contains(AccessFlags::REMOTE_WRITE));
        assert!(Mode::Read.access_flags().contains(AccessFlags::REMOTE_READ));
        assert!(Mode::Write.access_flags().contains(AccessFlags::REMOTE_WRITE | AccessFlags::LOCAL_WRITE));
    }

    #[test]
    fn defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.mode, Mode::Write);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(ConnectionConfig::with_mode(Mode::Read).mode, Mode::Read);
    }
}
