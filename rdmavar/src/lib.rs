//! # rdmavar - Remote variables over one-sided RDMA
//!
//! Values and arrays that live in a peer's memory, read and written with
//! one-sided RDMA READ/WRITE.
//!
//! ## Architecture
//!
//! - [`Connection`]: one endpoint to one peer. Construction runs the
//!   handshake that exchanges memory credentials; afterwards it offers
//!   synchronous `read`/`write`, addressed relative to the peer's negotiated
//!   region or by explicit address and key.
//! - [`RemoteVar`]: one fixed-size value at a remote address. `get` is one
//!   READ, `set` is one WRITE, compound updates are READ + WRITE.
//! - [`RemoteVec`]: a remote array; [`RemoteVec::at`] bounds-checks and
//!   yields a one-shot [`ElementRef`].
//! - [`Transport`]: the substrate seam; [`SoftRdma`] runs over TCP.
//!
//! ## Usage
//!
//! ```ignore
//! use rdmavar::{Connection, Mode, RemoteVar, RemoteVec};
//!
//! let conn = Connection::client("server", Mode::Write)?;
//! let remote = conn.remote_credential();
//!
//! let array = RemoteVec::<i32>::from_credential(&conn, remote, 10)?;
//! let counter = RemoteVar::<i32>::from_credential(&conn, remote, 40)?;
//!
//! let old = counter.post_increment()?;
//! array.set(3, 999)?;
//! ```
//!
//! Proxies borrow the connection, so they cannot outlive it.

mod buffer;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod logging;
pub mod numeric;
pub mod transport;
pub mod variable;
pub mod vector;

pub use config::{ConnectionBuilder, ConnectionConfig, DEFAULT_BUFFER_SIZE, Mode};
pub use connection::{Connection, ConnectionState};
pub use credential::Credential;
pub use error::{Error, Result};
pub use numeric::{Numeric, Pod};
pub use transport::{Role, SoftRdma, Transport};
pub use variable::RemoteVar;
pub use vector::{ElementRef, RemoteVec};

pub use softrdma::{AccessFlags, DEFAULT_PORT, MemoryRegion, QpInfo};
