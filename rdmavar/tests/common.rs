//! Common test utilities for rdmavar integration tests.

// Test utilities may not all be used in every test file
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;

use rdmavar::logging::init_test_logging;
use rdmavar::{Connection, ConnectionBuilder};
use zerocopy::IntoBytes;

/// Elements in the demo array.
pub const ARRAY_LEN: usize = 10;
/// Byte offset of the demo counter.
pub const COUNTER_OFFSET: u64 = (ARRAY_LEN * 4) as u64;

/// `0, 10, ..., 90` followed by a counter of 42.
pub fn demo_seed() -> Vec<u8> {
    let mut values: Vec<i32> = (0..ARRAY_LEN as i32).map(|i| i * 10).collect();
    values.push(42);
    values.as_bytes().to_vec()
}

/// Connect `client` to `server` over loopback.
///
/// The server accepts on a pre-bound ephemeral port in a helper thread and
/// hands its connection back through a channel. Returns `(client, server)`.
pub fn connected_pair_with(server: ConnectionBuilder, client: ConnectionBuilder) -> (Connection, Connection) {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        let _ = tx.send(server.listener(listener).accept());
    });

    let client = client.connect(&format!("127.0.0.1:{port}")).unwrap();
    let server = rx.recv().unwrap().unwrap();
    (client, server)
}

/// Default-configured pair whose server working buffer starts as `seed`.
pub fn connected_pair(seed: &[u8]) -> (Connection, Connection) {
    connected_pair_with(ConnectionBuilder::new().seed(seed), ConnectionBuilder::new())
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
