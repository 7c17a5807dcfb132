//! Connection manager tests over the TCP software transport.

mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rdmavar::{AccessFlags, ConnectionBuilder, ConnectionState, Error, Mode};

use common::{closed_port, connected_pair, connected_pair_with};

#[test]
fn handshake_exchanges_credentials() {
    let (client, server) = connected_pair(&[]);
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(server.state(), ConnectionState::Ready);

    assert_eq!(client.remote_credential(), server.local_credential());
    assert_eq!(server.remote_credential(), client.local_credential());
    assert_eq!(client.remote_region_info().qp_number, server.local_region_info(None).qp_number);
    assert_ne!(client.local_credential().rkey, 0);
}

#[test]
fn relative_write_then_read() {
    let (client, server) = connected_pair(&[]);

    client.write(b"hello, peer", 100).unwrap();
    let mut out = [0u8; 11];
    client.read(&mut out, 100).unwrap();
    assert_eq!(&out, b"hello, peer");

    // The bytes landed in the server's working buffer.
    let mut local = [0u8; 11];
    server.read_local(&mut local, 100).unwrap();
    assert_eq!(&local, b"hello, peer");
    assert_eq!(client.posted_operations(), 2);
    assert_eq!(server.posted_operations(), 0);
}

#[test]
fn seed_is_visible_to_the_peer() {
    let (client, _server) = connected_pair(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let mut out = [0u8; 8];
    client.read(&mut out, 0).unwrap();
    assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn both_sides_can_operate() {
    let (client, server) = connected_pair(&[]);
    server.write(&[0xaa; 16], 0).unwrap();
    client.write(&[0xbb; 16], 0).unwrap();

    let mut out = [0u8; 16];
    client.read_local(&mut out, 0).unwrap();
    assert_eq!(out, [0xaa; 16]);
    server.read_local(&mut out, 0).unwrap();
    assert_eq!(out, [0xbb; 16]);

    // Staging traffic does not disturb the exposed buffer.
    server.read(&mut out, 0).unwrap();
    assert_eq!(out, [0xaa; 16]);
    let mut mine = [0u8; 16];
    server.read_local(&mut mine, 0).unwrap();
    assert_eq!(mine, [0xbb; 16]);
}

#[test]
fn explicit_address_reaches_extra_region() {
    let (client, server) = connected_pair(&[]);
    let mut extra = vec![7u8; 64].into_boxed_slice();
    let mr = unsafe {
        server.register_memory(
            extra.as_mut_ptr(),
            extra.len(),
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ,
        )
    }
    .unwrap();

    let mut out = [0u8; 4];
    client.read_at(&mut out, mr.addr() as u64 + 60, mr.rkey()).unwrap();
    assert_eq!(out, [7; 4]);

    client.write_at(&[1, 2], mr.addr() as u64, mr.rkey()).unwrap();
    client.read_at(&mut out[..2], mr.addr() as u64, mr.rkey()).unwrap();
    assert_eq!(&out[..2], &[1, 2]);

    // Past the end of the extra region.
    let err = client.read_at(&mut out, mr.addr() as u64 + 62, mr.rkey()).unwrap_err();
    assert!(matches!(err, Error::RemoteAccess { op: "read", .. }));

    let (addr, rkey) = (mr.addr() as u64, mr.rkey());
    drop(mr);
    let err = client.read_at(&mut out, addr, rkey).unwrap_err();
    assert!(matches!(err, Error::RemoteAccess { .. }));
}

#[test]
fn register_memory_rejects_null_and_empty() {
    let (_client, server) = connected_pair(&[]);
    let mut buf = [0u8; 8];
    let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ;
    assert!(unsafe { server.register_memory(std::ptr::null_mut(), 8, access) }.is_none());
    assert!(unsafe { server.register_memory(buf.as_mut_ptr(), 0, access) }.is_none());
}

#[test]
fn local_region_info_rebases() {
    let (client, _server) = connected_pair(&[]);
    let info = client.local_region_info(Some(0xdead_0000));
    assert_eq!(info.addr, 0xdead_0000);
    assert_eq!(info.rkey, client.local_credential().rkey);
}

#[test]
fn invalid_lengths_issue_no_operation() {
    let (client, _server) = connected_pair(&[]);
    let max = client.max_transfer_size();

    assert!(matches!(client.read(&mut [], 0), Err(Error::InvalidArgument(_))));
    assert!(matches!(client.write(&vec![0u8; max + 1], 0), Err(Error::InvalidArgument(_))));
    assert!(matches!(client.write(&[1], u64::MAX), Err(Error::InvalidArgument(_))));
    assert_eq!(client.posted_operations(), 0);

    // A full-size transfer is fine.
    client.write(&vec![3u8; max], 0).unwrap();
    assert_eq!(client.posted_operations(), 1);
}

#[test]
fn remote_failure_keeps_connection_usable() {
    let (client, _server) = connected_pair(&[9; 4]);
    let remote = client.remote_credential();

    let mut out = [0u8; 4];
    let err = client.read_at(&mut out, remote.addr, remote.rkey ^ 0x1).unwrap_err();
    assert!(matches!(err, Error::RemoteAccess { .. }));
    assert_eq!(client.state(), ConnectionState::Ready);

    client.read(&mut out, 0).unwrap();
    assert_eq!(out, [9; 4]);
}

#[test]
fn read_mode_peer_cannot_be_written() {
    let (client, server) =
        connected_pair_with(ConnectionBuilder::new().mode(Mode::Read).seed([5u8; 4]), ConnectionBuilder::new());
    assert_eq!(server.mode(), Mode::Read);

    let err = client.write(&[0; 4], 0).unwrap_err();
    assert!(matches!(err, Error::RemoteAccess { op: "write", .. }));

    let mut out = [0u8; 4];
    client.read(&mut out, 0).unwrap();
    assert_eq!(out, [5; 4]);
}

#[test]
fn custom_buffer_size() {
    let (client, server) = connected_pair_with(
        ConnectionBuilder::new().buffer_size(16),
        ConnectionBuilder::new().buffer_size(32),
    );
    assert_eq!(client.max_transfer_size(), 32);
    assert_eq!(server.max_transfer_size(), 16);

    // The client may stage 32 bytes, but the server only exposes 16.
    let err = client.write(&[0u8; 32], 0).unwrap_err();
    assert!(matches!(err, Error::RemoteAccess { .. }));
    client.write(&[1u8; 16], 0).unwrap();
}

#[test]
fn concurrent_callers_are_serialized() {
    let (client, server) = connected_pair(&[]);
    let client = Arc::new(client);

    let handles: Vec<_> = (0u8..4)
        .map(|t| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                let offset = u64::from(t) * 64;
                for round in 0u8..50 {
                    let data = [t.wrapping_mul(50).wrapping_add(round); 64];
                    client.write(&data, offset).unwrap();
                    let mut out = [0u8; 64];
                    client.read(&mut out, offset).unwrap();
                    assert_eq!(out, data);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(client.posted_operations(), 4 * 50 * 2);
    let mut out = [0u8; 64];
    server.read_local(&mut out, 64).unwrap();
    assert_eq!(out, [50 + 49; 64]);
}

#[test]
fn concurrent_large_reads_in_both_directions() {
    const SIZE: usize = 1 << 24;
    let (client, server) = connected_pair_with(
        ConnectionBuilder::new().buffer_size(SIZE).seed(vec![0x11u8; SIZE]),
        ConnectionBuilder::new().buffer_size(SIZE),
    );
    client.write_local(&[0x22u8; 64], 0).unwrap();

    let (tx, rx) = mpsc::channel();
    for (name, conn, expect) in [("client", client, 0x11u8), ("server", server, 0x22u8)] {
        let tx = tx.clone();
        thread::spawn(move || {
            let mut out = vec![0u8; SIZE];
            let result = conn.read(&mut out, 0).map(|()| out[0] == expect && out[63] == expect);
            // Hand the connection back so neither side closes while the
            // other is still reading.
            let _ = tx.send((name, result, conn));
        });
    }

    let mut done = Vec::new();
    for _ in 0..2 {
        let (name, result, conn) = rx
            .recv_timeout(Duration::from_secs(60))
            .unwrap_or_else(|_| panic!("reads stalled, completed: {:?}", done.iter().map(|(n, _)| *n).collect::<Vec<_>>()));
        assert!(result.unwrap(), "{name} read the wrong bytes");
        done.push((name, conn));
    }
}

#[test]
fn close_is_idempotent_and_fails_fast() {
    let (client, _server) = connected_pair(&[]);
    client.close();
    client.close();
    assert_eq!(client.state(), ConnectionState::Closed);

    let mut out = [0u8; 4];
    assert!(matches!(client.read(&mut out, 0), Err(Error::NotReady(ConnectionState::Closed))));
    assert!(matches!(client.read_local(&mut out, 0), Err(Error::NotReady(_))));
    assert_eq!(client.posted_operations(), 0);
}

#[test]
fn peer_teardown_surfaces_remote_error() {
    let (client, server) = connected_pair(&[]);
    server.close();
    drop(server);

    let mut out = [0u8; 4];
    let err = client.read(&mut out, 0).unwrap_err();
    assert!(matches!(err, Error::RemoteAccess { .. }));
    assert_eq!(client.state(), ConnectionState::Ready);
}

#[test]
fn connect_to_closed_port_fails() {
    let port = closed_port();
    let err = ConnectionBuilder::new()
        .connect(&format!("127.0.0.1:{port}"))
        .unwrap_err();
    assert!(matches!(err, Error::Connection { context: "create endpoint", .. }));
}

#[test]
fn peer_without_port_uses_configured_port() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || ConnectionBuilder::new().listener(listener).accept().map(drop));

    let client = ConnectionBuilder::new().port(port).connect("127.0.0.1").unwrap();
    assert_eq!(client.state(), ConnectionState::Ready);
    server.join().unwrap().unwrap();
}

#[test]
fn invalid_config_is_rejected_before_connecting() {
    let err = ConnectionBuilder::new().buffer_size(0).connect("127.0.0.1:1").unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let err = ConnectionBuilder::new()
        .buffer_size(8)
        .seed(vec![0u8; 9])
        .connect("127.0.0.1:1")
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}
