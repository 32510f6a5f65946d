//! End-to-end wire-protocol tests against a live server.
//!
//! Each test launches its own server on an ephemeral port and talks to it
//! with plain std TCP clients. Skipped on kernels without the required
//! io_uring features.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use server::config::Config;
use server::supervisor::Server;

/// Get an available port for testing.
fn get_available_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config(workers: usize, port: u16) -> Config {
    let mut config = Config::default();
    config.workers.threads = Some(workers);
    config.listener.host = "127.0.0.1".to_string();
    config.listener.port = port;
    config.uring.queue_depth = 256;
    config.uring.ring_entries = 64;
    config.uring.ring_buf_size = 2048;
    config
}

fn launch(workers: usize) -> (Server, SocketAddr) {
    let port = get_available_port();
    let server = Server::launch(&test_config(workers, port)).unwrap();
    (server, SocketAddr::from(([127, 0, 0, 1], port)))
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn frame(id: u16, payload: &[u8]) -> Vec<u8> {
    let size = (4 + payload.len()) as u16;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// True if a read observed the peer closing the connection (EOF or reset),
/// as opposed to timing out.
fn saw_close(result: std::io::Result<usize>) -> bool {
    match result {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
    }
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u16, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let size = u16::from_le_bytes([header[0], header[1]]);
    let id = u16::from_le_bytes([header[2], header[3]]);
    let mut payload = vec![0u8; size as usize - 4];
    stream.read_exact(&mut payload)?;
    Ok((id, payload))
}

macro_rules! require_uring {
    () => {
        if !strandio::is_supported() {
            eprintln!("skipping: io_uring not supported on this kernel");
            return;
        }
    };
}

#[test]
fn welcome_round_trip() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut client = connect(addr);
    client.write_all(&frame(1, &[])).unwrap();

    let (id, payload) = read_frame(&mut client).unwrap();
    assert_eq!(id, 1);
    assert!(payload.is_empty());

    drop(client);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn chat_echo_matches_reference() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut client = connect(addr);
    client.write_all(&frame(3, b"hello world!")).unwrap();

    let (id, payload) = read_frame(&mut client).unwrap();
    assert_eq!(id, 103);
    assert_eq!(payload, b"[Server echo]: hello world!");
    // 4-byte header + 15-byte prefix + 12-byte message.
    assert_eq!(4 + payload.len(), 31);

    drop(client);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn player_move_produces_no_reply() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut client = connect(addr);
    client.write_all(&frame(2, &[10, 20, 30, 40])).unwrap();
    // A welcome right after: the first reply must be the welcome, proving
    // the move generated nothing.
    client.write_all(&frame(1, &[])).unwrap();

    let (id, payload) = read_frame(&mut client).unwrap();
    assert_eq!(id, 1);
    assert!(payload.is_empty());

    drop(client);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn frame_split_across_many_recvs_emits_once() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut client = connect(addr);
    let request = frame(3, b"frag");
    for byte in &request {
        client.write_all(std::slice::from_ref(byte)).unwrap();
        client.flush().unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let (id, payload) = read_frame(&mut client).unwrap();
    assert_eq!(id, 103);
    assert_eq!(payload, b"[Server echo]: frag");

    // Exactly one reply: nothing further may be buffered.
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let mut extra = [0u8; 1];
    assert!(client.read_exact(&mut extra).is_err());

    drop(client);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn two_frames_in_one_write_reply_in_order() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut client = connect(addr);
    let mut request = frame(1, &[]);
    request.extend_from_slice(&frame(3, b"second"));
    client.write_all(&request).unwrap();

    let (first_id, _) = read_frame(&mut client).unwrap();
    let (second_id, second_payload) = read_frame(&mut client).unwrap();
    assert_eq!(first_id, 1);
    assert_eq!(second_id, 103);
    assert_eq!(second_payload, b"[Server echo]: second");

    drop(client);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn undersized_frame_closes_only_the_offending_session() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut healthy = connect(addr);
    let mut offender = connect(addr);

    // size = 3 is below the 4-byte minimum.
    offender.write_all(&[3, 0, 1, 0]).unwrap();
    let mut buf = [0u8; 1];
    assert!(
        saw_close(offender.read(&mut buf)),
        "offending session must be closed"
    );

    // The other session keeps working.
    healthy.write_all(&frame(1, &[])).unwrap();
    let (id, _) = read_frame(&mut healthy).unwrap();
    assert_eq!(id, 1);

    drop(healthy);
    drop(offender);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn orderly_close_ends_the_session() {
    require_uring!();
    let (server, addr) = launch(1);

    let mut client = connect(addr);
    client.write_all(&frame(1, &[])).unwrap();
    let (id, _) = read_frame(&mut client).unwrap();
    assert_eq!(id, 1);

    // Half-close from the client; the server sees recv == 0 and tears the
    // session down, which surfaces to us as EOF.
    client.shutdown(std::net::Shutdown::Write).unwrap();
    let mut buf = [0u8; 1];
    assert!(saw_close(client.read(&mut buf)));

    drop(client);
    server.shutdown();
    server.join().unwrap();
}

#[test]
fn two_workers_share_one_port() {
    require_uring!();
    let (server, addr) = launch(2);

    let mut threads = Vec::new();
    for t in 0..8 {
        threads.push(std::thread::spawn(move || {
            for round in 0..16 {
                let mut client = connect(addr);
                let text = format!("client {t} round {round}");
                client.write_all(&frame(3, text.as_bytes())).unwrap();

                let (id, payload) = read_frame(&mut client).unwrap();
                assert_eq!(id, 103);
                let expected = format!("[Server echo]: {text}");
                assert_eq!(payload, expected.as_bytes());
            }
        }));
    }
    for thread in threads {
        thread.join().unwrap();
    }

    server.shutdown();
    server.join().unwrap();
}
