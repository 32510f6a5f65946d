//! Integration tests for graceful shutdown.

use std::io::Read;
use std::net::TcpStream;
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

macro_rules! require_uring {
    () => {
        if !strandio::is_supported() {
            eprintln!("skipping: io_uring not supported on this kernel");
            return;
        }
    };
}

#[test]
fn shutdown_with_no_connections() {
    require_uring!();

    let port = get_available_port();
    let server = Server::launch(&test_config(2, port)).unwrap();

    server.shutdown();
    server.join().unwrap();
}

#[test]
fn shutdown_drains_idle_connections() {
    require_uring!();

    let port = get_available_port();
    let server = Server::launch(&test_config(1, port)).unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    server.shutdown();
    server.join().unwrap();

    // The cancelled session closed its socket; the client observes EOF or a
    // reset, never a hang.
    let mut buf = [0u8; 1];
    let closed = match client.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(
            e.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
    };
    assert!(closed);
}

#[test]
fn launch_fails_when_no_worker_can_bind() {
    require_uring!();

    // Occupy the port with an exclusive (non-SO_REUSEPORT) listener so
    // every worker fails setup.
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();

    let result = Server::launch(&test_config(2, port));
    assert!(result.is_err());
}
