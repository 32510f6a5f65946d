//! Runtime integration tests: task semantics, accept/recv/send round trips,
//! splice, and shutdown. Skipped on kernels without the required io_uring
//! features.

use std::cell::Cell;
use std::future::Future;
use std::io::{Read, Write};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::thread;

use strandio::{BufRingConfig, RingConfig, TcpListener, Worker};

fn test_config() -> RingConfig {
    RingConfig {
        queue_depth: 128,
        recv_buffers: BufRingConfig {
            ring_entries: 64,
            buffer_size: 1024,
            bgid: 1,
        },
    }
}

/// Pends exactly once, waking itself so the executor polls it again.
struct YieldOnce {
    yielded: bool,
}

impl YieldOnce {
    fn new() -> Self {
        YieldOnce { yielded: false }
    }
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
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
fn spawn_is_eager() {
    require_uring!();

    let mut worker = Worker::new(&test_config()).unwrap();
    let handle = worker.handle();

    let started = Rc::new(Cell::new(false));
    let flag = started.clone();
    let task = handle.spawn(async move {
        flag.set(true);
        41
    });

    // The future ran to completion inside spawn, before run().
    assert!(started.get());
    assert!(task.done());

    worker.run().unwrap();
    assert_eq!(task.join(), 41);
}

#[test]
fn awaiting_a_task_resumes_the_caller() {
    require_uring!();

    let mut worker = Worker::new(&test_config()).unwrap();
    let handle = worker.handle();

    let child = handle.spawn(async {
        YieldOnce::new().await;
        21
    });
    assert!(!child.done());

    let parent = handle.spawn(async move { child.await * 2 });
    assert!(!parent.done());

    worker.run().unwrap();
    assert_eq!(parent.join(), 42);
}

#[test]
#[should_panic(expected = "boom")]
fn join_reraises_task_panic() {
    if !strandio::is_supported() {
        // Keep the expected panic observable even when skipping.
        panic!("boom (skipped: io_uring not supported)");
    }

    let worker = Worker::new(&test_config()).unwrap();
    let task = worker.handle().spawn(async {
        panic!("boom");
    });
    assert!(task.done());
    task.join();
}

#[test]
fn echo_round_trip_and_shutdown() {
    require_uring!();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        let mut worker = Worker::new(&test_config()).unwrap();
        let handle = worker.handle();

        let listener = TcpListener::bind(&handle, "127.0.0.1", 0).unwrap();
        addr_tx.send(listener.local_addr().unwrap()).unwrap();
        shutdown_tx.send(worker.shutdown_handle()).unwrap();

        let conn_handle = handle.clone();
        handle
            .spawn(async move {
                let mut incoming = listener.incoming();
                while let Some(next) = incoming.next().await {
                    let Ok(stream) = next else { continue };
                    conn_handle
                        .spawn(async move {
                            loop {
                                match stream.recv().await {
                                    Ok(Some(grant)) => {
                                        let data = grant.to_vec();
                                        drop(grant);
                                        if stream.send_all(&data).await.is_err() {
                                            break;
                                        }
                                    }
                                    // Orderly close or error (incl. shutdown
                                    // cancellation) ends the session.
                                    _ => break,
                                }
                            }
                        })
                        .detach();
                }
            })
            .detach();

        worker.run().unwrap();
    });

    let addr = addr_rx.recv().unwrap();
    let shutdown = shutdown_rx.recv().unwrap();

    // Sequential connections through the same multishot accept guard.
    for round in 0..3 {
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let msg = format!("ping pong {round}");
        client.write_all(msg.as_bytes()).unwrap();

        let mut buf = vec![0u8; msg.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(buf, msg.as_bytes());
    }

    shutdown.shutdown();
    server.join().unwrap();
}

#[test]
fn recv_zero_is_orderly_close() {
    require_uring!();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (shutdown_tx, shutdown_rx) = mpsc::channel();

    let server = thread::spawn(move || {
        let mut worker = Worker::new(&test_config()).unwrap();
        let handle = worker.handle();

        let listener = TcpListener::bind(&handle, "127.0.0.1", 0).unwrap();
        addr_tx.send(listener.local_addr().unwrap()).unwrap();
        shutdown_tx.send(worker.shutdown_handle()).unwrap();

        let task = handle.spawn(async move {
            let mut incoming = listener.incoming();
            let stream = incoming.next().await.unwrap().unwrap();
            match stream.recv().await {
                Ok(None) => true,
                _ => false,
            }
        });

        worker.run().unwrap();
        task.join()
    });

    let addr = addr_rx.recv().unwrap();
    let shutdown = shutdown_rx.recv().unwrap();

    let client = std::net::TcpStream::connect(addr).unwrap();
    drop(client);

    shutdown.shutdown();
    assert!(server.join().unwrap(), "recv of 0 bytes must report EOF");
}

#[test]
fn splice_moves_bytes_between_pipes() {
    require_uring!();

    let mut forward = [0i32; 2];
    let mut backward = [0i32; 2];
    unsafe {
        assert_eq!(libc::pipe(forward.as_mut_ptr()), 0);
        assert_eq!(libc::pipe(backward.as_mut_ptr()), 0);
    }

    let payload = b"spliced";
    unsafe {
        let n = libc::write(
            forward[1],
            payload.as_ptr() as *const libc::c_void,
            payload.len(),
        );
        assert_eq!(n, payload.len() as isize);
    }

    let mut worker = Worker::new(&test_config()).unwrap();
    let handle = worker.handle();
    let task = handle.spawn(handle.splice(forward[0], backward[1], payload.len() as u32));
    worker.run().unwrap();
    assert_eq!(task.join().unwrap(), payload.len());

    let mut out = vec![0u8; payload.len()];
    unsafe {
        let n = libc::read(
            backward[0],
            out.as_mut_ptr() as *mut libc::c_void,
            out.len(),
        );
        assert_eq!(n, payload.len() as isize);
    }
    assert_eq!(out, payload);

    for fd in [forward[0], forward[1], backward[0], backward[1]] {
        unsafe {
            libc::close(fd);
        }
    }
}
