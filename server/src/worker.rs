//! One game-server worker: an independent runtime, listener, and accept
//! loop on its own OS thread.

use std::rc::Rc;

use strandio::{Handle, ShutdownHandle, TcpListener, Worker};

use crate::config::Config;
use crate::dispatch::GameDispatch;
use crate::metrics;
use crate::session::{Session, SessionRegistry};

/// Initialize and run one worker. Sends its shutdown handle (or the setup
/// failure) through `ready_tx` before entering the event loop, so the
/// supervisor can tell a dead worker from a busy one.
pub fn run_worker(
    worker_id: usize,
    config: &Config,
    ready_tx: crossbeam_channel::Sender<Result<ShutdownHandle, String>>,
) -> Result<(), strandio::Error> {
    let mut worker = match Worker::new(&config.ring_config()) {
        Ok(worker) => worker,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("worker {worker_id}: runtime setup: {e}")));
            return Err(e);
        }
    };

    let handle = worker.handle();
    let listener = match TcpListener::bind(&handle, &config.listener.host, config.listener.port) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("worker {worker_id}: bind: {e}")));
            return Err(e);
        }
    };

    match listener.local_addr() {
        Ok(addr) => tracing::info!(worker_id, %addr, "worker listening"),
        Err(_) => tracing::info!(worker_id, "worker listening"),
    }

    let _ = ready_tx.send(Ok(worker.shutdown_handle()));

    handle
        .spawn(accept_loop(handle.clone(), listener))
        .detach();

    worker.run()
}

/// Accept connections until the guard is cancelled by shutdown. Each
/// connection gets a session task; failed accept completions are counted
/// and ignored, the multishot submission keeps producing.
async fn accept_loop(handle: Handle, listener: TcpListener) {
    let registry = SessionRegistry::new();
    let dispatcher = Rc::new(GameDispatch);

    let mut incoming = listener.incoming();
    while let Some(next) = incoming.next().await {
        match next {
            Ok(stream) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let session = Session::new(stream, dispatcher.clone(), &registry);
                handle.spawn(session.run()).detach();
            }
            Err(e) => {
                metrics::ACCEPT_FAILURES.increment();
                tracing::warn!("accept failed: {e}");
            }
        }
    }

    tracing::debug!(active = registry.active(), "accept loop stopped");
}
