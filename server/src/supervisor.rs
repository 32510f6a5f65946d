//! Worker supervision.
//!
//! The supervisor spawns one worker thread per configured core; every
//! worker binds the same address with SO_REUSEPORT, so the kernel spreads
//! incoming connections across them. After launch the only interaction is
//! the stop flag and the per-worker eventfd wakeup.

use std::thread::{self, JoinHandle};

use strandio::ShutdownHandle;

use crate::config::Config;
use crate::worker::run_worker;

/// A running server: worker threads plus their shutdown handles.
pub struct Server {
    workers: Vec<WorkerHandle>,
    shutdowns: Vec<ShutdownHandle>,
}

struct WorkerHandle {
    worker_id: usize,
    handle: JoinHandle<Result<(), strandio::Error>>,
}

impl Server {
    /// Spawn the configured number of workers and wait for each to either
    /// come up or fail setup. Startup succeeds as long as at least one
    /// worker is serving.
    pub fn launch(config: &Config) -> Result<Server, Box<dyn std::error::Error>> {
        let threads = config.threads();
        let pin = config.workers.pin;

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(threads);
        let mut workers = Vec::with_capacity(threads);

        for worker_id in 0..threads {
            let config = config.clone();
            let ready_tx = ready_tx.clone();

            let handle = thread::Builder::new()
                .name(format!("warden-worker-{worker_id}"))
                .spawn(move || {
                    if pin {
                        if let Err(e) = pin_to_core(worker_id) {
                            tracing::warn!(worker_id, "failed to pin worker: {e}");
                        }
                    }
                    run_worker(worker_id, &config, ready_tx)
                })?;

            workers.push(WorkerHandle { worker_id, handle });
        }
        drop(ready_tx);

        let mut shutdowns = Vec::with_capacity(threads);
        for _ in 0..threads {
            match ready_rx.recv() {
                Ok(Ok(shutdown)) => shutdowns.push(shutdown),
                Ok(Err(msg)) => tracing::error!("{msg}"),
                Err(_) => break,
            }
        }

        if shutdowns.is_empty() {
            for worker in workers {
                let _ = worker.handle.join();
            }
            return Err("all workers failed to start".into());
        }

        tracing::info!(
            workers = shutdowns.len(),
            requested = threads,
            "server launched"
        );

        Ok(Server { workers, shutdowns })
    }

    /// Request graceful shutdown of every worker.
    pub fn shutdown(&self) {
        for shutdown in &self.shutdowns {
            shutdown.shutdown();
        }
    }

    /// Join all worker threads, surfacing the first worker error.
    pub fn join(self) -> Result<(), Box<dyn std::error::Error>> {
        let mut first_err: Option<Box<dyn std::error::Error>> = None;

        for worker in self.workers {
            match worker.handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(worker_id = worker.worker_id, "worker exited with error: {e}");
                    if first_err.is_none() {
                        first_err = Some(Box::new(e));
                    }
                }
                Err(_) => {
                    tracing::error!(worker_id = worker.worker_id, "worker thread panicked");
                    if first_err.is_none() {
                        first_err = Some("worker thread panicked".into());
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Pin the current thread to a specific CPU core.
fn pin_to_core(core: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
