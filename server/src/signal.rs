//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install a handler for SIGINT and SIGTERM.
///
/// Returns a flag that flips to `true` on the first signal. A second
/// signal forces an immediate exit for the case where draining hangs.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received, draining workers");
    })
    .expect("failed to install signal handler");

    shutdown
}
