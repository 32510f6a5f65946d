//! strandio - per-core completion-based async I/O runtime over io_uring.
//!
//! One [`Worker`] per OS thread owns an io_uring instance, a provided
//! buffer ring, and a task arena; parallelism comes from replicating the
//! whole worker across cores, not from sharing state. Futures suspend on
//! individual ring operations and are resumed by the completions that
//! finish them.

pub mod buf_ring;
pub(crate) mod completion;
pub mod config;
pub mod error;
pub mod reactor;
pub(crate) mod ring;
pub mod socket;
pub mod task;
pub mod worker;

// Public API re-exports
pub use buf_ring::BufferGrant;
pub use config::{BufRingConfig, RingConfig};
pub use error::Error;
pub use reactor::{Handle, Splice};
pub use socket::{Incoming, TcpListener, TcpStream};
pub use task::Task;
pub use worker::{ShutdownHandle, Worker};

/// Check whether the running kernel supports the io_uring features this
/// runtime depends on (multishot accept, provided buffer rings, deferred
/// task running). Probing SendZc is a reliable 6.0+ indicator that implies
/// everything else we use.
pub fn is_supported() -> bool {
    use io_uring::{IoUring, Probe, opcode};

    match IoUring::new(8) {
        Ok(ring) => {
            let mut probe = Probe::new();
            if ring.submitter().register_probe(&mut probe).is_err() {
                return false;
            }
            probe.is_supported(opcode::SendZc::CODE)
        }
        Err(_) => false,
    }
}
