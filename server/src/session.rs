//! Per-connection sessions.
//!
//! A session owns its stream and framer and runs as one task on the worker
//! that accepted the connection. Each received buffer is framed and
//! dispatched synchronously and returned to the kernel ring before the
//! session suspends again; replies queued by the dispatcher are then sent
//! with loop-until-complete semantics.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use protocol_frame::Framer;
use strandio::TcpStream;

use crate::dispatch::{Dispatch, Outbound};
use crate::metrics;

/// Per-worker registry of live sessions. Single-threaded, like everything
/// else a worker owns.
pub struct SessionRegistry {
    next_id: Cell<u64>,
    active: Cell<usize>,
}

impl SessionRegistry {
    pub fn new() -> Rc<Self> {
        Rc::new(SessionRegistry {
            next_id: Cell::new(0),
            active: Cell::new(0),
        })
    }

    fn register(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.active.set(self.active.get() + 1);
        id
    }

    fn release(&self) {
        self.active.set(self.active.get() - 1);
    }

    /// Number of sessions currently running on this worker.
    pub fn active(&self) -> usize {
        self.active.get()
    }
}

pub struct Session<D> {
    stream: TcpStream,
    framer: Framer,
    dispatcher: Rc<D>,
    registry: Weak<SessionRegistry>,
    id: u64,
}

impl<D: Dispatch + 'static> Session<D> {
    pub fn new(stream: TcpStream, dispatcher: Rc<D>, registry: &Rc<SessionRegistry>) -> Self {
        Session {
            stream,
            framer: Framer::new(),
            dispatcher,
            registry: Rc::downgrade(registry),
            id: registry.register(),
        }
    }

    fn on_connected(&self) {
        metrics::CONNECTIONS_ACTIVE.increment();
        let peer = self.stream.peer_addr().ok();
        tracing::debug!(session = self.id, ?peer, "session connected");
    }

    fn on_disconnected(&self) {
        metrics::CONNECTIONS_ACTIVE.decrement();
        if let Some(registry) = self.registry.upgrade() {
            registry.release();
        }
        tracing::debug!(session = self.id, "session disconnected");
    }

    /// Drive the session until the peer closes, an I/O error surfaces, or
    /// the byte stream violates the protocol.
    pub async fn run(mut self) {
        self.on_connected();

        loop {
            let grant = match self.stream.recv().await {
                Ok(Some(grant)) => grant,
                Ok(None) => break,
                Err(e) => {
                    if !e.is_cancelled() {
                        tracing::debug!(session = self.id, "recv failed: {e}");
                    }
                    break;
                }
            };

            metrics::BYTES_RECEIVED.add(grant.len() as u64);

            let mut out = Outbound::new();
            let fed = {
                let dispatcher = &self.dispatcher;
                self.framer.feed(&grant, |id, payload| {
                    metrics::PACKETS_DISPATCHED.increment();
                    dispatcher.dispatch(id, payload, &mut out);
                })
            };
            // The grant must go back to the kernel ring before the next
            // suspension point.
            drop(grant);

            if let Err(e) = fed {
                metrics::PROTOCOL_ERRORS.increment();
                tracing::warn!(session = self.id, "protocol error: {e}");
                break;
            }
            if out.overflowed() {
                metrics::PROTOCOL_ERRORS.increment();
                tracing::warn!(session = self.id, "outbound overflow, closing session");
                break;
            }

            let mut send_failed = false;
            for frame in out.frames() {
                match self.stream.send_all(frame).await {
                    Ok(n) => {
                        metrics::BYTES_SENT.add(n as u64);
                    }
                    Err(e) => {
                        if !e.is_cancelled() {
                            tracing::debug!(session = self.id, "send failed: {e}");
                        }
                        send_failed = true;
                        break;
                    }
                }
            }
            if send_failed {
                break;
            }
        }

        self.on_disconnected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_active_count() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.active(), 0);

        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.active(), 2);

        registry.release();
        assert_eq!(registry.active(), 1);
        registry.release();
        assert_eq!(registry.active(), 0);
    }
}
