//! Per-worker driver state and the runtime handle.
//!
//! The `Driver` owns everything a worker's event loop touches: the ring, the
//! in-flight op registry, the provided buffer ring, and the eventfd wakeup.
//! It is reached through `Shared` (an `Rc<RefCell<..>>`) cloned into sockets
//! and I/O futures; all access happens on the worker thread.

use std::cell::RefCell;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use io_uring::cqueue;

use crate::buf_ring::BufRing;
use crate::completion::{Cqe, OpKind, OpPayload, OpTable, UserData};
use crate::config::RingConfig;
use crate::error::Error;
use crate::ring::Ring;
use crate::task::{Exec, Task};

pub(crate) type Shared = Rc<RefCell<Driver>>;

pub(crate) struct Driver {
    pub(crate) ring: Ring,
    pub(crate) ops: OpTable,
    pub(crate) buf_ring: BufRing,
    /// Max bytes a single buffer-select recv may read.
    pub(crate) recv_len: u32,
    /// Set once shutdown has been observed on the eventfd.
    pub(crate) stop: bool,
    /// Whether the blanket cancel of in-flight ops has been issued.
    pub(crate) cancel_issued: bool,
    pub(crate) eventfd: RawFd,
    pub(crate) eventfd_buf: [u8; 8],
    pub(crate) eventfd_armed: bool,
}

impl Driver {
    pub fn new(config: &RingConfig, eventfd: RawFd) -> Result<Self, Error> {
        if !config.recv_buffers.ring_entries.is_power_of_two() {
            return Err(Error::RingSetup(format!(
                "ring_entries {} is not a power of two",
                config.recv_buffers.ring_entries
            )));
        }

        let ring = Ring::setup(config).map_err(|e| Error::RingSetup(e.to_string()))?;
        let buf_ring = BufRing::new(
            config.recv_buffers.ring_entries,
            config.recv_buffers.buffer_size as usize,
        )?;
        ring.register_buf_ring(
            buf_ring.ring_addr(),
            buf_ring.entries(),
            config.recv_buffers.bgid,
        )
        .map_err(|e| Error::BufferRegistration(e.to_string()))?;

        Ok(Driver {
            ring,
            ops: OpTable::new(config.queue_depth as usize),
            buf_ring,
            recv_len: config.recv_buffers.buffer_size,
            stop: false,
            cancel_issued: false,
            eventfd,
            eventfd_buf: [0u8; 8],
            eventfd_armed: false,
        })
    }

    /// Record one completion against its op slot. Returns the waker to fire,
    /// if any; detached ops release their resources instead.
    pub fn complete_op(&mut self, id: usize, res: i32, flags: u32) -> Option<Waker> {
        let more = cqueue::more(flags);
        let (detached, finished, waker) = {
            let op = self.ops.get_mut(id)?;
            let finished = match &mut op.payload {
                OpPayload::Single(slot) => {
                    *slot = Some(Cqe { res, flags });
                    true
                }
                OpPayload::Multi { queue, terminated } => {
                    queue.push_back(Cqe { res, flags });
                    if !more {
                        *terminated = true;
                    }
                    *terminated
                }
            };
            (op.detached, finished, op.waker.take())
        };

        if detached {
            self.flush_detached(id, finished);
            return None;
        }
        waker
    }

    /// Detach an op whose owning future was dropped. If it already finished,
    /// its resources are released now; otherwise a cancel is submitted and
    /// the straggler completion does the cleanup.
    pub fn detach_op(&mut self, id: usize) {
        let finished = match self.ops.get_mut(id) {
            Some(op) => {
                op.detached = true;
                op.waker = None;
                match &op.payload {
                    OpPayload::Single(slot) => slot.is_some(),
                    OpPayload::Multi { terminated, .. } => *terminated,
                }
            }
            None => return,
        };

        if finished {
            self.flush_detached(id, true);
        } else if let Err(e) = self.ring.push_cancel(UserData::op(id)) {
            tracing::warn!("failed to cancel detached op {id}: {e}");
        }
    }

    /// Issue a cancel for every in-flight op. Called once at shutdown; the
    /// cancelled completions unwind the tasks that were waiting on them.
    pub fn cancel_all(&mut self) {
        if self.cancel_issued {
            return;
        }
        self.cancel_issued = true;
        for id in self.ops.ids() {
            if let Err(e) = self.ring.push_cancel(UserData::op(id)) {
                tracing::warn!("failed to cancel op {id}: {e}");
            }
        }
    }

    /// Release kernel-side resources carried by completions of a detached op.
    fn flush_detached(&mut self, id: usize, finished: bool) {
        let (kind, cqes) = {
            let Some(op) = self.ops.get_mut(id) else {
                return;
            };
            let cqes: Vec<Cqe> = match &mut op.payload {
                OpPayload::Single(slot) => slot.take().into_iter().collect(),
                OpPayload::Multi { queue, .. } => queue.drain(..).collect(),
            };
            (op.kind, cqes)
        };
        for cqe in cqes {
            self.release_cqe(kind, cqe);
        }
        if finished {
            self.ops.discard(id);
        }
    }

    fn release_cqe(&mut self, kind: OpKind, cqe: Cqe) {
        match kind {
            OpKind::Recv if cqe.res > 0 => {
                if let Some(bid) = cqueue::buffer_select(cqe.flags) {
                    self.buf_ring.restore(bid);
                }
            }
            OpKind::Accept if cqe.res >= 0 => unsafe {
                libc::close(cqe.res);
            },
            _ => {}
        }
    }

    /// Close the fds of accept completions still queued on a multi-shot op.
    pub fn close_pending_accepts(&mut self, id: usize) {
        while let Some(cqe) = self.ops.pop_multi(id) {
            if cqe.res >= 0 {
                unsafe {
                    libc::close(cqe.res);
                }
            }
        }
    }
}

/// Cloneable handle to a worker's runtime. Spawns tasks and submits raw
/// operations; cheap to clone (two `Rc`s).
#[derive(Clone)]
pub struct Handle {
    pub(crate) driver: Shared,
    pub(crate) exec: Rc<Exec>,
}

impl Handle {
    /// Spawn a task. The future starts eagerly: it is polled once before
    /// `spawn` returns, and runs to completion even if the returned handle
    /// is dropped.
    pub fn spawn<T, F>(&self, fut: F) -> Task<T>
    where
        T: 'static,
        F: Future<Output = T> + 'static,
    {
        let (task_fut, task) = Task::new_pair(fut);
        self.exec.spawn_boxed(Box::pin(task_fut));
        task
    }

    /// Move up to `len` bytes between two descriptors (at least one side a
    /// pipe) without copying through userspace.
    pub fn splice(&self, fd_in: RawFd, fd_out: RawFd, len: u32) -> Splice {
        Splice {
            handle: self.clone(),
            fd_in,
            fd_out,
            len,
            op: None,
        }
    }
}

/// Awaitable splice operation. Resolves to the number of bytes moved.
pub struct Splice {
    handle: Handle,
    fd_in: RawFd,
    fd_out: RawFd,
    len: u32,
    op: Option<usize>,
}

impl Future for Splice {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut driver = this.handle.driver.borrow_mut();

        match this.op {
            None => {
                if driver.stop {
                    return Poll::Ready(Err(Error::cancelled()));
                }
                let id = driver.ops.insert_single(OpKind::Splice);
                if let Err(e) =
                    driver
                        .ring
                        .push_splice(this.fd_in, this.fd_out, this.len, UserData::op(id))
                {
                    driver.ops.discard(id);
                    return Poll::Ready(Err(e.into()));
                }
                driver.ops.set_waker(id, cx.waker());
                this.op = Some(id);
                Poll::Pending
            }
            Some(id) => match driver.ops.try_take_single(id) {
                None => {
                    driver.ops.set_waker(id, cx.waker());
                    Poll::Pending
                }
                Some(cqe) => {
                    this.op = None;
                    if cqe.res < 0 {
                        Poll::Ready(Err(Error::Io(std::io::Error::from_raw_os_error(-cqe.res))))
                    } else {
                        Poll::Ready(Ok(cqe.res as usize))
                    }
                }
            },
        }
    }
}

impl Drop for Splice {
    fn drop(&mut self) {
        if let Some(id) = self.op {
            self.handle.driver.borrow_mut().detach_op(id);
        }
    }
}
