use std::io;
use std::os::fd::RawFd;

use io_uring::types::Fd;
use io_uring::{IoUring, opcode, squeue};

use crate::completion::UserData;
use crate::config::RingConfig;

/// Wrapper around IoUring providing high-level SQE submission helpers.
pub(crate) struct Ring {
    ring: IoUring,
    /// Buffer group ID for buffer-select recv.
    bgid: u16,
}

impl Ring {
    /// Create and configure the io_uring instance.
    pub fn setup(config: &RingConfig) -> io::Result<Self> {
        let cq_entries = config
            .queue_depth
            .checked_mul(4)
            .unwrap_or(config.queue_depth);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();
        builder.setup_defer_taskrun();

        let ring = builder.build(config.queue_depth)?;

        Ok(Ring {
            ring,
            bgid: config.recv_buffers.bgid,
        })
    }

    /// Register the provided buffer ring with the kernel.
    pub fn register_buf_ring(&self, ring_addr: u64, entries: u16, bgid: u16) -> io::Result<()> {
        // Safety: ring_addr points to memory that outlives the registration.
        unsafe {
            self.ring
                .submitter()
                .register_buf_ring_with_flags(ring_addr, entries, bgid, 0)?;
        }
        Ok(())
    }

    /// Submit a multishot accept. One CQE per incoming connection until the
    /// request is cancelled or the kernel drops the MORE flag.
    pub fn push_accept_multi(&mut self, fd: RawFd, user_data: UserData) -> io::Result<()> {
        let entry = opcode::AcceptMulti::new(Fd(fd))
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a recv with buffer select. The kernel picks a buffer from the
    /// registered group and reports its id in the CQE flags.
    pub fn push_recv_select(&mut self, fd: RawFd, len: u32, user_data: UserData) -> io::Result<()> {
        let entry = opcode::Recv::new(Fd(fd), std::ptr::null_mut(), len)
            .buf_group(self.bgid)
            .build()
            .flags(squeue::Flags::BUFFER_SELECT)
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a send. The data must remain valid until the CQE arrives.
    pub fn push_send(
        &mut self,
        fd: RawFd,
        ptr: *const u8,
        len: u32,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Send::new(Fd(fd), ptr, len)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a splice between two descriptors (at least one side a pipe).
    pub fn push_splice(
        &mut self,
        fd_in: RawFd,
        fd_out: RawFd,
        len: u32,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Splice::new(Fd(fd_in), -1, Fd(fd_out), -1, len)
            .flags(libc::SPLICE_F_MORE)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an async cancel targeting a previously submitted user_data.
    /// The cancel's own completion is orphan-tagged; nothing waits on it.
    pub fn push_cancel(&mut self, target: UserData) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(UserData::orphan().raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an eventfd read (8 bytes). Used as the cross-thread wakeup.
    pub fn push_eventfd_read(&mut self, eventfd: RawFd, buf: *mut u8) -> io::Result<()> {
        let entry = opcode::Read::new(Fd(eventfd), buf, 8)
            .build()
            .user_data(UserData::eventfd().raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a timeout CQE used to bound the post-shutdown drain.
    pub fn push_drain_timeout(&mut self, ts: *const io_uring::types::Timespec) -> io::Result<()> {
        let entry = opcode::Timeout::new(ts)
            .build()
            .user_data(UserData::orphan().raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit all pending SQEs and wait for at least `min_complete` CQEs.
    /// This is the event loop's only blocking call.
    pub fn submit_and_wait(&self, min_complete: usize) -> io::Result<usize> {
        self.ring.submitter().submit_and_wait(min_complete)
    }

    /// Drain the completion queue into `out` as (user_data, res, flags).
    pub fn drain_cqes(&mut self, out: &mut Vec<(u64, i32, u32)>) {
        let cq = self.ring.completion();
        for cqe in cq {
            out.push((cqe.user_data(), cqe.result(), cqe.flags()));
        }
    }

    /// Push an SQE to the submission queue.
    ///
    /// If the SQ is full, submit once to drain it and retry; a second failure
    /// is surfaced to the caller.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the operation.
    unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::other("SQ still full after submit"))?;
            }
        }
        Ok(())
    }
}
