//! One worker: one thread, one ring, one buffer ring, one event loop.

use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::completion::UserData;
use crate::config::RingConfig;
use crate::error::Error;
use crate::reactor::{Driver, Handle};
use crate::task::Exec;

/// A single-threaded runtime instance. Create it on the thread that will
/// run it, spawn tasks through [`Worker::handle`], then call [`Worker::run`].
///
/// The loop parks in `submit_and_wait(1)` and processes completions in
/// kernel order; it returns once every spawned task has completed. Other
/// threads request shutdown through the [`ShutdownHandle`], which wakes the
/// loop via an eventfd read submitted like any other operation.
pub struct Worker {
    driver: Rc<RefCell<Driver>>,
    exec: Rc<Exec>,
    shutdown: Arc<AtomicBool>,
    eventfd: RawFd,
}

/// Requests shutdown of one worker from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    eventfd: RawFd,
}

impl ShutdownHandle {
    /// Flag the worker to stop and wake its event loop. In-flight
    /// operations are cancelled; tasks observe the cancellations as errors
    /// and unwind, and the loop exits once the task arena drains.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        let val: u64 = 1;
        unsafe {
            libc::write(self.eventfd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

impl Worker {
    pub fn new(config: &RingConfig) -> Result<Self, Error> {
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let driver = match Driver::new(config, eventfd) {
            Ok(d) => d,
            Err(e) => {
                unsafe {
                    libc::close(eventfd);
                }
                return Err(e);
            }
        };

        Ok(Worker {
            driver: Rc::new(RefCell::new(driver)),
            exec: Exec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            eventfd,
        })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            driver: self.driver.clone(),
            exec: self.exec.clone(),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            eventfd: self.eventfd,
        }
    }

    /// Run the event loop. Blocks until all spawned tasks have completed.
    pub fn run(&mut self) -> Result<(), Error> {
        self.arm_eventfd();

        let mut cqes: Vec<(u64, i32, u32)> = Vec::new();

        loop {
            self.exec.run_ready();

            if self.exec.is_empty() {
                break;
            }

            // A shutdown requested before the eventfd read was armed (or
            // between arms) must still cancel promptly.
            if self.shutdown.load(Ordering::Acquire) {
                let mut driver = self.driver.borrow_mut();
                driver.stop = true;
                driver.cancel_all();
            }

            match self.driver.borrow().ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }

            cqes.clear();
            self.driver.borrow_mut().ring.drain_cqes(&mut cqes);
            for &(user_data, res, flags) in &cqes {
                self.dispatch(user_data, res, flags);
            }
        }

        self.drain_stragglers();
        Ok(())
    }

    fn dispatch(&self, user_data: u64, res: i32, flags: u32) {
        let ud = UserData::from_raw(user_data);
        if ud.is_op() {
            let waker = self.driver.borrow_mut().complete_op(ud.index(), res, flags);
            // Wake outside the driver borrow; the waker only enqueues the
            // task id, the poll happens in run_ready.
            if let Some(waker) = waker {
                waker.wake();
            }
        } else if ud.is_eventfd() {
            self.on_eventfd();
        }
        // Orphan completions (cancels, drain timeouts) are observed and
        // dropped.
    }

    fn on_eventfd(&self) {
        let mut driver = self.driver.borrow_mut();
        driver.eventfd_armed = false;
        if self.shutdown.load(Ordering::Acquire) {
            driver.stop = true;
            driver.cancel_all();
            return;
        }
        drop(driver);
        self.arm_eventfd();
    }

    fn arm_eventfd(&self) {
        let mut driver = self.driver.borrow_mut();
        if driver.eventfd_armed || driver.stop {
            return;
        }
        let fd = driver.eventfd;
        let buf = driver.eventfd_buf.as_mut_ptr();
        match driver.ring.push_eventfd_read(fd, buf) {
            Ok(()) => driver.eventfd_armed = true,
            Err(e) => tracing::warn!("failed to arm eventfd read: {e}"),
        }
    }

    /// After the task arena drains, detached ops (cancelled accept guards,
    /// dropped futures) may still owe completions. Reap them, bounded by a
    /// timeout per iteration so a lost completion cannot wedge the exit.
    fn drain_stragglers(&self) {
        let ts = io_uring::types::Timespec::new().nsec(100_000_000);
        let mut cqes: Vec<(u64, i32, u32)> = Vec::new();

        for _ in 0..100 {
            {
                let driver = self.driver.borrow();
                if driver.ops.is_empty() {
                    break;
                }
            }
            if self
                .driver
                .borrow_mut()
                .ring
                .push_drain_timeout(&ts as *const _)
                .is_err()
            {
                break;
            }
            if self.driver.borrow().ring.submit_and_wait(1).is_err() {
                break;
            }
            cqes.clear();
            self.driver.borrow_mut().ring.drain_cqes(&mut cqes);
            for &(user_data, res, flags) in &cqes {
                let ud = UserData::from_raw(user_data);
                if ud.is_op() {
                    let _ = self.driver.borrow_mut().complete_op(ud.index(), res, flags);
                }
            }
        }

        let leftover = self.driver.borrow().ops.len();
        if leftover > 0 {
            tracing::warn!(leftover, "worker exited with unreaped operations");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.eventfd);
        }
    }
}
