//! TCP socket types driven by the worker's ring.
//!
//! Both flavors own their file descriptor and close it on drop. The listener
//! hands out a reusable multishot-accept guard; the stream exposes a
//! buffer-select recv and a loop-until-complete send.

use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use io_uring::cqueue;

use crate::buf_ring::BufferGrant;
use crate::completion::{OpKind, UserData};
use crate::error::Error;
use crate::reactor::Handle;

const LISTEN_BACKLOG: i32 = 128;

/// A listening TCP socket bound with SO_REUSEADDR and SO_REUSEPORT, so every
/// worker can bind the same address and the kernel spreads connections
/// across them.
pub struct TcpListener {
    handle: Handle,
    fd: RawFd,
}

impl TcpListener {
    /// Resolve `host:port`, bind, and listen with a backlog of 128.
    pub fn bind(handle: &Handle, host: &str, port: u16) -> Result<Self, Error> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::InvalidAddress(format!("{host}:{port}: {e}")))?
            .collect();

        let mut last_err = Error::InvalidAddress(format!("{host}:{port}: no addresses"));
        for addr in addrs {
            match create_listener(addr, LISTEN_BACKLOG) {
                Ok(fd) => {
                    return Ok(TcpListener {
                        handle: handle.clone(),
                        fd,
                    });
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_addr(&storage)
    }

    /// Reusable accept guard. The first await submits a multishot accept;
    /// each subsequent await yields the next connection in kernel FIFO
    /// order. Dropping the guard cancels the submission.
    pub fn incoming(&self) -> Incoming<'_> {
        Incoming {
            listener: self,
            op: None,
            done: false,
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Multishot accept guard returned by [`TcpListener::incoming`].
pub struct Incoming<'a> {
    listener: &'a TcpListener,
    op: Option<usize>,
    done: bool,
}

impl<'a> Incoming<'a> {
    /// Await the next accepted connection.
    ///
    /// `None` means the accept stream ended (the guard was cancelled, e.g.
    /// by worker shutdown). A failing accept completion yields `Some(Err)`;
    /// the multishot submission keeps producing afterwards, so the caller
    /// may log and continue. If the kernel retires the submission without a
    /// cancel, the guard re-arms transparently.
    pub fn next(&mut self) -> Next<'_, 'a> {
        Next { incoming: self }
    }
}

impl Drop for Incoming<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.op {
            let mut driver = self.listener.handle.driver.borrow_mut();
            driver.close_pending_accepts(id);
            driver.detach_op(id);
        }
    }
}

pub struct Next<'i, 'a> {
    incoming: &'i mut Incoming<'a>,
}

impl Future for Next<'_, '_> {
    type Output = Option<Result<TcpStream, Error>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inc = &mut *self.get_mut().incoming;
        let handle = inc.listener.handle.clone();
        let mut driver = handle.driver.borrow_mut();

        loop {
            let Some(id) = inc.op else {
                if inc.done || driver.stop {
                    return Poll::Ready(None);
                }
                let id = driver.ops.insert_multi(OpKind::Accept);
                if let Err(e) = driver
                    .ring
                    .push_accept_multi(inc.listener.fd, UserData::op(id))
                {
                    driver.ops.discard(id);
                    return Poll::Ready(Some(Err(e.into())));
                }
                driver.ops.set_waker(id, cx.waker());
                inc.op = Some(id);
                return Poll::Pending;
            };

            match driver.ops.pop_multi(id) {
                Some(cqe) if cqe.res >= 0 => {
                    drop(driver);
                    return Poll::Ready(Some(Ok(TcpStream::new(handle, cqe.res))));
                }
                Some(cqe) => {
                    let errno = -cqe.res;
                    if errno == libc::ECANCELED {
                        // Shutdown path: connections accepted after the
                        // cancel raced it are closed, not delivered.
                        driver.close_pending_accepts(id);
                        driver.ops.discard(id);
                        inc.op = None;
                        inc.done = true;
                        return Poll::Ready(None);
                    }
                    return Poll::Ready(Some(Err(Error::Io(io::Error::from_raw_os_error(errno)))));
                }
                None => {
                    if driver.ops.multi_terminated(id) {
                        // Kernel retired the multishot without a cancel;
                        // re-arm on the next loop iteration.
                        driver.ops.discard(id);
                        inc.op = None;
                        continue;
                    }
                    driver.ops.set_waker(id, cx.waker());
                    return Poll::Pending;
                }
            }
        }
    }
}

/// A connected TCP stream owned by one worker.
pub struct TcpStream {
    handle: Handle,
    fd: RawFd,
}

impl TcpStream {
    pub(crate) fn new(handle: Handle, fd: RawFd) -> Self {
        TcpStream { handle, fd }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to_addr(&storage)
    }

    /// Await the next chunk of received bytes.
    ///
    /// The kernel selects a buffer from the worker's provided ring; on
    /// success the grant exposes it. `Ok(None)` is an orderly close. The
    /// grant must be dropped before the next `recv` on this stream.
    pub fn recv(&self) -> Recv<'_> {
        Recv {
            stream: self,
            op: None,
        }
    }

    /// Send all of `buf`, submitting as many send operations as it takes.
    /// Resolves to the total byte count once everything is written.
    pub async fn send_all(&self, buf: &[u8]) -> Result<usize, Error> {
        let mut sent = 0;
        while sent < buf.len() {
            let n = SendOp {
                stream: self,
                buf: &buf[sent..],
                op: None,
            }
            .await?;
            if n == 0 {
                return Err(Error::Io(io::ErrorKind::WriteZero.into()));
            }
            sent += n;
        }
        Ok(sent)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Awaitable buffer-select recv.
pub struct Recv<'a> {
    stream: &'a TcpStream,
    op: Option<usize>,
}

impl Future for Recv<'_> {
    type Output = Result<Option<BufferGrant>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut driver = this.stream.handle.driver.borrow_mut();

        match this.op {
            None => {
                // A worker that is shutting down submits nothing new;
                // pretending the op was cancelled unwinds the session.
                if driver.stop {
                    return Poll::Ready(Err(Error::cancelled()));
                }
                let id = driver.ops.insert_single(OpKind::Recv);
                let len = driver.recv_len;
                if let Err(e) = driver
                    .ring
                    .push_recv_select(this.stream.fd, len, UserData::op(id))
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
                    if cqe.res == 0 {
                        return Poll::Ready(Ok(None));
                    }
                    if cqe.res < 0 {
                        return Poll::Ready(Err(Error::Io(io::Error::from_raw_os_error(
                            -cqe.res,
                        ))));
                    }
                    let Some(bid) = cqueue::buffer_select(cqe.flags) else {
                        return Poll::Ready(Err(Error::Io(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "recv completion carried no buffer id",
                        ))));
                    };
                    let (ptr, len) = driver.buf_ring.borrow(bid, cqe.res as usize);
                    drop(driver);
                    let shared = this.stream.handle.driver.clone();
                    Poll::Ready(Ok(Some(BufferGrant::new(shared, bid, ptr, len))))
                }
            },
        }
    }
}

impl Drop for Recv<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.op {
            self.stream.handle.driver.borrow_mut().detach_op(id);
        }
    }
}

/// One send submission; may write fewer bytes than requested.
struct SendOp<'a> {
    stream: &'a TcpStream,
    buf: &'a [u8],
    op: Option<usize>,
}

impl Future for SendOp<'_> {
    type Output = Result<usize, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut driver = this.stream.handle.driver.borrow_mut();

        match this.op {
            None => {
                if driver.stop {
                    return Poll::Ready(Err(Error::cancelled()));
                }
                let id = driver.ops.insert_single(OpKind::Send);
                if let Err(e) = driver.ring.push_send(
                    this.stream.fd,
                    this.buf.as_ptr(),
                    this.buf.len() as u32,
                    UserData::op(id),
                ) {
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
                        Poll::Ready(Err(Error::Io(io::Error::from_raw_os_error(-cqe.res))))
                    } else {
                        Poll::Ready(Ok(cqe.res as usize))
                    }
                }
            },
        }
    }
}

impl Drop for SendOp<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.op {
            self.stream.handle.driver.borrow_mut().detach_op(id);
        }
    }
}

/// Create a bound, listening TCP socket with SO_REUSEADDR and SO_REUSEPORT.
fn create_listener(addr: SocketAddr, backlog: i32) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    let optval: libc::c_int = 1;
    for opt in [libc::SO_REUSEADDR, libc::SO_REUSEPORT] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
            }
            return Err(Error::Io(err));
        }
    }

    // Stack-allocated sockaddr_storage, cast for bind().
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = match addr {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };

    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(Error::Io(err));
    }

    Ok(fd)
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            Ok(SocketAddr::V4(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sa = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
                std::net::Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}
