//! Task arena and join handles.
//!
//! Spawned futures are owned by the worker's task arena, not by the handle
//! returned to the caller: a suspended task stays alive until it runs to
//! completion, so submission state living in its frame can never dangle.
//! The `Task` handle is an observer; dropping it detaches the task.
//!
//! Spawning is eager: the future is polled once before `spawn` returns, so
//! a task that never suspends is already complete when the caller sees it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use slab::Slab;

type BoxedFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Per-worker executor state: the task arena and the FIFO ready queue.
pub(crate) struct Exec {
    tasks: RefCell<Slab<Option<BoxedFuture>>>,
    ready: RefCell<VecDeque<usize>>,
}

impl Exec {
    pub fn new() -> Rc<Self> {
        Rc::new(Exec {
            tasks: RefCell::new(Slab::new()),
            ready: RefCell::new(VecDeque::new()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Insert and eagerly run a wrapped future. Returns its arena id.
    pub fn spawn_boxed(self: &Rc<Self>, fut: BoxedFuture) -> usize {
        let id = self.tasks.borrow_mut().insert(Some(fut));
        self.run_task(id);
        id
    }

    /// Poll one task. The future is taken out of the arena for the duration
    /// of the poll so the task may re-entrantly spawn or wake.
    pub fn run_task(self: &Rc<Self>, id: usize) {
        let mut fut = {
            let mut tasks = self.tasks.borrow_mut();
            match tasks.get_mut(id) {
                Some(slot) => match slot.take() {
                    Some(fut) => fut,
                    // Already being polled higher up the stack.
                    None => return,
                },
                None => return,
            }
        };

        let waker = task_waker(self, id);
        let mut cx = Context::from_waker(&waker);

        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                self.tasks.borrow_mut().remove(id);
            }
            Poll::Pending => {
                if let Some(slot) = self.tasks.borrow_mut().get_mut(id) {
                    *slot = Some(fut);
                }
            }
        }
    }

    /// Drain the ready queue, polling woken tasks in wake order.
    pub fn run_ready(self: &Rc<Self>) {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some(id) => self.run_task(id),
                None => return,
            }
        }
    }

    fn schedule(&self, id: usize) {
        self.ready.borrow_mut().push_back(id);
    }
}

// --- waker -----------------------------------------------------------------
//
// The waker holds a Weak reference to the executor plus the task id; waking
// pushes the id onto the ready queue. The runtime is strictly
// single-threaded, so the Rc-based waker is never cloned, woken, or dropped
// from another thread.

struct WakeHook {
    exec: Weak<Exec>,
    id: usize,
}

impl WakeHook {
    fn schedule(&self) {
        if let Some(exec) = self.exec.upgrade() {
            exec.schedule(self.id);
        }
    }
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

fn raw_waker(hook: Rc<WakeHook>) -> RawWaker {
    RawWaker::new(Rc::into_raw(hook) as *const (), &WAKER_VTABLE)
}

unsafe fn waker_clone(p: *const ()) -> RawWaker {
    let hook = ManuallyDrop::new(unsafe { Rc::from_raw(p as *const WakeHook) });
    raw_waker(Rc::clone(&hook))
}

unsafe fn waker_wake(p: *const ()) {
    let hook = unsafe { Rc::from_raw(p as *const WakeHook) };
    hook.schedule();
}

unsafe fn waker_wake_by_ref(p: *const ()) {
    let hook = ManuallyDrop::new(unsafe { Rc::from_raw(p as *const WakeHook) });
    hook.schedule();
}

unsafe fn waker_drop(p: *const ()) {
    drop(unsafe { Rc::from_raw(p as *const WakeHook) });
}

fn task_waker(exec: &Rc<Exec>, id: usize) -> Waker {
    let hook = Rc::new(WakeHook {
        exec: Rc::downgrade(exec),
        id,
    });
    unsafe { Waker::from_raw(raw_waker(hook)) }
}

// --- join handle -----------------------------------------------------------

pub(crate) struct JoinState<T> {
    result: Option<std::thread::Result<T>>,
    waker: Option<Waker>,
    detached: bool,
}

/// Wrapper that runs a spawned future to completion, transporting its value
/// or panic into the join state.
pub(crate) struct TaskFuture<T, F> {
    inner: F,
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T, F: Future<Output = T>> Future for TaskFuture<T, F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        // Safety: inner is structurally pinned; state is never moved out.
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.inner) };

        match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                finish(&this.state, Ok(value));
                Poll::Ready(())
            }
            Err(payload) => {
                if this.state.borrow().detached {
                    // Nobody can observe the failure. There is no supervisor
                    // to receive it, so it is fatal.
                    tracing::error!("panic in detached task");
                    std::process::abort();
                }
                finish(&this.state, Err(payload));
                Poll::Ready(())
            }
        }
    }
}

fn finish<T>(state: &Rc<RefCell<JoinState<T>>>, result: std::thread::Result<T>) {
    let mut state = state.borrow_mut();
    state.result = Some(result);
    if let Some(waker) = state.waker.take() {
        waker.wake();
    }
}

/// Handle to a spawned task.
///
/// `done()` reports completion; awaiting resumes the caller when the task
/// finishes; `join()` consumes the handle and re-raises a stored panic.
/// Dropping the handle detaches the task (the runtime still drives it); a
/// panic in a detached task aborts the process.
pub struct Task<T> {
    state: Rc<RefCell<JoinState<T>>>,
}

impl<T: 'static> Task<T> {
    pub(crate) fn new_pair<F>(fut: F) -> (TaskFuture<T, F>, Task<T>)
    where
        F: Future<Output = T>,
    {
        let state = Rc::new(RefCell::new(JoinState {
            result: None,
            waker: None,
            detached: false,
        }));
        let task_fut = TaskFuture {
            inner: fut,
            state: state.clone(),
        };
        (task_fut, Task { state })
    }

    /// Whether the task has run to completion (or panicked).
    pub fn done(&self) -> bool {
        self.state.borrow().result.is_some()
    }

    /// Take the result of a completed task, re-raising its panic.
    ///
    /// Panics if the task has not completed; use `done()` or `.await` first.
    pub fn join(self) -> T {
        let result = self
            .state
            .borrow_mut()
            .result
            .take()
            .expect("join() on incomplete task");
        match result {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Explicitly fire-and-forget this task.
    pub fn detach(self) {}
}

impl<T> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.borrow_mut();
        match state.result.take() {
            Some(Ok(value)) => Poll::Ready(value),
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.detached = true;
        if let Some(Err(_)) = state.result.take() {
            // The task already failed and the failure was never observed.
            drop(state);
            tracing::error!("dropped task with unobserved panic");
            std::process::abort();
        }
    }
}
