//! Single-assignment deferred results and single-flow task scheduling.
//!
//! This is the foundation layer of flowprims. A [`Deferred`] is a settlement
//! cell that is resolved or rejected exactly once and observed any number of
//! times; it is the unit of communication between the stream state machines
//! and their callers. [`spawn`] and [`run_local`] provide the cooperative
//! scheduler the state machines run on: a current-thread tokio runtime with
//! a `LocalSet`, so every reaction runs in FIFO order on one flow and shared
//! state never needs locking.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Observable settlement state of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Pending,
    Resolved,
    Rejected,
}

enum State<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
    /// A resolved value was moved out by a [`Claim`] observer.
    Taken,
}

struct Inner<T, E> {
    state: State<T, E>,
    wakers: Vec<Waker>,
}

/// A single-assignment future: resolved or rejected exactly once, observed
/// any number of times.
///
/// Handles are cheap clones sharing one settlement cell. Settling an
/// already-settled cell is a no-op, so racing terminal transitions cannot
/// double-settle a caller's pending operation.
///
/// Not `Send`; deferreds live on the single flow that [`run_local`] drives.
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> Deferred<T, E> {
    /// Create a pending deferred.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                wakers: Vec::new(),
            })),
        }
    }

    /// Create a deferred that is already resolved.
    pub fn resolved(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Resolved(value),
                wakers: Vec::new(),
            })),
        }
    }

    /// Create a deferred that is already rejected.
    pub fn rejected(reason: E) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Rejected(reason),
                wakers: Vec::new(),
            })),
        }
    }

    /// Current settlement state. A claimed value still reads as resolved.
    pub fn settlement(&self) -> Settlement {
        match self.inner.borrow().state {
            State::Pending => Settlement::Pending,
            State::Resolved(_) | State::Taken => Settlement::Resolved,
            State::Rejected(_) => Settlement::Rejected,
        }
    }

    /// True while neither resolved nor rejected.
    pub fn is_pending(&self) -> bool {
        self.settlement() == Settlement::Pending
    }

    /// Resolve the deferred. Ignored if already settled.
    pub fn resolve(&self, value: T) {
        self.settle(State::Resolved(value));
    }

    /// Reject the deferred. Ignored if already settled.
    pub fn reject(&self, reason: E) {
        self.settle(State::Rejected(reason));
    }

    fn settle(&self, state: State<T, E>) {
        let wakers = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                return;
            }
            inner.state = state;
            std::mem::take(&mut inner.wakers)
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

impl<T: Clone, E: Clone> Deferred<T, E> {
    /// A future settling with this deferred's outcome.
    ///
    /// Every call returns an independent observer; all observers see the
    /// same cloned value or reason.
    pub fn wait(&self) -> Wait<T, E> {
        Wait {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E: Clone> Deferred<T, E> {
    /// A future that moves the resolved value out instead of cloning it.
    ///
    /// At most one claim observes the value; a claim arriving after the
    /// value was already taken never settles. Rejections are still cloned,
    /// so any number of claims observe a rejection.
    pub fn claim(&self) -> Claim<T, E> {
        Claim {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Deferred::wait`]. Cloning yields another
/// independent observer of the same settlement.
pub struct Wait<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E> Clone for Wait<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone, E: Clone> Future for Wait<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Resolved(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending | State::Taken => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

/// Future returned by [`Deferred::claim`].
pub struct Claim<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
}

impl<T, E: Clone> Future for Claim<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        if matches!(inner.state, State::Resolved(_)) {
            if let State::Resolved(value) = std::mem::replace(&mut inner.state, State::Taken) {
                return Poll::Ready(Ok(value));
            }
        }
        match &inner.state {
            State::Rejected(reason) => Poll::Ready(Err(reason.clone())),
            State::Pending => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            // The value went to an earlier claim; this observer never
            // settles.
            _ => Poll::Pending,
        }
    }
}

/// Spawn a reaction onto the current flow.
///
/// Tasks run in FIFO order relative to other spawns on the same flow. Must
/// be called from within [`run_local`] (or any tokio `LocalSet` context).
pub fn spawn<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    tokio::task::spawn_local(future);
}

/// Drive a future to completion on a fresh single-flow scheduler.
///
/// Builds a current-thread tokio runtime and a `LocalSet`, so everything
/// [`spawn`]ed while `future` runs is driven on the same thread with strict
/// per-flow ordering. This is the external scheduler entry point; tests and
/// embedders call it at the boundary.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build current-thread runtime");
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(future))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn resolve_settles_once() {
        let d: Deferred<u32, &str> = Deferred::new();
        assert_eq!(d.settlement(), Settlement::Pending);
        d.resolve(1);
        d.resolve(2);
        d.reject("late");
        assert_eq!(d.settlement(), Settlement::Resolved);
        let got = run_local(d.wait());
        assert_eq!(got, Ok(1));
    }

    #[test]
    fn reject_settles_once() {
        let d: Deferred<u32, &str> = Deferred::new();
        d.reject("boom");
        d.resolve(7);
        assert_eq!(d.settlement(), Settlement::Rejected);
        assert_eq!(run_local(d.wait()), Err("boom"));
    }

    #[test]
    fn multiple_observers_see_same_outcome() {
        run_local(async {
            let d: Deferred<String, String> = Deferred::new();
            let a = d.wait();
            let b = d.wait();
            let setter = d.clone();
            spawn(async move {
                setter.resolve("done".to_string());
            });
            assert_eq!(a.await.as_deref(), Ok("done"));
            assert_eq!(b.await.as_deref(), Ok("done"));
        });
    }

    #[test]
    fn wait_after_settlement_is_immediate() {
        let d: Deferred<u8, u8> = Deferred::resolved(9);
        assert_eq!(run_local(d.wait()), Ok(9));
        let r: Deferred<u8, u8> = Deferred::rejected(3);
        assert_eq!(run_local(r.wait()), Err(3));
    }

    #[test]
    fn spawned_tasks_run_in_fifo_order() {
        run_local(async {
            let order = Rc::new(RefCell::new(Vec::new()));
            for i in 0..4 {
                let order = Rc::clone(&order);
                spawn(async move {
                    order.borrow_mut().push(i);
                });
            }
            tokio::task::yield_now().await;
            assert_eq!(*order.borrow(), vec![0, 1, 2, 3]);
        });
    }

    #[test]
    fn claim_moves_the_value_out() {
        run_local(async {
            struct NotClone(u32);
            let d: Deferred<NotClone, ()> = Deferred::new();
            let claim = d.claim();
            d.resolve(NotClone(5));
            assert_eq!(d.settlement(), Settlement::Resolved);
            match claim.await {
                Ok(NotClone(v)) => assert_eq!(v, 5),
                Err(()) => panic!("claim rejected"),
            }
            // The cell still reads as resolved after the take.
            assert_eq!(d.settlement(), Settlement::Resolved);
        });
    }

    #[test]
    fn claim_observes_rejection() {
        run_local(async {
            let d: Deferred<u32, &str> = Deferred::rejected("no");
            assert_eq!(d.claim().await, Err("no"));
            assert_eq!(d.claim().await, Err("no"));
        });
    }

    #[test]
    fn pending_wait_wakes_on_settle() {
        run_local(async {
            let d: Deferred<u32, ()> = Deferred::new();
            let woke = Rc::new(Cell::new(false));
            let flag = Rc::clone(&woke);
            let wait = d.wait();
            spawn(async move {
                let _ = wait.await;
                flag.set(true);
            });
            tokio::task::yield_now().await;
            assert!(!woke.get());
            d.resolve(1);
            tokio::task::yield_now().await;
            assert!(woke.get());
        });
    }
}
