use crate::{Error, Result};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::{cell::RefCell, mem, rc::Rc};

/// A one-shot, multi-consumer completion cell.
///
/// Every key buffered in a batch slot waits on the slot's current
/// promise; flushing the slot settles it exactly once, with either the
/// batch result map or the bulk fetch error. Any number of
/// [`PromiseFuture`]s may be outstanding against the same promise, and
/// a future obtained after settlement completes on its first poll.
pub(crate) struct BatchPromise<T> {
    state: Rc<RefCell<State<T>>>,
}

enum State<T> {
    Pending { wakers: Vec<Waker> },
    Fulfilled(T),
    Failed(Error),
}

impl<T> Clone for BatchPromise<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone> BatchPromise<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Pending { wakers: Vec::new() })),
        }
    }

    /// Settles the promise with a value.
    ///
    /// # Panics
    /// Panics if the promise was already settled. Settling twice is a
    /// bug in the caller: each flush installs a fresh promise before
    /// the previous one is resolved.
    pub(crate) fn fulfill(&self, value: T) {
        self.settle(State::Fulfilled(value));
    }

    /// Settles the promise with an error. Same single-settle contract
    /// as [`Self::fulfill`].
    pub(crate) fn fail(&self, error: Error) {
        self.settle(State::Failed(error));
    }

    fn settle(&self, next: State<T>) {
        let wakers = {
            let mut state = self.state.borrow_mut();
            let State::Pending { wakers } = &mut *state else {
                panic!("batch promise settled twice");
            };
            let wakers = mem::take(wakers);
            *state = next;
            wakers
        };
        // Wake after releasing the borrow: a woken task may immediately
        // poll its future, which re-borrows the state.
        for waker in wakers {
            waker.wake();
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        !matches!(&*self.state.borrow(), State::Pending { .. })
    }

    /// Returns a future resolving to the settled value or error.
    pub(crate) fn wait(&self) -> PromiseFuture<T> {
        PromiseFuture {
            state: self.state.clone(),
        }
    }
}

/// A future over a [`BatchPromise`]. Many may await the same promise.
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub(crate) struct PromiseFuture<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Unpin for PromiseFuture<T> {}

impl<T: Clone> Future for PromiseFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self.state.borrow_mut() {
            State::Pending { wakers } => {
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Failed(error) => Poll::Ready(Err(error.clone())),
        }
    }
}
