use crate::{Error, Result};
use std::{cell::RefCell, rc::Rc, thread};

/// The LIFO stack of open immediate scopes, shared between a manager
/// and the guards it hands out.
#[derive(Clone, Default)]
pub(crate) struct ScopeStack {
    inner: Rc<RefCell<StackInner>>,
}

#[derive(Default)]
struct StackInner {
    open: Vec<u64>,
    next_token: u64,
}

impl ScopeStack {
    /// Opens a scope and returns its guard.
    pub(crate) fn push(&self) -> ImmediateGuard {
        let mut inner = self.inner.borrow_mut();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.open.push(token);
        ImmediateGuard {
            stack: self.clone(),
            token,
            ended: false,
        }
    }

    /// True while any scope is open.
    pub(crate) fn is_active(&self) -> bool {
        !self.inner.borrow().open.is_empty()
    }

    /// Closes the scope identified by `token`. The token must be the
    /// innermost open scope; on misuse the token is still retired so
    /// immediate mode cannot leak, but the call reports the error.
    fn pop(&self, token: u64) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.open.last() == Some(&token) {
            inner.open.pop();
            Ok(())
        } else {
            inner.open.retain(|open| *open != token);
            Err(Error::ScopeMisuse)
        }
    }
}

/// An open immediate scope.
///
/// While any guard is live, every lookup issued through the owning
/// [`BatchLookup`](crate::BatchLookup) executes its bulk fetch
/// synchronously and returns an already-settled future; no keys are
/// buffered. Scopes nest, and must be closed innermost-first.
///
/// Dropping the guard closes the scope. Use [`end`](Self::end) instead
/// to observe the [`Error::ScopeMisuse`] case; a plain out-of-order
/// drop panics, since that is a structural bug in the caller.
#[must_use = "the scope closes when the guard is dropped"]
pub struct ImmediateGuard {
    stack: ScopeStack,
    token: u64,
    ended: bool,
}

impl ImmediateGuard {
    /// Explicitly closes the scope, failing with [`Error::ScopeMisuse`]
    /// if this guard is not the innermost open scope.
    pub fn end(mut self) -> Result<()> {
        self.ended = true;
        self.stack.pop(self.token)
    }
}

impl Drop for ImmediateGuard {
    fn drop(&mut self) {
        if self.ended {
            return;
        }
        if self.stack.pop(self.token).is_err() && !thread::panicking() {
            panic!("immediate scope dropped out of LIFO order");
        }
    }
}
