//! Cooperative cancellation signals for computation bodies.
//!
//! Every running task carries one signal. The kernel fires it when the
//! task's snapshot is superseded, when its inputs go dirty again, or when
//! nobody observes the outputs anymore. Bodies are expected to check the
//! signal at await boundaries; the scope proxy does so for all inputs.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tokio::sync::Notify;

struct AbortInner {
    aborted: Cell<bool>,
    notify: Notify,
    children: RefCell<Vec<Weak<AbortInner>>>,
}

impl AbortInner {
    fn abort(self: &Rc<Self>) {
        if self.aborted.replace(true) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(&mut *self.children.borrow_mut());
        for child in children {
            if let Some(child) = child.upgrade() {
                child.abort();
            }
        }
    }
}

/// Shared cancellation flag with parent-to-child cascade.
///
/// Cloning shares the same flag; [`AbortSignal::child`] creates a linked
/// signal that fires when either the parent fires or it is aborted itself.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<AbortInner>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(AbortInner {
                aborted: Cell::new(false),
                notify: Notify::new(),
                children: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A signal that fires when `self` fires, and can also fire on its own.
    pub fn child(&self) -> AbortSignal {
        let child = AbortSignal::new();
        if self.is_aborted() {
            child.inner.aborted.set(true);
        } else {
            self.inner
                .children
                .borrow_mut()
                .push(Rc::downgrade(&child.inner));
        }
        child
    }

    /// Request cancellation. Idempotent; cascades into children.
    pub fn abort(&self) {
        self.inner.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.get()
    }

    /// Resolves once the signal has fired. Resolves immediately if it
    /// already has.
    pub async fn cancelled(&self) {
        loop {
            if self.is_aborted() {
                return;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .finish()
    }
}
