//! FIFO operation serializer guarding single-owner state against re-entrant access.
//!
//! Contexts run on one logical thread, so the only hazard is an operation synchronously calling
//! back into the same state (for example from an eviction hook). Such calls are queued and run
//! strictly in submission order once the operation in progress has finished.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt,
    rc::Rc,
};

use tracing::trace;

type Operation<S> = Box<dyn FnOnce(&mut S)>;

/// Result slot for a submitted operation; filled once the operation has run.
pub struct Ticket<R> {
    slot: Rc<RefCell<Option<R>>>,
}

impl<R> Ticket<R> {
    fn pending() -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
        }
    }

    fn fulfil(&self, value: R) {
        *self.slot.borrow_mut() = Some(value);
    }

    /// Returns whether the operation has run and its result is still unclaimed.
    pub fn is_ready(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Claims the result, leaving the ticket empty.
    pub fn take(&self) -> Option<R> {
        self.slot.borrow_mut().take()
    }
}

impl<R> Clone for Ticket<R> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<R> fmt::Debug for Ticket<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct InProgress<'a>(&'a Cell<bool>);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Owns a piece of state and applies operations to it one at a time, in FIFO order.
pub struct OperationSerializer<S> {
    state: RefCell<S>,
    in_progress: Cell<bool>,
    queue: RefCell<VecDeque<Operation<S>>>,
}

impl<S: 'static> OperationSerializer<S> {
    /// Wraps `state`.
    pub fn new(state: S) -> Self {
        Self {
            state: RefCell::new(state),
            in_progress: Cell::new(false),
            queue: RefCell::new(VecDeque::new()),
        }
    }

    /// Submits `operation`.
    ///
    /// When idle, the operation (and anything it enqueues) runs before this call returns and the
    /// ticket is ready. When called from inside another operation, it is queued behind the work
    /// already pending and the ticket fills once the queue reaches it.
    pub fn submit<R: 'static>(&self, operation: impl FnOnce(&mut S) -> R + 'static) -> Ticket<R> {
        let ticket = Ticket::pending();
        let slot = ticket.clone();
        self.queue
            .borrow_mut()
            .push_back(Box::new(move |state: &mut S| slot.fulfil(operation(state))));

        if self.in_progress.get() {
            trace!(queued = self.queued(), "deferring re-entrant operation");
            return ticket;
        }
        self.drain();
        ticket
    }

    /// Returns whether an operation is currently running.
    pub fn is_busy(&self) -> bool {
        self.in_progress.get()
    }

    /// Returns the number of operations waiting behind the running one.
    pub fn queued(&self) -> usize {
        self.queue.borrow().len()
    }

    fn drain(&self) {
        self.in_progress.set(true);
        let _in_progress = InProgress(&self.in_progress);
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(operation) = next else {
                break;
            };
            let mut state = self.state.borrow_mut();
            operation(&mut *state);
        }
    }
}

impl<S> fmt::Debug for OperationSerializer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSerializer")
            .field("in_progress", &self.in_progress.get())
            .field("queued", &self.queue.borrow().len())
            .finish()
    }
}
