//! In-process event and dispatcher collaborators.
//!
//! `LocalEvent` and `LocalDispatcher` are the default stand-ins for the
//! kernel event object and asynchronous wait dispatcher a fence is wired
//! to in a real display stack. They keep the fence core fully exercisable
//! in a single thread: signal the event, then pump the dispatcher.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use super::{DispatchError, Event, Fence, Signals, WaitDispatcher};

/// A user-space event: a bare signal bitmask with clear-then-set
/// semantics.
#[derive(Default)]
pub struct LocalEvent {
    bits: Cell<Signals>,
}

impl LocalEvent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Event for LocalEvent {
    fn signal(&self, clear_mask: Signals, set_mask: Signals) {
        self.bits.set((self.bits.get() & !clear_mask) | set_mask);
    }

    fn peek(&self) -> Signals {
        self.bits.get()
    }
}

struct PendingWait {
    fence: Weak<Fence>,
    trigger: Signals,
}

/// Single-threaded wait dispatcher.
///
/// Registrations are one-shot. [`dispatch_ready`](Self::dispatch_ready)
/// delivers a completion for each registration whose trigger bits are
/// observed on its fence's event; delivered callbacks may register
/// further waits re-entrantly. A signal raised before registration is
/// simply observed at the next dispatch.
#[derive(Default)]
pub struct LocalDispatcher {
    pending: RefCell<VecDeque<PendingWait>>,
    shut_down: Cell<bool>,
}

impl LocalDispatcher {
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Refuse all future registrations.
    pub fn shut_down(&self) {
        self.shut_down.set(true);
    }

    /// Deliver completions for every ready registration; returns how many
    /// fired.
    pub fn dispatch_ready(&self) -> usize {
        let waits: Vec<PendingWait> = self.pending.borrow_mut().drain(..).collect();
        let mut kept = Vec::new();
        let mut fired = 0;
        for wait in waits {
            // A registration whose fence is gone lapses silently.
            let Some(fence) = wait.fence.upgrade() else {
                continue;
            };
            let observed = fence.event().peek();
            if observed & wait.trigger != 0 {
                fence.on_ready(observed);
                fired += 1;
            } else {
                kept.push(wait);
            }
        }
        // Undelivered registrations go back in front of any added
        // re-entrantly during delivery.
        let mut pending = self.pending.borrow_mut();
        for wait in kept.into_iter().rev() {
            pending.push_front(wait);
        }
        fired
    }
}

impl WaitDispatcher for LocalDispatcher {
    fn begin_wait(&self, fence: Weak<Fence>, trigger: Signals) -> Result<(), DispatchError> {
        if self.shut_down.get() {
            return Err(DispatchError::Shutdown);
        }
        self.pending
            .borrow_mut()
            .push_back(PendingWait { fence, trigger });
        Ok(())
    }
}
