//! Display fence: reference-counted one-shot event coordination.
//!
//! A [`Fence`] owns an event and a FIFO queue of armed references. Each
//! time the event fires, exactly one armed reference is consumed: its
//! release chain is signalled, the callback sink is told, and the wait is
//! re-registered while armed references remain. One event signal, one
//! firing, regardless of how many references are armed.
//!
//! Fence state is single-thread-owned (`Rc`-based, so not `Send`); the
//! surrounding system serialises fence operations with the dispatcher's
//! delivery thread, and the types enforce that it has to.

mod local;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

pub use local::{LocalDispatcher, LocalEvent};

/// Bitmask of event signal state.
pub type Signals = u32;

/// The signal bit a fence raises and watches.
pub const EVENT_SIGNALED: Signals = 1 << 0;

/// Edge-level event object backing a fence.
pub trait Event {
    /// Atomically clear `clear_mask`, then set `set_mask`.
    fn signal(&self, clear_mask: Signals, set_mask: Signals);
    /// Currently asserted signal bits.
    fn peek(&self) -> Signals;
}

/// One-shot asynchronous wait registration.
///
/// A successful registration must eventually invoke [`Fence::on_ready`]
/// on the dispatcher's thread once the trigger bits are observed on the
/// fence's event; a registration whose fence is gone by then simply
/// lapses.
pub trait WaitDispatcher {
    fn begin_wait(&self, fence: Weak<Fence>, trigger: Signals) -> Result<(), DispatchError>;
}

/// Sink for fence lifecycle notifications, invoked synchronously from the
/// fence core.
pub trait FenceCallback {
    /// An armed reference fired.
    fn on_fence_fired(&self, fired: &Rc<FenceReference>);
    /// A reference was dropped. The sink is expected to drive
    /// [`Fence::on_ref_dead`] and release its own fence handle on the
    /// last death.
    fn on_ref_for_fence_dead(&self, fence: &Rc<Fence>);
}

/// Wait registration failure, surfaced verbatim out of
/// [`FenceReference::start_ready_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher is no longer accepting registrations.
    Shutdown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => f.write_str("wait dispatcher is shut down"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A one-shot event coordination object for sequencing buffer consumption.
pub struct Fence {
    weak_self: Weak<Fence>,
    cb: Weak<dyn FenceCallback>,
    dispatcher: Rc<dyn WaitDispatcher>,
    id: u64,
    event: Box<dyn Event>,
    ref_count: Cell<usize>,
    cur_ref: RefCell<Option<Rc<FenceReference>>>,
    armed_refs: RefCell<VecDeque<Rc<FenceReference>>>,
    wait_pending: Cell<bool>,
}

impl Fence {
    pub fn new(
        cb: Weak<dyn FenceCallback>,
        dispatcher: Rc<dyn WaitDispatcher>,
        id: u64,
        event: Box<dyn Event>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            cb,
            dispatcher,
            id,
            event,
            ref_count: Cell::new(0),
            cur_ref: RefCell::new(None),
            armed_refs: RefCell::new(VecDeque::new()),
            wait_pending: Cell::new(false),
        })
    }

    /// Stable identifier of this fence.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying event.
    #[must_use]
    pub fn event(&self) -> &dyn Event {
        &*self.event
    }

    /// Allocate a fresh current reference, replacing the previous one in
    /// the current slot only; an already-armed predecessor keeps its place
    /// in the armed queue, and the new reference starts unarmed.
    ///
    /// The bool reports allocation failure. The global allocator aborts
    /// rather than unwinding on exhaustion, so in practice the failed
    /// branch is unreachable; callers keep the check for the contract.
    pub fn create_ref(&self) -> bool {
        let fence = self.weak_self.upgrade().expect("fence is always Rc-owned");
        let reference = FenceReference::new(fence);
        self.ref_count.set(self.ref_count.get() + 1);
        *self.cur_ref.borrow_mut() = Some(reference);
        true
    }

    /// Drop the fence's own handle to the current reference. External
    /// holders are unaffected.
    pub fn clear_ref(&self) {
        *self.cur_ref.borrow_mut() = None;
    }

    /// A new strong handle to the current reference, if any.
    #[must_use]
    pub fn get_reference(&self) -> Option<Rc<FenceReference>> {
        self.cur_ref.borrow().clone()
    }

    /// Raise the fired bit on the underlying event.
    pub fn signal(&self) {
        self.event.signal(0, EVENT_SIGNALED);
    }

    /// Bookkeeping for a dead reference, driven by the callback sink;
    /// returns true when the last reference is gone and the fence is
    /// eligible for destruction.
    pub fn on_ref_dead(&self) -> bool {
        let remaining = self
            .ref_count
            .get()
            .checked_sub(1)
            .expect("on_ref_dead without a live reference");
        self.ref_count.set(remaining);
        remaining == 0
    }

    /// Dispatcher delivery: one event firing consumes exactly one armed
    /// reference, in arming order.
    pub fn on_ready(&self, observed: Signals) {
        assert!(
            observed & EVENT_SIGNALED != 0,
            "ready wait completed without the fired bit"
        );
        self.wait_pending.set(false);

        // Edge re-arm: drop the bit before running consumers, so a
        // release chain that signals back into this fence is not lost.
        self.event.signal(EVENT_SIGNALED, 0);

        let fired = self
            .armed_refs
            .borrow_mut()
            .pop_front()
            .expect("ready wait fired with no armed reference");
        fired.on_ready();
        if let Some(cb) = self.cb.upgrade() {
            cb.on_fence_fired(&fired);
        }

        if !self.armed_refs.borrow().is_empty() {
            // A registration failure here only happens when the
            // dispatcher is going away, and then nothing will signal the
            // event again either.
            let _ = self.begin_ready_wait();
        }
    }

    fn on_ref_armed(&self, reference: Rc<FenceReference>) -> Result<(), DispatchError> {
        if self.armed_refs.borrow().is_empty() {
            self.begin_ready_wait()?;
        }
        self.armed_refs.borrow_mut().push_back(reference);
        Ok(())
    }

    fn on_ref_disarmed(&self, reference: &FenceReference) {
        let mut armed = self.armed_refs.borrow_mut();
        if let Some(position) = armed
            .iter()
            .position(|armed_ref| std::ptr::eq(Rc::as_ptr(armed_ref), reference))
        {
            armed.remove(position);
        }
    }

    fn begin_ready_wait(&self) -> Result<(), DispatchError> {
        if self.wait_pending.get() {
            return Ok(());
        }
        self.dispatcher
            .begin_wait(self.weak_self.clone(), EVENT_SIGNALED)?;
        self.wait_pending.set(true);
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        debug_assert!(self.armed_refs.borrow().is_empty());
        debug_assert_eq!(self.ref_count.get(), 0);
    }
}

/// A strong, shareable handle onto a fence.
///
/// A reference sits in at most one fence's armed queue at a time; while
/// armed, the parent fence holds it strongly. Firing delivers the release
/// chain (up to two other references signalled immediately) before the
/// sink hears about it.
pub struct FenceReference {
    weak_self: Weak<FenceReference>,
    fence: Rc<Fence>,
    release_fence1: RefCell<Option<Rc<FenceReference>>>,
    release_fence2: RefCell<Option<Rc<FenceReference>>>,
}

impl FenceReference {
    fn new(fence: Rc<Fence>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            fence,
            release_fence1: RefCell::new(None),
            release_fence2: RefCell::new(None),
        })
    }

    /// The owning fence.
    #[must_use]
    pub fn fence(&self) -> &Rc<Fence> {
        &self.fence
    }

    /// Arm this reference: queue it for the next event firing. If it is
    /// the first armed reference, the asynchronous wait is registered, and
    /// a registration failure is surfaced unchanged.
    pub fn start_ready_wait(&self) -> Result<(), DispatchError> {
        let me = self
            .weak_self
            .upgrade()
            .expect("reference is always Rc-owned");
        self.fence.on_ref_armed(me)
    }

    /// Disarm this reference; a no-op if it is not currently armed.
    pub fn reset_ready_wait(&self) {
        self.fence.on_ref_disarmed(self);
    }

    /// Install up to two references to release when this one fires,
    /// replacing any previous chain.
    pub fn set_immediate_release(
        &self,
        first: Option<Rc<FenceReference>>,
        second: Option<Rc<FenceReference>>,
    ) {
        *self.release_fence1.borrow_mut() = first;
        *self.release_fence2.borrow_mut() = second;
    }

    /// Raise the fired bit on the owning fence's event.
    pub fn signal(&self) {
        self.fence.signal();
    }

    fn on_ready(&self) {
        if let Some(chained) = self.release_fence1.borrow_mut().take() {
            chained.signal();
        }
        if let Some(chained) = self.release_fence2.borrow_mut().take() {
            chained.signal();
        }
    }
}

impl Drop for FenceReference {
    fn drop(&mut self) {
        if let Some(cb) = self.fence.cb.upgrade() {
            cb.on_ref_for_fence_dead(&self.fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        fired: RefCell<Vec<Rc<FenceReference>>>,
        dead_notices: Cell<usize>,
        arm_on_fire: RefCell<Option<Rc<FenceReference>>>,
    }

    impl FenceCallback for RecordingSink {
        fn on_fence_fired(&self, fired: &Rc<FenceReference>) {
            self.fired.borrow_mut().push(Rc::clone(fired));
            if let Some(queued) = self.arm_on_fire.borrow_mut().take() {
                queued.start_ready_wait().unwrap();
            }
        }

        fn on_ref_for_fence_dead(&self, fence: &Rc<Fence>) {
            self.dead_notices.set(self.dead_notices.get() + 1);
            fence.on_ref_dead();
        }
    }

    struct Rig {
        sink: Rc<RecordingSink>,
        dispatcher: Rc<LocalDispatcher>,
        fence: Rc<Fence>,
    }

    fn new_rig(id: u64) -> Rig {
        let sink = Rc::new(RecordingSink::default());
        let dispatcher = LocalDispatcher::new();
        let sink_cb: Rc<dyn FenceCallback> = sink.clone();
        let cb: Weak<dyn FenceCallback> = Rc::downgrade(&sink_cb);
        let dispatcher_dyn: Rc<dyn WaitDispatcher> = dispatcher.clone();
        let fence = Fence::new(cb, dispatcher_dyn, id, Box::new(LocalEvent::new()));
        Rig {
            sink,
            dispatcher,
            fence,
        }
    }

    fn armed_ref(rig: &Rig) -> Rc<FenceReference> {
        assert!(rig.fence.create_ref());
        let reference = rig.fence.get_reference().unwrap();
        reference.start_ready_wait().unwrap();
        reference
    }

    /// Release the rig's own reference handles while the sink is still
    /// alive, so every reference death is seen and counted before the
    /// fence's destructor checks run. Locals drop after this returns,
    /// which is still before the rig itself.
    fn teardown(rig: &Rig) {
        rig.sink.fired.borrow_mut().clear();
        rig.fence.clear_ref();
    }

    #[test]
    fn armed_references_fire_in_arming_order() {
        let rig = new_rig(1);
        let r1 = armed_ref(&rig);
        let r2 = armed_ref(&rig);
        let r3 = armed_ref(&rig);

        for expected in [&r1, &r2, &r3] {
            rig.fence.signal();
            assert_eq!(rig.dispatcher.dispatch_ready(), 1);
            let fired = rig.sink.fired.borrow();
            assert!(Rc::ptr_eq(fired.last().unwrap(), expected));
        }
        assert_eq!(rig.sink.fired.borrow().len(), 3);

        // One more signal with nothing armed: no registration is pending,
        // so nothing fires.
        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 0);
        teardown(&rig);
    }

    #[test]
    fn one_signal_fires_exactly_one_reference() {
        let rig = new_rig(2);
        let _r1 = armed_ref(&rig);
        let _r2 = armed_ref(&rig);

        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);
        assert_eq!(rig.sink.fired.borrow().len(), 1);
        // The second reference stays armed until its own signal.
        assert_eq!(rig.dispatcher.dispatch_ready(), 0);

        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);
        teardown(&rig);
    }

    #[test]
    fn release_chain_targets_are_signalled_before_the_fired_callback_returns() {
        let rig = new_rig(3);
        let chain_a = new_rig(31);
        let chain_b = new_rig(32);

        assert!(chain_a.fence.create_ref());
        assert!(chain_b.fence.create_ref());
        let target_a = chain_a.fence.get_reference().unwrap();
        let target_b = chain_b.fence.get_reference().unwrap();

        let r1 = armed_ref(&rig);
        r1.set_immediate_release(Some(target_a), Some(target_b));

        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);

        assert_eq!(chain_a.fence.event().peek() & EVENT_SIGNALED, EVENT_SIGNALED);
        assert_eq!(chain_b.fence.event().peek() & EVENT_SIGNALED, EVENT_SIGNALED);

        teardown(&rig);
        teardown(&chain_a);
        teardown(&chain_b);
    }

    #[test]
    fn arming_from_the_fired_callback_keeps_the_wait_registered() {
        let rig = new_rig(4);
        let _r1 = armed_ref(&rig);

        assert!(rig.fence.create_ref());
        let r2 = rig.fence.get_reference().unwrap();
        *rig.sink.arm_on_fire.borrow_mut() = Some(Rc::clone(&r2));

        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);

        // R2 was armed inside the callback; the next signal fires it.
        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);
        assert!(Rc::ptr_eq(rig.sink.fired.borrow().last().unwrap(), &r2));
        teardown(&rig);
    }

    #[test]
    fn disarming_removes_a_reference_from_the_queue() {
        let rig = new_rig(5);
        let r1 = armed_ref(&rig);
        let r2 = armed_ref(&rig);

        r1.reset_ready_wait();
        // Disarming an unarmed reference is a no-op.
        r1.reset_ready_wait();

        rig.fence.signal();
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);
        assert!(Rc::ptr_eq(rig.sink.fired.borrow().last().unwrap(), &r2));
        teardown(&rig);
    }

    #[test]
    fn signal_raised_before_arming_is_absorbed_by_one_firing() {
        let rig = new_rig(6);
        rig.fence.signal();

        let _r1 = armed_ref(&rig);
        assert_eq!(rig.dispatcher.dispatch_ready(), 1);
        // The bit was cleared by the firing; nothing further is pending.
        assert_eq!(rig.fence.event().peek() & EVENT_SIGNALED, 0);
        assert_eq!(rig.dispatcher.dispatch_ready(), 0);
        teardown(&rig);
    }

    #[test]
    fn dead_references_are_reported_and_counted() {
        let rig = new_rig(7);
        assert!(rig.fence.create_ref());
        let first = rig.fence.get_reference().unwrap();
        assert!(rig.fence.create_ref());

        // The current slot moved on the second create_ref, so the
        // external handle is the first reference's last owner.
        drop(first);
        assert_eq!(rig.sink.dead_notices.get(), 1);
        // And the current slot is the second reference's last owner.
        rig.fence.clear_ref();
        assert_eq!(rig.sink.dead_notices.get(), 2);
    }

    #[test]
    fn shut_down_dispatcher_fails_arming_verbatim() {
        let rig = new_rig(8);
        assert!(rig.fence.create_ref());
        let reference = rig.fence.get_reference().unwrap();
        rig.dispatcher.shut_down();
        assert_eq!(reference.start_ready_wait(), Err(DispatchError::Shutdown));
        teardown(&rig);
    }

    #[test]
    fn get_reference_tracks_the_current_slot() {
        let rig = new_rig(9);
        assert!(rig.fence.get_reference().is_none());
        assert!(rig.fence.create_ref());
        let first = rig.fence.get_reference().unwrap();
        assert!(rig.fence.create_ref());
        let second = rig.fence.get_reference().unwrap();
        assert!(!Rc::ptr_eq(&first, &second));
        rig.fence.clear_ref();
        assert!(rig.fence.get_reference().is_none());
        teardown(&rig);
    }
}
