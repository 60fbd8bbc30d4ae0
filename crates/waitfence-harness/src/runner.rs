//! Scenario execution engine.
//!
//! Runs a [`ScenarioSpec`] against the real condvar core with one OS
//! thread per waiter. Queue order is made observable by logging each
//! waiter id while it still holds the caller mutex, immediately before
//! `timed_wait`; since the wait enqueues before releasing that mutex, the
//! log order is exactly the condvar's queue order.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use waitfence_core::condvar::{Condvar, FutexMutex, MutexOps, WaitError};
use waitfence_core::fence::{
    Fence, FenceCallback, FenceReference, LocalDispatcher, LocalEvent, WaitDispatcher,
};
use waitfence_core::futex;

use crate::fixtures::ScenarioSpec;

/// Observable outcome of one scenario run.
#[derive(Debug, Clone, Default)]
pub struct ScenarioOutcome {
    /// Waiter ids in condvar queue order.
    pub enqueue_order: Vec<usize>,
    /// Waiter ids in the order they returned from a signalled wait,
    /// truncated to the waiters the scenario's batches actually claimed.
    pub wake_order: Vec<usize>,
    /// Waiter ids released by the runner's final drain broadcast rather
    /// than by a scenario batch.
    pub drained: Vec<usize>,
    /// Waiter ids that timed out.
    pub timed_out: Vec<usize>,
    /// BadState returns (zero with the futex mutex).
    pub bad_state: usize,
}

struct Shared {
    cv: Condvar,
    mutex: FutexMutex,
    enqueue_log: Mutex<Vec<usize>>,
    wake_log: Mutex<Vec<usize>>,
    timeout_log: Mutex<Vec<usize>>,
    bad_state: AtomicUsize,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cv: Condvar::new(),
            mutex: FutexMutex::new(),
            enqueue_log: Mutex::new(Vec::new()),
            wake_log: Mutex::new(Vec::new()),
            timeout_log: Mutex::new(Vec::new()),
            bad_state: AtomicUsize::new(0),
        })
    }
}

/// How many waiters the scenario's signal batches claim when nothing
/// times out.
#[must_use]
pub fn expected_wakes(spec: &ScenarioSpec) -> usize {
    let mut remaining = spec.waiters;
    let mut woken = 0;
    for &batch in &spec.signal_batches {
        let take = if batch < 0 {
            remaining
        } else {
            (batch as usize).min(remaining)
        };
        woken += take;
        remaining -= take;
    }
    woken
}

/// Execute one scenario run.
pub fn run_scenario(spec: &ScenarioSpec) -> ScenarioOutcome {
    let shared = Shared::new();
    let deadline = spec
        .deadline_ns
        .map_or(futex::DEADLINE_INFINITE, futex::deadline_after);

    let mut handles = Vec::new();
    for id in 0..spec.waiters {
        let shared = Arc::clone(&shared);
        handles.push(thread::spawn(move || {
            shared.mutex.lock().expect("futex mutex lock cannot fail");
            shared.enqueue_log.lock().push(id);
            match shared.cv.timed_wait(&shared.mutex, deadline) {
                Ok(()) => {
                    shared.wake_log.lock().push(id);
                    shared.mutex.unlock();
                }
                Err(WaitError::TimedOut) => {
                    shared.timeout_log.lock().push(id);
                    shared.mutex.unlock();
                }
                Err(WaitError::BadState { .. }) => {
                    shared.bad_state.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    // Holding the mutex while the count is complete guarantees the last
    // waiter has finished queueing on the condvar.
    loop {
        shared.mutex.lock().expect("futex mutex lock cannot fail");
        if shared.enqueue_log.lock().len() == spec.waiters {
            break;
        }
        shared.mutex.unlock();
        thread::sleep(Duration::from_millis(1));
    }
    for &batch in &spec.signal_batches {
        shared.cv.signal(batch);
    }
    shared.mutex.unlock();

    let expected = expected_wakes(spec);
    let settle_limit = Instant::now() + Duration::from_secs(10);
    loop {
        let woke = shared.wake_log.lock().len();
        let finished =
            woke + shared.timeout_log.lock().len() + shared.bad_state.load(Ordering::SeqCst);
        let settled = if spec.deadline_ns.is_some() {
            finished == spec.waiters
        } else {
            woke >= expected
        };
        if settled || Instant::now() > settle_limit {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    // Release any deliberately unsignalled waiters so the joins complete.
    shared.cv.broadcast();
    for handle in handles {
        handle.join().expect("waiter thread panicked");
    }

    let enqueue_order = shared.enqueue_log.lock().clone();
    let mut wake_order = shared.wake_log.lock().clone();
    let drained = if spec.deadline_ns.is_none() && wake_order.len() > expected {
        wake_order.split_off(expected)
    } else {
        Vec::new()
    };
    ScenarioOutcome {
        enqueue_order,
        wake_order,
        drained,
        timed_out: shared.timeout_log.lock().clone(),
        bad_state: shared.bad_state.load(Ordering::SeqCst),
    }
}

/// Validate an outcome against the scenario's guarantees.
///
/// With an infinite deadline the claimed set and its per-batch FIFO order
/// are fully deterministic and both are checked. With a finite deadline
/// only the accounting is checked: timeouts race the batches by design.
pub fn check_outcome(spec: &ScenarioSpec, outcome: &ScenarioOutcome) -> Result<(), String> {
    let accounted = outcome.wake_order.len()
        + outcome.drained.len()
        + outcome.timed_out.len()
        + outcome.bad_state;
    if accounted != spec.waiters {
        return Err(format!(
            "accounted for {accounted} of {} waiters",
            spec.waiters
        ));
    }
    if outcome.bad_state != 0 {
        return Err(format!("{} BadState returns", outcome.bad_state));
    }
    if outcome.enqueue_order.len() != spec.waiters {
        return Err("incomplete enqueue log".to_string());
    }

    if spec.deadline_ns.is_none() {
        let expected = expected_wakes(spec);
        if outcome.wake_order.len() != expected {
            return Err(format!(
                "batches claimed {} waiters, expected {expected}",
                outcome.wake_order.len()
            ));
        }
        // The claimed set is exactly the `expected` oldest waiters.
        let mut claimed = outcome.enqueue_order[..expected].to_vec();
        let mut woken = outcome.wake_order.clone();
        claimed.sort_unstable();
        woken.sort_unstable();
        if claimed != woken {
            return Err(format!(
                "woken set {:?} is not the oldest {expected} waiters",
                outcome.wake_order
            ));
        }
        // Within each batch, wakes arrive oldest first. Batches that
        // overlap in time may interleave with each other, so the order is
        // only checked per batch.
        let mut offset = 0;
        let mut remaining = spec.waiters;
        for &batch in &spec.signal_batches {
            let take = if batch < 0 {
                remaining
            } else {
                (batch as usize).min(remaining)
            };
            let members = &outcome.enqueue_order[offset..offset + take];
            let woken_members: Vec<usize> = outcome
                .wake_order
                .iter()
                .copied()
                .filter(|id| members.contains(id))
                .collect();
            if woken_members != members {
                return Err(format!(
                    "batch at offset {offset} woke in order {woken_members:?}, queued {members:?}"
                ));
            }
            offset += take;
            remaining -= take;
        }
    }
    Ok(())
}

struct OrderSink {
    fired: RefCell<Vec<Rc<FenceReference>>>,
}

impl FenceCallback for OrderSink {
    fn on_fence_fired(&self, fired: &Rc<FenceReference>) {
        self.fired.borrow_mut().push(Rc::clone(fired));
    }

    fn on_ref_for_fence_dead(&self, fence: &Rc<Fence>) {
        fence.on_ref_dead();
    }
}

/// Single-threaded fence smoke check: arm `references` on one fence, then
/// signal and dispatch once per reference, verifying strict FIFO firing.
pub fn run_fence_fifo(references: usize) -> Result<(), String> {
    let sink = Rc::new(OrderSink {
        fired: RefCell::new(Vec::new()),
    });
    let dispatcher = LocalDispatcher::new();
    let sink_cb: Rc<dyn FenceCallback> = sink.clone();
    let cb: std::rc::Weak<dyn FenceCallback> = Rc::downgrade(&sink_cb);
    let dispatcher_dyn: Rc<dyn WaitDispatcher> = dispatcher.clone();
    let fence = Fence::new(cb, dispatcher_dyn, 1, Box::new(LocalEvent::new()));

    let mut armed = Vec::new();
    for _ in 0..references {
        if !fence.create_ref() {
            return Err("reference allocation failed".to_string());
        }
        let reference = fence
            .get_reference()
            .ok_or_else(|| "missing current reference".to_string())?;
        reference
            .start_ready_wait()
            .map_err(|err| err.to_string())?;
        armed.push(reference);
    }

    for (index, expected) in armed.iter().enumerate() {
        fence.signal();
        if dispatcher.dispatch_ready() != 1 {
            return Err(format!("signal {index} did not fire exactly once"));
        }
        let fired = sink.fired.borrow();
        if !Rc::ptr_eq(fired.last().expect("a reference fired"), expected) {
            return Err(format!("signal {index} fired out of order"));
        }
    }

    sink.fired.borrow_mut().clear();
    fence.clear_ref();
    Ok(())
}
