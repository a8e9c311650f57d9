use crossbeam::queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::error::{Cancelled, RegistryStopped};

/// Clock used for deadline comparison. Injectable so tests can drive time
/// by hand; only ever compared, never used to schedule an alarm.
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

// Registration lifecycle. Every exit from ACTIVE is a single CAS on the
// state word: whichever of {dispose, expiry sweep, stop} wins that
// exchange is the only effect the registration ever produces.
const ACTIVE: u8 = 0;
const DISPOSED: u8 = 1;
const EXPIRED: u8 = 2;
const STOPPED: u8 = 3;

pub(crate) struct RegistrationNode {
    deadline: Instant,
    state: AtomicU8,
    // Re-armed on every poll of the guarded task, taken exactly once by
    // the winning canceller. Poison is recovered: the slot stays usable.
    waker: Mutex<Option<Waker>>,
}

impl RegistrationNode {
    fn new(deadline: Instant) -> Arc<Self> {
        Arc::new(Self {
            deadline,
            state: AtomicU8::new(ACTIVE),
            waker: Mutex::new(None),
        })
    }

    #[inline]
    fn is_settled(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    /// Store the waker that a cancel must fire. No-op once settled.
    pub(crate) fn arm(&self, waker: &Waker) {
        if self.is_settled() {
            return;
        }
        let mut slot = self.waker.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    fn take_waker(&self) -> Option<Waker> {
        self.waker.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// The cancellation this node settled with, if any.
    pub(crate) fn cancel_reason(&self) -> Option<Cancelled> {
        match self.state.load(Ordering::Acquire) {
            EXPIRED => Some(Cancelled::DeadlineExceeded),
            STOPPED => Some(Cancelled::Shutdown),
            _ => None,
        }
    }

    /// Settle as naturally completed; no callback fires. Returns whether
    /// this call won the exchange.
    pub(crate) fn dispose(&self) -> bool {
        let won = self
            .state
            .compare_exchange(ACTIVE, DISPOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            // Release the task eagerly even though the node itself is
            // unlinked lazily.
            drop(self.take_waker());
        }
        won
    }

    /// Settle as cancelled and wake the guarded task. Returns whether
    /// this call won the exchange.
    fn cancel(&self, reason: u8) -> bool {
        debug_assert!(reason == EXPIRED || reason == STOPPED);
        let won = self
            .state
            .compare_exchange(ACTIVE, reason, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            if let Some(waker) = self.take_waker() {
                waker.wake();
            }
        }
        won
    }
}

/// Disposable handle for one pending deadline-guarded operation.
///
/// Owned jointly: the registry keeps the node linked for sweeping, the
/// caller holds this handle for early disposal. Dropping the handle
/// disposes it.
pub struct Registration {
    node: Arc<RegistrationNode>,
}

impl Registration {
    /// Absolute instant after which the registration is eligible for
    /// cancellation.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.node.deadline
    }

    /// True while neither disposed nor cancelled.
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.node.is_settled()
    }

    /// True once a sweep or stop cancelled this registration.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.node.cancel_reason().is_some()
    }

    /// Remove from the registry without firing the cancel path. Idempotent;
    /// a no-op if a sweep got there first.
    #[inline]
    pub fn dispose(&self) {
        let _ = self.node.dispose();
    }

    #[inline]
    pub(crate) fn node(&self) -> &Arc<RegistrationNode> {
        &self.node
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let _ = self.node.dispose();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("deadline", &self.node.deadline)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Approximate, allocation-cheap idle-timeout registry.
///
/// Registrations are appended at the tail and reclaimed from the head by
/// sweeps that piggyback on registry activity; no timer task or watchdog
/// thread ever runs. Two limitations follow, both accepted for the
/// idle-connection use case:
///
/// - the timeout period is fixed per registry;
/// - cancellation is not guaranteed if no further register/sweep occurs.
pub struct DeadlineRegistry {
    timeout: Duration,
    clock: Clock,
    // INVARIANT: every node's deadline is `now() + timeout` with the one
    // fixed timeout and a non-decreasing clock, so tail order is
    // deadline-non-decreasing and the queue is sorted without sorting.
    // A per-registration timeout would silently break every sweep.
    queue: SegQueue<Arc<RegistrationNode>>,
    // Head popped by a sweeper but not yet expired. Only the sweeper that
    // holds `sweeping` touches this, so the lock is never contended.
    parked: Mutex<Option<Arc<RegistrationNode>>>,
    sweeping: AtomicBool,
    stopped: AtomicBool,
}

impl DeadlineRegistry {
    /// Registry over the wall clock.
    pub fn new(timeout: Duration) -> Self {
        Self::with_clock(timeout, Arc::new(Instant::now))
    }

    /// Registry over an injected clock.
    pub fn with_clock(timeout: Duration, clock: Clock) -> Self {
        Self {
            timeout,
            clock,
            queue: SegQueue::new(),
            parked: Mutex::new(None),
            sweeping: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// The fixed timeout applied to every registration.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of nodes still linked (settled-but-unswept nodes included).
    pub fn len(&self) -> usize {
        let parked = usize::from(
            self.parked
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some(),
        );
        self.queue.len() + parked
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new deadline at `now() + timeout` and run one sweep pass.
    ///
    /// Fails once the registry is stopped; a stop racing in after the node
    /// was linked settles the fresh node here, exactly once, before the
    /// error is returned.
    pub fn register(&self) -> Result<Registration, RegistryStopped> {
        if self.is_stopped() {
            return Err(RegistryStopped);
        }
        let now = (self.clock)();
        let node = RegistrationNode::new(now + self.timeout);
        self.queue.push(Arc::clone(&node));

        self.sweep_at(now);

        if self.is_stopped() {
            let _ = node.cancel(STOPPED);
            return Err(RegistryStopped);
        }
        Ok(Registration { node })
    }

    /// Cancel every expired registration, head to tail.
    pub fn sweep(&self) {
        self.sweep_at((self.clock)());
    }

    /// Stop the registry: all current registrations are cancelled, all
    /// future ones fail. Idempotent.
    ///
    /// Unlike a plain sweep this must own a full pass (a sweeper that
    /// read the stop flag before it was set may park a live node and
    /// return), so it spins until it acquires the sweep. Sweeps are short
    /// and never block, so the wait is bounded.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        while !self.sweep_at((self.clock)()) {
            std::hint::spin_loop();
        }
    }

    /// One sweep pass. Returns false when another sweeper held the flag.
    ///
    /// Walks from the earliest deadline: settled nodes are unlinked
    /// silently, expired ones (or all of them, when stopped) are
    /// cancelled, and the pass ends at the first live node whose deadline
    /// is still ahead; that node is parked so ordering survives the pop.
    /// Cost is proportional to the number of expired nodes only.
    fn sweep_at(&self, now: Instant) -> bool {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        let stopped = self.is_stopped();
        {
            let mut parked = self.parked.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                let node = match parked.take() {
                    Some(node) => node,
                    None => match self.queue.pop() {
                        Some(node) => node,
                        None => break,
                    },
                };
                if node.is_settled() {
                    continue;
                }
                if stopped {
                    let _ = node.cancel(STOPPED);
                    continue;
                }
                if node.deadline <= now {
                    let _ = node.cancel(EXPIRED);
                    continue;
                }
                *parked = Some(node);
                break;
            }
        }
        self.sweeping.store(false, Ordering::Release);
        true
    }
}

impl fmt::Debug for DeadlineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineRegistry")
            .field("timeout", &self.timeout)
            .field("len", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::task::Wake;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// Clock driven by an atomic millisecond counter.
    fn manual_clock() -> (Arc<AtomicU64>, Clock) {
        let millis = Arc::new(AtomicU64::new(0));
        let base = Instant::now();
        let handle = Arc::clone(&millis);
        let clock: Clock =
            Arc::new(move || base + Duration::from_millis(handle.load(Ordering::SeqCst)));
        (millis, clock)
    }

    fn registry() -> (Arc<AtomicU64>, DeadlineRegistry) {
        let (millis, clock) = manual_clock();
        (millis, DeadlineRegistry::with_clock(TIMEOUT, clock))
    }

    struct CountingWake(AtomicU64);

    impl Wake for CountingWake {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn deadlines_are_non_decreasing() {
        let (millis, reg) = registry();
        let a = reg.register().unwrap();
        millis.store(10, Ordering::SeqCst);
        let b = reg.register().unwrap();
        millis.store(25, Ordering::SeqCst);
        let c = reg.register().unwrap();

        assert!(a.deadline() <= b.deadline());
        assert!(b.deadline() <= c.deadline());
    }

    #[test]
    fn sweep_cancels_expired_and_stops_at_first_live() {
        let (millis, reg) = registry();
        let a = reg.register().unwrap();
        millis.store(50, Ordering::SeqCst);
        let b = reg.register().unwrap();

        // a expires at 100, b at 150.
        millis.store(120, Ordering::SeqCst);
        reg.sweep();
        assert!(a.is_cancelled());
        assert!(b.is_active());

        millis.store(160, Ordering::SeqCst);
        reg.sweep();
        assert!(b.is_cancelled());
    }

    #[test]
    fn cancellation_never_fires_before_the_deadline() {
        let (millis, reg) = registry();
        let a = reg.register().unwrap();

        millis.store(99, Ordering::SeqCst);
        reg.sweep();
        assert!(a.is_active());

        millis.store(100, Ordering::SeqCst);
        reg.sweep();
        assert!(a.is_cancelled());
    }

    #[test]
    fn register_triggers_the_sweep() {
        let (millis, reg) = registry();
        let a = reg.register().unwrap();
        millis.store(200, Ordering::SeqCst);
        // No explicit sweep: the next registration reclaims a.
        let _b = reg.register().unwrap();
        assert!(a.is_cancelled());
    }

    #[test]
    fn dispose_is_idempotent_and_beats_the_sweep() {
        let (millis, reg) = registry();
        let a = reg.register().unwrap();
        a.dispose();
        a.dispose();
        assert!(!a.is_active());
        assert!(!a.is_cancelled());

        millis.store(500, Ordering::SeqCst);
        reg.sweep();
        // The sweep unlinks the disposed node without cancelling it.
        assert!(!a.is_cancelled());
        assert!(reg.is_empty());
    }

    #[test]
    fn register_after_stop_fails() {
        let (_millis, reg) = registry();
        reg.stop();
        assert!(reg.register().is_err());
        assert!(reg.is_stopped());
    }

    #[test]
    fn stop_cancels_everything_including_the_parked_head() {
        let (millis, reg) = registry();
        let a = reg.register().unwrap();
        millis.store(10, Ordering::SeqCst);
        let b = reg.register().unwrap();
        // Sweep parks the unexpired head.
        reg.sweep();
        assert!(a.is_active());

        reg.stop();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(reg.is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let (_millis, reg) = registry();
        let a = reg.register().unwrap();
        reg.stop();
        reg.stop();
        assert!(a.is_cancelled());
    }

    #[test]
    fn cancel_wakes_at_most_once_under_racing_settlers() {
        // Race dispose against an expiry sweep against stop, many rounds;
        // the armed waker must fire at most once per registration.
        for _ in 0..200 {
            let (millis, reg) = registry();
            let reg = Arc::new(reg);
            let a = Arc::new(reg.register().unwrap());

            let wake = Arc::new(CountingWake(AtomicU64::new(0)));
            a.node().arm(&Waker::from(Arc::clone(&wake)));

            millis.store(150, Ordering::SeqCst);

            let threads: Vec<_> = [0u8, 1, 2]
                .into_iter()
                .map(|role| {
                    let reg = Arc::clone(&reg);
                    let a = Arc::clone(&a);
                    std::thread::spawn(move || match role {
                        0 => a.dispose(),
                        1 => reg.sweep(),
                        _ => reg.stop(),
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            assert!(!a.is_active());
            assert!(wake.0.load(Ordering::SeqCst) <= 1);
            // Disposal and cancellation are mutually exclusive outcomes.
            if a.is_cancelled() {
                assert!(a.node().cancel_reason().is_some());
            }
        }
    }

    #[test]
    fn concurrent_registers_stay_ordered_enough_to_sweep() {
        let (millis, reg) = registry();
        let reg = Arc::new(reg);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| reg.register().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<Registration> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        millis.store(1_000, Ordering::SeqCst);
        reg.sweep();
        assert!(all.iter().all(Registration::is_cancelled));
        assert!(reg.is_empty());
    }
}
