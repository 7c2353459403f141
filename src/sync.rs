//! Rendezvous primitives
//!
//! - [`BusyLatch`]: binary busy/idle flag with wait-until-idle
//! - [`Promise`] / [`Resolver`]: single-use future built on a latch
//! - [`WriteSequencer`]: ordered-completion chain for in-order writes
//!
//! Every blocking wait here registers with the scheduler's [`ParkGauge`] so
//! the scheduler can tell when a blocking worker allocation would leave no
//! thread able to progress.
//!
//! None of the waits time out. A producer that disappears without posting
//! (its [`Resolver`] dropped, or a sequencer poisoned) wakes its waiters with
//! [`PhatError::Cancelled`] instead.

use crate::error::{PhatError, Result};
use crate::scheduler::ParkGauge;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Busy,
    Idle,
    Abandoned,
}

/// Two-state flag that threads can wait on
pub struct BusyLatch {
    state: Mutex<LatchState>,
    cv: Condvar,
    gauge: ParkGauge,
}

impl BusyLatch {
    /// Create a latch, initially busy or idle
    pub fn new(gauge: ParkGauge, busy: bool) -> Self {
        Self {
            state: Mutex::new(if busy { LatchState::Busy } else { LatchState::Idle }),
            cv: Condvar::new(),
            gauge,
        }
    }

    /// Mark busy
    pub fn post_busy(&self) {
        let mut st = self.state.lock();
        if *st != LatchState::Abandoned {
            *st = LatchState::Busy;
        }
    }

    /// Mark idle and wake all waiters
    pub fn post_idle(&self) {
        let mut st = self.state.lock();
        if *st != LatchState::Abandoned {
            *st = LatchState::Idle;
        }
        self.cv.notify_all();
    }

    /// Release waiters with an error; the latch stays abandoned
    pub fn abandon(&self) {
        *self.state.lock() = LatchState::Abandoned;
        self.cv.notify_all();
    }

    /// Whether the latch is currently busy
    pub fn is_busy(&self) -> bool {
        *self.state.lock() == LatchState::Busy
    }

    /// Block until idle; `what` names the awaited thing in the error
    pub fn wait_idle(&self, what: &'static str) -> Result<()> {
        let mut st = self.state.lock();
        if *st == LatchState::Busy {
            let _parked = self.gauge.park();
            while *st == LatchState::Busy {
                self.cv.wait(&mut st);
            }
        }
        match *st {
            LatchState::Abandoned => Err(PhatError::Cancelled { what }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for BusyLatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyLatch")
            .field("state", &*self.state.lock())
            .finish()
    }
}

struct PromiseInner<T> {
    latch: BusyLatch,
    value: Mutex<Option<T>>,
}

/// Consumer side of a single-use future
pub struct Promise<T> {
    inner: Arc<PromiseInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Producer side of a single-use future
///
/// Dropping it unresolved abandons the promise.
pub struct Resolver<T> {
    inner: Arc<PromiseInner<T>>,
    resolved: bool,
}

/// Create a connected resolver/promise pair
pub fn promise<T>(gauge: &ParkGauge) -> (Resolver<T>, Promise<T>) {
    let inner = Arc::new(PromiseInner {
        latch: BusyLatch::new(gauge.clone(), true),
        value: Mutex::new(None),
    });
    (
        Resolver {
            inner: Arc::clone(&inner),
            resolved: false,
        },
        Promise { inner },
    )
}

impl<T> Resolver<T> {
    /// Publish the value and wake every waiter
    pub fn resolve(mut self, value: T) {
        *self.inner.value.lock() = Some(value);
        self.resolved = true;
        self.inner.latch.post_idle();
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.inner.latch.abandon();
        }
    }
}

impl<T> Promise<T> {
    /// True once resolved or abandoned, so `wait` will not block
    pub fn is_ready(&self) -> bool {
        !self.inner.latch.is_busy()
    }
}

impl<T: Clone> Promise<T> {
    /// Block until resolved and return a copy of the value
    pub fn wait(&self) -> Result<T> {
        self.inner.latch.wait_idle("promised result")?;
        self.inner
            .value
            .lock()
            .clone()
            .ok_or(PhatError::Cancelled { what: "promised result" })
    }
}

#[derive(Debug)]
struct SequenceState {
    next: usize,
    poisoned: bool,
}

/// Lets ordinal `k` proceed only after ordinals `0..k` have completed
pub struct WriteSequencer {
    state: Mutex<SequenceState>,
    cv: Condvar,
    gauge: ParkGauge,
}

impl WriteSequencer {
    /// Create a sequencer whose first turn is ordinal 0
    pub fn new(gauge: ParkGauge) -> Self {
        Self {
            state: Mutex::new(SequenceState {
                next: 0,
                poisoned: false,
            }),
            cv: Condvar::new(),
            gauge,
        }
    }

    /// Block until every ordinal below `ordinal` has completed
    pub fn wait_turn(&self, ordinal: usize) -> Result<()> {
        self.wait_until(|next| next >= ordinal)
    }

    /// Block until `count` ordinals have completed
    pub fn wait_all(&self, count: usize) -> Result<()> {
        self.wait_until(|next| next >= count)
    }

    fn wait_until(&self, reached: impl Fn(usize) -> bool) -> Result<()> {
        let mut st = self.state.lock();
        if !reached(st.next) && !st.poisoned {
            let _parked = self.gauge.park();
            while !reached(st.next) && !st.poisoned {
                self.cv.wait(&mut st);
            }
        }
        if st.poisoned {
            return Err(PhatError::Cancelled { what: "preceding write" });
        }
        Ok(())
    }

    /// Mark `ordinal` complete; it must be the current turn
    pub fn complete(&self, ordinal: usize) -> Result<()> {
        let mut st = self.state.lock();
        if st.next != ordinal {
            return Err(PhatError::internal(format!(
                "write sequence completed out of turn: {} while expecting {}",
                ordinal, st.next
            )));
        }
        st.next += 1;
        self.cv.notify_all();
        Ok(())
    }

    /// Fail every current and future waiter
    pub fn poison(&self) {
        self.state.lock().poisoned = true;
        self.cv.notify_all();
    }

    /// Ordinals completed so far
    pub fn completed(&self) -> usize {
        self.state.lock().next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_latch_wait_returns_after_post() {
        let latch = Arc::new(BusyLatch::new(ParkGauge::detached(), true));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_idle("test"))
        };
        thread::sleep(Duration::from_millis(10));
        assert!(latch.is_busy());
        latch.post_idle();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_latch_wait_counts_as_parked() {
        let gauge = ParkGauge::detached();
        let latch = Arc::new(BusyLatch::new(gauge.clone(), true));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_idle("test"))
        };
        while gauge.parked() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        latch.post_idle();
        waiter.join().unwrap().unwrap();
        assert_eq!(gauge.parked(), 0);
    }

    #[test]
    fn test_idle_latch_does_not_block() {
        let latch = BusyLatch::new(ParkGauge::detached(), false);
        latch.wait_idle("test").unwrap();
        latch.post_busy();
        assert!(latch.is_busy());
    }

    #[test]
    fn test_promise_resolves_for_every_waiter() {
        let gauge = ParkGauge::detached();
        let (resolver, result) = promise::<String>(&gauge);
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let p = result.clone();
                thread::spawn(move || p.wait())
            })
            .collect();
        resolver.resolve("/x/y".to_string());
        for w in waiters {
            assert_eq!(w.join().unwrap().unwrap(), "/x/y");
        }
        assert!(result.is_ready());
    }

    #[test]
    fn test_dropped_resolver_cancels() {
        let (resolver, result) = promise::<u32>(&ParkGauge::detached());
        drop(resolver);
        assert!(result.is_ready());
        assert!(matches!(result.wait(), Err(PhatError::Cancelled { .. })));
    }

    #[test]
    fn test_sequencer_orders_completion() {
        let seq = Arc::new(WriteSequencer::new(ParkGauge::detached()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..5usize)
            .rev()
            .map(|k| {
                let seq = Arc::clone(&seq);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    seq.wait_turn(k).unwrap();
                    log.lock().push(k);
                    seq.complete(k).unwrap();
                })
            })
            .collect();
        seq.wait_all(5).unwrap();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sequencer_poison_releases_waiters() {
        let seq = Arc::new(WriteSequencer::new(ParkGauge::detached()));
        let waiter = {
            let seq = Arc::clone(&seq);
            thread::spawn(move || seq.wait_turn(3))
        };
        thread::sleep(Duration::from_millis(5));
        seq.poison();
        assert!(waiter.join().unwrap().is_err());
        assert!(seq.complete(1).is_err());
    }
}
