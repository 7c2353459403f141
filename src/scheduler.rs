//! Bounded worker pool with inline fallback
//!
//! [`TaskScheduler`] owns a fixed number of OS threads. There is no task queue:
//! [`execute`](TaskScheduler::execute) hands a task straight to an idle worker
//! or, when none can be had, runs it on the caller's thread. That inline
//! fallback is what keeps recursive submission safe. A worker task that
//! submits sub-tasks into the same pool can always make progress itself even
//! when every other worker is busy.
//!
//! A caller that is willing to block waits for a worker only while blocking
//! cannot starve the pool. The pool tracks how many threads are parked in
//! rendezvous waits (see [`ParkGauge`]) and how many are waiting for a worker;
//! once those plus the caller would account for every worker, the wait is
//! declined and the task runs inline.
//!
//! The first task that fails (returns `Err` or panics) stops the pool. Its
//! error is reported by the next [`wait_idle`](TaskScheduler::wait_idle);
//! tasks submitted afterwards are dropped unrun.

use crate::error::{PhatError, Result};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace};

/// Unit of work accepted by the scheduler
pub type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct PoolState {
    idle: Vec<usize>,
    running: usize,
    alloc_waiting: usize,
    parked: usize,
    first_error: Option<PhatError>,
}

struct Slot {
    task: Mutex<Option<Task>>,
    ready: Condvar,
}

struct Shared {
    state: Mutex<PoolState>,
    changed: Condvar,
    stop: AtomicBool,
    slots: Vec<Slot>,
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.changed.notify_all();
        for slot in &self.slots {
            let _guard = slot.task.lock();
            slot.ready.notify_all();
        }
    }

    fn run(&self, task: Task) {
        let outcome = match catch_unwind(AssertUnwindSafe(task)) {
            Ok(result) => result,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(PhatError::TaskPanicked(msg))
            }
        };
        if let Err(e) = outcome {
            self.record_failure(e);
        }
    }

    fn record_failure(&self, err: PhatError) {
        {
            let mut st = self.state.lock();
            // A cancelled wait is fallout from another task's failure; let that one win
            let replaces = match &st.first_error {
                None => true,
                Some(PhatError::Cancelled { .. }) => !matches!(err, PhatError::Cancelled { .. }),
                Some(_) => false,
            };
            if replaces {
                error!("task failed, stopping scheduler: {}", err);
                st.first_error = Some(err);
            } else {
                debug!("further task failure after stop: {}", err);
            }
        }
        self.request_stop();
    }

    fn release(&self, id: usize) {
        let mut st = self.state.lock();
        st.running -= 1;
        if !self.stopped() {
            st.idle.push(id);
        }
        self.changed.notify_all();
    }
}

/// Where an `execute` call ends up running its task
enum Placement {
    Worker(usize),
    Inline,
    Dropped,
}

/// Counter of threads parked in rendezvous waits
///
/// Every blocking wait in [`crate::sync`] holds a [`Parked`] guard for its
/// duration. The owning scheduler reads the count when deciding whether a
/// blocking allocation could leave no worker able to progress.
#[derive(Clone)]
pub struct ParkGauge {
    shared: Arc<Shared>,
}

impl ParkGauge {
    /// Gauge not attached to any worker threads
    pub fn detached() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                changed: Condvar::new(),
                stop: AtomicBool::new(false),
                slots: Vec::new(),
            }),
        }
    }

    /// Count the current thread as parked until the guard drops
    pub fn park(&self) -> Parked<'_> {
        let mut st = self.shared.state.lock();
        st.parked += 1;
        self.shared.changed.notify_all();
        Parked { gauge: self }
    }

    /// Threads currently parked
    pub fn parked(&self) -> usize {
        self.shared.state.lock().parked
    }
}

impl std::fmt::Debug for ParkGauge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkGauge")
            .field("parked", &self.parked())
            .finish()
    }
}

/// Guard returned by [`ParkGauge::park`]
pub struct Parked<'a> {
    gauge: &'a ParkGauge,
}

impl Drop for Parked<'_> {
    fn drop(&mut self) {
        let mut st = self.gauge.shared.state.lock();
        st.parked -= 1;
        self.gauge.shared.changed.notify_all();
    }
}

/// Fixed-size worker pool
pub struct TaskScheduler {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Spawn `threads` workers; zero makes every task run inline
    pub fn new(threads: usize) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                idle: (0..threads).rev().collect(),
                ..PoolState::default()
            }),
            changed: Condvar::new(),
            stop: AtomicBool::new(false),
            slots: (0..threads)
                .map(|_| Slot {
                    task: Mutex::new(None),
                    ready: Condvar::new(),
                })
                .collect(),
        });

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("phatbak-worker-{id}"))
                .spawn(move || worker_loop(shared, id))?;
            handles.push(handle);
        }
        debug!("scheduler started with {} workers", threads);

        Ok(Self {
            shared,
            handles: Mutex::new(handles),
        })
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    /// Gauge for rendezvous primitives whose waits this pool must account for
    pub fn gauge(&self) -> ParkGauge {
        ParkGauge {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Whether the pool has been stopped by a failure or `join_all`
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped()
    }

    /// Run `task` on an idle worker or inline
    ///
    /// With `wait == false` the task runs inline whenever no worker is idle.
    /// With `wait == true` the caller blocks for a worker unless doing so
    /// would leave every worker blocked, in which case it runs inline.
    pub fn execute(&self, task: Task, wait: bool) {
        match self.place(wait) {
            Placement::Worker(id) => {
                trace!("handing task to worker {}", id);
                let slot = &self.shared.slots[id];
                let mut guard = slot.task.lock();
                *guard = Some(task);
                slot.ready.notify_one();
            }
            Placement::Inline => self.shared.run(task),
            Placement::Dropped => debug!("scheduler stopped, dropping task"),
        }
    }

    /// Convenience wrapper around [`execute`](Self::execute) for closures
    pub fn submit<F>(&self, f: F, wait: bool)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.execute(Box::new(f), wait)
    }

    fn place(&self, wait: bool) -> Placement {
        if self.shared.stopped() {
            return Placement::Dropped;
        }
        if self.shared.slots.is_empty() {
            return Placement::Inline;
        }

        let total = self.shared.slots.len();
        let mut st = self.shared.state.lock();
        if let Some(id) = st.idle.pop() {
            st.running += 1;
            return Placement::Worker(id);
        }
        if !wait {
            return Placement::Inline;
        }

        st.alloc_waiting += 1;
        let placement = loop {
            if self.shared.stopped() {
                break Placement::Dropped;
            }
            if let Some(id) = st.idle.pop() {
                st.running += 1;
                break Placement::Worker(id);
            }
            if st.parked + st.alloc_waiting + 1 >= total {
                trace!(
                    "declining blocking allocation (parked {}, waiting {})",
                    st.parked,
                    st.alloc_waiting
                );
                break Placement::Inline;
            }
            self.shared.changed.wait(&mut st);
        };
        st.alloc_waiting -= 1;
        placement
    }

    /// Block until every worker is idle, then report the first task failure
    pub fn wait_idle(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        while st.running > 0 {
            self.shared.changed.wait(&mut st);
        }
        match st.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every worker and join its thread
    pub fn join_all(&self) {
        self.shared.request_stop();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked outside a task");
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.join_all();
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock();
        f.debug_struct("TaskScheduler")
            .field("workers", &self.shared.slots.len())
            .field("idle", &st.idle.len())
            .field("running", &st.running)
            .field("parked", &st.parked)
            .field("stopped", &self.shared.stopped())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize) {
    loop {
        let task = {
            let slot = &shared.slots[id];
            let mut guard = slot.task.lock();
            loop {
                if let Some(task) = guard.take() {
                    break Some(task);
                }
                if shared.stopped() {
                    break None;
                }
                slot.ready.wait(&mut guard);
            }
        };
        let Some(task) = task else {
            trace!("worker {} exiting", id);
            return;
        };
        shared.run(task);
        shared.release(id);
    }
}
