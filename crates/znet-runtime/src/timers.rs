//! Timer service
//!
//! A min-heap of absolute-deadline timeouts and periodic intervals with
//! a single dedicated worker. The worker sleeps until the root deadline
//! (or until signalled that the root changed), pops due entries and runs
//! their callbacks with the service lock released. A callback may
//! therefore call back into the timer API without deadlocking: add new
//! timers, cancel or reschedule any other timer, or cancel itself. It
//! must not call [`Timers::stop_sync`] on its own service.
//!
//! Handles stay pinned through heap movement via the ref-heap back-refs;
//! an interval keeps one handle valid across fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::trace;
use parking_lot::{Condvar, Mutex, MutexGuard};

use znet_core::aflags::AtomicFlags8;
use znet_core::error::{Error, Result};
use znet_core::refheap::{Ref, RefHeap};

use crate::clock;

type TimerFn = Box<dyn FnMut() + Send + 'static>;

const RUNNING: u8 = 1;
const STOP: u8 = 2;

enum TimerKind {
    Timeout,
    /// `count == 0` fires forever; `count == n` fires exactly n times.
    Interval { base: u64, period: u64, count: u64 },
}

struct TimerEntry {
    callback: TimerFn,
    kind: TimerKind,
}

/// Handle to a pending timer. Dead once the timeout fired, the interval
/// exhausted its count, or the timer was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRef(Ref);

struct TimersShared {
    heap: Mutex<RefHeap<TimerEntry>>,
    signal: Condvar,
    /// Deadline of the current root; `u64::MAX` when the heap is empty.
    latest: AtomicU64,
    flags: AtomicFlags8,
}

impl TimersShared {
    /// Re-publish the root deadline; wake the worker when it moved
    /// earlier than what the worker may be sleeping on.
    fn refresh_latest(&self, heap: &RefHeap<TimerEntry>) {
        let new = heap.root_key().unwrap_or(u64::MAX);
        let old = self.latest.swap(new, Ordering::SeqCst);
        if new < old {
            self.signal.notify_all();
        }
    }

    fn insert(
        &self,
        heap: &mut RefHeap<TimerEntry>,
        deadline: u64,
        entry: TimerEntry,
    ) -> Result<TimerRef> {
        let r = heap.insert(deadline, entry)?;
        self.refresh_latest(heap);
        Ok(TimerRef(r))
    }

    fn cancel(&self, heap: &mut RefHeap<TimerEntry>, t: TimerRef) -> Result<()> {
        if heap.remove(t.0).is_some() {
            self.refresh_latest(heap);
            return Ok(());
        }
        // Already popped by the worker: fired from the service's
        // perspective. Keep a firing interval from re-arming.
        heap.mark_dead_if_detached(t.0);
        Err(Error::NotFound)
    }
}

/// The timer service. One background worker per instance.
pub struct Timers {
    shared: Arc<TimersShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

impl Timers {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimersShared {
                heap: Mutex::new(RefHeap::new()),
                signal: Condvar::new(),
                latest: AtomicU64::new(u64::MAX),
                flags: AtomicFlags8::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker thread.
    pub fn start(&self) -> Result<()> {
        if self.shared.flags.test(STOP) {
            return Err(Error::Closed);
        }
        if self.shared.flags.set(RUNNING) & RUNNING != 0 {
            return Err(Error::BadArgument);
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("znet-timer".into())
            .spawn(move || worker_loop(shared))
            .map_err(Error::from)?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// One-shot timer at an absolute monotonic deadline (see
    /// [`clock::after_ns`]). A past deadline fires on the next tick.
    pub fn add_timeout(
        &self,
        deadline_ns: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerRef> {
        let mut heap = self.shared.heap.lock();
        self.shared.insert(
            &mut heap,
            deadline_ns,
            TimerEntry {
                callback: Box::new(callback),
                kind: TimerKind::Timeout,
            },
        )
    }

    /// Periodic timer: first fire at `base_ns`, then every `period_ns`.
    /// `count == 0` repeats until cancelled, otherwise fires exactly
    /// `count` times.
    pub fn add_interval(
        &self,
        base_ns: u64,
        period_ns: u64,
        count: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerRef> {
        let mut heap = self.shared.heap.lock();
        self.shared.insert(
            &mut heap,
            base_ns,
            TimerEntry {
                callback: Box::new(callback),
                kind: TimerKind::Interval {
                    base: base_ns,
                    period: period_ns,
                    count,
                },
            },
        )
    }

    /// Remove a pending timer. `NotFound` once it fired or was already
    /// cancelled, including when its callback has been popped and is
    /// about to run.
    pub fn cancel(&self, t: TimerRef) -> Result<()> {
        let mut heap = self.shared.heap.lock();
        self.shared.cancel(&mut heap, t)
    }

    /// Mutable access to a pending timer's parameters under the service
    /// lock. Dropping the guard re-heapifies and re-signals the worker.
    /// `None` if the handle is dead or the timer is currently firing.
    pub fn open(&self, t: TimerRef) -> Option<TimerOpen<'_>> {
        let heap = self.shared.heap.lock();
        let deadline = heap.key(t.0)?;
        Some(TimerOpen {
            shared: &self.shared,
            heap: Some(heap),
            r: t.0,
            deadline,
            dirty: false,
        })
    }

    /// Take the service lock once for a batch of raw operations.
    pub fn lock(&self) -> TimersGuard<'_> {
        TimersGuard {
            shared: &self.shared,
            heap: self.shared.heap.lock(),
        }
    }

    /// Pending timers (detached entries mid-callback not included).
    pub fn len(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request worker exit and join it. Must not be called from a timer
    /// callback of this service.
    pub fn stop_sync(&self) {
        self.stop_async();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Request worker exit without waiting; the worker leaves on its
    /// next wakeup.
    pub fn stop_async(&self) {
        self.shared.flags.set(STOP);
        self.shared.signal.notify_all();
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

/// Raw-layer guard: the service lock held across several operations.
pub struct TimersGuard<'a> {
    shared: &'a TimersShared,
    heap: MutexGuard<'a, RefHeap<TimerEntry>>,
}

impl TimersGuard<'_> {
    pub fn add_timeout_raw(
        &mut self,
        deadline_ns: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerRef> {
        self.shared.insert(
            &mut self.heap,
            deadline_ns,
            TimerEntry {
                callback: Box::new(callback),
                kind: TimerKind::Timeout,
            },
        )
    }

    pub fn add_interval_raw(
        &mut self,
        base_ns: u64,
        period_ns: u64,
        count: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerRef> {
        self.shared.insert(
            &mut self.heap,
            base_ns,
            TimerEntry {
                callback: Box::new(callback),
                kind: TimerKind::Interval {
                    base: base_ns,
                    period: period_ns,
                    count,
                },
            },
        )
    }

    pub fn cancel_raw(&mut self, t: TimerRef) -> Result<()> {
        self.shared.cancel(&mut self.heap, t)
    }
}

/// Mutable view of one pending timer, held under the service lock.
pub struct TimerOpen<'a> {
    shared: &'a TimersShared,
    heap: Option<MutexGuard<'a, RefHeap<TimerEntry>>>,
    r: Ref,
    deadline: u64,
    dirty: bool,
}

impl TimerOpen<'_> {
    pub fn deadline(&self) -> u64 {
        self.deadline
    }

    /// Move the timer to a new absolute deadline. For intervals this
    /// also rebases the period chain.
    pub fn set_deadline(&mut self, deadline_ns: u64) {
        self.deadline = deadline_ns;
        self.dirty = true;
    }

    pub fn period(&self) -> Option<u64> {
        match &self.entry()?.kind {
            TimerKind::Interval { period, .. } => Some(*period),
            TimerKind::Timeout => None,
        }
    }

    pub fn set_period(&mut self, period_ns: u64) -> bool {
        match self.entry_mut().map(|e| &mut e.kind) {
            Some(TimerKind::Interval { period, .. }) => {
                *period = period_ns;
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match &self.entry()?.kind {
            TimerKind::Interval { count, .. } => Some(*count),
            TimerKind::Timeout => None,
        }
    }

    pub fn set_count(&mut self, count: u64) -> bool {
        match self.entry_mut().map(|e| &mut e.kind) {
            Some(TimerKind::Interval { count: c, .. }) => {
                *c = count;
                true
            }
            _ => false,
        }
    }

    fn entry(&self) -> Option<&TimerEntry> {
        self.heap.as_ref()?.get(self.r)
    }

    fn entry_mut(&mut self) -> Option<&mut TimerEntry> {
        let r = self.r;
        self.heap.as_mut()?.get_mut(r)
    }
}

impl Drop for TimerOpen<'_> {
    fn drop(&mut self) {
        if let Some(mut heap) = self.heap.take() {
            if self.dirty {
                if let Some(entry) = heap.get_mut(self.r) {
                    if let TimerKind::Interval { base, .. } = &mut entry.kind {
                        *base = self.deadline;
                    }
                }
                heap.update_key(self.r, self.deadline);
            }
            self.shared.refresh_latest(&heap);
        }
    }
}

fn worker_loop(shared: Arc<TimersShared>) {
    trace!("timer worker started");
    loop {
        let mut heap = shared.heap.lock();
        if shared.flags.test(STOP) {
            break;
        }
        let deadline = match heap.root_key() {
            None => {
                shared.signal.wait(&mut heap);
                continue;
            }
            Some(d) => d,
        };
        if clock::now_ns() < deadline {
            // Sleep until the root deadline or a signal; either way
            // re-read the root, it may have changed under us.
            let _ = shared
                .signal
                .wait_until(&mut heap, clock::instant_at(deadline));
            continue;
        }

        let (r, _deadline, mut entry) = match heap.take_root() {
            Some(popped) => popped,
            None => continue,
        };
        shared.latest.store(
            heap.root_key().unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
        drop(heap);

        (entry.callback)();

        let rearm = match &mut entry.kind {
            TimerKind::Timeout => None,
            TimerKind::Interval {
                base,
                period,
                count,
            } => {
                *base += *period;
                match *count {
                    0 => Some(*base),
                    1 => None,
                    _ => {
                        *count -= 1;
                        Some(*base)
                    }
                }
            }
        };

        let mut heap = shared.heap.lock();
        match rearm {
            // NotFound here means the interval was cancelled while its
            // callback ran; the entry is dropped.
            Some(next) => {
                let _ = heap.restore(r, next, entry);
            }
            None => heap.release(r),
        }
        shared.latest.store(
            heap.root_key().unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }
    trace!("timer worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn started() -> Timers {
        let timers = Timers::new();
        timers.start().unwrap();
        timers
    }

    fn wait_for(pred: impl Fn() -> bool, ms: u64) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(ms);
        while std::time::Instant::now() < deadline {
            if pred() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        pred()
    }

    #[test]
    fn timeout_fires_once() {
        let timers = started();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers
            .add_timeout(clock::after_ns(clock::ms_to_ns(5)), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, 1000));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let timers = started();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers
            .add_timeout(0, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, 1000));
    }

    #[test]
    fn interval_count_fires_exactly_count_times() {
        let timers = started();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers
            .add_interval(
                clock::after_ns(clock::ms_to_ns(2)),
                clock::ms_to_ns(2),
                3,
                move || {
                    f.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();

        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 3, 1000));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(timers.is_empty());
    }

    #[test]
    fn count_one_interval_fires_once() {
        let timers = started();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        timers
            .add_interval(clock::after_ns(clock::ms_to_ns(2)), clock::ms_to_ns(1), 1, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, 1000));
        thread::sleep(Duration::from_millis(10));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_count_interval_repeats_until_cancelled() {
        let timers = started();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = timers
            .add_interval(clock::after_ns(clock::ms_to_ns(1)), clock::ms_to_ns(1), 0, move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_for(|| fired.load(Ordering::SeqCst) >= 5, 1000));
        // May race with a fire in flight; either outcome stops it.
        let _ = timers.cancel(t);
        thread::sleep(Duration::from_millis(10));
        let after = fired.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), after);
    }

    #[test]
    fn cancel_twice_reports_not_found() {
        let timers = started();
        let t = timers
            .add_timeout(clock::after_ns(clock::sec_to_ns(60)), || {})
            .unwrap();
        assert_eq!(timers.cancel(t), Ok(()));
        assert_eq!(timers.cancel(t), Err(Error::NotFound));
    }

    #[test]
    fn callback_reschedules_another_timer() {
        // T1 at +10ms opens T2 (at +500ms) and drags it to +1ms.
        let timers = Arc::new(started());
        let fired_at = Arc::new(AtomicU64::new(0));

        let f = fired_at.clone();
        let t2 = timers
            .add_timeout(clock::after_ns(clock::ms_to_ns(500)), move || {
                f.store(clock::now_ns(), Ordering::SeqCst);
            })
            .unwrap();

        let timers2 = timers.clone();
        let start = clock::now_ns();
        timers
            .add_timeout(clock::after_ns(clock::ms_to_ns(10)), move || {
                let mut open = timers2.open(t2).expect("t2 still pending");
                open.set_deadline(clock::after_ns(clock::ms_to_ns(1)));
            })
            .unwrap();

        assert!(wait_for(|| fired_at.load(Ordering::SeqCst) != 0, 1000));
        let elapsed_ms = (fired_at.load(Ordering::SeqCst) - start) / 1_000_000;
        assert!(elapsed_ms < 100, "rescheduled timer too late: {}ms", elapsed_ms);
    }

    #[test]
    fn callback_adds_new_timer() {
        let timers = Arc::new(started());
        let fired = Arc::new(AtomicUsize::new(0));

        let timers2 = timers.clone();
        let f = fired.clone();
        timers
            .add_timeout(clock::after_ns(clock::ms_to_ns(2)), move || {
                let f = f.clone();
                timers2
                    .add_timeout(clock::after_ns(clock::ms_to_ns(2)), move || {
                        f.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            })
            .unwrap();

        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1, 1000));
    }

    #[test]
    fn raw_guard_batches_operations() {
        let timers = started();
        let (a, b);
        {
            let mut guard = timers.lock();
            a = guard
                .add_timeout_raw(clock::after_ns(clock::sec_to_ns(60)), || {})
                .unwrap();
            b = guard
                .add_timeout_raw(clock::after_ns(clock::sec_to_ns(61)), || {})
                .unwrap();
            guard.cancel_raw(a).unwrap();
        }
        assert_eq!(timers.cancel(a), Err(Error::NotFound));
        assert_eq!(timers.cancel(b), Ok(()));
    }

    #[test]
    fn open_edits_interval_parameters() {
        let timers = started();
        let t = timers
            .add_interval(
                clock::after_ns(clock::sec_to_ns(60)),
                clock::sec_to_ns(1),
                5,
                || {},
            )
            .unwrap();

        {
            let mut open = timers.open(t).unwrap();
            assert_eq!(open.count(), Some(5));
            assert_eq!(open.period(), Some(clock::sec_to_ns(1)));
            assert!(open.set_period(clock::sec_to_ns(2)));
            assert!(open.set_count(1));
        }
        {
            let open = timers.open(t).unwrap();
            assert_eq!(open.period(), Some(clock::sec_to_ns(2)));
            assert_eq!(open.count(), Some(1));
        }
        timers.cancel(t).unwrap();
        assert!(timers.open(t).is_none());
    }

    #[test]
    fn cancel_race_with_fire_is_exclusive() {
        for _ in 0..20 {
            let timers = started();
            let fired = Arc::new(AtomicUsize::new(0));
            let f = fired.clone();
            let t = timers
                .add_timeout(clock::after_ns(clock::ms_to_ns(1)), move || {
                    f.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();

            thread::sleep(Duration::from_millis(1));
            let cancelled = timers.cancel(t).is_ok();
            thread::sleep(Duration::from_millis(20));
            let fire_count = fired.load(Ordering::SeqCst);
            if cancelled {
                assert_eq!(fire_count, 0, "cancelled timer must not fire");
            } else {
                assert_eq!(fire_count, 1, "uncancelled timer must fire once");
            }
        }
    }

    #[test]
    fn stop_async_lets_worker_exit() {
        let timers = started();
        timers.stop_async();
        timers.stop_sync();
        assert!(timers.start().is_err());
    }
}
