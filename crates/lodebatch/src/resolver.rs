use crate::{Result, manager::BatchLookup};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::Wake,
    thread::{self, Thread},
};
#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default size of the driver's task window before the first flush.
///
/// Once a flush has settled, the window shrinks to the largest
/// preferred batch size across the registered slots, so the live set
/// stays just big enough to fill batches.
pub const INITIAL_WINDOW: usize = 2000;

/// Resolves a lazy sequence of lookup tasks against `manager`,
/// yielding their outputs in strict source order.
///
/// Each task is an ordinary future that issues lookups through
/// `manager` and resolves to a [`Result`]. The returned iterator pulls
/// tasks lazily, keeps a bounded window of them live, flushes the
/// fullest batch slot whenever none has reached its preferred size,
/// and yields task outputs as their batches settle. The first `Err`
/// is yielded once and ends the iteration.
///
/// Tasks must issue their lookups against `manager`; a task may also
/// await unrelated futures (timers, channels), which the driver waits
/// out by parking until their wakers fire.
pub fn resolve<I, T>(tasks: I, manager: &BatchLookup) -> BatchResolver<I::IntoIter, T>
where
    I: IntoIterator,
    I::Item: Future<Output = Result<T>>,
{
    BatchResolver {
        source: Some(tasks.into_iter()),
        manager: manager.clone(),
        buf: VecDeque::new(),
        window: INITIAL_WINDOW,
        window_settled: false,
        failed: false,
    }
}

/// The driver loop behind [`resolve`]. See there for semantics.
pub struct BatchResolver<I, T>
where
    I: Iterator,
    I::Item: Future<Output = Result<T>>,
{
    /// `None` once the input iterator is exhausted.
    source: Option<I>,
    manager: BatchLookup,
    buf: VecDeque<Task<I::Item, T>>,
    window: usize,
    window_settled: bool,
    failed: bool,
}

impl<I, T> BatchResolver<I, T>
where
    I: Iterator,
    I::Item: Future<Output = Result<T>>,
{
    /// Overrides the pre-flush window size (the number of tasks kept
    /// live before any batch has been observed). The default is
    /// [`INITIAL_WINDOW`].
    #[must_use]
    pub fn with_initial_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Pulls the next task from the source and polls it once, so its
    /// first lookup deposits a key before the fill decision is
    /// revisited.
    fn spawn_next(&mut self) {
        let Some(source) = &mut self.source else {
            return;
        };
        match source.next() {
            Some(fut) => {
                let flag = Arc::new(WakeFlag::new());
                let waker = Waker::from(flag.clone());
                let mut task = Task {
                    fut: Some(Box::pin(fut)),
                    done: None,
                    flag,
                    waker,
                };
                poll_task(&mut task);
                self.buf.push_back(task);
            }
            None => self.source = None,
        }
    }

    /// Re-polls woken tasks until none is woken: the stand-in for
    /// inline continuation resumption. A resumed task may enqueue more
    /// keys or schedule another flush; both are picked up by the drain
    /// loop around this.
    fn pump(&mut self) {
        loop {
            let mut progressed = false;
            for task in &mut self.buf {
                if task.fut.is_some() && task.flag.take() {
                    poll_task(task);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    /// Settles every queued resolution, resuming awaiters after each.
    /// After the first settled flush the window is retuned to the
    /// largest registered batch size.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all))]
    fn drain(&mut self) {
        let mut settled = false;
        while let Some(resolution) = self.manager.pop_resolution() {
            resolution.settle();
            self.pump();
            settled = true;
        }
        if settled && !self.window_settled {
            self.window_settled = true;
            let max = self.manager.max_batch_size();
            if max > 0 {
                self.window = max;
            }
        }
    }

    /// Parks until the head task completes or core work (a queued
    /// resolution or a newly buffered key) appears. Only reached when
    /// every live task is waiting on something outside the manager.
    fn block_on_head(&mut self) {
        loop {
            if self.buf.front().is_none_or(|task| task.done.is_some()) {
                return;
            }
            if !self.manager.resolve_queue_is_empty() || self.manager.any_pending() {
                return;
            }
            let mut woke = false;
            for task in &mut self.buf {
                if task.fut.is_some() && task.flag.take() {
                    poll_task(task);
                    woke = true;
                }
            }
            if !woke {
                // Wakers unpark this thread, and an unpark that lands
                // before the park makes it return immediately, so no
                // wakeup can be lost between the check and the park.
                thread::park();
            }
        }
    }
}

impl<I, T> Iterator for BatchResolver<I, T>
where
    I: Iterator,
    I::Item: Future<Output = Result<T>>,
{
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.failed {
            return None;
        }
        loop {
            // Yield phase: completed head tasks leave in source order.
            if self.buf.front().is_some_and(|task| task.done.is_some()) {
                let task = self.buf.pop_front()?;
                let out = task.done?;
                if out.is_err() {
                    self.failed = true;
                }
                return Some(out);
            }
            if self.buf.is_empty() && self.source.is_none() {
                return None;
            }

            // Fill phase: grow the live window until a flush is queued,
            // the window is full, or the input runs dry.
            while self.manager.resolve_queue_is_empty()
                && self.buf.len() < self.window
                && self.source.is_some()
            {
                self.spawn_next();
            }

            // Drain phase.
            self.drain();

            if self.buf.front().is_some_and(|task| task.done.is_some()) {
                continue;
            }
            if self.buf.is_empty() {
                continue;
            }
            // Progress: flush the fullest partially filled slot, or
            // wait out tasks suspended on non-lookup futures.
            if self.manager.flush_fullest() {
                continue;
            }
            self.block_on_head();
        }
    }
}

/// One live task in the driver's window.
struct Task<F, T>
where
    F: Future<Output = Result<T>>,
{
    /// `None` once the future has completed.
    fut: Option<Pin<Box<F>>>,
    done: Option<Result<T>>,
    flag: Arc<WakeFlag>,
    waker: Waker,
}

fn poll_task<F, T>(task: &mut Task<F, T>)
where
    F: Future<Output = Result<T>>,
{
    let Some(fut) = &mut task.fut else {
        return;
    };
    let mut cx = Context::from_waker(&task.waker);
    if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
        task.done = Some(out);
        task.fut = None;
    }
}

/// Per-task waker: marks the task runnable and unparks the driver
/// thread, so completions from other threads (timers, channels) can
/// interrupt [`BatchResolver::block_on_head`].
struct WakeFlag {
    woken: AtomicBool,
    driver: Thread,
}

impl WakeFlag {
    fn new() -> Self {
        Self {
            // The driver polls a freshly spawned task itself, so the
            // flag only tracks wakes after that first poll.
            woken: AtomicBool::new(false),
            driver: thread::current(),
        }
    }

    fn take(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }
}

impl Wake for WakeFlag {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);
        self.driver.unpark();
    }
}
