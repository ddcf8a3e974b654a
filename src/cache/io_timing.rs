//! Per-render-job measuring and budgeting of time spent in blocking I/O.
//!
//! A render job groups the painter thread and the workers its projectors
//! dispatch. Each job owns one [`IoStatistics`] aggregating the blocking
//! I/O time of all its threads, and optionally an [`IoTimeBudget`] that
//! bounds how long those threads may stall on loads per frame, stratified
//! by request priority.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Handle identifying a rendering job. Threads not attached to any job
/// report into the detached job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderJob(u64);

static NEXT_JOB: AtomicU64 = AtomicU64::new(1);

impl RenderJob {
    /// The job that threads without an installed scope report into.
    pub const DETACHED: RenderJob = RenderJob(0);

    pub fn new() -> Self {
        RenderJob(NEXT_JOB.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RenderJob {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_JOB: Cell<RenderJob> = const { Cell::new(RenderJob(0)) };
}

/// Installs `job` as the calling thread's render job until dropped.
pub struct JobScope {
    previous: RenderJob,
}

pub fn enter_job(job: RenderJob) -> JobScope {
    let previous = CURRENT_JOB.with(|c| c.replace(job));
    JobScope { previous }
}

pub fn current_job() -> RenderJob {
    CURRENT_JOB.with(|c| c.get())
}

impl Drop for JobScope {
    fn drop(&mut self) {
        CURRENT_JOB.with(|c| c.set(self.previous));
    }
}

fn registry() -> &'static DashMap<RenderJob, Arc<IoStatistics>> {
    static REGISTRY: OnceLock<DashMap<RenderJob, Arc<IoStatistics>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Statistics of the calling thread's render job.
pub fn statistics() -> Arc<IoStatistics> {
    statistics_for(current_job())
}

pub fn statistics_for(job: RenderJob) -> Arc<IoStatistics> {
    let entry = registry()
        .entry(job)
        .or_insert_with(|| Arc::new(IoStatistics::new()));
    Arc::clone(entry.value())
}

struct StopWatch {
    running_since: Option<Instant>,
    accumulated: Duration,
}

impl StopWatch {
    fn new() -> Self {
        Self {
            running_since: None,
            accumulated: Duration::ZERO,
        }
    }

    fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    fn nanos(&self) -> u64 {
        let running = self
            .running_since
            .map(|since| since.elapsed())
            .unwrap_or(Duration::ZERO);
        (self.accumulated + running).as_nanos() as u64
    }
}

struct StatsState {
    group_watch: StopWatch,
    num_running_threads: u32,
    budget: Option<Arc<IoTimeBudget>>,
}

/// Aggregates blocking-I/O time over all threads of one render job.
///
/// The group stopwatch runs whenever at least one thread of the job is
/// inside a blocking load or wait; per-thread stopwatches additionally
/// record cumulative per-thread time.
pub struct IoStatistics {
    state: Mutex<StatsState>,
    per_thread: DashMap<ThreadId, Mutex<StopWatch>>,
    io_bytes: AtomicU64,
}

impl IoStatistics {
    fn new() -> Self {
        Self {
            state: Mutex::new(StatsState {
                group_watch: StopWatch::new(),
                num_running_threads: 0,
                budget: None,
            }),
            per_thread: DashMap::new(),
            io_bytes: AtomicU64::new(0),
        }
    }

    /// Mark the calling thread as blocking on I/O. Starts the group
    /// stopwatch on the 0 -> 1 running-thread transition.
    pub fn start(&self) {
        self.thread_watch(|w| w.start());
        let mut state = self.state.lock();
        if state.num_running_threads == 0 {
            state.group_watch.start();
        }
        state.num_running_threads += 1;
    }

    /// Symmetric to [`IoStatistics::start`]; stops the group stopwatch on
    /// the 1 -> 0 transition.
    pub fn stop(&self) {
        self.thread_watch(|w| w.stop());
        let mut state = self.state.lock();
        state.num_running_threads = state.num_running_threads.saturating_sub(1);
        if state.num_running_threads == 0 {
            state.group_watch.stop();
        }
    }

    fn thread_watch(&self, f: impl FnOnce(&mut StopWatch)) {
        let entry = self
            .per_thread
            .entry(std::thread::current().id())
            .or_insert_with(|| Mutex::new(StopWatch::new()));
        f(&mut entry.value().lock());
    }

    /// Nanoseconds the group stopwatch has run so far.
    pub fn io_nanos(&self) -> u64 {
        self.state.lock().group_watch.nanos()
    }

    /// Sum over all per-thread stopwatches.
    pub fn cumulative_io_nanos(&self) -> u64 {
        self.per_thread.iter().map(|w| w.value().lock().nanos()).sum()
    }

    pub fn add_io_bytes(&self, n: u64) {
        self.io_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn io_bytes(&self) -> u64 {
        self.io_bytes.load(Ordering::Relaxed)
    }

    pub fn io_time_budget(&self) -> Option<Arc<IoTimeBudget>> {
        self.state.lock().budget.clone()
    }

    pub fn set_io_time_budget(&self, budget: Arc<IoTimeBudget>) {
        self.state.lock().budget = Some(budget);
    }
}

/// Budget of time that can be spent in blocking I/O, grouped by priority
/// level (0 is the highest).
///
/// Invariant: `budget[i] <= budget[i - 1]` for all `i >= 1`. Using time
/// at level `l` charges levels `0..=l` and then clamps the higher indices
/// back down to restore the invariant.
pub struct IoTimeBudget {
    budget: Mutex<Vec<i64>>,
}

impl IoTimeBudget {
    pub fn new(num_levels: usize) -> Self {
        Self {
            budget: Mutex::new(vec![0; num_levels.max(1)]),
        }
    }

    /// Install `partial` as the new budget, extending it with its last
    /// value, then enforce the monotone non-increase invariant top-down.
    /// `None` clears the budget.
    pub fn reset(&self, partial: Option<&[i64]>) {
        let mut budget = self.budget.lock();
        match partial {
            None => budget.iter_mut().for_each(|b| *b = 0),
            Some(partial) if partial.is_empty() => budget.iter_mut().for_each(|b| *b = 0),
            Some(partial) => {
                for i in 0..budget.len() {
                    budget[i] = *partial.get(i).unwrap_or(&partial[partial.len() - 1]);
                }
                for i in 1..budget.len() {
                    if budget[i] > budget[i - 1] {
                        budget[i] = budget[i - 1];
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        self.reset(None);
    }

    pub fn time_left(&self, level: usize) -> i64 {
        let budget = self.budget.lock();
        budget[level.min(budget.len() - 1)]
    }

    /// Charge `t` nanoseconds at `level`.
    pub fn use_time(&self, t: i64, level: usize) {
        let mut budget = self.budget.lock();
        let level = level.min(budget.len() - 1);
        for l in 0..=level {
            budget[l] -= t;
        }
        for l in (level + 1)..budget.len() {
            if budget[l] > budget[l - 1] {
                budget[l] = budget[l - 1];
            } else {
                break;
            }
        }
    }

    #[cfg(test)]
    fn levels(&self) -> Vec<i64> {
        self.budget.lock().clone()
    }
}
