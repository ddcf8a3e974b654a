//! Projectors turn source samples into screen images.
//!
//! All projector kinds share one contract: `map` renders a pass and
//! reports success, `cancel` aborts the pass at the next row-batch
//! boundary, `is_valid` becomes sticky-true once every pixel has been
//! covered by finished data.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::io_timing::{self, RenderJob};
use crate::render::accumulate::AccumulateProjector;
use crate::render::hierarchical::VolatileHierarchicalProjector;
use crate::render::image::RenderImage;
use crate::volume::VolatileSampler;

/// Maps a raw sample value to ARGB.
pub type Converter = dyn Fn(f64) -> u32 + Send + Sync;

/// Run row-band tasks on the rendering pool, or inline when none is
/// configured.
pub(crate) fn run_tasks<F: FnOnce() + Send>(pool: Option<&rayon::ThreadPool>, tasks: Vec<F>) {
    match pool {
        Some(pool) => pool.scope(move |scope| {
            for task in tasks {
                scope.spawn(move |_| task());
            }
        }),
        None => {
            for task in tasks {
                task();
            }
        }
    }
}

/// Splits `height` rows into at most `num_tasks` contiguous bands.
pub(crate) fn rows_per_band(height: usize, num_tasks: usize) -> usize {
    height.div_ceil(num_tasks.max(1)).max(1)
}

pub enum VolatileProjector {
    Empty(EmptyProjector),
    Single(SingleProjector),
    Accumulate(AccumulateProjector),
    Hierarchical(VolatileHierarchicalProjector),
}

impl VolatileProjector {
    /// Render one pass. Returns `false` iff the pass was cancelled.
    pub fn map(&self, clear_untouched_target_pixels: bool) -> bool {
        match self {
            VolatileProjector::Empty(p) => p.map(),
            VolatileProjector::Single(p) => p.map(),
            VolatileProjector::Accumulate(p) => p.map(clear_untouched_target_pixels),
            VolatileProjector::Hierarchical(p) => p.map(clear_untouched_target_pixels),
        }
    }

    pub fn cancel(&self) {
        match self {
            VolatileProjector::Empty(_) => {}
            VolatileProjector::Single(p) => p.cancel(),
            VolatileProjector::Accumulate(p) => p.cancel(),
            VolatileProjector::Hierarchical(p) => p.cancel(),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            VolatileProjector::Empty(p) => p.is_valid(),
            VolatileProjector::Single(p) => p.is_valid(),
            VolatileProjector::Accumulate(p) => p.is_valid(),
            VolatileProjector::Hierarchical(p) => p.is_valid(),
        }
    }

    pub fn last_frame_nanos(&self) -> u64 {
        match self {
            VolatileProjector::Empty(p) => p.last_frame_nanos(),
            VolatileProjector::Single(p) => p.last_frame_nanos(),
            VolatileProjector::Accumulate(p) => p.last_frame_nanos(),
            VolatileProjector::Hierarchical(p) => p.last_frame_nanos(),
        }
    }
}

/// Clears the target; used when no source is visible.
pub struct EmptyProjector {
    target: Arc<RenderImage>,
    valid: AtomicBool,
    last_frame_nanos: AtomicU64,
}

impl EmptyProjector {
    pub fn new(target: Arc<RenderImage>) -> Self {
        Self {
            target,
            valid: AtomicBool::new(false),
            last_frame_nanos: AtomicU64::new(0),
        }
    }

    fn map(&self) -> bool {
        let t0 = Instant::now();
        self.target.pixels().fill(0);
        self.valid.store(true, Ordering::Release);
        self.last_frame_nanos
            .store(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
        true
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn last_frame_nanos(&self) -> u64 {
        self.last_frame_nanos.load(Ordering::Relaxed)
    }
}

/// One full pass over a single non-volatile source at a fixed level. The
/// sampler blocks until data is there, so a finished pass covers every
/// pixel.
pub struct SingleProjector {
    sampler: Box<dyn VolatileSampler>,
    converter: Arc<Converter>,
    target: Arc<RenderImage>,
    cancelled: AtomicBool,
    valid: AtomicBool,
    last_frame_nanos: AtomicU64,
    pool: Option<Arc<rayon::ThreadPool>>,
    num_tasks: usize,
    job: RenderJob,
}

impl SingleProjector {
    pub fn new(
        sampler: Box<dyn VolatileSampler>,
        converter: Arc<Converter>,
        target: Arc<RenderImage>,
        pool: Option<Arc<rayon::ThreadPool>>,
        num_tasks: usize,
        job: RenderJob,
    ) -> Self {
        Self {
            sampler,
            converter,
            target,
            cancelled: AtomicBool::new(false),
            valid: AtomicBool::new(false),
            last_frame_nanos: AtomicU64::new(0),
            pool,
            num_tasks,
            job,
        }
    }

    fn map(&self) -> bool {
        self.cancelled.store(false, Ordering::Release);
        let t0 = Instant::now();
        let width = self.target.width() as usize;
        let height = self.target.height() as usize;
        let band_rows = rows_per_band(height, self.num_tasks);

        {
            let mut pixels = self.target.pixels();
            let mut rest: &mut [u32] = &mut pixels[..];
            let mut tasks = Vec::new();
            let mut row0 = 0usize;
            while row0 < height {
                let rows = band_rows.min(height - row0);
                let (band, tail) = rest.split_at_mut(rows * width);
                rest = tail;
                let sampler: &dyn VolatileSampler = &*self.sampler;
                let converter = Arc::clone(&self.converter);
                let cancelled = &self.cancelled;
                let job = self.job;
                tasks.push(move || {
                    let _job = io_timing::enter_job(job);
                    for r in 0..rows {
                        if cancelled.load(Ordering::Relaxed) {
                            return;
                        }
                        let y = (row0 + r) as f64;
                        let row = &mut band[r * width..(r + 1) * width];
                        for (x, px) in row.iter_mut().enumerate() {
                            let sample = sampler.sample(x as f64, y);
                            *px = converter(sample.value);
                        }
                    }
                });
                row0 += rows;
            }
            run_tasks(self.pool.as_deref(), tasks);
        }

        self.last_frame_nanos
            .store(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        self.valid.store(true, Ordering::Release);
        true
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn last_frame_nanos(&self) -> u64 {
        self.last_frame_nanos.load(Ordering::Relaxed)
    }
}
