//! Combining per-source render images into the displayed image.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::render::image::RenderImage;
use crate::render::projector::{rows_per_band, run_tasks, VolatileProjector};

fn add_argb_saturating(a: u32, b: u32) -> u32 {
    let alpha = ((a >> 24) & 0xff) + ((b >> 24) & 0xff);
    let red = ((a >> 16) & 0xff) + ((b >> 16) & 0xff);
    let green = ((a >> 8) & 0xff) + ((b >> 8) & 0xff);
    let blue = (a & 0xff) + (b & 0xff);
    alpha.min(255) << 24 | red.min(255) << 16 | green.min(255) << 8 | blue.min(255)
}

/// Maps every per-source projector into its own image, then sums the
/// source images channel-wise (saturating) into the target. Succeeds iff
/// every sub-projector succeeded.
pub struct AccumulateProjector {
    children: Vec<VolatileProjector>,
    child_images: Vec<Arc<RenderImage>>,
    target: Arc<RenderImage>,
    cancelled: AtomicBool,
    last_frame_nanos: AtomicU64,
    pool: Option<Arc<rayon::ThreadPool>>,
    num_tasks: usize,
}

impl AccumulateProjector {
    pub fn new(
        children: Vec<VolatileProjector>,
        child_images: Vec<Arc<RenderImage>>,
        target: Arc<RenderImage>,
        pool: Option<Arc<rayon::ThreadPool>>,
        num_tasks: usize,
    ) -> Self {
        debug_assert_eq!(children.len(), child_images.len());
        Self {
            children,
            child_images,
            target,
            cancelled: AtomicBool::new(false),
            last_frame_nanos: AtomicU64::new(0),
            pool,
            num_tasks,
        }
    }

    pub(crate) fn map(&self, clear_untouched_target_pixels: bool) -> bool {
        self.cancelled.store(false, Ordering::Release);
        let t0 = Instant::now();

        for child in &self.children {
            if !child.map(clear_untouched_target_pixels) {
                self.last_frame_nanos
                    .store(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
                return false;
            }
        }
        if self.cancelled.load(Ordering::Acquire) {
            self.last_frame_nanos
                .store(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
            return false;
        }

        let width = self.target.width() as usize;
        let height = self.target.height() as usize;
        let band_rows = rows_per_band(height, self.num_tasks);
        {
            let mut out = self.target.pixels();
            let guards: Vec<_> = self.child_images.iter().map(|img| img.pixels()).collect();
            let sources: Vec<&[u32]> = guards.iter().map(|g| &g[..]).collect();
            let sources = &sources;

            let mut rest: &mut [u32] = &mut out[..];
            let mut tasks = Vec::new();
            let mut row0 = 0usize;
            while row0 < height {
                let rows = band_rows.min(height - row0);
                let (band, tail) = rest.split_at_mut(rows * width);
                rest = tail;
                tasks.push(move || {
                    let offset = row0 * width;
                    for (i, px) in band.iter_mut().enumerate() {
                        let mut sum = 0u32;
                        for source in sources {
                            sum = add_argb_saturating(sum, source[offset + i]);
                        }
                        *px = sum;
                    }
                });
                row0 += rows;
            }
            run_tasks(self.pool.as_deref(), tasks);
        }

        self.last_frame_nanos
            .store(t0.elapsed().as_nanos() as u64, Ordering::Relaxed);
        true
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        for child in &self.children {
            child.cancel();
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.children.iter().all(|child| child.is_valid())
    }

    pub(crate) fn last_frame_nanos(&self) -> u64 {
        self.last_frame_nanos.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RenderJob;
    use crate::render::projector::SingleProjector;
    use crate::volume::{VolatileSample, VolatileSampler};

    struct ConstSampler(f64);

    impl VolatileSampler for ConstSampler {
        fn sample(&self, _x: f64, _y: f64) -> VolatileSample {
            VolatileSample::valid(self.0)
        }
    }

    #[test]
    fn saturating_channel_sum() {
        assert_eq!(
            add_argb_saturating(0xff20_3040, 0xff30_2020),
            0xff50_5060
        );
        assert_eq!(
            add_argb_saturating(0x80ff_0001, 0x90ff_00ff),
            0xffff_00ff
        );
    }

    #[test]
    fn sums_two_sources_into_target() {
        let grey = |v: f64| -> u32 {
            let v = v as u32 & 0xff;
            0xff00_0000 | v << 16 | v << 8 | v
        };
        let images: Vec<_> = (0..2)
            .map(|_| Arc::new(RenderImage::new(6, 4, 0)))
            .collect();
        let target = Arc::new(RenderImage::new(6, 4, 0));
        let children = vec![
            VolatileProjector::Single(SingleProjector::new(
                Box::new(ConstSampler(10.0)),
                Arc::new(grey),
                Arc::clone(&images[0]),
                None,
                1,
                RenderJob::new(),
            )),
            VolatileProjector::Single(SingleProjector::new(
                Box::new(ConstSampler(20.0)),
                Arc::new(grey),
                Arc::clone(&images[1]),
                None,
                1,
                RenderJob::new(),
            )),
        ];
        let p = AccumulateProjector::new(children, images, Arc::clone(&target), None, 2);

        assert!(p.map(false));
        assert!(p.is_valid());
        assert!(target.snapshot().iter().all(|&px| px == grey(30.0)));
    }
}
