//! A multi-resolution volume source backed by the block cache.

use std::sync::Arc;

use cgmath::Matrix4;

use crate::cache::{BlockCache, LoadingStrategy};
use crate::render::prefetch::prefetch_level;
use crate::viewer::RenderSource;
use crate::volume::{BlockLoader, GridSampler, Interpolation, VolatileBlockGrid, VolatileSampler};

/// Blocks touched per prefetch hint at most.
const MAX_PREFETCH_BLOCKS: usize = 4096;

/// One setup of a cached volume: per-level block grids, a linear
/// grey-scale converter and the mipmap transforms tying the levels
/// together.
pub struct VolumeSource<L: BlockLoader> {
    cache: Arc<BlockCache<L>>,
    setup: u32,
    name: String,
    base_dims: [u64; 3],
    block_size: [u32; 3],
    /// Downsampling factors per level; `[1, 1, 1]` for level 0.
    level_scales: Vec<[f64; 3]>,
    base_transform: Matrix4<f64>,
    display_range: (f64, f64),
}

impl<L: BlockLoader> VolumeSource<L> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<BlockCache<L>>,
        setup: u32,
        name: impl Into<String>,
        base_dims: [u64; 3],
        block_size: [u32; 3],
        level_scales: Vec<[f64; 3]>,
        base_transform: Matrix4<f64>,
        display_range: (f64, f64),
    ) -> Self {
        assert!(!level_scales.is_empty(), "source needs at least one level");
        Self {
            cache,
            setup,
            name: name.into(),
            base_dims,
            block_size,
            level_scales,
            base_transform,
            display_range,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level_dims(&self, level: usize) -> [u64; 3] {
        let scale = self.level_scales[level];
        [
            ((self.base_dims[0] as f64 / scale[0]).ceil() as u64).max(1),
            ((self.base_dims[1] as f64 / scale[1]).ceil() as u64).max(1),
            ((self.base_dims[2] as f64 / scale[2]).ceil() as u64).max(1),
        ]
    }

    fn grid(&self, timepoint: u32, level: usize, strategy: LoadingStrategy) -> VolatileBlockGrid<L> {
        VolatileBlockGrid::new(
            Arc::clone(&self.cache),
            timepoint,
            self.setup,
            level as u32,
            self.level_dims(level),
            self.block_size,
            strategy,
        )
    }
}

impl<L: BlockLoader> RenderSource for VolumeSource<L> {
    fn num_mipmap_levels(&self) -> usize {
        self.level_scales.len()
    }

    fn volatile_available(&self) -> bool {
        true
    }

    fn source_transform(&self, _timepoint: u32, level: usize) -> Matrix4<f64> {
        let scale = self.level_scales[level];
        let mut mipmap = Matrix4::from_nonuniform_scale(scale[0], scale[1], scale[2]);
        // half-sample offset so downsampled voxel centers line up
        mipmap.w.x = 0.5 * (scale[0] - 1.0);
        mipmap.w.y = 0.5 * (scale[1] - 1.0);
        mipmap.w.z = 0.5 * (scale[2] - 1.0);
        self.base_transform * mipmap
    }

    fn sampler(
        &self,
        timepoint: u32,
        level: usize,
        interpolation: Interpolation,
        source_to_screen: &Matrix4<f64>,
        strategy: LoadingStrategy,
    ) -> Box<dyn VolatileSampler> {
        Box::new(GridSampler::new(
            self.grid(timepoint, level, strategy),
            source_to_screen,
            interpolation,
        ))
    }

    fn convert(&self, value: f64) -> u32 {
        let (min, max) = self.display_range;
        let scaled = if max > min {
            ((value - min) / (max - min) * 255.0).clamp(0.0, 255.0)
        } else {
            0.0
        };
        let grey = scaled as u32;
        0xff00_0000 | grey << 16 | grey << 8 | grey
    }

    fn prefetch(
        &self,
        timepoint: u32,
        level: usize,
        source_to_screen: &Matrix4<f64>,
        screen_size: (u32, u32),
    ) {
        prefetch_level(
            &self.grid(timepoint, level, LoadingStrategy::Volatile),
            source_to_screen,
            screen_size.0,
            screen_size.1,
            MAX_PREFETCH_BLOCKS,
        );
    }
}
