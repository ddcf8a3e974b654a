//! Screen-space sampling of volatile volume data.

use cgmath::{Matrix4, SquareMatrix, Vector4};

use crate::volume::block::BlockLoader;
use crate::volume::grid::VolatileBlockGrid;

/// A sample that may not be backed by loaded data yet. Invalid samples
/// leave their pixel to a coarser mipmap pass.
#[derive(Debug, Clone, Copy)]
pub struct VolatileSample {
    pub value: f64,
    pub valid: bool,
}

impl VolatileSample {
    pub fn valid(value: f64) -> Self {
        Self { value, valid: true }
    }

    pub fn invalid() -> Self {
        Self {
            value: 0.0,
            valid: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    NearestNeighbor,
    NLinear,
}

/// Continuous view of one mipmap level in screen-image coordinates.
/// Sampling transitively touches the block grid and thus the cache.
pub trait VolatileSampler: Send + Sync {
    fn sample(&self, x: f64, y: f64) -> VolatileSample;
}

/// Samples a block grid through the inverse of a source-to-screen affine.
pub struct GridSampler<L: BlockLoader> {
    grid: VolatileBlockGrid<L>,
    screen_to_source: Matrix4<f64>,
    interpolation: Interpolation,
}

impl<L: BlockLoader> GridSampler<L> {
    pub fn new(
        grid: VolatileBlockGrid<L>,
        source_to_screen: &Matrix4<f64>,
        interpolation: Interpolation,
    ) -> Self {
        let screen_to_source = source_to_screen.invert().unwrap_or_else(|| {
            log::warn!("source-to-screen transform is singular, sampling identity");
            Matrix4::identity()
        });
        Self {
            grid,
            screen_to_source,
            interpolation,
        }
    }
}

impl<L: BlockLoader> VolatileSampler for GridSampler<L> {
    fn sample(&self, x: f64, y: f64) -> VolatileSample {
        let p = self.screen_to_source * Vector4::new(x, y, 0.0, 1.0);
        match self.interpolation {
            Interpolation::NearestNeighbor => self.grid.voxel([
                p.x.round() as i64,
                p.y.round() as i64,
                p.z.round() as i64,
            ]),
            Interpolation::NLinear => {
                let base = [p.x.floor(), p.y.floor(), p.z.floor()];
                let frac = [p.x - base[0], p.y - base[1], p.z - base[2]];
                let mut value = 0.0;
                for corner in 0..8u32 {
                    let mut weight = 1.0;
                    let mut voxel = [0i64; 3];
                    for d in 0..3 {
                        if corner >> d & 1 == 1 {
                            weight *= frac[d];
                            voxel[d] = base[d] as i64 + 1;
                        } else {
                            weight *= 1.0 - frac[d];
                            voxel[d] = base[d] as i64;
                        }
                    }
                    if weight == 0.0 {
                        continue;
                    }
                    let sample = self.grid.voxel(voxel);
                    if !sample.valid {
                        return VolatileSample::invalid();
                    }
                    value += weight * sample.value;
                }
                VolatileSample::valid(value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BlockCache, CacheConfig, CacheGeometry, LoadingStrategy};
    use crate::volume::block::{BlockLoader, LoaderError, VolatileShortArray};
    use std::sync::Arc;

    struct ConstLoader(u16);

    impl BlockLoader for ConstLoader {
        type Payload = VolatileShortArray;

        fn bytes_per_element(&self) -> usize {
            2
        }

        fn load_block(
            &self,
            _timepoint: u32,
            _setup: u32,
            _level: u32,
            dims: [u32; 3],
            _origin: [i64; 3],
        ) -> Result<VolatileShortArray, LoaderError> {
            let n = dims.iter().map(|&d| d as usize).product();
            Ok(VolatileShortArray::valid(vec![self.0; n]))
        }

        fn empty_payload(&self, dims: [u32; 3]) -> VolatileShortArray {
            VolatileShortArray::invalid(dims.iter().map(|&d| d as usize).product())
        }
    }

    fn sampler(interpolation: Interpolation) -> GridSampler<ConstLoader> {
        let cache = Arc::new(BlockCache::new(
            ConstLoader(40),
            CacheGeometry::uniform(1, 1, 1),
            CacheConfig {
                num_fetcher_threads: 0,
                soft_cache_blocks: 64,
            },
        ));
        let grid =
            VolatileBlockGrid::new(cache, 0, 0, 0, [8, 8, 8], [8, 8, 8], LoadingStrategy::Blocking);
        GridSampler::new(grid, &Matrix4::identity(), interpolation)
    }

    #[test]
    fn nearest_samples_through_identity() {
        let s = sampler(Interpolation::NearestNeighbor);
        let sample = s.sample(3.0, 4.0);
        assert!(sample.valid);
        assert_eq!(sample.value, 40.0);
    }

    #[test]
    fn nlinear_interpolates_constant_field_exactly() {
        let s = sampler(Interpolation::NLinear);
        let sample = s.sample(2.5, 3.25);
        assert!(sample.valid);
        assert!((sample.value - 40.0).abs() < 1e-9);
    }
}
