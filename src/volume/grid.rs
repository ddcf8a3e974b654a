//! Block-addressed view over one mipmap level of a volume.

use std::sync::Arc;

use crate::cache::{BlockCache, BlockKey, CacheBlock, LoadingStrategy};
use crate::volume::block::{BlockLoader, BlockPayload};
use crate::volume::sampler::VolatileSample;

/// Maps 3D block positions of one `(timepoint, setup, level)` to cache
/// entries, creating placeholders on demand. Never blocks unless its
/// strategy is BLOCKING.
pub struct VolatileBlockGrid<L: BlockLoader> {
    cache: Arc<BlockCache<L>>,
    timepoint: u32,
    setup: u32,
    level: u32,
    /// Extent of the level in voxels.
    dims: [u64; 3],
    block_size: [u32; 3],
    grid_dims: [u64; 3],
    strategy: LoadingStrategy,
}

impl<L: BlockLoader> VolatileBlockGrid<L> {
    pub fn new(
        cache: Arc<BlockCache<L>>,
        timepoint: u32,
        setup: u32,
        level: u32,
        dims: [u64; 3],
        block_size: [u32; 3],
        strategy: LoadingStrategy,
    ) -> Self {
        let grid_dims = [
            dims[0].div_ceil(block_size[0] as u64),
            dims[1].div_ceil(block_size[1] as u64),
            dims[2].div_ceil(block_size[2] as u64),
        ];
        Self {
            cache,
            timepoint,
            setup,
            level,
            dims,
            block_size,
            grid_dims,
            strategy,
        }
    }

    pub fn dims(&self) -> [u64; 3] {
        self.dims
    }

    pub fn block_size(&self) -> [u32; 3] {
        self.block_size
    }

    pub fn grid_dims(&self) -> [u64; 3] {
        self.grid_dims
    }

    pub fn num_blocks(&self) -> u64 {
        self.grid_dims.iter().product()
    }

    pub fn linear_index(&self, pos: [u64; 3]) -> u64 {
        (pos[2] * self.grid_dims[1] + pos[1]) * self.grid_dims[0] + pos[0]
    }

    /// Dimensions of the block at `pos`, truncated at the volume border.
    pub fn block_dims(&self, pos: [u64; 3]) -> [u32; 3] {
        let mut dims = [0u32; 3];
        for d in 0..3 {
            let start = pos[d] * self.block_size[d] as u64;
            dims[d] = (self.dims[d] - start).min(self.block_size[d] as u64) as u32;
        }
        dims
    }

    pub fn block_origin(&self, pos: [u64; 3]) -> [i64; 3] {
        [
            (pos[0] * self.block_size[0] as u64) as i64,
            (pos[1] * self.block_size[1] as u64) as i64,
            (pos[2] * self.block_size[2] as u64) as i64,
        ]
    }

    /// The block at grid position `pos`; its payload may be invalid.
    pub fn get(&self, pos: [u64; 3]) -> CacheBlock<L::Payload> {
        self.get_with(pos, self.strategy)
    }

    pub(crate) fn get_with(
        &self,
        pos: [u64; 3],
        strategy: LoadingStrategy,
    ) -> CacheBlock<L::Payload> {
        let key = BlockKey::new(
            self.timepoint,
            self.setup,
            self.level,
            self.linear_index(pos),
            self.cache.geometry(),
        );
        if let Some(block) = self.cache.get_if_present(&key, strategy) {
            return block;
        }
        self.cache
            .get_or_create(key, self.block_dims(pos), self.block_origin(pos), strategy)
    }

    /// Sample the voxel at `p`. Outside the volume the sample is valid
    /// background (zero); inside, validity follows the block payload.
    pub fn voxel(&self, p: [i64; 3]) -> VolatileSample {
        for d in 0..3 {
            if p[d] < 0 || p[d] as u64 >= self.dims[d] {
                return VolatileSample::valid(0.0);
            }
        }
        let pos = [
            p[0] as u64 / self.block_size[0] as u64,
            p[1] as u64 / self.block_size[1] as u64,
            p[2] as u64 / self.block_size[2] as u64,
        ];
        let block = self.get(pos);
        let payload = block.payload();
        if !payload.is_valid() {
            return VolatileSample::invalid();
        }
        let dims = block.dims();
        let origin = block.origin();
        let local = [
            (p[0] - origin[0]) as usize,
            (p[1] - origin[1]) as usize,
            (p[2] - origin[2]) as usize,
        ];
        let index = (local[2] * dims[1] as usize + local[1]) * dims[0] as usize + local[0];
        VolatileSample::valid(payload.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheGeometry};
    use crate::volume::block::{LoaderError, VolatileShortArray};
    use crate::volume::BlockPayload;

    struct RampLoader;

    impl BlockLoader for RampLoader {
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
            origin: [i64; 3],
        ) -> Result<VolatileShortArray, LoaderError> {
            let mut data = Vec::with_capacity(dims.iter().map(|&d| d as usize).product());
            for z in 0..dims[2] as i64 {
                for y in 0..dims[1] as i64 {
                    for x in 0..dims[0] as i64 {
                        data.push((origin[0] + x + origin[1] + y + origin[2] + z) as u16);
                    }
                }
            }
            Ok(VolatileShortArray::valid(data))
        }

        fn empty_payload(&self, dims: [u32; 3]) -> VolatileShortArray {
            VolatileShortArray::invalid(dims.iter().map(|&d| d as usize).product())
        }
    }

    fn grid(strategy: LoadingStrategy) -> VolatileBlockGrid<RampLoader> {
        let cache = Arc::new(BlockCache::new(
            RampLoader,
            CacheGeometry::uniform(1, 1, 1),
            CacheConfig {
                num_fetcher_threads: 0,
                soft_cache_blocks: 64,
            },
        ));
        VolatileBlockGrid::new(cache, 0, 0, 0, [10, 7, 5], [4, 4, 4], strategy)
    }

    #[test]
    fn grid_layout_truncates_edge_blocks() {
        let grid = grid(LoadingStrategy::Volatile);
        assert_eq!(grid.grid_dims(), [3, 2, 2]);
        assert_eq!(grid.num_blocks(), 12);
        assert_eq!(grid.block_dims([0, 0, 0]), [4, 4, 4]);
        assert_eq!(grid.block_dims([2, 1, 1]), [2, 3, 1]);
        assert_eq!(grid.block_origin([2, 1, 1]), [8, 4, 4]);
        assert_eq!(grid.linear_index([2, 1, 1]), (1 * 2 + 1) * 3 + 2);
    }

    #[test]
    fn volatile_voxel_is_invalid_until_loaded() {
        let grid = grid(LoadingStrategy::Volatile);
        let sample = grid.voxel([1, 1, 1]);
        assert!(!sample.valid);
    }

    #[test]
    fn blocking_voxel_reads_through() {
        let grid = grid(LoadingStrategy::Blocking);
        let sample = grid.voxel([9, 6, 4]);
        assert!(sample.valid);
        assert_eq!(sample.value, 19.0);
    }

    #[test]
    fn out_of_bounds_is_valid_background() {
        let grid = grid(LoadingStrategy::Volatile);
        let sample = grid.voxel([-1, 0, 0]);
        assert!(sample.valid);
        assert_eq!(sample.value, 0.0);
        assert!(grid.voxel([10, 0, 0]).valid);
    }

    #[test]
    fn edge_block_payload_is_sized_to_truncated_dims() {
        let grid = grid(LoadingStrategy::Blocking);
        let block = grid.get([2, 1, 1]);
        assert_eq!(block.payload().num_elements(), 2 * 3 * 1);
    }
}
