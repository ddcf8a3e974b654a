//! Best-effort warming of the fetch queue ahead of sampling.

use cgmath::{Matrix4, SquareMatrix, Vector4};

use crate::cache::LoadingStrategy;
use crate::volume::{BlockLoader, VolatileBlockGrid};

/// Touch every block the rendered slice may sample from, through the
/// VOLATILE path, so fetchers start loading before the projector asks
/// for the first pixel. Bounded by `max_blocks`; purely a hint.
pub fn prefetch_level<L: BlockLoader>(
    grid: &VolatileBlockGrid<L>,
    source_to_screen: &Matrix4<f64>,
    screen_width: u32,
    screen_height: u32,
    max_blocks: usize,
) {
    if screen_width == 0 || screen_height == 0 {
        return;
    }
    let Some(inverse) = source_to_screen.invert() else {
        return;
    };

    // bounding box of the projected screen rectangle in source space
    let w = (screen_width - 1) as f64;
    let h = (screen_height - 1) as f64;
    let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)];
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for (x, y) in corners {
        let p = inverse * Vector4::new(x, y, 0.0, 1.0);
        for (d, v) in [p.x, p.y, p.z].into_iter().enumerate() {
            lo[d] = lo[d].min(v);
            hi[d] = hi[d].max(v);
        }
    }

    let dims = grid.dims();
    let block_size = grid.block_size();
    let mut block_lo = [0u64; 3];
    let mut block_hi = [0u64; 3];
    for d in 0..3 {
        let lo_voxel = lo[d].floor().max(0.0);
        let hi_voxel = hi[d].ceil().min((dims[d] - 1) as f64);
        if lo_voxel > hi_voxel {
            return;
        }
        block_lo[d] = lo_voxel as u64 / block_size[d] as u64;
        block_hi[d] = hi_voxel as u64 / block_size[d] as u64;
    }

    let mut touched = 0usize;
    for bz in block_lo[2]..=block_hi[2] {
        for by in block_lo[1]..=block_hi[1] {
            for bx in block_lo[0]..=block_hi[0] {
                if touched >= max_blocks {
                    log::debug!("prefetch truncated after {} blocks", touched);
                    return;
                }
                grid.get_with([bx, by, bz], LoadingStrategy::Volatile);
                touched += 1;
            }
        }
    }
}
