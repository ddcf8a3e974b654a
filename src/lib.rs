//! volview — interactive rendering core for arbitrarily large
//! multi-resolution 3D image volumes.
//!
//! The crate renders a 2D slice of an affine-transformed volume through
//! a latency-bounded pipeline: a shared block cache populated by
//! background fetchers, a volatile hierarchical projector that composes
//! whatever data is resident into a best-effort image, and a
//! multi-resolution renderer that walks a coarse-to-fine screen-scale
//! ladder while keeping the per-frame rendering time near a target.
//!
//! Frames never wait for I/O longer than their budget allows: missing
//! data renders at a coarser mipmap level first and is refined on
//! subsequent frames as loads complete.

pub mod cache;
pub mod render;
pub mod viewer;
pub mod volume;

pub use cache::{
    BlockCache, BlockKey, CacheBlock, CacheConfig, CacheControl, CacheGeometry, IoStatistics,
    IoTimeBudget, LoadingStrategy, RenderJob,
};
pub use render::{
    ConfigError, MultiResolutionRenderer, OffscreenCanvas, RenderImage, RenderTarget,
    RendererConfig, VolatileProjector,
};
pub use viewer::{RenderSource, RepaintTrigger, ViewerState, VolumeSource};
pub use volume::{
    Block, BlockLoader, BlockPayload, Interpolation, LoaderError, VolatileBlockGrid,
    VolatileSample, VolatileSampler, VolatileShortArray,
};
