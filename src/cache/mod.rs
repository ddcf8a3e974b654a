//! Block residency, asynchronous fetching and io time budgeting.

mod block_cache;
mod fetch_queue;
mod fetcher;
pub mod io_timing;

pub use block_cache::{
    BlockCache, BlockKey, CacheBlock, CacheConfig, CacheControl, CacheGeometry, LoadingStrategy,
};
pub use fetch_queue::BlockingPriorityQueue;
pub use io_timing::{IoStatistics, IoTimeBudget, RenderJob};
