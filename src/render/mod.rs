//! Projectors, render images and the multi-resolution renderer.

mod accumulate;
mod hierarchical;
mod image;
pub mod prefetch;
mod projector;
mod renderer;

pub use accumulate::AccumulateProjector;
pub use hierarchical::VolatileHierarchicalProjector;
pub use image::{OffscreenCanvas, RenderImage, RenderTarget};
pub use projector::{Converter, EmptyProjector, SingleProjector, VolatileProjector};
pub use renderer::{ConfigError, MultiResolutionRenderer, RendererConfig};
