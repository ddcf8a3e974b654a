//! Viewer-side state the renderer consumes: sources, transforms,
//! visibility and the repaint signal.

mod volume_source;

pub use volume_source::VolumeSource;

use std::sync::Arc;

use cgmath::Matrix4;

use crate::cache::LoadingStrategy;
use crate::volume::{Interpolation, VolatileSampler};

/// One displayable multi-resolution source.
pub trait RenderSource: Send + Sync {
    fn num_mipmap_levels(&self) -> usize;

    /// Whether this source can be sampled before its data is loaded.
    /// Sources without a volatile variant are rendered through a
    /// blocking single-level projector.
    fn volatile_available(&self) -> bool;

    /// Affine mapping voxel coordinates of `level` to global space.
    fn source_transform(&self, timepoint: u32, level: usize) -> Matrix4<f64>;

    fn sampler(
        &self,
        timepoint: u32,
        level: usize,
        interpolation: Interpolation,
        source_to_screen: &Matrix4<f64>,
        strategy: LoadingStrategy,
    ) -> Box<dyn VolatileSampler>;

    /// Intensity to ARGB.
    fn convert(&self, value: f64) -> u32;

    /// Best-effort hint that `level` is about to be sampled over the
    /// given screen rectangle.
    fn prefetch(
        &self,
        _timepoint: u32,
        _level: usize,
        _source_to_screen: &Matrix4<f64>,
        _screen_size: (u32, u32),
    ) {
    }
}

/// Signals the painter thread that a repaint should happen eventually.
pub trait RepaintTrigger: Send + Sync {
    fn repaint(&self);
}

struct SourceSlot {
    source: Arc<dyn RenderSource>,
    visible: bool,
}

/// Snapshot of what the viewer wants to see: timepoint, transform,
/// interpolation and source visibility.
pub struct ViewerState {
    timepoint: u32,
    viewer_transform: Matrix4<f64>,
    interpolation: Interpolation,
    sources: Vec<SourceSlot>,
}

impl ViewerState {
    pub fn new() -> Self {
        Self {
            timepoint: 0,
            viewer_transform: cgmath::SquareMatrix::identity(),
            interpolation: Interpolation::NearestNeighbor,
            sources: Vec::new(),
        }
    }

    /// Register a source (visible by default); returns its index.
    pub fn add_source(&mut self, source: Arc<dyn RenderSource>) -> usize {
        self.sources.push(SourceSlot {
            source,
            visible: true,
        });
        self.sources.len() - 1
    }

    pub fn set_source_visible(&mut self, index: usize, visible: bool) {
        self.sources[index].visible = visible;
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    pub fn source(&self, index: usize) -> &Arc<dyn RenderSource> {
        &self.sources[index].source
    }

    pub fn visible_source_indices(&self) -> Vec<usize> {
        self.sources
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.visible)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn timepoint(&self) -> u32 {
        self.timepoint
    }

    pub fn set_timepoint(&mut self, timepoint: u32) {
        self.timepoint = timepoint;
    }

    pub fn viewer_transform(&self) -> Matrix4<f64> {
        self.viewer_transform
    }

    pub fn set_viewer_transform(&mut self, transform: Matrix4<f64>) {
        self.viewer_transform = transform;
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.interpolation = interpolation;
    }

    /// Full chain from `level` voxel coordinates of a source to
    /// screen-image pixels.
    pub fn source_to_screen(
        &self,
        screen_scale_transform: &Matrix4<f64>,
        source_index: usize,
        level: usize,
    ) -> Matrix4<f64> {
        screen_scale_transform
            * self.viewer_transform
            * self.sources[source_index]
                .source
                .source_transform(self.timepoint, level)
    }

    /// The coarsest mipmap level whose voxel footprint on the screen
    /// image is still at most one pixel; level 0 when even the finest
    /// voxels are larger than a pixel.
    pub fn best_mipmap_level(
        &self,
        screen_scale_transform: &Matrix4<f64>,
        source_index: usize,
    ) -> usize {
        let num_levels = self.sources[source_index].source.num_mipmap_levels();
        let mut best = 0;
        for level in 0..num_levels {
            let m = self.source_to_screen(screen_scale_transform, source_index, level);
            if voxel_footprint(&m) <= 1.0 {
                best = level;
            }
        }
        best
    }
}

impl Default for ViewerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Largest screen-plane extent of the images of the three source unit
/// vectors.
fn voxel_footprint(source_to_screen: &Matrix4<f64>) -> f64 {
    let axes = [source_to_screen.x, source_to_screen.y, source_to_screen.z];
    axes.iter()
        .map(|a| (a.x * a.x + a.y * a.y).sqrt())
        .fold(0.0, f64::max)
}
