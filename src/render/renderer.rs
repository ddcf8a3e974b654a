//! Coarse-to-fine rendering with an adaptive screen-scale ladder.
//!
//! A repaint starts at the current coarsest usable screen scale and,
//! frame by frame, proceeds to finer scales until full resolution is
//! reached; at full resolution it keeps re-mapping the projector until
//! all volatile data has arrived. The coarsest usable scale adapts so
//! that rendering it stays close to the target frame time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use cgmath::Matrix4;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::io_timing::{self, RenderJob};
use crate::cache::{CacheControl, LoadingStrategy};
use crate::render::accumulate::AccumulateProjector;
use crate::render::hierarchical::VolatileHierarchicalProjector;
use crate::render::image::{RenderImage, RenderTarget};
use crate::render::projector::{Converter, EmptyProjector, SingleProjector, VolatileProjector};
use crate::viewer::{RenderSource, RepaintTrigger, ViewerState};

#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Scale factors from canvas pixels to render-image pixels, strictly
    /// descending, first entry at most 1.0.
    pub screen_scales: Vec<f64>,
    /// Target rendering time per frame in nanoseconds.
    pub target_render_nanos: u64,
    /// When true, three images are allocated per scale and rotated so
    /// the displayed image is never rendered into.
    pub double_buffered: bool,
    /// Into how many row bands a pass is split.
    pub num_rendering_threads: usize,
    /// Pool the bands run on; `None` runs them inline.
    pub rendering_pool: Option<Arc<rayon::ThreadPool>>,
    /// Use the hierarchical projector for sources that advertise a
    /// volatile variant.
    pub use_volatile_if_available: bool,
    pub prefetch_blocks: bool,
    /// Per-frame blocking-io budget by priority level, nanoseconds,
    /// monotone non-increasing.
    pub io_budget_per_frame: Vec<i64>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            screen_scales: vec![1.0, 0.75, 0.5, 0.25, 0.125],
            target_render_nanos: 30_000_000,
            double_buffered: true,
            // leave two cores for the painter and the OS
            num_rendering_threads: num_cpus::get().saturating_sub(2).max(1),
            rendering_pool: None,
            use_volatile_if_available: true,
            prefetch_blocks: true,
            io_budget_per_frame: vec![100_000_000, 10_000_000],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("screen scale ladder is empty")]
    EmptyScreenScales,

    #[error("screen scales must be strictly descending, got {previous} before {next}")]
    ScreenScalesNotDescending { previous: f64, next: f64 },

    #[error("first screen scale must be at most 1.0, got {0}")]
    ScreenScaleTooLarge(f64),

    #[error("target render time must be nonzero")]
    ZeroTargetRenderTime,

    #[error("number of rendering threads must be nonzero")]
    ZeroRenderingThreads,
}

impl RendererConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scales = &self.screen_scales;
        if scales.is_empty() {
            return Err(ConfigError::EmptyScreenScales);
        }
        if scales[0] > 1.0 {
            return Err(ConfigError::ScreenScaleTooLarge(scales[0]));
        }
        for pair in scales.windows(2) {
            if pair[1] >= pair[0] {
                return Err(ConfigError::ScreenScalesNotDescending {
                    previous: pair[0],
                    next: pair[1],
                });
            }
        }
        if self.target_render_nanos == 0 {
            return Err(ConfigError::ZeroTargetRenderTime);
        }
        if self.num_rendering_threads == 0 {
            return Err(ConfigError::ZeroRenderingThreads);
        }
        Ok(())
    }
}

struct RenderState {
    projector: Option<Arc<VolatileProjector>>,
    /// Scale index of the current projector.
    current_scale: Option<usize>,
    /// Scale index to render next.
    requested_scale: usize,
    /// Coarsest scale rendering currently starts from; adapted against
    /// the target frame time.
    max_scale: usize,
    may_be_cancelled: bool,
    new_frame_request: bool,
    previous_timepoint: Option<u32>,
    canvas_size: (u32, u32),
    /// Per scale, the rotation buffers rendered to and displayed.
    screen_images: Vec<Vec<Arc<RenderImage>>>,
    screen_scale_transforms: Vec<Matrix4<f64>>,
    /// Per scale, per visible source, the image the source renders into
    /// before accumulation. Only allocated with more than one source.
    render_images: Vec<Vec<Arc<RenderImage>>>,
    /// Per visible source, the hierarchy mask storage.
    masks: Vec<Arc<Mutex<Vec<u8>>>>,
    render_id_queue: VecDeque<usize>,
}

pub struct MultiResolutionRenderer {
    target: Arc<dyn RenderTarget>,
    painter: Arc<dyn RepaintTrigger>,
    cache: Arc<dyn CacheControl>,
    screen_scales: Vec<f64>,
    target_render_nanos: u64,
    double_buffered: bool,
    num_tasks: usize,
    pool: Option<Arc<rayon::ThreadPool>>,
    use_volatile_if_available: bool,
    prefetch_blocks: bool,
    io_budget: Vec<i64>,
    job: RenderJob,
    state: Mutex<RenderState>,
}

impl MultiResolutionRenderer {
    pub fn new(
        target: Arc<dyn RenderTarget>,
        painter: Arc<dyn RepaintTrigger>,
        cache: Arc<dyn CacheControl>,
        config: RendererConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let max_scale = config.screen_scales.len() - 1;
        Ok(Self {
            target,
            painter,
            cache,
            screen_scales: config.screen_scales,
            target_render_nanos: config.target_render_nanos,
            double_buffered: config.double_buffered,
            num_tasks: config.num_rendering_threads,
            pool: config.rendering_pool,
            use_volatile_if_available: config.use_volatile_if_available,
            prefetch_blocks: config.prefetch_blocks,
            io_budget: config.io_budget_per_frame,
            job: RenderJob::new(),
            state: Mutex::new(RenderState {
                projector: None,
                current_scale: None,
                requested_scale: max_scale,
                max_scale,
                may_be_cancelled: true,
                new_frame_request: false,
                previous_timepoint: None,
                canvas_size: (0, 0),
                screen_images: Vec::new(),
                screen_scale_transforms: Vec::new(),
                render_images: Vec::new(),
                masks: Vec::new(),
                render_id_queue: VecDeque::new(),
            }),
        })
    }

    /// Coarsest screen scale index rendering currently starts from.
    pub fn max_scale_index(&self) -> usize {
        self.state.lock().max_scale
    }

    /// Request a full repaint of a new frame, starting at the coarsest
    /// usable scale.
    pub fn request_repaint(&self) {
        let mut state = self.state.lock();
        state.new_frame_request = true;
        let scale = state.max_scale;
        self.request_repaint_locked(&mut state, scale);
        drop(state);
        self.painter.repaint();
    }

    /// Request a repaint at a specific screen scale.
    pub fn request_repaint_at(&self, scale_index: usize) {
        let mut state = self.state.lock();
        let scale = scale_index.min(self.screen_scales.len() - 1);
        self.request_repaint_locked(&mut state, scale);
        drop(state);
        self.painter.repaint();
    }

    fn request_repaint_locked(&self, state: &mut RenderState, scale_index: usize) {
        if state.may_be_cancelled {
            if let Some(projector) = &state.projector {
                projector.cancel();
            }
        }
        state.requested_scale = scale_index;
    }

    /// Render at the requested screen scale and publish the result.
    /// Returns `false` when nothing was rendered (empty canvas or
    /// cancelled pass).
    pub fn paint(&self, viewer: &ViewerState) -> bool {
        let canvas_w = self.target.width();
        let canvas_h = self.target.height();
        if canvas_w == 0 || canvas_h == 0 {
            return false;
        }

        let _job = io_timing::enter_job(self.job);

        let projector;
        let publish_image;
        let create_projector;
        {
            let mut state = self.state.lock();
            let resized = self.check_resize(&mut state, canvas_w, canvas_h);
            let num_visible = viewer.visible_source_indices().len();
            self.check_renew_render_images(&mut state, num_visible);
            self.check_renew_masks(&mut state, num_visible);

            // rendering may be cancelled unless we are already at the
            // coarsest usable scale
            state.may_be_cancelled = state.requested_scale < state.max_scale;

            if state.new_frame_request {
                self.cache.prepare_next_frame();
            }
            create_projector = state.new_frame_request
                || resized
                || Some(state.requested_scale) != state.current_scale;
            state.new_frame_request = false;

            if create_projector {
                let render_id = if self.double_buffered {
                    *state.render_id_queue.front().unwrap_or(&0)
                } else {
                    0
                };
                let scale = state.requested_scale;
                state.current_scale = Some(scale);
                let image = Arc::clone(&state.screen_images[scale][render_id]);
                let p = Arc::new(self.create_projector(&mut state, viewer, scale, &image));
                state.projector = Some(Arc::clone(&p));
                projector = p;
                publish_image = Some(image);
            } else {
                projector = Arc::clone(state.projector.as_ref().expect("projector exists"));
                publish_image = None;
            }
        }

        let success = projector.map(create_projector);
        let rendertime = projector.last_frame_nanos();

        if success {
            let mut state = self.state.lock();
            let current = state.current_scale.unwrap_or(state.max_scale);
            if let Some(image) = publish_image {
                let previous = self.target.set_image(image);
                if self.double_buffered {
                    state.render_id_queue.pop_front();
                    if let Some(previous) = previous {
                        if self.owns_buffer(&state, &previous) {
                            state.render_id_queue.push_back(previous.buffer_id());
                        }
                    }
                }

                if current == state.max_scale {
                    if rendertime > self.target_render_nanos
                        && state.max_scale < self.screen_scales.len() - 1
                    {
                        state.max_scale += 1;
                    } else if rendertime < self.target_render_nanos / 3 && state.max_scale > 0 {
                        state.max_scale -= 1;
                    }
                } else if current + 1 == state.max_scale
                    && rendertime < self.target_render_nanos
                    && state.max_scale > 0
                {
                    state.max_scale -= 1;
                }
                log::trace!(
                    "rendered scale {} in {} ms, coarsest usable scale {}",
                    current,
                    rendertime / 1_000_000,
                    state.max_scale
                );
            }

            if current > 0 {
                self.request_repaint_locked(&mut state, current - 1);
                drop(state);
                self.painter.repaint();
            } else if !projector.is_valid() {
                // more data may arrive; try the same scale again shortly
                std::thread::sleep(Duration::from_millis(1));
                self.request_repaint_locked(&mut state, current);
                drop(state);
                self.painter.repaint();
            }
        }

        success
    }

    fn owns_buffer(&self, state: &RenderState, image: &Arc<RenderImage>) -> bool {
        state
            .screen_images
            .iter()
            .flatten()
            .any(|candidate| Arc::ptr_eq(candidate, image))
    }

    /// Recreate per-scale images and transforms when the canvas size
    /// changed.
    fn check_resize(&self, state: &mut RenderState, canvas_w: u32, canvas_h: u32) -> bool {
        if state.canvas_size == (canvas_w, canvas_h) && !state.screen_images.is_empty() {
            return false;
        }
        state.canvas_size = (canvas_w, canvas_h);
        state.render_id_queue = VecDeque::from([0, 1, 2]);
        let num_buffers = if self.double_buffered { 3 } else { 1 };
        state.screen_images = Vec::with_capacity(self.screen_scales.len());
        state.screen_scale_transforms = Vec::with_capacity(self.screen_scales.len());
        for &scale in &self.screen_scales {
            let w = ((scale * canvas_w as f64) as u32).max(1);
            let h = ((scale * canvas_h as f64) as u32).max(1);
            state.screen_images.push(
                (0..num_buffers)
                    .map(|b| Arc::new(RenderImage::new(w, h, b)))
                    .collect(),
            );
            let sx = w as f64 / canvas_w as f64;
            let sy = h as f64 / canvas_h as f64;
            let mut transform = Matrix4::from_nonuniform_scale(sx, sy, 1.0);
            // half-pixel centering of the scaled image
            transform.w.x = 0.5 * sx - 0.5;
            transform.w.y = 0.5 * sy - 0.5;
            state.screen_scale_transforms.push(transform);
        }
        log::debug!(
            "allocated {} screen scales for a {}x{} canvas",
            self.screen_scales.len(),
            canvas_w,
            canvas_h
        );
        true
    }

    fn check_renew_render_images(&self, state: &mut RenderState, num_visible: usize) {
        let n = if num_visible > 1 { num_visible } else { 0 };
        let up_to_date = state.render_images.len() == self.screen_scales.len()
            && state.render_images[0].len() == n
            && (n == 0
                || (state.render_images[0][0].width() == state.screen_images[0][0].width()
                    && state.render_images[0][0].height() == state.screen_images[0][0].height()));
        if up_to_date {
            return;
        }
        state.render_images = state
            .screen_images
            .iter()
            .map(|buffers| {
                let w = buffers[0].width();
                let h = buffers[0].height();
                (0..n).map(|_| Arc::new(RenderImage::new(w, h, 0))).collect()
            })
            .collect();
    }

    fn check_renew_masks(&self, state: &mut RenderState, num_visible: usize) {
        let size =
            state.screen_images[0][0].width() as usize * state.screen_images[0][0].height() as usize;
        let up_to_date = state.masks.len() == num_visible
            && (num_visible == 0 || state.masks[0].lock().len() >= size);
        if up_to_date {
            return;
        }
        state.masks = (0..num_visible)
            .map(|_| Arc::new(Mutex::new(vec![0u8; size])))
            .collect();
    }

    fn create_projector(
        &self,
        state: &mut RenderState,
        viewer: &ViewerState,
        scale: usize,
        screen_image: &Arc<RenderImage>,
    ) -> VolatileProjector {
        // clear the budget so prefetching never block-waits
        self.cache.init_io_budget(None);
        let visible = viewer.visible_source_indices();
        let projector = if visible.is_empty() {
            VolatileProjector::Empty(EmptyProjector::new(Arc::clone(screen_image)))
        } else if visible.len() == 1 {
            let mask = Arc::clone(&state.masks[0]);
            self.single_source_projector(
                state,
                viewer,
                visible[0],
                scale,
                Arc::clone(screen_image),
                mask,
            )
        } else {
            let mut children = Vec::with_capacity(visible.len());
            let mut child_images = Vec::with_capacity(visible.len());
            for (j, &source_index) in visible.iter().enumerate() {
                let image = Arc::clone(&state.render_images[scale][j]);
                let mask = Arc::clone(&state.masks[j]);
                children.push(self.single_source_projector(
                    state,
                    viewer,
                    source_index,
                    scale,
                    Arc::clone(&image),
                    mask,
                ));
                child_images.push(image);
            }
            VolatileProjector::Accumulate(AccumulateProjector::new(
                children,
                child_images,
                Arc::clone(screen_image),
                self.pool.clone(),
                self.num_tasks,
            ))
        };
        state.previous_timepoint = Some(viewer.timepoint());
        self.cache.init_io_budget(Some(&self.io_budget));
        projector
    }

    fn single_source_projector(
        &self,
        state: &mut RenderState,
        viewer: &ViewerState,
        source_index: usize,
        scale: usize,
        target_image: Arc<RenderImage>,
        mask: Arc<Mutex<Vec<u8>>>,
    ) -> VolatileProjector {
        let source = Arc::clone(viewer.source(source_index));
        let scale_transform = state.screen_scale_transforms[scale];
        let timepoint = viewer.timepoint();
        let interpolation = viewer.interpolation();
        let screen_size = (target_image.width(), target_image.height());
        let converter: Arc<Converter> = {
            let source = Arc::clone(&source);
            Arc::new(move |value| source.convert(value))
        };

        if self.use_volatile_if_available && source.volatile_available() {
            let best = viewer.best_mipmap_level(&scale_transform, source_index);
            let coarsest = source.num_mipmap_levels() - 1;
            let transform_of =
                |level: usize| viewer.source_to_screen(&scale_transform, source_index, level);
            let sampler_of = |level: usize| {
                source.sampler(
                    timepoint,
                    level,
                    interpolation,
                    &transform_of(level),
                    LoadingStrategy::Budgeted,
                )
            };

            let mut levels: Vec<Box<dyn crate::volume::VolatileSampler>> = Vec::new();
            if state.previous_timepoint != Some(timepoint) {
                // Scrolling through time usually lands on frames with no
                // data loaded yet. Render only the best and the coarsest
                // level so at most two passes are needed, and re-arm a
                // full frame for when the viewer stays on this timepoint.
                levels.push(sampler_of(best));
                if coarsest != best {
                    levels.push(sampler_of(coarsest));
                }
                if self.prefetch_blocks {
                    if coarsest != best {
                        source.prefetch(timepoint, coarsest, &transform_of(coarsest), screen_size);
                    }
                    source.prefetch(timepoint, best, &transform_of(best), screen_size);
                }
                state.new_frame_request = true;
            } else {
                for level in best..=coarsest {
                    levels.push(sampler_of(level));
                }
                if self.prefetch_blocks {
                    for level in (best..=coarsest).rev() {
                        source.prefetch(timepoint, level, &transform_of(level), screen_size);
                    }
                }
            }
            VolatileProjector::Hierarchical(VolatileHierarchicalProjector::new(
                levels,
                converter,
                target_image,
                mask,
                self.pool.clone(),
                self.num_tasks,
                self.job,
            ))
        } else {
            let best = viewer.best_mipmap_level(&scale_transform, source_index);
            let sampler = source.sampler(
                timepoint,
                best,
                interpolation,
                &viewer.source_to_screen(&scale_transform, source_index, best),
                LoadingStrategy::Blocking,
            );
            VolatileProjector::Single(SingleProjector::new(
                sampler,
                converter,
                target_image,
                self.pool.clone(),
                self.num_tasks,
                self.job,
            ))
        }
    }
}
