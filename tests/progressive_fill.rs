//! End-to-end: frames refine from coarse placeholder data to the finest
//! mipmap level as background loads complete, and multiple visible
//! sources accumulate into one image.

use std::sync::Arc;
use std::time::Duration;

use cgmath::SquareMatrix;
use volview::{
    BlockCache, BlockLoader, CacheConfig, CacheControl, CacheGeometry, LoaderError,
    MultiResolutionRenderer, OffscreenCanvas, RenderTarget, RendererConfig, RepaintTrigger,
    ViewerState, VolatileShortArray, VolumeSource,
};

/// Loads blocks with a per-level constant value, so the displayed grey
/// level tells which mipmap level a pixel was sampled from.
struct LevelTaggedLoader {
    delay: Duration,
    base_value: u16,
}

impl BlockLoader for LevelTaggedLoader {
    type Payload = VolatileShortArray;

    fn bytes_per_element(&self) -> usize {
        2
    }

    fn load_block(
        &self,
        _timepoint: u32,
        _setup: u32,
        level: u32,
        dims: [u32; 3],
        _origin: [i64; 3],
    ) -> Result<VolatileShortArray, LoaderError> {
        std::thread::sleep(self.delay);
        let n = dims.iter().map(|&d| d as usize).product();
        Ok(VolatileShortArray::valid(vec![
            self.base_value + level as u16;
            n
        ]))
    }

    fn empty_payload(&self, dims: [u32; 3]) -> VolatileShortArray {
        VolatileShortArray::invalid(dims.iter().map(|&d| d as usize).product())
    }
}

struct NoopPainter;

impl RepaintTrigger for NoopPainter {
    fn repaint(&self) {}
}

fn source_for(
    setup: u32,
    cache: &Arc<BlockCache<LevelTaggedLoader>>,
) -> Arc<VolumeSource<LevelTaggedLoader>> {
    Arc::new(VolumeSource::new(
        Arc::clone(cache),
        setup,
        format!("tagged-{}", setup),
        [64, 48, 8],
        [16, 16, 8],
        vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]],
        cgmath::Matrix4::identity(),
        (0.0, 255.0),
    ))
}

fn renderer_for(
    canvas: &Arc<OffscreenCanvas>,
    cache: Arc<BlockCache<LevelTaggedLoader>>,
) -> MultiResolutionRenderer {
    let target: Arc<dyn RenderTarget> = Arc::clone(canvas) as Arc<dyn RenderTarget>;
    let painter: Arc<dyn RepaintTrigger> = Arc::new(NoopPainter);
    let cache_control: Arc<dyn CacheControl> = cache as Arc<dyn CacheControl>;
    MultiResolutionRenderer::new(
        target,
        painter,
        cache_control,
        RendererConfig {
            screen_scales: vec![1.0, 0.5],
            target_render_nanos: 50_000_000,
            io_budget_per_frame: vec![100_000_000],
            rendering_pool: None,
            num_rendering_threads: 2,
            ..RendererConfig::default()
        },
    )
    .expect("renderer config is valid")
}

fn grey(value: u32) -> u32 {
    0xff00_0000 | value << 16 | value << 8 | value
}

#[test]
fn refines_to_finest_level_data() {
    let cache = Arc::new(BlockCache::new(
        LevelTaggedLoader {
            delay: Duration::from_millis(1),
            base_value: 100,
        },
        CacheGeometry::uniform(1, 1, 2),
        CacheConfig {
            num_fetcher_threads: 1,
            soft_cache_blocks: 256,
        },
    ));
    let mut viewer = ViewerState::new();
    viewer.add_source(source_for(0, &cache));

    let canvas = Arc::new(OffscreenCanvas::new(64, 48));
    let renderer = renderer_for(&canvas, cache);

    renderer.request_repaint();
    let expected = grey(100);
    let mut settled = false;
    for _ in 0..100 {
        renderer.paint(&viewer);
        if let Some(image) = canvas.current_image() {
            if image.width() == 64 && image.snapshot().iter().all(|&px| px == expected) {
                settled = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(settled, "never settled on finest-level data");
}

#[test]
fn two_visible_sources_accumulate() {
    let cache = Arc::new(BlockCache::new(
        LevelTaggedLoader {
            delay: Duration::ZERO,
            base_value: 40,
        },
        CacheGeometry::uniform(1, 2, 2),
        CacheConfig {
            num_fetcher_threads: 1,
            soft_cache_blocks: 256,
        },
    ));
    let mut viewer = ViewerState::new();
    viewer.add_source(source_for(0, &cache));
    viewer.add_source(source_for(1, &cache));

    let canvas = Arc::new(OffscreenCanvas::new(64, 48));
    let renderer = renderer_for(&canvas, cache);

    renderer.request_repaint();
    let expected = grey(40 + 40);
    let mut settled = false;
    for _ in 0..100 {
        renderer.paint(&viewer);
        if let Some(image) = canvas.current_image() {
            if image.width() == 64 && image.snapshot().iter().all(|&px| px == expected) {
                settled = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(settled, "accumulated image never settled");
}
