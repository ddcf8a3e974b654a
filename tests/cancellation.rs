//! A repaint request at a coarser scale cancels fine-scale rendering
//! in flight; the cancelled frame publishes nothing.

use std::sync::Arc;
use std::time::Duration;

use cgmath::SquareMatrix;
use volview::{
    BlockCache, BlockLoader, CacheConfig, CacheControl, CacheGeometry, LoaderError,
    MultiResolutionRenderer, OffscreenCanvas, RenderTarget, RendererConfig, RepaintTrigger,
    ViewerState, VolatileShortArray, VolumeSource,
};

struct SlowLoader;

impl BlockLoader for SlowLoader {
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
        std::thread::sleep(Duration::from_millis(10));
        let n = dims.iter().map(|&d| d as usize).product();
        Ok(VolatileShortArray::valid(vec![99; n]))
    }

    fn empty_payload(&self, dims: [u32; 3]) -> VolatileShortArray {
        VolatileShortArray::invalid(dims.iter().map(|&d| d as usize).product())
    }
}

struct NoopPainter;

impl RepaintTrigger for NoopPainter {
    fn repaint(&self) {}
}

#[test]
fn coarse_repaint_cancels_fine_rendering() {
    let cache = Arc::new(BlockCache::new(
        SlowLoader,
        CacheGeometry::uniform(1, 1, 3),
        CacheConfig {
            num_fetcher_threads: 1,
            soft_cache_blocks: 1024,
        },
    ));
    let source = Arc::new(VolumeSource::new(
        Arc::clone(&cache),
        0,
        "slow",
        [128, 128, 128],
        [16, 16, 16],
        vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [4.0, 4.0, 4.0]],
        cgmath::Matrix4::identity(),
        (0.0, 255.0),
    ));
    let mut viewer = ViewerState::new();
    viewer.add_source(source);

    let canvas = Arc::new(OffscreenCanvas::new(64, 64));
    let target: Arc<dyn RenderTarget> = Arc::clone(&canvas) as Arc<dyn RenderTarget>;
    let painter: Arc<dyn RepaintTrigger> = Arc::new(NoopPainter);
    let cache_control: Arc<dyn CacheControl> = cache;
    let renderer = Arc::new(
        MultiResolutionRenderer::new(
            target,
            painter,
            cache_control,
            RendererConfig {
                screen_scales: vec![1.0, 0.5, 0.25],
                target_render_nanos: 100_000_000,
                io_budget_per_frame: vec![500_000_000],
                rendering_pool: None,
                num_rendering_threads: 2,
                prefetch_blocks: false,
                ..RendererConfig::default()
            },
        )
        .expect("renderer config is valid"),
    );

    // start rendering the expensive full-resolution frame, cancel from
    // another thread while it is underway
    renderer.request_repaint_at(0);
    let canceller = {
        let renderer = Arc::clone(&renderer);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            renderer.request_repaint_at(2);
        })
    };

    let success = renderer.paint(&viewer);
    canceller.join().expect("canceller thread panicked");

    assert!(!success, "cancelled paint must report failure");
    assert!(
        canvas.current_image().is_none(),
        "cancelled paint must not publish"
    );

    // the requested coarse frame goes through afterwards
    assert!(renderer.paint(&viewer));
    let image = canvas.current_image().expect("coarse frame published");
    assert_eq!(image.width(), 16);
    assert_eq!(image.height(), 16);
}
