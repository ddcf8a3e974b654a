//! End-to-end demo: renders a synthetic multi-resolution volume into an
//! offscreen canvas through the full cache/projector/renderer pipeline,
//! logging how frames refine as blocks arrive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use cgmath::{Matrix4, SquareMatrix};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use volview::cache::io_timing;
use volview::{
    BlockCache, BlockLoader, CacheConfig, CacheGeometry, LoaderError, MultiResolutionRenderer,
    OffscreenCanvas, RenderJob, RendererConfig, RepaintTrigger, ViewerState, VolatileShortArray,
    VolumeSource,
};

/// Procedural volume with a per-block load delay standing in for disk or
/// network latency.
struct SyntheticLoader {
    load_delay: Duration,
}

impl BlockLoader for SyntheticLoader {
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
        origin: [i64; 3],
    ) -> Result<VolatileShortArray, LoaderError> {
        std::thread::sleep(self.load_delay);
        let scale = (1 << level) as f64;
        let seed = (origin[0] as u64)
            .wrapping_mul(73_856_093)
            .wrapping_add((origin[1] as u64).wrapping_mul(19_349_663))
            .wrapping_add((origin[2] as u64).wrapping_mul(83_492_791));
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Vec::with_capacity(dims.iter().map(|&d| d as usize).product());
        for z in 0..dims[2] as i64 {
            for y in 0..dims[1] as i64 {
                for x in 0..dims[0] as i64 {
                    let gx = (origin[0] + x) as f64 * scale;
                    let gy = (origin[1] + y) as f64 * scale;
                    let gz = (origin[2] + z) as f64 * scale;
                    let wave = ((gx * 0.07).sin() * (gy * 0.05).sin() * (gz * 0.09).cos() + 1.0)
                        * 0.5
                        * 200.0;
                    let speckle: f64 = rng.gen_range(0.0..30.0);
                    data.push((wave + speckle) as u16);
                }
            }
        }
        Ok(VolatileShortArray::valid(data))
    }

    fn empty_payload(&self, dims: [u32; 3]) -> VolatileShortArray {
        VolatileShortArray::invalid(dims.iter().map(|&d| d as usize).product())
    }
}

struct ChannelPainter(Sender<()>);

impl RepaintTrigger for ChannelPainter {
    fn repaint(&self) {
        self.0.send(()).ok();
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cache = Arc::new(BlockCache::new(
        SyntheticLoader {
            load_delay: Duration::from_millis(3),
        },
        CacheGeometry::uniform(1, 1, 3),
        CacheConfig {
            num_fetcher_threads: 2,
            soft_cache_blocks: 4096,
        },
    ));

    let source = Arc::new(VolumeSource::new(
        Arc::clone(&cache),
        0,
        "synthetic",
        [512, 512, 128],
        [32, 32, 32],
        vec![[1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [4.0, 4.0, 4.0]],
        Matrix4::identity(),
        (0.0, 230.0),
    ));

    let viewer = Arc::new(RwLock::new(ViewerState::new()));
    viewer.write().add_source(source);
    viewer
        .write()
        .set_viewer_transform(Matrix4::from_scale(1.2) * Matrix4::from_translation(
            cgmath::Vector3::new(-100.0, -120.0, -64.0),
        ));

    let canvas = Arc::new(OffscreenCanvas::new(640, 480));
    let (repaint_tx, repaint_rx) = unbounded();
    let painter = Arc::new(ChannelPainter(repaint_tx));

    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .thread_name(|i| format!("render-{}", i))
            .build()?,
    );

    let render_target: Arc<dyn volview::RenderTarget> = Arc::clone(&canvas) as Arc<dyn volview::RenderTarget>;
    let repaint: Arc<dyn RepaintTrigger> = Arc::clone(&painter) as Arc<dyn RepaintTrigger>;
    let cache_control: Arc<dyn volview::CacheControl> = Arc::clone(&cache) as Arc<dyn volview::CacheControl>;
    let renderer = Arc::new(MultiResolutionRenderer::new(
        render_target,
        repaint,
        cache_control,
        RendererConfig {
            screen_scales: vec![1.0, 0.5, 0.25, 0.125],
            target_render_nanos: 16_000_000,
            num_rendering_threads: 4,
            rendering_pool: Some(pool),
            ..RendererConfig::default()
        },
    )?);

    // painter thread: serially turns repaint signals into paint calls
    let stop = Arc::new(AtomicBool::new(false));
    let painter_thread = {
        let renderer = Arc::clone(&renderer);
        let viewer = Arc::clone(&viewer);
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("painter".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match repaint_rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(()) => {
                            while repaint_rx.try_recv().is_ok() {}
                            let state = viewer.read();
                            renderer.paint(&state);
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?
    };

    // a short camera flight: each move starts a new frame which refines
    // until the next move
    let t0 = Instant::now();
    for step in 0..6 {
        let zoom = 1.2 + 0.25 * step as f64;
        viewer.write().set_viewer_transform(
            Matrix4::from_scale(zoom)
                * Matrix4::from_translation(cgmath::Vector3::new(-100.0, -120.0, -64.0)),
        );
        renderer.request_repaint();
        std::thread::sleep(Duration::from_millis(400));
        log::info!(
            "t={:>5}ms coarsest usable scale {} resident blocks {} retained {}",
            t0.elapsed().as_millis(),
            renderer.max_scale_index(),
            cache.resident_blocks(),
            cache.retained_blocks(),
        );
    }

    // let the last frame settle to full resolution
    std::thread::sleep(Duration::from_millis(800));
    stop.store(true, Ordering::Relaxed);
    painter_thread
        .join()
        .map_err(|_| anyhow::anyhow!("painter thread panicked"))?;

    let fetcher_stats = io_timing::statistics_for(RenderJob::DETACHED);
    log::info!(
        "loaded {} MiB in background, cumulative fetch time {} ms",
        fetcher_stats.io_bytes() / (1024 * 1024),
        fetcher_stats.cumulative_io_nanos() / 1_000_000,
    );
    if let Some(image) = canvas.current_image() {
        log::info!(
            "final image {}x{} (buffer {})",
            image.width(),
            image.height(),
            image.buffer_id()
        );
    }
    Ok(())
}
