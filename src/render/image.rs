//! ARGB render images and the canvas seam.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

/// ARGB screen image rendered into by projectors. The pixel store is
/// locked once per rendering pass and split into row ranges for the
/// workers; the buffer id ties the image into the renderer's
/// triple-buffer rotation.
pub struct RenderImage {
    width: u32,
    height: u32,
    buffer_id: usize,
    pixels: Mutex<Vec<u32>>,
}

impl RenderImage {
    pub fn new(width: u32, height: u32, buffer_id: usize) -> Self {
        Self {
            width,
            height,
            buffer_id,
            pixels: Mutex::new(vec![0; width as usize * height as usize]),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn buffer_id(&self) -> usize {
        self.buffer_id
    }

    pub(crate) fn pixels(&self) -> MutexGuard<'_, Vec<u32>> {
        self.pixels.lock()
    }

    /// Copy of the current pixel data, for display or inspection.
    pub fn snapshot(&self) -> Vec<u32> {
        self.pixels.lock().clone()
    }
}

/// Receiver for finished frames. Only the painter publishes, so targets
/// see a single presentation order.
pub trait RenderTarget: Send + Sync {
    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Display `image` and hand back the previously displayed image so
    /// the renderer can recycle its buffer.
    fn set_image(&self, image: Arc<RenderImage>) -> Option<Arc<RenderImage>>;
}

/// A headless canvas: resizable, remembers the most recently published
/// image.
pub struct OffscreenCanvas {
    size: RwLock<(u32, u32)>,
    image: Mutex<Option<Arc<RenderImage>>>,
}

impl OffscreenCanvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: RwLock::new((width, height)),
            image: Mutex::new(None),
        }
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.size.write() = (width, height);
    }

    pub fn current_image(&self) -> Option<Arc<RenderImage>> {
        self.image.lock().clone()
    }
}

impl RenderTarget for OffscreenCanvas {
    fn width(&self) -> u32 {
        self.size.read().0
    }

    fn height(&self) -> u32 {
        self.size.read().1
    }

    fn set_image(&self, image: Arc<RenderImage>) -> Option<Arc<RenderImage>> {
        self.image.lock().replace(image)
    }
}
