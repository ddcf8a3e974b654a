//! Blocks, volatile payloads and the loader seam.
//!
//! A block is a 3D rectangular tile of one mipmap level. Its payload is
//! *volatile*: consumers may observe it before it has been populated.
//! Validity is monotone: a payload transitions invalid -> valid at most
//! once (by swapping in a freshly loaded payload) and never back.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

/// Data held by a block. `is_valid` must be monotone for any one payload
/// instance; the cache publishes a new instance when a load completes.
pub trait BlockPayload: Send + Sync + 'static {
    fn is_valid(&self) -> bool;

    fn num_elements(&self) -> usize;

    /// Raw sample access. The result is unspecified while the payload is
    /// invalid.
    fn get(&self, index: usize) -> f64;
}

/// 16-bit sample array, the payload type produced by the bundled loaders.
pub struct VolatileShortArray {
    data: Box<[u16]>,
    valid: bool,
}

impl VolatileShortArray {
    pub fn valid(data: Vec<u16>) -> Self {
        Self {
            data: data.into_boxed_slice(),
            valid: true,
        }
    }

    pub fn invalid(num_elements: usize) -> Self {
        Self {
            data: vec![0; num_elements].into_boxed_slice(),
            valid: false,
        }
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.data
    }
}

impl BlockPayload for VolatileShortArray {
    fn is_valid(&self) -> bool {
        self.valid
    }

    fn num_elements(&self) -> usize {
        self.data.len()
    }

    fn get(&self, index: usize) -> f64 {
        self.data[index] as f64
    }
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("block load interrupted")]
    Interrupted,

    #[error("failed to load block at t={timepoint} setup={setup} level={level}: {message}")]
    Io {
        timepoint: u32,
        setup: u32,
        level: u32,
        message: String,
    },
}

/// Supplies block data for one volume. Implementations may block inside
/// [`BlockLoader::load_block`]; the cache decides on which thread and
/// under which budget that happens.
pub trait BlockLoader: Send + Sync + 'static {
    type Payload: BlockPayload;

    fn bytes_per_element(&self) -> usize;

    /// Load the samples for one block. May block.
    fn load_block(
        &self,
        timepoint: u32,
        setup: u32,
        level: u32,
        dims: [u32; 3],
        origin: [i64; 3],
    ) -> Result<Self::Payload, LoaderError>;

    /// An invalid placeholder payload of the right size.
    fn empty_payload(&self, dims: [u32; 3]) -> Self::Payload;
}

/// A resident tile: dimensions, origin on the level grid, and the
/// volatile payload slot.
pub struct Block<P> {
    dims: [u32; 3],
    origin: [i64; 3],
    payload: RwLock<Arc<P>>,
}

impl<P: BlockPayload> Block<P> {
    pub fn new(dims: [u32; 3], origin: [i64; 3], payload: P) -> Self {
        Self {
            dims,
            origin,
            payload: RwLock::new(Arc::new(payload)),
        }
    }

    pub fn dims(&self) -> [u32; 3] {
        self.dims
    }

    pub fn origin(&self) -> [i64; 3] {
        self.origin
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    pub fn payload(&self) -> Arc<P> {
        self.payload.read().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.payload.read().is_valid()
    }

    /// Swap in a loaded payload. Callers must hold the owning entry's
    /// monitor; validity stays monotone because the old payload is only
    /// ever replaced by a valid one.
    pub(crate) fn publish(&self, payload: P) {
        *self.payload.write() = Arc::new(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_is_invalid_until_published() {
        let block = Block::new([4, 4, 2], [0, 0, 0], VolatileShortArray::invalid(32));
        assert!(!block.is_valid());
        assert_eq!(block.num_elements(), 32);

        let observed_before = block.payload();
        block.publish(VolatileShortArray::valid(vec![7; 32]));

        // an already-obtained payload never flips validity
        assert!(!observed_before.is_valid());
        assert!(block.is_valid());
        assert_eq!(block.payload().get(3), 7.0);
    }
}
