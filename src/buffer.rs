//! PCM byte buffer with its format descriptor.

use std::sync::Arc;
use std::time::Duration;

use crate::format::AudioFormat;
use crate::EngineError;

/// A reference-counted [`PcmBuffer`].
///
/// Sources keep one reference while a buffer is queued and the caller keeps
/// another; the storage is freed when both are gone.
pub type SharedBuffer = Arc<PcmBuffer>;

/// An owned byte region of PCM data plus the format describing it.
///
/// `capacity` is the size of the storage, `used` the number of valid bytes
/// at its start. Both are always whole multiples of the format's block size.
///
/// # Example
///
/// ```
/// use pcm_engine::{AudioFormat, PcmBuffer};
///
/// let format = AudioFormat::i16(1, 16000);
/// let mut buffer = PcmBuffer::with_data(format, &[0u8; 3200])?;
/// assert_eq!(buffer.blocks_used(), 1600);
/// assert_eq!(buffer.duration().as_millis(), 100);
///
/// // Odd byte counts are truncated to whole blocks
/// buffer.set_data(format, Some(&[1u8; 5]), 5)?;
/// assert_eq!(buffer.used(), 4);
/// # Ok::<(), pcm_engine::EngineError>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    data: Vec<u8>,
    used: usize,
    format: AudioFormat,
}

impl PcmBuffer {
    /// Creates an empty buffer with room for `blocks` blocks of `format`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if the storage cannot be allocated.
    pub fn new(format: AudioFormat, blocks: usize) -> Result<Self, EngineError> {
        let bytes = format.blocks_to_bytes(blocks);
        Ok(Self {
            data: zeroed(bytes)?,
            used: 0,
            format,
        })
    }

    /// Creates a buffer holding a copy of `data` (truncated to whole blocks).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if the storage cannot be allocated.
    pub fn with_data(format: AudioFormat, data: &[u8]) -> Result<Self, EngineError> {
        let mut buffer = Self {
            data: Vec::new(),
            used: 0,
            format,
        };
        buffer.set_data(format, Some(data), data.len())?;
        Ok(buffer)
    }

    /// Rewrites the buffer's contents and format.
    ///
    /// `bytes` is truncated to a whole number of blocks (and to `data.len()`
    /// when data is given). Storage is reallocated only when the format
    /// changes or the current capacity is too small. With `data == None` the
    /// used region is zero-filled, which is how capture buffers are sized.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AllocationFailure`] if new storage is needed and
    /// cannot be allocated; the buffer keeps its previous contents and format.
    pub fn set_data(
        &mut self,
        format: AudioFormat,
        data: Option<&[u8]>,
        bytes: usize,
    ) -> Result<(), EngineError> {
        let bytes = data.map_or(bytes, |d| bytes.min(d.len()));
        let bytes = format.blocks_to_bytes(format.bytes_to_blocks(bytes));

        if format != self.format || self.data.len() < bytes {
            let storage = zeroed(bytes)?;
            self.data = storage;
            self.format = format;
        }

        match data {
            Some(src) => self.data[..bytes].copy_from_slice(&src[..bytes]),
            None => self.data[..bytes].fill(0),
        }
        self.used = bytes;
        Ok(())
    }

    /// Zero-pads `[used, capacity)` and marks the whole buffer as used.
    pub fn fill_with_zeroes(&mut self) {
        self.data[self.used..].fill(0);
        self.used = self.data.len();
    }

    /// Returns the buffer's format.
    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Returns the storage size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the number of valid bytes.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the valid bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Returns the number of valid blocks.
    pub fn blocks_used(&self) -> usize {
        self.format.bytes_to_blocks(self.used)
    }

    /// Returns the number of blocks the storage can hold.
    pub fn blocks_capacity(&self) -> usize {
        self.format.bytes_to_blocks(self.data.len())
    }

    /// Returns `true` if the buffer holds no valid data.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Returns the playback duration of the valid data.
    pub fn duration(&self) -> Duration {
        self.format.blocks_duration(self.blocks_used())
    }

    /// Full storage, for in-place filling by a recorder.
    pub(crate) fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Marks `bytes` (clamped to capacity, truncated to blocks) as valid.
    pub(crate) fn set_used(&mut self, bytes: usize) {
        let bytes = bytes.min(self.data.len());
        self.used = self.format.blocks_to_bytes(self.format.bytes_to_blocks(bytes));
    }
}

/// Allocates `bytes` zeroed bytes, reporting failure instead of aborting.
fn zeroed(bytes: usize) -> Result<Vec<u8>, EngineError> {
    let mut storage = Vec::new();
    storage
        .try_reserve_exact(bytes)
        .map_err(|_| EngineError::AllocationFailure { bytes })?;
    storage.resize(bytes, 0);
    Ok(storage)
}
