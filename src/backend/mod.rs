//! Contract between the engine core and a native audio API.
//!
//! A [`Backend`] is chosen when the [`Engine`](crate::Engine) is built. It
//! hands out one [`Voice`] per playback source and one [`CaptureDevice`] per
//! recorder. Every method that has a sensible "nothing to do" behavior has a
//! default, so a backend only implements what its API supports.
//!
//! Voices follow a push model: the core allocates native buffer handles,
//! uploads bytes into them, enqueues them, and later collects the handles the
//! backend has finished with through [`Voice::unqueue_processed`].

mod mock;

#[cfg(feature = "cpal")]
mod cpal;

pub use mock::{MockBackend, MockCapture, MockVoice};

#[cfg(feature = "cpal")]
pub use self::cpal::CpalBackend;

use crate::format::AudioFormat;
use crate::EngineError;

/// Opaque id of a buffer object owned by a [`Voice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeBuffer(pub u32);

/// Playback state as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VoiceState {
    /// Consuming queued buffers.
    Playing,
    /// Holding position.
    Paused,
    /// Idle: never started, stopped, or ran out of data.
    #[default]
    Stopped,
}

/// A native audio API, selected at engine construction.
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Opens the output context.
    fn activate(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Closes the output context. Voices stay allocated.
    fn deactivate(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Called once at the start of every engine tick.
    fn tick(&self) {}

    /// Creates a playback voice.
    fn create_voice(&self) -> Result<Box<dyn Voice>, EngineError> {
        Err(EngineError::backend(format!(
            "{} backend has no playback support",
            self.name()
        )))
    }

    /// Opens a capture device delivering data as close to `requested` as the
    /// hardware allows.
    fn create_capture(
        &self,
        requested: &AudioFormat,
    ) -> Result<Box<dyn CaptureDevice>, EngineError> {
        let _ = requested;
        Err(EngineError::backend(format!(
            "{} backend has no capture support",
            self.name()
        )))
    }
}

/// One playback endpoint of a backend.
///
/// Buffers passed to [`enqueue`](Self::enqueue) are played in order. Each
/// is returned exactly once by [`unqueue_processed`](Self::unqueue_processed)
/// after it has been played or after [`stop`](Self::stop).
pub trait Voice: Send {
    /// The format the voice wants its buffers in, given what the user queues.
    /// Sources convert when this differs from `requested`.
    fn native_format(&self, requested: &AudioFormat) -> AudioFormat {
        *requested
    }

    /// Allocates a native buffer object.
    fn alloc_buffer(&mut self) -> Result<NativeBuffer, EngineError>;

    /// Releases a native buffer object. The handle is not queued.
    fn free_buffer(&mut self, handle: NativeBuffer) {
        let _ = handle;
    }

    /// Copies `data` into the buffer object.
    fn upload(
        &mut self,
        handle: NativeBuffer,
        format: &AudioFormat,
        data: &[u8],
    ) -> Result<(), EngineError>;

    /// Attaches (or detaches, with `None`) the single buffer of a static source.
    fn set_static_buffer(&mut self, handle: Option<NativeBuffer>) -> Result<(), EngineError> {
        let _ = handle;
        Ok(())
    }

    /// Appends the buffer object to the play queue.
    fn enqueue(&mut self, handle: NativeBuffer) -> Result<(), EngineError>;

    /// Returns the oldest queued buffer that is finished, if any.
    fn unqueue_processed(&mut self) -> Option<NativeBuffer> {
        None
    }

    /// Starts or resumes playback.
    fn play(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Holds playback at the current position.
    fn pause(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Stops playback and marks every queued buffer processed.
    fn stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Current state of the voice.
    fn state(&self) -> VoiceState {
        VoiceState::Stopped
    }

    /// Sets the linear output gain.
    fn set_volume(&mut self, gain: f32) {
        let _ = gain;
    }

    /// Loops the static buffer when set.
    fn set_looping(&mut self, looping: bool) {
        let _ = looping;
    }

    /// Seeks within the buffer being played, in native-format bytes.
    fn set_offset_bytes(&mut self, bytes: usize) -> Result<(), EngineError> {
        let _ = bytes;
        Ok(())
    }

    /// Play position within the current buffer, in native-format bytes.
    fn offset_bytes(&self) -> usize {
        0
    }
}

/// One capture endpoint of a backend.
pub trait CaptureDevice: Send {
    /// Format of the bytes returned by [`read_available`](Self::read_available).
    fn native_format(&self) -> AudioFormat;

    /// Starts delivering data.
    fn start(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Stops delivering data. Already captured bytes stay readable.
    fn stop(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Copies up to `out.len()` captured bytes into `out` and returns how many
    /// were written. Never blocks.
    fn read_available(&mut self, out: &mut [u8]) -> usize {
        let _ = out;
        0
    }

    /// Returns and resets the number of blocks the device lost before they
    /// could be read.
    fn take_dropped_blocks(&mut self) -> usize {
        0
    }
}
