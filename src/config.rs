//! Configuration types for the engine.

use std::time::Duration;

use crate::format::AudioFormat;

/// Named formats for common use cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatPreset {
    /// 16kHz mono int16 - speech capture and voice chat.
    #[default]
    Voice,

    /// 44.1kHz stereo int16.
    Cd,

    /// 48kHz stereo float32 - the usual mixer format of desktop devices.
    Studio,
}

impl FormatPreset {
    /// Returns the format this preset names.
    #[must_use]
    pub fn format(&self) -> AudioFormat {
        match self {
            Self::Voice => AudioFormat::i16(1, 16000),
            Self::Cd => AudioFormat::i16(2, 44100),
            Self::Studio => AudioFormat::f32(2, 48000),
        }
    }

    /// Returns the preset's sample rate.
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.format().sample_rate()
    }

    /// Returns the preset's channel count.
    #[must_use]
    pub fn channels(&self) -> u16 {
        self.format().channels()
    }
}

impl From<FormatPreset> for AudioFormat {
    fn from(preset: FormatPreset) -> Self {
        preset.format()
    }
}

/// Configuration for engine behavior.
///
/// Use [`EngineConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use pcm_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig {
///     tick_interval: Duration::from_millis(5),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the background ticker started by
    /// [`Engine::spawn_ticker`](crate::Engine::spawn_ticker).
    ///
    /// Shorter periods deliver callbacks sooner at the cost of more wakeups.
    /// Default: 10ms
    pub tick_interval: Duration,

    /// Buffers each stream can hand to its callback in one tick without
    /// growing its notification batch.
    ///
    /// Batches also grow (outside the audio path) to the deepest queue a
    /// stream has seen.
    /// Default: 16
    pub notify_batch_capacity: usize,

    /// Number of audio groups. Groups start enabled at volume 1.0.
    ///
    /// Default: 4
    pub audio_groups: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            notify_batch_capacity: 16,
            audio_groups: 4,
        }
    }
}
