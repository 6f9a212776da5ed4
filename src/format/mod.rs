//! PCM format description and conversion.
//!
//! - [`AudioFormat`]: encoding, channel count, sample width and rate of a stream
//! - [`SampleKind`]: per-sample scaling rules between the four encodings
//! - [`Converter`]: channel mapping plus fixed-point sample-rate conversion

mod convert;
mod resample;

use std::fmt;
use std::time::Duration;

pub use convert::SampleKind;
pub use resample::{blocks_for_new_frequency, Conversion, Converter, PRECISION};

/// Numeric encoding of the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleEncoding {
    /// Integer samples (8-bit unsigned, 16/32-bit signed).
    Int,
    /// IEEE float samples.
    Float,
}

/// Describes the layout of interleaved PCM data.
///
/// `block_align` is always `(bits_per_sample / 8) * channels`; the fields are
/// private so that invariant cannot be broken. Two formats are equal iff all
/// five fields match, sample rate included.
///
/// # Example
///
/// ```
/// use pcm_engine::{AudioFormat, SampleEncoding};
///
/// let format = AudioFormat::new(SampleEncoding::Int, 2, 16, 44100);
/// assert_eq!(format.block_align(), 4);
/// assert_eq!(format.blocks_to_bytes(441), 1764);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    encoding: SampleEncoding,
    channels: u16,
    bits_per_sample: u16,
    sample_rate: u32,
    block_align: u16,
}

impl AudioFormat {
    /// Creates a format, deriving `block_align` from the other fields.
    pub fn new(
        encoding: SampleEncoding,
        channels: u16,
        bits_per_sample: u16,
        sample_rate: u32,
    ) -> Self {
        Self {
            encoding,
            channels,
            bits_per_sample,
            sample_rate,
            block_align: (bits_per_sample / 8).saturating_mul(channels),
        }
    }

    /// 8-bit unsigned (offset-128) integer samples.
    pub fn u8(channels: u16, sample_rate: u32) -> Self {
        Self::new(SampleEncoding::Int, channels, 8, sample_rate)
    }

    /// 16-bit signed integer samples.
    pub fn i16(channels: u16, sample_rate: u32) -> Self {
        Self::new(SampleEncoding::Int, channels, 16, sample_rate)
    }

    /// 32-bit signed integer samples.
    pub fn i32(channels: u16, sample_rate: u32) -> Self {
        Self::new(SampleEncoding::Int, channels, 32, sample_rate)
    }

    /// 32-bit float samples in unit range.
    pub fn f32(channels: u16, sample_rate: u32) -> Self {
        Self::new(SampleEncoding::Float, channels, 32, sample_rate)
    }

    /// Returns the sample encoding.
    pub fn encoding(&self) -> SampleEncoding {
        self.encoding
    }

    /// Returns the channel count.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Returns the width of one sample in bits.
    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    /// Returns the sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the size of one block (one sample per channel) in bytes.
    pub fn block_align(&self) -> usize {
        usize::from(self.block_align)
    }

    /// Returns the sample kind, or `None` if the encoding/width pair is not
    /// one of the four the converter understands.
    pub fn sample_kind(&self) -> Option<SampleKind> {
        SampleKind::from_parts(self.encoding, self.bits_per_sample)
    }

    /// Returns `true` for {u8, i16, i32, f32} x {1, 2 channels} at a non-zero rate.
    pub fn is_supported(&self) -> bool {
        self.sample_kind().is_some() && (1..=2).contains(&self.channels) && self.sample_rate > 0
    }

    /// Converts a block count to bytes.
    pub fn blocks_to_bytes(&self, blocks: usize) -> usize {
        blocks.saturating_mul(self.block_align())
    }

    /// Converts bytes to whole blocks, dropping any partial block.
    pub fn bytes_to_blocks(&self, bytes: usize) -> usize {
        if self.block_align == 0 {
            return 0;
        }
        bytes / self.block_align()
    }

    /// Converts milliseconds to blocks at this format's rate (rounded down).
    pub fn ms_to_blocks(&self, ms: u64) -> usize {
        (ms.saturating_mul(u64::from(self.sample_rate)) / 1000) as usize
    }

    /// Returns the playback duration of `blocks` blocks.
    pub fn blocks_duration(&self, blocks: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = blocks as u128 * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{}bit/{}ch/{}Hz",
            self.encoding, self.bits_per_sample, self.channels, self.sample_rate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_align_derived() {
        assert_eq!(AudioFormat::u8(1, 8000).block_align(), 1);
        assert_eq!(AudioFormat::i16(2, 44100).block_align(), 4);
        assert_eq!(AudioFormat::i32(2, 48000).block_align(), 8);
        assert_eq!(AudioFormat::f32(1, 48000).block_align(), 4);
    }

    #[test]
    fn test_equality_includes_sample_rate() {
        assert_eq!(AudioFormat::i16(1, 22050), AudioFormat::i16(1, 22050));
        assert_ne!(AudioFormat::i16(1, 22050), AudioFormat::i16(1, 22051));
        assert_ne!(AudioFormat::i32(1, 22050), AudioFormat::f32(1, 22050));
    }

    #[test]
    fn test_supported_formats() {
        assert!(AudioFormat::u8(2, 8000).is_supported());
        assert!(AudioFormat::f32(1, 96000).is_supported());
        assert!(!AudioFormat::i16(3, 48000).is_supported());
        assert!(!AudioFormat::new(SampleEncoding::Int, 2, 24, 48000).is_supported());
        assert!(!AudioFormat::new(SampleEncoding::Float, 1, 64, 48000).is_supported());
        assert!(!AudioFormat::i16(1, 0).is_supported());
    }

    #[test]
    fn test_block_conversions() {
        let format = AudioFormat::i16(2, 16000);
        assert_eq!(format.bytes_to_blocks(4003), 1000);
        assert_eq!(format.ms_to_blocks(100), 1600);
        assert_eq!(format.blocks_duration(1600), Duration::from_millis(100));
    }

    #[test]
    fn test_display() {
        assert_eq!(AudioFormat::f32(2, 48000).to_string(), "Float/32bit/2ch/48000Hz");
    }
}
