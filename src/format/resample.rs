//! Sample-rate, channel and encoding conversion between two PCM formats.
//!
//! The converter works block by block with integer fixed-point bookkeeping
//! (denominator [`PRECISION`]) so that long streams converted in many small
//! calls produce exactly the same output as one large call:
//!
//! - **Equal rates**: one input block becomes one output block.
//! - **Higher destination rate**: nearest-neighbour upsampling. Every input
//!   block advances the accumulator by `(dst - src) * PRECISION / src`; each
//!   time it reaches `PRECISION` the last written block is duplicated.
//! - **Lower destination rate**: box-filter decimation. Input blocks are summed
//!   and the accumulator advances by `dst * PRECISION / src`; each time it
//!   reaches `PRECISION` the running average is written and the sum restarts.
//!   There is no anti-aliasing low-pass stage.
//!
//! Rates that differ by less than one `PRECISION` unit per block are treated
//! as equal. The accumulator survives between [`Converter::convert`] calls and
//! is reset only when [`Converter::prepare`] is given a different format pair.
//!
//! Nothing in this module allocates, so [`Converter::convert`] is safe to call
//! from a real-time audio callback.

use super::{AudioFormat, SampleKind};
use crate::EngineError;

/// Denominator of the fixed-point rate accumulator.
pub const PRECISION: u32 = 512;

const PRECISION_U64: u64 = PRECISION as u64;

/// Progress made by one [`Converter::convert`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conversion {
    /// Input blocks consumed.
    pub blocks_read: usize,
    /// Output blocks produced.
    pub blocks_written: usize,
}

impl Conversion {
    /// Returns `true` if the call made no progress at all.
    ///
    /// Callers looping over `convert` must stop on a stalled conversion.
    pub fn is_stalled(&self) -> bool {
        self.blocks_read == 0 && self.blocks_written == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RateMode {
    Equal,
    Up { repeat_per_block: u64 },
    Down { accum_per_block: u64 },
}

impl RateMode {
    fn between(src_rate: u32, dst_rate: u32) -> Self {
        if src_rate == 0 || dst_rate == 0 || src_rate == dst_rate {
            return Self::Equal;
        }
        let src = u64::from(src_rate);
        let dst = u64::from(dst_rate);
        if dst > src {
            let repeat_per_block = (dst - src) * PRECISION_U64 / src;
            if repeat_per_block == 0 {
                Self::Equal
            } else {
                Self::Up { repeat_per_block }
            }
        } else if (src - dst) * PRECISION_U64 / src == 0 {
            Self::Equal
        } else {
            Self::Down {
                accum_per_block: (dst * PRECISION_U64 / src).max(1),
            }
        }
    }
}

/// Where one channel's samples live inside the byte slice handed to `convert`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChannelBinding {
    offset: usize,
    stride: usize,
}

impl ChannelBinding {
    /// Number of whole samples reachable in a slice of `len` bytes.
    fn reachable(&self, len: usize, sample_bytes: usize) -> usize {
        if self.offset + sample_bytes > len {
            return 0;
        }
        if self.stride == 0 {
            return usize::MAX;
        }
        (len - self.offset - sample_bytes) / self.stride + 1
    }

    fn at(&self, block: usize) -> usize {
        self.offset + block * self.stride
    }
}

#[derive(Debug, Clone, Copy)]
struct Prepared {
    src: AudioFormat,
    dst: AudioFormat,
    src_kind: SampleKind,
    dst_kind: SampleKind,
    mode: RateMode,
}

/// Fixed-point state carried between `convert` calls.
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    fixed: u64,
    count: u32,
    sums: [f64; 2],
    last: Option<[f64; 2]>,
}

/// Converts interleaved or planar PCM data from one format to another.
///
/// # Example
///
/// ```
/// use pcm_engine::{AudioFormat, Converter};
///
/// let src = AudioFormat::i16(1, 8000);
/// let dst = AudioFormat::f32(1, 16000);
///
/// let input: Vec<u8> = (0..100i16).flat_map(|s| (s * 100).to_ne_bytes()).collect();
/// let mut output = vec![0u8; 202 * dst.block_align()];
///
/// let mut converter = Converter::new();
/// converter.prepare(&src, &dst)?;
/// converter.set_src_interleaved(0);
/// converter.set_dst_interleaved(0);
/// let done = converter.convert(&input, 100, &mut output, 202);
/// assert_eq!(done.blocks_read, 100);
/// assert_eq!(done.blocks_written, 200);
/// # Ok::<(), pcm_engine::EngineError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct Converter {
    prepared: Option<Prepared>,
    src_channels: [ChannelBinding; 2],
    dst_channels: [ChannelBinding; 2],
    acc: Accumulator,
}

impl Converter {
    /// Creates an unprepared converter. `convert` is a no-op until
    /// [`prepare`](Self::prepare) succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and installs a source/destination format pair.
    ///
    /// Both formats must be one of {u8, i16, i32, f32} x {1, 2 channels}.
    /// Preparing the same pair again keeps the rate accumulator; a different
    /// pair resets it. Channel bindings are reset to interleaved at block 0.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnsupportedFormat`] and leaves the converter
    /// untouched if either format is unsupported.
    pub fn prepare(&mut self, src: &AudioFormat, dst: &AudioFormat) -> Result<(), EngineError> {
        let src_kind = supported_kind(src)?;
        let dst_kind = supported_kind(dst)?;

        let unchanged = self
            .prepared
            .is_some_and(|p| p.src == *src && p.dst == *dst);
        if !unchanged {
            self.acc = Accumulator::default();
        }

        self.prepared = Some(Prepared {
            src: *src,
            dst: *dst,
            src_kind,
            dst_kind,
            mode: RateMode::between(src.sample_rate(), dst.sample_rate()),
        });
        self.set_src_interleaved(0);
        self.set_dst_interleaved(0);
        Ok(())
    }

    /// Returns `true` once a format pair has been installed.
    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    /// Returns the prepared source format.
    pub fn src_format(&self) -> Option<AudioFormat> {
        self.prepared.map(|p| p.src)
    }

    /// Returns the prepared destination format.
    pub fn dst_format(&self) -> Option<AudioFormat> {
        self.prepared.map(|p| p.dst)
    }

    /// Returns `true` when source and destination formats are identical, in
    /// which case callers may copy bytes instead of converting.
    pub fn is_passthrough(&self) -> bool {
        self.prepared.is_some_and(|p| p.src == p.dst)
    }

    /// Discards any carried rate-conversion state.
    pub fn reset(&mut self) {
        self.acc = Accumulator::default();
    }

    /// Binds source `channel` to byte `offset` with `stride` bytes between blocks.
    pub fn set_src_channel(&mut self, channel: usize, offset: usize, stride: usize) {
        debug_assert!(channel < 2, "channel {channel} out of range");
        if let Some(binding) = self.src_channels.get_mut(channel) {
            *binding = ChannelBinding { offset, stride };
        }
    }

    /// Binds destination `channel` to byte `offset` with `stride` bytes between blocks.
    pub fn set_dst_channel(&mut self, channel: usize, offset: usize, stride: usize) {
        debug_assert!(channel < 2, "channel {channel} out of range");
        if let Some(binding) = self.dst_channels.get_mut(channel) {
            *binding = ChannelBinding { offset, stride };
        }
    }

    /// Binds every source channel to interleaved data starting at `first_block`.
    pub fn set_src_interleaved(&mut self, first_block: usize) {
        if let Some(p) = self.prepared {
            self.src_channels = interleaved(&p.src, p.src_kind, first_block);
        }
    }

    /// Binds every destination channel to interleaved data starting at `first_block`.
    pub fn set_dst_interleaved(&mut self, first_block: usize) {
        if let Some(p) = self.prepared {
            self.dst_channels = interleaved(&p.dst, p.dst_kind, first_block);
        }
    }

    /// Converts up to `src_blocks` blocks from `src` into at most
    /// `dst_capacity` blocks of `dst`.
    ///
    /// Block counts are further limited to what the bound channels can reach
    /// inside the given slices, so the call never reads or writes out of
    /// bounds. Channel bindings advance past the consumed/produced blocks, so
    /// consecutive calls continue where the previous one stopped.
    ///
    /// A result with zero blocks read and written means neither input nor
    /// output room remains; loops must stop there.
    pub fn convert(
        &mut self,
        src: &[u8],
        src_blocks: usize,
        dst: &mut [u8],
        dst_capacity: usize,
    ) -> Conversion {
        let Some(p) = self.prepared else {
            return Conversion::default();
        };

        let src_blocks = src_blocks.min(self.reachable_src(&p, src.len()));
        let dst_capacity = dst_capacity.min(self.reachable_dst(&p, dst.len()));

        let done = match p.mode {
            RateMode::Equal => self.convert_equal(&p, src, src_blocks, dst, dst_capacity),
            RateMode::Up { repeat_per_block } => {
                self.convert_up(&p, src, src_blocks, dst, dst_capacity, repeat_per_block)
            }
            RateMode::Down { accum_per_block } => {
                self.convert_down(&p, src, src_blocks, dst, dst_capacity, accum_per_block)
            }
        };

        for binding in &mut self.src_channels[..usize::from(p.src.channels())] {
            binding.offset += done.blocks_read * binding.stride;
        }
        for binding in &mut self.dst_channels[..usize::from(p.dst.channels())] {
            binding.offset += done.blocks_written * binding.stride;
        }

        done
    }

    /// Converts `src` into `dst`, both interleaved from their first byte,
    /// until the input is used up or `dst` is full.
    ///
    /// Rebinds both sides to interleaved block 0 first; the rate accumulator
    /// still carries over from earlier calls.
    pub fn convert_all(&mut self, src: &[u8], dst: &mut [u8]) -> Conversion {
        let Some(p) = self.prepared else {
            return Conversion::default();
        };
        self.set_src_interleaved(0);
        self.set_dst_interleaved(0);

        let src_blocks = p.src.bytes_to_blocks(src.len());
        let dst_blocks = p.dst.bytes_to_blocks(dst.len());
        let mut total = Conversion::default();
        while total.blocks_read < src_blocks {
            let step = self.convert(
                src,
                src_blocks - total.blocks_read,
                dst,
                dst_blocks - total.blocks_written,
            );
            if step.is_stalled() {
                break;
            }
            total.blocks_read += step.blocks_read;
            total.blocks_written += step.blocks_written;
        }
        total
    }

    fn convert_equal(
        &mut self,
        p: &Prepared,
        src: &[u8],
        src_blocks: usize,
        dst: &mut [u8],
        dst_capacity: usize,
    ) -> Conversion {
        let blocks = src_blocks.min(dst_capacity);
        for block in 0..blocks {
            let values = self.read_block(p, src, block);
            self.write_block(p, dst, block, values);
        }
        Conversion {
            blocks_read: blocks,
            blocks_written: blocks,
        }
    }

    fn convert_up(
        &mut self,
        p: &Prepared,
        src: &[u8],
        src_blocks: usize,
        dst: &mut [u8],
        dst_capacity: usize,
        repeat_per_block: u64,
    ) -> Conversion {
        let mut read = 0;
        let mut written = 0;
        loop {
            // Pending duplicates, possibly carried over from the previous call
            if let Some(last) = self.acc.last {
                while self.acc.fixed >= PRECISION_U64 && written < dst_capacity {
                    self.write_block(p, dst, written, last);
                    written += 1;
                    self.acc.fixed -= PRECISION_U64;
                }
                if self.acc.fixed >= PRECISION_U64 {
                    break;
                }
            }
            if read >= src_blocks || written >= dst_capacity {
                break;
            }
            let values = self.read_block(p, src, read);
            self.write_block(p, dst, written, values);
            self.acc.last = Some(values);
            self.acc.fixed += repeat_per_block;
            read += 1;
            written += 1;
        }
        Conversion {
            blocks_read: read,
            blocks_written: written,
        }
    }

    fn convert_down(
        &mut self,
        p: &Prepared,
        src: &[u8],
        src_blocks: usize,
        dst: &mut [u8],
        dst_capacity: usize,
        accum_per_block: u64,
    ) -> Conversion {
        let mut read = 0;
        let mut written = 0;
        while read < src_blocks {
            let emits = self.acc.fixed + accum_per_block >= PRECISION_U64;
            if emits && written >= dst_capacity {
                break;
            }
            let values = self.read_block(p, src, read);
            read += 1;
            self.acc.sums[0] += values[0];
            self.acc.sums[1] += values[1];
            self.acc.count += 1;
            self.acc.fixed += accum_per_block;

            if self.acc.fixed >= PRECISION_U64 {
                self.acc.fixed -= PRECISION_U64;
                let count = f64::from(self.acc.count);
                let average = [self.acc.sums[0] / count, self.acc.sums[1] / count];
                self.write_block(p, dst, written, average);
                written += 1;
                self.acc.sums = [0.0; 2];
                self.acc.count = 0;
            }
        }
        Conversion {
            blocks_read: read,
            blocks_written: written,
        }
    }

    /// Reads one block and maps it onto the destination channel layout, in
    /// the destination's value range (not yet truncated).
    #[inline]
    fn read_block(&self, p: &Prepared, src: &[u8], block: usize) -> [f64; 2] {
        let mut raw = [0.0; 2];
        for (channel, value) in raw
            .iter_mut()
            .enumerate()
            .take(usize::from(p.src.channels()))
        {
            let sample = p.src_kind.read(src, self.src_channels[channel].at(block));
            *value = p.src_kind.scale_to(p.dst_kind, sample);
        }
        match (p.src.channels(), p.dst.channels()) {
            (1, 2) => [raw[0], raw[0]],
            (2, 1) => [(raw[0] + raw[1]) / 2.0, 0.0],
            _ => raw,
        }
    }

    #[inline]
    fn write_block(&self, p: &Prepared, dst: &mut [u8], block: usize, values: [f64; 2]) {
        for (channel, value) in values
            .iter()
            .enumerate()
            .take(usize::from(p.dst.channels()))
        {
            let at = self.dst_channels[channel].at(block);
            p.dst_kind.write(dst, at, p.dst_kind.settle(*value));
        }
    }

    fn reachable_src(&self, p: &Prepared, len: usize) -> usize {
        self.src_channels[..usize::from(p.src.channels())]
            .iter()
            .map(|b| b.reachable(len, p.src_kind.bytes()))
            .min()
            .unwrap_or(0)
    }

    fn reachable_dst(&self, p: &Prepared, len: usize) -> usize {
        self.dst_channels[..usize::from(p.dst.channels())]
            .iter()
            .map(|b| b.reachable(len, p.dst_kind.bytes()))
            .min()
            .unwrap_or(0)
    }
}

fn supported_kind(format: &AudioFormat) -> Result<SampleKind, EngineError> {
    match format.sample_kind() {
        Some(kind) if format.is_supported() => Ok(kind),
        _ => Err(EngineError::unsupported(format)),
    }
}

fn interleaved(format: &AudioFormat, kind: SampleKind, first_block: usize) -> [ChannelBinding; 2] {
    let stride = format.block_align();
    let base = first_block * stride;
    [
        ChannelBinding {
            offset: base,
            stride,
        },
        ChannelBinding {
            offset: base + kind.bytes(),
            stride,
        },
    ]
}

/// Upper bound on the blocks `convert` produces from `src_blocks` input
/// blocks when converting from `src_rate` to `dst_rate`.
///
/// Uses the same fixed-point step as the converter plus one block for the
/// fractional state a converter may carry from a previous call. Use it to
/// size destination buffers.
///
/// ```
/// use pcm_engine::blocks_for_new_frequency;
///
/// assert_eq!(blocks_for_new_frequency(100, 16000, 16000), 100);
/// assert!(blocks_for_new_frequency(100, 8000, 16000) >= 200);
/// assert!(blocks_for_new_frequency(300, 48000, 16000) >= 100);
/// ```
pub fn blocks_for_new_frequency(src_blocks: usize, src_rate: u32, dst_rate: u32) -> usize {
    let blocks = src_blocks as u64;
    let bound = match RateMode::between(src_rate, dst_rate) {
        RateMode::Equal => blocks,
        RateMode::Up { repeat_per_block } => blocks + blocks * repeat_per_block / PRECISION_U64 + 1,
        RateMode::Down { accum_per_block } => blocks * accum_per_block / PRECISION_U64 + 1,
    };
    usize::try_from(bound).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn i16_samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect()
    }

    fn f32_samples(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    fn run(src: AudioFormat, dst: AudioFormat, input: &[u8], capacity: usize) -> (Conversion, Vec<u8>) {
        let mut converter = Converter::new();
        converter.prepare(&src, &dst).unwrap();
        let mut output = vec![0u8; capacity * dst.block_align()];
        let blocks = src.bytes_to_blocks(input.len());
        let done = converter.convert(input, blocks, &mut output, capacity);
        output.truncate(done.blocks_written * dst.block_align());
        (done, output)
    }

    #[test]
    fn test_prepare_rejects_unsupported() {
        let mut converter = Converter::new();
        let three_channels = AudioFormat::i16(3, 48000);
        let result = converter.prepare(&three_channels, &AudioFormat::i16(2, 48000));
        assert!(matches!(result, Err(EngineError::UnsupportedFormat { .. })));
        assert!(!converter.is_prepared());
    }

    #[test]
    fn test_unprepared_convert_is_noop() {
        let mut converter = Converter::new();
        let mut out = [0u8; 8];
        let done = converter.convert(&[1, 2, 3, 4], 2, &mut out, 2);
        assert!(done.is_stalled());
    }

    #[test]
    fn test_equal_rate_i16_to_f32() {
        let input = i16_bytes(&[0, 16384, -32768]);
        let (done, out) = run(AudioFormat::i16(1, 8000), AudioFormat::f32(1, 8000), &input, 3);
        assert_eq!(done.blocks_read, 3);
        assert_eq!(f32_samples(&out), vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn test_mono_to_stereo_duplicates() {
        let input = i16_bytes(&[100, 200]);
        let (_, out) = run(AudioFormat::i16(1, 8000), AudioFormat::i16(2, 8000), &input, 2);
        assert_eq!(i16_samples(&out), vec![100, 100, 200, 200]);
    }

    #[test]
    fn test_stereo_to_mono_averages() {
        let input = i16_bytes(&[100, 200, 300, 400, 1000, -1000, 100, 201]);
        let (_, out) = run(AudioFormat::i16(2, 8000), AudioFormat::i16(1, 8000), &input, 4);
        assert_eq!(i16_samples(&out), vec![150, 350, 0, 150]);
    }

    #[test]
    fn test_upsample_doubles_blocks() {
        let samples: Vec<i16> = (0..100).map(|i| i * 10).collect();
        let (done, out) = run(
            AudioFormat::i16(1, 8000),
            AudioFormat::f32(1, 16000),
            &i16_bytes(&samples),
            202,
        );
        assert_eq!(done.blocks_read, 100);
        assert_eq!(done.blocks_written, 200);
        let out = f32_samples(&out);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[198], out[199]);
        assert!(done.blocks_written <= blocks_for_new_frequency(100, 8000, 16000));
    }

    #[test]
    fn test_downsample_box_average() {
        let input = i16_bytes(&[100, 200, 300, 400]);
        let (done, out) = run(AudioFormat::i16(1, 16000), AudioFormat::i16(1, 8000), &input, 4);
        assert_eq!(done.blocks_read, 4);
        assert_eq!(i16_samples(&out), vec![150, 350]);
    }

    #[test]
    fn test_negligible_rate_difference_is_equal() {
        assert_eq!(RateMode::between(44100, 44101), RateMode::Equal);
        assert_eq!(RateMode::between(44101, 44100), RateMode::Equal);
        assert_eq!(blocks_for_new_frequency(1000, 44100, 44101), 1000);
    }

    #[test]
    fn test_never_writes_past_capacity() {
        let samples: Vec<i16> = (0..50).collect();
        let input = i16_bytes(&samples);
        let mut converter = Converter::new();
        converter
            .prepare(&AudioFormat::i16(1, 8000), &AudioFormat::i16(1, 24000))
            .unwrap();
        let mut output = vec![0xAAu8; 64];
        let done = converter.convert(&input, 50, &mut output[..20], 10);
        assert_eq!(done.blocks_written, 10);
        assert!(output[20..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_chunked_upsample_matches_single_call() {
        let src = AudioFormat::i16(2, 11025);
        let dst = AudioFormat::i16(2, 44100);
        let samples: Vec<i16> = (0..400).map(|i| (i * 37 % 2000) as i16).collect();
        let input = i16_bytes(&samples);

        let (_, whole) = run(src, dst, &input, 1000);

        let mut converter = Converter::new();
        converter.prepare(&src, &dst).unwrap();
        let mut output = vec![0u8; 1000 * dst.block_align()];
        let mut read = 0;
        let mut written = 0;
        loop {
            converter.set_src_interleaved(read);
            converter.set_dst_interleaved(written);
            let remaining = (200 - read).min(7);
            let done = converter.convert(&input, remaining, &mut output, 3);
            if done.is_stalled() {
                break;
            }
            read += done.blocks_read;
            written += done.blocks_written;
        }
        output.truncate(written * dst.block_align());
        assert_eq!(read, 200);
        assert_eq!(output, whole);
    }

    #[test]
    fn test_chunked_downsample_carries_accumulator() {
        let src = AudioFormat::i16(1, 48000);
        let dst = AudioFormat::i16(1, 16000);
        let samples: Vec<i16> = (0..300).map(|i| i as i16).collect();
        let input = i16_bytes(&samples);
        let (_, whole) = run(src, dst, &input, 200);

        let mut converter = Converter::new();
        converter.prepare(&src, &dst).unwrap();
        let mut output = vec![0u8; 200 * 2];
        let mut written = 0;
        for chunk in input.chunks(2 * 7) {
            converter.set_src_interleaved(0);
            converter.set_dst_interleaved(written);
            let done = converter.convert(chunk, chunk.len() / 2, &mut output, 200);
            written += done.blocks_written;
        }
        output.truncate(written * 2);
        assert_eq!(output, whole);
        assert!(written <= blocks_for_new_frequency(300, 48000, 16000));
    }

    #[test]
    fn test_prepare_new_pair_resets_accumulator() {
        let mut converter = Converter::new();
        let src = AudioFormat::i16(1, 16000);
        converter.prepare(&src, &AudioFormat::i16(1, 8000)).unwrap();
        let mut out = [0u8; 8];
        converter.convert(&i16_bytes(&[10]), 1, &mut out, 4);
        assert_ne!(converter.acc.fixed, 0);

        converter.prepare(&src, &AudioFormat::i16(1, 8000)).unwrap();
        assert_ne!(converter.acc.fixed, 0, "same pair keeps state");

        converter.prepare(&src, &AudioFormat::i16(1, 11025)).unwrap();
        assert_eq!(converter.acc.fixed, 0);
        assert_eq!(converter.acc.count, 0);
    }

    #[test]
    fn test_planar_bindings() {
        let left = i16_bytes(&[1, 2, 3]);
        let right = i16_bytes(&[-1, -2, -3]);
        let mut planar = left.clone();
        planar.extend_from_slice(&right);

        let mut converter = Converter::new();
        converter
            .prepare(&AudioFormat::i16(2, 8000), &AudioFormat::i16(2, 8000))
            .unwrap();
        converter.set_src_channel(0, 0, 2);
        converter.set_src_channel(1, left.len(), 2);
        let mut out = vec![0u8; 12];
        let done = converter.convert(&planar, 3, &mut out, 3);
        assert_eq!(done.blocks_written, 3);
        assert_eq!(i16_samples(&out), vec![1, -1, 2, -2, 3, -3]);
    }

    #[test]
    fn test_roundtrip_all_pairs_within_quantization() {
        use crate::format::SampleEncoding;
        let formats = [
            AudioFormat::u8(1, 8000),
            AudioFormat::i16(1, 8000),
            AudioFormat::i32(1, 8000),
            AudioFormat::f32(1, 8000),
        ];
        let reference = AudioFormat::i16(1, 8000);
        let samples: Vec<i16> = vec![0, 256, -256, 12800, -12800, 32512, -32768];
        let input = i16_bytes(&samples);

        for via in formats {
            let (_, there) = run(reference, via, &input, samples.len());
            let (_, back) = run(via, reference, &there, samples.len());
            let back = i16_samples(&back);
            let step = if via.encoding() == SampleEncoding::Int && via.bits_per_sample() == 8 {
                256
            } else {
                1
            };
            for (a, b) in samples.iter().zip(&back) {
                assert!(
                    (i32::from(*a) - i32::from(*b)).abs() <= step,
                    "{a} -> {via} -> {b}"
                );
            }
        }
    }

    #[test]
    fn test_blocks_for_new_frequency_bounds() {
        for &(src, dst) in &[(8000, 16000), (22050, 44100), (44100, 48000), (48000, 8000), (16000, 11025)] {
            for n in [0usize, 1, 17, 1000] {
                let src_format = AudioFormat::i16(1, src);
                let dst_format = AudioFormat::i16(1, dst);
                let input = vec![0u8; n * 2];
                let (done, _) = run(src_format, dst_format, &input, n * 8 + 8);
                assert!(done.blocks_written <= blocks_for_new_frequency(n, src, dst));
            }
        }
    }
}
