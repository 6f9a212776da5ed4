//! Per-sample conversion between the four supported encodings.
//!
//! Values travel between encodings as `f64` in the *destination's* native
//! range (0..=255 for u8, ±2^15 for i16, ±2^31 for i32, ±1.0 for f32), which
//! holds every i32 sample exactly. Scale factors per ordered pair:
//!
//! | from \ to | u8            | i16            | i32            | f32          |
//! |-----------|---------------|----------------|----------------|--------------|
//! | u8        | =             | (v-128) << 8   | (v-128) << 24  | (v-128)/128  |
//! | i16       | (v >> 8)+128  | =              | v << 16        | v/32768      |
//! | i32       | (v >> 24)+128 | v >> 16        | =              | v/2^31       |
//! | f32       | v*127+128     | v*32767        | v*(2^31-1)     | =            |
//!
//! Shifts are arithmetic (round toward negative infinity). Float sources are
//! clamped to [-1.0, 1.0] and rounded to nearest when the destination is an
//! integer, so -1.0 maps to -32767 rather than -32768 (symmetric scaling).

use super::SampleEncoding;

const I16_SCALE: f64 = 32768.0;
const I32_SCALE: f64 = 2_147_483_648.0;
const U8_OFFSET: f64 = 128.0;

/// One of the four sample encodings the converter handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// 8-bit unsigned, silence at 128.
    U8,
    /// 16-bit signed.
    I16,
    /// 32-bit signed.
    I32,
    /// 32-bit float in [-1.0, 1.0].
    F32,
}

impl SampleKind {
    pub(crate) fn from_parts(encoding: SampleEncoding, bits_per_sample: u16) -> Option<Self> {
        match (encoding, bits_per_sample) {
            (SampleEncoding::Int, 8) => Some(Self::U8),
            (SampleEncoding::Int, 16) => Some(Self::I16),
            (SampleEncoding::Int, 32) => Some(Self::I32),
            (SampleEncoding::Float, 32) => Some(Self::F32),
            _ => None,
        }
    }

    /// Width of one sample in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
        }
    }

    /// Returns `true` for the float encoding.
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32)
    }

    /// Reads the native-endian sample at byte offset `at`.
    ///
    /// Callers guarantee `at + self.bytes() <= data.len()`.
    #[inline]
    pub(crate) fn read(self, data: &[u8], at: usize) -> f64 {
        match self {
            Self::U8 => f64::from(data[at]),
            Self::I16 => f64::from(i16::from_ne_bytes([data[at], data[at + 1]])),
            Self::I32 => f64::from(i32::from_ne_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ])),
            Self::F32 => f64::from(f32::from_ne_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ])),
        }
    }

    /// Writes `value` (already in this kind's range) at byte offset `at`,
    /// clamping to the representable range.
    #[inline]
    pub(crate) fn write(self, data: &mut [u8], at: usize, value: f64) {
        match self {
            Self::U8 => data[at] = value.clamp(0.0, 255.0) as u8,
            Self::I16 => {
                let sample = value.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
                data[at..at + 2].copy_from_slice(&sample.to_ne_bytes());
            }
            Self::I32 => {
                let sample = value.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32;
                data[at..at + 4].copy_from_slice(&sample.to_ne_bytes());
            }
            Self::F32 => {
                let sample = value as f32;
                data[at..at + 4].copy_from_slice(&sample.to_ne_bytes());
            }
        }
    }

    /// Maps a sample value of this kind into the range of `dst`.
    ///
    /// # Example
    ///
    /// ```
    /// use pcm_engine::SampleKind;
    ///
    /// assert_eq!(SampleKind::I16.scale_to(SampleKind::F32, -16384.0), -0.5);
    /// assert_eq!(SampleKind::F32.scale_to(SampleKind::U8, 1.0), 255.0);
    /// assert_eq!(SampleKind::U8.scale_to(SampleKind::I16, 255.0), 32512.0);
    /// ```
    #[inline]
    pub fn scale_to(self, dst: SampleKind, v: f64) -> f64 {
        use SampleKind::{F32, I16, I32, U8};
        match (self, dst) {
            (U8, U8) | (I16, I16) | (I32, I32) | (F32, F32) => v,

            (U8, I16) => (v - U8_OFFSET) * 256.0,
            (U8, I32) => (v - U8_OFFSET) * 16_777_216.0,
            (U8, F32) => (v - U8_OFFSET) / U8_OFFSET,

            (I16, U8) => (v / 256.0).floor() + U8_OFFSET,
            (I16, I32) => v * 65536.0,
            (I16, F32) => v / I16_SCALE,

            (I32, U8) => (v / 16_777_216.0).floor() + U8_OFFSET,
            (I32, I16) => (v / 65536.0).floor(),
            (I32, F32) => v / I32_SCALE,

            (F32, U8) => (v.clamp(-1.0, 1.0) * 127.0).round() + U8_OFFSET,
            (F32, I16) => (v.clamp(-1.0, 1.0) * 32767.0).round(),
            (F32, I32) => (v.clamp(-1.0, 1.0) * 2_147_483_647.0).round(),
        }
    }

    /// Finishes an averaged value: integer kinds truncate toward zero like
    /// integer division, floats pass through.
    #[inline]
    pub(crate) fn settle(self, v: f64) -> f64 {
        if self.is_float() {
            v
        } else {
            v.trunc()
        }
    }

    /// Silence value in this kind's range.
    pub fn silence(self) -> f64 {
        match self {
            Self::U8 => U8_OFFSET,
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SampleKind::{F32, I16, I32, U8};

    const KINDS: [SampleKind; 4] = [U8, I16, I32, F32];

    #[test]
    fn test_i16_to_f32_full_range() {
        assert_eq!(I16.scale_to(F32, 32767.0), 32767.0 / 32768.0);
        assert_eq!(I16.scale_to(F32, -32768.0), -1.0);
        assert_eq!(I16.scale_to(F32, 0.0), 0.0);
    }

    #[test]
    fn test_f32_to_i16_clamping() {
        assert_eq!(F32.scale_to(I16, 1.0), 32767.0);
        assert_eq!(F32.scale_to(I16, -1.0), -32767.0);
        assert_eq!(F32.scale_to(I16, 2.0), 32767.0);
        assert_eq!(F32.scale_to(I16, -2.0), -32767.0);
    }

    #[test]
    fn test_u8_offset() {
        assert_eq!(U8.scale_to(I16, 128.0), 0.0);
        assert_eq!(U8.scale_to(I32, 0.0), -2_147_483_648.0);
        assert_eq!(U8.scale_to(F32, 0.0), -1.0);
        assert_eq!(I16.scale_to(U8, -32768.0), 0.0);
        assert_eq!(I16.scale_to(U8, 32767.0), 255.0);
        assert_eq!(F32.scale_to(U8, 0.0), 128.0);
        assert_eq!(F32.scale_to(U8, -1.0), 1.0);
    }

    #[test]
    fn test_i32_narrowing_is_arithmetic_shift() {
        assert_eq!(I32.scale_to(I16, -1.0), -1.0);
        assert_eq!(I32.scale_to(I16, 65536.0 * 3.0 + 5.0), 3.0);
        assert_eq!(I32.scale_to(U8, f64::from(i32::MAX)), 255.0);
        assert_eq!(I32.scale_to(U8, f64::from(i32::MIN)), 0.0);
    }

    #[test]
    fn test_identity_pairs() {
        for kind in KINDS {
            assert_eq!(kind.scale_to(kind, 100.0), 100.0);
        }
    }

    #[test]
    fn test_roundtrip_through_wider_kind() {
        for &original in &[0i16, 1000, -1000, 32767, -32768] {
            let v = f64::from(original);
            let f = I16.scale_to(F32, v);
            let back = F32.scale_to(I16, f);
            assert!((v - back).abs() <= 1.0, "{original} -> {back}");

            let wide = I16.scale_to(I32, v);
            assert_eq!(I32.scale_to(I16, wide), v);
        }
    }

    #[test]
    fn test_read_write_native_endian() {
        let mut data = [0u8; 8];
        I16.write(&mut data, 2, -1234.0);
        assert_eq!(I16.read(&data, 2), -1234.0);

        F32.write(&mut data, 4, 0.25);
        assert_eq!(F32.read(&data, 4), 0.25);

        I32.write(&mut data, 0, 3e10);
        assert_eq!(I32.read(&data, 0), f64::from(i32::MAX));

        U8.write(&mut data, 7, -5.0);
        assert_eq!(U8.read(&data, 7), 0.0);
    }

    #[test]
    fn test_settle_truncates_integers() {
        assert_eq!(I16.settle(150.5), 150.0);
        assert_eq!(I16.settle(-150.5), -150.0);
        assert_eq!(F32.settle(0.125), 0.125);
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(SampleKind::from_parts(SampleEncoding::Int, 8), Some(U8));
        assert_eq!(SampleKind::from_parts(SampleEncoding::Float, 32), Some(F32));
        assert_eq!(SampleKind::from_parts(SampleEncoding::Float, 16), None);
        assert_eq!(SampleKind::from_parts(SampleEncoding::Int, 24), None);
    }
}
