//! Variable-length size codec for stream-oriented protocols.
//!
//! Each byte carries a continuation marker in its high bit and seven
//! value bits, most significant group first (similar to protobuf varints
//! but big-endian). At most eight bytes are used, so the largest
//! representable value is 2^56 - 1.

use std::fmt;

/// Incrementally encoded or decoded length prefix.
///
/// For encoding, construct from an unsigned (or non-negative signed)
/// integer and ship [`bytes`]. For decoding, start from `default()` and
/// feed bytes until [`is_complete`]; partial chunks are fine.
///
/// ```
/// use evio::VariableLengthSize;
///
/// let encoded = VariableLengthSize::from(0x4000u64);
/// assert_eq!(encoded.bytes(), &[0x81, 0x80, 0x00]);
///
/// let mut decoded = VariableLengthSize::default();
/// assert_eq!(decoded.add_bytes(encoded.bytes()), 3);
/// assert!(decoded.is_complete());
/// assert_eq!(decoded.value(), 0x4000);
/// ```
///
/// [`bytes`]: VariableLengthSize::bytes
/// [`is_complete`]: VariableLengthSize::is_complete
#[derive(Clone, Default)]
pub struct VariableLengthSize {
    bytes: [u8; Self::MAX_BYTES],
    len: usize,
    value: u64,
    complete: bool,
    failed: bool,
}

impl VariableLengthSize {
    const MAX_BYTES: usize = 8;

    /// Placeholder returned by [`value`] before decoding completes.
    ///
    /// [`value`]: VariableLengthSize::value
    pub const INVALID_VALUE: u64 = u64::MAX;

    /// Largest encodable value: seven value bits per byte, eight bytes.
    pub const MAX_VALUE: u64 = u64::MAX >> 8;

    fn encode(value: u64) -> VariableLengthSize {
        if value > Self::MAX_VALUE {
            return Self::failed_instance();
        }

        let mut this = VariableLengthSize {
            value,
            complete: true,
            ..Default::default()
        };

        // Seven-bit groups, high bits first, markers on all but the last.
        let mut groups = [0u8; Self::MAX_BYTES];
        let mut count = 0;
        let mut rest = value;
        loop {
            groups[count] = (rest & 0x7F) as u8;
            count += 1;
            rest >>= 7;
            if rest == 0 {
                break;
            }
        }
        for i in 0..count {
            let group = groups[count - 1 - i];
            let marker = if i + 1 < count { 0x80 } else { 0 };
            this.bytes[i] = marker | group;
        }
        this.len = count;
        this
    }

    fn failed_instance() -> VariableLengthSize {
        VariableLengthSize {
            failed: true,
            ..Default::default()
        }
    }

    /// Decoded (or encoded) value; [`INVALID_VALUE`] until complete.
    ///
    /// [`INVALID_VALUE`]: VariableLengthSize::INVALID_VALUE
    pub fn value(&self) -> u64 {
        if self.complete && !self.failed {
            self.value
        } else {
            Self::INVALID_VALUE
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn fail(&self) -> bool {
        self.failed
    }

    pub fn bytes_count(&self) -> usize {
        self.len
    }

    /// Encoded bytes accumulated so far.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Feeds one byte to the decoder. Returns whether the byte was
    /// consumed; completed or failed codecs consume nothing.
    pub fn add_byte(&mut self, byte: u8) -> bool {
        if self.complete || self.failed {
            return false;
        }
        if self.len == Self::MAX_BYTES {
            self.failed = true;
            return false;
        }

        self.bytes[self.len] = byte;
        self.len += 1;
        self.value = (self.value << 7) | u64::from(byte & 0x7F);

        if byte & 0x80 == 0 {
            self.complete = true;
        } else if self.len == Self::MAX_BYTES {
            // Eight bytes without a terminator cannot be completed.
            self.failed = true;
        }
        true
    }

    /// Feeds a chunk to the decoder; returns how many bytes were
    /// consumed (decoding stops at the terminator byte).
    pub fn add_bytes(&mut self, bytes: &[u8]) -> usize {
        let mut processed = 0;
        for byte in bytes {
            if !self.add_byte(*byte) {
                break;
            }
            processed += 1;
            if self.complete {
                break;
            }
        }
        processed
    }

    /// Resets to the pristine decoding state.
    pub fn reset(&mut self) {
        *self = VariableLengthSize::default();
    }
}

macro_rules! impl_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for VariableLengthSize {
            fn from(value: $t) -> VariableLengthSize {
                VariableLengthSize::encode(value as u64)
            }
        }
    )*};
}

macro_rules! impl_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for VariableLengthSize {
            fn from(value: $t) -> VariableLengthSize {
                if value < 0 {
                    VariableLengthSize::failed_instance()
                } else {
                    VariableLengthSize::encode(value as u64)
                }
            }
        }
    )*};
}

impl_from_unsigned!(u8, u16, u32, u64, usize);
impl_from_signed!(i8, i16, i32, i64, isize);

impl fmt::Debug for VariableLengthSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableLengthSize")
            .field("value", &self.value)
            .field("bytes", &self.bytes())
            .field("complete", &self.complete)
            .field("failed", &self.failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_vectors() {
        assert_eq!(VariableLengthSize::from(0u64).bytes(), &[0x00]);
        assert_eq!(VariableLengthSize::from(1u64).bytes(), &[0x01]);
        assert_eq!(VariableLengthSize::from(127u64).bytes(), &[0x7F]);
        assert_eq!(VariableLengthSize::from(128u64).bytes(), &[0x81, 0x00]);
        assert_eq!(VariableLengthSize::from(0x4000u64).bytes(), &[0x81, 0x80, 0x00]);
    }

    #[test]
    fn decodes_byte_at_a_time() {
        let mut codec = VariableLengthSize::default();
        assert!(codec.add_byte(0x81));
        assert!(!codec.is_complete());
        assert!(codec.add_byte(0x80));
        assert!(!codec.is_complete());
        assert!(codec.add_byte(0x00));
        assert!(codec.is_complete());
        assert_eq!(codec.value(), 0x4000);
        assert_eq!(codec.bytes_count(), 3);

        // A complete codec consumes nothing further.
        assert!(!codec.add_byte(0x01));
    }

    #[test]
    fn round_trips_boundaries() {
        for value in [
            0u64,
            1,
            127,
            128,
            0x3FFF,
            0x4000,
            u32::MAX as u64,
            VariableLengthSize::MAX_VALUE,
        ] {
            let encoded = VariableLengthSize::from(value);
            assert!(!encoded.fail());
            let mut decoded = VariableLengthSize::default();
            assert_eq!(decoded.add_bytes(encoded.bytes()), encoded.bytes_count());
            assert!(decoded.is_complete());
            assert_eq!(decoded.value(), value, "value {:#x}", value);
            assert_eq!(decoded.bytes_count(), encoded.bytes_count());
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(VariableLengthSize::from(VariableLengthSize::MAX_VALUE + 1).fail());
        assert!(VariableLengthSize::from(u64::MAX).fail());
        assert!(VariableLengthSize::from(-1i64).fail());
        assert!(VariableLengthSize::from(i32::MIN).fail());
    }

    #[test]
    fn incomplete_value_is_invalid() {
        let mut codec = VariableLengthSize::default();
        codec.add_byte(0x81);
        assert_eq!(codec.value(), VariableLengthSize::INVALID_VALUE);
        assert!(!codec.is_complete());
        assert!(!codec.fail());
    }

    #[test]
    fn overlong_sequence_fails() {
        let mut codec = VariableLengthSize::default();
        for _ in 0..8 {
            codec.add_byte(0xFF);
        }
        assert!(codec.fail());
        assert!(!codec.is_complete());
    }

    #[test]
    fn reset_restores_pristine_state() {
        let mut codec = VariableLengthSize::default();
        codec.add_bytes(&[0x81, 0x80, 0x00]);
        assert!(codec.is_complete());
        codec.reset();
        assert!(!codec.is_complete());
        assert_eq!(codec.bytes_count(), 0);
        codec.add_byte(0x05);
        assert_eq!(codec.value(), 5);
    }
}
