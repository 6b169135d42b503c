//! Integer logarithms and byte-backed bitmaps.

use core::alloc::{Layout, LayoutError};

/// The value returned by [`log2`] when its argument is zero.
pub const LOG2_UNDEFINED: u32 = u32::MAX;

#[cfg(target_pointer_width = "64")]
const LOG2_TABLE: [u8; 64] = [
    63, 0, 58, 1, 59, 47, 53, 2, //
    60, 39, 48, 27, 54, 33, 42, 3, //
    61, 51, 37, 40, 49, 18, 28, 20, //
    55, 30, 34, 11, 43, 14, 22, 4, //
    62, 57, 46, 52, 38, 26, 32, 41, //
    50, 36, 17, 19, 29, 10, 13, 21, //
    56, 45, 25, 31, 35, 16, 9, 12, //
    44, 24, 15, 8, 23, 7, 6, 5,
];

#[cfg(not(target_pointer_width = "64"))]
const LOG2_TABLE: [u8; 32] = [
    0, 9, 1, 10, 13, 21, 2, 29, //
    11, 14, 16, 18, 22, 25, 3, 30, //
    8, 12, 20, 28, 15, 17, 24, 7, //
    19, 27, 23, 6, 26, 5, 4, 31,
];

/// Returns the base-2 logarithm of `n`, rounded down.
///
/// The computation is branch-free for nonzero `n`: every bit below the
/// highest set bit is set, the result is reduced to a single power of two,
/// and a de Bruijn multiplication selects its index from a lookup table.
///
/// Returns [`LOG2_UNDEFINED`] if `n` is zero.
#[cfg(target_pointer_width = "64")]
#[inline]
pub const fn log2(n: usize) -> u32 {
    if n == 0 {
        return LOG2_UNDEFINED;
    }

    let mut n = n as u64;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    n |= n >> 32;

    let top = n - (n >> 1);
    LOG2_TABLE[(top.wrapping_mul(0x07ED_D5E5_9A4E_28C2) >> 58) as usize] as u32
}

/// Returns the base-2 logarithm of `n`, rounded down.
///
/// The computation is branch-free for nonzero `n`: every bit below the
/// highest set bit is set and a de Bruijn multiplication selects the index
/// of the highest bit from a lookup table.
///
/// Returns [`LOG2_UNDEFINED`] if `n` is zero.
#[cfg(not(target_pointer_width = "64"))]
#[inline]
pub const fn log2(n: usize) -> u32 {
    if n == 0 {
        return LOG2_UNDEFINED;
    }

    let mut n = n as u32;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;

    LOG2_TABLE[(n.wrapping_mul(0x07C4_ACDD) >> 27) as usize] as u32
}

/// Returns `2^n`.
#[inline]
pub const fn pow2(n: u32) -> usize {
    1 << n
}

/// Rounds `x` up to the next power of two, or returns `None` on overflow or
/// if `x` is zero.
#[inline]
pub(crate) fn round_up_pow2(x: usize) -> Option<usize> {
    match x {
        0 => None,
        1 => Some(1),
        x => pow2(log2(x - 1)).checked_mul(2),
    }
}

/// A bitmap backed by a caller-provided byte array.
///
/// Bits are addressed most-significant-first: bit 0 is the high bit of byte
/// 0. The same storage may also be addressed as an array of 2-bit codes,
/// where code `i` occupies bits `2i` (high) and `2i + 1` (low).
pub struct Bitmap {
    num_bits: usize,
    map: *mut u8,
}

impl Bitmap {
    /// Returns the number of bytes needed to store `num_bits` bits.
    #[inline]
    pub const fn num_bytes(num_bits: usize) -> usize {
        num_bits / 8 + (num_bits % 8 != 0) as usize
    }

    /// Returns the layout of a map of `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Result<Layout, LayoutError> {
        Layout::array::<u8>(Self::num_bytes(num_bits))
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// Every bit is initially clear.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::num_bytes(num_bits)` bytes.
    /// - No other `Bitmap` may be backed by any of those bytes while this one
    ///   is in use.
    pub unsafe fn new(num_bits: usize, map: *mut u8) -> Bitmap {
        assert!(!map.is_null());

        let mut bitmap = Bitmap { num_bits, map };
        bitmap.fill(false);
        bitmap
    }

    /// Returns the number of bits in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.num_bits
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / 8, 0x80 >> (bit % 8))
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        // SAFETY: `map` is valid for `num_bytes(num_bits)` bytes, as required
        // by `Bitmap::new`.
        unsafe { core::slice::from_raw_parts(self.map, Self::num_bytes(self.num_bits)) }
    }

    #[inline]
    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { core::slice::from_raw_parts_mut(self.map, Self::num_bytes(self.num_bits)) }
    }

    /// Sets or clears every bit in the map.
    pub fn fill(&mut self, value: bool) {
        let byte = if value { 0xFF } else { 0x00 };
        self.bytes_mut().fill(byte);
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);
        self.bytes()[byte_idx] & mask != 0
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);
        let byte = &mut self.bytes_mut()[byte_idx];
        *byte = match value {
            true => *byte | mask,
            false => *byte & !mask,
        };
    }

    /// Gets the indexed 2-bit code.
    #[inline]
    pub fn get_pair(&self, index: usize) -> u8 {
        let hi = self.get(2 * index) as u8;
        let lo = self.get(2 * index + 1) as u8;

        (hi << 1) | lo
    }

    /// Sets the indexed 2-bit code. Only the low two bits of `code` are used.
    #[inline]
    pub fn set_pair(&mut self, index: usize, code: u8) {
        self.set(2 * index, code & 0b10 != 0);
        self.set(2 * index + 1, code & 0b01 != 0);
    }
}
