//! Rolling weak checksum for block matching.
//!
//! The weak hash is the β checksum of the delta-transfer algorithm: two
//! 16-bit running sums combined into a `u32`, with O(1) sliding-window
//! updates. It is a cheap first-stage filter; candidate matches are
//! confirmed with [`StrongHash`](crate::StrongHash).

/// Rolling modulus. Power of two, so wrapping 32-bit arithmetic stays
/// congruent through subtraction.
const M: u32 = 1 << 16;

/// Rolling checksum state for incremental computation.
///
/// The checksum consists of two components, each reduced mod `1<<16`:
/// - `a`: sum of all bytes in the window
/// - `b`: weighted sum where byte `i` of an `n`-byte window counts
///   `n - i` times
///
/// The combined digest is `a + (b << 16)`.
///
/// # Example
///
/// ```rust
/// use booster::RollingChecksum;
///
/// let mut sum = RollingChecksum::from_block(b"abcd");
/// sum.roll(b'a', b'e', 4); // now represents "bcde"
/// assert_eq!(sum.digest(), RollingChecksum::from_block(b"bcde").digest());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollingChecksum {
    /// Sum of all bytes in the window.
    a: u32,
    /// Weighted sum.
    b: u32,
}

impl RollingChecksum {
    /// Compute the checksum of a window from scratch.
    #[must_use]
    pub fn from_block(data: &[u8]) -> Self {
        let mut a: u32 = 0;
        let mut b: u32 = 0;
        let len = data.len() as u32;

        for (i, &byte) in data.iter().enumerate() {
            a = a.wrapping_add(u32::from(byte));
            b = b.wrapping_add((len - i as u32).wrapping_mul(u32::from(byte)));
        }

        Self { a: a % M, b: b % M }
    }

    /// Slide the window by one byte: `departing` leaves the front,
    /// `arriving` enters the back. `window_len` is the current window
    /// size (the departing byte's weight).
    #[inline]
    pub fn roll(&mut self, departing: u8, arriving: u8, window_len: usize) {
        let pop = u32::from(departing);
        let push = u32::from(arriving);

        self.a = self.a.wrapping_sub(pop).wrapping_add(push) % M;
        self.b = self
            .b
            .wrapping_sub((window_len as u32).wrapping_mul(pop))
            .wrapping_add(self.a)
            % M;
    }

    /// Combined 32-bit digest: low half `a`, high half `b`.
    #[inline]
    #[must_use]
    pub const fn digest(&self) -> u32 {
        self.a + M * self.b
    }

    /// The `a` component (plain byte sum).
    #[inline]
    #[must_use]
    pub const fn sum_a(&self) -> u32 {
        self.a
    }

    /// The `b` component (weighted sum).
    #[inline]
    #[must_use]
    pub const fn sum_b(&self) -> u32 {
        self.b
    }
}
