//! Receiver-mask partitioning of the rank space.
//!
//! A radix `r` splits the world into receivers and sender-only ranks:
//! rank `k` receives iff `k & mask == k` where `mask = !0 << r`, so the
//! receivers are `{0, 2^r, 2*2^r, ...}` and every placement result is
//! folded onto the nearest receiver by ANDing with the mask. Large jobs
//! use this to reserve a fraction of ranks for I/O aggregation.

/// Highest supported receiver radix.
pub const MAX_RADIX: u32 = 8;

/// Receiver mask derived from a radix in `[0, 8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverMask {
    radix: u32,
    mask: u32,
}

impl ReceiverMask {
    /// Build the mask for a radix. Radixes above [`MAX_RADIX`] clamp.
    pub fn from_radix(radix: u32) -> Self {
        let radix = radix.min(MAX_RADIX);
        let mask = if radix == 0 { !0u32 } else { !0u32 << radix };
        Self { radix, mask }
    }

    /// The raw bitmask.
    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Number of senders that collapse onto one receiver: `2^radix`.
    #[inline]
    pub fn receiver_rate(&self) -> u32 {
        1 << self.radix
    }

    /// Fold a placement result onto its receiver rank.
    #[inline]
    pub fn fold(&self, rank: u32) -> u32 {
        rank & self.mask
    }

    /// True iff every rank is a receiver (`radix == 0`).
    #[inline]
    pub fn everyone(&self) -> bool {
        self.receiver_rate() == 1
    }

    /// True iff `rank` is a receiver.
    #[inline]
    pub fn is_receiver(&self, rank: u32) -> bool {
        rank & self.mask == rank
    }

    /// Dense index of a receiver within the receiver set.
    #[inline]
    pub fn receiver_rank(&self, rank: u32) -> u32 {
        rank >> self.radix
    }
}
