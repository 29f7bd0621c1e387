//! Boundary-tag encoding.
//!
//! Every block starts with a header word packing the block size together
//! with two status bits:
//!
//! ```text
//!    31                                   3   2   1   0
//!   ┌──────────────────────────────────────┬───┬───┬───┐
//!   │            size (multiple of 8)      │ 0 │ p │ a │
//!   └──────────────────────────────────────┴───┴───┴───┘
//!     a: this block is allocated
//!     p: the block before this one is allocated
//! ```
//!
//! Free blocks repeat the bare size in a footer word at their tail. The
//! block list is terminated by an end marker whose word is exactly `1`.

/// Size in bytes of a header or footer word.
pub const WORD: usize = 4;

/// Block sizes and payload addresses are multiples of this.
pub const ALIGN: usize = 8;

/// Smallest block that can exist on its own: a header and a footer.
pub const MIN_BLOCK: usize = 2 * WORD;

pub(crate) const END_MARK: u32 = 1;

const ALLOC_BIT: u32 = 0b01;
const PREV_ALLOC_BIT: u32 = 0b10;
const FLAGS: u32 = (ALIGN - 1) as u32;

/// Decoded form of a header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub size: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
}

impl Header {
    pub const fn free(size: usize, prev_allocated: bool) -> Self {
        Self {
            size,
            allocated: false,
            prev_allocated,
        }
    }

    pub const fn allocated(size: usize, prev_allocated: bool) -> Self {
        Self {
            size,
            allocated: true,
            prev_allocated,
        }
    }

    pub const fn decode(word: u32) -> Self {
        Self {
            size: (word & !FLAGS) as usize,
            allocated: word & ALLOC_BIT != 0,
            prev_allocated: word & PREV_ALLOC_BIT != 0,
        }
    }

    pub fn encode(self) -> u32 {
        debug_assert!(self.size % ALIGN == 0, "unaligned block size {}", self.size);
        debug_assert!(self.size <= u32::MAX as usize);
        let mut word = self.size as u32;
        if self.allocated {
            word |= ALLOC_BIT;
        }
        if self.prev_allocated {
            word |= PREV_ALLOC_BIT;
        }
        word
    }

    /// The end marker decodes to an allocated block of size zero.
    #[inline]
    pub const fn is_end(&self) -> bool {
        self.size == 0
    }
}

/// Footer word of a free block: the bare size.
#[inline]
pub(crate) fn footer(size: usize) -> u32 {
    debug_assert!(size % ALIGN == 0 && size <= u32::MAX as usize);
    size as u32
}

/// Total block footprint for a payload of `payload` bytes: the payload plus
/// its header, padded to [`ALIGN`]. `None` on overflow.
pub(crate) fn block_size_for(payload: usize) -> Option<usize> {
    crate::mmap::round_up(payload.checked_add(WORD)?, ALIGN)
}
