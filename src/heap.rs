use core::{fmt, ptr::NonNull};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::{
    block::{ALIGN, END_MARK, Header, MIN_BLOCK, WORD, block_size_for, footer},
    core::{Region, RegionProvider},
    dump::{Blocks, Dump, Usage},
    mmap::{Mmap, RegionError, round_up},
};

/// Offset of the first block header inside the region. The word before it is
/// padding so that payloads land on 8-byte boundaries.
const FIRST: usize = WORD;

/// Largest block size a header word can describe.
const MAX_BLOCK: usize = u32::MAX as usize & !(ALIGN - 1);

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    #[error("requested region size is zero")]
    ZeroRegion,
    #[error("region of {0} bytes is too large for block headers")]
    RegionTooLarge(usize),
    #[error("region of {0} bytes cannot hold a block")]
    RegionTooSmall(usize),
    #[error("region provider failed: {0}")]
    Provider(#[from] RegionError),
    #[error("heap already initialized")]
    AlreadyInitialized,
    #[error("heap not initialized")]
    NotInitialized,
    #[error("requested payload size is zero")]
    ZeroSize,
    #[error("request of {0} bytes exceeds the heap")]
    TooLarge(usize),
    #[error("no free block can hold {0} bytes")]
    OutOfMemory(usize),
    #[error("null pointer")]
    Null,
    #[error("address {0:#x} is not 8-byte aligned")]
    Misaligned(usize),
    #[error("address {0:#x} is outside the heap")]
    OutOfBounds(usize),
    #[error("address {0:#x} is not the payload of a block")]
    NotABlock(usize),
    #[error("block at {0:#x} is already free")]
    DoubleFree(usize),
}

/// Broken invariant found by [`Heap::check`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    #[error("block at offset {at} has size zero")]
    ZeroSize { at: usize },
    #[error("block at offset {at} of size {size} runs past the end of the heap")]
    Overrun { at: usize, size: usize },
    #[error("block at offset {at}: footer {footer} does not match header size {size}")]
    Footer { at: usize, size: usize, footer: usize },
    #[error("block at offset {at}: previous-allocated bit is {found}, expected {expected}")]
    PrevBit {
        at: usize,
        found: bool,
        expected: bool,
    },
    #[error("end marker missing, found word {0:#x}")]
    EndMark(u32),
    #[error("blocks cover {total} bytes but the heap has {usable}")]
    Conservation { total: usize, usable: usize },
}

/// Forward walk over the block list, yielding each block's offset and
/// decoded header. Stops at the end marker.
#[derive(Clone)]
pub(crate) struct Walk<'a> {
    region: &'a Region,
    at: usize,
    end: usize,
}

impl<'a> Walk<'a> {
    pub(crate) fn region(&self) -> &'a Region {
        self.region
    }
}

impl Iterator for Walk<'_> {
    type Item = (usize, Header);

    fn next(&mut self) -> Option<Self::Item> {
        if self.at >= self.end {
            return None;
        }
        let at = self.at;
        let header = Header::decode(self.region.read_word(at));
        if header.is_end() {
            self.at = self.end;
            return None;
        }
        self.at = at + header.size;
        Some((at, header))
    }
}

/// A best-fit heap over one fixed region, with boundary tags and delayed
/// coalescing.
///
/// The region is acquired once in [`Heap::new`] and released when the heap
/// is dropped. Freed blocks are not merged with their neighbours until
/// [`Heap::coalesce`] is called.
pub struct Heap<P: RegionProvider = Mmap> {
    region: Region,
    usable: usize,
    provider: P,
}

// SAFETY: the heap exclusively owns its region; nothing in it is tied to the
// thread that created it.
unsafe impl<P: RegionProvider + Send> Send for Heap<P> {}

impl Heap<Mmap> {
    /// Maps a region of `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, HeapError> {
        Self::with_provider(size, Mmap::new())
    }
}

impl<P: RegionProvider> Heap<P> {
    pub fn with_provider(size: usize, provider: P) -> Result<Self, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroRegion);
        }
        let padded =
            round_up(size, provider.page_size()).ok_or(HeapError::RegionTooLarge(size))?;
        // One word of alignment padding in front, one for the end marker.
        match padded.checked_sub(ALIGN) {
            Some(usable) if usable > MAX_BLOCK => return Err(HeapError::RegionTooLarge(size)),
            Some(usable) if usable >= MIN_BLOCK => {}
            _ => return Err(HeapError::RegionTooSmall(padded)),
        }

        let region = provider.acquire(padded)?;
        if region.len() < padded {
            let found = region.len();
            // SAFETY: the region was just acquired from `provider` and no
            // pointer into it has been handed out.
            unsafe { provider.release(region) };
            return Err(RegionError::Short {
                expected: padded,
                found,
            }
            .into());
        }
        let usable = padded - ALIGN;
        let mut heap = Self {
            region,
            usable,
            provider,
        };
        heap.set_header(FIRST, Header::free(usable, true));
        heap.set_footer(FIRST, usable);
        heap.region.write_word(heap.end(), END_MARK);
        debug!(
            "heap initialized at {:p} with {usable} usable bytes",
            heap.start()
        );
        Ok(heap)
    }

    /// Address of the first block header.
    pub fn start(&self) -> NonNull<u8> {
        self.region.ptr_at(FIRST)
    }

    /// Bytes covered by blocks. Fixed for the lifetime of the heap.
    pub fn usable_size(&self) -> usize {
        self.usable
    }

    #[inline]
    fn end(&self) -> usize {
        FIRST + self.usable
    }

    fn header(&self, at: usize) -> Header {
        Header::decode(self.region.read_word(at))
    }

    fn set_header(&mut self, at: usize, header: Header) {
        self.region.write_word(at, header.encode());
    }

    fn read_footer(&self, at: usize, size: usize) -> usize {
        self.region.read_word(at + size - WORD) as usize
    }

    fn set_footer(&mut self, at: usize, size: usize) {
        self.region.write_word(at + size - WORD, footer(size));
    }

    /// Updates the previous-allocated bit of the block at `at`, unless it is
    /// the end marker.
    fn set_prev_allocated(&mut self, at: usize, prev_allocated: bool) {
        let header = self.header(at);
        if !header.is_end() {
            self.set_header(at, Header { prev_allocated, ..header });
        }
    }

    pub(crate) fn walk(&self) -> Walk<'_> {
        Walk {
            region: &self.region,
            at: FIRST,
            end: self.end(),
        }
    }

    /// Smallest free block of at least `needed` bytes, earliest first among
    /// equals.
    fn best_fit(&self, needed: usize) -> Option<(usize, Header)> {
        let mut best: Option<(usize, Header)> = None;
        for (at, header) in self.walk() {
            trace!("scan {at:#x}: {header:?}");
            if header.allocated || header.size < needed {
                continue;
            }
            if best.is_none_or(|(_, b)| header.size < b.size) {
                best = Some((at, header));
            }
            if header.size == needed {
                break;
            }
        }
        best
    }

    /// Allocates a block with room for `size` payload bytes and returns the
    /// payload address, which is 8-byte aligned.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let needed = block_size_for(size)
            .filter(|&needed| needed <= self.usable)
            .ok_or(HeapError::TooLarge(size))?;
        let (at, found) = self.best_fit(needed).ok_or(HeapError::OutOfMemory(size))?;

        let remainder = found.size - needed;
        if remainder >= MIN_BLOCK {
            self.set_header(at, Header::allocated(needed, found.prev_allocated));
            let rest = at + needed;
            self.set_header(rest, Header::free(remainder, true));
            self.set_footer(rest, remainder);
            debug!("alloc {size}: split block at {at:#x} into {needed} + {remainder}");
        } else {
            // Exact fit, or a tail too small to stand alone as a block.
            self.set_header(at, Header::allocated(found.size, found.prev_allocated));
            self.set_prev_allocated(at + found.size, true);
            debug!("alloc {size}: took block of {} at {at:#x}", found.size);
        }
        Ok(self.region.ptr_at(at + WORD))
    }

    /// Releases the block whose payload starts at `ptr`. Neighbouring free
    /// blocks are left alone until the next [`Heap::coalesce`].
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let at = self.block_of(ptr).inspect_err(|err| warn!("free rejected: {err}"))?;
        let header = self.header(at);
        self.set_header(at, Header::free(header.size, header.prev_allocated));
        self.set_prev_allocated(at + header.size, false);
        self.set_footer(at, header.size);
        debug!("free {ptr:p}: block of {} at {at:#x}", header.size);
        Ok(())
    }

    /// Validates a payload address and returns the offset of its allocated
    /// block.
    fn block_of(&self, ptr: *mut u8) -> Result<usize, HeapError> {
        if ptr.is_null() {
            return Err(HeapError::Null);
        }
        let addr = ptr as usize;
        if addr % ALIGN != 0 {
            return Err(HeapError::Misaligned(addr));
        }
        let at = addr
            .checked_sub(self.region.addr() + WORD)
            .filter(|&at| at >= FIRST && at < self.end())
            .ok_or(HeapError::OutOfBounds(addr))?;
        // Header-looking words can sit anywhere inside user data, so only a
        // block reached by walking the list counts.
        let header = self
            .walk()
            .take_while(|&(start, _)| start <= at)
            .find(|&(start, _)| start == at)
            .map(|(_, header)| header)
            .ok_or(HeapError::NotABlock(addr))?;
        if !header.allocated {
            return Err(HeapError::DoubleFree(addr));
        }
        Ok(at)
    }

    /// Merges every run of adjacent free blocks into a single free block.
    /// Calling it again without an intervening free is a no-op.
    pub fn coalesce(&mut self) {
        let end = self.end();
        let mut merged = 0;
        let mut at = FIRST;
        while at < end {
            let header = self.header(at);
            debug_assert_ne!(header.size, 0, "zero-sized block at {at:#x}");
            if header.size == 0 {
                break;
            }
            if header.allocated {
                at += header.size;
                continue;
            }
            let mut size = header.size;
            debug_assert_eq!(self.read_footer(at, size), size, "footer mismatch at {at:#x}");
            loop {
                // The end marker decodes as allocated and stops the run.
                let next_at = at + size;
                let next = self.header(next_at);
                if next.allocated || next.size == 0 {
                    break;
                }
                debug_assert_eq!(
                    self.read_footer(next_at, next.size),
                    next.size,
                    "footer mismatch at {next_at:#x}"
                );
                size += next.size;
                merged += 1;
            }
            if size != header.size {
                self.set_header(at, Header::free(size, header.prev_allocated));
                self.set_footer(at, size);
            }
            at += size;
        }
        if merged > 0 {
            debug!("coalesce: merged {merged} blocks");
        }
    }

    /// Per-block view of the heap, in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.walk())
    }

    /// Bytes held by allocated and by free blocks.
    pub fn usage(&self) -> Usage {
        self.blocks().collect()
    }

    /// Renders the block list as a table.
    pub fn dump(&self) -> Dump<'_> {
        Dump::new(self.blocks())
    }

    /// Walks the whole block list and verifies the boundary-tag invariants.
    /// Adjacent free blocks are not an error; they are expected between a
    /// `free` and the next `coalesce`.
    pub fn check(&self) -> Result<(), Corruption> {
        let end = self.end();
        let mut at = FIRST;
        let mut expected_prev = true;
        let mut total = 0;
        while at < end {
            let header = self.header(at);
            if header.size == 0 {
                return Err(Corruption::ZeroSize { at });
            }
            if at + header.size > end {
                return Err(Corruption::Overrun {
                    at,
                    size: header.size,
                });
            }
            if header.prev_allocated != expected_prev {
                return Err(Corruption::PrevBit {
                    at,
                    found: header.prev_allocated,
                    expected: expected_prev,
                });
            }
            if !header.allocated {
                let footer = self.read_footer(at, header.size);
                if footer != header.size {
                    return Err(Corruption::Footer {
                        at,
                        size: header.size,
                        footer,
                    });
                }
            }
            expected_prev = header.allocated;
            total += header.size;
            at += header.size;
        }
        let mark = self.region.read_word(end);
        if mark != END_MARK {
            return Err(Corruption::EndMark(mark));
        }
        if total != self.usable {
            return Err(Corruption::Conservation {
                total,
                usable: self.usable,
            });
        }
        Ok(())
    }
}

impl<P: RegionProvider> Drop for Heap<P> {
    fn drop(&mut self) {
        // SAFETY: `self.region` came from `self.provider` and is not used
        // again; the copy below is the only handle passed on.
        unsafe {
            let region = Region::new(self.region.ptr(), self.region.len());
            self.provider.release(region);
        }
    }
}

impl<P: RegionProvider> fmt::Debug for Heap<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("start", &self.start())
            .field("usable", &self.usable)
            .finish_non_exhaustive()
    }
}
