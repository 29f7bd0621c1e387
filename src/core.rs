use core::{ptr::NonNull, slice};

use crate::{block::WORD, mmap::RegionError};

/// A contiguous span of memory handed out by a [`RegionProvider`].
///
/// All block bookkeeping goes through [`Region::read_word`] and
/// [`Region::write_word`], which take byte offsets from the start of the
/// region and are bounds checked against its length.
#[derive(Debug)]
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

impl Region {
    /// # SAFETY
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the returned `Region` (or anything built from it) is alive, and no
    /// other live reference may cover that range.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `Region::new`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the contract of `Region::new`; `&mut self`
        // ensures this is the only slice over the region.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Reads the native-endian word at byte offset `offset`.
    ///
    /// Panics if the word does not lie inside the region.
    pub(crate) fn read_word(&self, offset: usize) -> u32 {
        let mut word = [0u8; WORD];
        word.copy_from_slice(&self.bytes()[offset..offset + WORD]);
        u32::from_ne_bytes(word)
    }

    pub(crate) fn write_word(&mut self, offset: usize, value: u32) {
        self.bytes_mut()[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
    }

    /// Pointer to byte `offset` of the region, carrying the region's
    /// provenance.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.len);
        // SAFETY: `offset` is inside the region, which is a single
        // allocation.
        unsafe { self.ptr.add(offset) }
    }
}

/// Source of the one backing region a heap manages.
pub trait RegionProvider {
    /// Granularity that requested lengths are rounded up to.
    fn page_size(&self) -> usize;

    /// Returns a zeroed, page-aligned region of at least `len` bytes. The
    /// returned region's length is `len` rounded up to a page multiple.
    fn acquire(&self, len: usize) -> Result<Region, RegionError>;

    /// # SAFETY
    ///
    /// `region` must have been returned by `acquire` on this provider and no
    /// pointer into it may be used afterwards.
    unsafe fn release(&self, region: Region);
}

impl<P: RegionProvider + ?Sized> RegionProvider for &P {
    fn page_size(&self) -> usize {
        (**self).page_size()
    }

    fn acquire(&self, len: usize) -> Result<Region, RegionError> {
        (**self).acquire(len)
    }

    unsafe fn release(&self, region: Region) {
        unsafe { (**self).release(region) }
    }
}
