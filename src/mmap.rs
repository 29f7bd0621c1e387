use core::ptr::{self, NonNull};

use rustix::{
    io::Errno,
    mm::{MapFlags, ProtFlags, mmap_anonymous},
};
use thiserror::Error;

use crate::core::{Region, RegionProvider};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RegionError {
    #[error("mmap failed with {0}")]
    Os(#[from] Errno),
    #[error("overflow")]
    Overflow,
    #[error("provider returned {found} bytes, {expected} requested")]
    Short { expected: usize, found: usize },
}

/// Region provider backed by private anonymous mappings.
#[derive(Debug, Clone, Copy)]
pub struct Mmap {
    pagesize: usize,
}

impl Default for Mmap {
    fn default() -> Self {
        Self::new()
    }
}

fn map(len: usize) -> Result<NonNull<u8>, Errno> {
    let nil = ptr::null_mut();
    let rw = ProtFlags::READ | ProtFlags::WRITE;
    // SAFETY: with a null hint the kernel picks a fresh page-aligned address,
    // so no existing mapping is replaced. See mmap(2).
    let ptr = unsafe { mmap_anonymous(nil, len, rw, MapFlags::PRIVATE) }?;
    // A successful mapping at a kernel-chosen address is never null.
    NonNull::new(ptr.cast()).ok_or(Errno::NOMEM)
}

/// Rounds `len` up to the next multiple of `align`, which must be a power
/// of two.
pub(crate) const fn round_up(len: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let align_minus_one = align - 1;
    match len.checked_add(align_minus_one) {
        Some(n) => Some(n & !align_minus_one),
        None => None,
    }
}

impl Mmap {
    pub fn new() -> Self {
        Self {
            pagesize: rustix::param::page_size(),
        }
    }

    // SAFETY: `ptr` must be aligned to `self.pagesize`.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        assert!(ptr.as_ptr() as usize % self.pagesize == 0);
        assert!(len % self.pagesize == 0);
        unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), len) }
    }
}

impl RegionProvider for Mmap {
    fn page_size(&self) -> usize {
        self.pagesize
    }

    fn acquire(&self, len: usize) -> Result<Region, RegionError> {
        let len = round_up(len, self.pagesize).ok_or(RegionError::Overflow)?;
        if len > isize::MAX as usize {
            return Err(RegionError::Overflow);
        }
        let ptr = map(len)?;
        log::trace!("mapped {len} bytes at {ptr:p}");
        // SAFETY: the mapping is fresh, readable, writable and `len` bytes
        // long. Nothing else refers to it.
        Ok(unsafe { Region::new(ptr, len) })
    }

    unsafe fn release(&self, region: Region) {
        // SAFETY: regions handed out by `acquire` are page aligned and a page
        // multiple long.
        if let Err(err) = unsafe { self.unmap(region.ptr(), region.len()) } {
            log::warn!("munmap of {:p} failed with {err}", region.ptr());
        }
    }
}
