//! Process-wide heap.
//!
//! A single [`Heap`] that is set up once by [`init`] and then shared by the
//! free functions in this module. Calls are serialized by one lock around
//! the whole heap.

use core::{fmt, ptr::NonNull};

use log::warn;
use spin::Mutex;

use crate::heap::{Heap, HeapError};

static HEAP: Mutex<Option<Heap>> = Mutex::new(None);

/// Maps a region of `size` bytes for the process-wide heap.
///
/// Fails with [`HeapError::AlreadyInitialized`] once a previous call has
/// succeeded. A failed call leaves the heap unset, so it may be retried.
pub fn init(size: usize) -> Result<(), HeapError> {
    let mut heap = HEAP.lock();
    if heap.is_some() {
        warn!("heap already initialized");
        return Err(HeapError::AlreadyInitialized);
    }
    *heap = Some(Heap::new(size)?);
    Ok(())
}

pub fn alloc(size: usize) -> Result<NonNull<u8>, HeapError> {
    HEAP.lock()
        .as_mut()
        .ok_or(HeapError::NotInitialized)?
        .alloc(size)
}

pub fn free(ptr: *mut u8) -> Result<(), HeapError> {
    HEAP.lock()
        .as_mut()
        .ok_or(HeapError::NotInitialized)?
        .free(ptr)
}

pub fn coalesce() {
    if let Some(heap) = HEAP.lock().as_mut() {
        heap.coalesce();
    }
}

/// Writes the block table of the process-wide heap to `out`. Writes nothing
/// before [`init`].
pub fn dump_blocks<W: fmt::Write + ?Sized>(out: &mut W) -> fmt::Result {
    match HEAP.lock().as_ref() {
        Some(heap) => write!(out, "{}", heap.dump()),
        None => Ok(()),
    }
}
