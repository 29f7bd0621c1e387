use std::{cell::Cell, ptr::NonNull};

use rustix::io::Errno;
use tagheap::{Heap, HeapError, Mmap, Region, RegionError, RegionProvider};
use test_env_log::test;

/// Provider that never has memory to give.
struct Exhausted;

impl RegionProvider for Exhausted {
    fn page_size(&self) -> usize {
        4096
    }

    fn acquire(&self, _len: usize) -> Result<Region, RegionError> {
        Err(RegionError::Os(Errno::NOMEM))
    }

    unsafe fn release(&self, _region: Region) {
        unreachable!("nothing was acquired");
    }
}

/// Mmap wrapper that records how many regions are outstanding.
#[derive(Default)]
struct Counting<'a> {
    live: Option<&'a Cell<usize>>,
    mmap: Mmap,
}

impl RegionProvider for Counting<'_> {
    fn page_size(&self) -> usize {
        self.mmap.page_size()
    }

    fn acquire(&self, len: usize) -> Result<Region, RegionError> {
        let region = self.mmap.acquire(len)?;
        if let Some(live) = self.live {
            live.set(live.get() + 1);
        }
        Ok(region)
    }

    unsafe fn release(&self, region: Region) {
        if let Some(live) = self.live {
            live.set(live.get() - 1);
        }
        unsafe { self.mmap.release(region) }
    }
}

/// Provider that hands back only half of each mapping it makes.
#[derive(Default)]
struct Short {
    released: Cell<usize>,
    mmap: Mmap,
}

impl RegionProvider for Short {
    fn page_size(&self) -> usize {
        self.mmap.page_size()
    }

    fn acquire(&self, len: usize) -> Result<Region, RegionError> {
        let full = self.mmap.acquire(len)?;
        Ok(unsafe { Region::new(full.ptr(), full.len() / 2) })
    }

    unsafe fn release(&self, region: Region) {
        self.released.set(self.released.get() + 1);
        unsafe { self.mmap.release(Region::new(region.ptr(), region.len() * 2)) }
    }
}

#[test]
fn short_region_is_refused_and_released() {
    let provider = Short::default();
    let page = provider.page_size();

    assert_eq!(
        Heap::with_provider(100, &provider).unwrap_err(),
        HeapError::Provider(RegionError::Short {
            expected: page,
            found: page / 2
        })
    );
    assert_eq!(provider.released.get(), 1);
}

#[test]
fn usage_matches_dump_totals() {
    let mut heap = Heap::new(4096).unwrap();
    let a = heap.alloc(100).unwrap();
    heap.alloc(30).unwrap();
    heap.free(a.as_ptr()).unwrap();

    let usage = heap.usage();
    let text = heap.dump().to_string();

    assert_eq!(usage.used, 40);
    assert!(text.contains(&format!("Total used size = {:4}\n", usage.used)));
    assert!(text.contains(&format!("Total free size = {:4}\n", usage.free)));
}

#[test]
fn provider_failure_is_reported() {
    assert_eq!(
        Heap::with_provider(100, Exhausted).unwrap_err(),
        HeapError::Provider(RegionError::Os(Errno::NOMEM))
    );
}

#[test]
fn region_is_released_on_drop() {
    let live = Cell::new(0);
    {
        let provider = Counting {
            live: Some(&live),
            ..Counting::default()
        };
        let mut heap = Heap::with_provider(4096, provider).unwrap();
        heap.alloc(8).unwrap();
        assert_eq!(live.get(), 1);
    }
    assert_eq!(live.get(), 0);
}

#[test]
fn dump_lists_blocks_and_totals() {
    let mut heap = Heap::new(4096).unwrap();
    let usable = heap.usable_size();
    let start = heap.start().as_ptr() as usize;
    heap.alloc(20).unwrap();

    let text = heap.dump().to_string();
    let lines: Vec<&str> = text.lines().collect();

    assert!(lines[0].contains("Block List"));
    assert_eq!(lines[1], "No.\tStatus\tPrev\tt_Begin\t\tt_End\t\tt_Size");
    assert_eq!(
        lines[3],
        format!("1\talloc\talloc\t0x{:08x}\t0x{:08x}\t  24", start, start + 23)
    );
    assert_eq!(
        lines[4],
        format!(
            "2\tFREE \talloc\t0x{:08x}\t0x{:08x}\t{:4}",
            start + 24,
            start + usable - 1,
            usable - 24
        )
    );
    assert!(text.contains("Total used size =   24\n"));
    assert!(text.contains(&format!("Total free size = {:4}\n", usable - 24)));
    assert!(text.contains(&format!("Total size      = {:4}\n", usable)));
}

#[test]
fn blocks_report_absolute_addresses() {
    let mut heap = Heap::new(4096).unwrap();
    let a = heap.alloc(60).unwrap();
    let blocks: Vec<_> = heap.blocks().collect();

    assert_eq!(blocks[0].index, 1);
    assert_eq!(blocks[0].start + 4, a.as_ptr() as usize);
    assert_eq!(blocks[0].end, blocks[0].start + 63);
    assert_eq!(blocks[1].index, 2);
    assert_eq!(blocks[1].start, blocks[0].end + 1);
}

/// Small xorshift generator so the workload is the same on every run.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: u64) -> usize {
        (self.next() % n) as usize
    }
}

fn fill(ptr: NonNull<u8>, len: usize, tag: u8) {
    unsafe { ptr.as_ptr().write_bytes(tag, len) };
}

fn holds(ptr: NonNull<u8>, len: usize, tag: u8) -> bool {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
        .iter()
        .all(|&b| b == tag)
}

#[test]
fn random_workload_keeps_invariants_and_payloads() {
    let mut heap = Heap::new(16 * 1024).unwrap();
    let usable = heap.usable_size();
    let mut rng = Rng(0x2545_f491_4f6c_dd1d);
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for step in 0..4000 {
        if live.is_empty() || rng.below(3) != 0 {
            let len = 1 + rng.below(300);
            match heap.alloc(len) {
                Ok(ptr) => {
                    assert_eq!(ptr.as_ptr() as usize % 8, 0);
                    let tag = step as u8;
                    fill(ptr, len, tag);
                    live.push((ptr, len, tag));
                }
                Err(HeapError::OutOfMemory(_)) => {}
                Err(err) => panic!("unexpected {err}"),
            }
        } else {
            let (ptr, len, tag) = live.swap_remove(rng.below(live.len() as u64));
            assert!(holds(ptr, len, tag), "payload clobbered");
            heap.free(ptr.as_ptr()).unwrap();
            assert!(heap.free(ptr.as_ptr()).is_err());
        }
        if step % 17 == 0 {
            heap.coalesce();
        }
        heap.check().unwrap();
        assert_eq!(heap.usage().total(), usable);
    }

    for (ptr, len, tag) in live.drain(..) {
        assert!(holds(ptr, len, tag), "payload clobbered");
        heap.free(ptr.as_ptr()).unwrap();
    }
    heap.coalesce();
    let blocks: Vec<_> = heap.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].size, usable);
    assert!(!blocks[0].allocated);
}
