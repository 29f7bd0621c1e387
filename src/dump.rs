use core::fmt;

use crate::heap::Walk;

/// One block as seen by [`Heap::blocks`](crate::Heap::blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Position in the block list, starting at 1.
    pub index: usize,
    pub allocated: bool,
    pub prev_allocated: bool,
    /// Address of the header.
    pub start: usize,
    /// Address of the last byte of the block.
    pub end: usize,
    pub size: usize,
}

#[derive(Clone)]
pub struct Blocks<'a> {
    walk: Walk<'a>,
    index: usize,
}

impl<'a> Blocks<'a> {
    pub(crate) fn new(walk: Walk<'a>) -> Self {
        Self { walk, index: 0 }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let (at, header) = self.walk.next()?;
        self.index += 1;
        let start = self.walk.region().addr() + at;
        Some(BlockInfo {
            index: self.index,
            allocated: header.allocated,
            prev_allocated: header.prev_allocated,
            start,
            end: start + header.size - 1,
            size: header.size,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub used: usize,
    pub free: usize,
}

impl Usage {
    pub fn total(&self) -> usize {
        self.used + self.free
    }

    /// Counts `block` towards the used or free total.
    pub fn add(&mut self, block: &BlockInfo) {
        if block.allocated {
            self.used += block.size;
        } else {
            self.free += block.size;
        }
    }
}

impl FromIterator<BlockInfo> for Usage {
    fn from_iter<I: IntoIterator<Item = BlockInfo>>(blocks: I) -> Self {
        let mut usage = Usage::default();
        for block in blocks {
            usage.add(&block);
        }
        usage
    }
}

/// Table of every block followed by used/free totals. Created by
/// [`Heap::dump`](crate::Heap::dump).
pub struct Dump<'a> {
    blocks: Blocks<'a>,
}

impl<'a> Dump<'a> {
    pub(crate) fn new(blocks: Blocks<'a>) -> Self {
        Self { blocks }
    }
}

const STARS: &str =
    "*********************************************************************************";
const DASHES: &str =
    "---------------------------------------------------------------------------------";

fn status(allocated: bool) -> &'static str {
    if allocated { "alloc" } else { "FREE " }
}

impl fmt::Display for Dump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "*********************************** Block List **********************************"
        )?;
        writeln!(f, "No.\tStatus\tPrev\tt_Begin\t\tt_End\t\tt_Size")?;
        writeln!(f, "{DASHES}")?;

        let mut usage = Usage::default();
        for block in self.blocks.clone() {
            usage.add(&block);
            writeln!(
                f,
                "{}\t{}\t{}\t0x{:08x}\t0x{:08x}\t{:4}",
                block.index,
                status(block.allocated),
                status(block.prev_allocated),
                block.start,
                block.end,
                block.size,
            )?;
        }

        writeln!(f, "{DASHES}")?;
        writeln!(f, "{STARS}")?;
        writeln!(f, "Total used size = {:4}", usage.used)?;
        writeln!(f, "Total free size = {:4}", usage.free)?;
        writeln!(f, "Total size      = {:4}", usage.total())?;
        writeln!(f, "{STARS}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    fn block(allocated: bool, size: usize) -> BlockInfo {
        BlockInfo {
            index: 1,
            allocated,
            prev_allocated: true,
            start: 0x1004,
            end: 0x1004 + size - 1,
            size,
        }
    }

    #[test]
    fn usage_sums_by_status() {
        let usage: Usage = [block(true, 24), block(false, 40), block(true, 8)]
            .into_iter()
            .collect();

        assert_eq!(usage, Usage { used: 32, free: 40 });
        assert_eq!(usage.total(), 72);
        assert_eq!(core::iter::empty().collect::<Usage>(), Usage::default());
    }
}
