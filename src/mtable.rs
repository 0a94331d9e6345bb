//! # Memory-Mapped Block Table
//!
//! `MemTable` owns the mapping of the backing file and translates a
//! [`LogicalBlockIdx`] into a DRAM address. The file is extended and mapped
//! in fixed-size regions; the region array is append-only, so a pointer
//! handed out once stays valid for the life of the `MemTable` even while
//! other threads trigger growth. This is what lets readers run lock-free
//! while writers allocate: nothing is ever remapped or moved.
//!
//! Address resolution is O(1): the region index and the offset within the
//! region are pure arithmetic on the block index; the only memory access is
//! one acquire load of the region base pointer.

use std::fs::File;
use std::sync::atomic::{AtomicPtr, Ordering};

use eyre::{ensure, Context, Result};
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::{
    BLOCK_SIZE, GROW_UNIT_BLOCKS, GROW_UNIT_BYTES, MAX_NUM_REGIONS, TOTAL_NUM_BITMAP_BITS,
};
use crate::idx::LogicalBlockIdx;
use crate::layout::MetaBlock;

pub struct MemTable {
    file: File,

    // base address per mapped region; null until the region is mapped
    regions: [AtomicPtr<u8>; MAX_NUM_REGIONS],

    // serializes growth and keeps the mappings alive
    grow: Mutex<Vec<MmapMut>>,
}

// SAFETY: the region pointers reference shared mappings that are never
// unmapped before drop; all mutation of mapped bytes goes through atomics or
// ranges synchronized by the commit protocol.
unsafe impl Send for MemTable {}
unsafe impl Sync for MemTable {}

impl MemTable {
    /// Takes ownership of a pre-opened backing file and maps what exists.
    /// A zero-length file is extended to one grow unit so the formatter has
    /// a meta block to write.
    pub fn open(file: File) -> Result<MemTable> {
        let len = file
            .metadata()
            .wrap_err("failed to stat backing file")?
            .len();

        let table = MemTable {
            file,
            regions: [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_NUM_REGIONS],
            grow: Mutex::new(Vec::new()),
        };

        let want = if len == 0 {
            1
        } else {
            ensure!(
                len % GROW_UNIT_BYTES as u64 == 0,
                "backing file size {} is not a multiple of the grow unit {}",
                len,
                GROW_UNIT_BYTES
            );
            (len / GROW_UNIT_BYTES as u64) as usize
        };
        table.grow_to(want)?;
        Ok(table)
    }

    /// DRAM address of a logical block. Maps the containing region on first
    /// touch. Panics if the index is beyond the image capacity: an index
    /// read from the log that points past the addressable image means the
    /// image is corrupt, and we must not fabricate a mapping for it.
    pub fn block(&self, idx: LogicalBlockIdx) -> *mut u8 {
        let lblk = idx.0 as usize;
        assert!(
            lblk < TOTAL_NUM_BITMAP_BITS,
            "corrupt image: block index {} beyond capacity {}",
            lblk,
            TOTAL_NUM_BITMAP_BITS
        );
        let region = lblk / GROW_UNIT_BLOCKS;
        let mut base = self.regions[region].load(Ordering::Acquire);
        if base.is_null() {
            self.grow_to(region + 1)
                .expect("fatal: failed to extend backing file");
            base = self.regions[region].load(Ordering::Acquire);
        }
        // SAFETY: base maps GROW_UNIT_BYTES and the offset is within it.
        unsafe { base.add((lblk % GROW_UNIT_BLOCKS) * BLOCK_SIZE) }
    }

    /// The meta block is logical block 0 and is always mapped.
    pub fn meta(&self) -> &MetaBlock {
        // SAFETY: region 0 is mapped in open(); the meta block is only
        // accessed through atomics or format-time exclusive writes.
        unsafe { &*self.block(LogicalBlockIdx(0)).cast::<MetaBlock>() }
    }

    /// Extends the file and the mapping so at least `num_regions` regions
    /// are available.
    fn grow_to(&self, num_regions: usize) -> Result<()> {
        ensure!(
            num_regions <= MAX_NUM_REGIONS,
            "image would exceed addressable capacity ({} regions)",
            MAX_NUM_REGIONS
        );
        let mut maps = self.grow.lock();
        while maps.len() < num_regions {
            let region = maps.len();
            let new_len = (region as u64 + 1) * GROW_UNIT_BYTES as u64;
            if self.file.metadata()?.len() < new_len {
                self.file
                    .set_len(new_len)
                    .wrap_err_with(|| format!("failed to extend file to {} bytes", new_len))?;
            }

            // SAFETY: the file region [region * GROW_UNIT_BYTES, +GROW_UNIT_BYTES)
            // exists; the mapping is kept alive in `maps` until drop, and all
            // concurrent access is mediated by the commit protocol.
            let mut map = unsafe {
                memmap2::MmapOptions::new()
                    .offset(region as u64 * GROW_UNIT_BYTES as u64)
                    .len(GROW_UNIT_BYTES)
                    .map_mut(&self.file)
                    .wrap_err("failed to map image region")?
            };

            self.regions[region].store(map.as_mut_ptr(), Ordering::Release);
            maps.push(map);
        }
        Ok(())
    }

    /// The backing file handle.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Number of currently mapped regions. Test and dump aid.
    pub fn num_regions(&self) -> usize {
        self.grow.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_table() -> MemTable {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.keep().join("image");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap();
        MemTable::open(file).unwrap()
    }

    #[test]
    fn empty_file_gets_one_region() {
        let t = scratch_table();
        assert_eq!(t.num_regions(), 1);
        assert!(!t.block(LogicalBlockIdx(0)).is_null());
    }

    #[test]
    fn blocks_are_block_size_apart() {
        let t = scratch_table();
        let a = t.block(LogicalBlockIdx(1)) as usize;
        let b = t.block(LogicalBlockIdx(2)) as usize;
        assert_eq!(b - a, BLOCK_SIZE);
    }

    #[test]
    fn touching_a_far_block_grows_the_file() {
        let t = scratch_table();
        let far = LogicalBlockIdx(GROW_UNIT_BLOCKS as u32 * 2 + 5);
        let p = t.block(far);
        assert!(!p.is_null());
        assert_eq!(t.num_regions(), 3);
        // SAFETY: p maps a live block.
        unsafe { p.write(0xab) };
    }

    #[test]
    fn pointers_stay_valid_across_growth() {
        let t = scratch_table();
        let p0 = t.block(LogicalBlockIdx(3));
        // SAFETY: p0 maps a live block.
        unsafe { p0.write(0x7f) };
        let _ = t.block(LogicalBlockIdx(GROW_UNIT_BLOCKS as u32 + 1));
        // SAFETY: region 0 was never unmapped.
        assert_eq!(unsafe { p0.read() }, 0x7f);
    }

    #[test]
    #[should_panic(expected = "corrupt image")]
    fn out_of_capacity_index_panics() {
        let t = scratch_table();
        t.block(LogicalBlockIdx(TOTAL_NUM_BITMAP_BITS as u32));
    }
}
