//! `AddressSpace`: the map/unmap/split surface described in `spec.md`
//! §4.2-4.3, built on top of `PageTablePool`/`PageTable`.
//!
//! Grounded on the teacher's `page_table.rs` `map_memory`/walk-and-insert
//! loop, generalised from "always map a 4 KiB PTE" to arbitrary
//! `PageFormat`/`BlockSize` combinations and given the overlap-check,
//! rollback, and split/merge behaviour `spec.md` §4.2-4.3 calls for.

use std::sync::Arc;

use log::debug;

use crate::arch::{invalid, BlockSize, PageDescriptor, PageFormat, Stage};
use crate::barrier::TlbMaintenance;
use crate::pool::PageTablePool;
use crate::result::{CoreError, Result};
use crate::table::TableRef;

pub struct AddressSpace<F: PageFormat> {
    pool: Arc<PageTablePool<F>>,
    root: TableRef,
    stage: Stage,
    barrier: Arc<dyn TlbMaintenance>,
}

impl<F: PageFormat> AddressSpace<F> {
    pub fn new(pool: Arc<PageTablePool<F>>, stage: Stage, barrier: Arc<dyn TlbMaintenance>) -> Result<Self> {
        let root = pool.bootstrap(stage, 0, 0)?;
        Ok(AddressSpace {
            pool,
            root,
            stage,
            barrier,
        })
    }

    pub fn root(&self) -> TableRef {
        self.root
    }

    fn level_for_size(&self, size: BlockSize) -> Result<u8> {
        for level in 0..F::LEVEL_COUNT {
            if F::block_size_at_level(level, self.stage) == Some(size) {
                return Ok(level);
            }
        }
        Err(invalid(format!("no level of this format holds a {:?} leaf", size)))
    }

    /// `spec.md` §4.2 `map_page`: walk to the level that holds `desc`'s
    /// size, allocating and attaching intermediate tables as needed. If
    /// the walk runs the pool dry partway through, every table
    /// allocated during this call is freed before returning the error
    /// (`spec.md` §8's pool-exhaustion-rollback property).
    pub fn map_page(&self, desc: PageDescriptor) -> Result<()> {
        if !desc.is_aligned() {
            return Err(invalid("page descriptor is not aligned to its own size"));
        }
        if desc.stage != self.stage {
            return Err(invalid("descriptor stage does not match this address space"));
        }
        let target_level = self.level_for_size(desc.size)?;
        let mut allocated: Vec<TableRef> = Vec::new();
        let mut current = self.root;

        for level in 0..target_level {
            let word = self.pool.get(current).table().entry(F::index(desc.input_addr, level));
            if F::is_table(word, level) {
                let child_phys = F::table_target(word);
                current = self
                    .pool
                    .find_by_pa(child_phys)
                    .ok_or_else(|| invalid("dangling table descriptor during walk"))?;
                continue;
            }
            if F::is_valid(word) {
                self.rollback(&allocated);
                return Err(CoreError::Conflict {
                    ia: desc.input_addr,
                });
            }
            let child = match self.pool.alloc(self.stage, level + 1, desc.input_addr) {
                Ok(child) => child,
                Err(e) => {
                    self.rollback(&allocated);
                    return Err(e);
                }
            };
            if let Err(e) = self.pool.attach(current, desc.input_addr, child) {
                let _ = self.pool.free(child);
                self.rollback(&allocated);
                return Err(e);
            }
            allocated.push(child);
            current = child;
        }

        let idx = F::index(desc.input_addr, target_level);
        let leaf_word = self.pool.get(current).table().entry(idx);
        if F::is_valid(leaf_word) {
            self.rollback(&allocated);
            return Err(CoreError::Conflict {
                ia: desc.input_addr,
            });
        }
        let word = match F::encode_leaf(&desc, target_level) {
            Ok(word) => word,
            Err(e) => {
                self.rollback(&allocated);
                return Err(e);
            }
        };
        self.pool.get(current).table_mut().set_entry(idx, word, false, false);
        self.barrier.invalidate_va(self.stage, desc.input_addr);
        debug!("mapped ia={:#x} -> oa={:#x} size={:?}", desc.input_addr, desc.output_addr, desc.size);
        Ok(())
    }

    fn rollback(&self, allocated: &[TableRef]) {
        for table_ref in allocated.iter().rev() {
            let _ = self.pool.free(*table_ref);
        }
    }

    /// `spec.md` §4.2 `unmap_page`: clear the leaf entry at whatever
    /// level currently maps `ia`, issuing a TLB invalidate for the
    /// range actually unmapped.
    pub fn unmap_page(&self, ia: u64) -> Result<()> {
        let mut current = self.root;
        for level in 0..F::LEVEL_COUNT {
            let idx = F::index(ia, level);
            let word = self.pool.get(current).table().entry(idx);
            if F::is_table(word, level) {
                current = self
                    .pool
                    .find_by_pa(F::table_target(word))
                    .ok_or_else(|| invalid("dangling table descriptor during unmap walk"))?;
                continue;
            }
            if !F::is_valid(word) {
                return Err(CoreError::NotFound);
            }
            self.pool.get(current).table_mut().clear_entry(idx, false);
            self.barrier.invalidate_va(self.stage, ia);
            return Ok(());
        }
        Err(CoreError::NotFound)
    }

    /// Returns the descriptor currently mapping `ia`, if any.
    pub fn get_page(&self, ia: u64) -> Result<PageDescriptor> {
        let mut current = self.root;
        for level in 0..F::LEVEL_COUNT {
            let idx = F::index(ia, level);
            let word = self.pool.get(current).table().entry(idx);
            if F::is_table(word, level) {
                current = self
                    .pool
                    .find_by_pa(F::table_target(word))
                    .ok_or_else(|| invalid("dangling table descriptor during lookup"))?;
                continue;
            }
            if !F::is_valid(word) {
                return Err(CoreError::NotFound);
            }
            let mut desc = F::decode_leaf(word, level, self.stage, ia)?;
            desc.size = F::block_size_at_level(level, self.stage)
                .ok_or_else(|| invalid("leaf found at a level with no defined block size"))?;
            return Ok(desc);
        }
        Err(CoreError::NotFound)
    }

    /// `spec.md` §4.2 `best_page_size`: the largest block size the
    /// format offers such that both `ia` and `oa` are aligned to it and
    /// it doesn't overrun beyond `max_len` bytes.
    pub fn best_page_size(&self, ia: u64, oa: u64, max_len: u64) -> Result<BlockSize> {
        let mut best: Option<BlockSize> = None;
        for level in 0..F::LEVEL_COUNT {
            if let Some(size) = F::block_size_at_level(level, self.stage) {
                let bytes = size.bytes();
                if ia % bytes == 0 && oa % bytes == 0 && bytes <= max_len {
                    best = match best {
                        Some(b) if b.bytes() >= bytes => Some(b),
                        _ => Some(size),
                    };
                }
            }
        }
        best.ok_or_else(|| invalid("no page size is both aligned and within range"))
    }

    /// `spec.md` §4.2 `split_page`: replace a single large leaf with a
    /// newly-allocated child table fully populated with equivalent
    /// finer-grained leaves, so the mapped output address range is
    /// unchanged. Fails if the format has no finer level beneath the
    /// leaf's level.
    pub fn split_page(&self, ia: u64) -> Result<()> {
        let mut current = self.root;
        let mut level = 0u8;
        loop {
            let idx = F::index(ia, level);
            let word = self.pool.get(current).table().entry(idx);
            if F::is_table(word, level) {
                current = self
                    .pool
                    .find_by_pa(F::table_target(word))
                    .ok_or_else(|| invalid("dangling table descriptor during split walk"))?;
                level += 1;
                continue;
            }
            if !F::is_valid(word) {
                return Err(CoreError::NotFound);
            }
            let next_level = level + 1;
            if next_level >= F::LEVEL_COUNT {
                return Err(invalid("leaf is already at the finest level; nothing to split into"));
            }
            let mut desc = F::decode_leaf(word, level, self.stage, ia)?;
            desc.size = F::block_size_at_level(level, self.stage)
                .ok_or_else(|| invalid("leaf found at a level with no defined block size"))?;
            let child_size = F::block_size_at_level(next_level, self.stage)
                .ok_or_else(|| invalid("format has no block size at the next level"))?;
            let child = self.pool.alloc(self.stage, next_level, ia)?;
            let base_ia = ia - (ia % desc.size.bytes());
            let base_oa = desc.output_addr;
            let step = child_size.bytes();
            let count = desc.size.bytes() / step;
            for i in 0..count {
                let child_desc = PageDescriptor {
                    input_addr: base_ia + i * step,
                    output_addr: base_oa + i * step,
                    size: child_size,
                    stage: self.stage,
                    perms: desc.perms,
                    asid_or_vmid: desc.asid_or_vmid,
                };
                let child_idx = F::index(child_desc.input_addr, next_level);
                let child_word = F::encode_leaf(&child_desc, next_level)?;
                self.pool.get(child).table_mut().set_entry(child_idx, child_word, false, false);
            }
            self.pool.get(current).table_mut().clear_entry(idx, false);
            self.pool.attach(current, ia, child)?;
            self.barrier.invalidate_va(self.stage, base_ia);
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::generic64::Generic64;
    use crate::arch::Permissions;
    use crate::barrier::test_double::RecordingBarrier;

    fn new_space() -> AddressSpace<Generic64> {
        let pool = Arc::new(PageTablePool::<Generic64>::new(0x1000_0000, 4, 0x2000_0000, 64));
        let barrier = Arc::new(RecordingBarrier::default());
        AddressSpace::new(pool, Stage::Stage1, barrier).unwrap()
    }

    #[test]
    fn map_then_unmap_round_trip() {
        let space = new_space();
        let desc = PageDescriptor {
            input_addr: 0x4000,
            output_addr: 0x8_0000,
            size: BlockSize::Size4K,
            stage: Stage::Stage1,
            perms: Permissions::default(),
            asid_or_vmid: None,
        };
        space.map_page(desc).unwrap();
        let got = space.get_page(0x4000).unwrap();
        assert_eq!(got.output_addr, 0x8_0000);
        space.unmap_page(0x4000).unwrap();
        assert!(matches!(space.get_page(0x4000), Err(CoreError::NotFound)));
    }

    #[test]
    fn remapping_a_live_page_conflicts() {
        let space = new_space();
        let desc = PageDescriptor {
            input_addr: 0x4000,
            output_addr: 0x8_0000,
            size: BlockSize::Size4K,
            stage: Stage::Stage1,
            perms: Permissions::default(),
            asid_or_vmid: None,
        };
        space.map_page(desc).unwrap();
        let err = space.map_page(desc).unwrap_err();
        assert!(matches!(err, CoreError::Conflict { .. }));
    }

    #[test]
    fn pool_exhaustion_during_walk_rolls_back() {
        // Only the root table is pre-existing; the main sub-pool has
        // zero spare tables, so the very first intermediate allocation
        // during a 2 MiB-level walk must fail and roll back cleanly.
        let pool = Arc::new(PageTablePool::<Generic64>::new(0x1000_0000, 4, 0x2000_0000, 0));
        let barrier = Arc::new(RecordingBarrier::default());
        let space = AddressSpace::new(pool, Stage::Stage1, barrier).unwrap();
        let desc = PageDescriptor {
            input_addr: 0x4000,
            output_addr: 0x8_0000,
            size: BlockSize::Size4K,
            stage: Stage::Stage1,
            perms: Permissions::default(),
            asid_or_vmid: None,
        };
        assert!(matches!(space.map_page(desc), Err(CoreError::OutOfMemory)));
    }

    #[test]
    fn best_page_size_requires_both_ia_and_oa_aligned() {
        let space = new_space();
        // ia aligned to 2M but oa only aligned to 4K: must not return 2M.
        let got = space.best_page_size(0x0020_0000, 0x0080_1000, 0x0020_0000).unwrap();
        assert_eq!(got, BlockSize::Size4K);
    }

    #[test]
    fn best_page_size_picks_the_largest_block_both_addresses_share() {
        let space = new_space();
        let got = space.best_page_size(0x0020_0000, 0x0080_0000, 0x0020_0000).unwrap();
        assert_eq!(got, BlockSize::Size2M);
    }

    #[test]
    fn split_2m_into_4k_preserves_mapping() {
        let space = new_space();
        let desc = PageDescriptor {
            input_addr: 0x0020_0000,
            output_addr: 0x0080_0000,
            size: BlockSize::Size2M,
            stage: Stage::Stage1,
            perms: Permissions::default(),
            asid_or_vmid: None,
        };
        space.map_page(desc).unwrap();
        space.split_page(0x0020_0000).unwrap();
        let got = space.get_page(0x0020_0000).unwrap();
        assert_eq!(got.size, BlockSize::Size4K);
        assert_eq!(got.output_addr, 0x0080_0000);
        let got_mid = space.get_page(0x0020_0000 + 0x3000).unwrap();
        assert_eq!(got_mid.output_addr, 0x0080_0000 + 0x3000);
    }
}
