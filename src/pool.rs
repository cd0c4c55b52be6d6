//! `PageTablePool`: a fixed-capacity arena of page-table pages, carved
//! from a reserved contiguous region exactly once at
//! `PageTablePool::new` and never grown afterwards (`spec.md` §4.1).
//!
//! Grounded on the teacher's `page_table.rs` upsert-table pattern
//! (`UpsertTable`/`allocate_page_table` in `Mic92-vmsh`), generalised
//! from "HashMap of tables touched by one `map_memory` call" into a
//! real arena with O(1) reverse lookup and a free list, per `spec.md`
//! §4.1's contract (`alloc`/`free`/`find_by_pa`/`attach`/`detach`).

use std::marker::PhantomData;
use std::sync::Mutex;

use log::{debug, warn};

use crate::arch::{PageFormat, Stage};
use crate::result::{CoreError, Result};
use crate::table::{PageTable, SubPool, TableRef};

struct Slot<F: PageFormat> {
    table: Option<PageTable<F>>,
}

/// A pool-owned table page plus a borrow guard. Obtained from
/// `PageTablePool::get`/`get_mut`; holding one is what the spec calls
/// "one lock per table".
pub struct TableGuard<'a, F: PageFormat> {
    guard: std::sync::MutexGuard<'a, Slot<F>>,
}

impl<'a, F: PageFormat> TableGuard<'a, F> {
    pub fn table(&self) -> &PageTable<F> {
        self.guard
            .table
            .as_ref()
            .expect("TableGuard constructed over an empty slot")
    }

    pub fn table_mut(&mut self) -> &mut PageTable<F> {
        self.guard
            .table
            .as_mut()
            .expect("TableGuard constructed over an empty slot")
    }
}

pub struct PageTablePool<F: PageFormat> {
    initial_base: u64,
    main_base: u64,
    table_bytes: u64,
    initial: Vec<Mutex<Slot<F>>>,
    main: Vec<Mutex<Slot<F>>>,
    /// Pool-wide free-list lock. Leaf in the lock order (`spec.md` §5):
    /// acquired after any per-table lock involved in the same call.
    free_initial: Mutex<Vec<usize>>,
    free_main: Mutex<Vec<usize>>,
    _fmt: PhantomData<F>,
}

/// Largest entry count across every level of `F`, used to size every
/// pool slot uniformly so `find_by_pa` stays a pure subtract-and-shift.
fn max_entries<F: PageFormat>() -> usize {
    (0..F::LEVEL_COUNT)
        .map(F::entries_at_level)
        .max()
        .unwrap_or(1)
}

impl<F: PageFormat> PageTablePool<F> {
    /// `initial_base`/`main_base` are the (simulated) physical base
    /// addresses of the two reserved sub-pools; real bases would come
    /// from the early address-space bootstrap described in `spec.md`
    /// §4.1, which is outside this crate's scope (boot loader is an
    /// explicit non-goal).
    pub fn new(initial_base: u64, initial_tables: usize, main_base: u64, main_tables: usize) -> Self {
        let table_bytes = (max_entries::<F>() * std::mem::size_of::<u64>()) as u64;
        let initial = (0..initial_tables)
            .map(|_| Mutex::new(Slot { table: None }))
            .collect();
        let main = (0..main_tables)
            .map(|_| Mutex::new(Slot { table: None }))
            .collect();
        PageTablePool {
            initial_base,
            main_base,
            table_bytes,
            initial,
            main,
            free_initial: Mutex::new((0..initial_tables).collect()),
            free_main: Mutex::new((0..main_tables).collect()),
            _fmt: PhantomData,
        }
    }

    fn slots(&self, sub_pool: SubPool) -> &[Mutex<Slot<F>>] {
        match sub_pool {
            SubPool::Initial => &self.initial,
            SubPool::Main => &self.main,
        }
    }

    fn free_list(&self, sub_pool: SubPool) -> &Mutex<Vec<usize>> {
        match sub_pool {
            SubPool::Initial => &self.free_initial,
            SubPool::Main => &self.free_main,
        }
    }

    fn base(&self, sub_pool: SubPool) -> u64 {
        match sub_pool {
            SubPool::Initial => self.initial_base,
            SubPool::Main => self.main_base,
        }
    }

    fn phys_addr_of(&self, sub_pool: SubPool, index: usize) -> u64 {
        self.base(sub_pool) + (index as u64) * self.table_bytes
    }

    fn alloc_in(&self, sub_pool: SubPool, stage: Stage, level: u8, ia_base: u64) -> Result<TableRef> {
        let index = {
            // Free-list lock is acquired and released here without
            // holding any per-table lock, so it is trivially "last".
            let mut free = self.free_list(sub_pool).lock().expect("pool free list poisoned");
            free.pop().ok_or(CoreError::OutOfMemory)?
        };
        let phys_addr = self.phys_addr_of(sub_pool, index);
        let mut slot = self.slots(sub_pool)[index]
            .lock()
            .expect("page table slot poisoned");
        slot.table = Some(PageTable::empty(phys_addr, phys_addr, level, stage, ia_base));
        debug!(
            "alloc {:?} table at pa={:#x} level={} stage={:?}",
            sub_pool, phys_addr, level, stage
        );
        Ok(TableRef { sub_pool, index })
    }

    /// Allocate from the bootstrap sub-pool. Used only while
    /// constructing the hypervisor's own initial address space.
    pub fn bootstrap(&self, stage: Stage, level: u8, ia_base: u64) -> Result<TableRef> {
        self.alloc_in(SubPool::Initial, stage, level, ia_base)
    }

    /// Allocate from the main sub-pool (`spec.md` §4.1 `alloc`).
    pub fn alloc(&self, stage: Stage, level: u8, ia_base: u64) -> Result<TableRef> {
        self.alloc_in(SubPool::Main, stage, level, ia_base)
    }

    pub fn get(&self, table_ref: TableRef) -> TableGuard<'_, F> {
        let guard = self.slots(table_ref.sub_pool)[table_ref.index]
            .lock()
            .expect("page table slot poisoned");
        TableGuard { guard }
    }

    /// `spec.md` §4.1 `find_by_pa`: O(1) reverse lookup, bounds-checked
    /// against whichever sub-pool's reserved range `addr` falls into.
    pub fn find_by_pa(&self, addr: u64) -> Option<TableRef> {
        for sub_pool in [SubPool::Initial, SubPool::Main] {
            let base = self.base(sub_pool);
            let len = self.slots(sub_pool).len() as u64;
            if addr < base {
                continue;
            }
            let offset = addr - base;
            if offset % self.table_bytes != 0 {
                continue;
            }
            let index = offset / self.table_bytes;
            if index >= len {
                continue;
            }
            let index = index as usize;
            if self.slots(sub_pool)[index]
                .lock()
                .expect("page table slot poisoned")
                .table
                .is_some()
            {
                return Some(TableRef { sub_pool, index });
            }
        }
        None
    }

    /// `spec.md` §4.1 `attach`: install `child`'s physical address at
    /// the `ia`-indexed entry of `parent`.
    pub fn attach(&self, parent: TableRef, ia: u64, child: TableRef) -> Result<()> {
        let child_phys = {
            let child_guard = self.get(child);
            if child_guard.table().parent().is_some() {
                return Err(CoreError::Invalid("child table is already attached".into()));
            }
            child_guard.table().phys_addr()
        };
        let mut parent_guard = self.get(parent);
        let table = parent_guard.table_mut();
        let idx = F::index(ia, table.level());
        if F::is_valid(table.entry(idx)) {
            return Err(CoreError::Conflict { ia });
        }
        let word = F::encode_table(child_phys);
        table.set_entry(idx, word, false, true);
        drop(parent_guard);
        let mut child_guard = self.get(child);
        child_guard.table_mut().parent = Some(parent);
        Ok(())
    }

    /// `spec.md` §4.1 `detach`: clears the entry in the parent and
    /// decrements parent counters. TLB invalidation is the caller's
    /// responsibility (`AddressSpace` knows the stage-specific
    /// invalidate sequence; the pool does not).
    pub fn detach(&self, child: TableRef) -> Result<()> {
        let parent = {
            let child_guard = self.get(child);
            child_guard
                .table()
                .parent()
                .ok_or_else(|| CoreError::Invalid("table has no parent to detach from".into()))?
        };
        let child_phys = self.get(child).table().phys_addr();
        let mut parent_guard = self.get(parent);
        let table = parent_guard.table_mut();
        for idx in 0..table.entries.len() {
            if F::is_table(table.entry(idx), table.level()) && F::table_target(table.entry(idx)) == child_phys {
                table.clear_entry(idx, true);
                drop(parent_guard);
                self.get(child).table_mut().parent = None;
                return Ok(());
            }
        }
        Err(CoreError::Invalid("child not found in parent's entries".into()))
    }

    /// `spec.md` §4.1 `free`: detach, zero, recursively free children,
    /// return the slot to the free list.
    pub fn free(&self, table_ref: TableRef) -> Result<()> {
        let child_refs: Vec<TableRef> = {
            let guard = self.get(table_ref);
            let table = guard.table();
            let mut out = Vec::new();
            for idx in 0..table.entries.len() {
                let word = table.entry(idx);
                if F::is_table(word, table.level()) {
                    if let Some(child) = self.find_by_pa(F::table_target(word)) {
                        out.push(child);
                    } else {
                        warn!("dangling table descriptor during free; no owning slot found");
                    }
                }
            }
            out
        };
        for child in child_refs {
            self.free(child)?;
        }
        if let Some(parent) = self.get(table_ref).table().parent() {
            let _ = self.detach(table_ref);
            let _ = parent;
        }
        {
            let mut guard = self.get(table_ref);
            guard.guard.table = None;
        }
        self.free_list(table_ref.sub_pool)
            .lock()
            .expect("pool free list poisoned")
            .push(table_ref.index);
        Ok(())
    }
}
