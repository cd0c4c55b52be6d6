//! `ShadowCopyEngine`: per-VCPU shadow page tables for architectures
//! without a hardware stage-2 (`spec.md` §4.3), built by cloning the
//! guest's default table lazily on first fault rather than eagerly
//! copying the whole address space up front.
//!
//! Grounded on `examples/original_source/arch/arm/cpu/arm32/cpu_mmu_v7.c`'s
//! shadow-table maintenance (`cpu_mmu_sync_ttbr`-style lazy population),
//! adapted onto this crate's `AddressSpace`/`PageTablePool`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use crate::address_space::AddressSpace;
use crate::arch::{PageFormat, Stage};
use crate::barrier::TlbMaintenance;
use crate::pool::PageTablePool;
use crate::result::Result;

/// One shadow table per VCPU, keyed by the VCPU's own id. `spec.md`
/// §4.3's "shadow copy engine" entity.
pub struct ShadowCopyEngine<F: PageFormat> {
    pool: Arc<PageTablePool<F>>,
    barrier: Arc<dyn TlbMaintenance>,
    default: Arc<AddressSpace<F>>,
    shadows: Mutex<HashMap<u32, Arc<AddressSpace<F>>>>,
}

impl<F: PageFormat> ShadowCopyEngine<F> {
    pub fn new(pool: Arc<PageTablePool<F>>, barrier: Arc<dyn TlbMaintenance>, default: Arc<AddressSpace<F>>) -> Self {
        ShadowCopyEngine {
            pool,
            barrier,
            default,
            shadows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shadow table for `vcpu_id`, allocating an empty one
    /// on first use. The shadow stays empty until faults populate it;
    /// this only reserves the root.
    pub fn shadow_for(&self, vcpu_id: u32) -> Result<Arc<AddressSpace<F>>> {
        let mut shadows = self.shadows.lock().expect("shadow map poisoned");
        if let Some(existing) = shadows.get(&vcpu_id) {
            return Ok(existing.clone());
        }
        let space = Arc::new(AddressSpace::new(self.pool.clone(), Stage::Stage1, self.barrier.clone())?);
        shadows.insert(vcpu_id, space.clone());
        debug!("allocated shadow table for vcpu {}", vcpu_id);
        Ok(space)
    }

    /// Handle a fault at `ia` for `vcpu_id`'s shadow table by cloning
    /// the matching descriptor out of the default table. Returns
    /// `Ok(())` once the shadow now maps `ia`; the default table having
    /// no mapping either is reported to the caller via `get_page`'s
    /// own `NotFound`, which this does not swallow.
    pub fn populate_on_fault(&self, vcpu_id: u32, ia: u64) -> Result<()> {
        let desc = self.default.get_page(ia)?;
        let shadow = self.shadow_for(vcpu_id)?;
        shadow.map_page(desc)
    }

    /// `spec.md` §4.3 `invalidate`: drop the mapping covering `va_range`
    /// from every live per-VCPU shadow, so a subsequent fault repopulates
    /// it from the (now current) default table. Coherent across shadows:
    /// no shadow is left pointing at a stale translation once this
    /// returns.
    pub fn invalidate(&self, va_range: std::ops::Range<u64>) {
        let shadows = self.shadows.lock().expect("shadow map poisoned");
        for (vcpu_id, shadow) in shadows.iter() {
            let mut ia = va_range.start;
            while ia < va_range.end {
                match shadow.unmap_page(ia) {
                    Ok(()) => debug!("invalidated shadow vcpu={} ia={:#x}", vcpu_id, ia),
                    Err(_) => { /* not mapped in this shadow; nothing to do */ }
                }
                ia += 0x1000;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::generic64::Generic64;
    use crate::arch::{BlockSize, PageDescriptor, Permissions};
    use crate::barrier::test_double::RecordingBarrier;

    fn setup() -> (Arc<PageTablePool<Generic64>>, Arc<AddressSpace<Generic64>>, Arc<RecordingBarrier>) {
        let pool = Arc::new(PageTablePool::<Generic64>::new(0x1000_0000, 8, 0x2000_0000, 64));
        let barrier = Arc::new(RecordingBarrier::default());
        let default = Arc::new(AddressSpace::new(pool.clone(), Stage::Stage1, barrier.clone()).unwrap());
        (pool, default, barrier)
    }

    #[test]
    fn fault_populates_shadow_from_default() {
        let (pool, default, barrier) = setup();
        default
            .map_page(PageDescriptor {
                input_addr: 0x9000,
                output_addr: 0x5000,
                size: BlockSize::Size4K,
                stage: Stage::Stage1,
                perms: Permissions::default(),
                asid_or_vmid: None,
            })
            .unwrap();
        let engine = ShadowCopyEngine::new(pool, barrier, default.clone());
        engine.populate_on_fault(1, 0x9000).unwrap();
        let shadow = engine.shadow_for(1).unwrap();
        assert_eq!(shadow.get_page(0x9000).unwrap().output_addr, 0x5000);
    }

    #[test]
    fn invalidate_clears_all_live_shadows() {
        let (pool, default, barrier) = setup();
        default
            .map_page(PageDescriptor {
                input_addr: 0x9000,
                output_addr: 0x5000,
                size: BlockSize::Size4K,
                stage: Stage::Stage1,
                perms: Permissions::default(),
                asid_or_vmid: None,
            })
            .unwrap();
        let engine = ShadowCopyEngine::new(pool, barrier, default.clone());
        engine.populate_on_fault(1, 0x9000).unwrap();
        engine.populate_on_fault(2, 0x9000).unwrap();
        engine.invalidate(0x9000..0xa000);
        assert!(engine.shadow_for(1).unwrap().get_page(0x9000).is_err());
        assert!(engine.shadow_for(2).unwrap().get_page(0x9000).is_err());
    }
}
