//! `VgicListRegs`: bridges the in-memory distributor to the (simulated)
//! hardware virtualisation list registers (`spec.md` §4.7).
//!
//! Grounded on `examples/original_source/arch/arm/cpu/common/vgic.c`'s
//! `vgic_irq_enter`/`vgic_irq_exit` flush-and-sync pair, reworked around
//! an explicit per-LR state machine instead of scattered flag bits.

use crate::result::{CoreError, Result};
use crate::vgic::distributor::{TriggerMode, VgicDistributor};

/// `spec.md` §4.7's state machine for one IRQ occupying a list
/// register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LrState {
    Unallocated,
    Pending,
    Active,
    EoiReported,
}

#[derive(Debug, Clone, Copy)]
pub struct ListRegister {
    pub state: LrState,
    pub source_cpu: usize,
    pub virtual_irq: usize,
    pub eoi_on_drop: bool,
}

pub struct VgicListRegs {
    lrs: Vec<Option<ListRegister>>,
    underflow_enabled: bool,
}

impl VgicListRegs {
    pub fn new(count: usize) -> Self {
        VgicListRegs {
            lrs: vec![None; count],
            underflow_enabled: false,
        }
    }

    fn free_lr(&self) -> Option<usize> {
        self.lrs.iter().position(|lr| lr.is_none())
    }

    /// `spec.md` §4.7 "flushing one IRQ": find a free LR and encode the
    /// IRQ into it. If none is free, enable the underflow-interrupt so
    /// the hypervisor is re-entered once a slot frees, and report that
    /// back to the caller via `Err(CoreError::OutOfMemory)` — the
    /// distributor's `pending` bit stays set, so the invariant in
    /// `spec.md` §4.7 still holds.
    pub fn flush(&mut self, source_cpu: usize, virtual_irq: usize, level_triggered: bool) -> Result<usize> {
        match self.free_lr() {
            Some(idx) => {
                self.lrs[idx] = Some(ListRegister {
                    state: LrState::Pending,
                    source_cpu,
                    virtual_irq,
                    eoi_on_drop: level_triggered,
                });
                Ok(idx)
            }
            None => {
                self.underflow_enabled = true;
                Err(CoreError::OutOfMemory)
            }
        }
    }

    pub fn underflow_enabled(&self) -> bool {
        self.underflow_enabled
    }

    /// Hardware transition observed via EISR: the guest ack'd the
    /// pending interrupt (PENDING -> ACTIVE).
    pub fn mark_active(&mut self, lr: usize) -> Result<()> {
        let entry = self.lrs[lr].as_mut().ok_or(CoreError::NotFound)?;
        if entry.state != LrState::Pending {
            return Err(crate::arch::invalid("LR is not in PENDING state"));
        }
        entry.state = LrState::Active;
        Ok(())
    }

    /// Hardware sets the EISR bit when the guest issues EOI
    /// (ACTIVE -> EOI_REPORTED).
    pub fn mark_eoi(&mut self, lr: usize) -> Result<()> {
        let entry = self.lrs[lr].as_mut().ok_or(CoreError::NotFound)?;
        if entry.state != LrState::Active {
            return Err(crate::arch::invalid("LR is not in ACTIVE state"));
        }
        entry.state = LrState::EoiReported;
        Ok(())
    }

    /// `spec.md` §4.7 "syncing at VCPU exit": for every EOI-reported LR,
    /// clear the distributor's active bit (for `cpu`, the VCPU this list
    /// register bank belongs to) and, for level-triggered IRQs still
    /// asserted, reassert pending; release the LR
    /// (EOI_REPORTED -> UNALLOCATED).
    pub fn sync_at_exit(&mut self, cpu: usize, distributor: &mut VgicDistributor, level_still_asserted: impl Fn(usize) -> bool) {
        for slot in self.lrs.iter_mut() {
            let release = match slot {
                Some(entry) if entry.state == LrState::EoiReported => {
                    let irq = entry.virtual_irq;
                    distributor.clear_active(irq, cpu);
                    if entry.eoi_on_drop && level_still_asserted(irq) {
                        let _ = distributor.assert_level(irq, false, None);
                        let _ = distributor.assert_level(irq, true, None);
                    }
                    true
                }
                _ => false,
            };
            if release {
                *slot = None;
            }
        }
        if self.lrs.iter().all(Option::is_none) {
            self.underflow_enabled = false;
        }
    }

    pub fn state_of(&self, lr: usize) -> Option<LrState> {
        self.lrs[lr].map(|entry| entry.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_allocates_then_returns_out_of_memory_once_full() {
        let mut lrs = VgicListRegs::new(1);
        lrs.flush(0, 5, true).unwrap();
        assert!(matches!(lrs.flush(0, 6, true), Err(CoreError::OutOfMemory)));
        assert!(lrs.underflow_enabled());
    }

    #[test]
    fn full_state_machine_reaches_unallocated() {
        let mut lrs = VgicListRegs::new(2);
        let mut dist = VgicDistributor::new(1);
        dist.set_trigger(5, TriggerMode::Level);
        let lr = lrs.flush(0, 5, true).unwrap();
        assert_eq!(lrs.state_of(lr), Some(LrState::Pending));
        lrs.mark_active(lr).unwrap();
        assert_eq!(lrs.state_of(lr), Some(LrState::Active));
        lrs.mark_eoi(lr).unwrap();
        assert_eq!(lrs.state_of(lr), Some(LrState::EoiReported));
        lrs.sync_at_exit(0, &mut dist, |_| false);
        assert_eq!(lrs.state_of(lr), None);
    }

    #[test]
    fn level_triggered_irq_still_asserted_reasserts_pending_on_sync() {
        let mut lrs = VgicListRegs::new(1);
        let mut dist = VgicDistributor::new(1);
        dist.set_trigger(7, TriggerMode::Level);
        dist.set_target_cpus(7, 0b1);
        dist.set_enabled(7, 0, true);
        dist.assert_level(7, true, None);
        let lr = lrs.flush(0, 7, true).unwrap();
        lrs.mark_active(lr).unwrap();
        lrs.mark_eoi(lr).unwrap();
        lrs.sync_at_exit(0, &mut dist, |_| true);
        assert!(dist.is_pending(7, 0));
    }
}
