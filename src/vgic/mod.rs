//! Virtual GICv2: the in-memory distributor model (`crate::vgic::distributor`)
//! and its bridge onto hardware list registers (`crate::vgic::list_regs`),
//! per `spec.md` §4.6-4.7.
//!
//! Grounded on `examples/original_source/arch/arm/cpu/common/vgic.c`'s
//! `vgic_guest_state`/`vgic_irq_state` split between distributor state
//! and per-VCPU list-register state.

pub mod distributor;
pub mod list_regs;

pub use distributor::VgicDistributor;
pub use list_regs::VgicListRegs;

pub const MAX_IRQS: usize = 1020;
pub const SGI_COUNT: usize = 16;

/// Per-guest VGIC state: one distributor shared by every VCPU of the
/// guest, plus one `VgicListRegs` bridge per VCPU. SPEC_FULL.md adds
/// this container and its `reset()` so the demo has a single handle to
/// construct and tear down per guest.
pub struct VgicChipState {
    pub distributor: VgicDistributor,
}

impl VgicChipState {
    pub fn new(num_cpus: usize) -> Self {
        VgicChipState {
            distributor: VgicDistributor::new(num_cpus),
        }
    }

    pub fn reset(&mut self) {
        self.distributor.reset();
    }
}
