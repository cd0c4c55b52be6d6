//! Memory-barrier and TLB-maintenance abstraction (`spec.md` §9's
//! "typed-register abstraction" note generalised to barriers): real
//! `dsb`/`isb`/`tlbi` are inline asm on real hardware, which this crate
//! never emits (no inline asm is a non-goal). Swappable so
//! `AddressSpace`/`Scheduler` can be driven by a recording test double.

use crate::arch::Stage;

pub trait MemoryBarrier: Send + Sync {
    fn data_sync(&self);
    fn instruction_sync(&self);
}

pub trait TlbMaintenance: Send + Sync {
    fn invalidate_va(&self, stage: Stage, ia: u64);
    fn invalidate_all(&self, stage: Stage);
    /// Flush stage-2 TLB entries for a single VMID on the current host
    /// CPU. `Scheduler::switch` issues this when a VCPU migrates onto a
    /// host CPU that may still hold stale stage-2 translations for its
    /// VMID (`spec.md` §6, §8 scenario #5).
    fn invalidate_vmid(&self, vmid: u16);
}

/// Barrier implementation that does nothing beyond logging. Stands in
/// for real asm sequences, which are out of scope for this crate.
#[derive(Default)]
pub struct NullBarrier;

impl MemoryBarrier for NullBarrier {
    fn data_sync(&self) {
        log::trace!("dsb");
    }

    fn instruction_sync(&self) {
        log::trace!("isb");
    }
}

impl TlbMaintenance for NullBarrier {
    fn invalidate_va(&self, stage: Stage, ia: u64) {
        log::trace!("tlbi va stage={:?} ia={:#x}", stage, ia);
    }

    fn invalidate_all(&self, stage: Stage) {
        log::trace!("tlbi all stage={:?}", stage);
    }

    fn invalidate_vmid(&self, vmid: u16) {
        log::trace!("tlbi stage-2 vmid={:#x}", vmid);
    }
}

#[cfg(test)]
pub mod test_double {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Event {
        Dsb,
        Isb,
        InvalidateVa(Stage, u64),
        InvalidateAll(Stage),
        InvalidateVmid(u16),
    }

    #[derive(Default)]
    pub struct RecordingBarrier {
        pub events: Mutex<Vec<Event>>,
    }

    impl MemoryBarrier for RecordingBarrier {
        fn data_sync(&self) {
            self.events.lock().unwrap().push(Event::Dsb);
        }

        fn instruction_sync(&self) {
            self.events.lock().unwrap().push(Event::Isb);
        }
    }

    impl TlbMaintenance for RecordingBarrier {
        fn invalidate_va(&self, stage: Stage, ia: u64) {
            self.events.lock().unwrap().push(Event::InvalidateVa(stage, ia));
        }

        fn invalidate_all(&self, stage: Stage) {
            self.events.lock().unwrap().push(Event::InvalidateAll(stage));
        }

        fn invalidate_vmid(&self, vmid: u16) {
            self.events.lock().unwrap().push(Event::InvalidateVmid(vmid));
        }
    }
}
