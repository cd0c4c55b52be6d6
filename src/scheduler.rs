//! `Scheduler::switch`: the external-scheduler-facing `vcpu_switch`
//! interface (`spec.md` §5's "pre-emptive context switches driven by an
//! external scheduler" note), plus the process-wide per-host-CPU
//! "currently running VCPU" registry SPEC_FULL.md §9 calls for.
//!
//! Grounded on `examples/original_source/arch/arm/cpu/common/cpu_vcpu_helper.c`'s
//! `vmm_vcpu_switch` save/restore pair, reworked around `VcpuContext`.

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use log::debug;

use crate::barrier::TlbMaintenance;
use crate::result::{CoreError, Result};
use crate::vcpu::VcpuContext;

struct HostCpuState {
    initialised: bool,
    running_vcpu: Option<u32>,
}

lazy_static! {
    /// Index `cpu` holds host CPU `cpu`'s scheduling state. Sized lazily
    /// to the largest `host_cpu` ever registered via `Scheduler::new`.
    static ref HOST_CPUS: Mutex<Vec<HostCpuState>> = Mutex::new(Vec::new());
}

/// One `Scheduler` exists per host CPU. `spec.md` §9: constructing a
/// second `Scheduler` for the same host CPU is a programming error.
pub struct Scheduler {
    host_cpu: u32,
    barrier: Arc<dyn TlbMaintenance>,
}

impl Scheduler {
    pub fn new(host_cpu: u32, barrier: Arc<dyn TlbMaintenance>) -> Result<Self> {
        let mut cpus = HOST_CPUS.lock().expect("host cpu table poisoned");
        let idx = host_cpu as usize;
        if idx >= cpus.len() {
            cpus.resize_with(idx + 1, || HostCpuState {
                initialised: false,
                running_vcpu: None,
            });
        }
        if cpus[idx].initialised {
            return Err(CoreError::Invalid(format!(
                "a Scheduler for host cpu {} already exists",
                host_cpu
            )));
        }
        cpus[idx].initialised = true;
        Ok(Scheduler { host_cpu, barrier })
    }

    pub fn running_vcpu(&self) -> Option<u32> {
        HOST_CPUS.lock().expect("host cpu table poisoned")[self.host_cpu as usize].running_vcpu
    }

    /// `spec.md` §5/§9 `vcpu_switch`: save `outgoing`'s last-host-cpu
    /// stamp, hand the host CPU to `incoming`. If `incoming` last ran on
    /// a different host CPU, its stage-2 VMID may still be resident in
    /// that CPU's TLB, so flush it here before it runs (`spec.md` §6,
    /// §8 scenario #5). The caller is expected to have already
    /// saved/restored any hardware register state this model does not
    /// own (FP/SIMD live register file transfer, for instance, is a
    /// non-goal here).
    pub fn switch(&self, outgoing: &mut VcpuContext, incoming: &mut VcpuContext) {
        let incoming_prior_host_cpu = incoming.last_host_cpu;
        outgoing.last_host_cpu = Some(self.host_cpu);
        incoming.last_host_cpu = Some(self.host_cpu);
        if incoming_prior_host_cpu != Some(self.host_cpu) {
            self.barrier.invalidate_vmid(incoming.vmid);
        }
        HOST_CPUS.lock().expect("host cpu table poisoned")[self.host_cpu as usize].running_vcpu = Some(incoming.id);
        debug!(
            "host cpu {}: vcpu {} -> vcpu {}",
            self.host_cpu, outgoing.id, incoming.id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::test_double::{Event, RecordingBarrier};
    use crate::barrier::NullBarrier;
    use crate::vcpu::FeatureMask;

    #[test]
    fn second_scheduler_for_the_same_cpu_is_rejected() {
        let _s = Scheduler::new(200, Arc::new(NullBarrier::default())).unwrap();
        assert!(Scheduler::new(200, Arc::new(NullBarrier::default())).is_err());
    }

    #[test]
    fn switch_updates_running_vcpu_and_stamps() {
        let sched = Scheduler::new(201, Arc::new(NullBarrier::default())).unwrap();
        let mut a = VcpuContext::new(1, 0, 0, FeatureMask::empty());
        let mut b = VcpuContext::new(2, 0, 0, FeatureMask::empty());
        sched.switch(&mut a, &mut b);
        assert_eq!(sched.running_vcpu(), Some(2));
        assert_eq!(a.last_host_cpu, Some(201));
        assert_eq!(b.last_host_cpu, Some(201));
    }

    #[test]
    fn migrating_to_a_new_host_cpu_flushes_the_incoming_vmid() {
        let barrier = Arc::new(RecordingBarrier::default());
        let sched = Scheduler::new(202, barrier.clone()).unwrap();
        let mut a = VcpuContext::new(1, 0, 0, FeatureMask::empty());
        let mut incoming = VcpuContext::new(2, 0, 0, FeatureMask::empty());
        incoming.vmid = 7;
        incoming.last_host_cpu = Some(5); // previously ran elsewhere
        sched.switch(&mut a, &mut incoming);
        assert!(barrier.events.lock().unwrap().contains(&Event::InvalidateVmid(7)));
    }

    #[test]
    fn staying_on_the_same_host_cpu_does_not_reflush() {
        let barrier = Arc::new(RecordingBarrier::default());
        let sched = Scheduler::new(203, barrier.clone()).unwrap();
        let mut a = VcpuContext::new(1, 0, 0, FeatureMask::empty());
        let mut incoming = VcpuContext::new(2, 0, 0, FeatureMask::empty());
        incoming.vmid = 9;
        incoming.last_host_cpu = Some(203); // already resident here
        sched.switch(&mut a, &mut incoming);
        assert!(!barrier.events.lock().unwrap().contains(&Event::InvalidateVmid(9)));
    }
}
