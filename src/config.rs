/// Which guest CPU architecture an `AddressSpace`/`VcpuContext` pair is
/// built for. Drives both the page-table format (`crate::arch`) and the
/// register-banking layout (`crate::vcpu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    ArmV5,
    ArmV7,
    ArmV8A,
    RiscV,
    Mips,
    X86_64,
}

impl Architecture {
    /// Whether this architecture has hardware two-stage translation, or
    /// needs a hypervisor-maintained shadow stage-1 (`crate::shadow`).
    pub fn has_stage2(self) -> bool {
        matches!(self, Architecture::ArmV8A | Architecture::RiscV | Architecture::X86_64)
    }
}

/// Sizing and topology knobs for one hypervisor instance. Analogous to
/// the options struct the teacher's CLI binary builds from `clap`
/// matches before handing it to library code.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Tables reserved for the hypervisor's own bootstrap address space,
    /// available before the main pool can be used (`spec.md` §4.1).
    pub initial_pool_tables: usize,
    /// Tables available to every later allocation.
    pub main_pool_tables: usize,
    /// Number of logical host CPUs the scheduler will run VCPUs on.
    pub host_cpu_count: usize,
    /// Number of VCPUs per guest (bounds `VgicDistributor`'s per-CPU
    /// bitmaps and the SGI source mask array).
    pub vcpus_per_guest: usize,
    /// Number of hardware list registers available for VGIC scheduling.
    pub list_register_count: usize,
    pub architecture: Architecture,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            initial_pool_tables: 16,
            main_pool_tables: 4096,
            host_cpu_count: 4,
            vcpus_per_guest: 4,
            list_register_count: 4,
            architecture: Architecture::ArmV8A,
        }
    }
}
