//! `VcpuContext`: the per-VCPU register file and identity state
//! (`spec.md` §4.4), plus the `reset()` entry point SPEC_FULL.md adds
//! so the end-to-end demo scenarios have somewhere to start from.

pub mod banking;

use std::sync::Mutex;

use bitflags::bitflags;

use crate::arch::invalid;
use crate::result::Result;
pub use banking::ArmMode;

bitflags! {
    /// Feature bits a guest may be configured to see, independent of
    /// what the host actually implements (`spec.md` §9's generic
    /// register-file note: the core never assumes a specific ISA's
    /// feature set is present).
    pub struct FeatureMask: u32 {
        const AARCH32_EL0   = 1 << 0;
        const AARCH32_EL1   = 1 << 1;
        const VIRTUALIZATION_HOST_EXT = 1 << 2;
        const GENERIC_TIMER = 1 << 3;
        const POINTER_AUTH  = 1 << 4;
        const SVE           = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordSize {
    W32,
    W64,
}

/// Which AArch64 exception level (or AArch32 mode, folded into the
/// same field) a VCPU is currently executing at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Aarch32 { mode_bits: u32 },
    Aarch64 { el: u8 },
}

pub struct VcpuContext {
    pub id: u32,
    /// Banked storage for every AArch32 mode's R0..R12/SP/LR plus the
    /// AArch64 X0..X30, laid out per `spec.md` §4.4's table (indices
    /// 16..20 hold FIQ's banked R8..R12, etc).
    pub gpr: [u64; 32],
    pub pc: u64,
    pub pstate: u64,
    pub exec_state: ExecState,
    pub features: FeatureMask,
    pub midr: u64,
    pub mpidr: u64,
    pub last_host_cpu: Option<u32>,
    /// Stage-2 VMID this VCPU belongs to, consulted by `Scheduler::switch`
    /// when deciding whether a migration needs a TLB flush (`spec.md` §6).
    pub vmid: u16,
    /// Per-mode banked SPSR (`spec.md` §3's "saved-PSR" attribute),
    /// indexed via `banking::spsr_index`. User/System mode has no slot.
    spsr_aarch32: [u64; 6],
    /// SPSR_EL1, the AArch64 counterpart of `spsr_aarch32`.
    pub spsr_el1: u64,
    /// Vector base register: `spec.md` §4.5 step 4 adds the
    /// class-specific offset to this to land at the handler.
    pub vbar: u64,
    hcr_shadow: Mutex<u64>,
}

impl VcpuContext {
    pub fn new(id: u32, midr: u64, mpidr: u64, features: FeatureMask) -> Self {
        let mut ctx = VcpuContext {
            id,
            gpr: [0; 32],
            pc: 0,
            pstate: 0,
            exec_state: ExecState::Aarch64 { el: 1 },
            features,
            midr,
            mpidr,
            last_host_cpu: None,
            vmid: 0,
            spsr_aarch32: [0; 6],
            spsr_el1: 0,
            vbar: 0,
            hcr_shadow: Mutex::new(0),
        };
        ctx.reset();
        ctx
    }

    /// Architectural reset: zero the register file, land at EL1 (or
    /// SVC mode for AArch32-only guests) with interrupts masked.
    pub fn reset(&mut self) {
        self.gpr = [0; 32];
        self.pc = 0;
        self.last_host_cpu = None;
        self.spsr_aarch32 = [0; 6];
        self.spsr_el1 = 0;
        self.vbar = 0;
        *self.hcr_shadow.lock().expect("hcr_shadow poisoned") = 0;
        if self.features.contains(FeatureMask::AARCH32_EL1) && !self.features.contains(FeatureMask::AARCH32_EL0) {
            self.exec_state = ExecState::Aarch32 { mode_bits: 0b10011 };
            self.pstate = 0b1_1010_0011; // SVC mode, IRQ/FIQ/Abort masked
        } else {
            self.exec_state = ExecState::Aarch64 { el: 1 };
            self.pstate = 0b1_1100_0101; // EL1h, DAIF all masked
        }
    }

    pub fn hcr(&self) -> u64 {
        *self.hcr_shadow.lock().expect("hcr_shadow poisoned")
    }

    pub fn set_hcr(&self, value: u64) {
        *self.hcr_shadow.lock().expect("hcr_shadow poisoned") = value;
    }

    /// Read the banked SPSR for AArch32 mode `mode` (`spec.md` §4.5
    /// step 1). Errors on `ArmMode::UsrSys`, which has no SPSR.
    pub fn spsr(&self, mode: ArmMode) -> Result<u64> {
        Ok(self.spsr_aarch32[banking::spsr_index(mode)?])
    }

    /// Write the banked SPSR for AArch32 mode `mode`.
    pub fn set_spsr(&mut self, mode: ArmMode, value: u64) -> Result<()> {
        self.spsr_aarch32[banking::spsr_index(mode)?] = value;
        Ok(())
    }

    fn word_size(&self) -> WordSize {
        match self.exec_state {
            ExecState::Aarch32 { .. } => WordSize::W32,
            ExecState::Aarch64 { .. } => WordSize::W64,
        }
    }

    /// Read logical register `n`, banked by the current mode for
    /// AArch32 guests (`spec.md` §4.4) and truncated to 32 bits when
    /// PSTATE indicates AArch32, per the same section.
    pub fn read_gpr(&self, n: u8) -> Result<u64> {
        if n == 15 {
            return Ok(self.truncate(self.pc));
        }
        match self.exec_state {
            ExecState::Aarch32 { mode_bits } => {
                let mode = ArmMode::from_cpsr_bits(mode_bits)?;
                let idx = banking::gpr_index(n, mode)?;
                Ok(self.gpr[idx] & 0xffff_ffff)
            }
            ExecState::Aarch64 { .. } => {
                if n >= 31 {
                    return Err(invalid("AArch64 register number must be 0..=30"));
                }
                Ok(self.gpr[n as usize])
            }
        }
    }

    pub fn write_gpr(&mut self, n: u8, value: u64) -> Result<()> {
        if n == 15 {
            self.pc = self.truncate(value);
            return Ok(());
        }
        match self.exec_state {
            ExecState::Aarch32 { mode_bits } => {
                let mode = ArmMode::from_cpsr_bits(mode_bits)?;
                let idx = banking::gpr_index(n, mode)?;
                self.gpr[idx] = value & 0xffff_ffff;
                Ok(())
            }
            ExecState::Aarch64 { .. } => {
                if n >= 31 {
                    return Err(invalid("AArch64 register number must be 0..=30"));
                }
                self.gpr[n as usize] = value;
                Ok(())
            }
        }
    }

    fn truncate(&self, value: u64) -> u64 {
        match self.word_size() {
            WordSize::W32 => value & 0xffff_ffff,
            WordSize::W64 => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_lands_aarch64_at_el1_with_daif_masked() {
        let ctx = VcpuContext::new(0, 0x410f_d034, 0x8000_0000, FeatureMask::empty());
        assert_eq!(ctx.exec_state, ExecState::Aarch64 { el: 1 });
        assert_eq!(ctx.pc, 0);
        assert_eq!(ctx.hcr(), 0);
    }

    #[test]
    fn aarch32_bank_switch_is_visible_through_read_gpr() {
        let mut ctx = VcpuContext::new(1, 0x410f_c075, 0, FeatureMask::AARCH32_EL1);
        // SVC mode (reset state for an AArch32-only guest): write R13.
        ctx.write_gpr(13, 0xdead_0000).unwrap();
        assert_eq!(ctx.read_gpr(13).unwrap(), 0xdead_0000);
        // Switch to FIQ mode; R13 is now a different physical slot.
        ctx.exec_state = ExecState::Aarch32 { mode_bits: 0b10001 };
        assert_ne!(ctx.read_gpr(13).unwrap(), 0xdead_0000);
    }

    #[test]
    fn spsr_is_banked_per_mode_and_reset_clears_it() {
        let mut ctx = VcpuContext::new(3, 0, 0, FeatureMask::AARCH32_EL1);
        ctx.set_spsr(ArmMode::Svc, 0x6000_0013).unwrap();
        ctx.set_spsr(ArmMode::Abt, 0x6000_0017).unwrap();
        assert_eq!(ctx.spsr(ArmMode::Svc).unwrap(), 0x6000_0013);
        assert_eq!(ctx.spsr(ArmMode::Abt).unwrap(), 0x6000_0017);
        assert!(ctx.spsr(ArmMode::UsrSys).is_err());
        ctx.reset();
        assert_eq!(ctx.spsr(ArmMode::Svc).unwrap(), 0);
    }

    #[test]
    fn aarch64_reads_truncate_pc_only_when_32bit() {
        let mut ctx = VcpuContext::new(2, 0, 0, FeatureMask::empty());
        ctx.write_gpr(15, 0x1_0000_0001).unwrap();
        assert_eq!(ctx.pc, 0x1_0000_0001);
    }
}
