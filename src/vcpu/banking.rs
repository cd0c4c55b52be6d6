//! Mode-indexed general-purpose register banking for 32-bit guests
//! (`spec.md` §4.4's table), expressed as an exhaustive match rather
//! than the teacher's array-indexing-with-a-default-arm style so an
//! unhandled mode is a compile error, not a silent fallthrough.

use crate::arch::invalid;
use crate::result::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmMode {
    UsrSys,
    Fiq,
    Irq,
    Svc,
    Abt,
    Und,
    Hyp,
}

impl ArmMode {
    pub fn from_cpsr_bits(bits: u32) -> Result<Self> {
        match bits & 0x1f {
            0b10000 | 0b11111 => Ok(ArmMode::UsrSys),
            0b10001 => Ok(ArmMode::Fiq),
            0b10010 => Ok(ArmMode::Irq),
            0b10011 => Ok(ArmMode::Svc),
            0b10111 => Ok(ArmMode::Abt),
            0b11011 => Ok(ArmMode::Und),
            0b11010 => Ok(ArmMode::Hyp),
            other => Err(invalid(format!("unrecognised CPSR mode bits {:#07b}", other))),
        }
    }
}

/// Index into `VcpuContext::spsr_aarch32` for `mode`'s banked SPSR.
/// User/System mode has no SPSR of its own (`spec.md` §4.4); only the
/// exception modes bank one.
pub fn spsr_index(mode: ArmMode) -> Result<usize> {
    match mode {
        ArmMode::UsrSys => Err(invalid("usr/sys mode has no banked SPSR")),
        ArmMode::Fiq => Ok(0),
        ArmMode::Irq => Ok(1),
        ArmMode::Svc => Ok(2),
        ArmMode::Abt => Ok(3),
        ArmMode::Und => Ok(4),
        ArmMode::Hyp => Ok(5),
    }
}

/// Index into `VcpuContext::gpr` that logical register `n` (0..=15)
/// resolves to in `mode`. `n == 15` (PC) has no banked slot; callers
/// must read `VcpuContext::pc` instead.
pub fn gpr_index(n: u8, mode: ArmMode) -> Result<usize> {
    match n {
        0..=7 => Ok(n as usize),
        8..=12 => Ok(match mode {
            ArmMode::Fiq => 16 + (n - 8) as usize,
            ArmMode::UsrSys | ArmMode::Irq | ArmMode::Svc | ArmMode::Abt | ArmMode::Und | ArmMode::Hyp => n as usize,
        }),
        13 => Ok(match mode {
            ArmMode::UsrSys => 13,
            ArmMode::Fiq => 29,
            ArmMode::Irq => 17,
            ArmMode::Svc => 19,
            ArmMode::Abt => 21,
            ArmMode::Und => 23,
            ArmMode::Hyp => 15,
        }),
        14 => Ok(match mode {
            ArmMode::UsrSys => 14,
            ArmMode::Fiq => 30,
            ArmMode::Irq => 16,
            ArmMode::Svc => 18,
            ArmMode::Abt => 20,
            ArmMode::Und => 22,
            ArmMode::Hyp => 14,
        }),
        15 => Err(invalid("PC has no banked gpr slot; read VcpuContext::pc")),
        other => Err(invalid(format!("no AArch32 register numbered {}", other))),
    }
}
