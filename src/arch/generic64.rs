//! Stand-in 3-level, 512-entry-per-table format used for guest stage-1
//! tables on RISC-V, x86-64, and MIPS.
//!
//! Unlike `lpae` and `armv5`, `spec.md` §6 does not give a bit-for-bit
//! wire format for these architectures — only ARM and GICv2 are
//! specified down to the bit. This format is grounded on the level
//! count and block-size progression of the RISC-V Sv39 walk in
//! `examples/original_source/arch/riscv/cpu/generic/cpu_mmu.c` (three
//! levels, 4 KiB / 2 MiB / 1 GiB blocks at 12/21/30-bit shifts), but its
//! descriptor bit positions are simulation-only: good enough to drive
//! and test the generic `AddressSpace` algorithms, not a claim to match
//! any one real ISA's encoding (see `SPEC_FULL.md` §9).

use super::{invalid, BlockSize, PageDescriptor, PageFormat, Permissions, Stage};
use crate::result::Result;

const VALID: u64 = 1 << 0;
const TABLE: u64 = 1 << 1;
const WRITABLE: u64 = 1 << 2;
const EXECUTABLE: u64 = 1 << 3;
const USER: u64 = 1 << 4;
const OA_MASK: u64 = 0x000f_ffff_ffff_f000;

pub struct Generic64;

impl PageFormat for Generic64 {
    const LEVEL_COUNT: u8 = 3;

    fn entries_at_level(_level: u8) -> usize {
        512
    }

    fn block_size_at_level(level: u8, _stage: Stage) -> Option<BlockSize> {
        match level {
            0 => Some(BlockSize::Size1G),
            1 => Some(BlockSize::Size2M),
            2 => Some(BlockSize::Size4K),
            _ => None,
        }
    }

    fn index(ia: u64, level: u8) -> usize {
        let shift = 12 + 9 * (2 - level as u32);
        ((ia >> shift) & 0x1ff) as usize
    }

    fn encode_table(child_phys: u64) -> u64 {
        (child_phys & OA_MASK) | VALID | TABLE
    }

    fn encode_leaf(desc: &PageDescriptor, level: u8) -> Result<u64> {
        if Self::block_size_at_level(level, desc.stage) != Some(desc.size) {
            return Err(invalid(format!(
                "generic64 level {} cannot hold a {:?} leaf",
                level, desc.size
            )));
        }
        let mut word = (desc.output_addr & OA_MASK) | VALID;
        if desc.perms.ap & 0b10 != 0 {
            word |= WRITABLE;
        }
        if !desc.perms.xn {
            word |= EXECUTABLE;
        }
        if desc.perms.ap & 0b01 != 0 {
            word |= USER;
        }
        Ok(word)
    }

    fn decode_leaf(word: u64, _level: u8, stage: Stage, input_addr: u64) -> Result<PageDescriptor> {
        if word & VALID == 0 {
            return Err(invalid("decoding an invalid generic64 descriptor"));
        }
        let ap = ((word & WRITABLE != 0) as u8) << 1 | (word & USER != 0) as u8;
        Ok(PageDescriptor {
            input_addr,
            output_addr: word & OA_MASK,
            size: BlockSize::Size4K,
            stage,
            perms: Permissions {
                ap,
                xn: word & EXECUTABLE == 0,
                ..Permissions::default()
            },
            asid_or_vmid: None,
        })
    }

    fn table_target(word: u64) -> u64 {
        word & OA_MASK
    }

    fn is_valid(word: u64) -> bool {
        word & VALID != 0
    }

    fn is_table(word: u64, level: u8) -> bool {
        Self::is_valid(word) && word & TABLE != 0 && level != Self::LEVEL_COUNT - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip_2m() {
        let desc = PageDescriptor {
            input_addr: 0x2000_0000,
            output_addr: 0x8000_0000,
            size: BlockSize::Size2M,
            stage: Stage::Stage1,
            perms: Permissions {
                ap: 0b10,
                xn: false,
                ..Permissions::default()
            },
            asid_or_vmid: None,
        };
        let word = Generic64::encode_leaf(&desc, 1).unwrap();
        let decoded = Generic64::decode_leaf(word, 1, Stage::Stage1, desc.input_addr).unwrap();
        assert_eq!(decoded.output_addr, desc.output_addr);
        assert!(!decoded.perms.xn);
    }
}
