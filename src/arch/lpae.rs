//! ARMv8-A VMSAv8-64 LPAE format (4 KiB granule, 4-level walk).
//!
//! Bit layout is bit-for-bit per `spec.md` §6 ("Stage-2 descriptors
//! follow the ARM VMSAv8-64 LPAE format"): valid/table bits at [0:1],
//! output address at [12:47], memory-attribute index at [2:4],
//! shareability at [8:9], access-permission at [6:7], access-flag at
//! [10], execute-never at [53:54], contiguous hint at [52]. The same
//! layout is used for the hypervisor's own stage-1 tables; nothing in
//! the spec gives a different stage-1 layout for AArch64.
//!
//! Grounded on the level/shift progression in
//! `examples/original_source/arch/arm/cpu/common/mmu_lpae.c`: 9 bits of
//! index per level, root at level 0 covering bits [47:39], a 4 KiB leaf
//! at level 3.

use super::{invalid, BlockSize, PageDescriptor, PageFormat, Permissions, Stage};
use crate::result::Result;

const VALID: u64 = 1 << 0;
const TABLE: u64 = 1 << 1;
const MEM_ATTR_SHIFT: u32 = 2;
const MEM_ATTR_MASK: u64 = 0b111 << MEM_ATTR_SHIFT;
const AP_SHIFT: u32 = 6;
const AP_MASK: u64 = 0b11 << AP_SHIFT;
const SH_SHIFT: u32 = 8;
const SH_MASK: u64 = 0b11 << SH_SHIFT;
const AF: u64 = 1 << 10;
const CONTIGUOUS: u64 = 1 << 52;
const XN_SHIFT: u32 = 53;
const XN_MASK: u64 = 0b11 << XN_SHIFT;
const OA_MASK: u64 = 0x0000_ffff_ffff_f000;

pub struct Lpae;

impl PageFormat for Lpae {
    const LEVEL_COUNT: u8 = 4;

    fn entries_at_level(_level: u8) -> usize {
        512
    }

    fn block_size_at_level(level: u8, _stage: Stage) -> Option<BlockSize> {
        match level {
            1 => Some(BlockSize::Size1G),
            2 => Some(BlockSize::Size2M),
            3 => Some(BlockSize::Size4K),
            _ => None,
        }
    }

    fn index(ia: u64, level: u8) -> usize {
        let shift = 12 + 9 * (3 - level as u32);
        ((ia >> shift) & 0x1ff) as usize
    }

    fn encode_table(child_phys: u64) -> u64 {
        (child_phys & OA_MASK) | VALID | TABLE
    }

    fn encode_leaf(desc: &PageDescriptor, level: u8) -> Result<u64> {
        if Self::block_size_at_level(level, desc.stage) != Some(desc.size) {
            return Err(invalid(format!(
                "LPAE level {} cannot hold a {:?} leaf",
                level, desc.size
            )));
        }
        let mut word = desc.output_addr & OA_MASK;
        word |= VALID;
        // A leaf at the final level is a "page" descriptor (bit 1 set);
        // a block descriptor at an intermediate level leaves bit 1 clear.
        if level == Self::LEVEL_COUNT - 1 {
            word |= TABLE;
        }
        word |= (u64::from(desc.perms.mem_attr_idx) << MEM_ATTR_SHIFT) & MEM_ATTR_MASK;
        word |= (u64::from(desc.perms.ap) << AP_SHIFT) & AP_MASK;
        word |= (u64::from(desc.perms.shareability) << SH_SHIFT) & SH_MASK;
        word |= AF;
        if desc.perms.xn {
            word |= 1 << XN_SHIFT;
        }
        if desc.perms.pxn {
            word |= 1 << (XN_SHIFT + 1);
        }
        Ok(word)
    }

    fn decode_leaf(word: u64, _level: u8, stage: Stage, input_addr: u64) -> Result<PageDescriptor> {
        if word & VALID == 0 {
            return Err(invalid("decoding an invalid LPAE descriptor"));
        }
        let perms = Permissions {
            ap: ((word & AP_MASK) >> AP_SHIFT) as u8,
            xn: (word >> XN_SHIFT) & 1 != 0,
            pxn: (word >> (XN_SHIFT + 1)) & 1 != 0,
            shareability: ((word & SH_MASK) >> SH_SHIFT) as u8,
            mem_attr_idx: ((word & MEM_ATTR_MASK) >> MEM_ATTR_SHIFT) as u8,
            non_secure: false,
            global: word & AF != 0,
        };
        Ok(PageDescriptor {
            input_addr,
            output_addr: word & OA_MASK,
            // Caller fills in the real size from the level it read this
            // entry at; placeholder here since the word alone does not
            // encode which level it came from.
            size: BlockSize::Size4K,
            stage,
            perms,
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
    use crate::arch::Permissions;

    #[test]
    fn leaf_round_trip_1g() {
        let desc = PageDescriptor {
            input_addr: 0x4000_0000,
            output_addr: 0x8000_0000,
            size: BlockSize::Size1G,
            stage: Stage::Stage2,
            perms: Permissions {
                ap: 0b01,
                mem_attr_idx: 3,
                shareability: 2,
                ..Permissions::default()
            },
            asid_or_vmid: None,
        };
        let word = Lpae::encode_leaf(&desc, 1).unwrap();
        assert!(Lpae::is_valid(word));
        assert!(!Lpae::is_table(word, 1));
        let decoded = Lpae::decode_leaf(word, 1, Stage::Stage2, desc.input_addr).unwrap();
        assert_eq!(decoded.output_addr, desc.output_addr);
        assert_eq!(decoded.perms.ap, 0b01);
        assert_eq!(decoded.perms.mem_attr_idx, 3);
    }

    #[test]
    fn wrong_level_for_size_is_rejected() {
        let desc = PageDescriptor {
            input_addr: 0,
            output_addr: 0,
            size: BlockSize::Size1G,
            stage: Stage::Stage1,
            perms: Permissions::default(),
            asid_or_vmid: None,
        };
        assert!(Lpae::encode_leaf(&desc, 3).is_err());
    }
}
