//! Legacy ARMv5 first-level section / second-level coarse-page-table
//! format, used by the hypervisor's own stage-1 tables and the
//! per-VCPU shadow tables (`crate::shadow`) on hardware without stage-2.
//!
//! Bit layout per `spec.md` §6: first-level section entry — type in
//! [0:1]=0b10, domain in [5:8], access-permission in [10:11], B/C in
//! [2:3], output base in [20:31]. Coarse page-table entry: type
//! [0:1]=0b01, L2 table physical address in [10:31].
//!
//! Grounded on `examples/original_source/arch/arm/cpu/arm32/cpu_mmu_v5.c`
//! (`TTBL_L1TBL_TTE_*` field layout, `cpu_mmu_get_page`/`cpu_mmu_map_page2`).

use super::{invalid, BlockSize, PageDescriptor, PageFormat, Permissions, Stage};
use crate::result::Result;

const L1_ENTRY_COUNT: usize = 4096;
const L2_ENTRY_COUNT: usize = 256;

const TYPE_MASK: u64 = 0b11;
const TYPE_FAULT: u64 = 0b00;
const TYPE_COARSE: u64 = 0b01;
const TYPE_SECTION: u64 = 0b10;

const L1_DOMAIN_SHIFT: u32 = 5;
const L1_DOMAIN_MASK: u64 = 0b1111 << L1_DOMAIN_SHIFT;
const L1_AP_SHIFT: u32 = 10;
const L1_AP_MASK: u64 = 0b11 << L1_AP_SHIFT;
const L1_BC_SHIFT: u32 = 2;
const L1_BC_MASK: u64 = 0b11 << L1_BC_SHIFT;
const L1_SECTION_BASE_MASK: u64 = 0xfff0_0000;
const L1_COARSE_BASE_MASK: u64 = 0xffff_fc00;

const L2_AP_SHIFT: u32 = 4;
const L2_AP_MASK: u64 = 0b11 << L2_AP_SHIFT;
const L2_BC_SHIFT: u32 = 2;
const L2_BC_MASK: u64 = 0b11 << L2_BC_SHIFT;
const L2_SMALL_PAGE_TYPE: u64 = 0b10;
const L2_SMALL_PAGE_BASE_MASK: u64 = 0xffff_f000;

pub struct ArmV5Short;

impl ArmV5Short {
    fn decode_bc(perms: &Permissions) -> u64 {
        // mem_attr_idx packs B (bit0) / C (bit1) for this format, chosen
        // by the caller instead of the richer LPAE attribute-index table.
        u64::from(perms.mem_attr_idx) & 0b11
    }
}

impl PageFormat for ArmV5Short {
    const LEVEL_COUNT: u8 = 2;

    fn entries_at_level(level: u8) -> usize {
        match level {
            0 => L1_ENTRY_COUNT,
            _ => L2_ENTRY_COUNT,
        }
    }

    fn block_size_at_level(level: u8, _stage: Stage) -> Option<BlockSize> {
        match level {
            0 => Some(BlockSize::Size1M),
            1 => Some(BlockSize::Size4K),
            _ => None,
        }
    }

    fn index(ia: u64, level: u8) -> usize {
        match level {
            0 => ((ia >> 20) & 0xfff) as usize,
            _ => ((ia >> 12) & 0xff) as usize,
        }
    }

    fn encode_table(child_phys: u64) -> u64 {
        (child_phys & L1_COARSE_BASE_MASK) | TYPE_COARSE
    }

    fn encode_leaf(desc: &PageDescriptor, level: u8) -> Result<u64> {
        if Self::block_size_at_level(level, desc.stage) != Some(desc.size) {
            return Err(invalid(format!(
                "ARMv5 level {} cannot hold a {:?} leaf",
                level, desc.size
            )));
        }
        match level {
            0 => {
                let mut word = desc.output_addr & L1_SECTION_BASE_MASK;
                word |= TYPE_SECTION;
                word |= (u64::from(desc.perms.ap) << L1_AP_SHIFT) & L1_AP_MASK;
                // domain left at 0 (the background domain); Permissions
                // does not model per-section domains.
                word |= (Self::decode_bc(&desc.perms) << L1_BC_SHIFT) & L1_BC_MASK;
                Ok(word)
            }
            _ => {
                let mut word = desc.output_addr & L2_SMALL_PAGE_BASE_MASK;
                word |= L2_SMALL_PAGE_TYPE;
                word |= (u64::from(desc.perms.ap) << L2_AP_SHIFT) & L2_AP_MASK;
                word |= (Self::decode_bc(&desc.perms) << L2_BC_SHIFT) & L2_BC_MASK;
                Ok(word)
            }
        }
    }

    fn decode_leaf(word: u64, level: u8, stage: Stage, input_addr: u64) -> Result<PageDescriptor> {
        match level {
            0 => {
                if word & TYPE_MASK != TYPE_SECTION {
                    return Err(invalid("not a section descriptor"));
                }
                let perms = Permissions {
                    ap: ((word & L1_AP_MASK) >> L1_AP_SHIFT) as u8,
                    mem_attr_idx: ((word & L1_BC_MASK) >> L1_BC_SHIFT) as u8,
                    ..Permissions::default()
                };
                Ok(PageDescriptor {
                    input_addr,
                    output_addr: word & L1_SECTION_BASE_MASK,
                    size: BlockSize::Size1M,
                    stage,
                    perms,
                    asid_or_vmid: None,
                })
            }
            _ => {
                if word & TYPE_MASK != L2_SMALL_PAGE_TYPE {
                    return Err(invalid("not a small-page descriptor"));
                }
                let perms = Permissions {
                    ap: ((word & L2_AP_MASK) >> L2_AP_SHIFT) as u8,
                    mem_attr_idx: ((word & L2_BC_MASK) >> L2_BC_SHIFT) as u8,
                    ..Permissions::default()
                };
                Ok(PageDescriptor {
                    input_addr,
                    output_addr: word & L2_SMALL_PAGE_BASE_MASK,
                    size: BlockSize::Size4K,
                    stage,
                    perms,
                    asid_or_vmid: None,
                })
            }
        }
    }

    fn table_target(word: u64) -> u64 {
        word & L1_COARSE_BASE_MASK
    }

    fn is_valid(word: u64) -> bool {
        word & TYPE_MASK != TYPE_FAULT
    }

    fn is_table(word: u64, level: u8) -> bool {
        level == 0 && word & TYPE_MASK == TYPE_COARSE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_round_trip() {
        let desc = PageDescriptor {
            input_addr: 0x4000_0000,
            output_addr: 0x4000_0000,
            size: BlockSize::Size1M,
            stage: Stage::Stage1,
            perms: Permissions {
                ap: 0b11,
                ..Permissions::default()
            },
            asid_or_vmid: None,
        };
        let word = ArmV5Short::encode_leaf(&desc, 0).unwrap();
        assert!(ArmV5Short::is_valid(word));
        assert!(!ArmV5Short::is_table(word, 0));
        let decoded = ArmV5Short::decode_leaf(word, 0, Stage::Stage1, desc.input_addr).unwrap();
        assert_eq!(decoded.output_addr, desc.output_addr);
        assert_eq!(decoded.perms.ap, 0b11);
    }

    #[test]
    fn coarse_table_points_at_child() {
        let word = ArmV5Short::encode_table(0x1234_0000);
        assert!(ArmV5Short::is_table(word, 0));
        assert_eq!(ArmV5Short::table_target(word), 0x1234_0000);
    }
}
