//! Architecture-specific leaf-descriptor encodings.
//!
//! `AddressSpace` (see `crate::address_space`) is generic over a
//! `PageFormat`: the table-walk arithmetic (entry count, per-level
//! shift) and the leaf/table descriptor encoding are the only things
//! that differ between architectures. Everything else — the pool, the
//! map/unmap/split algorithms, the failure semantics — is shared.

pub mod armv5;
pub mod generic64;
pub mod lpae;

use crate::result::{CoreError, Result};

/// Which translation regime a table or descriptor belongs to.
///
/// Stage-1 is guest-controlled (or, on the hypervisor's own tables,
/// hypervisor-controlled); stage-2 is the hypervisor-controlled
/// guest-physical-to-physical mapping. Architectures without hardware
/// stage-2 never construct a `Stage2` `AddressSpace` — see
/// `crate::shadow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Stage1,
    Stage2,
}

/// One of the architectural block sizes a leaf descriptor may cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockSize {
    Size4K,
    Size64K,
    Size1M,
    Size2M,
    Size16M,
    Size1G,
}

impl BlockSize {
    pub const fn bytes(self) -> u64 {
        match self {
            BlockSize::Size4K => 4 * 1024,
            BlockSize::Size64K => 64 * 1024,
            BlockSize::Size1M => 1024 * 1024,
            BlockSize::Size2M => 2 * 1024 * 1024,
            BlockSize::Size16M => 16 * 1024 * 1024,
            BlockSize::Size1G => 1024 * 1024 * 1024,
        }
    }

    pub const fn shift(self) -> u32 {
        self.bytes().trailing_zeros()
    }
}

/// Architecture-specific permission bits a leaf descriptor carries, in
/// their architecture-neutral form. Not every field is meaningful on
/// every format (e.g. `pxn` only exists on LPAE); formats ignore fields
/// that do not apply to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    /// Access permission encoding (format-specific meaning, e.g. AP[2:1]
    /// on LPAE or AP[1:0]+APX on the legacy short-descriptor format).
    pub ap: u8,
    /// Execute-never (stage-1 on AArch32/64, or stage-2 XN).
    pub xn: bool,
    /// Privileged-execute-never (AArch64 stage-1 only).
    pub pxn: bool,
    /// Shareability domain (0 = non-shareable, 2 = outer, 3 = inner).
    pub shareability: u8,
    /// Memory-attribute index (LPAE `AttrIndx`) or TEX+C+B encoded into
    /// a single index by the caller for the legacy format.
    pub mem_attr_idx: u8,
    pub non_secure: bool,
    pub global: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions {
            ap: 0,
            xn: false,
            pxn: false,
            shareability: 0,
            mem_attr_idx: 0,
            non_secure: false,
            global: false,
        }
    }
}

/// A leaf mapping: `spec.md`'s `PageDescriptor` (`cpu_page`) entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor {
    pub input_addr: u64,
    pub output_addr: u64,
    pub size: BlockSize,
    pub stage: Stage,
    pub perms: Permissions,
    /// ASID (stage-1) or VMID (stage-2); `None` for formats that do not
    /// tag the TLB (the generic stand-in format).
    pub asid_or_vmid: Option<u16>,
}

impl PageDescriptor {
    /// `spec.md` §3 invariant: both addresses are aligned to `size`.
    pub fn is_aligned(&self) -> bool {
        let mask = self.size.bytes() - 1;
        self.input_addr & mask == 0 && self.output_addr & mask == 0
    }
}

/// Table-walk arithmetic and leaf/table descriptor encoding for one
/// architecture's page-table format. Implementations are zero-sized;
/// all state lives in the `PageTable`/`PageTablePool` they drive.
pub trait PageFormat {
    /// Number of levels from the root to the finest-grained leaf.
    const LEVEL_COUNT: u8;

    /// Entries in a table at `level`. Not uniform on every format: the
    /// classic ARM short-descriptor L1 table has 4096 entries while its
    /// L2 tables have 256 (`crate::arch::armv5`).
    fn entries_at_level(level: u8) -> usize;

    /// The block size a leaf at `level` covers, if leaves are permitted
    /// at that level for `stage`.
    fn block_size_at_level(level: u8, stage: Stage) -> Option<BlockSize>;

    /// Extract the `level`-indexed chunk of `ia` used to index a table
    /// at that level.
    fn index(ia: u64, level: u8) -> usize;

    /// How many consecutive entries at `level` a leaf of `size` occupies.
    /// 1 for every format except the classic ARM large-page encoding,
    /// where a 64 KiB page is described by 16 replicated 4 KiB-granule
    /// entries (a real ARMv5/v7 architectural quirk, not a simulation
    /// shortcut).
    fn replication(_level: u8, _size: BlockSize) -> usize {
        1
    }

    /// Encode a non-leaf (table) descriptor pointing at `child_phys`.
    fn encode_table(child_phys: u64) -> u64;

    /// Encode a leaf descriptor.
    fn encode_leaf(desc: &PageDescriptor, level: u8) -> Result<u64>;

    /// Decode a leaf descriptor previously produced by `encode_leaf`.
    fn decode_leaf(word: u64, level: u8, stage: Stage, input_addr: u64) -> Result<PageDescriptor>;

    /// Physical address a table descriptor points at.
    fn table_target(word: u64) -> u64;

    fn is_valid(word: u64) -> bool;

    /// True if `word` is a table (non-leaf) descriptor rather than a
    /// leaf or invalid entry.
    fn is_table(word: u64, level: u8) -> bool;
}

pub(crate) fn invalid(msg: impl Into<String>) -> CoreError {
    CoreError::Invalid(msg.into())
}
