use std::fmt;

/// Error taxonomy the core surfaces to its callers (scheduler, device
/// emulators, guest-fault handlers). Each variant carries just enough
/// context to log something useful; callers match on the kind rather
/// than parsing a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A pool's free list was empty when `alloc` was attempted.
    OutOfMemory,
    /// Bad size, bad stage, or unaligned address; a bug in the caller.
    Invalid(String),
    /// `get_page` (or an internal table walk) found no mapping.
    NotFound,
    /// `map_page` would overlap an existing mapping.
    Conflict { ia: u64 },
    /// A split direction or fault class the core does not implement.
    Unimplemented(&'static str),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::OutOfMemory => write!(f, "page table pool exhausted"),
            CoreError::Invalid(msg) => write!(f, "invalid argument: {}", msg),
            CoreError::NotFound => write!(f, "no mapping for the given address"),
            CoreError::Conflict { ia } => {
                write!(f, "mapping already exists for ia={:#x}", ia)
            }
            CoreError::Unimplemented(what) => write!(f, "not implemented: {}", what),
        }
    }
}

impl std::error::Error for CoreError {}

pub type Result<T> = std::result::Result<T, CoreError>;
