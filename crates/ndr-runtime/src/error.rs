//! NDR fault types
//!
//! Any failure inside a marshalling pass unwinds the whole call; the engine
//! performs no partial-result cleanup of its own. At the RPC boundary a fault
//! is surfaced as a numeric status code (see [`Fault::fault_status`]).

use thiserror::Error;

/// Numeric fault statuses surfaced to the RPC layer.
pub const RPC_S_INTERNAL_ERROR: u32 = 1766;
pub const RPC_S_OUT_OF_MEMORY: u32 = 14;
pub const RPC_X_NULL_REF_POINTER: u32 = 1780;
pub const RPC_X_ENUM_VALUE_OUT_OF_RANGE: u32 = 1781;
pub const RPC_X_BAD_STUB_DATA: u32 = 1783;

/// NDR marshalling faults
#[derive(Debug, Error)]
pub enum Fault {
    /// A specific shape was required but the description carried another tag
    #[error("bad stub data: expected {expected}, found format character {found:#04x}")]
    UnexpectedTag { expected: &'static str, found: u8 },

    /// Wire buffer exhausted on the read path
    #[error("buffer underrun: needed {needed} bytes at offset {at}, have {have}")]
    BufferUnderrun { needed: usize, have: usize, at: usize },

    /// Wire buffer capacity exceeded on the write path
    #[error("buffer overrun: {written} bytes written into a {capacity}-byte buffer")]
    BufferOverrun { written: usize, capacity: usize },

    /// Format string ended inside an operand
    #[error("truncated format string: {what} at offset {offset}")]
    TruncatedFormat { offset: usize, what: &'static str },

    /// Structurally invalid format string (desynchronized streams, bad targets)
    #[error("invalid format string at offset {offset}: {reason}")]
    InvalidFormat { offset: usize, reason: &'static str },

    /// Ref pointers must never be null
    #[error("null ref pointer")]
    NullRefPointer,

    /// enum16 values are 16 bits on the wire
    #[error("enum value out of range: {0:#x}")]
    EnumOutOfRange(u32),

    /// Union discriminant matched no arm and the description declares no default
    #[error("union discriminant {0:#x} matched no arm and no default is declared")]
    NoUnionDefault(u32),

    /// Transmitted counts are inconsistent
    #[error("conformance mismatch: max_count={max_count}, offset={offset}, actual_count={actual_count}")]
    ConformanceMismatch { max_count: u32, offset: u32, actual_count: u32 },

    /// A string header carried a non-zero variance offset
    #[error("invalid string: non-zero variance offset {0}")]
    StringOffset(u32),

    /// String longer than its declared bound
    #[error("string of {len} characters exceeds declared bound {bound}")]
    StringTooLong { len: u32, bound: u32 },

    /// Out-of-bounds or null access to the in-memory representation
    #[error("invalid memory access: ptr={ptr:#x} len={len}")]
    MemoryAccess { ptr: u32, len: u32 },

    /// The injected allocator refused the request
    #[error("allocation of {0} bytes failed")]
    AllocationFailed(u32),

    /// No expression evaluator registered at the requested index
    #[error("no expression evaluator at index {0}")]
    NoExprEval(u16),

    /// No user-marshal routine registered at the requested index
    #[error("no user-marshal routines at index {0}")]
    NoUserMarshaller(u16),

    /// A user-marshal routine reported a failure
    #[error("user-marshal routine failed: {0}")]
    UserMarshal(String),

    /// Recognized but unsupported pointer discipline (full pointers)
    #[error("unsupported pointer type {0:#04x}")]
    UnsupportedPointer(u8),
}

impl Fault {
    /// The status code this fault carries across the RPC boundary.
    pub fn fault_status(&self) -> u32 {
        match self {
            Fault::NullRefPointer => RPC_X_NULL_REF_POINTER,
            Fault::EnumOutOfRange(_) => RPC_X_ENUM_VALUE_OUT_OF_RANGE,
            Fault::AllocationFailed(_) => RPC_S_OUT_OF_MEMORY,
            Fault::UnexpectedTag { .. }
            | Fault::UnsupportedPointer(_)
            | Fault::BufferUnderrun { .. }
            | Fault::BufferOverrun { .. }
            | Fault::ConformanceMismatch { .. }
            | Fault::StringOffset(_)
            | Fault::StringTooLong { .. }
            | Fault::NoUnionDefault(_) => RPC_X_BAD_STUB_DATA,
            _ => RPC_S_INTERNAL_ERROR,
        }
    }
}

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, Fault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_status_mapping() {
        assert_eq!(Fault::NullRefPointer.fault_status(), RPC_X_NULL_REF_POINTER);
        assert_eq!(Fault::EnumOutOfRange(0x10000).fault_status(), RPC_X_ENUM_VALUE_OUT_OF_RANGE);
        assert_eq!(
            Fault::BufferUnderrun { needed: 4, have: 0, at: 0 }.fault_status(),
            RPC_X_BAD_STUB_DATA
        );
        assert_eq!(Fault::NoExprEval(3).fault_status(), RPC_S_INTERNAL_ERROR);
    }
}
