//! The format-character tag space
//!
//! Type descriptions produced by the interface compiler are byte sequences of
//! single-byte format characters followed by fixed or variable operands. The
//! byte values here must match the compiler's tag space bit-for-bit; they are
//! the hard compatibility surface of the engine.

// Base types (0x01..=0x10)
pub const BYTE: u8 = 0x01;
pub const CHAR: u8 = 0x02;
pub const SMALL: u8 = 0x03;
pub const USMALL: u8 = 0x04;
pub const WCHAR: u8 = 0x05;
pub const SHORT: u8 = 0x06;
pub const USHORT: u8 = 0x07;
pub const LONG: u8 = 0x08;
pub const ULONG: u8 = 0x09;
pub const FLOAT: u8 = 0x0a;
pub const HYPER: u8 = 0x0b;
pub const DOUBLE: u8 = 0x0c;
pub const ENUM16: u8 = 0x0d;
pub const ENUM32: u8 = 0x0e;
pub const IGNORE: u8 = 0x0f;
pub const ERROR_STATUS_T: u8 = 0x10;

// Pointers
pub const RP: u8 = 0x11;
pub const UP: u8 = 0x12;
pub const OP: u8 = 0x13;
pub const FP: u8 = 0x14;

// Structures
pub const STRUCT: u8 = 0x15;
pub const PSTRUCT: u8 = 0x16;
pub const CSTRUCT: u8 = 0x17;
pub const CPSTRUCT: u8 = 0x18;
pub const CVSTRUCT: u8 = 0x19;
pub const BOGUS_STRUCT: u8 = 0x1a;

// Arrays
pub const CARRAY: u8 = 0x1b;
pub const CVARRAY: u8 = 0x1c;
pub const SMFARRAY: u8 = 0x1d;
pub const LGFARRAY: u8 = 0x1e;
pub const SMVARRAY: u8 = 0x1f;
pub const LGVARRAY: u8 = 0x20;
pub const BOGUS_ARRAY: u8 = 0x21;

// Strings
pub const C_CSTRING: u8 = 0x22;
pub const C_BSTRING: u8 = 0x23;
pub const C_SSTRING: u8 = 0x24;
pub const C_WSTRING: u8 = 0x25;
pub const CSTRING: u8 = 0x26;
pub const BSTRING: u8 = 0x27;
pub const SSTRING: u8 = 0x28;
pub const WSTRING: u8 = 0x29;

// Unions
pub const ENCAPSULATED_UNION: u8 = 0x2a;
pub const NON_ENCAPSULATED_UNION: u8 = 0x2b;

pub const BYTE_COUNT_POINTER: u8 = 0x2c;
pub const TRANSMIT_AS: u8 = 0x2d;
pub const REPRESENT_AS: u8 = 0x2e;
pub const IP: u8 = 0x2f;

// Binding handles
pub const BIND_CONTEXT: u8 = 0x30;
pub const BIND_GENERIC: u8 = 0x31;
pub const BIND_PRIMITIVE: u8 = 0x32;
pub const AUTO_HANDLE: u8 = 0x33;
pub const CALLBACK_HANDLE: u8 = 0x34;

// Complex-struct member stream directives
pub const POINTER: u8 = 0x36;
pub const ALIGNM2: u8 = 0x37;
pub const ALIGNM4: u8 = 0x38;
pub const ALIGNM8: u8 = 0x39;
pub const STRUCTPAD1: u8 = 0x3d;
pub const STRUCTPAD2: u8 = 0x3e;
pub const STRUCTPAD3: u8 = 0x3f;
pub const STRUCTPAD4: u8 = 0x40;
pub const STRUCTPAD5: u8 = 0x41;
pub const STRUCTPAD6: u8 = 0x42;
pub const STRUCTPAD7: u8 = 0x43;

pub const STRING_SIZED: u8 = 0x44;

// Embedded-pointer repeat groups
pub const NO_REPEAT: u8 = 0x46;
pub const FIXED_REPEAT: u8 = 0x47;
pub const VARIABLE_REPEAT: u8 = 0x48;
pub const FIXED_OFFSET: u8 = 0x49;
pub const VARIABLE_OFFSET: u8 = 0x4a;
pub const PP: u8 = 0x4b;
pub const EMBEDDED_COMPLEX: u8 = 0x4c;

// Correlation operators
pub const DEREFERENCE: u8 = 0x54;
pub const DIV_2: u8 = 0x55;
pub const MULT_2: u8 = 0x56;
pub const ADD_1: u8 = 0x57;
pub const SUB_1: u8 = 0x58;
pub const CALLBACK: u8 = 0x59;

pub const CONSTANT_IID: u8 = 0x5a;
pub const END: u8 = 0x5b;
pub const PAD: u8 = 0x5c;

pub const USER_MARSHAL: u8 = 0xb4;

// Pointer attribute flags (second byte of a pointer description)
pub const P_ALLOCALLNODES: u8 = 0x01;
pub const P_DONTFREE: u8 = 0x02;
pub const P_ONSTACK: u8 = 0x04;
pub const P_SIMPLEPOINTER: u8 = 0x08;
pub const P_DEREF: u8 = 0x10;

// Correlation anchor classes (high nibble of a correlation descriptor)
pub const NORMAL_CONFORMANCE: u8 = 0x00;
pub const POINTER_CONFORMANCE: u8 = 0x10;
pub const TOP_LEVEL_CONFORMANCE: u8 = 0x20;
pub const CONSTANT_CONFORMANCE: u8 = 0x40;
pub const TOP_LEVEL_MULTID_CONFORMANCE: u8 = 0x80;

/// Base types carried by a single format character.
///
/// enum16 is the one width-converting member: 16 bits on the wire, a full
/// 32-bit integer in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseType {
    Byte,
    Char,
    Small,
    USmall,
    WChar,
    Short,
    UShort,
    Long,
    ULong,
    Float,
    Hyper,
    Double,
    Enum16,
    Enum32,
    ErrorStatus,
}

impl BaseType {
    pub fn from_fc(b: u8) -> Option<BaseType> {
        Some(match b {
            BYTE => BaseType::Byte,
            CHAR => BaseType::Char,
            SMALL => BaseType::Small,
            USMALL => BaseType::USmall,
            WCHAR => BaseType::WChar,
            SHORT => BaseType::Short,
            USHORT => BaseType::UShort,
            LONG => BaseType::Long,
            ULONG => BaseType::ULong,
            FLOAT => BaseType::Float,
            HYPER => BaseType::Hyper,
            DOUBLE => BaseType::Double,
            ENUM16 => BaseType::Enum16,
            ENUM32 => BaseType::Enum32,
            ERROR_STATUS_T => BaseType::ErrorStatus,
            _ => return None,
        })
    }

    pub fn fc(self) -> u8 {
        match self {
            BaseType::Byte => BYTE,
            BaseType::Char => CHAR,
            BaseType::Small => SMALL,
            BaseType::USmall => USMALL,
            BaseType::WChar => WCHAR,
            BaseType::Short => SHORT,
            BaseType::UShort => USHORT,
            BaseType::Long => LONG,
            BaseType::ULong => ULONG,
            BaseType::Float => FLOAT,
            BaseType::Hyper => HYPER,
            BaseType::Double => DOUBLE,
            BaseType::Enum16 => ENUM16,
            BaseType::Enum32 => ENUM32,
            BaseType::ErrorStatus => ERROR_STATUS_T,
        }
    }

    /// Octets occupied on the wire.
    pub fn wire_size(self) -> u32 {
        match self {
            BaseType::Byte | BaseType::Char | BaseType::Small | BaseType::USmall => 1,
            BaseType::WChar | BaseType::Short | BaseType::UShort | BaseType::Enum16 => 2,
            BaseType::Long | BaseType::ULong | BaseType::Enum32 | BaseType::ErrorStatus | BaseType::Float => 4,
            BaseType::Hyper | BaseType::Double => 8,
        }
    }

    /// Natural wire alignment, equal to the wire size.
    pub fn wire_align(self) -> u32 {
        self.wire_size()
    }

    /// Bytes occupied in the in-memory representation.
    pub fn mem_size(self) -> u32 {
        match self {
            BaseType::Enum16 => 4,
            other => other.wire_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum16_width_conversion() {
        assert_eq!(BaseType::Enum16.wire_size(), 2);
        assert_eq!(BaseType::Enum16.mem_size(), 4);
    }

    #[test]
    fn base_type_tags_round_trip() {
        for b in 0x01..=0x10u8 {
            if b == IGNORE {
                assert!(BaseType::from_fc(b).is_none());
            } else {
                assert!(BaseType::from_fc(b).is_some(), "tag {b:#04x}");
            }
        }
        assert!(BaseType::from_fc(RP).is_none());
    }
}
