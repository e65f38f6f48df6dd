//! Raw format-string access
//!
//! A format string is an immutable byte sequence produced by the interface
//! compiler, owned by the stub descriptor for the life of the process. All
//! multi-byte operands are little-endian. Offsets to shared sub-descriptions
//! are signed 16-bit values measured from the position of the offset field
//! itself, so descriptions may point forward or backward.

use bytes::Bytes;

use crate::error::{Fault, Result};

/// An immutable, externally produced type-format string.
#[derive(Debug, Clone)]
pub struct FormatString {
    bytes: Bytes,
}

impl FormatString {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        self.bytes
            .get(offset)
            .copied()
            .ok_or(Fault::TruncatedFormat { offset, what: "format character" })
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        let b = self
            .bytes
            .get(offset..offset + 2)
            .ok_or(Fault::TruncatedFormat { offset, what: "16-bit operand" })?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16_at(&self, offset: usize) -> Result<i16> {
        Ok(self.u16_at(offset)? as i16)
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        let b = self
            .bytes
            .get(offset..offset + 4)
            .ok_or(Fault::TruncatedFormat { offset, what: "32-bit operand" })?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Resolve a signed relative offset field into an absolute position.
    ///
    /// The displacement is measured from the offset field itself.
    pub fn rel_target(&self, offset: usize) -> Result<usize> {
        let disp = self.i16_at(offset)? as isize;
        let target = offset as isize + disp;
        if target < 0 || target as usize >= self.bytes.len() {
            return Err(Fault::InvalidFormat { offset, reason: "relative offset out of bounds" });
        }
        Ok(target as usize)
    }
}

impl From<&'static [u8]> for FormatString {
    fn from(b: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(b))
    }
}

impl From<Vec<u8>> for FormatString {
    fn from(b: Vec<u8>) -> Self {
        Self::new(Bytes::from(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_reads() {
        let fs = FormatString::from(vec![0x1b, 0x01, 0x02, 0x00, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(fs.u8_at(0).unwrap(), 0x1b);
        assert_eq!(fs.u16_at(2).unwrap(), 2);
        assert_eq!(fs.u32_at(4).unwrap(), 0xffff_ffff);
        assert!(fs.u32_at(6).is_err());
    }

    #[test]
    fn relative_offsets_forward_and_backward() {
        // offset field at 4 pointing back to 0, offset field at 6 pointing to 8
        let fs = FormatString::from(vec![0x15, 0, 0, 0, 0xfc, 0xff, 0x02, 0x00, 0x08]);
        assert_eq!(fs.rel_target(4).unwrap(), 0);
        assert_eq!(fs.rel_target(6).unwrap(), 8);
    }

    #[test]
    fn relative_offset_out_of_bounds() {
        let fs = FormatString::from(vec![0x00, 0x80, 0x00, 0x00]); // -32768
        assert!(fs.rel_target(0).is_err());
    }
}
