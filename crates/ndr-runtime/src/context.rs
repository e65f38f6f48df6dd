//! Per-pass cursor state
//!
//! Each of the five passes threads its own context through the recursive
//! walk: an append cursor for marshalling, a bounds-checked read cursor for
//! unmarshalling, a running total for buffer sizing, a read cursor plus
//! allocation accumulator for memory sizing. The free pass needs no wire
//! state at all and works on the bare [`CallEnv`](crate::stub::CallEnv).
//!
//! Cursor overruns are hard faults on both paths. Alignment is applied
//! additively, never skipped: a cursor is only ever rounded up.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{Fault, Result};
use crate::stub::CallEnv;

/// The negotiated wire byte order.
///
/// The in-memory representation is always little-endian; conversion happens
/// at the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn put_u16(self, buf: &mut BytesMut, v: u16) {
        match self {
            ByteOrder::Little => buf.put_u16_le(v),
            ByteOrder::Big => buf.put_u16(v),
        }
    }

    pub fn put_u32(self, buf: &mut BytesMut, v: u32) {
        match self {
            ByteOrder::Little => buf.put_u32_le(v),
            ByteOrder::Big => buf.put_u32(v),
        }
    }

    pub fn put_u64(self, buf: &mut BytesMut, v: u64) {
        match self {
            ByteOrder::Little => buf.put_u64_le(v),
            ByteOrder::Big => buf.put_u64(v),
        }
    }

    pub fn get_u16(self, b: &[u8]) -> u16 {
        let b: [u8; 2] = [b[0], b[1]];
        match self {
            ByteOrder::Little => u16::from_le_bytes(b),
            ByteOrder::Big => u16::from_be_bytes(b),
        }
    }

    pub fn get_u32(self, b: &[u8]) -> u32 {
        let b: [u8; 4] = [b[0], b[1], b[2], b[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(b),
            ByteOrder::Big => u32::from_be_bytes(b),
        }
    }

    pub fn get_u64(self, b: &[u8]) -> u64 {
        let b: [u8; 8] = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        match self {
            ByteOrder::Little => u64::from_le_bytes(b),
            ByteOrder::Big => u64::from_be_bytes(b),
        }
    }

    pub fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

/// Padding needed to bring `position` to `alignment`.
#[inline]
pub fn align_padding(position: usize, alignment: u32) -> usize {
    if alignment <= 1 {
        return 0;
    }
    let rem = position % alignment as usize;
    if rem == 0 {
        0
    } else {
        alignment as usize - rem
    }
}

/// Marshalling context: appends to the wire buffer.
pub struct MarshalCtx<'a> {
    pub env: CallEnv<'a>,
    pub buf: BytesMut,
    /// Wire position of the most recently copied flat body; the base for
    /// embedded-pointer referent IDs
    pub mark: usize,
    capacity: Option<usize>,
}

impl<'a> MarshalCtx<'a> {
    pub fn new(env: CallEnv<'a>) -> Self {
        Self { env, buf: BytesMut::new(), mark: 0, capacity: None }
    }

    /// A declared buffer capacity, typically from a prior buffer-size pass.
    /// Exceeding it faults.
    pub fn with_capacity(env: CallEnv<'a>, capacity: usize) -> Self {
        Self { env, buf: BytesMut::with_capacity(capacity), mark: 0, capacity: Some(capacity) }
    }

    pub fn pos(&self) -> usize {
        self.buf.len()
    }

    fn ensure(&self, additional: usize) -> Result<()> {
        if let Some(cap) = self.capacity {
            let written = self.buf.len() + additional;
            if written > cap {
                return Err(Fault::BufferOverrun { written, capacity: cap });
            }
        }
        Ok(())
    }

    pub fn align(&mut self, alignment: u32) -> Result<()> {
        let pad = align_padding(self.buf.len(), alignment);
        self.ensure(pad)?;
        for _ in 0..pad {
            self.buf.put_u8(0);
        }
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure(bytes.len())?;
        self.buf.put_slice(bytes);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.ensure(1)?;
        self.buf.put_u8(v);
        Ok(())
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.ensure(2)?;
        self.env.order.put_u16(&mut self.buf, v);
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.ensure(4)?;
        self.env.order.put_u32(&mut self.buf, v);
        Ok(())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.ensure(8)?;
        self.env.order.put_u64(&mut self.buf, v);
        Ok(())
    }

    /// Rewrite a 4-byte word already in the buffer; embedded pointer IDs
    /// land over the copied body image rather than at the cursor.
    pub fn overwrite_u32(&mut self, at: usize, v: u32) -> Result<()> {
        let end = at + 4;
        if end > self.buf.len() {
            return Err(Fault::BufferOverrun { written: end, capacity: self.buf.len() });
        }
        self.buf[at..end].copy_from_slice(&self.env.order.u32_bytes(v));
        Ok(())
    }

    /// The finished wire image.
    pub fn finish(self) -> Bytes {
        trace!(len = self.buf.len(), "marshal complete");
        self.buf.freeze()
    }
}

/// Unmarshalling context: bounds-checked reads from a borrowed wire buffer.
pub struct UnmarshalCtx<'a> {
    pub env: CallEnv<'a>,
    wire: &'a [u8],
    pub pos: usize,
    /// Wire position of the most recently copied flat body
    pub mark: usize,
}

impl<'a> UnmarshalCtx<'a> {
    pub fn new(env: CallEnv<'a>, wire: &'a [u8]) -> Self {
        Self { env, wire, pos: 0, mark: 0 }
    }

    pub fn wire(&self) -> &'a [u8] {
        self.wire
    }

    pub fn remaining(&self) -> usize {
        self.wire.len() - self.pos
    }

    pub fn align(&mut self, alignment: u32) -> Result<()> {
        let pad = align_padding(self.pos, alignment);
        if self.pos + pad > self.wire.len() {
            return Err(Fault::BufferUnderrun {
                needed: pad,
                have: self.remaining(),
                at: self.pos,
            });
        }
        self.pos += pad;
        Ok(())
    }

    /// Consume `len` octets. The returned slice borrows the wire buffer, not
    /// the context.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.wire.len() {
            return Err(Fault::BufferUnderrun {
                needed: len,
                have: self.remaining(),
                at: self.pos,
            });
        }
        let out = &self.wire[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let order = self.env.order;
        Ok(order.get_u16(self.take(2)?))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let order = self.env.order;
        Ok(order.get_u32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let order = self.env.order;
        Ok(order.get_u64(self.take(8)?))
    }

    /// Read a word at an absolute position without moving the cursor.
    pub fn peek_u32_at(&self, at: usize) -> Result<u32> {
        if at + 4 > self.wire.len() {
            return Err(Fault::BufferUnderrun { needed: 4, have: self.wire.len().saturating_sub(at), at });
        }
        Ok(self.env.order.get_u32(&self.wire[at..at + 4]))
    }
}

/// Buffer-size context: a pure running total, no wire access.
pub struct SizeCtx<'a> {
    pub env: CallEnv<'a>,
    pub length: usize,
}

impl<'a> SizeCtx<'a> {
    pub fn new(env: CallEnv<'a>) -> Self {
        Self { env, length: 0 }
    }

    pub fn align(&mut self, alignment: u32) {
        self.length += align_padding(self.length, alignment);
    }

    pub fn add(&mut self, octets: usize) {
        self.length += octets;
    }
}

/// Memory-size context: reads the wire to discover counts, accumulates the
/// allocation estimate. Read-only on memory.
pub struct MemSizeCtx<'a> {
    pub env: CallEnv<'a>,
    wire: &'a [u8],
    pub pos: usize,
    /// Wire position of the most recently scanned flat body
    pub mark: usize,
    pub memory_size: u32,
}

impl<'a> MemSizeCtx<'a> {
    pub fn new(env: CallEnv<'a>, wire: &'a [u8]) -> Self {
        Self { env, wire, pos: 0, mark: 0, memory_size: 0 }
    }

    /// A scan starting mid-buffer; alignment stays relative to the buffer
    /// start.
    pub fn with_pos(env: CallEnv<'a>, wire: &'a [u8], pos: usize) -> Self {
        Self { env, wire, pos, mark: pos, memory_size: 0 }
    }

    pub fn align(&mut self, alignment: u32) -> Result<()> {
        let pad = align_padding(self.pos, alignment);
        if self.pos + pad > self.wire.len() {
            return Err(Fault::BufferUnderrun {
                needed: pad,
                have: self.wire.len() - self.pos,
                at: self.pos,
            });
        }
        self.pos += pad;
        Ok(())
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        if self.pos + len > self.wire.len() {
            return Err(Fault::BufferUnderrun {
                needed: len,
                have: self.wire.len() - self.pos,
                at: self.pos,
            });
        }
        self.pos += len;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        if self.pos >= self.wire.len() {
            return Err(Fault::BufferUnderrun { needed: 1, have: 0, at: self.pos });
        }
        let v = self.wire[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        if self.pos + 2 > self.wire.len() {
            return Err(Fault::BufferUnderrun {
                needed: 2,
                have: self.wire.len() - self.pos,
                at: self.pos,
            });
        }
        let v = self.env.order.get_u16(&self.wire[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(v)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.wire.len() {
            return Err(Fault::BufferUnderrun {
                needed: 4,
                have: self.wire.len() - self.pos,
                at: self.pos,
            });
        }
        let v = self.env.order.get_u32(&self.wire[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    pub fn peek_u32_at(&self, at: usize) -> Result<u32> {
        if at + 4 > self.wire.len() {
            return Err(Fault::BufferUnderrun { needed: 4, have: self.wire.len().saturating_sub(at), at });
        }
        Ok(self.env.order.get_u32(&self.wire[at..at + 4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_padding() {
        assert_eq!(align_padding(0, 4), 0);
        assert_eq!(align_padding(1, 4), 3);
        assert_eq!(align_padding(2, 4), 2);
        assert_eq!(align_padding(4, 4), 0);
        assert_eq!(align_padding(5, 8), 3);
        assert_eq!(align_padding(5, 1), 0);
        assert_eq!(align_padding(5, 0), 0);
    }

    #[test]
    fn byte_orders_disagree_on_wire() {
        let mut le = BytesMut::new();
        let mut be = BytesMut::new();
        ByteOrder::Little.put_u32(&mut le, 0x12345678);
        ByteOrder::Big.put_u32(&mut be, 0x12345678);
        assert_eq!(&le[..], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&be[..], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(ByteOrder::Little.get_u32(&le), 0x12345678);
        assert_eq!(ByteOrder::Big.get_u32(&be), 0x12345678);
    }
}
