//! String operations
//!
//! Conformant strings are conformant varying character runs with a
//! terminator:
//!
//! ```text
//! max_count: u32    # characters including the terminator
//! offset: u32       # always 0 for strings
//! actual_count: u32 # transmitted characters including the terminator
//! chars[actual_count]
//! ```
//!
//! The element is one octet for narrow strings, two for wide ones, and the
//! choice must be made consistently across every pass. The sized variant
//! takes its conformance from a correlation descriptor (`[size_is]`); the
//! plain form uses the measured length for both counts. Non-conformant
//! strings drop the conformance word and bound the memory by the
//! description.

use tracing::trace;

use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::corr::{self, Counts};
use crate::error::{Fault, Result};
use crate::graph::{ConformantStringDesc, FixedStringDesc};
use crate::mem::{MemPtr, NdrAllocator};
use crate::structs::byte_len;
use crate::stub::CallEnv;

fn elem_size(wide: bool) -> u32 {
    if wide {
        2
    } else {
        1
    }
}

/// Characters up to and including the terminator.
fn measure(env: &CallEnv, mem: MemPtr, wide: bool) -> Result<u32> {
    let mut len = 0u32;
    if wide {
        while env.mem.read_u16(mem.add(len * 2))? != 0 {
            len += 1;
        }
    } else {
        while env.mem.read_u8(mem.add(len))? != 0 {
            len += 1;
        }
    }
    Ok(len + 1)
}

// --- conformant strings ---

pub fn marshal_conformant(ctx: &mut MarshalCtx, mem: MemPtr, d: &ConformantStringDesc) -> Result<()> {
    let esize = elem_size(d.wide);
    let len = measure(&ctx.env, mem, d.wide)?;
    let max = match &d.sized {
        Some(c) => corr::resolve_conformance(&ctx.env, mem, c, len)?,
        None => len,
    };
    if len > max {
        return Err(Fault::StringTooLong { len, bound: max });
    }
    trace!(len, max, wide = d.wide, "marshalling string");
    corr::write_conformance(ctx, max)?;
    corr::write_variance(ctx, Counts { max, actual: len, offset: 0 })?;
    let body = ctx.env.mem.bytes(mem, byte_len(len, esize)?)?.to_vec();
    ctx.put_bytes(&body)?;
    Ok(())
}

pub fn unmarshal_conformant(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ConformantStringDesc,
    must_alloc: bool,
) -> Result<()> {
    let esize = elem_size(d.wide);
    let max = corr::read_conformance(ctx)?;
    let counts = corr::read_variance(ctx, max)?;
    if counts.offset != 0 {
        return Err(Fault::StringOffset(counts.offset));
    }
    if counts.actual > max {
        return Err(Fault::ConformanceMismatch {
            max_count: max,
            offset: 0,
            actual_count: counts.actual,
        });
    }
    let len = byte_len(counts.actual, esize)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(len)?;
    }
    let body = ctx.take(len as usize)?;
    ctx.env.mem.bytes_mut(*mem, len)?.copy_from_slice(body);
    Ok(())
}

pub fn buffer_size_conformant(ctx: &mut SizeCtx, mem: MemPtr, d: &ConformantStringDesc) -> Result<()> {
    corr::size_conformance(ctx);
    corr::size_variance(ctx);
    let len = measure(&ctx.env, mem, d.wide)?;
    ctx.add(byte_len(len, elem_size(d.wide))? as usize);
    Ok(())
}

pub fn memory_size_conformant(ctx: &mut MemSizeCtx, d: &ConformantStringDesc) -> Result<u32> {
    let esize = elem_size(d.wide);
    ctx.align(4)?;
    let max = ctx.get_u32()?;
    let _offset = ctx.get_u32()?;
    let actual = ctx.get_u32()?;
    ctx.skip(byte_len(actual, esize)? as usize)?;
    let size = byte_len(max, esize)?;
    ctx.memory_size += size;
    Ok(size)
}

// --- non-conformant (bounded) strings ---

pub fn marshal_fixed(ctx: &mut MarshalCtx, mem: MemPtr, d: &FixedStringDesc) -> Result<()> {
    let esize = elem_size(d.wide);
    let len = measure(&ctx.env, mem, d.wide)?;
    if len > d.max as u32 {
        return Err(Fault::StringTooLong { len, bound: d.max as u32 });
    }
    corr::write_variance(ctx, Counts { max: d.max as u32, actual: len, offset: 0 })?;
    let body = ctx.env.mem.bytes(mem, byte_len(len, esize)?)?.to_vec();
    ctx.put_bytes(&body)?;
    Ok(())
}

pub fn unmarshal_fixed(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &FixedStringDesc,
    must_alloc: bool,
) -> Result<()> {
    let esize = elem_size(d.wide);
    let counts = corr::read_variance(ctx, d.max as u32)?;
    if counts.offset != 0 {
        return Err(Fault::StringOffset(counts.offset));
    }
    if counts.actual > d.max as u32 {
        return Err(Fault::ConformanceMismatch {
            max_count: d.max as u32,
            offset: 0,
            actual_count: counts.actual,
        });
    }
    if must_alloc || mem.is_null() {
        // memory holds the full declared buffer
        *mem = ctx.env.mem.allocate(byte_len(d.max as u32, esize)?)?;
    }
    let len = byte_len(counts.actual, esize)?;
    let body = ctx.take(len as usize)?;
    ctx.env.mem.bytes_mut(*mem, len)?.copy_from_slice(body);
    Ok(())
}

pub fn buffer_size_fixed(ctx: &mut SizeCtx, mem: MemPtr, d: &FixedStringDesc) -> Result<()> {
    corr::size_variance(ctx);
    let len = measure(&ctx.env, mem, d.wide)?;
    ctx.add(byte_len(len, elem_size(d.wide))? as usize);
    Ok(())
}

pub fn memory_size_fixed(ctx: &mut MemSizeCtx, d: &FixedStringDesc) -> Result<u32> {
    let esize = elem_size(d.wide);
    ctx.align(4)?;
    let _offset = ctx.get_u32()?;
    let actual = ctx.get_u32()?;
    ctx.skip(byte_len(actual, esize)? as usize)?;
    let size = byte_len(d.max as u32, esize)?;
    ctx.memory_size += size;
    Ok(size)
}

// string memory is released by the pointer free policy, not here

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatString;
    use crate::mem::{MemArena, NdrAllocator};
    use crate::stub::{CallEnv, StubDescriptor};

    fn stub() -> StubDescriptor {
        StubDescriptor::builder(FormatString::from(vec![0u8]), false).build()
    }

    #[test]
    fn measure_includes_terminator() {
        let stub = stub();
        let mut arena = MemArena::new();
        let mem = arena.write_block(b"hello\0");
        let env = CallEnv::new(&stub, &mut arena);
        assert_eq!(measure(&env, mem, false).unwrap(), 6);
    }

    #[test]
    fn measure_wide() {
        let stub = stub();
        let mut arena = MemArena::new();
        let mut block = Vec::new();
        for ch in [0x68u16, 0x69, 0] {
            block.extend_from_slice(&ch.to_le_bytes());
        }
        let mem = arena.write_block(&block);
        let env = CallEnv::new(&stub, &mut arena);
        assert_eq!(measure(&env, mem, true).unwrap(), 3);
    }
}
