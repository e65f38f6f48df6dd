//! Array operations
//!
//! Wire layouts:
//!
//! ```text
//! fixed              elements only, no header
//! varying            [offset][actual_count] elements[actual]
//! conformant         [max_count] elements[max]
//! conformant varying [max_count][offset][actual_count] elements[actual]
//! complex            headers as above, then one member-stream walk per
//!                    element; element size discovered by a dry-run scan
//! ```
//!
//! Headers are aligned 4-byte words; element data realigns to the declared
//! element alignment after the header. Resolved counts are handed to the
//! embedded-pointer pass of the same array instance, never parked in shared
//! state.

use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::corr::{self, Counts};
use crate::error::{Fault, Result};
use crate::graph::{
    ComplexArrayDesc, ConformantArrayDesc, ConformantVaryingArrayDesc, FixedArrayDesc,
    VaryingArrayDesc,
};
use crate::mem::{MemPtr, NdrAllocator};
use crate::pointer;
use crate::structs::{byte_len, walk_buffer_size, walk_free, walk_marshal, walk_memory_size, walk_unmarshal};
use crate::stub::CallEnv;

// --- fixed arrays ---

pub fn marshal_fixed(ctx: &mut MarshalCtx, mem: MemPtr, d: &FixedArrayDesc) -> Result<()> {
    ctx.align(d.align)?;
    let body = ctx.env.mem.bytes(mem, d.total_size)?.to_vec();
    ctx.mark = ctx.pos();
    ctx.put_bytes(&body)?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_marshal(ctx, mem, l, Counts::default())?;
    }
    Ok(())
}

pub fn unmarshal_fixed(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &FixedArrayDesc,
    must_alloc: bool,
) -> Result<()> {
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(d.total_size)?;
    }
    ctx.mark = ctx.pos;
    let body = ctx.take(d.total_size as usize)?;
    ctx.env.mem.bytes_mut(*mem, d.total_size)?.copy_from_slice(body);
    if let Some(l) = &d.ptrs {
        pointer::embedded_unmarshal(ctx, *mem, l, Counts::default(), must_alloc)?;
    }
    Ok(())
}

pub fn buffer_size_fixed(ctx: &mut SizeCtx, mem: MemPtr, d: &FixedArrayDesc) -> Result<()> {
    ctx.align(d.align);
    ctx.add(d.total_size as usize);
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, Counts::default())?;
    }
    Ok(())
}

pub fn memory_size_fixed(ctx: &mut MemSizeCtx, d: &FixedArrayDesc) -> Result<u32> {
    ctx.align(d.align)?;
    ctx.mark = ctx.pos;
    ctx.skip(d.total_size as usize)?;
    ctx.memory_size += d.total_size;
    if let Some(l) = &d.ptrs {
        pointer::embedded_memory_size(ctx, l, Counts::default())?;
    }
    Ok(d.total_size)
}

pub fn free_fixed(env: &mut CallEnv, mem: MemPtr, d: &FixedArrayDesc) -> Result<()> {
    if let Some(l) = &d.ptrs {
        pointer::embedded_free(env, mem, l, Counts::default())?;
    }
    Ok(())
}

// --- varying arrays ---

pub fn marshal_varying(ctx: &mut MarshalCtx, mem: MemPtr, d: &VaryingArrayDesc) -> Result<()> {
    let counts = corr::resolve_variance(&ctx.env, mem, &d.variance, d.elem_count)?;
    check_varying_bounds(d.elem_count, counts)?;
    corr::write_variance(ctx, counts)?;
    ctx.align(d.align)?;
    let len = byte_len(counts.actual, d.elem_size)?;
    let from = mem.offset(counts.offset as i64 * d.elem_size as i64);
    let body = ctx.env.mem.bytes(from, len)?.to_vec();
    ctx.mark = ctx.pos();
    ctx.put_bytes(&body)?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_marshal(ctx, mem, l, counts)?;
    }
    Ok(())
}

pub fn unmarshal_varying(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &VaryingArrayDesc,
    must_alloc: bool,
) -> Result<()> {
    let counts = corr::read_variance(ctx, d.elem_count)?;
    check_varying_bounds(d.elem_count, counts)?;
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(d.total_size)?;
    }
    let len = byte_len(counts.actual, d.elem_size)?;
    ctx.mark = ctx.pos;
    let body = ctx.take(len as usize)?;
    let to = mem.offset(counts.offset as i64 * d.elem_size as i64);
    ctx.env.mem.bytes_mut(to, len)?.copy_from_slice(body);
    if let Some(l) = &d.ptrs {
        pointer::embedded_unmarshal(ctx, *mem, l, counts, must_alloc)?;
    }
    Ok(())
}

pub fn buffer_size_varying(ctx: &mut SizeCtx, mem: MemPtr, d: &VaryingArrayDesc) -> Result<()> {
    let counts = corr::resolve_variance(&ctx.env, mem, &d.variance, d.elem_count)?;
    check_varying_bounds(d.elem_count, counts)?;
    corr::size_variance(ctx);
    ctx.align(d.align);
    ctx.add(byte_len(counts.actual, d.elem_size)? as usize);
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, counts)?;
    }
    Ok(())
}

pub fn memory_size_varying(ctx: &mut MemSizeCtx, d: &VaryingArrayDesc) -> Result<u32> {
    let (offset, actual) = corr::skip_variance(ctx)?;
    check_varying_bounds(d.elem_count, Counts { max: d.elem_count, actual, offset })?;
    ctx.align(d.align)?;
    ctx.mark = ctx.pos;
    ctx.skip(byte_len(actual, d.elem_size)? as usize)?;
    ctx.memory_size += d.total_size;
    if let Some(l) = &d.ptrs {
        pointer::embedded_memory_size(ctx, l, Counts { max: d.elem_count, actual, offset })?;
    }
    Ok(d.total_size)
}

pub fn free_varying(env: &mut CallEnv, mem: MemPtr, d: &VaryingArrayDesc) -> Result<()> {
    if let Some(l) = &d.ptrs {
        let counts = corr::resolve_variance(env, mem, &d.variance, d.elem_count)?;
        pointer::embedded_free(env, mem, l, counts)?;
    }
    Ok(())
}

fn check_varying_bounds(elem_count: u32, counts: Counts) -> Result<()> {
    let end = counts.offset as u64 + counts.actual as u64;
    if end > elem_count as u64 {
        return Err(Fault::ConformanceMismatch {
            max_count: elem_count,
            offset: counts.offset,
            actual_count: counts.actual,
        });
    }
    Ok(())
}

// --- conformant arrays ---

pub fn marshal_conformant(
    ctx: &mut MarshalCtx,
    mem: MemPtr,
    d: &ConformantArrayDesc,
) -> Result<Counts> {
    let max = corr::resolve_conformance(&ctx.env, mem, &d.conf, 0)?;
    corr::write_conformance(ctx, max)?;
    ctx.align(d.align)?;
    let len = byte_len(max, d.elem_size)?;
    let body = ctx.env.mem.bytes(mem, len)?.to_vec();
    ctx.mark = ctx.pos();
    ctx.put_bytes(&body)?;
    let counts = Counts::full(max);
    if let Some(l) = &d.ptrs {
        pointer::embedded_marshal(ctx, mem, l, counts)?;
    }
    Ok(counts)
}

pub fn unmarshal_conformant(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ConformantArrayDesc,
    must_alloc: bool,
) -> Result<Counts> {
    let max = corr::read_conformance(ctx)?;
    let len = byte_len(max, d.elem_size)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(len)?;
    }
    ctx.align(d.align)?;
    ctx.mark = ctx.pos;
    let body = ctx.take(len as usize)?;
    ctx.env.mem.bytes_mut(*mem, len)?.copy_from_slice(body);
    let counts = Counts::full(max);
    if let Some(l) = &d.ptrs {
        pointer::embedded_unmarshal(ctx, *mem, l, counts, must_alloc)?;
    }
    Ok(counts)
}

pub fn buffer_size_conformant(
    ctx: &mut SizeCtx,
    mem: MemPtr,
    d: &ConformantArrayDesc,
) -> Result<Counts> {
    let max = corr::resolve_conformance(&ctx.env, mem, &d.conf, 0)?;
    corr::size_conformance(ctx);
    ctx.align(d.align);
    ctx.add(byte_len(max, d.elem_size)? as usize);
    let counts = Counts::full(max);
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, counts)?;
    }
    Ok(counts)
}

/// Peeks the conformance header without consuming the cursor, the form the
/// conformant-struct pre-scan needs.
pub fn memory_size_conformant(ctx: &mut MemSizeCtx, d: &ConformantArrayDesc) -> Result<u32> {
    let saved = ctx.pos;
    ctx.align(4)?;
    let max = ctx.get_u32()?;
    ctx.pos = saved;
    byte_len(max, d.elem_size)
}

pub fn free_conformant(env: &mut CallEnv, mem: MemPtr, d: &ConformantArrayDesc) -> Result<()> {
    if let Some(l) = &d.ptrs {
        let max = corr::resolve_conformance(env, mem, &d.conf, 0)?;
        pointer::embedded_free(env, mem, l, Counts::full(max))?;
    }
    Ok(())
}

// --- conformant varying arrays ---

pub fn marshal_conformant_varying(
    ctx: &mut MarshalCtx,
    mem: MemPtr,
    d: &ConformantVaryingArrayDesc,
) -> Result<Counts> {
    let max = corr::resolve_conformance(&ctx.env, mem, &d.conf, 0)?;
    let counts = corr::resolve_variance(&ctx.env, mem, &d.variance, max)?;
    check_cv_bounds(counts)?;
    corr::write_conformance(ctx, counts.max)?;
    corr::write_variance(ctx, counts)?;
    ctx.align(d.align)?;
    let len = byte_len(counts.actual, d.elem_size)?;
    let from = mem.offset(counts.offset as i64 * d.elem_size as i64);
    let body = ctx.env.mem.bytes(from, len)?.to_vec();
    ctx.mark = ctx.pos();
    ctx.put_bytes(&body)?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_marshal(ctx, mem, l, counts)?;
    }
    Ok(counts)
}

pub fn unmarshal_conformant_varying(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ConformantVaryingArrayDesc,
    must_alloc: bool,
) -> Result<Counts> {
    let max = corr::read_conformance(ctx)?;
    let counts = corr::read_variance(ctx, max)?;
    check_cv_bounds(counts)?;
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(byte_len(max, d.elem_size)?)?;
    }
    let len = byte_len(counts.actual, d.elem_size)?;
    ctx.mark = ctx.pos;
    let body = ctx.take(len as usize)?;
    let to = mem.offset(counts.offset as i64 * d.elem_size as i64);
    ctx.env.mem.bytes_mut(to, len)?.copy_from_slice(body);
    if let Some(l) = &d.ptrs {
        pointer::embedded_unmarshal(ctx, *mem, l, counts, must_alloc)?;
    }
    Ok(counts)
}

pub fn buffer_size_conformant_varying(
    ctx: &mut SizeCtx,
    mem: MemPtr,
    d: &ConformantVaryingArrayDesc,
) -> Result<Counts> {
    let max = corr::resolve_conformance(&ctx.env, mem, &d.conf, 0)?;
    let counts = corr::resolve_variance(&ctx.env, mem, &d.variance, max)?;
    check_cv_bounds(counts)?;
    corr::size_conformance(ctx);
    corr::size_variance(ctx);
    ctx.align(d.align);
    ctx.add(byte_len(counts.actual, d.elem_size)? as usize);
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, counts)?;
    }
    Ok(counts)
}

pub fn memory_size_conformant_varying(
    ctx: &mut MemSizeCtx,
    d: &ConformantVaryingArrayDesc,
) -> Result<u32> {
    let saved = ctx.pos;
    ctx.align(4)?;
    let max = ctx.get_u32()?;
    ctx.pos = saved;
    byte_len(max, d.elem_size)
}

pub fn free_conformant_varying(
    env: &mut CallEnv,
    mem: MemPtr,
    d: &ConformantVaryingArrayDesc,
) -> Result<()> {
    if let Some(l) = &d.ptrs {
        let max = corr::resolve_conformance(env, mem, &d.conf, 0)?;
        let counts = corr::resolve_variance(env, mem, &d.variance, max)?;
        pointer::embedded_free(env, mem, l, counts)?;
    }
    Ok(())
}

fn check_cv_bounds(counts: Counts) -> Result<()> {
    let end = counts.offset as u64 + counts.actual as u64;
    if end > counts.max as u64 {
        return Err(Fault::ConformanceMismatch {
            max_count: counts.max,
            offset: counts.offset,
            actual_count: counts.actual,
        });
    }
    Ok(())
}

// --- complex arrays ---

pub fn marshal_complex(ctx: &mut MarshalCtx, mem: MemPtr, d: &ComplexArrayDesc) -> Result<()> {
    let max = corr::resolve_conformance(&ctx.env, mem, &d.conf, d.default_count as u32)?;
    let variance_present = d.variance.is_present();
    let counts = corr::resolve_variance(&ctx.env, mem, &d.variance, max)?;
    corr::write_conformance(ctx, counts.max)?;
    if variance_present {
        corr::write_variance(ctx, counts)?;
    }
    ctx.align(d.align)?;
    let mut cur = mem;
    for _ in 0..counts.actual {
        cur = walk_marshal(ctx, cur, &d.fields)?;
    }
    Ok(())
}

pub fn unmarshal_complex(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ComplexArrayDesc,
    must_alloc: bool,
) -> Result<()> {
    let max = corr::read_conformance(ctx)?;
    let counts = if d.variance.is_present() {
        corr::read_variance(ctx, max)?
    } else {
        Counts::full(max)
    };
    check_cv_bounds(counts)?;
    ctx.align(d.align)?;

    // elements may themselves be variable-sized: dry-run one element scan
    // to learn the flat element size before allocating
    let esize = if counts.actual == 0 {
        0
    } else {
        let wire = ctx.wire();
        let pos = ctx.pos;
        let env = CallEnv {
            stub: ctx.env.stub,
            mem: &mut *ctx.env.mem,
            order: ctx.env.order,
            memory: ctx.env.memory,
            stack_top: ctx.env.stack_top,
            reuse_buffer: ctx.env.reuse_buffer,
            dest_context: ctx.env.dest_context,
        };
        let mut probe = MemSizeCtx::with_pos(env, wire, pos);
        walk_memory_size(&mut probe, &d.fields)?
    };
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(byte_len(counts.max, esize)?)?;
    }
    let mut cur = *mem;
    for _ in 0..counts.actual {
        cur = walk_unmarshal(ctx, cur, &d.fields, must_alloc)?;
    }
    Ok(())
}

pub fn buffer_size_complex(ctx: &mut SizeCtx, mem: MemPtr, d: &ComplexArrayDesc) -> Result<()> {
    let max = corr::resolve_conformance(&ctx.env, mem, &d.conf, d.default_count as u32)?;
    let variance_present = d.variance.is_present();
    let counts = corr::resolve_variance(&ctx.env, mem, &d.variance, max)?;
    corr::size_conformance(ctx);
    if variance_present {
        corr::size_variance(ctx);
    }
    ctx.align(d.align);
    let mut cur = mem;
    for _ in 0..counts.actual {
        cur = walk_buffer_size(ctx, cur, &d.fields)?;
    }
    Ok(())
}

pub fn memory_size_complex(ctx: &mut MemSizeCtx, d: &ComplexArrayDesc) -> Result<u32> {
    let max = corr::skip_conformance(ctx)?;
    let counts = if d.variance.is_present() {
        let (offset, actual) = corr::skip_variance(ctx)?;
        Counts { max, actual, offset }
    } else {
        Counts::full(max)
    };
    check_cv_bounds(counts)?;
    ctx.align(d.align)?;

    let saved_memory_size = ctx.memory_size;
    let saved_pos = ctx.pos;
    let esize = if counts.actual == 0 {
        0
    } else {
        let e = walk_memory_size(ctx, &d.fields)?;
        ctx.pos = saved_pos;
        e
    };

    for _ in 0..counts.actual {
        walk_memory_size(ctx, &d.fields)?;
    }
    // element walks computed sizes of their own; only the flat array
    // allocation counts here
    ctx.memory_size = saved_memory_size;
    let total = byte_len(counts.max, esize)?;
    ctx.memory_size += total;
    Ok(total)
}

pub fn free_complex(env: &mut CallEnv, mem: MemPtr, d: &ComplexArrayDesc) -> Result<()> {
    let max = corr::resolve_conformance(env, mem, &d.conf, d.default_count as u32)?;
    let counts = corr::resolve_variance(env, mem, &d.variance, max)?;
    let mut cur = mem;
    for _ in 0..counts.actual {
        cur = walk_free(env, cur, &d.fields)?;
    }
    Ok(())
}
