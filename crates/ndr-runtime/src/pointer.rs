//! The pointer engine
//!
//! Wire disciplines:
//!
//! - ref pointers are always present and write no referent ID word at the
//!   top level; a null ref pointer is a fault
//! - unique and object pointers write a 4-byte referent ID before the
//!   referent, zero meaning null and ending the representation
//! - object pointers additionally release an existing referent before it is
//!   overwritten on the read path
//! - full pointers are recognized and fault as unsupported
//!
//! Embedded pointers (inside flat struct and array bodies) are described by
//! repeat groups. Their ID words land in place over the already-copied body
//! image at `mark + buffer offset`; referents append at the cursor. The free
//! policy keeps don't-free and on-stack memory away from the deallocator,
//! and string referents are never freed when the transport buffer was
//! reused in place.

use tracing::trace;

use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::corr::Counts;
use crate::engine;
use crate::error::{Fault, Result};
use crate::fc;
use crate::graph::{PointerDesc, PointerKind, PointerLayout, Repeat, TypeDesc};
use crate::mem::{MemPtr, NdrAllocator};
use crate::stub::CallEnv;

/// Marshal a top-level pointer; `value` is the pointer itself.
///
/// The ID word is reserved here rather than in [`marshal_at`]: embedded
/// pointers already own their ID bytes inside the copied body image.
pub fn marshal(ctx: &mut MarshalCtx, value: MemPtr, d: &PointerDesc) -> Result<()> {
    let id_pos = if d.kind != PointerKind::Ref {
        ctx.align(4)?;
        let p = ctx.pos();
        ctx.put_u32(0)?;
        p
    } else {
        ctx.pos()
    };
    marshal_at(ctx, id_pos, value, d)
}

/// Marshal a pointer whose ID word lives at `id_pos` in the buffer.
pub(crate) fn marshal_at(
    ctx: &mut MarshalCtx,
    id_pos: usize,
    value: MemPtr,
    d: &PointerDesc,
) -> Result<()> {
    match d.kind {
        PointerKind::Ref => {
            if value.is_null() {
                return Err(Fault::NullRefPointer);
            }
        }
        PointerKind::Unique | PointerKind::Object => {
            trace!(id = value.0, "writing referent id");
            ctx.overwrite_u32(id_pos, value.0)?;
        }
        PointerKind::Full => return Err(Fault::UnsupportedPointer(fc::FP)),
    }
    if value.is_null() {
        return Ok(());
    }
    let mut v = value;
    if d.attrs.deref() {
        v = ctx.env.mem.read_ptr(v)?;
    }
    engine::marshal(ctx, v, d.pointee)
}

/// Unmarshal a top-level pointer into `slot`.
pub fn unmarshal(
    ctx: &mut UnmarshalCtx,
    slot: &mut MemPtr,
    d: &PointerDesc,
    must_alloc: bool,
) -> Result<()> {
    let id = if d.kind != PointerKind::Ref {
        ctx.align(4)?;
        ctx.get_u32()?
    } else {
        u32::MAX
    };
    unmarshal_with_id(ctx, id, slot, d, must_alloc)
}

pub(crate) fn unmarshal_with_id(
    ctx: &mut UnmarshalCtx,
    id: u32,
    slot: &mut MemPtr,
    d: &PointerDesc,
    must_alloc: bool,
) -> Result<()> {
    match d.kind {
        PointerKind::Ref | PointerKind::Unique => {}
        PointerKind::Object => {
            if !slot.is_null() {
                // release the prior referent before overwriting it
                free(&mut ctx.env, *slot, d)?;
            }
        }
        PointerKind::Full => return Err(Fault::UnsupportedPointer(fc::FP)),
    }
    if id == 0 {
        *slot = MemPtr::NULL;
        return Ok(());
    }
    if d.attrs.deref() {
        if slot.is_null() || must_alloc {
            *slot = ctx.env.mem.allocate(4)?;
        }
        let cell = *slot;
        let mut inner = ctx.env.mem.read_ptr(cell)?;
        engine::unmarshal(ctx, &mut inner, d.pointee, must_alloc)?;
        ctx.env.mem.write_ptr(cell, inner)?;
    } else {
        engine::unmarshal(ctx, slot, d.pointee, must_alloc)?;
    }
    trace!(ptr = slot.0, "unmarshalled pointer");
    Ok(())
}

pub fn buffer_size(ctx: &mut SizeCtx, value: MemPtr, d: &PointerDesc) -> Result<()> {
    if d.kind != PointerKind::Ref {
        ctx.align(4);
        ctx.add(4);
    }
    buffer_size_inner(ctx, value, d)
}

pub(crate) fn buffer_size_inner(ctx: &mut SizeCtx, value: MemPtr, d: &PointerDesc) -> Result<()> {
    match d.kind {
        PointerKind::Ref => {
            if value.is_null() {
                return Err(Fault::NullRefPointer);
            }
        }
        PointerKind::Unique | PointerKind::Object => {
            // a null pointer has no representation past its ID
            if value.is_null() {
                return Ok(());
            }
        }
        PointerKind::Full => return Err(Fault::UnsupportedPointer(fc::FP)),
    }
    let mut v = value;
    if d.attrs.deref() {
        v = ctx.env.mem.read_ptr(v)?;
    }
    engine::buffer_size(ctx, v, d.pointee)
}

pub fn memory_size(ctx: &mut MemSizeCtx, d: &PointerDesc) -> Result<u32> {
    if d.kind == PointerKind::Full {
        return Err(Fault::UnsupportedPointer(fc::FP));
    }
    let id = if d.kind != PointerKind::Ref {
        ctx.align(4)?;
        ctx.get_u32()?
    } else {
        u32::MAX
    };
    // the pointer slot itself
    ctx.memory_size += 4;
    if id != 0 {
        engine::memory_size(ctx, d.pointee)?;
    }
    Ok(4)
}

/// Free a pointer's referent, honoring the ownership attributes.
pub fn free(env: &mut CallEnv, value: MemPtr, d: &PointerDesc) -> Result<()> {
    if d.attrs.dont_free() || value.is_null() {
        return Ok(());
    }
    let mut v = value;
    if d.attrs.deref() {
        v = env.mem.read_ptr(v)?;
        if v.is_null() {
            return Ok(());
        }
    }
    engine::free(env, v, d.pointee)?;

    // memory unmarshalled in place of the transport buffer is borrowed;
    // string referents stay with the buffer owner
    let borrowed = matches!(
        env.node(d.pointee),
        TypeDesc::ConformantString(_) | TypeDesc::FixedString(_)
    ) && env.reuse_buffer;
    if borrowed {
        trace!(ptr = v.0, "not freeing buffer-reused string");
        return Ok(());
    }
    if d.attrs.on_stack() {
        trace!(ptr = v.0, "not freeing stack pointer");
        return Ok(());
    }
    trace!(ptr = v.0, "freeing referent");
    env.mem.free(v);
    Ok(())
}

fn iteration(repeat: Repeat, stride: u32, counts: Counts) -> (u32, u64) {
    match repeat {
        Repeat::Once => (1, 0),
        Repeat::Fixed(n) => (n, 0),
        Repeat::Variable { variance_relative: false } => (counts.max, 0),
        Repeat::Variable { variance_relative: true } => {
            (counts.actual, counts.offset as u64 * stride as u64)
        }
    }
}

/// Marshal every embedded pointer of a flat body already copied at
/// `ctx.mark`, overwriting the ID words in place and appending referents.
pub fn embedded_marshal(
    ctx: &mut MarshalCtx,
    mem_base: MemPtr,
    layout: &PointerLayout,
    counts: Counts,
) -> Result<()> {
    let mark = ctx.mark;
    for g in &layout.groups {
        let (rep, xofs) = iteration(g.repeat, g.stride, counts);
        for i in 0..rep {
            let step = xofs + i as u64 * g.stride as u64;
            for t in &g.targets {
                let slot = mem_base.offset(step as i64 + t.mem_offset as i64);
                let value = ctx.env.mem.read_ptr(slot)?;
                let id_pos = (mark as i64 + i as i64 * g.stride as i64 + t.buf_offset as i64) as usize;
                marshal_at(ctx, id_pos, value, &t.pointer)?;
            }
        }
    }
    Ok(())
}

pub fn embedded_unmarshal(
    ctx: &mut UnmarshalCtx,
    mem_base: MemPtr,
    layout: &PointerLayout,
    counts: Counts,
    must_alloc: bool,
) -> Result<()> {
    let mark = ctx.mark;
    for g in &layout.groups {
        let (rep, xofs) = iteration(g.repeat, g.stride, counts);
        for i in 0..rep {
            let step = xofs + i as u64 * g.stride as u64;
            for t in &g.targets {
                let slot = mem_base.offset(step as i64 + t.mem_offset as i64);
                ctx.env.mem.write_ptr(slot, MemPtr::NULL)?;
                let id_pos = (mark as i64 + i as i64 * g.stride as i64 + t.buf_offset as i64) as usize;
                let id = if t.pointer.kind != PointerKind::Ref {
                    ctx.peek_u32_at(id_pos)?
                } else {
                    u32::MAX
                };
                let mut local = MemPtr::NULL;
                unmarshal_with_id(ctx, id, &mut local, &t.pointer, must_alloc)?;
                ctx.env.mem.write_ptr(slot, local)?;
            }
        }
    }
    Ok(())
}

pub fn embedded_buffer_size(
    ctx: &mut SizeCtx,
    mem_base: MemPtr,
    layout: &PointerLayout,
    counts: Counts,
) -> Result<()> {
    for g in &layout.groups {
        let (rep, xofs) = iteration(g.repeat, g.stride, counts);
        for i in 0..rep {
            let step = xofs + i as u64 * g.stride as u64;
            for t in &g.targets {
                let slot = mem_base.offset(step as i64 + t.mem_offset as i64);
                let value = ctx.env.mem.read_ptr(slot)?;
                buffer_size_inner(ctx, value, &t.pointer)?;
            }
        }
    }
    Ok(())
}

pub fn embedded_memory_size(
    ctx: &mut MemSizeCtx,
    layout: &PointerLayout,
    counts: Counts,
) -> Result<()> {
    let mark = ctx.mark;
    for g in &layout.groups {
        let (rep, _) = iteration(g.repeat, g.stride, counts);
        for i in 0..rep {
            for t in &g.targets {
                let id_pos = (mark as i64 + i as i64 * g.stride as i64 + t.buf_offset as i64) as usize;
                let id = if t.pointer.kind != PointerKind::Ref {
                    ctx.peek_u32_at(id_pos)?
                } else {
                    u32::MAX
                };
                if id != 0 {
                    engine::memory_size(ctx, t.pointer.pointee)?;
                }
            }
        }
    }
    Ok(())
}

pub fn embedded_free(
    env: &mut CallEnv,
    mem_base: MemPtr,
    layout: &PointerLayout,
    counts: Counts,
) -> Result<()> {
    for g in &layout.groups {
        let (rep, xofs) = iteration(g.repeat, g.stride, counts);
        for i in 0..rep {
            let step = xofs + i as u64 * g.stride as u64;
            for t in &g.targets {
                let slot = mem_base.offset(step as i64 + t.mem_offset as i64);
                let value = env.mem.read_ptr(slot)?;
                free(env, value, &t.pointer)?;
            }
        }
    }
    Ok(())
}
