//! Structure operations
//!
//! - simple structs copy their flat body in one piece, then run the
//!   embedded-pointer pass when the description carries one
//! - conformant structs append their trailing conformant array after the
//!   body; the read path pre-scans the array header without consuming the
//!   cursor so the whole struct is allocated in one piece
//! - complex structs walk an interleaved member stream (scalars, pointers,
//!   alignment directives, memory pads, embedded sub-shapes); the walk is
//!   shared with complex arrays, whose elements use the same stream form

use tracing::warn;

use crate::base;
use crate::context::{align_padding, MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::corr::Counts;
use crate::engine;
use crate::error::{Fault, Result};
use crate::graph::{
    ComplexItem, ComplexStructDesc, ConformantStructDesc, ConformantVaryingStructDesc,
    PointerKind, SimpleStructDesc, TypeDesc, TypeId,
};
use crate::mem::{MemPtr, NdrAllocator};
use crate::pointer;
use crate::stub::CallEnv;

// --- simple structs ---

pub fn marshal_simple(ctx: &mut MarshalCtx, mem: MemPtr, d: &SimpleStructDesc) -> Result<()> {
    ctx.align(d.align)?;
    let body = ctx.env.mem.bytes(mem, d.mem_size)?.to_vec();
    ctx.mark = ctx.pos();
    ctx.put_bytes(&body)?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_marshal(ctx, mem, l, Counts::default())?;
    }
    Ok(())
}

pub fn unmarshal_simple(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &SimpleStructDesc,
    must_alloc: bool,
) -> Result<()> {
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(d.mem_size)?;
    }
    ctx.mark = ctx.pos;
    let body = ctx.take(d.mem_size as usize)?;
    ctx.env.mem.bytes_mut(*mem, d.mem_size)?.copy_from_slice(body);
    if let Some(l) = &d.ptrs {
        pointer::embedded_unmarshal(ctx, *mem, l, Counts::default(), must_alloc)?;
    }
    Ok(())
}

pub fn buffer_size_simple(ctx: &mut SizeCtx, mem: MemPtr, d: &SimpleStructDesc) -> Result<()> {
    ctx.align(d.align);
    ctx.add(d.mem_size as usize);
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, Counts::default())?;
    }
    Ok(())
}

pub fn memory_size_simple(ctx: &mut MemSizeCtx, d: &SimpleStructDesc) -> Result<u32> {
    ctx.align(d.align)?;
    ctx.mark = ctx.pos;
    ctx.skip(d.mem_size as usize)?;
    ctx.memory_size += d.mem_size;
    if let Some(l) = &d.ptrs {
        pointer::embedded_memory_size(ctx, l, Counts::default())?;
    }
    Ok(d.mem_size)
}

pub fn free_simple(env: &mut CallEnv, mem: MemPtr, d: &SimpleStructDesc) -> Result<()> {
    if let Some(l) = &d.ptrs {
        pointer::embedded_free(env, mem, l, Counts::default())?;
    }
    Ok(())
}

// --- conformant structs ---

fn tail_array<'a>(env: &CallEnv<'a>, id: TypeId) -> Result<&'a crate::graph::ConformantArrayDesc> {
    match env.node(id) {
        TypeDesc::ConformantArray(a) => Ok(a),
        other => Err(Fault::UnexpectedTag {
            expected: "conformant array",
            found: tag_of(other),
        }),
    }
}

fn tag_of(node: &TypeDesc) -> u8 {
    use crate::fc;
    match node {
        TypeDesc::Base(b) => b.fc(),
        TypeDesc::Pointer(_) => fc::UP,
        TypeDesc::SimpleStruct(_) => fc::STRUCT,
        TypeDesc::ConformantStruct(_) => fc::CSTRUCT,
        TypeDesc::ConformantVaryingStruct(_) => fc::CVSTRUCT,
        TypeDesc::ComplexStruct(_) => fc::BOGUS_STRUCT,
        TypeDesc::FixedArray(_) => fc::SMFARRAY,
        TypeDesc::VaryingArray(_) => fc::SMVARRAY,
        TypeDesc::ConformantArray(_) => fc::CARRAY,
        TypeDesc::ConformantVaryingArray(_) => fc::CVARRAY,
        TypeDesc::ComplexArray(_) => fc::BOGUS_ARRAY,
        TypeDesc::ConformantString(_) => fc::C_CSTRING,
        TypeDesc::FixedString(_) => fc::CSTRING,
        TypeDesc::EncapsulatedUnion(_) => fc::ENCAPSULATED_UNION,
        TypeDesc::NonEncapsulatedUnion(_) => fc::NON_ENCAPSULATED_UNION,
        TypeDesc::UserMarshal(_) => fc::USER_MARSHAL,
        TypeDesc::Unsupported(t) => *t,
    }
}

pub fn marshal_conformant(
    ctx: &mut MarshalCtx,
    mem: MemPtr,
    d: &ConformantStructDesc,
) -> Result<()> {
    let arr = tail_array(&ctx.env, d.array)?;
    ctx.align(d.align)?;
    let body = ctx.env.mem.bytes(mem, d.mem_size)?.to_vec();
    let body_mark = ctx.pos();
    ctx.put_bytes(&body)?;
    let counts = crate::arrays::marshal_conformant(ctx, mem.add(d.mem_size), arr)?;
    if let Some(l) = &d.ptrs {
        ctx.mark = body_mark;
        pointer::embedded_marshal(ctx, mem, l, counts)?;
    }
    Ok(())
}

pub fn unmarshal_conformant(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ConformantStructDesc,
    must_alloc: bool,
) -> Result<()> {
    let arr = tail_array(&ctx.env, d.array)?;
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        // pre-scan the array header, without consuming the cursor, to size
        // the whole allocation
        let after_body = ctx.pos + d.mem_size as usize;
        let conf_pos = after_body + align_padding(after_body, 4);
        let max = ctx.peek_u32_at(conf_pos)?;
        let tail = byte_len(max, arr.elem_size)?;
        *mem = ctx.env.mem.allocate(d.mem_size + tail)?;
    }
    let body_mark = ctx.pos;
    ctx.mark = body_mark;
    let body = ctx.take(d.mem_size as usize)?;
    ctx.env.mem.bytes_mut(*mem, d.mem_size)?.copy_from_slice(body);
    // the tail lands in the already-allocated block
    let mut tail_mem = mem.add(d.mem_size);
    let counts = crate::arrays::unmarshal_conformant(ctx, &mut tail_mem, arr, false)?;
    if let Some(l) = &d.ptrs {
        ctx.mark = body_mark;
        pointer::embedded_unmarshal(ctx, *mem, l, counts, must_alloc)?;
    }
    Ok(())
}

pub fn buffer_size_conformant(
    ctx: &mut SizeCtx,
    mem: MemPtr,
    d: &ConformantStructDesc,
) -> Result<()> {
    let arr = tail_array(&ctx.env, d.array)?;
    ctx.align(d.align);
    ctx.add(d.mem_size as usize);
    let counts = crate::arrays::buffer_size_conformant(ctx, mem.add(d.mem_size), arr)?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, counts)?;
    }
    Ok(())
}

pub fn memory_size_conformant(ctx: &mut MemSizeCtx, d: &ConformantStructDesc) -> Result<u32> {
    let arr = tail_array(&ctx.env, d.array)?;
    ctx.align(d.align)?;
    ctx.mark = ctx.pos;
    ctx.skip(d.mem_size as usize)?;
    ctx.align(4)?;
    let max = ctx.get_u32()?;
    let tail = byte_len(max, arr.elem_size)?;
    ctx.align(arr.align)?;
    ctx.skip(tail as usize)?;
    ctx.memory_size += d.mem_size + tail;
    Ok(d.mem_size + tail)
}

pub fn free_conformant(env: &mut CallEnv, mem: MemPtr, d: &ConformantStructDesc) -> Result<()> {
    let arr = tail_array(env, d.array)?;
    if let Some(l) = &d.ptrs {
        let max = crate::corr::resolve_conformance(env, mem.add(d.mem_size), &arr.conf, 0)?;
        pointer::embedded_free(env, mem, l, Counts::full(max))?;
    }
    Ok(())
}

// --- conformant varying structs ---

pub fn marshal_conformant_varying(
    ctx: &mut MarshalCtx,
    mem: MemPtr,
    d: &ConformantVaryingStructDesc,
) -> Result<()> {
    ctx.align(d.align)?;
    let body = ctx.env.mem.bytes(mem, d.mem_size)?.to_vec();
    let body_mark = ctx.pos();
    ctx.put_bytes(&body)?;
    let saved = ctx.env.memory;
    ctx.env.memory = mem;
    let r = engine::marshal(ctx, mem.add(d.mem_size), d.array);
    ctx.env.memory = saved;
    r?;
    if let Some(l) = &d.ptrs {
        ctx.mark = body_mark;
        pointer::embedded_marshal(ctx, mem, l, Counts::default())?;
    }
    Ok(())
}

pub fn unmarshal_conformant_varying(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ConformantVaryingStructDesc,
    must_alloc: bool,
) -> Result<()> {
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        // pre-scan the tail conformance to size the allocation
        let after_body = ctx.pos + d.mem_size as usize;
        let conf_pos = after_body + align_padding(after_body, 4);
        let max = ctx.peek_u32_at(conf_pos)?;
        let esize = match ctx.env.node(d.array) {
            TypeDesc::ConformantVaryingArray(a) => a.elem_size,
            TypeDesc::ConformantString(s) => {
                if s.wide {
                    2
                } else {
                    1
                }
            }
            other => {
                return Err(Fault::UnexpectedTag {
                    expected: "conformant varying array or string",
                    found: tag_of(other),
                })
            }
        };
        *mem = ctx.env.mem.allocate(d.mem_size + byte_len(max, esize)?)?;
    }
    let body_mark = ctx.pos;
    ctx.mark = body_mark;
    let body = ctx.take(d.mem_size as usize)?;
    ctx.env.mem.bytes_mut(*mem, d.mem_size)?.copy_from_slice(body);
    let saved = ctx.env.memory;
    ctx.env.memory = *mem;
    let mut tail_mem = mem.add(d.mem_size);
    let r = engine::unmarshal(ctx, &mut tail_mem, d.array, false);
    ctx.env.memory = saved;
    r?;
    if let Some(l) = &d.ptrs {
        ctx.mark = body_mark;
        pointer::embedded_unmarshal(ctx, *mem, l, Counts::default(), must_alloc)?;
    }
    Ok(())
}

pub fn buffer_size_conformant_varying(
    ctx: &mut SizeCtx,
    mem: MemPtr,
    d: &ConformantVaryingStructDesc,
) -> Result<()> {
    ctx.align(d.align);
    ctx.add(d.mem_size as usize);
    let saved = ctx.env.memory;
    ctx.env.memory = mem;
    let r = engine::buffer_size(ctx, mem.add(d.mem_size), d.array);
    ctx.env.memory = saved;
    r?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_buffer_size(ctx, mem, l, Counts::default())?;
    }
    Ok(())
}

pub fn free_conformant_varying(
    env: &mut CallEnv,
    mem: MemPtr,
    d: &ConformantVaryingStructDesc,
) -> Result<()> {
    let saved = env.memory;
    env.memory = mem;
    let r = engine::free(env, mem.add(d.mem_size), d.array);
    env.memory = saved;
    r?;
    if let Some(l) = &d.ptrs {
        pointer::embedded_free(env, mem, l, Counts::default())?;
    }
    Ok(())
}

// --- the complex member stream walk, shared with complex arrays ---

pub(crate) fn walk_marshal(
    ctx: &mut MarshalCtx,
    mut mem: MemPtr,
    fields: &[ComplexItem],
) -> Result<MemPtr> {
    for item in fields {
        match item {
            ComplexItem::Base(b) => {
                base::marshal(ctx, mem, *b)?;
                mem = mem.add(b.mem_size());
            }
            ComplexItem::Pointer(pd) => {
                let value = ctx.env.mem.read_ptr(mem)?;
                pointer::marshal(ctx, value, pd)?;
                mem = mem.add(4);
            }
            ComplexItem::AlignTo(a) => mem = mem.align_up(*a),
            ComplexItem::MemPad(n) => mem = mem.add(*n),
            ComplexItem::Embedded { mem_pad, ty } => {
                mem = mem.add(*mem_pad);
                engine::marshal(ctx, mem, *ty)?;
                mem = mem.add(ctx.env.graph().memory_size_of(*ty));
            }
        }
    }
    Ok(mem)
}

pub(crate) fn walk_unmarshal(
    ctx: &mut UnmarshalCtx,
    mut mem: MemPtr,
    fields: &[ComplexItem],
    must_alloc: bool,
) -> Result<MemPtr> {
    for item in fields {
        match item {
            ComplexItem::Base(b) => {
                let mut cur = mem;
                base::unmarshal(ctx, &mut cur, *b, false)?;
                mem = mem.add(b.mem_size());
            }
            ComplexItem::Pointer(pd) => {
                ctx.env.mem.write_ptr(mem, MemPtr::NULL)?;
                let mut local = MemPtr::NULL;
                pointer::unmarshal(ctx, &mut local, pd, must_alloc)?;
                ctx.env.mem.write_ptr(mem, local)?;
                mem = mem.add(4);
            }
            ComplexItem::AlignTo(a) => mem = mem.align_up(*a),
            ComplexItem::MemPad(n) => mem = mem.add(*n),
            ComplexItem::Embedded { mem_pad, ty } => {
                mem = mem.add(*mem_pad);
                let mut cur = mem;
                engine::unmarshal(ctx, &mut cur, *ty, false)?;
                mem = mem.add(ctx.env.graph().memory_size_of(*ty));
            }
        }
    }
    Ok(mem)
}

pub(crate) fn walk_buffer_size(
    ctx: &mut SizeCtx,
    mut mem: MemPtr,
    fields: &[ComplexItem],
) -> Result<MemPtr> {
    for item in fields {
        match item {
            ComplexItem::Base(b) => {
                base::buffer_size(ctx, *b);
                mem = mem.add(b.mem_size());
            }
            ComplexItem::Pointer(pd) => {
                let value = ctx.env.mem.read_ptr(mem)?;
                pointer::buffer_size(ctx, value, pd)?;
                mem = mem.add(4);
            }
            ComplexItem::AlignTo(a) => mem = mem.align_up(*a),
            ComplexItem::MemPad(n) => mem = mem.add(*n),
            ComplexItem::Embedded { mem_pad, ty } => {
                mem = mem.add(*mem_pad);
                engine::buffer_size(ctx, mem, *ty)?;
                mem = mem.add(ctx.env.graph().memory_size_of(*ty));
            }
        }
    }
    Ok(mem)
}

/// Scan one member stream on the wire, returning the flat memory size of
/// the region it describes. Used both for allocation sizing and as the
/// element-size dry run of complex arrays.
pub(crate) fn walk_memory_size(ctx: &mut MemSizeCtx, fields: &[ComplexItem]) -> Result<u32> {
    let mut size: u32 = 0;
    for item in fields {
        match item {
            ComplexItem::Base(b) => {
                ctx.align(b.wire_align())?;
                ctx.skip(b.wire_size() as usize)?;
                size += b.mem_size();
            }
            ComplexItem::Pointer(pd) => {
                let id = if pd.kind != PointerKind::Ref {
                    ctx.align(4)?;
                    ctx.get_u32()?
                } else {
                    u32::MAX
                };
                if id != 0 {
                    engine::memory_size(ctx, pd.pointee)?;
                }
                size += 4;
            }
            ComplexItem::AlignTo(a) => {
                size += align_padding(size as usize, *a) as u32;
            }
            ComplexItem::MemPad(n) => size += n,
            ComplexItem::Embedded { mem_pad, ty } => {
                size += mem_pad;
                size += engine::memory_size(ctx, *ty)?;
            }
        }
    }
    Ok(size)
}

pub(crate) fn walk_free(
    env: &mut CallEnv,
    mut mem: MemPtr,
    fields: &[ComplexItem],
) -> Result<MemPtr> {
    for item in fields {
        match item {
            ComplexItem::Base(b) => mem = mem.add(b.mem_size()),
            ComplexItem::Pointer(pd) => {
                let value = env.mem.read_ptr(mem)?;
                pointer::free(env, value, pd)?;
                mem = mem.add(4);
            }
            ComplexItem::AlignTo(a) => mem = mem.align_up(*a),
            ComplexItem::MemPad(n) => mem = mem.add(*n),
            ComplexItem::Embedded { mem_pad, ty } => {
                mem = mem.add(*mem_pad);
                engine::free(env, mem, *ty)?;
                mem = mem.add(env.graph().memory_size_of(*ty));
            }
        }
    }
    Ok(mem)
}

// --- complex structs ---

pub fn marshal_complex(ctx: &mut MarshalCtx, mem: MemPtr, d: &ComplexStructDesc) -> Result<()> {
    ctx.align(d.align)?;
    let saved = ctx.env.memory;
    ctx.env.memory = mem;
    let walked = walk_marshal(ctx, mem, &d.fields);
    let r = match walked {
        Ok(end) => match d.conf_array {
            Some(arr) => engine::marshal(ctx, end, arr),
            None => Ok(()),
        },
        Err(e) => Err(e),
    };
    ctx.env.memory = saved;
    r
}

pub fn unmarshal_complex(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &ComplexStructDesc,
    must_alloc: bool,
) -> Result<()> {
    ctx.align(d.align)?;
    if must_alloc || mem.is_null() {
        let mut size = d.mem_size;
        if let Some(arr) = d.conf_array {
            // dry-run the member stream to find and size the trailing
            // conformant data without consuming the cursor
            let wire = ctx.wire();
            let pos = ctx.pos;
            let tail_pos = {
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
                walk_memory_size(&mut probe, &d.fields)?;
                probe.pos
            };
            match ctx.env.node(arr) {
                TypeDesc::ConformantArray(a) => {
                    let conf_pos = tail_pos + align_padding(tail_pos, 4);
                    let max = ctx.peek_u32_at(conf_pos)?;
                    size += byte_len(max, a.elem_size)?;
                }
                other => {
                    warn!(tag = tag_of(other), "unsized conformant tail, allocating flat part only");
                }
            }
        }
        *mem = ctx.env.mem.allocate(size)?;
    }
    let saved = ctx.env.memory;
    ctx.env.memory = *mem;
    let walked = walk_unmarshal(ctx, *mem, &d.fields, must_alloc);
    let r = match walked {
        Ok(end) => match d.conf_array {
            Some(arr) => {
                let mut tail = end;
                engine::unmarshal(ctx, &mut tail, arr, false)
            }
            None => Ok(()),
        },
        Err(e) => Err(e),
    };
    ctx.env.memory = saved;
    r
}

pub fn buffer_size_complex(ctx: &mut SizeCtx, mem: MemPtr, d: &ComplexStructDesc) -> Result<()> {
    ctx.align(d.align);
    let saved = ctx.env.memory;
    ctx.env.memory = mem;
    let walked = walk_buffer_size(ctx, mem, &d.fields);
    let r = match walked {
        Ok(end) => match d.conf_array {
            Some(arr) => engine::buffer_size(ctx, end, arr),
            None => Ok(()),
        },
        Err(e) => Err(e),
    };
    ctx.env.memory = saved;
    r
}

pub fn memory_size_complex(ctx: &mut MemSizeCtx, d: &ComplexStructDesc) -> Result<u32> {
    ctx.align(d.align)?;
    walk_memory_size(ctx, &d.fields)?;
    if let Some(arr) = d.conf_array {
        match ctx.env.node(arr) {
            TypeDesc::ConformantArray(a) => {
                ctx.align(4)?;
                let max = ctx.get_u32()?;
                let tail = byte_len(max, a.elem_size)?;
                ctx.align(a.align)?;
                ctx.skip(tail as usize)?;
                ctx.memory_size += tail;
            }
            other => {
                warn!(tag = tag_of(other), "unsized conformant tail in memory-size pass");
            }
        }
    }
    ctx.memory_size += d.mem_size;
    Ok(d.mem_size)
}

pub fn free_complex(env: &mut CallEnv, mem: MemPtr, d: &ComplexStructDesc) -> Result<()> {
    let saved = env.memory;
    env.memory = mem;
    let walked = walk_free(env, mem, &d.fields);
    let r = match walked {
        Ok(end) => match d.conf_array {
            Some(arr) => engine::free(env, end, arr),
            None => Ok(()),
        },
        Err(e) => Err(e),
    };
    env.memory = saved;
    r
}

/// Element count times element size with overflow turned into a fault.
pub(crate) fn byte_len(count: u32, elem_size: u32) -> Result<u32> {
    let len = count as u64 * elem_size as u64;
    u32::try_from(len).map_err(|_| Fault::AllocationFailed(u32::MAX))
}
