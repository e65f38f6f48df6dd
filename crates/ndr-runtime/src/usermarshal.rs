//! User-marshal delegation
//!
//! Opaque types marshal through an externally registered quadruple of
//! routines, selected by the index in the description. The engine passes a
//! flags word (destination context plus wire byte order) and does not
//! interpret the payload; when the description declares a fixed wire size
//! the sizing passes do pure bookkeeping without consulting the routine.

use tracing::warn;

use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::error::{Fault, Result};
use crate::graph::UserMarshalDesc;
use crate::mem::{MemPtr, NdrAllocator};
use crate::stub::CallEnv;

pub fn marshal(ctx: &mut MarshalCtx, mem: MemPtr, d: &UserMarshalDesc) -> Result<()> {
    let flags = ctx.env.user_flags();
    let stub = ctx.env.stub;
    let routine = stub.user_marshaller(d.index)?;
    let body = ctx.env.mem.bytes(mem, d.mem_size as u32)?.to_vec();
    routine.marshal(&flags, &mut ctx.buf, &body)
}

pub fn unmarshal(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &UserMarshalDesc,
    must_alloc: bool,
) -> Result<()> {
    let flags = ctx.env.user_flags();
    let stub = ctx.env.stub;
    let routine = stub.user_marshaller(d.index)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(d.mem_size as u32)?;
    }
    let mut body = ctx.env.mem.bytes(*mem, d.mem_size as u32)?.to_vec();
    let wire = &ctx.wire()[ctx.pos..];
    let consumed = routine.unmarshal(&flags, wire, &mut body)?;
    if consumed > wire.len() {
        return Err(Fault::BufferUnderrun { needed: consumed, have: wire.len(), at: ctx.pos });
    }
    ctx.pos += consumed;
    ctx.env.mem.bytes_mut(*mem, d.mem_size as u32)?.copy_from_slice(&body);
    Ok(())
}

pub fn buffer_size(ctx: &mut SizeCtx, mem: MemPtr, d: &UserMarshalDesc) -> Result<()> {
    if d.wire_size != 0 {
        ctx.add(d.wire_size as usize);
        return Ok(());
    }
    let flags = ctx.env.user_flags();
    let stub = ctx.env.stub;
    let routine = stub.user_marshaller(d.index)?;
    let body = ctx.env.mem.bytes(mem, d.mem_size as u32)?.to_vec();
    ctx.length = routine.buffer_size(&flags, ctx.length, &body);
    Ok(())
}

pub fn memory_size(ctx: &mut MemSizeCtx, d: &UserMarshalDesc) -> Result<u32> {
    ctx.memory_size += d.mem_size as u32;
    if d.wire_size != 0 {
        ctx.skip(d.wire_size as usize)?;
    } else {
        warn!(index = d.index, "user-marshal type without fixed wire size in memory-size pass");
    }
    Ok(d.mem_size as u32)
}

pub fn free(env: &mut CallEnv, mem: MemPtr, d: &UserMarshalDesc) -> Result<()> {
    let flags = env.user_flags();
    let stub = env.stub;
    let routine = stub.user_marshaller(d.index)?;
    let mut body = env.mem.bytes(mem, d.mem_size as u32)?.to_vec();
    routine.free(&flags, &mut body);
    env.mem.bytes_mut(mem, d.mem_size as u32)?.copy_from_slice(&body);
    Ok(())
}
