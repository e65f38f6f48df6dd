//! Union operations
//!
//! Both union forms transmit a discriminant followed by the selected arm.
//! The encapsulated form keeps the discriminant inside the union memory
//! (arm data follows at a fixed increment); the non-encapsulated form reads
//! it from a sibling field located by a correlation descriptor. Arm lookup
//! is a linear scan over `(value, arm)` pairs. A matching arm with no type
//! means "no payload"; an unmatched discriminant selects the default arm,
//! and a description without one faults.

use crate::base;
use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::corr;
use crate::engine;
use crate::error::{Fault, Result};
use crate::fc::BaseType;
use crate::graph::{EncapsulatedUnionDesc, NonEncapsulatedUnionDesc, TypeDesc, UnionArm};
use crate::mem::{MemPtr, NdrAllocator};
use crate::pointer;
use crate::stub::CallEnv;

fn read_switch_mem(env: &CallEnv, at: MemPtr, b: BaseType) -> Result<u32> {
    match b.mem_size() {
        1 => Ok(env.mem.read_u8(at)? as u32),
        2 => Ok(env.mem.read_u16(at)? as u32),
        4 => Ok(env.mem.read_u32(at)?),
        _ => Err(Fault::InvalidFormat { offset: 0, reason: "union switch wider than 32 bits" }),
    }
}

fn write_switch_mem(env: &mut CallEnv, at: MemPtr, b: BaseType, value: u32) -> Result<()> {
    match b.mem_size() {
        1 => env.mem.write_u8(at, value as u8),
        2 => env.mem.write_u16(at, value as u16),
        4 => env.mem.write_u32(at, value),
        _ => Err(Fault::InvalidFormat { offset: 0, reason: "union switch wider than 32 bits" }),
    }
}

fn read_switch_wire(ctx: &mut UnmarshalCtx, b: BaseType) -> Result<u32> {
    match b.wire_size() {
        1 => Ok(ctx.get_u8()? as u32),
        2 => {
            ctx.align(2)?;
            Ok(ctx.get_u16()? as u32)
        }
        _ => {
            ctx.align(4)?;
            Ok(ctx.get_u32()?)
        }
    }
}

fn skip_switch_wire(ctx: &mut MemSizeCtx, b: BaseType) -> Result<u32> {
    ctx.align(b.wire_align())?;
    match b.wire_size() {
        1 => Ok(ctx.get_u8()? as u32),
        2 => Ok(ctx.get_u16()? as u32),
        _ => ctx.get_u32(),
    }
}

fn marshal_arm(ctx: &mut MarshalCtx, mem: MemPtr, arm: &UnionArm) -> Result<()> {
    match arm {
        UnionArm::Empty => Ok(()),
        UnionArm::Base(b) => base::marshal(ctx, mem, *b),
        UnionArm::Ty(id) => match ctx.env.node(*id) {
            TypeDesc::Pointer(pd) => {
                let value = ctx.env.mem.read_ptr(mem)?;
                pointer::marshal(ctx, value, pd)
            }
            _ => engine::marshal(ctx, mem, *id),
        },
    }
}

fn unmarshal_arm(
    ctx: &mut UnmarshalCtx,
    mem: MemPtr,
    arm: &UnionArm,
    must_alloc: bool,
) -> Result<()> {
    match arm {
        UnionArm::Empty => Ok(()),
        UnionArm::Base(b) => {
            let mut cur = mem;
            base::unmarshal(ctx, &mut cur, *b, false)
        }
        UnionArm::Ty(id) => match ctx.env.node(*id) {
            TypeDesc::Pointer(pd) => {
                ctx.env.mem.write_ptr(mem, MemPtr::NULL)?;
                let mut local = MemPtr::NULL;
                pointer::unmarshal(ctx, &mut local, pd, must_alloc)?;
                ctx.env.mem.write_ptr(mem, local)
            }
            _ => {
                let mut cur = mem;
                engine::unmarshal(ctx, &mut cur, *id, false)
            }
        },
    }
}

fn buffer_size_arm(ctx: &mut SizeCtx, mem: MemPtr, arm: &UnionArm) -> Result<()> {
    match arm {
        UnionArm::Empty => Ok(()),
        UnionArm::Base(b) => {
            base::buffer_size(ctx, *b);
            Ok(())
        }
        UnionArm::Ty(id) => match ctx.env.node(*id) {
            TypeDesc::Pointer(pd) => {
                let value = ctx.env.mem.read_ptr(mem)?;
                pointer::buffer_size(ctx, value, pd)
            }
            _ => engine::buffer_size(ctx, mem, *id),
        },
    }
}

fn memory_size_arm(ctx: &mut MemSizeCtx, arm: &UnionArm) -> Result<()> {
    match arm {
        UnionArm::Empty => Ok(()),
        UnionArm::Base(b) => {
            base::memory_size(ctx, *b)?;
            Ok(())
        }
        UnionArm::Ty(id) => {
            engine::memory_size(ctx, *id)?;
            Ok(())
        }
    }
}

fn free_arm(env: &mut CallEnv, mem: MemPtr, arm: &UnionArm) -> Result<()> {
    match arm {
        UnionArm::Empty | UnionArm::Base(_) => Ok(()),
        UnionArm::Ty(id) => match env.node(*id) {
            TypeDesc::Pointer(pd) => {
                let value = env.mem.read_ptr(mem)?;
                pointer::free(env, value, pd)
            }
            _ => engine::free(env, mem, *id),
        },
    }
}

/// Arm walks may consume less wire than the union's declared memory; the
/// allocation estimate still covers the whole arm region.
fn settle_memory_size(ctx: &mut MemSizeCtx, before: u32, region: u32) {
    let added = ctx.memory_size - before;
    if added < region {
        ctx.memory_size += region - added;
    }
}

// --- non-encapsulated unions ---

pub fn marshal_non_encapsulated(
    ctx: &mut MarshalCtx,
    mem: MemPtr,
    d: &NonEncapsulatedUnionDesc,
) -> Result<()> {
    let disc_addr = corr::field_address(&ctx.env, mem, &d.corr)?;
    base::marshal(ctx, disc_addr, d.switch_type)?;
    let value = corr::resolve_count(&ctx.env, mem, &d.corr, 0)?;
    let arm = d.arms.select(value)?;
    marshal_arm(ctx, mem, arm)
}

pub fn unmarshal_non_encapsulated(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &NonEncapsulatedUnionDesc,
    must_alloc: bool,
) -> Result<()> {
    let value = read_switch_wire(ctx, d.switch_type)?;
    let arm = d.arms.select(value)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(d.mem_size as u32)?;
    }
    unmarshal_arm(ctx, *mem, arm, must_alloc)
}

pub fn buffer_size_non_encapsulated(
    ctx: &mut SizeCtx,
    mem: MemPtr,
    d: &NonEncapsulatedUnionDesc,
) -> Result<()> {
    base::buffer_size(ctx, d.switch_type);
    let value = corr::resolve_count(&ctx.env, mem, &d.corr, 0)?;
    let arm = d.arms.select(value)?;
    buffer_size_arm(ctx, mem, arm)
}

pub fn memory_size_non_encapsulated(
    ctx: &mut MemSizeCtx,
    d: &NonEncapsulatedUnionDesc,
) -> Result<u32> {
    let value = skip_switch_wire(ctx, d.switch_type)?;
    let arm = d.arms.select(value)?;
    let before = ctx.memory_size;
    memory_size_arm(ctx, arm)?;
    settle_memory_size(ctx, before, d.mem_size as u32);
    Ok(d.mem_size as u32)
}

pub fn free_non_encapsulated(
    env: &mut CallEnv,
    mem: MemPtr,
    d: &NonEncapsulatedUnionDesc,
) -> Result<()> {
    let value = corr::resolve_count(env, mem, &d.corr, 0)?;
    let arm = d.arms.select(value)?;
    free_arm(env, mem, arm)
}

// --- encapsulated unions ---

pub fn marshal_encapsulated(
    ctx: &mut MarshalCtx,
    mem: MemPtr,
    d: &EncapsulatedUnionDesc,
) -> Result<()> {
    base::marshal(ctx, mem, d.switch_type)?;
    let value = read_switch_mem(&ctx.env, mem, d.switch_type)?;
    let arm = d.arms.select(value)?;
    marshal_arm(ctx, mem.add(d.increment), arm)
}

pub fn unmarshal_encapsulated(
    ctx: &mut UnmarshalCtx,
    mem: &mut MemPtr,
    d: &EncapsulatedUnionDesc,
    must_alloc: bool,
) -> Result<()> {
    let value = read_switch_wire(ctx, d.switch_type)?;
    let arm = d.arms.select(value)?;
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(d.increment + d.mem_size as u32)?;
    }
    write_switch_mem(&mut ctx.env, *mem, d.switch_type, value)?;
    unmarshal_arm(ctx, mem.add(d.increment), arm, must_alloc)
}

pub fn buffer_size_encapsulated(
    ctx: &mut SizeCtx,
    mem: MemPtr,
    d: &EncapsulatedUnionDesc,
) -> Result<()> {
    base::buffer_size(ctx, d.switch_type);
    let value = read_switch_mem(&ctx.env, mem, d.switch_type)?;
    let arm = d.arms.select(value)?;
    buffer_size_arm(ctx, mem.add(d.increment), arm)
}

pub fn memory_size_encapsulated(ctx: &mut MemSizeCtx, d: &EncapsulatedUnionDesc) -> Result<u32> {
    let value = skip_switch_wire(ctx, d.switch_type)?;
    let arm = d.arms.select(value)?;
    let region = d.increment + d.mem_size as u32;
    let before = ctx.memory_size;
    memory_size_arm(ctx, arm)?;
    settle_memory_size(ctx, before, region);
    Ok(region)
}

pub fn free_encapsulated(env: &mut CallEnv, mem: MemPtr, d: &EncapsulatedUnionDesc) -> Result<()> {
    let value = read_switch_mem(env, mem, d.switch_type)?;
    let arm = d.arms.select(value)?;
    free_arm(env, mem.add(d.increment), arm)
}
