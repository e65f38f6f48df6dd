//! Base-type operations
//!
//! Fixed-width scalars copy between memory and wire with natural alignment.
//! enum16 converts width: 16 bits on the wire, a 32-bit integer in memory,
//! and faults when the memory value does not fit the wire.

use tracing::trace;

use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::error::{Fault, Result};
use crate::fc::BaseType;
use crate::mem::MemPtr;

pub fn marshal(ctx: &mut MarshalCtx, mem: MemPtr, b: BaseType) -> Result<()> {
    match b.wire_size() {
        1 => {
            let v = ctx.env.mem.read_u8(mem)?;
            ctx.put_u8(v)?;
        }
        2 => {
            let v = if b == BaseType::Enum16 {
                let wide = ctx.env.mem.read_u32(mem)?;
                if wide > u16::MAX as u32 {
                    return Err(Fault::EnumOutOfRange(wide));
                }
                wide as u16
            } else {
                ctx.env.mem.read_u16(mem)?
            };
            ctx.align(2)?;
            ctx.put_u16(v)?;
        }
        4 => {
            let v = ctx.env.mem.read_u32(mem)?;
            ctx.align(4)?;
            ctx.put_u32(v)?;
        }
        _ => {
            let v = ctx.env.mem.read_u64(mem)?;
            ctx.align(8)?;
            ctx.put_u64(v)?;
        }
    }
    trace!(?b, "marshalled base type");
    Ok(())
}

pub fn unmarshal(ctx: &mut UnmarshalCtx, mem: &mut MemPtr, b: BaseType, must_alloc: bool) -> Result<()> {
    if must_alloc || mem.is_null() {
        *mem = ctx.env.mem.allocate(b.mem_size())?;
    }
    match b.wire_size() {
        1 => {
            let v = ctx.get_u8()?;
            ctx.env.mem.write_u8(*mem, v)?;
        }
        2 => {
            ctx.align(2)?;
            let v = ctx.get_u16()?;
            if b == BaseType::Enum16 {
                // 16 bits on the wire, a full integer in memory
                ctx.env.mem.write_u32(*mem, v as u32)?;
            } else {
                ctx.env.mem.write_u16(*mem, v)?;
            }
        }
        4 => {
            ctx.align(4)?;
            let v = ctx.get_u32()?;
            ctx.env.mem.write_u32(*mem, v)?;
        }
        _ => {
            ctx.align(8)?;
            let v = ctx.get_u64()?;
            ctx.env.mem.write_u64(*mem, v)?;
        }
    }
    Ok(())
}

pub fn buffer_size(ctx: &mut SizeCtx, b: BaseType) {
    ctx.align(b.wire_align());
    ctx.add(b.wire_size() as usize);
}

pub fn memory_size(ctx: &mut MemSizeCtx, b: BaseType) -> Result<u32> {
    ctx.align(b.wire_align())?;
    ctx.skip(b.wire_size() as usize)?;
    ctx.memory_size += b.mem_size();
    Ok(b.mem_size())
}

// base types own no referents; the free pass has nothing to do

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ByteOrder, MarshalCtx, UnmarshalCtx};
    use crate::format::FormatString;
    use crate::mem::{MemArena, NdrAllocator};
    use crate::stub::{CallEnv, StubDescriptor};

    fn stub() -> StubDescriptor {
        StubDescriptor::builder(FormatString::from(vec![0u8]), false).build()
    }

    #[test]
    fn enum16_range_fault() {
        let stub = stub();
        let mut arena = MemArena::new();
        let mem = arena.write_block(&0x1_0000u32.to_le_bytes());
        let mut ctx = MarshalCtx::new(CallEnv::new(&stub, &mut arena));
        let err = marshal(&mut ctx, mem, BaseType::Enum16).unwrap_err();
        assert!(matches!(err, Fault::EnumOutOfRange(0x1_0000)));
    }

    #[test]
    fn enum16_widens_in_memory() {
        let stub = stub();
        let mut arena = MemArena::new();
        let mem = arena.write_block(&0x1234u32.to_le_bytes());
        let mut ctx = MarshalCtx::new(CallEnv::new(&stub, &mut arena));
        marshal(&mut ctx, mem, BaseType::Enum16).unwrap();
        let wire = ctx.finish();
        assert_eq!(&wire[..], &[0x34, 0x12]);

        let mut arena2 = MemArena::new();
        let mut ctx = UnmarshalCtx::new(CallEnv::new(&stub, &mut arena2), &wire);
        let mut out = MemPtr::NULL;
        unmarshal(&mut ctx, &mut out, BaseType::Enum16, true).unwrap();
        assert_eq!(ctx.env.mem.read_u32(out).unwrap(), 0x1234);
    }

    #[test]
    fn big_endian_long() {
        let stub = stub();
        let mut arena = MemArena::new();
        let mem = arena.write_block(&0xdead_beefu32.to_le_bytes());
        let env = CallEnv::new(&stub, &mut arena).with_order(ByteOrder::Big);
        let mut ctx = MarshalCtx::new(env);
        marshal(&mut ctx, mem, BaseType::ULong).unwrap();
        assert_eq!(&ctx.finish()[..], &[0xde, 0xad, 0xbe, 0xef]);
    }
}
