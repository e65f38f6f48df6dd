//! Shape dispatch
//!
//! The five symmetric entry points of the engine. Each is a single `match`
//! over the decoded [`TypeDesc`], replacing byte-indexed operation tables: a
//! decoded node always carries all five operations, and the only no-op path
//! is the explicit forward-compatibility one for unknown format characters.
//!
//! Exactly one operation runs per logical value per pass. The sizing passes
//! are pure: buffer-size only grows its running total, memory-size only
//! reads the wire.

use tracing::{trace, warn};

use crate::arrays;
use crate::base;
use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::error::Result;
use crate::graph::{TypeDesc, TypeId};
use crate::mem::MemPtr;
use crate::pointer;
use crate::structs;
use crate::strings;
use crate::stub::CallEnv;
use crate::unions;
use crate::usermarshal;

/// Serialize the value at `mem` according to `ty`. For pointer shapes `mem`
/// is the pointer itself.
pub fn marshal(ctx: &mut MarshalCtx, mem: MemPtr, ty: TypeId) -> Result<()> {
    trace!(?ty, pos = ctx.pos(), "marshal");
    match ctx.env.node(ty) {
        TypeDesc::Base(b) => base::marshal(ctx, mem, *b),
        TypeDesc::Pointer(d) => pointer::marshal(ctx, mem, d),
        TypeDesc::SimpleStruct(d) => structs::marshal_simple(ctx, mem, d),
        TypeDesc::ConformantStruct(d) => structs::marshal_conformant(ctx, mem, d),
        TypeDesc::ConformantVaryingStruct(d) => structs::marshal_conformant_varying(ctx, mem, d),
        TypeDesc::ComplexStruct(d) => structs::marshal_complex(ctx, mem, d),
        TypeDesc::FixedArray(d) => arrays::marshal_fixed(ctx, mem, d),
        TypeDesc::VaryingArray(d) => arrays::marshal_varying(ctx, mem, d),
        TypeDesc::ConformantArray(d) => arrays::marshal_conformant(ctx, mem, d).map(|_| ()),
        TypeDesc::ConformantVaryingArray(d) => {
            arrays::marshal_conformant_varying(ctx, mem, d).map(|_| ())
        }
        TypeDesc::ComplexArray(d) => arrays::marshal_complex(ctx, mem, d),
        TypeDesc::ConformantString(d) => strings::marshal_conformant(ctx, mem, d),
        TypeDesc::FixedString(d) => strings::marshal_fixed(ctx, mem, d),
        TypeDesc::EncapsulatedUnion(d) => unions::marshal_encapsulated(ctx, mem, d),
        TypeDesc::NonEncapsulatedUnion(d) => unions::marshal_non_encapsulated(ctx, mem, d),
        TypeDesc::UserMarshal(d) => usermarshal::marshal(ctx, mem, d),
        TypeDesc::Unsupported(t) => {
            warn!(tag = format_args!("{t:#04x}"), "no marshaller for format character");
            Ok(())
        }
    }
}

/// Deserialize one value into `mem`. A null `mem` (or `must_alloc`) makes
/// the engine allocate; the allocation transfers to the caller, who routes
/// it back through [`free`].
pub fn unmarshal(ctx: &mut UnmarshalCtx, mem: &mut MemPtr, ty: TypeId, must_alloc: bool) -> Result<()> {
    trace!(?ty, pos = ctx.pos, "unmarshal");
    match ctx.env.node(ty) {
        TypeDesc::Base(b) => base::unmarshal(ctx, mem, *b, must_alloc),
        TypeDesc::Pointer(d) => pointer::unmarshal(ctx, mem, d, must_alloc),
        TypeDesc::SimpleStruct(d) => structs::unmarshal_simple(ctx, mem, d, must_alloc),
        TypeDesc::ConformantStruct(d) => structs::unmarshal_conformant(ctx, mem, d, must_alloc),
        TypeDesc::ConformantVaryingStruct(d) => {
            structs::unmarshal_conformant_varying(ctx, mem, d, must_alloc)
        }
        TypeDesc::ComplexStruct(d) => structs::unmarshal_complex(ctx, mem, d, must_alloc),
        TypeDesc::FixedArray(d) => arrays::unmarshal_fixed(ctx, mem, d, must_alloc),
        TypeDesc::VaryingArray(d) => arrays::unmarshal_varying(ctx, mem, d, must_alloc),
        TypeDesc::ConformantArray(d) => {
            arrays::unmarshal_conformant(ctx, mem, d, must_alloc).map(|_| ())
        }
        TypeDesc::ConformantVaryingArray(d) => {
            arrays::unmarshal_conformant_varying(ctx, mem, d, must_alloc).map(|_| ())
        }
        TypeDesc::ComplexArray(d) => arrays::unmarshal_complex(ctx, mem, d, must_alloc),
        TypeDesc::ConformantString(d) => strings::unmarshal_conformant(ctx, mem, d, must_alloc),
        TypeDesc::FixedString(d) => strings::unmarshal_fixed(ctx, mem, d, must_alloc),
        TypeDesc::EncapsulatedUnion(d) => unions::unmarshal_encapsulated(ctx, mem, d, must_alloc),
        TypeDesc::NonEncapsulatedUnion(d) => {
            unions::unmarshal_non_encapsulated(ctx, mem, d, must_alloc)
        }
        TypeDesc::UserMarshal(d) => usermarshal::unmarshal(ctx, mem, d, must_alloc),
        TypeDesc::Unsupported(t) => {
            warn!(tag = format_args!("{t:#04x}"), "no unmarshaller for format character");
            Ok(())
        }
    }
}

/// Accumulate the wire footprint of the value at `mem`. Read-only on
/// memory; may be run speculatively before any buffer exists.
pub fn buffer_size(ctx: &mut SizeCtx, mem: MemPtr, ty: TypeId) -> Result<()> {
    match ctx.env.node(ty) {
        TypeDesc::Base(b) => {
            base::buffer_size(ctx, *b);
            Ok(())
        }
        TypeDesc::Pointer(d) => pointer::buffer_size(ctx, mem, d),
        TypeDesc::SimpleStruct(d) => structs::buffer_size_simple(ctx, mem, d),
        TypeDesc::ConformantStruct(d) => structs::buffer_size_conformant(ctx, mem, d),
        TypeDesc::ConformantVaryingStruct(d) => {
            structs::buffer_size_conformant_varying(ctx, mem, d)
        }
        TypeDesc::ComplexStruct(d) => structs::buffer_size_complex(ctx, mem, d),
        TypeDesc::FixedArray(d) => arrays::buffer_size_fixed(ctx, mem, d),
        TypeDesc::VaryingArray(d) => arrays::buffer_size_varying(ctx, mem, d),
        TypeDesc::ConformantArray(d) => arrays::buffer_size_conformant(ctx, mem, d).map(|_| ()),
        TypeDesc::ConformantVaryingArray(d) => {
            arrays::buffer_size_conformant_varying(ctx, mem, d).map(|_| ())
        }
        TypeDesc::ComplexArray(d) => arrays::buffer_size_complex(ctx, mem, d),
        TypeDesc::ConformantString(d) => strings::buffer_size_conformant(ctx, mem, d),
        TypeDesc::FixedString(d) => strings::buffer_size_fixed(ctx, mem, d),
        TypeDesc::EncapsulatedUnion(d) => unions::buffer_size_encapsulated(ctx, mem, d),
        TypeDesc::NonEncapsulatedUnion(d) => unions::buffer_size_non_encapsulated(ctx, mem, d),
        TypeDesc::UserMarshal(d) => usermarshal::buffer_size(ctx, mem, d),
        TypeDesc::Unsupported(t) => {
            warn!(tag = format_args!("{t:#04x}"), "no buffer sizer for format character");
            Ok(())
        }
    }
}

/// Walk the wire image computing the allocation footprint of the described
/// value, without allocating anything.
pub fn memory_size(ctx: &mut MemSizeCtx, ty: TypeId) -> Result<u32> {
    match ctx.env.node(ty) {
        TypeDesc::Base(b) => base::memory_size(ctx, *b),
        TypeDesc::Pointer(d) => pointer::memory_size(ctx, d),
        TypeDesc::SimpleStruct(d) => structs::memory_size_simple(ctx, d),
        TypeDesc::ConformantStruct(d) => structs::memory_size_conformant(ctx, d),
        TypeDesc::ComplexStruct(d) => structs::memory_size_complex(ctx, d),
        TypeDesc::FixedArray(d) => arrays::memory_size_fixed(ctx, d),
        TypeDesc::VaryingArray(d) => arrays::memory_size_varying(ctx, d),
        TypeDesc::ConformantArray(d) => arrays::memory_size_conformant(ctx, d),
        TypeDesc::ConformantVaryingArray(d) => arrays::memory_size_conformant_varying(ctx, d),
        TypeDesc::ComplexArray(d) => arrays::memory_size_complex(ctx, d),
        TypeDesc::ConformantString(d) => strings::memory_size_conformant(ctx, d),
        TypeDesc::FixedString(d) => strings::memory_size_fixed(ctx, d),
        TypeDesc::EncapsulatedUnion(d) => unions::memory_size_encapsulated(ctx, d),
        TypeDesc::NonEncapsulatedUnion(d) => unions::memory_size_non_encapsulated(ctx, d),
        TypeDesc::UserMarshal(d) => usermarshal::memory_size(ctx, d),
        TypeDesc::ConformantVaryingStruct(_) | TypeDesc::Unsupported(_) => {
            warn!("no memory sizer for this shape");
            Ok(0)
        }
    }
}

/// Release engine-allocated referents reachable from `mem`, honoring the
/// don't-free and on-stack attributes and the buffer-reuse policy.
pub fn free(env: &mut CallEnv, mem: MemPtr, ty: TypeId) -> Result<()> {
    match env.node(ty) {
        // base types and strings own no referents; string storage is
        // released by the pointer that owns it
        TypeDesc::Base(_) | TypeDesc::ConformantString(_) | TypeDesc::FixedString(_) => Ok(()),
        TypeDesc::Pointer(d) => pointer::free(env, mem, d),
        TypeDesc::SimpleStruct(d) => structs::free_simple(env, mem, d),
        TypeDesc::ConformantStruct(d) => structs::free_conformant(env, mem, d),
        TypeDesc::ConformantVaryingStruct(d) => structs::free_conformant_varying(env, mem, d),
        TypeDesc::ComplexStruct(d) => structs::free_complex(env, mem, d),
        TypeDesc::FixedArray(d) => arrays::free_fixed(env, mem, d),
        TypeDesc::VaryingArray(d) => arrays::free_varying(env, mem, d),
        TypeDesc::ConformantArray(d) => arrays::free_conformant(env, mem, d),
        TypeDesc::ConformantVaryingArray(d) => arrays::free_conformant_varying(env, mem, d),
        TypeDesc::ComplexArray(d) => arrays::free_complex(env, mem, d),
        TypeDesc::EncapsulatedUnion(d) => unions::free_encapsulated(env, mem, d),
        TypeDesc::NonEncapsulatedUnion(d) => unions::free_non_encapsulated(env, mem, d),
        TypeDesc::UserMarshal(d) => usermarshal::free(env, mem, d),
        TypeDesc::Unsupported(t) => {
            warn!(tag = format_args!("{t:#04x}"), "no freer for format character");
            Ok(())
        }
    }
}
