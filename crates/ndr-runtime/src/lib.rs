//! NDR (Network Data Representation) marshalling engine
//!
//! A format-string-driven interpreter that serializes and deserializes
//! typed data into and out of a flat wire buffer, for use by a DCE RPC /
//! MS-RPCE transport. Type descriptions are compact byte sequences produced
//! by an external interface compiler; this crate decodes them once into a
//! shape graph and walks that graph for every call.
//!
//! # Wire model
//!
//! - Primitives align to their natural size (1, 2, 4 or 8 octets)
//! - Conformance (declared count) and variance (transmitted count and
//!   offset) travel as aligned 4-byte words, conformance first
//! - Ref pointers write no referent ID; unique and object pointers write a
//!   4-byte ID, zero meaning null
//! - Strings are conformant varying character runs with a terminator
//!
//! # Passes
//!
//! Every shape exposes five symmetric operations: marshal, unmarshal,
//! buffer-size, memory-size and free. The sizing passes are pure and may
//! run speculatively before any buffer or allocation exists.
//!
//! # Example
//!
//! ```
//! use ndr_runtime::{engine, CallEnv, FormatString, MarshalCtx, MemArena, MemPtr,
//!                   NdrAllocator, StubDescriptor, UnmarshalCtx};
//!
//! // description: a conformant string of narrow characters
//! let fs = FormatString::from(vec![0x22, 0x5c]);
//! let mut builder = StubDescriptor::builder(fs, false);
//! let ty = builder.parse_type(0).unwrap();
//! let stub = builder.build();
//!
//! let mut arena = MemArena::new();
//! let msg = arena.write_block(b"hello\0");
//! let mut ctx = MarshalCtx::new(CallEnv::new(&stub, &mut arena));
//! engine::marshal(&mut ctx, msg, ty).unwrap();
//! let wire = ctx.finish();
//!
//! let mut other = MemArena::new();
//! let mut ctx = UnmarshalCtx::new(CallEnv::new(&stub, &mut other), &wire);
//! let mut out = MemPtr::NULL;
//! engine::unmarshal(&mut ctx, &mut out, ty, true).unwrap();
//! assert_eq!(other.bytes(out, 6).unwrap(), b"hello\0");
//! ```

mod arrays;
mod base;
mod context;
mod corr;
mod error;
pub mod fc;
mod format;
mod graph;
mod mem;
mod pointer;
mod strings;
mod structs;
mod stub;
mod unions;
mod usermarshal;

pub mod engine;

pub use context::{align_padding, ByteOrder, MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
pub use corr::{CorrAnchor, CorrDesc, CorrInt, CorrOp, Counts};
pub use error::{Fault, Result};
pub use fc::BaseType;
pub use format::FormatString;
pub use graph::{
    ComplexArrayDesc, ComplexItem, ComplexStructDesc, ConformantArrayDesc, ConformantStringDesc,
    ConformantStructDesc, ConformantVaryingArrayDesc, ConformantVaryingStructDesc,
    EncapsulatedUnionDesc, FixedArrayDesc, FixedStringDesc, GraphBuilder,
    NonEncapsulatedUnionDesc, PointerAttrs, PointerDesc, PointerKind, PointerLayout,
    PointerTarget, Repeat, RepeatGroup, SimpleStructDesc, TypeDesc, TypeGraph, TypeId, UnionArm,
    UnionArms, UserMarshalDesc, VaryingArrayDesc,
};
pub use mem::{MemArena, MemPtr, NdrAllocator};
pub use stub::{CallEnv, ExprEval, StubDescriptor, StubDescriptorBuilder, UserMarshalFlags, UserMarshaller};

/// Re-export of the buffer crate used at the wire boundary.
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
