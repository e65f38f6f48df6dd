use bytes::Bytes;
use ndr_runtime::{
    engine, CallEnv, FormatString, MarshalCtx, MemArena, MemPtr, SizeCtx, StubDescriptor, TypeId,
    UnmarshalCtx,
};

/// Build a stub descriptor around a single type description at offset 0.
pub fn single_type(bytes: Vec<u8>) -> (StubDescriptor, TypeId) {
    let mut b = StubDescriptor::builder(FormatString::from(bytes), false);
    let ty = b.parse_type(0).expect("format string decodes");
    (b.build(), ty)
}

pub fn marshal(stub: &StubDescriptor, ty: TypeId, arena: &mut MemArena, mem: MemPtr) -> Bytes {
    let mut ctx = MarshalCtx::new(CallEnv::new(stub, arena));
    engine::marshal(&mut ctx, mem, ty).expect("marshal succeeds");
    ctx.finish()
}

pub fn unmarshal(stub: &StubDescriptor, ty: TypeId, arena: &mut MemArena, wire: &[u8]) -> MemPtr {
    let mut ctx = UnmarshalCtx::new(CallEnv::new(stub, arena), wire);
    let mut out = MemPtr::NULL;
    engine::unmarshal(&mut ctx, &mut out, ty, true).expect("unmarshal succeeds");
    out
}

pub fn buffer_size(stub: &StubDescriptor, ty: TypeId, arena: &mut MemArena, mem: MemPtr) -> usize {
    let mut ctx = SizeCtx::new(CallEnv::new(stub, arena));
    engine::buffer_size(&mut ctx, mem, ty).expect("buffer size succeeds");
    ctx.length
}
