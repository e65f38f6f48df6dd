//! Stub descriptors and the per-call environment
//!
//! A stub descriptor is the per-interface static metadata bundle supplied by
//! the generated layer: the format string, the type graph decoded from it,
//! the expression-evaluator table for callback conformance, and the
//! user-marshal routine table. It is built once at load time and shared,
//! immutably, by every call on the interface.

use bytes::BytesMut;

use crate::context::ByteOrder;
use crate::error::{Fault, Result};
use crate::format::FormatString;
use crate::graph::{GraphBuilder, TypeDesc, TypeGraph, TypeId};
use crate::mem::{MemPtr, NdrAllocator};

/// An indexed conformance expression evaluator.
///
/// Invoked for callback-style correlation with the anchor pointer
/// substituted as the evaluation context. The engine treats the evaluator as
/// an opaque capability.
pub trait ExprEval: Send + Sync {
    fn eval(&self, mem: &dyn NdrAllocator, anchor: MemPtr) -> u32;
}

impl<F> ExprEval for F
where
    F: Fn(&dyn NdrAllocator, MemPtr) -> u32 + Send + Sync,
{
    fn eval(&self, mem: &dyn NdrAllocator, anchor: MemPtr) -> u32 {
        self(mem, anchor)
    }
}

/// The flags word passed to user-marshal routines: destination context plus
/// the negotiated wire byte order.
#[derive(Debug, Clone, Copy)]
pub struct UserMarshalFlags {
    pub dest_context: u32,
    pub order: ByteOrder,
}

/// An externally supplied marshalling quadruple for one opaque type index.
///
/// The engine does not interpret the payload beyond size bookkeeping when
/// the description declares a fixed wire size.
pub trait UserMarshaller: Send + Sync {
    /// Grow `current` by the wire footprint of `mem` and return the new total.
    fn buffer_size(&self, flags: &UserMarshalFlags, current: usize, mem: &[u8]) -> usize;

    fn marshal(&self, flags: &UserMarshalFlags, buf: &mut BytesMut, mem: &[u8]) -> Result<()>;

    /// Decode from `wire` into `mem`, returning the octets consumed.
    fn unmarshal(&self, flags: &UserMarshalFlags, wire: &[u8], mem: &mut [u8]) -> Result<usize>;

    fn free(&self, _flags: &UserMarshalFlags, _mem: &mut [u8]) {}
}

/// Per-interface static metadata: format string, decoded type graph,
/// injected capability tables.
pub struct StubDescriptor {
    format: FormatString,
    graph: TypeGraph,
    expr_eval: Vec<Box<dyn ExprEval>>,
    user_marshal: Vec<Box<dyn UserMarshaller>>,
    new_corr_desc: bool,
}

impl StubDescriptor {
    /// `new_corr_desc` selects the 6-byte correlation operand form.
    pub fn builder(format: FormatString, new_corr_desc: bool) -> StubDescriptorBuilder {
        StubDescriptorBuilder {
            gb: GraphBuilder::new(format.clone(), new_corr_desc),
            format,
            new_corr_desc,
            expr_eval: Vec::new(),
            user_marshal: Vec::new(),
        }
    }

    pub fn format(&self) -> &FormatString {
        &self.format
    }

    pub fn graph(&self) -> &TypeGraph {
        &self.graph
    }

    pub fn node(&self, id: TypeId) -> &TypeDesc {
        self.graph.node(id)
    }

    pub fn new_corr_desc(&self) -> bool {
        self.new_corr_desc
    }

    pub fn expr_eval(&self, index: u16) -> Result<&dyn ExprEval> {
        self.expr_eval
            .get(index as usize)
            .map(|b| b.as_ref())
            .ok_or(Fault::NoExprEval(index))
    }

    pub fn user_marshaller(&self, index: u16) -> Result<&dyn UserMarshaller> {
        self.user_marshal
            .get(index as usize)
            .map(|b| b.as_ref())
            .ok_or(Fault::NoUserMarshaller(index))
    }
}

/// Builds a [`StubDescriptor`], decoding type descriptions on demand.
pub struct StubDescriptorBuilder {
    format: FormatString,
    gb: GraphBuilder,
    new_corr_desc: bool,
    expr_eval: Vec<Box<dyn ExprEval>>,
    user_marshal: Vec<Box<dyn UserMarshaller>>,
}

impl StubDescriptorBuilder {
    /// Decode the type description at `offset` into the graph.
    pub fn parse_type(&mut self, offset: usize) -> Result<TypeId> {
        self.gb.parse_at(offset)
    }

    /// Register the next expression evaluator; indices are assigned in
    /// registration order.
    pub fn register_expr_eval(&mut self, eval: impl ExprEval + 'static) {
        self.expr_eval.push(Box::new(eval));
    }

    /// Register the next user-marshal quadruple; indices are assigned in
    /// registration order.
    pub fn register_user_marshaller(&mut self, routines: impl UserMarshaller + 'static) {
        self.user_marshal.push(Box::new(routines));
    }

    pub fn build(self) -> StubDescriptor {
        StubDescriptor {
            format: self.format,
            graph: self.gb.finish(),
            expr_eval: self.expr_eval,
            user_marshal: self.user_marshal,
            new_corr_desc: self.new_corr_desc,
        }
    }
}

/// Call-scoped environment shared by every pass: the stub descriptor, the
/// memory capability, the correlation anchors and the wire byte order.
///
/// One exclusive instance per call; nothing here is shared across calls.
pub struct CallEnv<'a> {
    pub stub: &'a StubDescriptor,
    pub mem: &'a mut dyn NdrAllocator,
    pub order: ByteOrder,
    /// Anchor for pointer-relative correlation: the enclosing structure base
    pub memory: MemPtr,
    /// Anchor for top-level correlation: the outermost stack argument
    pub stack_top: MemPtr,
    /// Memory unmarshalled in place of the transport buffer is borrowed, not
    /// owned, and must never reach the deallocator
    pub reuse_buffer: bool,
    /// Destination context forwarded to user-marshal routines
    pub dest_context: u32,
}

impl<'a> CallEnv<'a> {
    pub fn new(stub: &'a StubDescriptor, mem: &'a mut dyn NdrAllocator) -> Self {
        Self {
            stub,
            mem,
            order: ByteOrder::Little,
            memory: MemPtr::NULL,
            stack_top: MemPtr::NULL,
            reuse_buffer: false,
            dest_context: 0,
        }
    }

    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_stack_top(mut self, stack_top: MemPtr) -> Self {
        self.stack_top = stack_top;
        self
    }

    /// Graph access detached from the borrow of the environment, so shape
    /// descriptions can be held across mutating operations.
    pub fn graph(&self) -> &'a TypeGraph {
        self.stub.graph()
    }

    pub fn node(&self, id: TypeId) -> &'a TypeDesc {
        self.stub.graph().node(id)
    }

    pub fn user_flags(&self) -> UserMarshalFlags {
        UserMarshalFlags { dest_context: self.dest_context, order: self.order }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fc;

    #[test]
    fn builder_decodes_and_registers() {
        let fs = FormatString::from(vec![fc::LONG, fc::SHORT]);
        let mut b = StubDescriptor::builder(fs, false);
        let long = b.parse_type(0).unwrap();
        let short = b.parse_type(1).unwrap();
        b.register_expr_eval(|_mem: &dyn NdrAllocator, _top: MemPtr| 7u32);
        let stub = b.build();
        assert!(matches!(stub.node(long), TypeDesc::Base(crate::fc::BaseType::Long)));
        assert!(matches!(stub.node(short), TypeDesc::Base(crate::fc::BaseType::Short)));
        let arena = crate::mem::MemArena::new();
        assert_eq!(stub.expr_eval(0).unwrap().eval(&arena, MemPtr::NULL), 7);
        assert!(stub.expr_eval(1).is_err());
    }
}
