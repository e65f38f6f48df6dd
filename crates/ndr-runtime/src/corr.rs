//! Correlation descriptors: conformance and variance
//!
//! Conformance is the declared maximum element count of an array or string;
//! variance is the actually transmitted count plus a starting offset. Both
//! are described by a correlation descriptor in the format string: 4 operand
//! bytes, or 6 when the stub descriptor carries the newer descriptor version
//! (the extra robust-flags word is not interpreted here).
//!
//! Descriptor layout:
//!
//! ```text
//! byte 0   high nibble: anchor class (normal / pointer / top-level /
//!          constant / top-level multidimensional)
//!          low nibble: integer type of the correlated field
//! byte 1   operator: 0, DEREFERENCE, DIV_2, MULT_2, ADD_1, SUB_1, CALLBACK
//! byte 2-3 signed field offset, callback index, or constant low word
//! ```
//!
//! The all-ones word is the "no descriptor" sentinel: the resolver returns
//! the caller-supplied default and touches nothing.
//!
//! Resolved values are returned to the caller and passed explicitly to the
//! consuming shape; they are never parked in shared cursor state.

use tracing::{trace, warn};

use crate::context::{MarshalCtx, MemSizeCtx, SizeCtx, UnmarshalCtx};
use crate::error::{Fault, Result};
use crate::fc;
use crate::format::FormatString;
use crate::mem::{MemPtr, NdrAllocator};
use crate::stub::CallEnv;

/// Resolved conformance and variance for one array instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub max: u32,
    pub actual: u32,
    pub offset: u32,
}

impl Counts {
    /// Fully transmitted: variance equals conformance.
    pub fn full(max: u32) -> Counts {
        Counts { max, actual: max, offset: 0 }
    }
}

/// Where the correlated field is anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrAnchor {
    /// Relative to the embedded position currently being marshalled
    Normal,
    /// Relative to the enclosing structure's base
    Pointer,
    /// Relative to the outermost stack argument
    TopLevel,
    /// Multidimensional top-level; unsupported, resolves to the default
    TopLevelMultiD,
}

/// Integer type of the correlated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrInt {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

/// Operator applied after locating the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrOp {
    None,
    Dereference,
    Div2,
    Mult2,
    Add1,
    Sub1,
}

/// A parsed correlation descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrDesc {
    /// Sentinel descriptor: no correlation, use the default
    None,
    /// 24-bit constant embedded in the descriptor
    Constant(u32),
    /// Read an integer field at a signed offset from the anchor
    Field { anchor: CorrAnchor, dtype: Option<CorrInt>, op: CorrOp, offset: i16 },
    /// Invoke the indexed expression evaluator with the anchor substituted
    Callback { anchor: CorrAnchor, index: u16 },
}

impl CorrDesc {
    pub fn is_present(&self) -> bool {
        !matches!(self, CorrDesc::None)
    }

    /// Operand width in the format string: 4 bytes, 6 with the new version.
    pub fn operand_len(robust: bool) -> usize {
        if robust {
            6
        } else {
            4
        }
    }

    /// Decode one correlation descriptor, returning it and the offset just
    /// past its operands.
    pub fn parse(fs: &FormatString, offset: usize, robust: bool) -> Result<(CorrDesc, usize)> {
        let next = offset + Self::operand_len(robust);
        if fs.u32_at(offset)? == u32::MAX {
            return Ok((CorrDesc::None, next));
        }

        let b0 = fs.u8_at(offset)?;
        let b1 = fs.u8_at(offset + 1)?;

        let anchor = match b0 & 0xf0 {
            fc::NORMAL_CONFORMANCE => CorrAnchor::Normal,
            fc::POINTER_CONFORMANCE => CorrAnchor::Pointer,
            fc::TOP_LEVEL_CONFORMANCE => CorrAnchor::TopLevel,
            fc::CONSTANT_CONFORMANCE => {
                let value = ((b1 as u32) << 16) | fs.u16_at(offset + 2)? as u32;
                return Ok((CorrDesc::Constant(value), next));
            }
            fc::TOP_LEVEL_MULTID_CONFORMANCE => CorrAnchor::TopLevelMultiD,
            other => {
                warn!(class = format_args!("{other:#04x}"), "unknown correlation anchor class");
                CorrAnchor::Normal
            }
        };

        if b1 == fc::CALLBACK {
            let index = fs.u16_at(offset + 2)?;
            return Ok((CorrDesc::Callback { anchor, index }, next));
        }

        let dtype = match b0 & 0x0f {
            fc::BYTE | fc::CHAR | fc::USMALL => Some(CorrInt::U8),
            fc::SMALL => Some(CorrInt::I8),
            fc::WCHAR | fc::USHORT => Some(CorrInt::U16),
            fc::SHORT => Some(CorrInt::I16),
            fc::ULONG => Some(CorrInt::U32),
            fc::LONG => Some(CorrInt::I32),
            other => {
                warn!(dtype = format_args!("{other:#03x}"), "unknown correlation data type");
                None
            }
        };

        let op = match b1 {
            0 => CorrOp::None,
            fc::DEREFERENCE => CorrOp::Dereference,
            fc::DIV_2 => CorrOp::Div2,
            fc::MULT_2 => CorrOp::Mult2,
            fc::ADD_1 => CorrOp::Add1,
            fc::SUB_1 => CorrOp::Sub1,
            other => {
                warn!(op = format_args!("{other:#04x}"), "unknown correlation operator");
                CorrOp::None
            }
        };

        let field_offset = fs.i16_at(offset + 2)?;
        Ok((CorrDesc::Field { anchor, dtype, op, offset: field_offset }, next))
    }
}

fn anchor_base(env: &CallEnv, mem_base: MemPtr, anchor: CorrAnchor) -> Option<MemPtr> {
    match anchor {
        CorrAnchor::Normal => Some(mem_base),
        CorrAnchor::Pointer => Some(env.memory),
        CorrAnchor::TopLevel => {
            if env.stack_top.is_null() {
                None
            } else {
                Some(env.stack_top)
            }
        }
        CorrAnchor::TopLevelMultiD => {
            warn!("top-level multidimensional conformance is unsupported");
            if env.stack_top.is_null() {
                None
            } else {
                Some(env.stack_top)
            }
        }
    }
}

fn read_correlated(env: &CallEnv, at: MemPtr, dtype: Option<CorrInt>) -> Result<u32> {
    let value = match dtype {
        Some(CorrInt::U8) => env.mem.read_u8(at)? as u32,
        Some(CorrInt::I8) => env.mem.read_u8(at)? as i8 as i32 as u32,
        Some(CorrInt::U16) => env.mem.read_u16(at)? as u32,
        Some(CorrInt::I16) => env.mem.read_u16(at)? as i16 as i32 as u32,
        Some(CorrInt::U32) | Some(CorrInt::I32) => env.mem.read_u32(at)?,
        None => 0,
    };
    Ok(value)
}

/// Resolve one count from a correlation descriptor.
///
/// An absent descriptor returns `default` without touching memory or wire.
pub fn resolve_count(env: &CallEnv, mem_base: MemPtr, desc: &CorrDesc, default: u32) -> Result<u32> {
    let count = match desc {
        CorrDesc::None => default,
        CorrDesc::Constant(v) => *v,
        CorrDesc::Callback { anchor, index } => {
            let base = anchor_base(env, mem_base, *anchor).unwrap_or(MemPtr::NULL);
            let eval = env.stub.expr_eval(*index)?;
            eval.eval(&*env.mem, base)
        }
        CorrDesc::Field { anchor, dtype, op, offset } => {
            let Some(base) = anchor_base(env, mem_base, *anchor) else {
                // no stack anchor registered for this call, the default
                // already carries the resolved value
                return Ok(default);
            };
            match op {
                CorrOp::Dereference => {
                    let at = env.mem.read_ptr(base.offset(*offset as i64))?;
                    read_correlated(env, at, *dtype)?
                }
                _ => {
                    let raw = read_correlated(env, base.offset(*offset as i64), *dtype)?;
                    match op {
                        CorrOp::Div2 => raw / 2,
                        CorrOp::Mult2 => raw.wrapping_mul(2),
                        CorrOp::Add1 => raw.wrapping_add(1),
                        CorrOp::Sub1 => raw.wrapping_sub(1),
                        _ => raw,
                    }
                }
            }
        }
    };
    trace!(count, "resolved correlation");
    Ok(count)
}

/// Resolve conformance for an array about to be walked.
pub fn resolve_conformance(env: &CallEnv, mem_base: MemPtr, desc: &CorrDesc, default: u32) -> Result<u32> {
    resolve_count(env, mem_base, desc, default)
}

/// Resolve variance. A present-but-trivial variance is shorthand for "fully
/// transmitted": `actual = max`, `offset = 0`.
pub fn resolve_variance(env: &CallEnv, mem_base: MemPtr, desc: &CorrDesc, max: u32) -> Result<Counts> {
    let actual = resolve_count(env, mem_base, desc, max)?;
    Ok(Counts { max, actual, offset: 0 })
}

// Wire helpers. Conformance and variance travel as aligned 4-byte words,
// conformance first when both are present.

pub fn write_conformance(ctx: &mut MarshalCtx, max: u32) -> Result<()> {
    ctx.align(4)?;
    ctx.put_u32(max)
}

pub fn write_variance(ctx: &mut MarshalCtx, counts: Counts) -> Result<()> {
    ctx.align(4)?;
    ctx.put_u32(counts.offset)?;
    ctx.put_u32(counts.actual)
}

pub fn read_conformance(ctx: &mut UnmarshalCtx) -> Result<u32> {
    ctx.align(4)?;
    let max = ctx.get_u32()?;
    trace!(max, "unmarshalled conformance");
    Ok(max)
}

pub fn read_variance(ctx: &mut UnmarshalCtx, max: u32) -> Result<Counts> {
    ctx.align(4)?;
    let offset = ctx.get_u32()?;
    let actual = ctx.get_u32()?;
    trace!(offset, actual, "unmarshalled variance");
    Ok(Counts { max, actual, offset })
}

pub fn size_conformance(ctx: &mut SizeCtx) {
    ctx.align(4);
    ctx.add(4);
}

pub fn size_variance(ctx: &mut SizeCtx) {
    ctx.align(4);
    ctx.add(8);
}

pub fn skip_conformance(ctx: &mut MemSizeCtx) -> Result<u32> {
    ctx.align(4)?;
    ctx.get_u32()
}

pub fn skip_variance(ctx: &mut MemSizeCtx) -> Result<(u32, u32)> {
    ctx.align(4)?;
    let offset = ctx.get_u32()?;
    let actual = ctx.get_u32()?;
    Ok((offset, actual))
}

/// The memory address of the correlated field itself, for shapes that
/// marshal the field directly (union discriminants). Only the plain
/// anchored form has an address.
pub fn field_address(env: &CallEnv, mem_base: MemPtr, desc: &CorrDesc) -> Result<MemPtr> {
    match desc {
        CorrDesc::Field { anchor, op: CorrOp::None, offset, .. } => {
            let base = anchor_base(env, mem_base, *anchor).ok_or(Fault::InvalidFormat {
                offset: 0,
                reason: "correlated field has no anchor in this call",
            })?;
            Ok(base.offset(*offset as i64))
        }
        _ => Err(Fault::InvalidFormat {
            offset: 0,
            reason: "correlation form carries no field address",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_descriptor() {
        let fs = FormatString::from(vec![0xff, 0xff, 0xff, 0xff]);
        let (d, next) = CorrDesc::parse(&fs, 0, false).unwrap();
        assert_eq!(d, CorrDesc::None);
        assert_eq!(next, 4);
    }

    #[test]
    fn constant_descriptor_is_24_bits() {
        let fs = FormatString::from(vec![fc::CONSTANT_CONFORMANCE, 0x01, 0x34, 0x12]);
        let (d, _) = CorrDesc::parse(&fs, 0, false).unwrap();
        assert_eq!(d, CorrDesc::Constant(0x011234));
    }

    #[test]
    fn field_descriptor_with_new_version_operands() {
        let fs = FormatString::from(vec![fc::NORMAL_CONFORMANCE | fc::LONG, 0, 0xfc, 0xff, 0, 0]);
        let (d, next) = CorrDesc::parse(&fs, 0, true).unwrap();
        assert_eq!(next, 6);
        assert_eq!(
            d,
            CorrDesc::Field {
                anchor: CorrAnchor::Normal,
                dtype: Some(CorrInt::I32),
                op: CorrOp::None,
                offset: -4,
            }
        );
    }

    #[test]
    fn callback_descriptor() {
        let fs = FormatString::from(vec![fc::TOP_LEVEL_CONFORMANCE, fc::CALLBACK, 0x02, 0x00]);
        let (d, _) = CorrDesc::parse(&fs, 0, false).unwrap();
        assert_eq!(d, CorrDesc::Callback { anchor: CorrAnchor::TopLevel, index: 2 });
    }
}
