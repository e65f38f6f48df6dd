//! The type graph
//!
//! Format strings are decoded exactly once, when the stub descriptor is
//! built: every type description becomes a node in an arena and every signed
//! relative offset is resolved into an arena index. Shared sub-descriptions
//! (the compiler deduplicates repeated embedded types heavily) decode through
//! a by-offset memo table, which also lets self-referential descriptions
//! (linked lists) terminate.
//!
//! Unknown format characters do not fail the load. The format language is
//! versioned and forward compatibility is required: an unknown character
//! becomes an [`TypeDesc::Unsupported`] node whose operations log and
//! continue as no-ops.

use std::collections::HashMap;

use tracing::warn;

use crate::corr::CorrDesc;
use crate::error::{Fault, Result};
use crate::fc::{self, BaseType};
use crate::format::FormatString;

/// Index of a decoded type description in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(u32);

/// Pointer disciplines on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    /// Always present, no referent ID word
    Ref,
    /// Nullable, 4-byte referent ID, zero means null
    Unique,
    /// As unique, but an existing referent is released before overwriting
    Object,
    /// Aliasing-capable full pointer; recognized but unsupported
    Full,
}

/// Pointer attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerAttrs(pub u8);

impl PointerAttrs {
    pub fn allocate_all_nodes(self) -> bool {
        self.0 & fc::P_ALLOCALLNODES != 0
    }
    pub fn dont_free(self) -> bool {
        self.0 & fc::P_DONTFREE != 0
    }
    pub fn on_stack(self) -> bool {
        self.0 & fc::P_ONSTACK != 0
    }
    pub fn simple_pointer(self) -> bool {
        self.0 & fc::P_SIMPLEPOINTER != 0
    }
    pub fn deref(self) -> bool {
        self.0 & fc::P_DEREF != 0
    }
}

#[derive(Debug, Clone)]
pub struct PointerDesc {
    pub kind: PointerKind,
    pub attrs: PointerAttrs,
    pub pointee: TypeId,
}

/// How often an embedded-pointer group repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repeat {
    /// Exactly one pointer at a fixed offset
    Once,
    /// N pointers at `offset + i * stride`
    Fixed(u32),
    /// Count taken from the enclosing array's resolved conformance; when
    /// variance-relative, positions shift by the variance offset
    Variable { variance_relative: bool },
}

/// One `(memory offset, buffer offset, pointee)` triple of a repeat group.
#[derive(Debug, Clone)]
pub struct PointerTarget {
    pub mem_offset: i16,
    pub buf_offset: i16,
    pub pointer: PointerDesc,
}

#[derive(Debug, Clone)]
pub struct RepeatGroup {
    pub repeat: Repeat,
    pub stride: u32,
    pub targets: Vec<PointerTarget>,
}

/// A parsed embedded-pointer description.
#[derive(Debug, Clone, Default)]
pub struct PointerLayout {
    pub groups: Vec<RepeatGroup>,
}

#[derive(Debug, Clone)]
pub struct SimpleStructDesc {
    pub align: u32,
    pub mem_size: u32,
    pub ptrs: Option<PointerLayout>,
}

#[derive(Debug, Clone)]
pub struct ConformantStructDesc {
    pub align: u32,
    pub mem_size: u32,
    pub array: TypeId,
    pub ptrs: Option<PointerLayout>,
}

#[derive(Debug, Clone)]
pub struct ConformantVaryingStructDesc {
    pub align: u32,
    pub mem_size: u32,
    pub array: TypeId,
    pub ptrs: Option<PointerLayout>,
}

/// One member of a complex (interleaved) field stream.
#[derive(Debug, Clone)]
pub enum ComplexItem {
    Base(BaseType),
    /// A pointer member; its description comes from the parallel pointer
    /// stream, fused into the field list at load time
    Pointer(PointerDesc),
    /// Round the memory cursor up
    AlignTo(u32),
    /// Skip memory pad bytes that have no wire representation
    MemPad(u32),
    /// An embedded sub-shape, preceded by memory padding
    Embedded { mem_pad: u32, ty: TypeId },
}

#[derive(Debug, Clone)]
pub struct ComplexStructDesc {
    pub align: u32,
    pub mem_size: u32,
    pub conf_array: Option<TypeId>,
    pub fields: Vec<ComplexItem>,
}

#[derive(Debug, Clone)]
pub struct FixedArrayDesc {
    pub align: u32,
    pub total_size: u32,
    pub ptrs: Option<PointerLayout>,
}

#[derive(Debug, Clone)]
pub struct VaryingArrayDesc {
    pub align: u32,
    pub total_size: u32,
    pub elem_count: u32,
    pub elem_size: u32,
    pub variance: CorrDesc,
    pub ptrs: Option<PointerLayout>,
}

#[derive(Debug, Clone)]
pub struct ConformantArrayDesc {
    pub align: u32,
    pub elem_size: u32,
    pub conf: CorrDesc,
    pub ptrs: Option<PointerLayout>,
}

#[derive(Debug, Clone)]
pub struct ConformantVaryingArrayDesc {
    pub align: u32,
    pub elem_size: u32,
    pub conf: CorrDesc,
    pub variance: CorrDesc,
    pub ptrs: Option<PointerLayout>,
}

#[derive(Debug, Clone)]
pub struct ComplexArrayDesc {
    pub align: u32,
    pub default_count: u16,
    pub conf: CorrDesc,
    pub variance: CorrDesc,
    pub fields: Vec<ComplexItem>,
}

#[derive(Debug, Clone)]
pub struct ConformantStringDesc {
    pub wide: bool,
    /// `[size_is]` strings: conformance from a descriptor instead of the
    /// measured length
    pub sized: Option<CorrDesc>,
}

#[derive(Debug, Clone)]
pub struct FixedStringDesc {
    pub wide: bool,
    pub max: u16,
}

/// The payload selected by one union discriminant value.
#[derive(Debug, Clone)]
pub enum UnionArm {
    /// No payload; the wire carries nothing past the discriminant
    Empty,
    Base(BaseType),
    Ty(TypeId),
}

#[derive(Debug, Clone)]
pub struct UnionArms {
    pub arms: Vec<(u32, UnionArm)>,
    /// `None` when the description declares no default: an unmatched
    /// discriminant is a fault
    pub default: Option<UnionArm>,
}

impl UnionArms {
    /// Linear scan; interface-defined arm counts are small and static.
    pub fn select(&self, discriminant: u32) -> Result<&UnionArm> {
        for (value, arm) in &self.arms {
            if *value == discriminant {
                return Ok(arm);
            }
        }
        self.default.as_ref().ok_or(Fault::NoUnionDefault(discriminant))
    }
}

#[derive(Debug, Clone)]
pub struct EncapsulatedUnionDesc {
    pub switch_type: BaseType,
    /// Memory displacement from the union base to the arm data
    pub increment: u32,
    pub mem_size: u16,
    pub arms: UnionArms,
}

#[derive(Debug, Clone)]
pub struct NonEncapsulatedUnionDesc {
    pub switch_type: BaseType,
    /// Locates the discriminant in memory
    pub corr: CorrDesc,
    pub mem_size: u16,
    pub arms: UnionArms,
}

#[derive(Debug, Clone)]
pub struct UserMarshalDesc {
    pub flags: u8,
    pub index: u16,
    pub mem_size: u16,
    /// Non-zero when the wire size is fixed; sizing then bypasses the routine
    pub wire_size: u16,
}

/// One decoded type description.
#[derive(Debug, Clone)]
pub enum TypeDesc {
    Base(BaseType),
    Pointer(PointerDesc),
    SimpleStruct(SimpleStructDesc),
    ConformantStruct(ConformantStructDesc),
    ConformantVaryingStruct(ConformantVaryingStructDesc),
    ComplexStruct(ComplexStructDesc),
    FixedArray(FixedArrayDesc),
    VaryingArray(VaryingArrayDesc),
    ConformantArray(ConformantArrayDesc),
    ConformantVaryingArray(ConformantVaryingArrayDesc),
    ComplexArray(ComplexArrayDesc),
    ConformantString(ConformantStringDesc),
    FixedString(FixedStringDesc),
    EncapsulatedUnion(EncapsulatedUnionDesc),
    NonEncapsulatedUnion(NonEncapsulatedUnionDesc),
    UserMarshal(UserMarshalDesc),
    /// Recognized-but-unknown format character: logged no-op
    Unsupported(u8),
}

/// The decoded, immutable shape graph. Shareable across calls and threads.
#[derive(Debug, Default)]
pub struct TypeGraph {
    nodes: Vec<TypeDesc>,
    by_offset: HashMap<usize, TypeId>,
}

impl TypeGraph {
    pub fn node(&self, id: TypeId) -> &TypeDesc {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The id a given format-string offset decoded to, if any.
    pub fn id_at(&self, offset: usize) -> Option<TypeId> {
        self.by_offset.get(&offset).copied()
    }

    /// Flat memory footprint of a shape embedded inside another, used to
    /// step the memory cursor over embedded members.
    pub fn memory_size_of(&self, id: TypeId) -> u32 {
        match self.node(id) {
            TypeDesc::Base(b) => b.mem_size(),
            TypeDesc::Pointer(_) => 4,
            TypeDesc::SimpleStruct(d) => d.mem_size,
            TypeDesc::ConformantStruct(d) => d.mem_size,
            TypeDesc::ConformantVaryingStruct(d) => d.mem_size,
            TypeDesc::ComplexStruct(d) => d.mem_size,
            TypeDesc::FixedArray(d) => d.total_size,
            TypeDesc::VaryingArray(d) => d.total_size,
            TypeDesc::EncapsulatedUnion(d) => d.increment + d.mem_size as u32,
            TypeDesc::NonEncapsulatedUnion(d) => d.mem_size as u32,
            TypeDesc::UserMarshal(d) => d.mem_size as u32,
            other => {
                warn!(?other, "no flat memory footprint for embedded shape");
                0
            }
        }
    }
}

/// Decodes format strings into a [`TypeGraph`].
pub struct GraphBuilder {
    fs: FormatString,
    robust: bool,
    nodes: Vec<TypeDesc>,
    by_offset: HashMap<usize, TypeId>,
}

impl GraphBuilder {
    /// `robust` selects the 6-byte correlation operand form.
    pub fn new(fs: FormatString, robust: bool) -> Self {
        Self { fs, robust, nodes: Vec::new(), by_offset: HashMap::new() }
    }

    pub fn finish(self) -> TypeGraph {
        TypeGraph { nodes: self.nodes, by_offset: self.by_offset }
    }


    /// Decode the type description starting at `offset`, memoized.
    pub fn parse_at(&mut self, offset: usize) -> Result<TypeId> {
        if let Some(id) = self.by_offset.get(&offset) {
            return Ok(*id);
        }
        // reserve the slot first so recursive descriptions terminate
        let id = TypeId(self.nodes.len() as u32);
        self.nodes.push(TypeDesc::Unsupported(0));
        self.by_offset.insert(offset, id);

        let desc = self.parse_desc(offset)?;
        self.nodes[id.0 as usize] = desc;
        Ok(id)
    }

    fn parse_desc(&mut self, offset: usize) -> Result<TypeDesc> {
        let tag = self.fs.u8_at(offset)?;
        if let Some(b) = BaseType::from_fc(tag) {
            return Ok(TypeDesc::Base(b));
        }
        match tag {
            fc::RP | fc::UP | fc::OP | fc::FP => {
                Ok(TypeDesc::Pointer(self.parse_pointer_desc(offset)?))
            }
            fc::STRUCT | fc::PSTRUCT => self.parse_simple_struct(offset, tag),
            fc::CSTRUCT | fc::CPSTRUCT => self.parse_conformant_struct(offset, tag),
            fc::CVSTRUCT => self.parse_conformant_varying_struct(offset),
            fc::BOGUS_STRUCT => self.parse_complex_struct(offset),
            fc::CARRAY => self.parse_conformant_array(offset),
            fc::CVARRAY => self.parse_conformant_varying_array(offset),
            fc::SMFARRAY | fc::LGFARRAY => self.parse_fixed_array(offset, tag),
            fc::SMVARRAY | fc::LGVARRAY => self.parse_varying_array(offset, tag),
            fc::BOGUS_ARRAY => self.parse_complex_array(offset),
            fc::C_CSTRING | fc::C_WSTRING => self.parse_conformant_string(offset, tag),
            fc::CSTRING | fc::WSTRING => self.parse_fixed_string(offset, tag),
            fc::ENCAPSULATED_UNION => self.parse_encapsulated_union(offset),
            fc::NON_ENCAPSULATED_UNION => self.parse_non_encapsulated_union(offset),
            fc::USER_MARSHAL => self.parse_user_marshal(offset),
            other => {
                warn!(tag = format_args!("{other:#04x}"), offset, "unknown format character");
                Ok(TypeDesc::Unsupported(other))
            }
        }
    }

    fn parse_pointer_desc(&mut self, offset: usize) -> Result<PointerDesc> {
        let kind = match self.fs.u8_at(offset)? {
            fc::RP => PointerKind::Ref,
            fc::UP => PointerKind::Unique,
            fc::OP => PointerKind::Object,
            fc::FP => PointerKind::Full,
            found => return Err(Fault::UnexpectedTag { expected: "pointer", found }),
        };
        let attrs = PointerAttrs(self.fs.u8_at(offset + 1)?);
        let pointee = if attrs.simple_pointer() {
            // the two operand bytes hold the pointee description inline
            self.parse_at(offset + 2)?
        } else {
            let target = self.fs.rel_target(offset + 2)?;
            self.parse_at(target)?
        };
        Ok(PointerDesc { kind, attrs, pointee })
    }

    /// An embedded-pointer description, or `None` when the byte at `offset`
    /// does not start one.
    fn parse_pointer_layout(&mut self, offset: usize) -> Result<Option<PointerLayout>> {
        if self.fs.u8_at(offset)? != fc::PP {
            return Ok(None);
        }
        let mut cur = offset + 2;
        let mut groups = Vec::new();
        loop {
            let tag = self.fs.u8_at(cur)?;
            if tag == fc::END {
                break;
            }
            let (repeat, stride, count) = match tag {
                fc::FIXED_REPEAT => {
                    let rep = self.fs.u16_at(cur + 2)? as u32;
                    let stride = self.fs.u16_at(cur + 4)? as u32;
                    let count = self.fs.u16_at(cur + 8)? as u32;
                    cur += 10;
                    (Repeat::Fixed(rep), stride, count)
                }
                fc::VARIABLE_REPEAT => {
                    let variance_relative = self.fs.u8_at(cur + 1)? == fc::VARIABLE_OFFSET;
                    let stride = self.fs.u16_at(cur + 2)? as u32;
                    let count = self.fs.u16_at(cur + 6)? as u32;
                    cur += 8;
                    (Repeat::Variable { variance_relative }, stride, count)
                }
                other => {
                    if other != fc::NO_REPEAT {
                        warn!(tag = format_args!("{other:#04x}"), "unknown repeat group");
                    }
                    cur += 2;
                    (Repeat::Once, 0, 1)
                }
            };
            let mut targets = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let mem_offset = self.fs.i16_at(cur)?;
                let buf_offset = self.fs.i16_at(cur + 2)?;
                let pointer = self.parse_pointer_desc(cur + 4)?;
                targets.push(PointerTarget { mem_offset, buf_offset, pointer });
                cur += 8;
            }
            groups.push(RepeatGroup { repeat, stride, targets });
        }
        Ok(Some(PointerLayout { groups }))
    }

    fn parse_simple_struct(&mut self, offset: usize, tag: u8) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let mem_size = self.fs.u16_at(offset + 2)? as u32;
        let ptrs = if tag == fc::PSTRUCT {
            self.parse_pointer_layout(offset + 4)?
        } else {
            None
        };
        Ok(TypeDesc::SimpleStruct(SimpleStructDesc { align, mem_size, ptrs }))
    }

    fn parse_conformant_struct(&mut self, offset: usize, tag: u8) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let mem_size = self.fs.u16_at(offset + 2)? as u32;
        if self.fs.i16_at(offset + 4)? == 0 {
            return Err(Fault::InvalidFormat {
                offset,
                reason: "conformant struct without trailing array description",
            });
        }
        let array = {
            let target = self.fs.rel_target(offset + 4)?;
            self.parse_at(target)?
        };
        let ptrs = if tag == fc::CPSTRUCT {
            self.parse_pointer_layout(offset + 6)?
        } else {
            None
        };
        Ok(TypeDesc::ConformantStruct(ConformantStructDesc { align, mem_size, array, ptrs }))
    }

    fn parse_conformant_varying_struct(&mut self, offset: usize) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let mem_size = self.fs.u16_at(offset + 2)? as u32;
        if self.fs.i16_at(offset + 4)? == 0 {
            return Err(Fault::InvalidFormat {
                offset,
                reason: "conformant varying struct without trailing array description",
            });
        }
        let array = {
            let target = self.fs.rel_target(offset + 4)?;
            self.parse_at(target)?
        };
        let ptrs = self.parse_pointer_layout(offset + 6)?;
        Ok(TypeDesc::ConformantVaryingStruct(ConformantVaryingStructDesc {
            align,
            mem_size,
            array,
            ptrs,
        }))
    }

    /// The complex-struct member stream and its parallel pointer-description
    /// stream, fused at load. The two streams are only synchronized by
    /// construction of the compiler; a POINTER member without a pointer
    /// stream entry is a load-time fault.
    fn parse_complex_fields(
        &mut self,
        mut cur: usize,
        mut pointer_stream: Option<usize>,
    ) -> Result<Vec<ComplexItem>> {
        let mut fields = Vec::new();
        loop {
            let tag = self.fs.u8_at(cur)?;
            if tag == fc::END {
                break;
            }
            if let Some(b) = BaseType::from_fc(tag) {
                fields.push(ComplexItem::Base(b));
                cur += 1;
                continue;
            }
            match tag {
                fc::POINTER => {
                    let Some(ps) = pointer_stream else {
                        return Err(Fault::InvalidFormat {
                            offset: cur,
                            reason: "pointer member without a pointer description stream",
                        });
                    };
                    let pd = self.parse_pointer_desc(ps)?;
                    pointer_stream = Some(ps + 4);
                    fields.push(ComplexItem::Pointer(pd));
                    cur += 1;
                }
                fc::RP | fc::UP | fc::OP | fc::FP => {
                    // inline pointer description in the member stream
                    let pd = self.parse_pointer_desc(cur)?;
                    fields.push(ComplexItem::Pointer(pd));
                    cur += 4;
                }
                fc::ALIGNM2 => {
                    fields.push(ComplexItem::AlignTo(2));
                    cur += 1;
                }
                fc::ALIGNM4 => {
                    fields.push(ComplexItem::AlignTo(4));
                    cur += 1;
                }
                fc::ALIGNM8 => {
                    fields.push(ComplexItem::AlignTo(8));
                    cur += 1;
                }
                t @ fc::STRUCTPAD1..=fc::STRUCTPAD7 => {
                    fields.push(ComplexItem::MemPad((t - fc::STRUCTPAD1 + 1) as u32));
                    cur += 1;
                }
                fc::EMBEDDED_COMPLEX => {
                    let mem_pad = self.fs.u8_at(cur + 1)? as u32;
                    let target = self.fs.rel_target(cur + 2)?;
                    let ty = self.parse_at(target)?;
                    fields.push(ComplexItem::Embedded { mem_pad, ty });
                    cur += 4;
                }
                fc::PAD => {
                    cur += 1;
                }
                other => {
                    warn!(
                        tag = format_args!("{other:#04x}"),
                        offset = cur,
                        "unknown member format character"
                    );
                    cur += 1;
                }
            }
        }
        Ok(fields)
    }

    fn parse_complex_struct(&mut self, offset: usize) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let mem_size = self.fs.u16_at(offset + 2)? as u32;
        let conf_array = if self.fs.i16_at(offset + 4)? != 0 {
            let target = self.fs.rel_target(offset + 4)?;
            Some(self.parse_at(target)?)
        } else {
            None
        };
        let pointer_stream = if self.fs.i16_at(offset + 6)? != 0 {
            Some(self.fs.rel_target(offset + 6)?)
        } else {
            None
        };
        let fields = self.parse_complex_fields(offset + 8, pointer_stream)?;
        Ok(TypeDesc::ComplexStruct(ComplexStructDesc { align, mem_size, conf_array, fields }))
    }

    fn parse_conformant_array(&mut self, offset: usize) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let elem_size = self.fs.u16_at(offset + 2)? as u32;
        let (conf, after) = CorrDesc::parse(&self.fs, offset + 4, self.robust)?;
        let ptrs = self.parse_pointer_layout(after)?;
        Ok(TypeDesc::ConformantArray(ConformantArrayDesc { align, elem_size, conf, ptrs }))
    }

    fn parse_conformant_varying_array(&mut self, offset: usize) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let elem_size = self.fs.u16_at(offset + 2)? as u32;
        let (conf, after) = CorrDesc::parse(&self.fs, offset + 4, self.robust)?;
        let (variance, after) = CorrDesc::parse(&self.fs, after, self.robust)?;
        let ptrs = self.parse_pointer_layout(after)?;
        Ok(TypeDesc::ConformantVaryingArray(ConformantVaryingArrayDesc {
            align,
            elem_size,
            conf,
            variance,
            ptrs,
        }))
    }

    fn parse_fixed_array(&mut self, offset: usize, tag: u8) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let (total_size, after) = if tag == fc::SMFARRAY {
            (self.fs.u16_at(offset + 2)? as u32, offset + 4)
        } else {
            (self.fs.u32_at(offset + 2)?, offset + 6)
        };
        let ptrs = self.parse_pointer_layout(after)?;
        Ok(TypeDesc::FixedArray(FixedArrayDesc { align, total_size, ptrs }))
    }

    fn parse_varying_array(&mut self, offset: usize, tag: u8) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let (total_size, elem_count, after) = if tag == fc::SMVARRAY {
            (
                self.fs.u16_at(offset + 2)? as u32,
                self.fs.u16_at(offset + 4)? as u32,
                offset + 6,
            )
        } else {
            (self.fs.u32_at(offset + 2)?, self.fs.u32_at(offset + 6)?, offset + 10)
        };
        let elem_size = self.fs.u16_at(after)? as u32;
        let (variance, after) = CorrDesc::parse(&self.fs, after + 2, self.robust)?;
        let ptrs = self.parse_pointer_layout(after)?;
        Ok(TypeDesc::VaryingArray(VaryingArrayDesc {
            align,
            total_size,
            elem_count,
            elem_size,
            variance,
            ptrs,
        }))
    }

    fn parse_complex_array(&mut self, offset: usize) -> Result<TypeDesc> {
        let align = self.fs.u8_at(offset + 1)? as u32 + 1;
        let default_count = self.fs.u16_at(offset + 2)?;
        let (conf, after) = CorrDesc::parse(&self.fs, offset + 4, self.robust)?;
        let (variance, after) = CorrDesc::parse(&self.fs, after, self.robust)?;
        let fields = self.parse_complex_fields(after, None)?;
        Ok(TypeDesc::ComplexArray(ComplexArrayDesc {
            align,
            default_count,
            conf,
            variance,
            fields,
        }))
    }

    fn parse_conformant_string(&mut self, offset: usize, tag: u8) -> Result<TypeDesc> {
        let wide = tag == fc::C_WSTRING;
        let sized = if self.fs.u8_at(offset + 1)? == fc::STRING_SIZED {
            let (corr, _) = CorrDesc::parse(&self.fs, offset + 2, self.robust)?;
            Some(corr)
        } else {
            None
        };
        Ok(TypeDesc::ConformantString(ConformantStringDesc { wide, sized }))
    }

    fn parse_fixed_string(&mut self, offset: usize, tag: u8) -> Result<TypeDesc> {
        let wide = tag == fc::WSTRING;
        let max = self.fs.u16_at(offset + 2)?;
        Ok(TypeDesc::FixedString(FixedStringDesc { wide, max }))
    }

    fn parse_arm_slot(&mut self, offset: usize) -> Result<UnionArm> {
        let raw = self.fs.u16_at(offset)?;
        if raw == 0 {
            return Ok(UnionArm::Empty);
        }
        if raw & 0xff00 == 0x8000 {
            let b = BaseType::from_fc((raw & 0xff) as u8).ok_or(Fault::InvalidFormat {
                offset,
                reason: "inline union arm is not a base type",
            })?;
            return Ok(UnionArm::Base(b));
        }
        let target = self.fs.rel_target(offset)?;
        Ok(UnionArm::Ty(self.parse_at(target)?))
    }

    /// `[arm count | alignment][value, arm]*[default arm]`
    fn parse_arm_table(&mut self, offset: usize) -> Result<UnionArms> {
        let count = (self.fs.u16_at(offset)? & 0x0fff) as usize;
        let mut cur = offset + 2;
        let mut arms = Vec::with_capacity(count);
        for _ in 0..count {
            let value = self.fs.u32_at(cur)?;
            let arm = self.parse_arm_slot(cur + 4)?;
            arms.push((value, arm));
            cur += 6;
        }
        let default = match self.fs.u16_at(cur)? {
            0xffff => None,
            0 => Some(UnionArm::Empty),
            _ => Some(self.parse_arm_slot(cur)?),
        };
        Ok(UnionArms { arms, default })
    }

    fn parse_encapsulated_union(&mut self, offset: usize) -> Result<TypeDesc> {
        let switch = self.fs.u8_at(offset + 1)?;
        let switch_type = BaseType::from_fc(switch & 0x0f).ok_or(Fault::InvalidFormat {
            offset,
            reason: "union switch is not a base type",
        })?;
        let increment = ((switch & 0xf0) >> 4) as u32;
        let mem_size = self.fs.u16_at(offset + 2)?;
        let arms = self.parse_arm_table(offset + 4)?;
        Ok(TypeDesc::EncapsulatedUnion(EncapsulatedUnionDesc {
            switch_type,
            increment,
            mem_size,
            arms,
        }))
    }

    fn parse_non_encapsulated_union(&mut self, offset: usize) -> Result<TypeDesc> {
        let switch_type = BaseType::from_fc(self.fs.u8_at(offset + 1)?).ok_or(
            Fault::InvalidFormat { offset, reason: "union switch is not a base type" },
        )?;
        let (corr, after) = CorrDesc::parse(&self.fs, offset + 2, self.robust)?;
        let table = self.fs.rel_target(after)?;
        let mem_size = self.fs.u16_at(table)?;
        let arms = self.parse_arm_table(table + 2)?;
        Ok(TypeDesc::NonEncapsulatedUnion(NonEncapsulatedUnionDesc {
            switch_type,
            corr,
            mem_size,
            arms,
        }))
    }

    fn parse_user_marshal(&mut self, offset: usize) -> Result<TypeDesc> {
        let flags = self.fs.u8_at(offset + 1)?;
        let index = self.fs.u16_at(offset + 2)?;
        let mem_size = self.fs.u16_at(offset + 4)?;
        let wire_size = self.fs.u16_at(offset + 6)?;
        Ok(TypeDesc::UserMarshal(UserMarshalDesc { flags, index, mem_size, wire_size }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(bytes: Vec<u8>) -> (TypeGraph, TypeId) {
        let fs = FormatString::from(bytes);
        let mut b = GraphBuilder::new(fs, false);
        let id = b.parse_at(0).unwrap();
        (b.finish(), id)
    }

    #[test]
    fn base_type_node() {
        let (g, id) = build(vec![fc::LONG]);
        assert!(matches!(g.node(id), TypeDesc::Base(BaseType::Long)));
    }

    #[test]
    fn simple_pointer_to_long() {
        let (g, id) = build(vec![fc::UP, fc::P_SIMPLEPOINTER, fc::LONG, fc::PAD]);
        let TypeDesc::Pointer(p) = g.node(id) else { panic!("not a pointer") };
        assert_eq!(p.kind, PointerKind::Unique);
        assert!(matches!(g.node(p.pointee), TypeDesc::Base(BaseType::Long)));
    }

    #[test]
    fn shared_subdescriptions_decode_once() {
        // two pointers whose offset operands resolve to the same long
        let bytes = vec![
            fc::UP, 0, 0x06, 0x00, // offset field at 2 -> 8
            fc::UP, 0, 0x02, 0x00, // offset field at 6 -> 8
            fc::LONG, fc::PAD,
        ];
        let fs = FormatString::from(bytes);
        let mut b = GraphBuilder::new(fs, false);
        let a = b.parse_at(0).unwrap();
        let c = b.parse_at(4).unwrap();
        let g = b.finish();
        let (TypeDesc::Pointer(pa), TypeDesc::Pointer(pc)) = (g.node(a), g.node(c)) else {
            panic!("not pointers")
        };
        assert_eq!(pa.pointee, pc.pointee);
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn self_referential_description_terminates() {
        // struct { long; next: *self }, the classic linked list
        let mut bytes = vec![
            fc::PSTRUCT, 3, 0x08, 0x00, // align 4, size 8
            fc::PP, fc::PAD,
            fc::NO_REPEAT, fc::PAD,
            0x04, 0x00, 0x04, 0x00, // mem and buffer offset 4
            fc::UP, 0, 0x00, 0x00, // offset field at 14, patched below
            fc::END,
            fc::LONG, fc::LONG, fc::END,
        ];
        // back-pointer: the offset field lives at 14, the target is 0
        let disp = (0i32 - 14) as i16;
        bytes[14..16].copy_from_slice(&disp.to_le_bytes());
        let (g, id) = build(bytes);
        let TypeDesc::SimpleStruct(s) = g.node(id) else { panic!("not a struct") };
        let layout = s.ptrs.as_ref().unwrap();
        let target = &layout.groups[0].targets[0];
        assert_eq!(target.pointer.pointee, id);
    }

    #[test]
    fn unknown_tag_is_a_noop_node() {
        let (g, id) = build(vec![0x7f]);
        assert!(matches!(g.node(id), TypeDesc::Unsupported(0x7f)));
    }

    #[test]
    fn conformant_array_with_constant_conformance() {
        let (g, id) = build(vec![
            fc::CARRAY, 1, 0x02, 0x00, // align 2, element size 2
            fc::CONSTANT_CONFORMANCE, 0, 0x03, 0x00,
            fc::SHORT, fc::END,
        ]);
        let TypeDesc::ConformantArray(a) = g.node(id) else { panic!("not an array") };
        assert_eq!(a.elem_size, 2);
        assert_eq!(a.conf, CorrDesc::Constant(3));
    }

    #[test]
    fn pointer_member_without_stream_faults() {
        let fs = FormatString::from(vec![
            fc::BOGUS_STRUCT, 3, 0x08, 0x00,
            0x00, 0x00, // no conformant array
            0x00, 0x00, // no pointer stream
            fc::LONG, fc::POINTER, fc::END,
        ]);
        let mut b = GraphBuilder::new(fs, false);
        assert!(b.parse_at(0).is_err());
    }
}
