//! Round-trip coverage across the shape families, plus ownership policy.

mod common;

use common::{buffer_size, marshal, single_type, unmarshal};
use bytes::BytesMut;
use ndr_runtime::{
    engine, fc, CallEnv, Fault, FormatString, MarshalCtx, MemArena, MemPtr, NdrAllocator,
    StubDescriptor, UnmarshalCtx, UserMarshalFlags, UserMarshaller,
};

#[test]
fn base_types_round_trip() {
    for (desc, block, wire_len) in [
        (vec![fc::BYTE], vec![0xffu8], 1),
        (vec![fc::SHORT], (-12345i16).to_le_bytes().to_vec(), 2),
        (vec![fc::ULONG], u32::MAX.to_le_bytes().to_vec(), 4),
        (vec![fc::HYPER], (-1i64).to_le_bytes().to_vec(), 8),
        (vec![fc::FLOAT], 1.5f32.to_le_bytes().to_vec(), 4),
        (vec![fc::DOUBLE], (-2.25f64).to_le_bytes().to_vec(), 8),
        (vec![fc::ENUM32], 7u32.to_le_bytes().to_vec(), 4),
    ] {
        let (stub, ty) = single_type(desc);
        let mut arena = MemArena::new();
        let mem = arena.write_block(&block);
        let wire = marshal(&stub, ty, &mut arena, mem);
        assert_eq!(wire.len(), wire_len);

        let mut other = MemArena::new();
        let out = unmarshal(&stub, ty, &mut other, &wire);
        assert_eq!(other.bytes(out, block.len() as u32).unwrap(), &block[..]);
    }
}

/// A flat struct with no embedded pointers is one body copy.
#[test]
fn simple_struct_round_trip() {
    let (stub, ty) = single_type(vec![
        fc::STRUCT,
        3, // align 4
        0x08, 0x00,
        fc::LONG, fc::LONG, fc::END,
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&0xaaaa_bbbbu32.to_le_bytes());
    block.extend_from_slice(&0xcccc_ddddu32.to_le_bytes());
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    assert_eq!(&wire[..], &block[..]);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(8));
    assert_eq!(other.bytes(out, 8).unwrap(), &block[..]);
}

/// `struct { long count; short data[count]; }` as a conformant struct; the
/// conformance field sits just before the array in the same block.
#[test]
fn conformant_struct_allocates_in_one_piece() {
    let (stub, ty) = single_type(vec![
        fc::CSTRUCT,
        3, // align 4
        0x04, 0x00, // fixed part size
        0x02, 0x00, // offset field at 4 -> array description at 6
        fc::CARRAY,
        1,
        0x02, 0x00,
        fc::NORMAL_CONFORMANCE | fc::LONG, 0x00, 0xfc, 0xff, // count at array base - 4
        fc::SHORT, fc::END,
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&3u32.to_le_bytes());
    for v in [5i16, 6, 7] {
        block.extend_from_slice(&v.to_le_bytes());
    }
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    // body, conformance, elements
    assert_eq!(wire.len(), 4 + 4 + 6);
    assert_eq!(&wire[4..8], &3u32.to_le_bytes());

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(10));
    assert_eq!(other.bytes(out, 10).unwrap(), &block[..]);

    assert_eq!(buffer_size(&stub, ty, &mut arena, mem), wire.len());
}

/// Fixed arrays carry no header at all.
#[test]
fn fixed_array_round_trip() {
    let (stub, ty) = single_type(vec![
        fc::SMFARRAY,
        1, // align 2
        0x06, 0x00, // total size
        fc::SHORT, fc::END,
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    for v in [11i16, 22, 33] {
        block.extend_from_slice(&v.to_le_bytes());
    }
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    assert_eq!(wire.len(), 6);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.bytes(out, 6).unwrap(), &block[..]);
}

/// Varying arrays transmit `[offset][actual]` then the window.
#[test]
fn varying_array_round_trip() {
    let (stub, ty) = single_type(vec![
        fc::SMVARRAY,
        1, // align 2
        0x08, 0x00, // total size
        0x04, 0x00, // declared element count
        0x02, 0x00, // element size
        fc::CONSTANT_CONFORMANCE, 0x00, 0x03, 0x00, // actual count 3
        fc::SHORT, fc::END,
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    for v in [1i16, 2, 3, 4] {
        block.extend_from_slice(&v.to_le_bytes());
    }
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    assert_eq!(&wire[0..4], &0u32.to_le_bytes());
    assert_eq!(&wire[4..8], &3u32.to_le_bytes());
    assert_eq!(wire.len(), 8 + 6);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(8));
    assert_eq!(other.bytes(out, 6).unwrap(), &block[..6]);
}

/// Complex struct `{ char c; long l; long *p; }` with the pointer coming
/// from the parallel description stream.
fn bogus_struct_format() -> Vec<u8> {
    vec![
        fc::BOGUS_STRUCT,
        3, // align 4
        0x0c, 0x00, // memory size 12
        0x00, 0x00, // no conformant tail
        0x07, 0x00, // pointer stream: field at 6 -> 13
        fc::CHAR, fc::ALIGNM4, fc::LONG, fc::POINTER, fc::END,
        fc::UP, fc::P_SIMPLEPOINTER, fc::LONG, fc::PAD,
    ]
}

#[test]
fn complex_struct_round_trip() {
    let (stub, ty) = single_type(bogus_struct_format());
    let mut arena = MemArena::new();
    let referent = arena.write_block(&0x5555u32.to_le_bytes());
    let mut block = vec![b'x', 0, 0, 0];
    block.extend_from_slice(&0x12345678u32.to_le_bytes());
    block.extend_from_slice(&referent.0.to_le_bytes());
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    // char, pad, long, id, referent
    assert_eq!(wire.len(), 1 + 3 + 4 + 4 + 4);
    assert_eq!(wire[0], b'x');
    assert_eq!(&wire[4..8], &0x12345678u32.to_le_bytes());
    assert_eq!(&wire[12..16], &0x5555u32.to_le_bytes());

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.read_u8(out).unwrap(), b'x');
    assert_eq!(other.read_u32(out.add(4)).unwrap(), 0x12345678);
    let p = other.read_ptr(out.add(8)).unwrap();
    assert_eq!(other.read_u32(p).unwrap(), 0x5555);

    assert_eq!(buffer_size(&stub, ty, &mut arena, mem), wire.len());
}

/// Complex array of `{ short; long }` elements, conformance constant,
/// variance omitted. Element size comes from a dry-run scan.
#[test]
fn complex_array_round_trip() {
    let (stub, ty) = single_type(vec![
        fc::BOGUS_ARRAY,
        3, // align 4
        0x00, 0x00, // no default count
        fc::CONSTANT_CONFORMANCE, 0x00, 0x02, 0x00,
        0xff, 0xff, 0xff, 0xff, // no variance
        fc::SHORT, fc::ALIGNM4, fc::LONG, fc::END,
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    for (s, l) in [(1i16, 100u32), (2, 200)] {
        block.extend_from_slice(&s.to_le_bytes());
        block.extend_from_slice(&[0, 0]);
        block.extend_from_slice(&l.to_le_bytes());
    }
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    // conformance, then per element: short, pad, long
    assert_eq!(wire.len(), 4 + 8 + 8);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(16));
    assert_eq!(other.bytes(out, 16).unwrap(), &block[..]);
}

/// Non-encapsulated union switched by a sibling short at offset -4.
fn non_encapsulated_union_format(default_arm: [u8; 2]) -> Vec<u8> {
    let mut f = vec![
        fc::NON_ENCAPSULATED_UNION,
        fc::SHORT,
        fc::NORMAL_CONFORMANCE | fc::SHORT, 0x00, 0xfc, 0xff, // discriminant at base - 4
        0x02, 0x00, // offset field at 6 -> arm table at 8
        0x04, 0x00, // arm region memory size
        0x02, 0x00, // two arms
        0x01, 0x00, 0x00, 0x00, 0x08, 0x80, // 1 => long
        0x02, 0x00, 0x00, 0x00, 0x06, 0x80, // 2 => short
    ];
    f.extend_from_slice(&default_arm);
    f
}

#[test]
fn non_encapsulated_union_selects_arm() {
    let (stub, ty) = single_type(non_encapsulated_union_format([0x00, 0x00]));
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&1i16.to_le_bytes());
    block.extend_from_slice(&[0, 0]);
    block.extend_from_slice(&0xa1b2c3d4u32.to_le_bytes());
    let base = arena.write_block(&block);
    let union_mem = base.add(4);

    let wire = marshal(&stub, ty, &mut arena, union_mem);
    // short discriminant, pad, long arm
    assert_eq!(wire.len(), 8);
    assert_eq!(&wire[0..2], &1i16.to_le_bytes());
    assert_eq!(&wire[4..8], &0xa1b2c3d4u32.to_le_bytes());

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.read_u32(out).unwrap(), 0xa1b2c3d4);
}

/// An unmatched discriminant takes the no-payload default arm: nothing
/// past the discriminant on the wire.
#[test]
fn union_default_arm_writes_no_payload() {
    let (stub, ty) = single_type(non_encapsulated_union_format([0x00, 0x00]));
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&9i16.to_le_bytes());
    block.extend_from_slice(&[0, 0]);
    block.extend_from_slice(&0u32.to_le_bytes());
    let base = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, base.add(4));
    assert_eq!(wire.len(), 2);
}

/// Without a declared default, an unmatched discriminant is a fault.
#[test]
fn union_without_default_faults() {
    let (stub, ty) = single_type(non_encapsulated_union_format([0xff, 0xff]));
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&9i16.to_le_bytes());
    block.extend_from_slice(&[0, 0]);
    block.extend_from_slice(&0u32.to_le_bytes());
    let base = arena.write_block(&block);

    let mut ctx = MarshalCtx::new(CallEnv::new(&stub, &mut arena));
    let err = engine::marshal(&mut ctx, base.add(4), ty).unwrap_err();
    assert!(matches!(err, Fault::NoUnionDefault(9)));
}

/// Encapsulated union: the discriminant lives inside the union memory and
/// the arm follows at the declared increment.
#[test]
fn encapsulated_union_round_trip() {
    let (stub, ty) = single_type(vec![
        fc::ENCAPSULATED_UNION,
        0x47, // ushort switch, arm at +4
        0x04, 0x00, // arm region size
        0x01, 0x00, // one arm
        0x05, 0x00, 0x00, 0x00, 0x08, 0x80, // 5 => long
        0x00, 0x00, // default: no payload
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&5u16.to_le_bytes());
    block.extend_from_slice(&[0, 0]);
    block.extend_from_slice(&0xabu32.to_le_bytes());
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    assert_eq!(wire.len(), 8);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(8));
    assert_eq!(other.read_u16(out).unwrap(), 5);
    assert_eq!(other.read_u32(out.add(4)).unwrap(), 0xab);
}

/// Callback conformance: the count comes from a registered evaluator with
/// the anchor pointer substituted.
#[test]
fn callback_conformance() {
    let mut b = StubDescriptor::builder(
        FormatString::from(vec![
            fc::CARRAY,
            1,
            0x02, 0x00,
            fc::NORMAL_CONFORMANCE, fc::CALLBACK, 0x00, 0x00, // evaluator index 0
            fc::SHORT, fc::END,
        ]),
        false,
    );
    let ty = b.parse_type(0).unwrap();
    b.register_expr_eval(|mem: &dyn NdrAllocator, anchor: MemPtr| {
        // count stored as the first short of the array itself
        mem.read_u16(anchor).map(|v| v as u32).unwrap_or(0)
    });
    let stub = b.build();

    let mut arena = MemArena::new();
    let mut block = Vec::new();
    for v in [2i16, 7] {
        block.extend_from_slice(&v.to_le_bytes());
    }
    let mem = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, mem);
    assert_eq!(&wire[0..4], &2u32.to_le_bytes());
    assert_eq!(wire.len(), 8);
}

/// Arithmetic correlation: the stored field holds twice the element count.
#[test]
fn divide_by_two_conformance() {
    let (stub, ty) = single_type(vec![
        fc::CARRAY,
        1,
        0x02, 0x00,
        fc::NORMAL_CONFORMANCE | fc::LONG, fc::DIV_2, 0xfc, 0xff, // field at base - 4
        fc::SHORT, fc::END,
    ]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    block.extend_from_slice(&6u32.to_le_bytes()); // 2 * count
    for v in [4i16, 5, 6] {
        block.extend_from_slice(&v.to_le_bytes());
    }
    let base = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, base.add(4));
    assert_eq!(&wire[0..4], &3u32.to_le_bytes());
    assert_eq!(wire.len(), 10);
}

/// Sized strings take conformance from the descriptor, not the measured
/// length.
#[test]
fn sized_conformant_string() {
    let (stub, ty) = single_type(vec![
        fc::C_CSTRING,
        fc::STRING_SIZED,
        fc::CONSTANT_CONFORMANCE, 0x00, 0x0a, 0x00, // declared max 10
    ]);
    let mut arena = MemArena::new();
    let msg = arena.write_block(b"hi\0");

    let wire = marshal(&stub, ty, &mut arena, msg);
    assert_eq!(&wire[0..4], &10u32.to_le_bytes());
    assert_eq!(&wire[8..12], &3u32.to_le_bytes());
    assert_eq!(&wire[12..15], b"hi\0");

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(3));
}

/// Bounded (non-conformant) strings keep the declared buffer in memory.
#[test]
fn fixed_string_round_trip() {
    let (stub, ty) = single_type(vec![fc::CSTRING, fc::PAD, 0x08, 0x00]);
    let mut arena = MemArena::new();
    let msg = arena.write_block(b"abc\0");

    let wire = marshal(&stub, ty, &mut arena, msg);
    assert_eq!(&wire[0..4], &0u32.to_le_bytes());
    assert_eq!(&wire[4..8], &4u32.to_le_bytes());
    assert_eq!(&wire[8..12], b"abc\0");

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(8));
    assert_eq!(other.bytes(out, 4).unwrap(), b"abc\0");
}

#[test]
fn wide_string_round_trip() {
    let (stub, ty) = single_type(vec![fc::C_WSTRING, fc::PAD]);
    let mut arena = MemArena::new();
    let mut block = Vec::new();
    for ch in [0x68u16, 0x69, 0] {
        block.extend_from_slice(&ch.to_le_bytes());
    }
    let msg = arena.write_block(&block);

    let wire = marshal(&stub, ty, &mut arena, msg);
    assert_eq!(&wire[0..4], &3u32.to_le_bytes());
    assert_eq!(wire.len(), 12 + 6);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.allocation_len(out), Some(6));
    assert_eq!(other.bytes(out, 6).unwrap(), &block[..]);
}

/// A self-referential description: `struct node { long v; node *next; }`.
fn linked_list_format() -> Vec<u8> {
    let mut f = vec![
        fc::PSTRUCT,
        3,
        0x08, 0x00,
        fc::PP, fc::PAD,
        fc::NO_REPEAT, fc::PAD,
        0x04, 0x00,
        0x04, 0x00,
        fc::UP, 0x00, 0x00, 0x00, // offset field at 14, patched below
        fc::END,
        fc::LONG, fc::LONG, fc::END,
    ];
    let disp = (0i32 - 14) as i16;
    f[14..16].copy_from_slice(&disp.to_le_bytes());
    f
}

#[test]
fn linked_list_round_trip_and_free() {
    let (stub, ty) = single_type(linked_list_format());
    let mut arena = MemArena::new();
    let mut tail = Vec::new();
    tail.extend_from_slice(&2u32.to_le_bytes());
    tail.extend_from_slice(&0u32.to_le_bytes());
    let node2 = arena.write_block(&tail);
    let mut head = Vec::new();
    head.extend_from_slice(&1u32.to_le_bytes());
    head.extend_from_slice(&node2.0.to_le_bytes());
    let node1 = arena.write_block(&head);

    let wire = marshal(&stub, ty, &mut arena, node1);
    assert_eq!(wire.len(), 16);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.read_u32(out).unwrap(), 1);
    let next = other.read_ptr(out.add(4)).unwrap();
    assert_eq!(other.read_u32(next).unwrap(), 2);
    assert!(other.read_ptr(next.add(4)).unwrap().is_null());

    // the free pass releases the engine-allocated referent chain; the top
    // block belongs to the caller
    let mut env = CallEnv::new(&stub, &mut other);
    engine::free(&mut env, out, ty).unwrap();
    assert!(!other.is_live(next));
    assert!(other.is_live(out));
}

/// Don't-free pointers never reach the deallocator.
#[test]
fn dont_free_attribute_is_honored() {
    let mut f = linked_list_format();
    f[13] = fc::P_DONTFREE;
    // the attribute change removes no operands; pointee offset still valid
    let (stub, ty) = single_type(f);
    let mut arena = MemArena::new();
    let mut tail = Vec::new();
    tail.extend_from_slice(&2u32.to_le_bytes());
    tail.extend_from_slice(&0u32.to_le_bytes());
    let node2 = arena.write_block(&tail);
    let mut head = Vec::new();
    head.extend_from_slice(&1u32.to_le_bytes());
    head.extend_from_slice(&node2.0.to_le_bytes());
    let node1 = arena.write_block(&head);

    let mut env = CallEnv::new(&stub, &mut arena);
    engine::free(&mut env, node1, ty).unwrap();
    assert!(arena.freed().is_empty());
}

/// String referents stay with the transport buffer when it was reused.
#[test]
fn buffer_reused_strings_are_not_freed() {
    let (stub, ty) = single_type(vec![fc::UP, fc::P_SIMPLEPOINTER, fc::C_CSTRING, fc::PAD]);
    let mut arena = MemArena::new();
    let s = arena.write_block(b"hi\0");

    let mut env = CallEnv::new(&stub, &mut arena);
    env.reuse_buffer = true;
    engine::free(&mut env, s, ty).unwrap();
    assert!(arena.freed().is_empty());

    let mut env = CallEnv::new(&stub, &mut arena);
    engine::free(&mut env, s, ty).unwrap();
    assert_eq!(arena.freed(), &[s.0]);
}

struct MagicQuad;

impl UserMarshaller for MagicQuad {
    fn buffer_size(&self, _f: &UserMarshalFlags, current: usize, _mem: &[u8]) -> usize {
        current + 8
    }

    fn marshal(&self, _f: &UserMarshalFlags, buf: &mut BytesMut, mem: &[u8]) -> ndr_runtime::Result<()> {
        buf.extend_from_slice(b"MAGC");
        buf.extend_from_slice(&mem[..4]);
        Ok(())
    }

    fn unmarshal(&self, _f: &UserMarshalFlags, wire: &[u8], mem: &mut [u8]) -> ndr_runtime::Result<usize> {
        if &wire[..4] != b"MAGC" {
            return Err(Fault::UserMarshal("bad magic".into()));
        }
        mem[..4].copy_from_slice(&wire[4..8]);
        Ok(8)
    }
}

/// Opaque types delegate to the registered quadruple; a declared fixed wire
/// size keeps the sizing pass out of the routine.
#[test]
fn user_marshal_delegates() {
    let mut b = StubDescriptor::builder(
        FormatString::from(vec![
            fc::USER_MARSHAL,
            0x00,
            0x00, 0x00, // quadruple index 0
            0x04, 0x00, // memory size
            0x08, 0x00, // fixed wire size
            0x00, 0x00,
        ]),
        false,
    );
    let ty = b.parse_type(0).unwrap();
    b.register_user_marshaller(MagicQuad);
    let stub = b.build();

    let mut arena = MemArena::new();
    let mem = arena.write_block(&0x77u32.to_le_bytes());

    let wire = marshal(&stub, ty, &mut arena, mem);
    assert_eq!(&wire[..4], b"MAGC");
    assert_eq!(buffer_size(&stub, ty, &mut arena, mem), 8);

    let mut other = MemArena::new();
    let out = unmarshal(&stub, ty, &mut other, &wire);
    assert_eq!(other.read_u32(out).unwrap(), 0x77);
}

/// Unknown format characters are a logged no-op, not an error.
#[test]
fn unknown_format_character_is_noop() {
    let (stub, ty) = single_type(vec![0x7f]);
    let mut arena = MemArena::new();
    let mem = arena.write_block(&[0u8; 4]);
    let wire = marshal(&stub, ty, &mut arena, mem);
    assert!(wire.is_empty());

    let mut other = MemArena::new();
    let mut ctx = UnmarshalCtx::new(CallEnv::new(&stub, &mut other), &wire);
    let mut out = MemPtr::NULL;
    engine::unmarshal(&mut ctx, &mut out, ty, true).unwrap();
    assert!(out.is_null());
}

/// A wire image shorter than its description is a hard fault.
#[test]
fn truncated_wire_faults() {
    let (stub, ty) = single_type(vec![fc::ULONG]);
    let mut arena = MemArena::new();
    let mut ctx = UnmarshalCtx::new(CallEnv::new(&stub, &mut arena), &[1, 2]);
    let mut out = MemPtr::NULL;
    let err = engine::unmarshal(&mut ctx, &mut out, ty, true).unwrap_err();
    assert!(matches!(err, Fault::BufferUnderrun { .. }));
}
