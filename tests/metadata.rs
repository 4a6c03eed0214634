use ctf_reader::*;
use pretty_assertions::assert_eq;
use std::{cell::Cell, rc::Rc};
use test_log::test;

fn int_type(
    b: &mut MetaBuilder,
    name: &str,
    size: i64,
    align: i64,
    order: ByteOrder,
    signed: bool,
) -> TypeId {
    b.int_begin(name).unwrap();
    b.int_set_size(size).unwrap();
    b.int_set_align(align).unwrap();
    b.int_set_byte_order(order).unwrap();
    b.int_set_signed(signed).unwrap();
    b.int_end().unwrap()
}

fn u8_type(b: &mut MetaBuilder) -> TypeId {
    int_type(b, "uint8_t", 8, 8, ByteOrder::Little, false)
}

#[test]
fn duplicate_name_in_same_scope_rejected() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);
    b.typedef_create("t", u8_t, false).unwrap();
    assert!(matches!(
        b.typedef_create("t", u8_t, false),
        Err(Error::DuplicateTypeName(_))
    ));
}

#[test]
fn shadowing_across_scopes_permitted() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);
    let u16_t = int_type(&mut b, "uint16_t", 16, 16, ByteOrder::Little, false);

    let outer = b.typedef_create("t", u8_t, false).unwrap();
    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    let inner = b.typedef_create("t", u16_t, false).unwrap();
    assert_eq!(b.find_type("t"), Some(inner));
    assert_ne!(outer, inner);
    b.struct_end_scope().unwrap();
    b.struct_end().unwrap();

    // Back outside, the outer definition is visible again.
    assert_eq!(b.find_type("t"), Some(outer));
}

#[test]
fn type_invisible_until_committed() {
    let mut b = MetaBuilder::new();
    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    // A type may not reference itself during construction.
    assert_eq!(b.find_type("s"), None);
    b.struct_end_scope().unwrap();
    b.struct_end().unwrap();
    assert!(b.find_type("s").is_some());
}

#[test]
fn internal_types_not_searchable() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);
    b.typedef_create("hidden", u8_t, true).unwrap();
    assert_eq!(b.find_type("hidden"), None);
}

#[test]
fn instantiate_with_open_construction_fails() {
    let mut b = MetaBuilder::new();
    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    assert!(matches!(b.instantiate(), Err(Error::OpenConstruction)));
}

#[test]
fn integer_finalization_rejections() {
    // Sizes over a byte must be whole bytes.
    let mut b = MetaBuilder::new();
    b.int_begin("bad").unwrap();
    b.int_set_size(12).unwrap();
    b.int_set_byte_order(ByteOrder::Little).unwrap();
    assert!(matches!(
        b.int_end(),
        Err(Error::UnsupportedIntegerGeometry { .. })
    ));

    // Sub-byte integers must not cross a byte boundary.
    let mut b = MetaBuilder::new();
    b.int_begin("bad").unwrap();
    b.int_set_size(5).unwrap();
    b.int_set_align(4).unwrap();
    b.int_set_byte_order(ByteOrder::Little).unwrap();
    assert!(matches!(
        b.int_end(),
        Err(Error::UnsupportedIntegerGeometry { .. })
    ));

    // Native byte order is unsupported.
    let mut b = MetaBuilder::new();
    b.int_begin("bad").unwrap();
    b.int_set_size(32).unwrap();
    assert!(matches!(b.int_end(), Err(Error::NativeByteOrder)));

    // Only `none` encoding is supported.
    let mut b = MetaBuilder::new();
    b.int_begin("bad").unwrap();
    b.int_set_size(8).unwrap();
    b.int_set_byte_order(ByteOrder::Little).unwrap();
    b.int_set_encoding(Encoding::Utf8).unwrap();
    assert!(matches!(b.int_end(), Err(Error::UnsupportedEncoding)));
}

#[test]
fn enum_base_must_fit_64_bits() {
    let mut b = MetaBuilder::new();
    let wide = int_type(&mut b, "uint128_t", 128, 8, ByteOrder::Little, false);
    assert!(matches!(
        b.enum_begin("e", wide, false),
        Err(Error::EnumBaseUnsupported)
    ));
}

#[test]
fn variant_tag_must_point_at_enumeration() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);

    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("n", u8_t).unwrap();
    b.variant_begin("v", true).unwrap();
    b.variant_begin_scope().unwrap();
    b.variant_add_field("x", u8_t).unwrap();
    b.variant_end_scope().unwrap();
    let v = b.variant_end().unwrap();
    assert!(matches!(
        b.variant_set_tag(v, "n"),
        Err(Error::TagTargetKind("enumeration"))
    ));
}

#[test]
fn sequence_tag_must_point_at_integer() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);

    b.enum_begin("e", u8_t, false).unwrap();
    b.enum_begin_scope().unwrap();
    b.enum_add_value("A", 0, 0).unwrap();
    b.enum_end_scope().unwrap();
    let e = b.enum_end().unwrap();

    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("k", e).unwrap();
    assert!(matches!(
        b.sequence_create("seq", "k", u8_t, true),
        Err(Error::TagTargetKind("integer"))
    ));
}

#[test]
fn partial_tags_never_accepted() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);

    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("a", u8_t).unwrap();
    assert!(matches!(
        b.sequence_create("seq", "a.b", u8_t, true),
        Err(Error::PartialTag { .. })
    ));
}

#[test]
fn untagged_variant_cannot_instantiate() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);

    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.variant_begin("v", true).unwrap();
    b.variant_begin_scope().unwrap();
    b.variant_add_field("x", u8_t).unwrap();
    b.variant_end_scope().unwrap();
    let v = b.variant_end().unwrap();
    b.struct_add_field("u", v).unwrap();
    b.struct_end_scope().unwrap();
    let s = b.struct_end().unwrap();

    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", s).unwrap();
    b.top_scope_end().unwrap();
    assert!(matches!(b.instantiate(), Err(Error::UntaggedVariant(_))));
}

#[test]
fn tag_into_own_subtree_is_a_forward_reference() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);

    b.enum_begin("e", u8_t, false).unwrap();
    b.enum_begin_scope().unwrap();
    b.enum_add_value("A", 0, 0).unwrap();
    b.enum_end_scope().unwrap();
    let e = b.enum_end().unwrap();

    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.variant_begin("v", true).unwrap();
    b.variant_begin_scope().unwrap();
    b.variant_add_field("A", e).unwrap();
    b.variant_end_scope().unwrap();
    let v = b.variant_end().unwrap();
    b.struct_add_field("u", v).unwrap();
    // The discriminator may not live inside the variant it selects.
    b.variant_set_tag(v, "u.A").unwrap();
    b.struct_end_scope().unwrap();
    let s = b.struct_end().unwrap();

    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", s).unwrap();
    b.top_scope_end().unwrap();
    assert!(matches!(b.instantiate(), Err(Error::ForwardTag(_))));
}

#[test]
fn integer_geometries_round_trip() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);
    let i8_t = int_type(&mut b, "int8_t", 8, 8, ByteOrder::Little, true);
    let u16_le = int_type(&mut b, "uint16_le", 16, 8, ByteOrder::Little, false);
    let i16_be = int_type(&mut b, "int16_be", 16, 8, ByteOrder::Big, true);
    let u32_be = int_type(&mut b, "uint32_be", 32, 8, ByteOrder::Big, false);
    let i32_le = int_type(&mut b, "int32_le", 32, 8, ByteOrder::Little, true);
    let u64_le = int_type(&mut b, "uint64_le", 64, 8, ByteOrder::Little, false);
    let i64_be = int_type(&mut b, "int64_be", 64, 8, ByteOrder::Big, true);

    b.struct_begin("all", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("a", u8_t).unwrap();
    b.struct_add_field("b", i8_t).unwrap();
    b.struct_add_field("c", u16_le).unwrap();
    b.struct_add_field("d", i16_be).unwrap();
    b.struct_add_field("e", u32_be).unwrap();
    b.struct_add_field("f", i32_le).unwrap();
    b.struct_add_field("g", u64_le).unwrap();
    b.struct_add_field("h", i64_be).unwrap();
    b.struct_end_scope().unwrap();
    let all = b.struct_end().unwrap();

    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", all).unwrap();
    b.top_scope_end().unwrap();
    let meta = b.instantiate().unwrap();

    let mut bytes = Vec::new();
    bytes.extend_from_slice(&255u8.to_le_bytes());
    bytes.extend_from_slice(&(-2i8).to_le_bytes());
    bytes.extend_from_slice(&0x1234u16.to_le_bytes());
    bytes.extend_from_slice(&(-300i16).to_be_bytes());
    bytes.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
    bytes.extend_from_slice(&(-123_456i32).to_le_bytes());
    bytes.extend_from_slice(&0x0123_4567_89AB_CDEFu64.to_le_bytes());
    bytes.extend_from_slice(&(-987_654_321i64).to_be_bytes());

    let top = meta.find_var("trace.packet.header").unwrap();
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();

    assert_eq!(top.find("a").unwrap().read_u32(&ctx).unwrap(), 255);
    assert_eq!(top.find("b").unwrap().read_i32(&ctx).unwrap(), -2);
    assert_eq!(top.find("c").unwrap().read_u32(&ctx).unwrap(), 0x1234);
    assert_eq!(top.find("d").unwrap().read_i32(&ctx).unwrap(), -300);
    assert_eq!(top.find("e").unwrap().read_u32(&ctx).unwrap(), 0xDEAD_BEEF);
    assert_eq!(top.find("f").unwrap().read_i64(&ctx).unwrap(), -123_456);
    assert_eq!(
        top.find("g").unwrap().read_u64(&ctx).unwrap(),
        0x0123_4567_89AB_CDEF
    );
    assert_eq!(
        top.find("h").unwrap().read_i64(&ctx).unwrap(),
        -987_654_321
    );

    // Overflow checks: value out of the requested range, or an accessor
    // narrower than the type.
    assert!(matches!(
        top.find("e").unwrap().read_i32(&ctx),
        Err(Error::IntegerOverflow(_))
    ));
    assert!(matches!(
        top.find("b").unwrap().read_u32(&ctx),
        Err(Error::IntegerOverflow(_))
    ));
    assert!(matches!(
        top.find("g").unwrap().read_u32(&ctx),
        Err(Error::WrongKind(_))
    ));

    // copy_int produces native-order bytes.
    let mut copied = [0u8; 4];
    top.find("e").unwrap().copy_int(&ctx, &mut copied).unwrap();
    assert_eq!(copied, 0xDEAD_BEEFu32.to_ne_bytes());

    let mut short = [0u8; 2];
    assert!(matches!(
        top.find("e").unwrap().copy_int(&ctx, &mut short),
        Err(Error::DestinationTooSmall)
    ));
}

/// Integers wider than 64 bits have no value accessors but still copy.
#[test]
fn wide_integer_copies_but_does_not_read() {
    let mut b = MetaBuilder::new();
    let u128_t = int_type(&mut b, "uint128_t", 128, 8, ByteOrder::Big, false);
    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("w", u128_t).unwrap();
    b.struct_end_scope().unwrap();
    let s = b.struct_end().unwrap();
    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", s).unwrap();
    b.top_scope_end().unwrap();
    let meta = b.instantiate().unwrap();

    let bytes: Vec<u8> = (1..=16).collect();
    let top = meta.find_var("trace.packet.header").unwrap();
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();

    let w = top.find("w").unwrap();
    assert!(matches!(w.read_u64(&ctx), Err(Error::WrongKind(_))));

    let mut copied = [0u8; 16];
    w.copy_int(&ctx, &mut copied).unwrap();
    if cfg!(target_endian = "little") {
        assert_eq!(copied.to_vec(), (1..=16).rev().collect::<Vec<u8>>());
    } else {
        assert_eq!(copied.to_vec(), bytes);
    }

    // Integer introspection reflects the finalized type.
    assert_eq!(w.byte_order(), Some(ByteOrder::Big));
    assert_eq!(w.is_signed(), Some(false));
    assert_eq!(w.display_base(), Some(DisplayBase::Decimal));
    assert_eq!(w.encoding(), Some(Encoding::None));
}

/// A typedef'd clone and its source instantiate variables that read
/// identical bytes from the same backing stream.
#[test]
fn typedef_clone_reads_identically() {
    let mut b = MetaBuilder::new();
    let u16_be = int_type(&mut b, "uint16_be", 16, 16, ByteOrder::Big, false);

    b.struct_begin("inner", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("a", u16_be).unwrap();
    b.struct_add_field("b", u16_be).unwrap();
    b.struct_end_scope().unwrap();
    let inner = b.struct_end().unwrap();

    let cloned = b.typedef_create("inner2", inner, false).unwrap();
    assert_ne!(inner, cloned);

    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", inner).unwrap();
    b.top_scope_end().unwrap();
    b.top_scope_begin("stream").unwrap();
    b.assign_type("packet.context", cloned).unwrap();
    b.top_scope_end().unwrap();
    let meta = b.instantiate().unwrap();

    let bytes = [0x12, 0x34, 0x56, 0x78];
    let hdr = meta.find_var("trace.packet.header").unwrap();
    let hdr_ctx = meta
        .create_top_context(hdr, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();
    let pkt = meta.find_var("stream.packet.context").unwrap();
    let pkt_ctx = meta
        .create_top_context(pkt, Box::new(SliceSource::new(&bytes)), Some(&hdr_ctx))
        .unwrap();

    for field in ["a", "b"] {
        let mut from_source = [0u8; 2];
        let mut from_clone = [0u8; 2];
        hdr.find(field)
            .unwrap()
            .copy_int(&hdr_ctx, &mut from_source)
            .unwrap();
        pkt.find(field)
            .unwrap()
            .copy_int(&pkt_ctx, &mut from_clone)
            .unwrap();
        assert_eq!(from_source, from_clone);
    }
}

#[derive(Clone)]
struct CountingSource<'a> {
    inner: SliceSource<'a>,
    grow_calls: Rc<Cell<usize>>,
}

impl ByteSource for CountingSource<'_> {
    fn extend_map(&mut self, min_bits: u64) -> Result<SourceMap<'_>, SourceError> {
        if min_bits > 0 {
            self.grow_calls.set(self.grow_calls.get() + 1);
        }
        self.inner.extend_map(min_bits)
    }
}

/// A mapping extended to `n` bits is not re-requested for `m <= n`.
#[test]
fn mapping_grows_monotonically() {
    let mut b = MetaBuilder::new();
    let u32_le = int_type(&mut b, "uint32_t", 32, 32, ByteOrder::Little, false);
    b.struct_begin("s", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("first", u32_le).unwrap();
    b.struct_add_field("second", u32_le).unwrap();
    b.struct_end_scope().unwrap();
    let s = b.struct_end().unwrap();
    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", s).unwrap();
    b.top_scope_end().unwrap();
    let meta = b.instantiate().unwrap();

    let bytes = [1, 0, 0, 0, 2, 0, 0, 0];
    let grow_calls = Rc::new(Cell::new(0));
    let source = CountingSource {
        inner: SliceSource::new(&bytes),
        grow_calls: grow_calls.clone(),
    };
    let top = meta.find_var("trace.packet.header").unwrap();
    let ctx = meta
        .create_top_context(top, Box::new(source), None)
        .unwrap();

    // Reading the trailing field maps 64 bits; the leading field then
    // needs no further growth.
    assert_eq!(top.find("second").unwrap().read_u32(&ctx).unwrap(), 2);
    assert_eq!(grow_calls.get(), 1);
    assert_eq!(top.find("first").unwrap().read_u32(&ctx).unwrap(), 1);
    assert_eq!(grow_calls.get(), 1);
}

#[test]
fn params_and_names() {
    let mut b = MetaBuilder::new();
    let u8_t = u8_type(&mut b);
    let seq = {
        b.struct_begin("s", false).unwrap();
        b.struct_begin_scope().unwrap();
        b.struct_add_field("n", u8_t).unwrap();
        let seq = b.sequence_create("seq", "n", u8_t, true).unwrap();
        b.struct_add_field("values", seq).unwrap();
        b.struct_end_scope().unwrap();
        b.struct_end().unwrap()
    };

    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", seq).unwrap();
    b.add_param("major", "1").unwrap();
    b.add_param("uuid", "2a6422d0-6cee-11e0-8c08-cb07d7b3a564").unwrap();
    b.top_scope_end().unwrap();
    b.top_scope_begin("env").unwrap();
    b.add_param("hostname", "quark").unwrap();
    b.top_scope_end().unwrap();
    let meta = b.instantiate().unwrap();

    assert_eq!(meta.find_param("trace.major"), Some("1"));
    assert_eq!(meta.find_param("env.hostname"), Some("quark"));
    assert_eq!(meta.find_param("env.missing"), None);

    let elem = meta.find_var("trace.packet.header.values[]").unwrap();
    assert!(elem.is_element());
    assert_eq!(elem.full_name(), "trace.packet.header.values[]");
    assert_eq!(
        meta.find_var("trace.packet.header.values.[]").map(|v| v.full_name()),
        Some("trace.packet.header.values[]".to_owned())
    );
    assert_eq!(meta.find_var("trace.packet.header.missing"), None);
}
