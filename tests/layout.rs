//! Layout invariants checked over a metadata mixing bit fields, nested
//! structures, a discriminated variant and a dynamically sized sequence.

use ctf_reader::*;
use pretty_assertions::assert_eq;
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

/// trace.packet.header = struct {
///     flag: u3, code: u5,
///     k: enum u8 { small = 1, wide = 2 },
///     u: variant<k> { small: u8, wide: u32 },
///     n: u8,
///     values: u16[n],
/// }
fn build() -> Meta {
    let mut b = MetaBuilder::new();
    let u3 = int_type(&mut b, "uint3_t", 3, 1, ByteOrder::Little, false);
    let u5 = int_type(&mut b, "uint5_t", 5, 1, ByteOrder::Little, false);
    let u8_t = int_type(&mut b, "uint8_t", 8, 8, ByteOrder::Little, false);
    let u16_t = int_type(&mut b, "uint16_t", 16, 16, ByteOrder::Little, false);
    let u32_t = int_type(&mut b, "uint32_t", 32, 32, ByteOrder::Little, false);

    b.enum_begin("kind", u8_t, false).unwrap();
    b.enum_begin_scope().unwrap();
    b.enum_add_value("small", 1, 1).unwrap();
    b.enum_add_value("wide", 2, 2).unwrap();
    b.enum_end_scope().unwrap();
    let kind = b.enum_end().unwrap();

    b.struct_begin("header", false).unwrap();
    b.struct_begin_scope().unwrap();
    b.struct_add_field("flag", u3).unwrap();
    b.struct_add_field("code", u5).unwrap();
    b.struct_add_field("k", kind).unwrap();
    b.variant_begin("u_t", true).unwrap();
    b.variant_begin_scope().unwrap();
    b.variant_add_field("small", u8_t).unwrap();
    b.variant_add_field("wide", u32_t).unwrap();
    b.variant_end_scope().unwrap();
    let u = b.variant_end().unwrap();
    b.variant_set_tag(u, "k").unwrap();
    b.struct_add_field("u", u).unwrap();
    b.struct_add_field("n", u8_t).unwrap();
    let values = b.sequence_create("values_t", "n", u16_t, true).unwrap();
    b.struct_add_field("values", values).unwrap();
    b.struct_end_scope().unwrap();
    let header = b.struct_end().unwrap();

    b.top_scope_begin("trace").unwrap();
    b.assign_type("packet.header", header).unwrap();
    b.top_scope_end().unwrap();
    b.instantiate().unwrap()
}

// flag=5, code=28, k=2 (wide), u.wide=0xCAFEBABE, n=2, values=[7, 9].
fn bytes() -> Vec<u8> {
    let mut bytes = vec![0xE5, 0x02, 0x00, 0x00];
    bytes.extend_from_slice(&0xCAFE_BABEu32.to_le_bytes());
    bytes.push(0x02);
    bytes.push(0x00);
    bytes.extend_from_slice(&7u16.to_le_bytes());
    bytes.extend_from_slice(&9u16.to_le_bytes());
    bytes
}

fn check_subtree(var: Var<'_>, ctx: &Context<'_, '_>) {
    // start + size == end whenever both sides are known.
    if let (Some(start), Some(size), Some(end)) = (
        var.start_offset(Some(ctx)),
        var.size(Some(ctx)),
        var.end_offset(Some(ctx)),
    ) {
        assert_eq!(start + size, end, "offset arithmetic for {}", var.full_name());
    }
    for child in var.children() {
        // Container alignment dominates content alignment.
        if let (Some(container), Some(child_align)) =
            (var.alignment(Some(ctx)), child.alignment(Some(ctx)))
        {
            assert!(
                child_align <= container,
                "alignment of {} exceeds its container",
                child.full_name()
            );
        }
        if child.exists(Some(ctx)) == Some(true) && !child.is_element() {
            check_subtree(child, ctx);
        }
    }
}

#[test]
fn offset_arithmetic_and_alignment_dominance() {
    let meta = build();
    let bytes = bytes();
    let top = meta.find_var("trace.packet.header").unwrap();
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();

    check_subtree(top, &ctx);

    // Spot-check the packed prefix: two bit fields then a byte-aligned
    // discriminator.
    assert_eq!(top.find("code").unwrap().start_offset(Some(&ctx)), Some(3));
    assert_eq!(top.find("k").unwrap().start_offset(Some(&ctx)), Some(8));
    assert_eq!(top.find("u").unwrap().start_offset(Some(&ctx)), Some(32));
}

#[test]
fn exactly_one_variant_field_exists() {
    let meta = build();
    let bytes = bytes();
    let top = meta.find_var("trace.packet.header").unwrap();
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();

    let u = top.find("u").unwrap();
    let existing: Vec<String> = u
        .children()
        .filter(|f| f.exists(Some(&ctx)) == Some(true))
        .map(|f| f.full_name())
        .collect();
    assert_eq!(existing, vec!["trace.packet.header.u.wide".to_owned()]);

    // An unmatched discriminator leaves zero fields existing.
    let mut unmatched = bytes.clone();
    unmatched[1] = 0x07;
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&unmatched)), None)
        .unwrap();
    assert_eq!(
        u.children()
            .filter(|f| f.exists(Some(&ctx)) == Some(true))
            .count(),
        0
    );
    assert_eq!(u.active_field(&ctx).unwrap(), None);
}

#[test]
fn sequence_size_is_the_aligned_element_sum() {
    let meta = build();
    let bytes = bytes();
    let top = meta.find_var("trace.packet.header").unwrap();
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();

    let values = top.find("values").unwrap();
    let elem = values.element().unwrap();
    let n = values.element_count(Some(&ctx)).unwrap();
    assert_eq!(n, 2);

    // Walk the element contexts and sum aligned end offsets by hand.
    let elem_align = elem.alignment(Some(&ctx)).unwrap();
    let elem_ctx = elem.element_context(&ctx, 0).unwrap();
    let mut sum = 0;
    for i in 0..n {
        assert_eq!(elem_ctx.element_index(), Some(i));
        let end = elem.end_offset(Some(&elem_ctx)).unwrap();
        sum = if i + 1 < n {
            (sum + end + elem_align - 1) & !(elem_align - 1)
        } else {
            sum + end
        };
        elem_ctx.advance_element().unwrap();
    }
    assert!(elem_ctx.is_end());
    assert_eq!(values.size(Some(&ctx)), Some(sum));

    // The values themselves.
    let elem_ctx = elem.element_context(&ctx, 0).unwrap();
    assert_eq!(elem.read_u32(&elem_ctx).unwrap(), 7);
    elem_ctx.advance_element().unwrap();
    assert_eq!(elem.read_u32(&elem_ctx).unwrap(), 9);
}

#[test]
fn variant_layout_floats_with_the_active_field() {
    let meta = build();
    let top = meta.find_var("trace.packet.header").unwrap();

    // k = small: the variant is byte-aligned right after the
    // discriminator and one byte wide.
    let bytes = [0xE5, 0x01, 0xAB, 0x03, 0x07, 0x00, 0x09, 0x00];
    let ctx = meta
        .create_top_context(top, Box::new(SliceSource::new(&bytes)), None)
        .unwrap();

    let u = top.find("u").unwrap();
    assert_eq!(u.alignment(Some(&ctx)), Some(8));
    assert_eq!(u.start_offset(Some(&ctx)), Some(16));
    assert_eq!(u.size(Some(&ctx)), Some(8));
    let active = u.active_field(&ctx).unwrap().unwrap();
    assert_eq!(active.read_u32(&ctx).unwrap(), 0xAB);

    // Without a context the variant's layout is unknown.
    assert_eq!(u.alignment(None), None);
    assert_eq!(u.size(None), None);

    // Fields following the variant shift with it: n sits right after
    // the active field.
    assert_eq!(top.find("n").unwrap().start_offset(Some(&ctx)), Some(24));
    assert_eq!(top.find("n").unwrap().read_u32(&ctx).unwrap(), 3);
}
