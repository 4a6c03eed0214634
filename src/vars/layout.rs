use crate::{
    context::{self, Context},
    meta::Meta,
    tag::{self, TagRead},
    vars::{VarId, VarImpl, VarRel},
};
use tracing::warn;

/// Round `v` up to alignment `a` (a power of two), in bits.
pub(crate) fn align_up(v: u64, a: u64) -> u64 {
    (v + a - 1) & !(a - 1)
}

/// How a variable's start offset is computed. Chosen once at
/// instantiation, cheapest eligible strategy first.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Strategy {
    /// Start offset is a build-time constant inside the context mapping.
    Absolute(u64),
    /// `start = start(base) + delta`, with `delta` computed at build
    /// time. Preferred whenever a dominating-alignment base with a
    /// constant intermediate layout exists.
    UseBase { base: VarRel, delta: u64 },
    /// `start = align_up(end(prev), align)`.
    UsePrev(VarRel),
    /// `start = align_up(start(container), align)`.
    UseContainer(VarRel),
}

/// How a variable's size is computed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum SizeRule {
    Const(u64),
    /// Floating structure: size reaches the end of the last field.
    UpToField(VarRel),
    /// Array/sequence: sum of the (aligned) elements.
    Elements,
}

/// Layout of a variable whose alignment is a build-time constant
/// (everything except variants).
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct FixedLayout {
    pub align: u64,
    pub strategy: Strategy,
    pub size: SizeRule,
}

/// A variant is the only layout-floating construct: its alignment is its
/// active field's, so a base strategy is never eligible.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum FloatStrategy {
    Absolute,
    UsePrev(VarRel),
    UseContainer(VarRel),
}

fn fixed_layout(imp: &VarImpl) -> Option<&FixedLayout> {
    match imp {
        VarImpl::Int(v) => Some(&v.layout),
        VarImpl::Struct(v) => Some(&v.layout),
        VarImpl::Array(v) => Some(&v.layout),
        VarImpl::Sequence(v) => Some(&v.layout),
        VarImpl::Pending | VarImpl::Root(_) | VarImpl::Variant(_) => None,
    }
}

/// Alignment in bits; `None` when unknown in this context.
pub(crate) fn alignment(meta: &Meta, id: VarId, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
    match &meta.node(id).imp {
        VarImpl::Variant(_) => match variant_active(meta, id, ctx) {
            Some(Some(field)) => alignment(meta, field, ctx),
            _ => None,
        },
        imp => fixed_layout(imp).map(|l| l.align),
    }
}

/// Start offset in bits inside the variable's context mapping.
pub(crate) fn start_offset(meta: &Meta, id: VarId, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
    match &meta.node(id).imp {
        VarImpl::Variant(v) => match v.strategy {
            // A floating variable can only be "absolute" when it starts
            // the context.
            FloatStrategy::Absolute => Some(0),
            FloatStrategy::UsePrev(prev) => {
                let align = alignment(meta, id, ctx)?;
                Some(align_up(end_offset(meta, id.offset(prev), ctx)?, align))
            }
            FloatStrategy::UseContainer(container) => {
                let align = alignment(meta, id, ctx)?;
                Some(align_up(
                    start_offset(meta, id.offset(container), ctx)?,
                    align,
                ))
            }
        },
        imp => {
            let layout = fixed_layout(imp)?;
            match layout.strategy {
                Strategy::Absolute(offset) => Some(offset),
                Strategy::UseBase { base, delta } => {
                    Some(start_offset(meta, id.offset(base), ctx)? + delta)
                }
                Strategy::UsePrev(prev) => Some(align_up(
                    end_offset(meta, id.offset(prev), ctx)?,
                    layout.align,
                )),
                Strategy::UseContainer(container) => Some(align_up(
                    start_offset(meta, id.offset(container), ctx)?,
                    layout.align,
                )),
            }
        }
    }
}

/// Size in bits; `None` when the context is insufficient.
pub(crate) fn size(meta: &Meta, id: VarId, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
    match &meta.node(id).imp {
        VarImpl::Variant(_) => match variant_active(meta, id, ctx) {
            Some(Some(field)) => size(meta, field, ctx),
            _ => None,
        },
        imp => {
            let layout = fixed_layout(imp)?;
            match layout.size {
                SizeRule::Const(s) => Some(s),
                SizeRule::UpToField(last) => {
                    let end = end_offset(meta, id.offset(last), ctx)?;
                    let start = start_offset(meta, id, ctx)?;
                    Some(end - start)
                }
                SizeRule::Elements => elements_size(meta, id, ctx),
            }
        }
    }
}

/// End offset in bits inside the variable's context mapping.
pub(crate) fn end_offset(meta: &Meta, id: VarId, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
    match &meta.node(id).imp {
        VarImpl::Variant(_) => match variant_active(meta, id, ctx) {
            Some(Some(field)) => end_offset(meta, field, ctx),
            _ => None,
        },
        _ => Some(start_offset(meta, id, ctx)? + size(meta, id, ctx)?),
    }
}

/// Element count: constant for arrays, read through the length tag for
/// sequences. A missing length variable means an empty sequence; negative
/// lengths clamp to zero.
pub(crate) fn element_count(meta: &Meta, id: VarId, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
    match &meta.node(id).imp {
        VarImpl::Array(a) => Some(a.len),
        VarImpl::Sequence(s) => {
            let ctx = ctx?;
            match tag::read_target_int(meta, &s.len_tag, id, ctx) {
                TagRead::Found(v) => {
                    if v < 0 {
                        warn!(
                            var = %meta.full_name(id),
                            len = v,
                            "Negative sequence length clamped to zero"
                        );
                        Some(0)
                    } else {
                        Some(v as u64)
                    }
                }
                TagRead::Missing => Some(0),
                TagRead::Insufficient => None,
            }
        }
        _ => None,
    }
}

/// Size of an array/sequence: `(n-1)` aligned strides plus the last
/// element when elements have constant layout, otherwise a walk to the
/// last element through an element context.
fn elements_size(meta: &Meta, id: VarId, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
    let n = element_count(meta, id, ctx)?;
    if n == 0 {
        return Some(0);
    }
    let elem = meta.first_child(id)?;
    let elem_align = alignment(meta, elem, ctx)?;
    if let Some(elem_size) = size(meta, elem, ctx) {
        return Some((n - 1) * align_up(elem_size, elem_align) + elem_size);
    }

    let array_ctx = ctx?.context_for(meta, id)?;
    let last = context::element_context(elem, array_ctx, n - 1).ok()?;
    if last.is_end() {
        return None;
    }
    let last_start = last.element_offset()?;
    let array_start = start_offset(meta, id, Some(array_ctx))?;
    let last_size = size(meta, elem, Some(&last))?;
    Some(last_start - array_start + last_size)
}

/// Whether `child` exists whenever `parent` does. Only variants have a
/// non-trivial rule: exactly their active field exists.
pub(crate) fn is_child_exist(
    meta: &Meta,
    parent: VarId,
    child: VarId,
    ctx: Option<&Context<'_, '_>>,
) -> Option<bool> {
    match &meta.node(parent).imp {
        VarImpl::Variant(_) => variant_active(meta, parent, ctx).map(|active| active == Some(child)),
        _ => Some(true),
    }
}

/// Resolve the active field of a variant.
///
/// Outer `None` = context insufficient. `Some(None)` = no field active:
/// the tag target is absent, its value maps to no enumeration label, or
/// the label names no field. None of those are trace errors.
pub(crate) fn variant_active(
    meta: &Meta,
    id: VarId,
    ctx: Option<&Context<'_, '_>>,
) -> Option<Option<VarId>> {
    let VarImpl::Variant(v) = &meta.node(id).imp else {
        return Some(None);
    };
    let ctx = ctx?;
    match tag::read_target_int(meta, &v.tag, id, ctx) {
        TagRead::Found(value) => {
            let target = id.offset(v.tag.target);
            let Some(mapping) = meta.types.enumeration(meta.type_of(target)) else {
                return Some(None);
            };
            match mapping.label(mapping.lookup(value)) {
                Some(label) => Some(meta.child_by_name(id, label.as_str())),
                None => Some(None),
            }
        }
        TagRead::Missing => Some(None),
        TagRead::Insufficient => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn align_up_bits() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 1), 9);
        assert_eq!(align_up(33, 32), 64);
    }
}
