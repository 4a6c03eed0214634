use crate::{
    context::Context,
    error::Error,
    meta::Meta,
    types::{TypeArena, TypeId},
    vars::{interp, VarId, VarRel},
};
use internment::Intern;
use tracing::trace;

/// One step of a compile-time path into the type graph.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TagComponent {
    /// A field or dynamic-scope name.
    Named(Intern<String>, TypeId),
    /// A concrete array/sequence element index.
    Indexed(u32, TypeId),
}

impl TagComponent {
    pub fn ty(&self) -> TypeId {
        match self {
            TagComponent::Named(_, ty) | TagComponent::Indexed(_, ty) => *ty,
        }
    }
}

/// A compile-time path into the type graph, rooted at a base type.
///
/// Variants point their tag at the discriminating enumeration, sequences
/// at their length integer. A tag resolves against the type graph when the
/// metadata is built and instantiates into a [`VarTag`] per use-site when
/// the variable tree is laid out.
#[derive(Clone, Debug)]
pub(crate) struct Tag {
    pub base: TypeId,
    pub components: Vec<TagComponent>,
}

/// Why a tag string failed to resolve against a base type.
///
/// A failing first component allows the builder to retry the tag at the
/// root type; any later failure rejects the tag outright (partial tags are
/// never accepted).
#[derive(Debug)]
pub(crate) enum TagFailure {
    FirstComponent,
    Terminal(Error),
}

impl Tag {
    pub fn resolve(arena: &TypeArena, base: TypeId, input: &str) -> Result<Tag, TagFailure> {
        let (first, mut rest) = match arena.resolve_tag_component(base, input) {
            Ok(Some(found)) => found,
            Ok(None) => return Err(TagFailure::FirstComponent),
            Err(e) => return Err(TagFailure::Terminal(e)),
        };
        let mut current = first.ty();
        let mut components = vec![first];
        while !rest.is_empty() {
            let remainder = rest.strip_prefix('.').unwrap_or(rest);
            match arena.resolve_tag_component(current, remainder) {
                Ok(Some((component, r))) => {
                    current = component.ty();
                    components.push(component);
                    rest = r;
                }
                Ok(None) => {
                    return Err(TagFailure::Terminal(Error::PartialTag {
                        tag: input.to_owned(),
                        rest: remainder.to_owned(),
                    }))
                }
                Err(e) => return Err(TagFailure::Terminal(e)),
            }
        }
        trace!(tag = input, components = components.len(), "Resolved tag");
        Ok(Tag { base, components })
    }

    /// The type the tag points at.
    pub fn target_type(&self) -> TypeId {
        let mut ty = self.base;
        for c in &self.components {
            ty = c.ty();
        }
        ty
    }
}

/// An array/sequence subscript traversed by an instantiated tag: the
/// element variable (relative to the tag user) and the concrete index to
/// position its context at.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct TagArrayStep {
    pub elem: VarRel,
    pub index: u32,
}

/// The runtime form of a [`Tag`], specific to a variable use-site: a
/// relative index from the user variable to the target variable plus the
/// subscripts to walk through on the way.
#[derive(Clone, Debug)]
pub(crate) struct VarTag {
    pub target: VarRel,
    pub steps: Vec<TagArrayStep>,
}

impl VarTag {
    /// Instantiate `tag` for the variable `user`.
    ///
    /// Walks up `user`'s ancestors to the variable of the tag's base type,
    /// then descends child-by-name (and element-by-index). The target must
    /// not come after `user` in dynamic-scope order: reading forward in the
    /// stream is impossible.
    pub fn instantiate(meta: &Meta, tag: &Tag, user: VarId) -> Result<VarTag, Error> {
        let mut base = meta.parent_of(user);
        while let Some(b) = base {
            if meta.type_of(b) == tag.base {
                break;
            }
            base = meta.parent_of(b);
        }
        let Some(base) = base else {
            return Err(Error::TagBaseUnreachable(meta.full_name(user)));
        };

        let mut steps = Vec::new();
        let mut current = base;
        for component in &tag.components {
            current = match component {
                TagComponent::Named(name, _) => meta
                    .child_by_name(current, name.as_str())
                    .ok_or_else(|| Error::TagBaseUnreachable(meta.full_name(user)))?,
                TagComponent::Indexed(index, _) => {
                    let elem = meta
                        .child_by_name(current, "[]")
                        .ok_or_else(|| Error::TagBaseUnreachable(meta.full_name(user)))?;
                    steps.push(TagArrayStep {
                        elem: VarRel::between(user, elem),
                        index: *index,
                    });
                    elem
                }
            };
        }

        let target = VarRel::between(user, current);
        if target.0 > 0 {
            return Err(Error::ForwardTag(meta.full_name(user)));
        }
        Ok(VarTag { target, steps })
    }
}

/// Outcome of reading through a tag at runtime.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum TagRead<T> {
    Found(T),
    /// The target does not exist in the given context (absent variant
    /// field, element past the sequence length, unreadable mapping). Not
    /// an error for the trace.
    Missing,
    /// The context is insufficient to decide.
    Insufficient,
}

/// Read the tag target as a sign-aware integer value.
///
/// Positions per-step element contexts on the stack, innermost last, then
/// reads the target through the final context. This is the runtime use of
/// a tag: variants read their discriminator, sequences their length.
pub(crate) fn read_target_int(
    meta: &Meta,
    vtag: &VarTag,
    user: VarId,
    ctx: &Context<'_, '_>,
) -> TagRead<i64> {
    let target = user.offset(vtag.target);
    if let Some((first, _)) = vtag.steps.split_first() {
        // Adjust to the context owning the first array, then descend.
        let first_elem = user.offset(first.elem);
        let Some(array) = meta.parent_of(first_elem) else {
            return TagRead::Missing;
        };
        let Some(array_ctx) = ctx.context_for(meta, array) else {
            return TagRead::Insufficient;
        };
        match meta.var(array).exists(Some(array_ctx)) {
            Some(true) => {}
            Some(false) => return TagRead::Missing,
            None => return TagRead::Insufficient,
        }
        descend(meta, &vtag.steps, user, target, array_ctx)
    } else {
        let Some(target_ctx) = ctx.context_for(meta, target) else {
            return TagRead::Insufficient;
        };
        read_at(meta, target, target_ctx)
    }
}

fn descend(
    meta: &Meta,
    steps: &[TagArrayStep],
    user: VarId,
    target: VarId,
    ctx: &Context<'_, '_>,
) -> TagRead<i64> {
    match steps.split_first() {
        None => read_at(meta, target, ctx),
        Some((step, rest)) => {
            let elem = user.offset(step.elem);
            let elem_ctx = match crate::context::element_context(elem, ctx, u64::from(step.index)) {
                Ok(c) => c,
                Err(Error::InsufficientContext) => return TagRead::Insufficient,
                Err(_) => return TagRead::Missing,
            };
            if elem_ctx.is_end() {
                // Subscript past the actual element count.
                return TagRead::Missing;
            }
            descend(meta, rest, user, target, &elem_ctx)
        }
    }
}

fn read_at(meta: &Meta, target: VarId, ctx: &Context<'_, '_>) -> TagRead<i64> {
    match meta.var(target).exists(Some(ctx)) {
        Some(true) => {}
        Some(false) => return TagRead::Missing,
        None => return TagRead::Insufficient,
    }
    match interp::read_int_value(meta, target, ctx) {
        Ok(v) => TagRead::Found(v),
        Err(Error::InsufficientContext) => TagRead::Insufficient,
        Err(_) => TagRead::Missing,
    }
}

/// Match `name` against a prefix of `input`; the character following the
/// prefix must be a component delimiter (`.`, `[`, or end of input).
pub(crate) fn match_component<'s>(name: &str, input: &'s str) -> Option<&'s str> {
    let rest = input.strip_prefix(name)?;
    match rest.as_bytes().first() {
        None => Some(rest),
        Some(b'.') | Some(b'[') => Some(rest),
        Some(_) => None,
    }
}

/// Parse a `[<n>]` subscript component.
pub(crate) fn parse_index(input: &str) -> Option<(u32, &str)> {
    let rest = input.strip_prefix('[')?.trim_start();
    let digits_end = rest
        .as_bytes()
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let index: u32 = rest[..digits_end].parse().ok()?;
    let rest = rest[digits_end..].trim_start().strip_prefix(']')?;
    Some((index, rest))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn component_matching() {
        assert_eq!(match_component("n", "n"), Some(""));
        assert_eq!(match_component("n", "n.len"), Some(".len"));
        assert_eq!(match_component("values", "values[0]"), Some("[0]"));
        assert_eq!(match_component("n", "name"), None);
        assert_eq!(match_component("name", "n"), None);
        assert_eq!(
            match_component("trace.packet.header", "trace.packet.header.k"),
            Some(".k")
        );
    }

    #[test]
    fn subscript_parsing() {
        assert_eq!(parse_index("[3]"), Some((3, "")));
        assert_eq!(parse_index("[ 12 ].k"), Some((12, ".k")));
        assert_eq!(parse_index("[]"), None);
        assert_eq!(parse_index("[x]"), None);
        assert_eq!(parse_index("3]"), None);
    }
}
