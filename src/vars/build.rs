use crate::{
    error::Error,
    meta::Meta,
    tag::VarTag,
    types::{DynScope, TypeKind},
    vars::{
        interp::IntAccess,
        layout::{self, FixedLayout, FloatStrategy, SizeRule, Strategy},
        ArrayVar, IntVar, RootVar, SequenceVar, StructVar, VarId, VarImpl, VarNode, VarRel,
        VariantVar,
    },
};
use internment::Intern;
use tracing::{debug, trace};

/// Instantiate the variable tree for the metadata's root type.
///
/// `meta.vars` must be empty; on success it holds the full immutable
/// tree, root variable first.
pub(crate) fn run(meta: &mut Meta) -> Result<(), Error> {
    let mut inst = Instantiator { layout: Vec::new() };
    inst.add_var(meta, None, crate::types::ROOT_TYPE, None, None, None)?;
    debug!(vars = meta.vars.len(), "Instantiated variable tree");
    Ok(())
}

/// Per-variable build-time layout references. Dropped once the tree is
/// frozen; runtime layout needs only the references baked into each
/// strategy.
struct LayoutInfo {
    container: VarRel,
    prev: VarRel,
}

struct Instantiator {
    layout: Vec<LayoutInfo>,
}

impl Instantiator {
    fn prev_of(&self, id: VarId) -> Option<VarId> {
        let rel = self.layout[id.0 as usize].prev;
        (!rel.is_none()).then(|| id.offset(rel))
    }

    fn container_of(&self, id: VarId) -> Option<VarId> {
        let rel = self.layout[id.0 as usize].container;
        (!rel.is_none()).then(|| id.offset(rel))
    }

    /// Append a variable for `ty` and recursively instantiate its
    /// subvariables.
    ///
    /// `parent` is the search-tree parent; `container` the layout
    /// container (`None` for context roots); `prev` the previous
    /// variable in the same container.
    fn add_var(
        &mut self,
        meta: &mut Meta,
        name: Option<Intern<String>>,
        ty: crate::types::TypeId,
        parent: Option<VarId>,
        container: Option<VarId>,
        prev: Option<VarId>,
    ) -> Result<VarId, Error> {
        let id = VarId(meta.vars.len() as u32);

        let (parent_rel, existence) = match parent {
            Some(p) => {
                let parent_is_variant =
                    matches!(meta.types.kind(meta.node(p).ty), TypeKind::Variant(_));
                let existence = if parent_is_variant {
                    // A variant decides per-context which child exists:
                    // each field starts its own existence rule.
                    VarRel::NONE
                } else {
                    let p_existence = meta.node(p).existence;
                    if p_existence.0 <= 0 {
                        VarRel::between(id, p.offset(p_existence))
                    } else {
                        VarRel::ALWAYS
                    }
                };
                (VarRel::between(id, p), existence)
            }
            None => (VarRel::NONE, VarRel::ALWAYS),
        };

        let context = match container {
            Some(c) => VarRel::between(id, meta.context_var(c)),
            None => VarRel::NONE,
        };

        meta.vars.push(VarNode {
            name,
            parent: parent_rel,
            first_child: VarRel::NONE,
            last_child: VarRel::NONE,
            next_sibling: VarRel::NONE,
            context,
            existence,
            ty,
            imp: VarImpl::Pending,
        });
        self.layout.push(LayoutInfo {
            container: container.map(|c| VarRel::between(id, c)).unwrap_or(VarRel::NONE),
            prev: prev.map(|p| VarRel::between(id, p)).unwrap_or(VarRel::NONE),
        });

        if let Some(p) = parent {
            let last = meta.node(p).last_child;
            if last.is_none() {
                meta.node_mut(p).first_child = VarRel::between(p, id);
            } else {
                let last = p.offset(last);
                meta.node_mut(last).next_sibling = VarRel::between(last, id);
            }
            meta.node_mut(p).last_child = VarRel::between(p, id);
        }

        let kind = meta.types.kind(ty).clone();
        match kind {
            TypeKind::Integer(it) => {
                let strategy = self.select_fixed(meta, id, it.align);
                meta.node_mut(id).imp = VarImpl::Int(IntVar {
                    layout: FixedLayout {
                        align: it.align,
                        strategy,
                        size: SizeRule::Const(it.size),
                    },
                    access: IntAccess::new(&it),
                });
            }
            TypeKind::Enumeration(e) => {
                let it = *meta.types.integer(e.base).ok_or(Error::EnumBaseUnsupported)?;
                let strategy = self.select_fixed(meta, id, it.align);
                meta.node_mut(id).imp = VarImpl::Int(IntVar {
                    layout: FixedLayout {
                        align: it.align,
                        strategy,
                        size: SizeRule::Const(it.size),
                    },
                    access: IntAccess::new(&it),
                });
            }
            TypeKind::Structure(s) => {
                let strategy = self.select_fixed(meta, id, s.align);
                meta.node_mut(id).imp = VarImpl::Struct(StructVar {
                    layout: FixedLayout {
                        align: s.align,
                        strategy,
                        size: SizeRule::Const(0),
                    },
                });

                let mut prev_field: Option<VarId> = None;
                let mut const_size = Some(0u64);
                for (field_name, field_ty) in s.fields {
                    let field =
                        self.add_var(meta, Some(field_name), field_ty, Some(id), Some(id), prev_field)?;
                    if let Some(size_so_far) = const_size {
                        const_size = match (
                            layout::alignment(meta, field, None),
                            layout::size(meta, field, None),
                        ) {
                            (Some(a), Some(s)) => Some(layout::align_up(size_so_far, a) + s),
                            _ => None,
                        };
                    }
                    prev_field = Some(field);
                }

                let size_rule = match (const_size, prev_field) {
                    (Some(s), _) => SizeRule::Const(s),
                    (None, Some(last)) => SizeRule::UpToField(VarRel::between(id, last)),
                    (None, None) => SizeRule::Const(0),
                };
                if let VarImpl::Struct(sv) = &mut meta.node_mut(id).imp {
                    sv.layout.size = size_rule;
                }
            }
            TypeKind::Variant(v) => {
                let Some(tag) = v.tag else {
                    return Err(Error::UntaggedVariant(meta.full_name(id)));
                };
                let strategy = self.nearest_float(id);
                for (label, option_ty) in v.options {
                    self.add_var(meta, Some(label), option_ty, Some(id), Some(id), None)?;
                }
                // Resolved after the fields so a tag reaching into the
                // variant's own subtree is rejected as a forward
                // reference rather than an unknown name.
                let vtag = VarTag::instantiate(meta, &tag, id)?;
                meta.node_mut(id).imp = VarImpl::Variant(VariantVar {
                    strategy,
                    tag: vtag,
                });
            }
            TypeKind::Array(a) => {
                let align = meta.types.max_alignment(a.elem);
                let strategy = self.select_fixed(meta, id, align);
                meta.node_mut(id).imp = VarImpl::Array(ArrayVar {
                    layout: FixedLayout {
                        align,
                        strategy,
                        size: SizeRule::Elements,
                    },
                    len: a.len,
                });
                self.add_var(meta, Some(Intern::from_ref("[]")), a.elem, Some(id), None, None)?;
            }
            TypeKind::Sequence(s) => {
                let align = meta.types.max_alignment(s.elem);
                let vtag = VarTag::instantiate(meta, &s.len_tag, id)?;
                let strategy = self.select_fixed(meta, id, align);
                meta.node_mut(id).imp = VarImpl::Sequence(SequenceVar {
                    layout: FixedLayout {
                        align,
                        strategy,
                        size: SizeRule::Elements,
                    },
                    len_tag: vtag,
                });
                self.add_var(meta, Some(Intern::from_ref("[]")), s.elem, Some(id), None, None)?;
            }
            TypeKind::Root(r) => {
                meta.node_mut(id).imp = VarImpl::Root(RootVar {
                    scopes: [VarRel::NONE; 6],
                });
                for scope in DynScope::ALL {
                    let Some(scope_ty) = r.slots[scope.index()] else {
                        continue;
                    };
                    let child = self.add_var(
                        meta,
                        Some(Intern::from_ref(scope.full_name())),
                        scope_ty,
                        Some(id),
                        None,
                        None,
                    )?;
                    if let VarImpl::Root(rv) = &mut meta.node_mut(id).imp {
                        rv.scopes[scope.index()] = VarRel::between(id, child);
                    }
                }
            }
        }

        Ok(id)
    }

    /// Pick the layout strategy for a variable of constant alignment.
    ///
    /// Walk backward along prev-or-container. A predecessor qualifies as
    /// a base when its alignment dominates every alignment observed so
    /// far and all intermediate layout is constant; reaching the context
    /// root with a fully constant prefix is cheaper still (absolute).
    fn select_fixed(&self, meta: &Meta, id: VarId, align: u64) -> Strategy {
        let mut best: Option<VarId> = None;
        let mut max_align = align;
        let mut current = id;
        loop {
            if let Some(prev) = self.prev_of(current) {
                let (Some(prev_align), Some(_)) = (
                    layout::alignment(meta, prev, None),
                    layout::size(meta, prev, None),
                ) else {
                    break;
                };
                if prev_align >= max_align {
                    best = Some(prev);
                    max_align = prev_align;
                }
                current = prev;
            } else if let Some(container) = self.container_of(current) {
                let Some(container_align) = layout::alignment(meta, container, None) else {
                    break;
                };
                if container_align >= max_align {
                    best = Some(container);
                    max_align = container_align;
                }
                current = container;
            } else {
                // Context root reached with an all-constant prefix.
                let root = meta.context_var(id);
                if let Some(offset) = self.relative_offset(meta, id, align, root) {
                    trace!(var = %meta.full_name(id), offset, "absolute layout");
                    return Strategy::Absolute(offset);
                }
                break;
            }
        }

        if let Some(base) = best {
            if let Some(delta) = self.relative_offset(meta, id, align, base) {
                trace!(var = %meta.full_name(id), base = %meta.full_name(base), delta, "use-base layout");
                return Strategy::UseBase {
                    base: VarRel::between(id, base),
                    delta,
                };
            }
        }
        self.nearest(meta, id)
    }

    fn nearest(&self, meta: &Meta, id: VarId) -> Strategy {
        if let Some(prev) = self.prev_of(id) {
            trace!(var = %meta.full_name(id), "use-prev layout");
            Strategy::UsePrev(VarRel::between(id, prev))
        } else if let Some(container) = self.container_of(id) {
            trace!(var = %meta.full_name(id), "use-container layout");
            Strategy::UseContainer(VarRel::between(id, container))
        } else {
            Strategy::Absolute(0)
        }
    }

    fn nearest_float(&self, id: VarId) -> FloatStrategy {
        if let Some(prev) = self.prev_of(id) {
            FloatStrategy::UsePrev(VarRel::between(id, prev))
        } else if let Some(container) = self.container_of(id) {
            FloatStrategy::UseContainer(VarRel::between(id, container))
        } else {
            FloatStrategy::Absolute
        }
    }

    /// Build-time offset of `var` relative to the start of `base`, valid
    /// when the intermediate layout is constant.
    ///
    /// `var_align` is passed in because the variable under layout has no
    /// implementation yet.
    fn relative_offset(&self, meta: &Meta, var: VarId, var_align: u64, base: VarId) -> Option<u64> {
        let mut current = var;
        let mut acc = 0u64;
        while current != base {
            let align = if current == var {
                var_align
            } else {
                layout::alignment(meta, current, None)?
            };
            if let Some(prev) = self.prev_of(current) {
                let prev_align = layout::alignment(meta, prev, None)?;
                let prev_size = layout::size(meta, prev, None)?;
                if prev_align >= align {
                    acc += layout::align_up(prev_size, align);
                    current = prev;
                } else {
                    let prev_offset = self.relative_offset(meta, prev, prev_align, base)?;
                    acc += layout::align_up(prev_offset + prev_size, align);
                    return Some(acc);
                }
            } else {
                // First in its container: shares the container's aligned
                // start, since container alignment dominates.
                current = self.container_of(current)?;
            }
        }
        Some(acc)
    }
}
