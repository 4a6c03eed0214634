use crate::{
    context::{self, Context},
    error::Error,
    meta::Meta,
    tag::{self, VarTag},
    types::{ByteOrder, DisplayBase, Encoding, TypeId, TypeKind},
};
use internment::Intern;

pub(crate) mod build;
pub(crate) mod interp;
pub(crate) mod layout;

use self::interp::IntAccess;
use self::layout::{FixedLayout, FloatStrategy};

/// Stable absolute index of a variable in the metadata's variable array.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub(crate) struct VarId(pub(crate) u32);

/// The root variable is always index 0; its children are the dynamic
/// scopes. It has no bytes and no layout of its own.
pub(crate) const ROOT_VAR: VarId = VarId(0);

/// Relative index between two variables. All stored cross-references are
/// relative so that links keep their meaning independent of where the
/// array lives; `0` means "absent".
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct VarRel(pub(crate) i32);

impl VarRel {
    pub const NONE: VarRel = VarRel(0);

    /// The sentinel for "unconditionally exists" in existence links; a
    /// real existence target is always an ancestor and therefore <= 0.
    pub const ALWAYS: VarRel = VarRel(1);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn between(from: VarId, to: VarId) -> VarRel {
        VarRel(to.0 as i32 - from.0 as i32)
    }
}

impl VarId {
    pub fn offset(self, rel: VarRel) -> VarId {
        VarId((self.0 as i32 + rel.0) as u32)
    }
}

/// One node of the variable tree.
#[derive(Clone, Debug)]
pub(crate) struct VarNode {
    /// `None` only for the root variable.
    pub name: Option<Intern<String>>,
    pub parent: VarRel,
    pub first_child: VarRel,
    pub last_child: VarRel,
    pub next_sibling: VarRel,
    /// The variable owning this one's context; `0` = self is a context
    /// root (top-level dynamic scope or array element).
    pub context: VarRel,
    /// Nearest ancestor with a conditional existence rule; `0` = self
    /// starts such a rule (variant field), [`VarRel::ALWAYS`] = exists
    /// whenever the context is valid.
    pub existence: VarRel,
    pub ty: TypeId,
    pub imp: VarImpl,
}

/// Kind-specific variable implementation, fixed at instantiation time.
#[derive(Clone, Debug)]
pub(crate) enum VarImpl {
    /// Placeholder while the node is being instantiated.
    Pending,
    Root(RootVar),
    /// Integers and enumerations (the node's type tells them apart).
    Int(IntVar),
    Struct(StructVar),
    Variant(VariantVar),
    Array(ArrayVar),
    Sequence(SequenceVar),
}

#[derive(Clone, Debug)]
pub(crate) struct RootVar {
    /// Instantiated dynamic-scope children in scope order; `NONE` for
    /// unassigned slots.
    pub scopes: [VarRel; 6],
}

#[derive(Clone, Debug)]
pub(crate) struct IntVar {
    pub layout: FixedLayout,
    pub access: IntAccess,
}

#[derive(Clone, Debug)]
pub(crate) struct StructVar {
    pub layout: FixedLayout,
}

#[derive(Clone, Debug)]
pub(crate) struct VariantVar {
    pub strategy: FloatStrategy,
    pub tag: VarTag,
}

#[derive(Clone, Debug)]
pub(crate) struct ArrayVar {
    pub layout: FixedLayout,
    pub len: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct SequenceVar {
    pub layout: FixedLayout,
    pub len_tag: VarTag,
}

impl Meta {
    pub(crate) fn var(&self, id: VarId) -> Var<'_> {
        Var { meta: self, id }
    }

    pub(crate) fn node(&self, id: VarId) -> &VarNode {
        &self.vars[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: VarId) -> &mut VarNode {
        &mut self.vars[id.0 as usize]
    }

    pub(crate) fn parent_of(&self, id: VarId) -> Option<VarId> {
        let rel = self.node(id).parent;
        (!rel.is_none()).then(|| id.offset(rel))
    }

    pub(crate) fn first_child(&self, id: VarId) -> Option<VarId> {
        let rel = self.node(id).first_child;
        (!rel.is_none()).then(|| id.offset(rel))
    }

    pub(crate) fn next_sibling(&self, id: VarId) -> Option<VarId> {
        let rel = self.node(id).next_sibling;
        (!rel.is_none()).then(|| id.offset(rel))
    }

    pub(crate) fn children(&self, id: VarId) -> impl Iterator<Item = VarId> + '_ {
        std::iter::successors(self.first_child(id), move |c| self.next_sibling(*c))
    }

    pub(crate) fn child_by_name(&self, id: VarId, name: &str) -> Option<VarId> {
        self.children(id)
            .find(|c| self.node(*c).name.map(|n| n.as_str() == name).unwrap_or(false))
    }

    pub(crate) fn type_of(&self, id: VarId) -> TypeId {
        self.node(id).ty
    }

    /// The variable that owns `id`'s context.
    pub(crate) fn context_var(&self, id: VarId) -> VarId {
        id.offset(self.node(id).context)
    }

    /// Relative path lookup, `.` between names, `[]` (no number) for the
    /// floating array-element variable (`values[]` and `values.[]` are
    /// both accepted).
    pub(crate) fn find_from(&self, from: VarId, path: &str) -> Option<VarId> {
        let mut current = from;
        let mut rest = path;
        while !rest.is_empty() {
            let mut matched = None;
            for child in self.children(current) {
                let Some(name) = self.node(child).name else {
                    continue;
                };
                if let Some(r) = tag::match_component(name.as_str(), rest) {
                    matched = Some((child, r));
                    break;
                }
            }
            let (child, r) = matched?;
            current = child;
            rest = r.strip_prefix('.').unwrap_or(r);
        }
        Some(current)
    }

    /// Full dotted name; element variables render without a separating
    /// dot (`values[]`).
    pub(crate) fn full_name(&self, id: VarId) -> String {
        let mut parts = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            if let Some(name) = self.node(c).name {
                parts.push(name);
            }
            current = self.parent_of(c);
        }
        let mut out = String::new();
        for name in parts.iter().rev() {
            if !out.is_empty() && name.as_str() != "[]" {
                out.push('.');
            }
            out.push_str(name.as_str());
        }
        out
    }
}

/// A variable: a concrete position of a value in a prospective byte
/// stream. Copyable handle into the frozen metadata.
#[derive(Copy, Clone)]
pub struct Var<'m> {
    pub(crate) meta: &'m Meta,
    pub(crate) id: VarId,
}

impl<'m> std::fmt::Debug for Var<'m> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Var")
            .field("name", &self.meta.full_name(self.id))
            .finish()
    }
}

impl<'m> PartialEq for Var<'m> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.meta, other.meta) && self.id == other.id
    }
}

impl<'m> Eq for Var<'m> {}

impl<'m> Var<'m> {
    /// Name relative to the parent; `"[]"` for array-element variables.
    pub fn name(&self) -> Option<&'m str> {
        self.meta.node(self.id).name.as_ref().map(|n| n.as_str())
    }

    pub fn full_name(&self) -> String {
        self.meta.full_name(self.id)
    }

    /// Look up a variable by path relative to this one.
    pub fn find(&self, path: &str) -> Option<Var<'m>> {
        self.meta
            .find_from(self.id, path)
            .map(|id| Var { meta: self.meta, id })
    }

    /// The variable's direct children: structure fields, variant options,
    /// or the floating `[]` element of an array/sequence.
    pub fn children(&self) -> impl Iterator<Item = Var<'m>> + 'm {
        let meta = self.meta;
        meta.children(self.id).map(move |id| Var { meta, id })
    }

    pub fn is_element(&self) -> bool {
        self.name() == Some("[]")
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self.meta.types.kind(self.meta.type_of(self.id)),
            TypeKind::Integer(_) | TypeKind::Enumeration(_)
        )
    }

    pub fn is_enumeration(&self) -> bool {
        matches!(
            self.meta.types.kind(self.meta.type_of(self.id)),
            TypeKind::Enumeration(_)
        )
    }

    pub fn is_variant(&self) -> bool {
        matches!(
            self.meta.types.kind(self.meta.type_of(self.id)),
            TypeKind::Variant(_)
        )
    }

    pub fn is_array_like(&self) -> bool {
        matches!(
            self.meta.types.kind(self.meta.type_of(self.id)),
            TypeKind::Array(_) | TypeKind::Sequence(_)
        )
    }

    fn backing_integer(&self) -> Option<&'m crate::types::IntegerType> {
        self.meta.types.backing_integer(self.meta.type_of(self.id))
    }

    /// Byte order of an integer or enumeration variable.
    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.backing_integer().map(|it| it.byte_order)
    }

    pub fn is_signed(&self) -> Option<bool> {
        self.backing_integer().map(|it| it.signed)
    }

    /// Preferred display base of an integer or enumeration variable.
    pub fn display_base(&self) -> Option<DisplayBase> {
        self.backing_integer().map(|it| it.base)
    }

    /// Text encoding of an integer variable (always `none`; other
    /// encodings are rejected at type finalization).
    pub fn encoding(&self) -> Option<Encoding> {
        self.backing_integer().map(|it| it.encoding)
    }

    /// Alignment in bits. `None` when the context is insufficient (a
    /// variant's alignment is its active field's).
    pub fn alignment(&self, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
        layout::alignment(self.meta, self.id, ctx)
    }

    /// Start offset in bits inside this variable's context mapping.
    pub fn start_offset(&self, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
        layout::start_offset(self.meta, self.id, ctx)
    }

    /// Size in bits. `None` when the context is insufficient.
    pub fn size(&self, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
        layout::size(self.meta, self.id, ctx)
    }

    /// End offset in bits inside this variable's context mapping.
    pub fn end_offset(&self, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
        layout::end_offset(self.meta, self.id, ctx)
    }

    /// Whether the variable exists in the given context.
    ///
    /// Walks the existence chain upward: a variant field exists only when
    /// it is the active field. `None` when the context cannot decide.
    pub fn exists(&self, ctx: Option<&Context<'_, '_>>) -> Option<bool> {
        let meta = self.meta;
        let mut current = self.id;
        loop {
            let node = meta.node(current);
            if node.existence == VarRel::ALWAYS {
                return Some(true);
            }
            let conditional = current.offset(node.existence);
            let Some(parent) = meta.parent_of(conditional) else {
                return Some(true);
            };
            match layout::is_child_exist(meta, parent, conditional, ctx)? {
                true => current = parent,
                false => return Some(false),
            }
        }
    }

    /// Copy the value with native byte order and native sign into `dst`.
    ///
    /// `dst` must hold at least the type's size (one byte for sub-byte
    /// integers).
    pub fn copy_int(&self, ctx: &Context<'_, '_>, dst: &mut [u8]) -> Result<(), Error> {
        interp::copy_int(self.meta, self.id, ctx, dst)
    }

    pub fn read_u32(&self, ctx: &Context<'_, '_>) -> Result<u32, Error> {
        interp::read_fit(self.meta, self.id, ctx, 32, false).map(|v| v as u32)
    }

    pub fn read_i32(&self, ctx: &Context<'_, '_>) -> Result<i32, Error> {
        interp::read_fit(self.meta, self.id, ctx, 32, true).map(|v| v as i32)
    }

    pub fn read_u64(&self, ctx: &Context<'_, '_>) -> Result<u64, Error> {
        interp::read_fit(self.meta, self.id, ctx, 64, false)
    }

    pub fn read_i64(&self, ctx: &Context<'_, '_>) -> Result<i64, Error> {
        interp::read_fit(self.meta, self.id, ctx, 64, true).map(|v| v as i64)
    }

    /// Enumeration mapping index of the current value; 0 denotes
    /// "unmatched".
    pub fn enum_index(&self, ctx: &Context<'_, '_>) -> Result<u32, Error> {
        interp::enum_index(self.meta, self.id, ctx)
    }

    /// Enumeration label of the current value, if any range matches.
    pub fn enum_label(&self, ctx: &Context<'_, '_>) -> Result<Option<Intern<String>>, Error> {
        interp::enum_label(self.meta, self.id, ctx)
    }

    /// The active field of a variant.
    ///
    /// `Ok(None)` means no field is active (the tag target is absent or
    /// its value maps to no field); that is not an error for the trace.
    /// `Err(InsufficientContext)` means the context cannot decide.
    pub fn active_field(&self, ctx: &Context<'_, '_>) -> Result<Option<Var<'m>>, Error> {
        if !self.is_variant() {
            return Err(Error::WrongKind("variant"));
        }
        match layout::variant_active(self.meta, self.id, Some(ctx)) {
            None => Err(Error::InsufficientContext),
            Some(field) => Ok(field.map(|id| Var { meta: self.meta, id })),
        }
    }

    /// Number of elements: constant for arrays, evaluated from the length
    /// tag for sequences (clamped to >= 0). `None` when the context is
    /// insufficient or the variable is not an array or sequence.
    pub fn element_count(&self, ctx: Option<&Context<'_, '_>>) -> Option<u64> {
        layout::element_count(self.meta, self.id, ctx)
    }

    /// The floating element variable (`[]`) of an array or sequence.
    pub fn element(&self) -> Option<Var<'m>> {
        if !self.is_array_like() {
            return None;
        }
        self.meta
            .first_child(self.id)
            .map(|id| Var { meta: self.meta, id })
    }

    /// Create a context positioned at element `index` of the array or
    /// sequence owning this element variable.
    ///
    /// `array_ctx` must be (or derive from) the context of the array
    /// itself. If `index` is past the element count the returned context
    /// is an *end* context that only supports destruction and
    /// [`Context::is_end`].
    pub fn element_context<'c, 'p>(
        &self,
        array_ctx: &'p Context<'c, 'p>,
        index: u64,
    ) -> Result<Context<'c, 'p>, Error> {
        context::element_context(self.id, array_ctx, index)
    }
}
