use crate::{
    error::Error,
    meta::Meta,
    scope::{ScopeArena, ScopeId, ScopeKind, ROOT_SCOPE},
    tag::{Tag, TagFailure},
    types::{
        ByteOrder, DisplayBase, DynScope, Encoding, EnumerationDraft, IntegerDraft, SequenceType,
        StructureType, TypeArena, TypeId, TypeKind, VariantType, ROOT_TYPE,
    },
    vars::build,
};
use internment::Intern;
use tracing::debug;

/// Event-driven metadata construction.
///
/// The metadata parser (or any other producer) feeds type definitions,
/// scopes and assignments through the event methods; `instantiate`
/// consumes the builder, lays out the variable tree, and returns the
/// frozen [`Meta`]. All construction state lives here and is dropped at
/// that point.
#[derive(Debug)]
pub struct MetaBuilder {
    types: TypeArena,
    scopes: ScopeArena,
    current_scope: ScopeId,
    /// Types begun but not yet committed, innermost last.
    open: Vec<OpenType>,
}

#[derive(Debug)]
struct OpenType {
    name: Intern<String>,
    internal: bool,
    owner_scope: ScopeId,
    scope_open: bool,
    kind: OpenKind,
}

#[derive(Debug)]
enum OpenKind {
    Integer(IntegerDraft),
    Enum(EnumerationDraft),
    Struct(TypeId),
    Variant(TypeId),
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaBuilder {
    pub fn new() -> Self {
        MetaBuilder {
            types: TypeArena::new(),
            scopes: ScopeArena::new(),
            current_scope: ROOT_SCOPE,
            open: Vec::new(),
        }
    }

    /// Search for a committed type; walks the scope chain toward the
    /// root. Types under construction and internal types are invisible.
    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        self.scopes.find_type(self.current_scope, name)
    }

    /// Search only the current scope. Useful to decide whether a name
    /// may still be defined here.
    pub fn find_type_strict(&self, name: &str) -> Option<TypeId> {
        self.scopes.find_type_strict(self.current_scope, name)
    }

    /// Whether a new type may be created at the current position.
    fn check_can_create(&self) -> Result<(), Error> {
        if !self.scopes.supports_types(self.current_scope) {
            return Err(Error::BuilderState(
                "the current scope does not support type definitions",
            ));
        }
        if let Some(open) = self.open.last() {
            if !open.scope_open {
                return Err(Error::BuilderState(
                    "the type under construction must be committed first",
                ));
            }
        }
        Ok(())
    }

    fn check_collision(&self, name: &str, internal: bool) -> Result<(), Error> {
        if !internal && self.scopes.find_type_strict(self.current_scope, name).is_some() {
            return Err(Error::DuplicateTypeName(name.to_owned()));
        }
        Ok(())
    }

    /// The base type for tag resolution: the type connected to the
    /// nearest enclosing scope, or the root type at top level.
    fn tag_base(&self) -> TypeId {
        let mut scope = Some(self.current_scope);
        while let Some(id) = scope {
            let node = self.scopes.node(id);
            if let Some(connected) = node.connected {
                return connected;
            }
            scope = node.parent;
        }
        ROOT_TYPE
    }

    /// Resolve a tag string: first relative to the type under
    /// construction, then absolute at the root type. A tag that resolves
    /// partially is rejected outright.
    fn make_tag(&self, input: &str) -> Result<Tag, Error> {
        let base = self.tag_base();
        if base != ROOT_TYPE {
            match Tag::resolve(&self.types, base, input) {
                Ok(tag) => return Ok(tag),
                Err(TagFailure::FirstComponent) => {}
                Err(TagFailure::Terminal(e)) => return Err(e),
            }
        }
        match Tag::resolve(&self.types, ROOT_TYPE, input) {
            Ok(tag) => Ok(tag),
            Err(TagFailure::FirstComponent) => Err(Error::UnresolvedTag(input.to_owned())),
            Err(TagFailure::Terminal(e)) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Integers
    // ------------------------------------------------------------------

    /// Integers are always internal: they are reached through the
    /// returned [`TypeId`] (or a typedef), never by name search.
    pub fn int_begin(&mut self, name: &str) -> Result<(), Error> {
        self.check_can_create()?;
        self.open.push(OpenType {
            name: Intern::from_ref(name),
            internal: true,
            owner_scope: self.current_scope,
            scope_open: false,
            kind: OpenKind::Integer(IntegerDraft::default()),
        });
        Ok(())
    }

    fn open_integer(&mut self) -> Result<&mut IntegerDraft, Error> {
        match self.open.last_mut() {
            Some(OpenType {
                kind: OpenKind::Integer(draft),
                ..
            }) => Ok(draft),
            _ => Err(Error::BuilderState("no integer is under construction")),
        }
    }

    pub fn int_set_size(&mut self, size: i64) -> Result<(), Error> {
        self.open_integer()?.set_size(size)
    }

    pub fn int_set_align(&mut self, align: i64) -> Result<(), Error> {
        self.open_integer()?.set_align(align)
    }

    pub fn int_set_signed(&mut self, signed: bool) -> Result<(), Error> {
        self.open_integer()?.signed = Some(signed);
        Ok(())
    }

    pub fn int_set_byte_order(&mut self, byte_order: ByteOrder) -> Result<(), Error> {
        self.open_integer()?.byte_order = Some(byte_order);
        Ok(())
    }

    pub fn int_set_base(&mut self, base: DisplayBase) -> Result<(), Error> {
        self.open_integer()?.base = Some(base);
        Ok(())
    }

    pub fn int_set_encoding(&mut self, encoding: Encoding) -> Result<(), Error> {
        self.open_integer()?.encoding = Some(encoding);
        Ok(())
    }

    pub fn int_end(&mut self) -> Result<TypeId, Error> {
        let open = match self.open.last() {
            Some(OpenType {
                kind: OpenKind::Integer(_),
                ..
            }) => self.open.pop().ok_or(Error::BuilderState("no open type"))?,
            _ => return Err(Error::BuilderState("no integer is under construction")),
        };
        let OpenKind::Integer(draft) = open.kind else {
            return Err(Error::BuilderState("no integer is under construction"));
        };
        let integer = draft.finalize()?;
        let id = self.types.alloc(Some(open.name), TypeKind::Integer(integer));
        debug!(name = %open.name, size = integer.size, align = integer.align, "Committed integer type");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Structures
    // ------------------------------------------------------------------

    pub fn struct_begin(&mut self, name: &str, internal: bool) -> Result<(), Error> {
        self.check_can_create()?;
        self.check_collision(name, internal)?;
        let id = self.types.alloc(
            Some(Intern::from_ref(name)),
            TypeKind::Structure(StructureType::new()),
        );
        self.open.push(OpenType {
            name: Intern::from_ref(name),
            internal,
            owner_scope: self.current_scope,
            scope_open: false,
            kind: OpenKind::Struct(id),
        });
        Ok(())
    }

    fn open_struct(&mut self) -> Result<(TypeId, &mut OpenType), Error> {
        match self.open.last_mut() {
            Some(open) => match open.kind {
                OpenKind::Struct(id) => Ok((id, open)),
                _ => Err(Error::BuilderState("no structure is under construction")),
            },
            None => Err(Error::BuilderState("no structure is under construction")),
        }
    }

    pub fn struct_begin_scope(&mut self) -> Result<(), Error> {
        let parent = self.current_scope;
        let (id, open) = self.open_struct()?;
        if open.scope_open {
            return Err(Error::BuilderState("the structure scope is already open"));
        }
        open.scope_open = true;
        self.current_scope = self.scopes.alloc(parent, ScopeKind::Struct, Some(id));
        Ok(())
    }

    pub fn struct_add_field(&mut self, name: &str, field_type: TypeId) -> Result<(), Error> {
        let max_align = self.types.max_alignment(field_type);
        let (id, _) = self.open_struct()?;
        let TypeKind::Structure(s) = &mut self.types.node_mut(id).kind else {
            return Err(Error::BuilderState("no structure is under construction"));
        };
        if s.has_field(name) {
            return Err(Error::DuplicateField(name.to_owned()));
        }
        s.fields.push((Intern::from_ref(name), field_type));
        if s.align < max_align {
            s.align = max_align;
        }
        Ok(())
    }

    pub fn struct_has_field(&self, name: &str) -> Result<bool, Error> {
        match self.open.last() {
            Some(OpenType {
                kind: OpenKind::Struct(id),
                ..
            }) => match self.types.kind(*id) {
                TypeKind::Structure(s) => Ok(s.has_field(name)),
                _ => Err(Error::BuilderState("no structure is under construction")),
            },
            _ => Err(Error::BuilderState("no structure is under construction")),
        }
    }

    pub fn struct_end_scope(&mut self) -> Result<(), Error> {
        let (_, open) = self.open_struct()?;
        if !open.scope_open {
            return Err(Error::BuilderState("the structure scope is not open"));
        }
        open.scope_open = false;
        self.current_scope = self
            .scopes
            .node(self.current_scope)
            .parent
            .unwrap_or(ROOT_SCOPE);
        Ok(())
    }

    pub fn struct_end(&mut self) -> Result<TypeId, Error> {
        let (id, open) = self.open_struct()?;
        if open.scope_open {
            return Err(Error::BuilderState("the structure scope is still open"));
        }
        let open = self.open.pop().ok_or(Error::BuilderState("no open type"))?;
        if !open.internal {
            self.scopes.insert_type(open.owner_scope, open.name, id)?;
        }
        debug!(name = %open.name, "Committed structure type");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Enumerations
    // ------------------------------------------------------------------

    pub fn enum_begin(&mut self, name: &str, base: TypeId, internal: bool) -> Result<(), Error> {
        self.check_can_create()?;
        self.check_collision(name, internal)?;
        match self.types.kind(base) {
            TypeKind::Integer(it) if it.size <= 64 => {}
            _ => return Err(Error::EnumBaseUnsupported),
        }
        self.open.push(OpenType {
            name: Intern::from_ref(name),
            internal,
            owner_scope: self.current_scope,
            scope_open: false,
            kind: OpenKind::Enum(EnumerationDraft::new(base)),
        });
        Ok(())
    }

    fn open_enum(&mut self) -> Result<&mut OpenType, Error> {
        match self.open.last_mut() {
            Some(open) if matches!(open.kind, OpenKind::Enum(_)) => Ok(open),
            _ => Err(Error::BuilderState("no enumeration is under construction")),
        }
    }

    pub fn enum_begin_scope(&mut self) -> Result<(), Error> {
        let parent = self.current_scope;
        let open = self.open_enum()?;
        if open.scope_open {
            return Err(Error::BuilderState("the enumeration scope is already open"));
        }
        open.scope_open = true;
        self.current_scope = self.scopes.alloc(parent, ScopeKind::Enum, None);
        Ok(())
    }

    pub fn enum_add_value(&mut self, label: &str, start: i64, end: i64) -> Result<(), Error> {
        let open = self.open_enum()?;
        let OpenKind::Enum(draft) = &mut open.kind else {
            return Err(Error::BuilderState("no enumeration is under construction"));
        };
        draft.add_value(label, start, end);
        Ok(())
    }

    pub fn enum_end_scope(&mut self) -> Result<(), Error> {
        let open = self.open_enum()?;
        if !open.scope_open {
            return Err(Error::BuilderState("the enumeration scope is not open"));
        }
        open.scope_open = false;
        self.current_scope = self
            .scopes
            .node(self.current_scope)
            .parent
            .unwrap_or(ROOT_SCOPE);
        Ok(())
    }

    pub fn enum_end(&mut self) -> Result<TypeId, Error> {
        let open = self.open_enum()?;
        if open.scope_open {
            return Err(Error::BuilderState("the enumeration scope is still open"));
        }
        let open = self.open.pop().ok_or(Error::BuilderState("no open type"))?;
        let OpenKind::Enum(draft) = open.kind else {
            return Err(Error::BuilderState("no enumeration is under construction"));
        };
        let e = draft.finalize()?;
        let id = self.types.alloc(Some(open.name), TypeKind::Enumeration(e));
        if !open.internal {
            self.scopes.insert_type(open.owner_scope, open.name, id)?;
        }
        debug!(name = %open.name, "Committed enumeration type");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Variants
    // ------------------------------------------------------------------

    pub fn variant_begin(&mut self, name: &str, internal: bool) -> Result<(), Error> {
        self.check_can_create()?;
        self.check_collision(name, internal)?;
        let id = self.types.alloc(
            Some(Intern::from_ref(name)),
            TypeKind::Variant(VariantType::new()),
        );
        self.open.push(OpenType {
            name: Intern::from_ref(name),
            internal,
            owner_scope: self.current_scope,
            scope_open: false,
            kind: OpenKind::Variant(id),
        });
        Ok(())
    }

    fn open_variant(&mut self) -> Result<(TypeId, &mut OpenType), Error> {
        match self.open.last_mut() {
            Some(open) => match open.kind {
                OpenKind::Variant(id) => Ok((id, open)),
                _ => Err(Error::BuilderState("no variant is under construction")),
            },
            None => Err(Error::BuilderState("no variant is under construction")),
        }
    }

    pub fn variant_begin_scope(&mut self) -> Result<(), Error> {
        let parent = self.current_scope;
        let (id, open) = self.open_variant()?;
        if open.scope_open {
            return Err(Error::BuilderState("the variant scope is already open"));
        }
        open.scope_open = true;
        self.current_scope = self.scopes.alloc(parent, ScopeKind::Variant, Some(id));
        Ok(())
    }

    pub fn variant_add_field(&mut self, label: &str, field_type: TypeId) -> Result<(), Error> {
        let (id, _) = self.open_variant()?;
        let TypeKind::Variant(v) = &mut self.types.node_mut(id).kind else {
            return Err(Error::BuilderState("no variant is under construction"));
        };
        if v.has_option(label) {
            return Err(Error::DuplicateField(label.to_owned()));
        }
        v.options.push((Intern::from_ref(label), field_type));
        Ok(())
    }

    pub fn variant_end_scope(&mut self) -> Result<(), Error> {
        let (_, open) = self.open_variant()?;
        if !open.scope_open {
            return Err(Error::BuilderState("the variant scope is not open"));
        }
        open.scope_open = false;
        self.current_scope = self
            .scopes
            .node(self.current_scope)
            .parent
            .unwrap_or(ROOT_SCOPE);
        Ok(())
    }

    pub fn variant_end(&mut self) -> Result<TypeId, Error> {
        let (id, open) = self.open_variant()?;
        if open.scope_open {
            return Err(Error::BuilderState("the variant scope is still open"));
        }
        let open = self.open.pop().ok_or(Error::BuilderState("no open type"))?;
        if !open.internal {
            self.scopes.insert_type(open.owner_scope, open.name, id)?;
        }
        debug!(name = %open.name, "Committed variant type");
        Ok(id)
    }

    /// Attach a tag to a committed, still untagged variant. The tag must
    /// point at an enumeration.
    pub fn variant_set_tag(&mut self, variant: TypeId, tag: &str) -> Result<(), Error> {
        let resolved = self.make_tag(tag)?;
        match self.types.kind(resolved.target_type()) {
            TypeKind::Enumeration(_) => {}
            _ => return Err(Error::TagTargetKind("enumeration")),
        }
        let name = self.types.type_name(variant).to_owned();
        let TypeKind::Variant(v) = &mut self.types.node_mut(variant).kind else {
            return Err(Error::TagTargetKind("variant"));
        };
        if v.tag.is_some() {
            return Err(Error::TagAlreadySet(name));
        }
        v.tag = Some(resolved);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arrays, sequences, typedefs
    // ------------------------------------------------------------------

    pub fn array_create(
        &mut self,
        name: &str,
        len: u64,
        elem: TypeId,
        internal: bool,
    ) -> Result<TypeId, Error> {
        self.check_can_create()?;
        self.check_collision(name, internal)?;
        let id = self.types.alloc(
            Some(Intern::from_ref(name)),
            TypeKind::Array(crate::types::ArrayType { len, elem }),
        );
        if !internal {
            self.scopes
                .insert_type(self.current_scope, Intern::from_ref(name), id)?;
        }
        Ok(id)
    }

    /// Unlike a variant's tag, a sequence's length tag is fixed at
    /// creation.
    pub fn sequence_create(
        &mut self,
        name: &str,
        len_tag: &str,
        elem: TypeId,
        internal: bool,
    ) -> Result<TypeId, Error> {
        self.check_can_create()?;
        self.check_collision(name, internal)?;
        let resolved = self.make_tag(len_tag)?;
        match self.types.kind(resolved.target_type()) {
            TypeKind::Integer(it) if it.size <= 64 => {}
            _ => return Err(Error::TagTargetKind("integer")),
        }
        let id = self.types.alloc(
            Some(Intern::from_ref(name)),
            TypeKind::Sequence(SequenceType {
                len_tag: resolved,
                elem,
            }),
        );
        if !internal {
            self.scopes
                .insert_type(self.current_scope, Intern::from_ref(name), id)?;
        }
        Ok(id)
    }

    /// Deep-clone an existing type under a new name. Used both for plain
    /// renames and to make a taggable copy of a previously defined
    /// variant; nothing may assume identity between the clone and its
    /// source.
    pub fn typedef_create(
        &mut self,
        name: &str,
        source: TypeId,
        internal: bool,
    ) -> Result<TypeId, Error> {
        self.check_can_create()?;
        self.check_collision(name, internal)?;
        let id = self.types.clone_deep(source, Some(Intern::from_ref(name)));
        if !internal {
            self.scopes
                .insert_type(self.current_scope, Intern::from_ref(name), id)?;
        }
        debug!(name, source = %self.types.type_name(source), "Created typedef");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Top scopes
    // ------------------------------------------------------------------

    /// Open (or re-open) one of the fixed top-level scopes. Top scopes
    /// are re-entrant: a second `stream {}` block continues the first.
    pub fn top_scope_begin(&mut self, name: &str) -> Result<(), Error> {
        if self.current_scope != ROOT_SCOPE || !self.open.is_empty() {
            return Err(Error::BuilderState("top scopes only nest in the root scope"));
        }
        if !matches!(name, "trace" | "stream" | "event" | "env") {
            return Err(Error::UnknownTopScope(name.to_owned()));
        }
        self.current_scope = match self.scopes.find_top(name) {
            Some(existing) => existing,
            None => self.scopes.create_top(Intern::from_ref(name)),
        };
        Ok(())
    }

    /// Assign a type to a dynamic-scope position relative to the open
    /// top scope (e.g. `packet.context` inside `stream`).
    pub fn assign_type(&mut self, position: &str, ty: TypeId) -> Result<(), Error> {
        let ScopeKind::Top { name, .. } = &self.scopes.node(self.current_scope).kind else {
            return Err(Error::BuilderState("type assignment requires a top scope"));
        };
        let full = format!("{}.{}", name.as_str(), position);
        let scope = DynScope::from_full_name(&full)
            .ok_or_else(|| Error::UnknownDynamicScope(full.clone()))?;
        self.types.root_mut().slots[scope.index()] = Some(ty);
        debug!(position = %full, ty = %self.types.type_name(ty), "Assigned dynamic scope");
        Ok(())
    }

    /// Add a named parameter to the open top scope.
    pub fn add_param(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.scopes.add_param(self.current_scope, name, value)
    }

    pub fn top_scope_end(&mut self) -> Result<(), Error> {
        if !matches!(
            self.scopes.node(self.current_scope).kind,
            ScopeKind::Top { .. }
        ) {
            return Err(Error::BuilderState("no top scope is open"));
        }
        self.current_scope = ROOT_SCOPE;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Freeze
    // ------------------------------------------------------------------

    /// Seal the metadata: lay out the variable tree and drop all
    /// construction state. Fails while a type or scope is still open, or
    /// when a variable cannot be laid out (untagged variant, forward tag
    /// reference, ...).
    pub fn instantiate(self) -> Result<Meta, Error> {
        if !self.open.is_empty() || self.current_scope != ROOT_SCOPE {
            return Err(Error::OpenConstruction);
        }
        let params = self.scopes.collect_params();
        let mut meta = Meta {
            types: self.types,
            vars: Vec::new(),
            params,
        };
        build::run(&mut meta)?;
        Ok(meta)
    }
}
