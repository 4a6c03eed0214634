use crate::{error::Error, types::TypeId};
use fxhash::FxHashMap;
use internment::Intern;

/// Handle into the scope arena. Scopes only exist while the builder is
/// alive; instantiation drops the whole arena.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct ScopeId(u32);

pub(crate) const ROOT_SCOPE: ScopeId = ScopeId(0);

#[derive(Clone, Debug)]
pub(crate) enum ScopeKind {
    Root,
    /// One of the fixed top-level scopes (`trace`, `stream`, `event`,
    /// `env`); carries the scope's parameter table.
    Top {
        name: Intern<String>,
        params: Vec<(Intern<String>, String)>,
    },
    Struct,
    Variant,
    Enum,
}

#[derive(Clone, Debug)]
pub(crate) struct ScopeNode {
    pub parent: Option<ScopeId>,
    pub kind: ScopeKind,
    /// The compound type this scope belongs to, if any. Tags written
    /// inside the scope resolve relative to this type.
    pub connected: Option<TypeId>,
    /// Committed, searchable types. Internal types and types still under
    /// construction never appear here.
    types: FxHashMap<Intern<String>, TypeId>,
}

#[derive(Clone, Debug)]
pub(crate) struct ScopeArena {
    nodes: Vec<ScopeNode>,
    /// Top scopes are re-entrant: a second `stream {}` block continues the
    /// first one.
    tops: FxHashMap<Intern<String>, ScopeId>,
}

impl ScopeArena {
    pub fn new() -> Self {
        ScopeArena {
            nodes: vec![ScopeNode {
                parent: None,
                kind: ScopeKind::Root,
                connected: None,
                types: FxHashMap::default(),
            }],
            tops: FxHashMap::default(),
        }
    }

    pub fn alloc(
        &mut self,
        parent: ScopeId,
        kind: ScopeKind,
        connected: Option<TypeId>,
    ) -> ScopeId {
        let id = ScopeId(self.nodes.len() as u32);
        self.nodes.push(ScopeNode {
            parent: Some(parent),
            kind,
            connected,
            types: FxHashMap::default(),
        });
        id
    }

    pub fn node(&self, id: ScopeId) -> &ScopeNode {
        &self.nodes[id.0 as usize]
    }

    fn node_mut(&mut self, id: ScopeId) -> &mut ScopeNode {
        &mut self.nodes[id.0 as usize]
    }

    /// Whether type definitions may be added inside this scope.
    pub fn supports_types(&self, id: ScopeId) -> bool {
        matches!(
            self.node(id).kind,
            ScopeKind::Root | ScopeKind::Top { .. } | ScopeKind::Struct | ScopeKind::Variant
        )
    }

    /// Search the scope chain toward the root. Shadowing across nested
    /// scopes is permitted; the innermost definition wins.
    pub fn find_type(&self, from: ScopeId, name: &str) -> Option<TypeId> {
        let key = Intern::from_ref(name);
        let mut scope = Some(from);
        while let Some(id) = scope {
            if let Some(ty) = self.node(id).types.get(&key) {
                return Some(*ty);
            }
            scope = self.node(id).parent;
        }
        None
    }

    /// Search only the given scope.
    pub fn find_type_strict(&self, scope: ScopeId, name: &str) -> Option<TypeId> {
        self.node(scope).types.get(&Intern::from_ref(name)).copied()
    }

    /// Commit a searchable type into the scope. A name collides only when
    /// defined twice in the same scope.
    pub fn insert_type(
        &mut self,
        scope: ScopeId,
        name: Intern<String>,
        ty: TypeId,
    ) -> Result<(), Error> {
        let node = self.node_mut(scope);
        if node.types.contains_key(&name) {
            return Err(Error::DuplicateTypeName(name.as_str().to_owned()));
        }
        node.types.insert(name, ty);
        Ok(())
    }

    pub fn find_top(&self, name: &str) -> Option<ScopeId> {
        self.tops.get(&Intern::from_ref(name)).copied()
    }

    pub fn create_top(&mut self, name: Intern<String>) -> ScopeId {
        let id = self.alloc(
            ROOT_SCOPE,
            ScopeKind::Top {
                name,
                params: Vec::new(),
            },
            None,
        );
        self.tops.insert(name, id);
        id
    }

    pub fn add_param(&mut self, scope: ScopeId, name: &str, value: &str) -> Result<(), Error> {
        match &mut self.node_mut(scope).kind {
            ScopeKind::Top { params, .. } => {
                params.push((Intern::from_ref(name), value.to_owned()));
                Ok(())
            }
            _ => Err(Error::BuilderState("parameters belong to top scopes")),
        }
    }

    /// Flatten every top scope's parameters into `"scope.param"` keys.
    pub fn collect_params(&self) -> FxHashMap<Intern<String>, String> {
        let mut out = FxHashMap::default();
        for node in &self.nodes {
            if let ScopeKind::Top { name, params } = &node.kind {
                for (param, value) in params {
                    let full = format!("{}.{}", name.as_str(), param.as_str());
                    out.insert(Intern::new(full), value.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn chain_search_and_shadowing() {
        let mut scopes = ScopeArena::new();
        let inner = scopes.alloc(ROOT_SCOPE, ScopeKind::Struct, None);

        scopes
            .insert_type(ROOT_SCOPE, Intern::from_ref("t"), TypeId(1))
            .unwrap();
        assert_eq!(scopes.find_type(inner, "t"), Some(TypeId(1)));
        assert_eq!(scopes.find_type_strict(inner, "t"), None);

        // Inner definition shadows the outer one.
        scopes
            .insert_type(inner, Intern::from_ref("t"), TypeId(2))
            .unwrap();
        assert_eq!(scopes.find_type(inner, "t"), Some(TypeId(2)));
        assert_eq!(scopes.find_type(ROOT_SCOPE, "t"), Some(TypeId(1)));

        // Same-scope redefinition collides.
        assert!(scopes
            .insert_type(inner, Intern::from_ref("t"), TypeId(3))
            .is_err());
    }

    #[test]
    fn params_only_on_top_scopes() {
        let mut scopes = ScopeArena::new();
        let trace = scopes.create_top(Intern::from_ref("trace"));
        scopes.add_param(trace, "uuid", "2a6422d0").unwrap();
        assert!(scopes.add_param(ROOT_SCOPE, "uuid", "x").is_err());

        let params = scopes.collect_params();
        assert_eq!(
            params.get(&Intern::from_ref("trace.uuid")).map(String::as_str),
            Some("2a6422d0")
        );
    }
}
