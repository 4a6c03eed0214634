use crate::{
    context::{self, ByteSource, Context},
    error::Error,
    types::TypeArena,
    vars::{Var, VarNode, ROOT_VAR},
};
use fxhash::FxHashMap;
use internment::Intern;

/// Frozen trace metadata: the type graph, the instantiated variable tree
/// and the top-scope parameters.
///
/// Produced by [`MetaBuilder::instantiate`](crate::MetaBuilder::instantiate)
/// and immutable from then on; it may be shared across threads, while the
/// [`Context`]s created from it are single-threaded.
#[derive(Debug)]
pub struct Meta {
    pub(crate) types: TypeArena,
    pub(crate) vars: Vec<VarNode>,
    pub(crate) params: FxHashMap<Intern<String>, String>,
}

impl Meta {
    /// Look up a variable by absolute dotted path, starting at one of
    /// the dynamic scopes (e.g. `"stream.event.header.id"`). `[]`
    /// addresses the floating element variable of an array or sequence
    /// (`"event.fields.values[]"`).
    pub fn find_var(&self, path: &str) -> Option<Var<'_>> {
        self.find_from(ROOT_VAR, path).map(|id| Var { meta: self, id })
    }

    /// Value of a top-scope parameter by full dotted name (e.g.
    /// `"trace.uuid"` or `"env.hostname"`).
    pub fn find_param(&self, name: &str) -> Option<&str> {
        self.params.get(&Intern::from_ref(name)).map(String::as_str)
    }

    /// Create a context binding a top-level dynamic-scope variable to a
    /// byte source.
    ///
    /// `parent` must derive from the context of the preceding
    /// instantiated dynamic scope and is only optional for the first
    /// one.
    pub fn create_top_context<'m, 'p>(
        &'m self,
        var: Var<'_>,
        source: Box<dyn ByteSource + 'm>,
        parent: Option<&'p Context<'m, 'p>>,
    ) -> Result<Context<'m, 'p>, Error> {
        context::top_context(self, var.id, source, parent)
    }
}
