//! Parsed metadata AST and its translation into builder events.
//!
//! The metadata *text* parser is an external collaborator; this module is
//! its interface to the core. A parser produces a [`Document`] and
//! [`compile`] drives the [`MetaBuilder`] event stream from it,
//! synthesizing the internal wrapper types (array/sequence dimensions,
//! tagged references to named variants) the event API expects.

use crate::{
    builder::MetaBuilder,
    error::Error,
    meta::Meta,
    types::{ByteOrder, DisplayBase, Encoding, TypeId},
};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct Document {
    pub statements: Vec<Statement>,
}

#[derive(Clone, Debug)]
pub enum Statement {
    /// `typealias`/`typedef`: bind a type spec to a searchable name.
    Typedef { name: String, spec: TypeSpec },
    /// A standalone (named) type declaration.
    Declaration(TypeSpec),
    /// A `trace`/`stream`/`event`/`env` block.
    Scope {
        name: TopScopeName,
        body: Vec<ScopeEntry>,
    },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TopScopeName {
    Trace,
    Stream,
    Event,
    Env,
}

impl TopScopeName {
    pub fn as_str(self) -> &'static str {
        match self {
            TopScopeName::Trace => "trace",
            TopScopeName::Stream => "stream",
            TopScopeName::Event => "event",
            TopScopeName::Env => "env",
        }
    }
}

#[derive(Clone, Debug)]
pub enum ScopeEntry {
    /// `position := type-spec`, position relative to the enclosing scope
    /// (e.g. `packet.header` inside `trace`).
    Assign { position: String, spec: TypeSpec },
    /// `name = "value";`
    Param { name: String, value: String },
    Typedef { name: String, spec: TypeSpec },
    Declaration(TypeSpec),
}

#[derive(Clone, Debug)]
pub enum TypeSpec {
    /// Reference to a previously declared searchable type.
    Named(String),
    Integer(IntegerSpec),
    Struct(StructSpec),
    Variant(VariantSpec),
    Enum(EnumSpec),
}

#[derive(Clone, Debug, Default)]
pub struct IntegerSpec {
    pub size: u32,
    pub align: Option<u32>,
    pub signed: Option<bool>,
    pub byte_order: Option<ByteOrder>,
    pub base: Option<DisplayBase>,
    pub encoding: Option<Encoding>,
}

#[derive(Clone, Debug)]
pub struct StructSpec {
    pub name: Option<String>,
    pub fields: Vec<Field>,
}

/// A field declarator; `dims` apply left to right, outermost first
/// (`values[2][n]` is an array of two sequences).
#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub spec: TypeSpec,
    pub dims: Vec<Dimension>,
}

impl Field {
    pub fn plain(name: impl Into<String>, spec: TypeSpec) -> Self {
        Field {
            name: name.into(),
            spec,
            dims: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Dimension {
    Fixed(u64),
    /// Sequence dimension sized by the tagged integer.
    Tagged(String),
}

#[derive(Clone, Debug)]
pub struct VariantSpec {
    pub name: Option<String>,
    /// The discriminator tag string. `None` only for a standalone
    /// untagged declaration (tagged on use).
    pub tag: Option<String>,
    /// Empty for a tagged reference to a previously declared variant.
    pub options: Vec<Field>,
}

#[derive(Clone, Debug)]
pub struct EnumSpec {
    pub name: Option<String>,
    /// Backing integer: a named alias or an inline integer spec.
    pub base: Box<TypeSpec>,
    pub entries: Vec<EnumEntry>,
}

/// One enumeration entry; without an explicit range the value continues
/// one past the previous entry.
#[derive(Clone, Debug)]
pub struct EnumEntry {
    pub label: String,
    pub range: Option<(i64, i64)>,
}

impl EnumEntry {
    pub fn auto(label: impl Into<String>) -> Self {
        EnumEntry {
            label: label.into(),
            range: None,
        }
    }

    pub fn value(label: impl Into<String>, value: i64) -> Self {
        EnumEntry {
            label: label.into(),
            range: Some((value, value)),
        }
    }
}

/// Compile a parsed metadata document into frozen [`Meta`].
pub fn compile(document: &Document) -> Result<Meta, Error> {
    let mut compiler = Compiler {
        builder: MetaBuilder::new(),
        synth: 0,
    };
    for statement in &document.statements {
        compiler.statement(statement)?;
    }
    debug!(statements = document.statements.len(), "Compiled metadata document");
    compiler.builder.instantiate()
}

struct Compiler {
    builder: MetaBuilder,
    synth: usize,
}

impl Compiler {
    fn gensym(&mut self, kind: &str) -> String {
        self.synth += 1;
        format!("{}#{}", kind, self.synth)
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), Error> {
        match statement {
            Statement::Typedef { name, spec } => {
                let ty = self.type_spec(spec)?;
                self.builder.typedef_create(name, ty, false)?;
                Ok(())
            }
            Statement::Declaration(spec) => self.type_spec(spec).map(|_| ()),
            Statement::Scope { name, body } => {
                self.builder.top_scope_begin(name.as_str())?;
                for entry in body {
                    match entry {
                        ScopeEntry::Assign { position, spec } => {
                            let ty = self.type_spec(spec)?;
                            self.builder.assign_type(position, ty)?;
                        }
                        ScopeEntry::Param { name, value } => {
                            self.builder.add_param(name, value)?;
                        }
                        ScopeEntry::Typedef { name, spec } => {
                            let ty = self.type_spec(spec)?;
                            self.builder.typedef_create(name, ty, false)?;
                        }
                        ScopeEntry::Declaration(spec) => {
                            self.type_spec(spec)?;
                        }
                    }
                }
                self.builder.top_scope_end()
            }
        }
    }

    fn type_spec(&mut self, spec: &TypeSpec) -> Result<TypeId, Error> {
        match spec {
            TypeSpec::Named(name) => self
                .builder
                .find_type(name)
                .ok_or_else(|| Error::UndefinedType(name.clone())),
            TypeSpec::Integer(spec) => self.integer(spec),
            TypeSpec::Struct(spec) => self.structure(spec),
            TypeSpec::Variant(spec) => self.variant(spec),
            TypeSpec::Enum(spec) => self.enumeration(spec),
        }
    }

    fn integer(&mut self, spec: &IntegerSpec) -> Result<TypeId, Error> {
        let name = self.gensym("integer");
        self.builder.int_begin(&name)?;
        self.builder.int_set_size(i64::from(spec.size))?;
        if let Some(align) = spec.align {
            self.builder.int_set_align(i64::from(align))?;
        }
        if let Some(signed) = spec.signed {
            self.builder.int_set_signed(signed)?;
        }
        if let Some(byte_order) = spec.byte_order {
            self.builder.int_set_byte_order(byte_order)?;
        }
        if let Some(base) = spec.base {
            self.builder.int_set_base(base)?;
        }
        if let Some(encoding) = spec.encoding {
            self.builder.int_set_encoding(encoding)?;
        }
        self.builder.int_end()
    }

    fn structure(&mut self, spec: &StructSpec) -> Result<TypeId, Error> {
        let (name, internal) = match &spec.name {
            Some(name) => (name.clone(), false),
            None => (self.gensym("struct"), true),
        };
        self.builder.struct_begin(&name, internal)?;
        self.builder.struct_begin_scope()?;
        for field in &spec.fields {
            let ty = self.field_type(field)?;
            self.builder.struct_add_field(&field.name, ty)?;
        }
        self.builder.struct_end_scope()?;
        self.builder.struct_end()
    }

    /// Resolve a field declarator: the base spec wrapped by its
    /// dimension suffixes, innermost (rightmost) first.
    fn field_type(&mut self, field: &Field) -> Result<TypeId, Error> {
        let mut ty = self.type_spec(&field.spec)?;
        for dim in field.dims.iter().rev() {
            ty = match dim {
                Dimension::Fixed(len) => {
                    let name = self.gensym("array");
                    self.builder.array_create(&name, *len, ty, true)?
                }
                Dimension::Tagged(tag) => {
                    let name = self.gensym("sequence");
                    self.builder.sequence_create(&name, tag, ty, true)?
                }
            };
        }
        Ok(ty)
    }

    fn variant(&mut self, spec: &VariantSpec) -> Result<TypeId, Error> {
        if spec.options.is_empty() {
            // A tagged reference to a previously declared variant: tag an
            // internal clone, never the original.
            let name = spec
                .name
                .as_ref()
                .ok_or(Error::BuilderState("variant reference requires a name"))?;
            let tag = spec
                .tag
                .as_ref()
                .ok_or(Error::BuilderState("variant reference requires a tag"))?;
            let source = self
                .builder
                .find_type(name)
                .ok_or_else(|| Error::UndefinedType(name.clone()))?;
            let clone_name = self.gensym("variant");
            let id = self.builder.typedef_create(&clone_name, source, true)?;
            self.builder.variant_set_tag(id, tag)?;
            return Ok(id);
        }

        let (name, internal) = match &spec.name {
            Some(name) => (name.clone(), false),
            None => (self.gensym("variant"), true),
        };
        self.builder.variant_begin(&name, internal)?;
        self.builder.variant_begin_scope()?;
        for option in &spec.options {
            let ty = self.field_type(option)?;
            self.builder.variant_add_field(&option.name, ty)?;
        }
        self.builder.variant_end_scope()?;
        let id = self.builder.variant_end()?;
        if let Some(tag) = &spec.tag {
            self.builder.variant_set_tag(id, tag)?;
        }
        Ok(id)
    }

    fn enumeration(&mut self, spec: &EnumSpec) -> Result<TypeId, Error> {
        let base = self.type_spec(&spec.base)?;
        let (name, internal) = match &spec.name {
            Some(name) => (name.clone(), false),
            None => (self.gensym("enum"), true),
        };
        self.builder.enum_begin(&name, base, internal)?;
        self.builder.enum_begin_scope()?;
        let mut next = 0i64;
        for entry in &spec.entries {
            let (start, end) = entry.range.unwrap_or((next, next));
            self.builder.enum_add_value(&entry.label, start, end)?;
            next = end.saturating_add(1);
        }
        self.builder.enum_end_scope()?;
        self.builder.enum_end()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn u8_spec() -> TypeSpec {
        TypeSpec::Integer(IntegerSpec {
            size: 8,
            byte_order: Some(ByteOrder::Little),
            ..Default::default()
        })
    }

    #[test]
    fn compile_simple_document() {
        let doc = Document {
            statements: vec![
                Statement::Typedef {
                    name: "uint8_t".to_owned(),
                    spec: u8_spec(),
                },
                Statement::Scope {
                    name: TopScopeName::Trace,
                    body: vec![
                        ScopeEntry::Param {
                            name: "major".to_owned(),
                            value: "1".to_owned(),
                        },
                        ScopeEntry::Assign {
                            position: "packet.header".to_owned(),
                            spec: TypeSpec::Struct(StructSpec {
                                name: None,
                                fields: vec![
                                    Field::plain("n", TypeSpec::Named("uint8_t".to_owned())),
                                    Field {
                                        name: "values".to_owned(),
                                        spec: TypeSpec::Named("uint8_t".to_owned()),
                                        dims: vec![Dimension::Tagged("n".to_owned())],
                                    },
                                ],
                            }),
                        },
                    ],
                },
            ],
        };

        let meta = compile(&doc).unwrap();
        assert_eq!(meta.find_param("trace.major"), Some("1"));
        assert!(meta.find_var("trace.packet.header.n").is_some());
        assert!(meta.find_var("trace.packet.header.values[]").is_some());
    }

    #[test]
    fn unknown_type_reference_fails() {
        let doc = Document {
            statements: vec![Statement::Scope {
                name: TopScopeName::Trace,
                body: vec![ScopeEntry::Assign {
                    position: "packet.header".to_owned(),
                    spec: TypeSpec::Named("missing".to_owned()),
                }],
            }],
        };
        assert!(matches!(compile(&doc), Err(Error::UndefinedType(_))));
    }
}
