use crate::{
    error::Error,
    tag::{self, Tag, TagComponent},
};
use byteordered::Endianness;
use derive_more::Display;
use internment::Intern;
use itertools::Itertools;

/// Stable handle into the type graph.
///
/// Types are stored in a single arena owned first by the builder and then
/// by the frozen [`Meta`](crate::Meta); cross-references between types are
/// `TypeId`s, never owned subtrees.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeId(pub(crate) u32);

/// Byte order of an integer type.
///
/// Native byte order is deliberately absent: metadata must spell out the
/// wire order and finalization rejects anything else.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum ByteOrder {
    #[display("le")]
    Little,
    #[display("be")]
    Big,
}

impl From<ByteOrder> for Endianness {
    fn from(value: ByteOrder) -> Self {
        match value {
            ByteOrder::Little => Endianness::Little,
            ByteOrder::Big => Endianness::Big,
        }
    }
}

impl ByteOrder {
    pub(crate) fn is_native(self) -> bool {
        if cfg!(target_endian = "little") {
            self == ByteOrder::Little
        } else {
            self == ByteOrder::Big
        }
    }
}

/// The preferred base (radix) to use when displaying integer values.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
pub enum DisplayBase {
    #[default]
    #[display("dec")]
    Decimal,
    #[display("hex")]
    Hexadecimal,
    #[display("hex_upper")]
    HexadecimalUpper,
    #[display("oct")]
    Octal,
    #[display("bin")]
    Binary,
    #[display("ptr")]
    Pointer,
    #[display("unsigned")]
    Unsigned,
}

/// Text encoding of an integer type. Only `none` survives finalization.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Display)]
pub enum Encoding {
    #[default]
    #[display("none")]
    None,
    #[display("UTF8")]
    Utf8,
    #[display("ASCII")]
    Ascii,
}

/// The six fixed positions a user-assigned type may occupy in a trace.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum DynScope {
    #[display("trace.packet.header")]
    TracePacketHeader,
    #[display("stream.packet.context")]
    StreamPacketContext,
    #[display("stream.event.header")]
    StreamEventHeader,
    #[display("stream.event.context")]
    StreamEventContext,
    #[display("event.context")]
    EventContext,
    #[display("event.fields")]
    EventFields,
}

impl DynScope {
    /// Dynamic-scope order: a tag user may only look backwards in this order.
    pub const ALL: [DynScope; 6] = [
        DynScope::TracePacketHeader,
        DynScope::StreamPacketContext,
        DynScope::StreamEventHeader,
        DynScope::StreamEventContext,
        DynScope::EventContext,
        DynScope::EventFields,
    ];

    pub fn full_name(self) -> &'static str {
        match self {
            DynScope::TracePacketHeader => "trace.packet.header",
            DynScope::StreamPacketContext => "stream.packet.context",
            DynScope::StreamEventHeader => "stream.event.header",
            DynScope::StreamEventContext => "stream.event.context",
            DynScope::EventContext => "event.context",
            DynScope::EventFields => "event.fields",
        }
    }

    pub fn from_full_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.full_name() == name)
    }

    pub(crate) fn index(self) -> usize {
        match self {
            DynScope::TracePacketHeader => 0,
            DynScope::StreamPacketContext => 1,
            DynScope::StreamEventHeader => 2,
            DynScope::StreamEventContext => 3,
            DynScope::EventContext => 4,
            DynScope::EventFields => 5,
        }
    }
}

/// One node of the type graph.
#[derive(Clone, Debug)]
pub(crate) struct TypeNode {
    /// `None` for the root type and synthesized unnamed wrappers.
    pub name: Option<Intern<String>>,
    pub kind: TypeKind,
}

#[derive(Clone, Debug)]
pub(crate) enum TypeKind {
    Integer(IntegerType),
    Structure(StructureType),
    Enumeration(EnumerationType),
    Variant(VariantType),
    Array(ArrayType),
    Sequence(SequenceType),
    Root(RootType),
}

impl TypeKind {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            TypeKind::Integer(_) => "integer",
            TypeKind::Structure(_) => "structure",
            TypeKind::Enumeration(_) => "enumeration",
            TypeKind::Variant(_) => "variant",
            TypeKind::Array(_) => "array",
            TypeKind::Sequence(_) => "sequence",
            TypeKind::Root(_) => "root",
        }
    }
}

/// A finalized integer type. All geometry is in bits.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct IntegerType {
    pub size: u64,
    pub align: u64,
    pub signed: bool,
    pub byte_order: ByteOrder,
    pub base: DisplayBase,
    pub encoding: Encoding,
}

/// Under-construction integer parameters; [`finalize`](Self::finalize)
/// applies defaults and validates the geometry.
#[derive(Clone, Default, Debug)]
pub(crate) struct IntegerDraft {
    pub size: Option<u64>,
    pub align: Option<u64>,
    pub signed: Option<bool>,
    pub byte_order: Option<ByteOrder>,
    pub base: Option<DisplayBase>,
    pub encoding: Option<Encoding>,
}

impl IntegerDraft {
    pub fn set_size(&mut self, size: i64) -> Result<(), Error> {
        if size <= 0 {
            return Err(Error::InvalidIntegerSize(size));
        }
        self.size = Some(size as u64);
        Ok(())
    }

    pub fn set_align(&mut self, align: i64) -> Result<(), Error> {
        if align <= 0 || !(align as u64).is_power_of_two() {
            return Err(Error::InvalidIntegerAlignment(align));
        }
        self.align = Some(align as u64);
        Ok(())
    }

    pub fn finalize(self) -> Result<IntegerType, Error> {
        let encoding = self.encoding.unwrap_or_default();
        if encoding != Encoding::None {
            return Err(Error::UnsupportedEncoding);
        }
        let size = self.size.ok_or(Error::InvalidIntegerSize(0))?;
        let align = self.align.unwrap_or(if size < 8 { 1 } else { 8 });
        if size > 8 && size % 8 != 0 {
            // Multi-byte sizes must be whole bytes.
            return Err(Error::UnsupportedIntegerGeometry { size, align });
        }
        if size < 8 && align < size {
            // A sub-byte integer must not cross a byte boundary.
            return Err(Error::UnsupportedIntegerGeometry { size, align });
        }
        if size >= 8 && align < 8 {
            // A byte-sized integer on sub-byte alignment could start
            // mid-byte, which is the same unsupported crossing.
            return Err(Error::UnsupportedIntegerGeometry { size, align });
        }
        let byte_order = self.byte_order.ok_or(Error::NativeByteOrder)?;
        Ok(IntegerType {
            size,
            align,
            signed: self.signed.unwrap_or(false),
            byte_order,
            base: self.base.unwrap_or_default(),
            encoding,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StructureType {
    pub fields: Vec<(Intern<String>, TypeId)>,
    /// Max alignment over the fields; 1 for an empty structure.
    pub align: u64,
}

impl StructureType {
    pub fn new() -> Self {
        StructureType {
            fields: Vec::new(),
            align: 1,
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.as_str() == name)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct EnumRange {
    pub start: i64,
    pub end: i64,
    /// Index into the label table.
    pub label: u32,
}

/// A finalized enumeration: a backing integer plus an ordered map from
/// inclusive value ranges to labels. Label index 0 is the synthetic ""
/// meaning "no match".
#[derive(Clone, Debug)]
pub(crate) struct EnumerationType {
    pub base: TypeId,
    pub labels: Vec<Intern<String>>,
    /// Sorted by `start`, non-overlapping.
    pub ranges: Vec<EnumRange>,
}

impl EnumerationType {
    /// O(log N) range lookup; 0 denotes "unmatched".
    pub fn lookup(&self, value: i64) -> u32 {
        match self.ranges.binary_search_by(|r| {
            if value < r.start {
                std::cmp::Ordering::Greater
            } else if value > r.end {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Equal
            }
        }) {
            Ok(i) => self.ranges[i].label,
            Err(_) => 0,
        }
    }

    pub fn label(&self, index: u32) -> Option<Intern<String>> {
        // Index 0 is the no-match label and is reported as absent.
        if index == 0 {
            None
        } else {
            self.labels.get(index as usize).copied()
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct EnumerationDraft {
    pub base: TypeId,
    pub labels: Vec<Intern<String>>,
    pub ranges: Vec<EnumRange>,
}

impl EnumerationDraft {
    pub fn new(base: TypeId) -> Self {
        EnumerationDraft {
            base,
            labels: vec![Intern::from_ref("")],
            ranges: Vec::new(),
        }
    }

    pub fn add_value(&mut self, label: &str, start: i64, end: i64) {
        let index = self.labels.len() as u32;
        self.labels.push(Intern::from_ref(label));
        self.ranges.push(EnumRange { start, end, label: index });
    }

    pub fn finalize(mut self) -> Result<EnumerationType, Error> {
        self.ranges.sort_by_key(|r| r.start);
        for (a, b) in self.ranges.iter().tuple_windows() {
            if b.start <= a.end {
                return Err(Error::EnumRangeOverlap(a.start, a.end, b.start, b.end));
            }
        }
        Ok(EnumerationType {
            base: self.base,
            labels: self.labels,
            ranges: self.ranges,
        })
    }
}

#[derive(Clone, Debug)]
pub(crate) struct VariantType {
    pub options: Vec<(Intern<String>, TypeId)>,
    /// `None` while untagged; untagged variants cannot instantiate.
    pub tag: Option<Tag>,
}

impl VariantType {
    pub fn new() -> Self {
        VariantType {
            options: Vec::new(),
            tag: None,
        }
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.iter().any(|(n, _)| n.as_str() == name)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct ArrayType {
    pub len: u64,
    pub elem: TypeId,
}

#[derive(Clone, Debug)]
pub(crate) struct SequenceType {
    pub len_tag: Tag,
    pub elem: TypeId,
}

/// The root type holds the six dynamic-scope slots.
#[derive(Clone, Default, Debug)]
pub(crate) struct RootType {
    pub slots: [Option<TypeId>; 6],
}

/// Append-only arena of type nodes.
#[derive(Clone, Debug)]
pub(crate) struct TypeArena {
    nodes: Vec<TypeNode>,
}

/// The root type is always the first node.
pub(crate) const ROOT_TYPE: TypeId = TypeId(0);

impl TypeArena {
    pub fn new() -> Self {
        TypeArena {
            nodes: vec![TypeNode {
                name: None,
                kind: TypeKind::Root(RootType::default()),
            }],
        }
    }

    pub fn alloc(&mut self, name: Option<Intern<String>>, kind: TypeKind) -> TypeId {
        let id = TypeId(self.nodes.len() as u32);
        self.nodes.push(TypeNode { name, kind });
        id
    }

    pub fn node(&self, id: TypeId) -> &TypeNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: TypeId) -> &mut TypeNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.node(id).kind
    }

    pub fn type_name(&self, id: TypeId) -> &str {
        self.node(id).name.as_ref().map(|n| n.as_str()).unwrap_or("<unnamed>")
    }

    pub fn integer(&self, id: TypeId) -> Option<&IntegerType> {
        match self.kind(id) {
            TypeKind::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// The integer payload behind an integer or enumeration type.
    pub fn backing_integer(&self, id: TypeId) -> Option<&IntegerType> {
        match self.kind(id) {
            TypeKind::Integer(i) => Some(i),
            TypeKind::Enumeration(e) => self.integer(e.base),
            _ => None,
        }
    }

    pub fn enumeration(&self, id: TypeId) -> Option<&EnumerationType> {
        match self.kind(id) {
            TypeKind::Enumeration(e) => Some(e),
            _ => None,
        }
    }

    pub fn root_mut(&mut self) -> &mut RootType {
        match &mut self.node_mut(ROOT_TYPE).kind {
            TypeKind::Root(r) => r,
            _ => unreachable!("node 0 is always the root type"),
        }
    }

    /// The largest alignment among the type and its transitive subtypes.
    ///
    /// Container alignment always dominates content alignment, which lets
    /// nested layout assume `container.align >= element.align`.
    pub fn max_alignment(&self, id: TypeId) -> u64 {
        match self.kind(id) {
            TypeKind::Integer(i) => i.align,
            TypeKind::Structure(s) => s.align,
            TypeKind::Enumeration(e) => self.max_alignment(e.base),
            TypeKind::Variant(v) => v
                .options
                .iter()
                .map(|(_, t)| self.max_alignment(*t))
                .max()
                .unwrap_or(1),
            TypeKind::Array(a) => self.max_alignment(a.elem),
            TypeKind::Sequence(s) => self.max_alignment(s.elem),
            TypeKind::Root(_) => 1,
        }
    }

    /// Produce the next tag component for `input`, cooperatively: the
    /// caller repeats against the component's type and the remainder.
    pub fn resolve_tag_component<'s>(
        &self,
        id: TypeId,
        input: &'s str,
    ) -> Result<Option<(TagComponent, &'s str)>, Error> {
        match self.kind(id) {
            TypeKind::Structure(s) => {
                for (name, ty) in &s.fields {
                    if let Some(rest) = tag::match_component(name.as_str(), input) {
                        return Ok(Some((TagComponent::Named(*name, *ty), rest)));
                    }
                }
                Ok(None)
            }
            TypeKind::Variant(v) => {
                for (name, ty) in &v.options {
                    if let Some(rest) = tag::match_component(name.as_str(), input) {
                        return Ok(Some((TagComponent::Named(*name, *ty), rest)));
                    }
                }
                Ok(None)
            }
            TypeKind::Array(a) => match tag::parse_index(input) {
                Some((index, rest)) => {
                    if u64::from(index) >= a.len {
                        return Err(Error::TagIndexOutOfRange { index, len: a.len });
                    }
                    Ok(Some((TagComponent::Indexed(index, a.elem), rest)))
                }
                None => Ok(None),
            },
            TypeKind::Sequence(s) => match tag::parse_index(input) {
                // Sequence length is a runtime quantity; any index resolves.
                Some((index, rest)) => Ok(Some((TagComponent::Indexed(index, s.elem), rest))),
                None => Ok(None),
            },
            TypeKind::Root(r) => {
                for scope in DynScope::ALL {
                    let Some(assigned) = r.slots[scope.index()] else {
                        continue;
                    };
                    if let Some(rest) = tag::match_component(scope.full_name(), input) {
                        return Ok(Some((
                            TagComponent::Named(Intern::from_ref(scope.full_name()), assigned),
                            rest,
                        )));
                    }
                }
                Ok(None)
            }
            TypeKind::Integer(_) | TypeKind::Enumeration(_) => Ok(None),
        }
    }

    /// Deep clone for typedefs: the node payload is copied (embedded tags
    /// included), member references stay shared.
    pub fn clone_deep(&mut self, id: TypeId, name: Option<Intern<String>>) -> TypeId {
        let kind = self.kind(id).clone();
        self.alloc(name, kind)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn draft(size: u64, order: Option<ByteOrder>) -> IntegerDraft {
        IntegerDraft {
            size: Some(size),
            byte_order: order,
            ..Default::default()
        }
    }

    #[test]
    fn integer_defaults() {
        let it = draft(32, Some(ByteOrder::Little)).finalize().unwrap();
        assert_eq!(it.align, 8);
        assert_eq!(it.signed, false);
        assert_eq!(it.base, DisplayBase::Decimal);
        assert_eq!(it.encoding, Encoding::None);

        let it = draft(3, Some(ByteOrder::Little)).finalize().unwrap();
        assert_eq!(it.align, 1);
    }

    #[test]
    fn integer_rejects_unsupported_geometry() {
        // Multi-byte sizes must be whole bytes.
        assert!(matches!(
            draft(12, Some(ByteOrder::Big)).finalize(),
            Err(Error::UnsupportedIntegerGeometry { .. })
        ));
        // Sub-byte integers must not cross a byte boundary.
        let mut d = draft(5, Some(ByteOrder::Little));
        d.set_align(2).unwrap();
        assert!(matches!(
            d.finalize(),
            Err(Error::UnsupportedIntegerGeometry { .. })
        ));
        // Byte order is mandatory (native order unsupported).
        assert!(matches!(draft(8, None).finalize(), Err(Error::NativeByteOrder)));
    }

    #[test]
    fn integer_rejects_bad_parameters() {
        let mut d = IntegerDraft::default();
        assert!(matches!(d.set_size(0), Err(Error::InvalidIntegerSize(0))));
        assert!(matches!(d.set_align(3), Err(Error::InvalidIntegerAlignment(3))));
        assert!(matches!(d.set_align(-8), Err(Error::InvalidIntegerAlignment(-8))));
    }

    #[test]
    fn enum_range_lookup() {
        let mut d = EnumerationDraft::new(TypeId(1));
        d.add_value("B", 10, 19);
        d.add_value("A", 1, 2);
        d.add_value("C", 42, 42);
        let e = d.finalize().unwrap();

        assert_eq!(e.label(e.lookup(1)).map(|l| l.as_str().to_owned()), Some("A".to_owned()));
        assert_eq!(e.label(e.lookup(15)).map(|l| l.as_str().to_owned()), Some("B".to_owned()));
        assert_eq!(e.label(e.lookup(42)).map(|l| l.as_str().to_owned()), Some("C".to_owned()));
        assert_eq!(e.lookup(3), 0);
        assert_eq!(e.label(0), None);
    }

    #[test]
    fn enum_overlap_rejected() {
        let mut d = EnumerationDraft::new(TypeId(1));
        d.add_value("A", 0, 10);
        d.add_value("B", 5, 6);
        assert!(matches!(d.finalize(), Err(Error::EnumRangeOverlap(..))));
    }

    #[test]
    fn dyn_scope_names_round_trip() {
        for scope in DynScope::ALL {
            assert_eq!(DynScope::from_full_name(scope.full_name()), Some(scope));
        }
        assert_eq!(DynScope::from_full_name("stream.packet"), None);
    }
}
