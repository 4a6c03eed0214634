use thiserror::Error;

/// Errors reported while building metadata or reading trace data.
///
/// Builder-side (semantic) errors are always terminal for the builder
/// invocation. Read-path errors never poison a context: the context stays
/// usable and the caller may extend it and retry.
#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum Error {
    #[error("Type name '{0}' is already defined in the current scope")]
    DuplicateTypeName(String),

    #[error("Field '{0}' is already defined")]
    DuplicateField(String),

    #[error("No committed type named '{0}' is visible from the current scope")]
    UndefinedType(String),

    #[error("Builder event out of order: {0}")]
    BuilderState(&'static str),

    #[error("Integer size must be positive, got {0}")]
    InvalidIntegerSize(i64),

    #[error("Integer alignment must be a positive power of two, got {0}")]
    InvalidIntegerAlignment(i64),

    #[error("Integer geometry is unsupported (size {size}, alignment {align})")]
    UnsupportedIntegerGeometry { size: u64, align: u64 },

    #[error("Native byte order is not supported")]
    NativeByteOrder,

    #[error("Encodings other than 'none' are not supported")]
    UnsupportedEncoding,

    #[error("Enumeration base must be an integer type no wider than 64 bits")]
    EnumBaseUnsupported,

    #[error("Enumeration ranges [{0}, {1}] and [{2}, {3}] overlap")]
    EnumRangeOverlap(i64, i64, i64, i64),

    #[error("Tag '{0}' cannot be resolved")]
    UnresolvedTag(String),

    #[error("Tag '{tag}' only resolves up to '{rest}'")]
    PartialTag { tag: String, rest: String },

    #[error("Tag target is not of the required kind ({0})")]
    TagTargetKind(&'static str),

    #[error("Tag on '{0}' refers to a variable after its user in dynamic-scope order")]
    ForwardTag(String),

    #[error("Tag on '{0}' has no base variable among the ancestors of its user")]
    TagBaseUnreachable(String),

    #[error("Variant '{0}' already has a tag")]
    TagAlreadySet(String),

    #[error("Variant '{0}' has no tag and cannot be instantiated")]
    UntaggedVariant(String),

    #[error("Tag index {index} is out of range for array of {len} elements")]
    TagIndexOutOfRange { index: u32, len: u64 },

    #[error("Unknown dynamic scope position '{0}'")]
    UnknownDynamicScope(String),

    #[error("'{0}' is not a valid top-level scope name")]
    UnknownTopScope(String),

    #[error("Metadata cannot be instantiated while a type or scope is still open")]
    OpenConstruction,

    #[error("The given variable is not a direct child of the trace root")]
    NotTopLevel,

    #[error("The parent context is insufficient to derive the requested context")]
    ParentContextRequired,

    #[error("The context is insufficient to perform the requested read")]
    InsufficientContext,

    #[error("Value {0:#x} does not fit the requested integer width")]
    IntegerOverflow(u64),

    #[error("Destination buffer is too small for the value")]
    DestinationTooSmall,

    #[error("The variable has no {0} interpretation")]
    WrongKind(&'static str),

    #[error("The element context is past the last element")]
    EndContext,

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Failure reported by a [`ByteSource`](crate::ByteSource) when a mapping
/// cannot be established or extended.
#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum SourceError {
    #[error("Byte source has only {available} bits mapped, {requested} were requested")]
    Truncated { requested: u64, available: u64 },

    #[error("Byte source failed: {0}")]
    Failed(String),
}
