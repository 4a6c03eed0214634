use crate::{
    error::{Error, SourceError},
    meta::Meta,
    vars::{layout, Var, VarId, VarImpl},
};
use std::cell::{Cell, RefCell};
use tracing::{trace, warn};

/// The mapping a [`ByteSource`] currently provides.
#[derive(Copy, Clone, Debug)]
pub struct SourceMap<'a> {
    pub bytes: &'a [u8],
    /// Bit shift of the mapping start within `bytes[0]` (0..=7).
    pub start_shift: u8,
    /// Mapped size in bits.
    pub bit_len: u64,
}

/// Backing memory provider for a top-level context.
///
/// `extend_map(min_bits)` must return a mapping of at least `min_bits`
/// bits or fail; `extend_map(0)` queries the current mapping without
/// growing it. Mappings grow monotonically: a successful return must
/// remain valid until the next call.
pub trait ByteSource {
    fn extend_map(&mut self, min_bits: u64) -> Result<SourceMap<'_>, SourceError>;
}

/// The standard adapter: a fully mapped byte slice, optionally starting
/// at a bit shift inside its first byte.
#[derive(Clone, Debug)]
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    start_shift: u8,
}

impl<'a> SliceSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_shift(bytes, 0)
    }

    pub fn with_shift(bytes: &'a [u8], start_shift: u8) -> Self {
        debug_assert!(start_shift < 8);
        SliceSource { bytes, start_shift }
    }

    fn bit_len(&self) -> u64 {
        (self.bytes.len() as u64 * 8).saturating_sub(u64::from(self.start_shift))
    }
}

impl ByteSource for SliceSource<'_> {
    fn extend_map(&mut self, min_bits: u64) -> Result<SourceMap<'_>, SourceError> {
        let bit_len = self.bit_len();
        if min_bits > bit_len {
            return Err(SourceError::Truncated {
                requested: min_bits,
                available: bit_len,
            });
        }
        Ok(SourceMap {
            bytes: self.bytes,
            start_shift: self.start_shift,
            bit_len,
        })
    }
}

enum Backing<'m> {
    Top(RefCell<Box<dyn ByteSource + 'm>>),
    Element(ElementCursor),
}

/// Positioning state of an array/sequence element context.
///
/// Constant-stride cursors jump in O(1); walking cursors advance
/// element-by-element, restarting from element 0 for backward jumps.
struct ElementCursor {
    elem: VarId,
    n: u64,
    mode: CursorMode,
    /// Start offset of the array inside the array context's mapping.
    base: u64,
    index: Cell<u64>,
    /// Bit offset of the current element inside the array context's
    /// mapping.
    offset: Cell<u64>,
}

#[derive(Copy, Clone, Debug)]
enum CursorMode {
    Fixed { stride: u64 },
    Walk { align: u64 },
}

/// A runtime binding of a variable subtree to a stretch of backing bytes.
///
/// Contexts chain through an immutable parent link so inner-scope reads
/// can reach tags defined in outer scopes; the cached mapping size is the
/// only mutable state and lives in a [`Cell`], which also makes contexts
/// single-threaded by construction.
pub struct Context<'m, 'p> {
    meta: &'m Meta,
    var: VarId,
    parent: Option<&'p Context<'m, 'p>>,
    backing: Backing<'m>,
    map_bits: Cell<u64>,
}

impl<'m, 'p> Context<'m, 'p> {
    /// The variable this context maps.
    pub fn variable(&self) -> Var<'m> {
        Var {
            meta: self.meta,
            id: self.var,
        }
    }

    pub fn is_top(&self) -> bool {
        matches!(self.backing, Backing::Top(_))
    }

    pub fn is_element(&self) -> bool {
        matches!(self.backing, Backing::Element(_))
    }

    /// Whether this element context points past the last element. Such a
    /// context only supports destruction and this query.
    pub fn is_end(&self) -> bool {
        match &self.backing {
            Backing::Element(cur) => cur.index.get() >= cur.n,
            Backing::Top(_) => false,
        }
    }

    /// Index of the element the context is positioned at.
    pub fn element_index(&self) -> Option<u64> {
        match &self.backing {
            Backing::Element(cur) if cur.index.get() < cur.n => Some(cur.index.get()),
            _ => None,
        }
    }

    /// Bit offset of the current element inside the array context's
    /// mapping.
    pub(crate) fn element_offset(&self) -> Option<u64> {
        match &self.backing {
            Backing::Element(cur) if cur.index.get() < cur.n => Some(cur.offset.get()),
            _ => None,
        }
    }

    /// Walk the parent chain up to the context that maps `var`'s context
    /// variable.
    pub(crate) fn context_for<'a>(
        &'a self,
        meta: &Meta,
        var: VarId,
    ) -> Option<&'a Context<'m, 'p>> {
        let target = meta.context_var(var);
        let mut current = Some(self);
        while let Some(ctx) = current {
            if ctx.var == target {
                return Some(ctx);
            }
            current = ctx.parent;
        }
        None
    }

    /// Make sure at least `bits` bits are mapped; returns the mapped
    /// size. Re-requesting a smaller mapping never changes it.
    pub(crate) fn extend(&self, bits: u64) -> Result<u64, Error> {
        if bits <= self.map_bits.get() {
            return Ok(self.map_bits.get());
        }
        match &self.backing {
            Backing::Top(source) => {
                let mut source = source.borrow_mut();
                let map = source.extend_map(bits)?;
                if map.bit_len < bits {
                    warn!(
                        requested = bits,
                        available = map.bit_len,
                        "Byte source mapped less than requested"
                    );
                    return Err(SourceError::Truncated {
                        requested: bits,
                        available: map.bit_len,
                    }
                    .into());
                }
                self.map_bits.set(map.bit_len);
                Ok(map.bit_len)
            }
            Backing::Element(cur) => {
                if cur.index.get() >= cur.n {
                    return Err(Error::EndContext);
                }
                let parent = self.parent.ok_or(Error::InsufficientContext)?;
                let offset = cur.offset.get();
                let total = parent.extend(offset + bits)?;
                let available = total.saturating_sub(offset);
                if available < bits {
                    return Err(SourceError::Truncated {
                        requested: bits,
                        available,
                    }
                    .into());
                }
                self.map_bits.set(available);
                Ok(available)
            }
        }
    }

    /// Run `f` over the mapped bytes of this context (starting at its
    /// current position) and the bit shift of that position within the
    /// first byte handed over.
    pub(crate) fn with_bytes<R>(
        &self,
        f: impl FnOnce(&[u8], u8) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut f = Some(f);
        let mut out = None;
        self.with_bytes_at(0, &mut |bytes, shift| {
            if let Some(f) = f.take() {
                out = Some(f(bytes, shift)?);
            }
            Ok(())
        })?;
        out.ok_or(Error::InsufficientContext)
    }

    fn with_bytes_at(
        &self,
        extra: u64,
        f: &mut dyn FnMut(&[u8], u8) -> Result<(), Error>,
    ) -> Result<(), Error> {
        match &self.backing {
            Backing::Top(source) => {
                let mut source = source.borrow_mut();
                let map = source.extend_map(0)?;
                let total = u64::from(map.start_shift) + extra;
                let bytes = map.bytes.get((total / 8) as usize..).unwrap_or(&[]);
                f(bytes, (total % 8) as u8)
            }
            Backing::Element(cur) => {
                if cur.index.get() >= cur.n {
                    return Err(Error::EndContext);
                }
                let parent = self.parent.ok_or(Error::InsufficientContext)?;
                parent.with_bytes_at(cur.offset.get() + extra, f)
            }
        }
    }

    /// Position an element context at element `index`. Indices past the
    /// element count turn the context into an end context.
    pub fn set_element_index(&self, index: u64) -> Result<(), Error> {
        let Backing::Element(cur) = &self.backing else {
            return Err(Error::WrongKind("element context"));
        };
        if cur.index.get() >= cur.n {
            return Err(Error::EndContext);
        }
        match cur.mode {
            CursorMode::Fixed { stride } => {
                cur.index.set(index);
                if index < cur.n {
                    cur.offset.set(cur.base + index * stride);
                }
                self.map_bits.set(0);
                Ok(())
            }
            CursorMode::Walk { align } => {
                if index >= cur.n {
                    cur.index.set(index);
                    self.map_bits.set(0);
                    return Ok(());
                }
                if index < cur.index.get() {
                    // No random access over variable-stride elements:
                    // restart from element 0 and walk forward.
                    cur.index.set(0);
                    cur.offset.set(cur.base);
                    self.map_bits.set(0);
                }
                while cur.index.get() < index {
                    self.walk_one(align)?;
                }
                Ok(())
            }
        }
    }

    /// Move an element context to the next element; the context past the
    /// last element becomes an end context.
    pub fn advance_element(&self) -> Result<(), Error> {
        let Backing::Element(cur) = &self.backing else {
            return Err(Error::WrongKind("element context"));
        };
        if cur.index.get() >= cur.n {
            return Err(Error::EndContext);
        }
        match cur.mode {
            CursorMode::Fixed { stride } => {
                let next = cur.index.get() + 1;
                cur.index.set(next);
                if next < cur.n {
                    cur.offset.set(cur.base + next * stride);
                }
                self.map_bits.set(0);
                Ok(())
            }
            CursorMode::Walk { align } => self.walk_one(align),
        }
    }

    /// Advance a walking cursor by the current element's dynamic
    /// end-offset aligned to the element alignment.
    fn walk_one(&self, align: u64) -> Result<(), Error> {
        let Backing::Element(cur) = &self.backing else {
            return Err(Error::WrongKind("element context"));
        };
        let index = cur.index.get();
        if index + 1 >= cur.n {
            cur.index.set(index + 1);
            self.map_bits.set(0);
            return Ok(());
        }
        let size =
            layout::size(self.meta, cur.elem, Some(self)).ok_or(Error::InsufficientContext)?;
        cur.offset
            .set(layout::align_up(cur.offset.get() + size, align));
        cur.index.set(index + 1);
        self.map_bits.set(0);
        Ok(())
    }
}

/// Create a context for a top-level dynamic-scope variable.
///
/// The parent context is required (and adjusted along its chain) whenever
/// a preceding dynamic scope is instantiated; the first instantiated
/// scope takes no parent.
pub(crate) fn top_context<'m, 'p>(
    meta: &'m Meta,
    var: VarId,
    source: Box<dyn ByteSource + 'm>,
    parent: Option<&'p Context<'m, 'p>>,
) -> Result<Context<'m, 'p>, Error> {
    if !meta.node(var).context.is_none() {
        return Err(Error::NotTopLevel);
    }
    let root = meta.parent_of(var).ok_or(Error::NotTopLevel)?;
    let VarImpl::Root(root_var) = &meta.node(root).imp else {
        return Err(Error::NotTopLevel);
    };
    let slot = root_var
        .scopes
        .iter()
        .position(|rel| !rel.is_none() && root.offset(*rel) == var)
        .ok_or(Error::NotTopLevel)?;
    let prev = root_var.scopes[..slot]
        .iter()
        .rev()
        .find(|rel| !rel.is_none())
        .map(|rel| root.offset(*rel));

    let parent = match prev {
        Some(prev_var) => Some(
            parent
                .and_then(|ctx| ctx.context_for(meta, prev_var))
                .ok_or(Error::ParentContextRequired)?,
        ),
        None => None,
    };

    trace!(var = %meta.full_name(var), "Created top context");
    Ok(Context {
        meta,
        var,
        parent,
        backing: Backing::Top(RefCell::new(source)),
        map_bits: Cell::new(0),
    })
}

/// Create a context positioned at element `index` for the element
/// variable `elem`, derived from the context of the array itself.
pub(crate) fn element_context<'m, 'p>(
    elem: VarId,
    array_ctx: &'p Context<'m, 'p>,
    index: u64,
) -> Result<Context<'m, 'p>, Error> {
    let meta = array_ctx.meta;
    let array = meta.parent_of(elem).ok_or(Error::WrongKind("array element"))?;
    if !matches!(
        meta.node(array).imp,
        VarImpl::Array(_) | VarImpl::Sequence(_)
    ) {
        return Err(Error::WrongKind("array element"));
    }
    let array_ctx = array_ctx
        .context_for(meta, array)
        .ok_or(Error::InsufficientContext)?;

    let n = layout::element_count(meta, array, Some(array_ctx)).ok_or(Error::InsufficientContext)?;
    let base = layout::start_offset(meta, array, Some(array_ctx)).ok_or(Error::InsufficientContext)?;
    let align = layout::alignment(meta, elem, Some(array_ctx)).ok_or(Error::InsufficientContext)?;

    let mode = match layout::size(meta, elem, Some(array_ctx)) {
        Some(elem_size) => {
            // Constant stride: map the whole array up front so element
            // jumps stay O(1).
            let stride = layout::align_up(elem_size, align);
            if n > 0 {
                array_ctx.extend(base + (n - 1) * stride + elem_size)?;
            }
            CursorMode::Fixed { stride }
        }
        None => CursorMode::Walk { align },
    };

    let ctx = Context {
        meta,
        var: elem,
        parent: Some(array_ctx),
        backing: Backing::Element(ElementCursor {
            elem,
            n,
            mode,
            base,
            index: Cell::new(0),
            offset: Cell::new(base),
        }),
        map_bits: Cell::new(0),
    };
    if index >= n {
        if let Backing::Element(cur) = &ctx.backing {
            cur.index.set(index);
        }
    } else if index > 0 {
        ctx.set_element_index(index)?;
    }
    Ok(ctx)
}
