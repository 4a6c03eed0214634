use crate::{
    context::Context,
    error::{Error, SourceError},
    meta::Meta,
    types::{ByteOrder, IntegerType},
    vars::{layout, VarId, VarImpl},
};
use byteordered::{
    byteorder::{BigEndian, LittleEndian, NativeEndian, ReadBytesExt, WriteBytesExt},
    ByteOrdered,
};
use internment::Intern;
use std::io::Cursor;

/// Integer access plan, fixed at instantiation so the hot path performs
/// no geometry decisions.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum IntAccess {
    /// Sub-byte integer; `size <= align < 8` guarantees it never crosses
    /// a byte boundary, so one masked shift reads it.
    Bits { size: u8, signed: bool },
    /// Whole-byte integer of 1..=N bytes.
    Bytes {
        size_bytes: u32,
        order: ByteOrder,
        signed: bool,
    },
}

fn sign_extend(value: u64, bits: u32) -> u64 {
    let mask = 1u64 << (bits - 1);
    (value ^ mask).wrapping_sub(mask)
}

fn short_map(requested: u64, bytes: &[u8]) -> Error {
    Error::Source(SourceError::Truncated {
        requested,
        available: bytes.len() as u64 * 8,
    })
}

fn read_failed(e: std::io::Error) -> Error {
    SourceError::Failed(e.to_string()).into()
}

/// Decode a whole-byte integer from its exact byte slice, dispatching on
/// the wire byte order at runtime.
fn read_whole(src: &[u8], order: ByteOrder) -> Result<u64, Error> {
    let mut reader = ByteOrdered::runtime(Cursor::new(src), order.into());
    match src.len() {
        1 => Ok(u64::from(reader.read_u8().map_err(read_failed)?)),
        2 => Ok(u64::from(reader.read_u16().map_err(read_failed)?)),
        4 => Ok(u64::from(reader.read_u32().map_err(read_failed)?)),
        8 => reader.read_u64().map_err(read_failed),
        // Whole-byte widths without a fixed-width accessor (24-bit, ...).
        n if n <= 8 => {
            let mut cursor = Cursor::new(src);
            match order {
                ByteOrder::Little => cursor.read_uint::<LittleEndian>(n),
                ByteOrder::Big => cursor.read_uint::<BigEndian>(n),
            }
            .map_err(read_failed)
        }
        _ => Err(Error::WrongKind("64-bit integer")),
    }
}

impl IntAccess {
    pub fn new(it: &IntegerType) -> IntAccess {
        if it.size < 8 {
            IntAccess::Bits {
                size: it.size as u8,
                signed: it.signed,
            }
        } else {
            IntAccess::Bytes {
                size_bytes: (it.size / 8) as u32,
                order: it.byte_order,
                signed: it.signed,
            }
        }
    }

    /// Decode at bit position `bit_off` of the mapping into a 64-bit
    /// two's-complement value (sign-extended for signed types).
    /// Only valid for sizes of at most 64 bits.
    pub fn decode_u64(&self, bytes: &[u8], bit_off: u64) -> Result<u64, Error> {
        match *self {
            IntAccess::Bits { size, signed } => {
                let byte = *bytes
                    .get((bit_off / 8) as usize)
                    .ok_or_else(|| short_map(bit_off + u64::from(size), bytes))?;
                let value = (u64::from(byte) >> (bit_off % 8)) & ((1u64 << size) - 1);
                Ok(if signed {
                    sign_extend(value, u32::from(size))
                } else {
                    value
                })
            }
            IntAccess::Bytes {
                size_bytes,
                order,
                signed,
            } => {
                if bit_off % 8 != 0 {
                    return Err(SourceError::Failed(format!(
                        "byte-sized integer mapped at bit offset {bit_off}"
                    ))
                    .into());
                }
                let idx = (bit_off / 8) as usize;
                let src = bytes
                    .get(idx..idx + size_bytes as usize)
                    .ok_or_else(|| short_map(bit_off + u64::from(size_bytes) * 8, bytes))?;
                let value = read_whole(src, order)?;
                Ok(if signed && size_bytes < 8 {
                    sign_extend(value, size_bytes * 8)
                } else {
                    value
                })
            }
        }
    }

    /// Copy into `dst` with native byte order. Works for any size,
    /// including integers wider than 64 bits.
    pub fn copy_native(&self, bytes: &[u8], bit_off: u64, dst: &mut [u8]) -> Result<(), Error> {
        match *self {
            IntAccess::Bits { .. } => {
                let value = self.decode_u64(bytes, bit_off)?;
                dst[0] = value as u8;
                Ok(())
            }
            IntAccess::Bytes {
                size_bytes, order, ..
            } => {
                if bit_off % 8 != 0 {
                    return Err(SourceError::Failed(format!(
                        "byte-sized integer mapped at bit offset {bit_off}"
                    ))
                    .into());
                }
                let idx = (bit_off / 8) as usize;
                let src = bytes
                    .get(idx..idx + size_bytes as usize)
                    .ok_or_else(|| short_map(bit_off + u64::from(size_bytes) * 8, bytes))?;
                let n = src.len();
                if size_bytes <= 8 {
                    let value = read_whole(src, order)?;
                    let mut out = &mut dst[..n];
                    out.write_uint::<NativeEndian>(value, n).map_err(read_failed)?;
                } else if order.is_native() {
                    dst[..n].copy_from_slice(src);
                } else {
                    // Wider than any byteorder accessor; reverse by hand.
                    for (d, s) in dst[..n].iter_mut().zip(src.iter().rev()) {
                        *d = *s;
                    }
                }
                Ok(())
            }
        }
    }
}

fn int_parts<'m>(meta: &'m Meta, id: VarId) -> Result<(&'m IntAccess, IntegerType), Error> {
    let VarImpl::Int(iv) = &meta.node(id).imp else {
        return Err(Error::WrongKind("integer"));
    };
    let it = meta
        .types
        .backing_integer(meta.type_of(id))
        .copied()
        .ok_or(Error::WrongKind("integer"))?;
    Ok((&iv.access, it))
}

/// Adjust the context, make sure the variable's bytes are mapped, and
/// return its start offset within the mapping.
fn prepare<'a, 'm, 'p>(
    meta: &Meta,
    id: VarId,
    ctx: &'a Context<'m, 'p>,
) -> Result<(&'a Context<'m, 'p>, u64), Error> {
    let ctx = ctx.context_for(meta, id).ok_or(Error::InsufficientContext)?;
    let end = layout::end_offset(meta, id, Some(ctx)).ok_or(Error::InsufficientContext)?;
    ctx.extend(end)?;
    let start = layout::start_offset(meta, id, Some(ctx)).ok_or(Error::InsufficientContext)?;
    Ok((ctx, start))
}

/// Read the raw 64-bit two's-complement value of an integer or
/// enumeration variable.
fn raw_read(meta: &Meta, id: VarId, ctx: &Context<'_, '_>) -> Result<u64, Error> {
    let (access, it) = int_parts(meta, id)?;
    if it.size > 64 {
        return Err(Error::WrongKind("64-bit integer"));
    }
    let access = *access;
    let (ctx, start) = prepare(meta, id, ctx)?;
    ctx.with_bytes(|bytes, shift| access.decode_u64(bytes, u64::from(shift) + start))
}

/// Sign-aware value for tag evaluation and enum lookups.
pub(crate) fn read_int_value(meta: &Meta, id: VarId, ctx: &Context<'_, '_>) -> Result<i64, Error> {
    Ok(raw_read(meta, id, ctx)? as i64)
}

/// Read and range-check against a `bits`-wide signed or unsigned
/// destination. Returns the two's-complement bit pattern.
pub(crate) fn read_fit(
    meta: &Meta,
    id: VarId,
    ctx: &Context<'_, '_>,
    bits: u32,
    want_signed: bool,
) -> Result<u64, Error> {
    let (_, it) = int_parts(meta, id)?;
    if it.size > u64::from(bits) {
        return Err(Error::WrongKind(if bits == 32 {
            "32-bit integer"
        } else {
            "64-bit integer"
        }));
    }
    let raw = raw_read(meta, id, ctx)?;
    let wide: i128 = if it.signed {
        i128::from(raw as i64)
    } else {
        i128::from(raw)
    };
    let (lo, hi): (i128, i128) = if want_signed {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0, (1i128 << bits) - 1)
    };
    if wide < lo || wide > hi {
        return Err(Error::IntegerOverflow(raw));
    }
    Ok(raw)
}

/// Copy the value with native byte order and sign into `dst` (one byte
/// for sub-byte integers, `size / 8` bytes otherwise).
pub(crate) fn copy_int(
    meta: &Meta,
    id: VarId,
    ctx: &Context<'_, '_>,
    dst: &mut [u8],
) -> Result<(), Error> {
    let (access, it) = int_parts(meta, id)?;
    let required = if it.size < 8 { 1 } else { (it.size / 8) as usize };
    if dst.len() < required {
        return Err(Error::DestinationTooSmall);
    }
    let access = *access;
    let (ctx, start) = prepare(meta, id, ctx)?;
    ctx.with_bytes(|bytes, shift| access.copy_native(bytes, u64::from(shift) + start, dst))
}

/// Enumeration mapping index of the current value; 0 denotes "unmatched".
pub(crate) fn enum_index(meta: &Meta, id: VarId, ctx: &Context<'_, '_>) -> Result<u32, Error> {
    let mapping = meta
        .types
        .enumeration(meta.type_of(id))
        .ok_or(Error::WrongKind("enumeration"))?;
    let value = read_int_value(meta, id, ctx)?;
    Ok(mapping.lookup(value))
}

pub(crate) fn enum_label(
    meta: &Meta,
    id: VarId,
    ctx: &Context<'_, '_>,
) -> Result<Option<Intern<String>>, Error> {
    let mapping = meta
        .types
        .enumeration(meta.type_of(id))
        .ok_or(Error::WrongKind("enumeration"))?;
    let value = read_int_value(meta, id, ctx)?;
    Ok(mapping.label(mapping.lookup(value)))
}
