//! Descriptor-driven wire codec.
//!
//! Every wire record is described by an ordered list of [`Field`]s. A single
//! generic encoder and decoder interpret those lists, so message types only
//! declare their layout and convert to and from [`Values`].
//!
//! Encoding is two-phase: fixed-width fields are emitted in declaration order
//! with zeroed placeholders for length/offset/count holders; fields targeted
//! by an offset holder are appended after the fixed portion, and the holders
//! are back-filled once every field's position is known.
//!
//! Offsets on the wire are relative to the start of the enclosing message,
//! which is `base` bytes before the record (64 for SMB2 bodies, 0 for
//! stand-alone structures).

use bytes::{Buf, BufMut, BytesMut};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Error raised while encoding or decoding a wire record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// An offset or length points past the end of the buffer.
    OutOfBounds {
        field: &'static str,
        end: usize,
        len: usize,
    },
    /// A value is absent or has the wrong shape for its field.
    Missing(&'static str),
    /// A value does not fit its declared wire width.
    Overflow(&'static str),
    /// Well-formed bytes that are not acceptable for the field.
    Invalid(String),
    /// Unrecognized discriminant (command code, PDU type).
    Unsupported(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfBounds { field, end, len } => {
                write!(f, "field {} ends at {} past buffer of {} bytes", field, end, len)
            }
            Self::Missing(field) => write!(f, "missing value for field {}", field),
            Self::Overflow(field) => write!(f, "value too wide for field {}", field),
            Self::Invalid(msg) => write!(f, "invalid wire data: {}", msg),
            Self::Unsupported(msg) => write!(f, "unsupported: {}", msg),
        }
    }
}

impl std::error::Error for CodecError {}

/// Wire shape of one field.
#[derive(Clone, Copy)]
pub enum Kind {
    /// Little-endian unsigned integer of 1, 2, 4 or 8 bytes.
    Scalar(usize),
    /// Byte array of a fixed size.
    FixedBytes(usize),
    /// Holds the byte length of `target`.
    LengthOf { target: &'static str, width: usize },
    /// Holds the message-relative offset of `target`.
    OffsetOf { target: &'static str, width: usize },
    /// Holds the element count of the list `target`.
    CountOf { target: &'static str, width: usize },
    /// Variable-length payload, padded so that it starts on `align`.
    Bytes { align: usize },
    /// Embedded record.
    Nested(&'static [Field]),
    /// Sequence of embedded records.
    List(&'static [Field]),
    /// Opaque type that encodes itself; the function reports how many bytes
    /// an encoded value occupies.
    SelfDescribing(fn(&[u8]) -> Result<usize, CodecError>),
    /// Zero padding up to the next multiple of the given alignment.
    Align(usize),
}

impl fmt::Debug for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(w) => write!(f, "Scalar({})", w),
            Self::FixedBytes(n) => write!(f, "FixedBytes({})", n),
            Self::LengthOf { target, width } => write!(f, "LengthOf({}, {})", target, width),
            Self::OffsetOf { target, width } => write!(f, "OffsetOf({}, {})", target, width),
            Self::CountOf { target, width } => write!(f, "CountOf({}, {})", target, width),
            Self::Bytes { align } => write!(f, "Bytes(align {})", align),
            Self::Nested(s) => write!(f, "Nested({} fields)", s.len()),
            Self::List(s) => write!(f, "List({} fields)", s.len()),
            Self::SelfDescribing(_) => write!(f, "SelfDescribing"),
            Self::Align(n) => write!(f, "Align({})", n),
        }
    }
}

/// One named entry in a record schema.
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub kind: Kind,
}

pub const fn scalar(name: &'static str, width: usize) -> Field {
    Field { name, kind: Kind::Scalar(width) }
}

pub const fn fixed(name: &'static str, len: usize) -> Field {
    Field { name, kind: Kind::FixedBytes(len) }
}

pub const fn length_of(name: &'static str, target: &'static str, width: usize) -> Field {
    Field { name, kind: Kind::LengthOf { target, width } }
}

pub const fn offset_of(name: &'static str, target: &'static str, width: usize) -> Field {
    Field { name, kind: Kind::OffsetOf { target, width } }
}

pub const fn count_of(name: &'static str, target: &'static str, width: usize) -> Field {
    Field { name, kind: Kind::CountOf { target, width } }
}

pub const fn bytes(name: &'static str) -> Field {
    Field { name, kind: Kind::Bytes { align: 1 } }
}

pub const fn aligned_bytes(name: &'static str, align: usize) -> Field {
    Field { name, kind: Kind::Bytes { align } }
}

pub const fn nested(name: &'static str, schema: &'static [Field]) -> Field {
    Field { name, kind: Kind::Nested(schema) }
}

pub const fn list(name: &'static str, schema: &'static [Field]) -> Field {
    Field { name, kind: Kind::List(schema) }
}

pub const fn align(name: &'static str, to: usize) -> Field {
    Field { name, kind: Kind::Align(to) }
}

pub const fn self_describing(
    name: &'static str,
    measure: fn(&[u8]) -> Result<usize, CodecError>,
) -> Field {
    Field { name, kind: Kind::SelfDescribing(measure) }
}

// ---- Values ----

/// A decoded (or to-be-encoded) field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Uint(u64),
    Bytes(Vec<u8>),
    Record(Values),
    List(Vec<Values>),
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Uint(v as u64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<const N: usize> From<[u8; N]> for Value {
    fn from(v: [u8; N]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Values> for Value {
    fn from(v: Values) -> Self {
        Value::Record(v)
    }
}

impl From<Vec<Values>> for Value {
    fn from(v: Vec<Values>) -> Self {
        Value::List(v)
    }
}

/// Ordered name/value pairs for one record.
///
/// Unset scalar and fixed-size fields encode as zero; unset variable
/// fields encode as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values {
    entries: Vec<(&'static str, Value)>,
}

impl Values {
    pub fn new() -> Self {
        Values { entries: Vec::new() }
    }

    /// Builder-style setter.
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<Value>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn uint(&self, name: &'static str) -> Result<u64, CodecError> {
        match self.get(name) {
            Some(Value::Uint(v)) => Ok(*v),
            _ => Err(CodecError::Missing(name)),
        }
    }

    pub fn u8(&self, name: &'static str) -> Result<u8, CodecError> {
        u8::try_from(self.uint(name)?).map_err(|_| CodecError::Overflow(name))
    }

    pub fn u16(&self, name: &'static str) -> Result<u16, CodecError> {
        u16::try_from(self.uint(name)?).map_err(|_| CodecError::Overflow(name))
    }

    pub fn u32(&self, name: &'static str) -> Result<u32, CodecError> {
        u32::try_from(self.uint(name)?).map_err(|_| CodecError::Overflow(name))
    }

    pub fn u64(&self, name: &'static str) -> Result<u64, CodecError> {
        self.uint(name)
    }

    pub fn bytes(&self, name: &'static str) -> Result<&[u8], CodecError> {
        match self.get(name) {
            Some(Value::Bytes(b)) => Ok(b),
            _ => Err(CodecError::Missing(name)),
        }
    }

    /// Fixed-size byte field as an array.
    pub fn array<const N: usize>(&self, name: &'static str) -> Result<[u8; N], CodecError> {
        self.bytes(name)?
            .try_into()
            .map_err(|_| CodecError::Invalid(format!("{} is not {} bytes", name, N)))
    }

    pub fn record(&self, name: &'static str) -> Result<&Values, CodecError> {
        match self.get(name) {
            Some(Value::Record(r)) => Ok(r),
            _ => Err(CodecError::Missing(name)),
        }
    }

    pub fn list(&self, name: &'static str) -> Result<&[Values], CodecError> {
        match self.get(name) {
            Some(Value::List(l)) => Ok(l),
            _ => Err(CodecError::Missing(name)),
        }
    }

    /// Load a nested record into its typed form.
    pub fn nested<T: WireRecord>(&self, name: &'static str) -> Result<T, CodecError> {
        T::load(self.record(name)?)
    }

    /// Load every element of a list field into its typed form.
    pub fn records<T: WireRecord>(&self, name: &'static str) -> Result<Vec<T>, CodecError> {
        self.list(name)?.iter().map(T::load).collect()
    }

    pub fn enumeration<E: WireEnum>(&self, name: &'static str) -> Result<E, CodecError> {
        let raw = self.uint(name)?;
        E::from_wire(raw)
            .ok_or_else(|| CodecError::Invalid(format!("{} has unknown value {:#x}", name, raw)))
    }
}

// ---- Typed records ----

/// A Rust type with a declared wire layout.
pub trait WireRecord: Sized {
    const SCHEMA: &'static [Field];
    /// Distance from the start of the enclosing message to this record.
    const BASE: usize = 0;

    fn store(&self) -> Values;
    fn load(values: &Values) -> Result<Self, CodecError>;

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        encode(Self::SCHEMA, &self.store(), Self::BASE)
    }

    /// Decode from the front of `buf`, returning the record and the number
    /// of bytes it occupied.
    fn decode(buf: &[u8]) -> Result<(Self, usize), CodecError> {
        let (values, consumed) = decode(Self::SCHEMA, buf, Self::BASE)?;
        Ok((Self::load(&values)?, consumed))
    }
}

/// Store a list of typed records as a list value.
pub fn store_all<T: WireRecord>(items: &[T]) -> Value {
    Value::List(items.iter().map(WireRecord::store).collect())
}

/// A numeric enumeration whose wire width equals its declared width.
pub trait WireEnum: Copy + Sized {
    const WIDTH: usize;
    fn to_wire(self) -> u64;
    fn from_wire(raw: u64) -> Option<Self>;

    fn value(self) -> Value {
        Value::Uint(self.to_wire())
    }
}

/// Append an enumeration using its declared width.
pub fn put_enum<E: WireEnum>(buf: &mut BytesMut, value: E) {
    buf.put_uint_le(value.to_wire(), E::WIDTH);
}

/// Read an enumeration from the front of `buf`.
pub fn get_enum<E: WireEnum>(buf: &[u8]) -> Result<(E, usize), CodecError> {
    let raw = read_uint(buf, 0, E::WIDTH, "enum")?;
    let value = E::from_wire(raw)
        .ok_or_else(|| CodecError::Unsupported(format!("discriminant {:#x}", raw)))?;
    Ok((value, E::WIDTH))
}

/// Declare a C-like enum together with its [`WireEnum`] implementation.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $crate::codec::WireEnum for $name {
            const WIDTH: usize = ::std::mem::size_of::<$repr>();

            fn to_wire(self) -> u64 {
                match self {
                    $( Self::$variant => ($value as $repr) as u64 ),+
                }
            }

            fn from_wire(raw: u64) -> Option<Self> {
                $( if raw == ($value as $repr) as u64 { return Some(Self::$variant); } )+
                None
            }
        }
    };
}

/// A type that carries its own encoding, for layouts the field list cannot
/// express (pointer/referent containers).
pub trait SelfDescribing: Sized {
    fn encode_self(&self, buf: &mut BytesMut);
    fn decode_self(buf: &[u8]) -> Result<(Self, usize), CodecError>;

    fn measure(buf: &[u8]) -> Result<usize, CodecError> {
        Self::decode_self(buf).map(|(_, n)| n)
    }

    fn to_value(&self) -> Value {
        let mut buf = BytesMut::new();
        self.encode_self(&mut buf);
        Value::Bytes(buf.to_vec())
    }
}

// ---- Engine ----

fn read_uint(buf: &[u8], at: usize, width: usize, field: &'static str) -> Result<u64, CodecError> {
    let end = at + width;
    let mut slice = buf.get(at..end).ok_or(CodecError::OutOfBounds { field, end, len: buf.len() })?;
    Ok(slice.get_uint_le(width))
}

fn check_width(value: u64, width: usize, field: &'static str) -> Result<(), CodecError> {
    if width < 8 && value >> (width * 8) != 0 {
        return Err(CodecError::Overflow(field));
    }
    Ok(())
}

fn align_up(pos: usize, align: usize) -> usize {
    if align <= 1 {
        pos
    } else {
        pos.div_ceil(align) * align
    }
}

/// Names of fields whose position is given by an offset holder.
fn pointed(schema: &[Field]) -> HashSet<&'static str> {
    schema
        .iter()
        .filter_map(|f| match f.kind {
            Kind::OffsetOf { target, .. } => Some(target),
            _ => None,
        })
        .collect()
}

fn alignment(field: &Field) -> usize {
    match field.kind {
        Kind::Bytes { align } | Kind::Align(align) => align,
        _ => 1,
    }
}

#[derive(Clone, Copy)]
enum Holder {
    Length,
    Offset,
    Count,
}

struct Placement {
    pos: usize,
    len: usize,
    count: usize,
}

/// Encode `values` according to `schema`.
pub fn encode(schema: &[Field], values: &Values, base: usize) -> Result<Vec<u8>, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(schema, values, base, &mut buf)?;
    Ok(buf.to_vec())
}

fn encode_into(
    schema: &[Field],
    values: &Values,
    base: usize,
    buf: &mut BytesMut,
) -> Result<(), CodecError> {
    let start = buf.len();
    let deferred = pointed(schema);
    let mut holders: Vec<(usize, usize, &'static str, &'static str, Holder)> = Vec::new();
    let mut placed: HashMap<&'static str, Placement> = HashMap::new();

    for field in schema {
        let holder = match field.kind {
            Kind::LengthOf { target, width } => Some((target, width, Holder::Length)),
            Kind::OffsetOf { target, width } => Some((target, width, Holder::Offset)),
            Kind::CountOf { target, width } => Some((target, width, Holder::Count)),
            _ => None,
        };
        if let Some((target, width, what)) = holder {
            holders.push((buf.len(), width, field.name, target, what));
            buf.put_bytes(0, width);
        } else if !deferred.contains(field.name) {
            let placement = emit(field, values, base, start, buf)?;
            placed.insert(field.name, placement);
        }
    }

    for field in schema.iter().filter(|f| deferred.contains(f.name)) {
        let placement = emit(field, values, base, start, buf)?;
        placed.insert(field.name, placement);
    }

    for (at, width, name, target, what) in holders {
        let placement = placed.get(target).ok_or(CodecError::Missing(target))?;
        let value = match what {
            Holder::Length => placement.len,
            Holder::Count => placement.count,
            // An empty payload is reported with a zero offset.
            Holder::Offset if placement.len == 0 => 0,
            Holder::Offset => base + placement.pos,
        } as u64;
        check_width(value, width, name)?;
        let mut slot = &mut buf[at..at + width];
        slot.put_uint_le(value, width);
    }
    Ok(())
}

/// Render one field and append it, honouring its alignment.
fn emit(
    field: &Field,
    values: &Values,
    base: usize,
    start: usize,
    buf: &mut BytesMut,
) -> Result<Placement, CodecError> {
    let rel = buf.len() - start;
    let padded = align_up(base + rel, alignment(field)) - base;
    if let Kind::Align(_) = field.kind {
        buf.put_bytes(0, padded - rel);
        return Ok(Placement { pos: rel, len: padded - rel, count: 0 });
    }
    let (rendered, count) = render(field, values.get(field.name), base + padded)?;
    if rendered.is_empty() {
        return Ok(Placement { pos: rel, len: 0, count });
    }
    buf.put_bytes(0, padded - rel);
    buf.put_slice(&rendered);
    Ok(Placement { pos: padded, len: rendered.len(), count })
}

fn render(field: &Field, value: Option<&Value>, base: usize) -> Result<(Vec<u8>, usize), CodecError> {
    let name = field.name;
    match (field.kind, value) {
        (Kind::Scalar(width), None) => Ok((vec![0; width], 0)),
        (Kind::Scalar(width), Some(Value::Uint(v))) => {
            check_width(*v, width, name)?;
            let mut out = Vec::with_capacity(width);
            out.put_uint_le(*v, width);
            Ok((out, 0))
        }
        (Kind::FixedBytes(n), None) => Ok((vec![0; n], 0)),
        (Kind::FixedBytes(n), Some(Value::Bytes(b))) => {
            if b.len() != n {
                return Err(CodecError::Invalid(format!("{} must be {} bytes, got {}", name, n, b.len())));
            }
            Ok((b.clone(), 0))
        }
        (Kind::Bytes { .. } | Kind::SelfDescribing(_), None) => Ok((Vec::new(), 0)),
        (Kind::Bytes { .. } | Kind::SelfDescribing(_), Some(Value::Bytes(b))) => Ok((b.clone(), 0)),
        (Kind::Nested(schema), Some(Value::Record(r))) => {
            let mut out = BytesMut::new();
            encode_into(schema, r, base, &mut out)?;
            Ok((out.to_vec(), 1))
        }
        (Kind::List(_), None) => Ok((Vec::new(), 0)),
        (Kind::List(schema), Some(Value::List(items))) => {
            let mut out = BytesMut::new();
            for item in items {
                let at = base + out.len();
                encode_into(schema, item, at, &mut out)?;
            }
            Ok((out.to_vec(), items.len()))
        }
        _ => Err(CodecError::Missing(name)),
    }
}

/// Decode a record from the front of `buf`, returning its values and the
/// number of bytes it occupied (including any pointed-to payloads).
pub fn decode(schema: &[Field], buf: &[u8], base: usize) -> Result<(Values, usize), CodecError> {
    let deferred = pointed(schema);
    let mut values = Values::new();
    let mut lengths: HashMap<&'static str, usize> = HashMap::new();
    let mut offsets: HashMap<&'static str, usize> = HashMap::new();
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut cursor = 0;

    for field in schema {
        match field.kind {
            Kind::LengthOf { target, width }
            | Kind::OffsetOf { target, width }
            | Kind::CountOf { target, width } => {
                let raw = read_uint(buf, cursor, width, field.name)?;
                cursor += width;
                let table = match field.kind {
                    Kind::LengthOf { .. } => &mut lengths,
                    Kind::OffsetOf { .. } => &mut offsets,
                    _ => &mut counts,
                };
                table.insert(target, raw as usize);
                values.set(field.name, raw);
            }
            _ if deferred.contains(field.name) => {}
            _ => {
                let len = lengths.get(field.name).copied();
                let count = counts.get(field.name).copied();
                if cursor < buf.len() {
                    cursor = align_up(base + cursor, alignment(field)) - base;
                }
                let window = buf.get(cursor..).unwrap_or(&[]);
                let (value, used) = take(field, window, base + cursor, len, count)?;
                cursor += used;
                values.set(field.name, value);
            }
        }
    }

    let mut consumed = cursor;
    for field in schema.iter().filter(|f| deferred.contains(f.name)) {
        let len = lengths.get(field.name).copied();
        let count = counts.get(field.name).copied();
        if len == Some(0) || (len.is_none() && count == Some(0)) {
            values.set(field.name, empty(field));
            continue;
        }
        let offset = offsets.get(field.name).copied().unwrap_or(0);
        let rel = offset
            .checked_sub(base)
            .filter(|rel| *rel <= buf.len())
            .ok_or(CodecError::OutOfBounds { field: field.name, end: offset, len: buf.len() + base })?;
        let window = match len {
            Some(l) => buf.get(rel..rel + l).ok_or(CodecError::OutOfBounds {
                field: field.name,
                end: rel + l,
                len: buf.len(),
            })?,
            None => &buf[rel..],
        };
        let (value, used) = take(field, window, offset, len, count)?;
        consumed = consumed.max(rel + used);
        values.set(field.name, value);
    }

    Ok((values, consumed))
}

fn empty(field: &Field) -> Value {
    match field.kind {
        Kind::List(_) => Value::List(Vec::new()),
        _ => Value::Bytes(Vec::new()),
    }
}

fn head<'a>(window: &'a [u8], n: usize, field: &'static str) -> Result<&'a [u8], CodecError> {
    window.get(..n).ok_or(CodecError::OutOfBounds { field, end: n, len: window.len() })
}

/// Slice one field out of `window`, which starts at the field.
fn take(
    field: &Field,
    window: &[u8],
    base: usize,
    len: Option<usize>,
    count: Option<usize>,
) -> Result<(Value, usize), CodecError> {
    let name = field.name;
    let need = |n: usize| head(window, n, name);
    match field.kind {
        Kind::Scalar(width) => Ok((Value::Uint(read_uint(window, 0, width, name)?), width)),
        Kind::FixedBytes(n) => Ok((Value::Bytes(need(n)?.to_vec()), n)),
        Kind::Bytes { .. } => {
            let n = len.unwrap_or(window.len());
            Ok((Value::Bytes(need(n)?.to_vec()), n))
        }
        Kind::SelfDescribing(measure) => {
            let n = match len {
                Some(n) => n,
                None => measure(window)?,
            };
            Ok((Value::Bytes(need(n)?.to_vec()), n))
        }
        Kind::Nested(schema) => {
            let scope = match len {
                Some(n) => need(n)?,
                None => window,
            };
            let (record, used) = decode(schema, scope, base)?;
            Ok((Value::Record(record), len.unwrap_or(used)))
        }
        Kind::List(schema) => {
            let limit = match len {
                Some(n) => need(n)?.len(),
                None => window.len(),
            };
            let mut items = Vec::new();
            let mut pos = 0;
            loop {
                let done = match count {
                    Some(c) => items.len() == c,
                    None => pos >= limit,
                };
                if done {
                    break;
                }
                let (item, used) = decode(schema, &window[pos..limit.max(pos)], base + pos)?;
                if used == 0 {
                    return Err(CodecError::Invalid(format!("{} element occupies no bytes", name)));
                }
                items.push(item);
                pos += used;
            }
            Ok((Value::List(items), len.unwrap_or(pos)))
        }
        Kind::Align(_) => Ok((Value::Bytes(Vec::new()), 0)),
        Kind::LengthOf { .. } | Kind::OffsetOf { .. } | Kind::CountOf { .. } => {
            Err(CodecError::Invalid(format!("{} is a holder field", name)))
        }
    }
}
