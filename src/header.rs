//! Object headers and their messages. A `DataObjectHeader` drives the
//! message walk (v1 and v2 wire formats, continuations included); the
//! message bodies themselves are parsed by nom functions over the exact
//! payload slice, so a message that reads less than its declared size
//! never desynchronizes the walk.

use std::collections::VecDeque;

use nom::bytes::streaming::take;
use nom::combinator::rest;
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u24, le_u32, le_u64, le_u8};

use crate::error::Error;
use crate::parse::{address, Input, PResult};
use crate::reader::{is_defined, CharacterSet, Reader};
use crate::{Hdf5Dtype, Value};

type Result<T> = std::result::Result<T, Error>;

/// A reference into the global heap: the collection's absolute address
/// plus the object index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalHeapId {
    pub collection_address: u64,
    pub index: u32,
}

/// Resolves global-heap references during the second decode pass.
pub trait HeapAccess {
    fn heap_object(&self, id: GlobalHeapId) -> Result<Option<Vec<u8>>>;
}

fn pad8(n: usize) -> usize {
    if n % 8 == 0 {
        n
    } else {
        n + (8 - n % 8)
    }
}

/// A plain little-endian unsigned field of runtime width, without the
/// undefined-address normalization of `parse::address`.
fn uint<'a>(width: u8) -> impl Fn(Input<'a>) -> PResult<'a, u64> {
    move |input| {
        let (input, bytes) = take(width as usize)(input)?;
        let mut value = 0u64;
        for (i, b) in bytes.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
        }
        Ok((input, value))
    }
}

// ---------------------------------------------------------------------------
// Datatype

#[derive(Debug, Clone)]
pub enum DatatypeClass {
    FixedPoint {
        signed: bool,
        little_endian: bool,
        bit_offset: u16,
        bit_precision: u16,
    },
    FloatingPoint {
        /// Element width in bytes: 2, 4 or 8.
        width: u8,
    },
    String {
        charset: CharacterSet,
    },
    Opaque,
    Compound,
    Enumerated {
        base: Box<Datatype>,
        names: Vec<String>,
        /// Raw member values, each `base.size` bytes.
        values: Vec<Vec<u8>>,
        /// The `{FALSE,TRUE} = {0,1}` over int8 idiom.
        boolean: bool,
    },
    VariableLength {
        kind: u8,
        padding: u8,
        charset: u8,
    },
}

#[derive(Debug, Clone)]
pub struct Datatype {
    pub version: u8,
    pub class: DatatypeClass,
    pub size: u32,
    pub flags: u32,
}

pub fn datatype(input: Input<'_>) -> PResult<'_, Datatype> {
    context("datatype", |input| {
        let (input, class_and_version) = le_u8(input)?;
        let (input, flags) = le_u24(input)?;
        let (input, size) = le_u32(input)?;
        let version = class_and_version >> 4;
        let raw_class = class_and_version & 0x0F;
        if version != 1 && version != 2 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "datatype", version,
            )));
        }
        let unsupported = || {
            nom::Err::Failure(Error::UnsupportedDatatype {
                class: raw_class,
                size,
                flags,
            })
        };
        let (input, class) = match raw_class {
            0 => {
                let (input, bit_offset) = le_u16(input)?;
                let (input, bit_precision) = le_u16(input)?;
                match size {
                    1 | 2 | 4 | 8 => {}
                    _ => return Err(unsupported()),
                }
                (
                    input,
                    DatatypeClass::FixedPoint {
                        signed: flags & 0x08 != 0,
                        little_endian: flags & 0x01 == 0,
                        bit_offset,
                        bit_precision,
                    },
                )
            }
            1 => {
                // Only the three standard IEEE little-endian layouts.
                let width = match (size, flags) {
                    (2, 0x0F20) => 2,
                    (4, 0x1F20) => 4,
                    (8, 0x3F20) => 8,
                    _ => return Err(unsupported()),
                };
                let (input, _properties) = take(12usize)(input)?;
                (input, DatatypeClass::FloatingPoint { width })
            }
            3 => {
                let charset = match CharacterSet::from_code(((flags >> 8) & 0x0F) as u8) {
                    Ok(charset) => charset,
                    Err(e) => return Err(nom::Err::Failure(e)),
                };
                (input, DatatypeClass::String { charset })
            }
            5 => {
                let (input, _tag) = rest(input)?;
                (input, DatatypeClass::Opaque)
            }
            6 => {
                let (input, _members) = rest(input)?;
                (input, DatatypeClass::Compound)
            }
            8 => {
                let (input, base) = datatype(input)?;
                let members = (flags & 0xFFFF) as usize;
                let mut names = Vec::with_capacity(members);
                let mut remaining = input;
                for _ in 0..members {
                    let terminator = remaining
                        .iter()
                        .position(|b| *b == 0)
                        .ok_or(nom::Err::Incomplete(nom::Needed::Unknown))?;
                    let name = match CharacterSet::Ascii.decode(&remaining[..terminator]) {
                        Ok(name) => name,
                        Err(e) => return Err(nom::Err::Failure(e)),
                    };
                    names.push(name);
                    // Names are NUL-terminated and padded to 8 bytes.
                    let (after_name, _) = take(pad8(terminator + 1))(remaining)?;
                    remaining = after_name;
                }
                let (input, values) = count(
                    |i: Input<'_>| take(base.size as usize)(i).map(|(i, v)| (i, v.to_vec())),
                    members,
                )(remaining)?;
                let boolean = names == ["FALSE", "TRUE"]
                    && base.size == 1
                    && values == [vec![0u8], vec![1u8]];
                (
                    input,
                    DatatypeClass::Enumerated {
                        base: Box::new(base),
                        names,
                        values,
                        boolean,
                    },
                )
            }
            9 => {
                let (input, _base) = rest(input)?;
                (
                    input,
                    DatatypeClass::VariableLength {
                        kind: (flags & 0x0F) as u8,
                        padding: ((flags >> 4) & 0x0F) as u8,
                        charset: ((flags >> 8) & 0x0F) as u8,
                    },
                )
            }
            _ => return Err(unsupported()),
        };
        Ok((
            input,
            Datatype {
                version,
                class,
                size,
                flags,
            },
        ))
    })(input)
}

impl Datatype {
    /// The user-visible element type.
    pub fn dtype(&self) -> Hdf5Dtype {
        match &self.class {
            DatatypeClass::FixedPoint { signed, .. } => match (self.size, *signed) {
                (1, false) => Hdf5Dtype::U8,
                (2, false) => Hdf5Dtype::U16,
                (4, false) => Hdf5Dtype::U32,
                (8, false) => Hdf5Dtype::U64,
                (1, true) => Hdf5Dtype::I8,
                (2, true) => Hdf5Dtype::I16,
                (4, true) => Hdf5Dtype::I32,
                _ => Hdf5Dtype::I64,
            },
            DatatypeClass::FloatingPoint { width: 2 } => Hdf5Dtype::F16,
            DatatypeClass::FloatingPoint { width: 4 } => Hdf5Dtype::F32,
            DatatypeClass::FloatingPoint { .. } => Hdf5Dtype::F64,
            DatatypeClass::String { .. } => Hdf5Dtype::String,
            DatatypeClass::Opaque => Hdf5Dtype::Opaque,
            DatatypeClass::Compound => Hdf5Dtype::Compound,
            DatatypeClass::Enumerated { boolean: true, .. } => Hdf5Dtype::Boolean,
            DatatypeClass::Enumerated { .. } => Hdf5Dtype::Enum,
            DatatypeClass::VariableLength { .. } => Hdf5Dtype::VariableLength,
        }
    }

    pub fn little_endian(&self) -> bool {
        match &self.class {
            DatatypeClass::FixedPoint { little_endian, .. } => *little_endian,
            _ => true,
        }
    }

    /// Read one element's stored representation, consuming exactly
    /// `self.size` bytes.
    pub fn read(&self, reader: &mut Reader) -> Result<Value> {
        match &self.class {
            DatatypeClass::FixedPoint {
                signed,
                little_endian,
                ..
            } => {
                if *little_endian {
                    return match (self.size, *signed) {
                        (1, false) => Ok(Value::Uint(u64::from(reader.byte()?))),
                        (2, false) => Ok(Value::Uint(u64::from(reader.uint16()?))),
                        (4, false) => Ok(Value::Uint(u64::from(reader.uint32()?))),
                        (8, false) => Ok(Value::Uint(reader.uint64()?)),
                        (1, true) => Ok(Value::Int(i64::from(reader.int8()?))),
                        (2, true) => Ok(Value::Int(i64::from(reader.int16()?))),
                        (4, true) => Ok(Value::Int(i64::from(reader.int32()?))),
                        _ => Ok(Value::Int(reader.int64()?)),
                    };
                }
                let mut bytes = reader.read(self.size as usize)?;
                bytes.reverse();
                let mut raw = 0u64;
                for (i, b) in bytes.iter().enumerate() {
                    raw |= u64::from(*b) << (8 * i);
                }
                if *signed {
                    let shift = 64 - 8 * self.size;
                    Ok(Value::Int((raw << shift) as i64 >> shift))
                } else {
                    Ok(Value::Uint(raw))
                }
            }
            DatatypeClass::FloatingPoint { width } => Ok(Value::Float(match width {
                2 => f64::from(reader.float16()?),
                4 => f64::from(reader.float32()?),
                _ => reader.float64()?,
            })),
            DatatypeClass::String { charset } => {
                Ok(Value::String(reader.string(self.size as usize, *charset)?))
            }
            DatatypeClass::Opaque | DatatypeClass::Compound => {
                Ok(Value::Bytes(reader.read(self.size as usize)?))
            }
            DatatypeClass::Enumerated { base, boolean, .. } => {
                let raw = base.read(reader)?;
                if *boolean {
                    let truthy = match raw {
                        Value::Int(v) => v != 0,
                        Value::Uint(v) => v != 0,
                        _ => false,
                    };
                    Ok(Value::Bool(truthy))
                } else {
                    Ok(raw)
                }
            }
            DatatypeClass::VariableLength { .. } => {
                let length = reader.uint32()?;
                let collection_address = reader.offset()?;
                let index = reader.uint32()?;
                Ok(Value::VariableLength {
                    length,
                    id: GlobalHeapId {
                        collection_address,
                        index,
                    },
                })
            }
        }
    }

    /// Second pass: resolve global-heap references. Everything else is
    /// returned unchanged.
    pub fn decode(&self, value: Value, heap: &dyn HeapAccess) -> Result<Value> {
        match (&self.class, value) {
            (
                DatatypeClass::VariableLength { kind, charset, .. },
                Value::VariableLength { id, .. },
            ) => {
                let bytes = heap.heap_object(id)?.unwrap_or_default();
                if *kind == 1 {
                    let charset = CharacterSet::from_code(*charset)?;
                    Ok(Value::String(charset.decode(&bytes)?))
                } else {
                    Ok(Value::Bytes(bytes))
                }
            }
            (_, value) => Ok(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Dataspace

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataspaceKind {
    Scalar,
    Simple,
    Null,
}

#[derive(Debug, Clone)]
pub struct Dataspace {
    pub version: u8,
    pub kind: DataspaceKind,
    pub dimensions: Vec<u64>,
}

pub fn dataspace(input: Input<'_>, length_size: u8) -> PResult<'_, Dataspace> {
    context("dataspace", |input| {
        let (input, version) = le_u8(input)?;
        let (input, dimensionality) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        if flags & 0x02 != 0 {
            return Err(nom::Err::Failure(Error::PermutedOrUnequalMaxSize));
        }
        let (input, kind) = match version {
            1 => {
                let (input, _) = take(5usize)(input)?;
                let kind = if dimensionality == 0 {
                    DataspaceKind::Scalar
                } else {
                    DataspaceKind::Simple
                };
                (input, kind)
            }
            2 => {
                let (input, kind) = le_u8(input)?;
                let kind = match kind {
                    0 => DataspaceKind::Scalar,
                    1 => DataspaceKind::Simple,
                    2 => DataspaceKind::Null,
                    other => {
                        return Err(nom::Err::Failure(Error::UnsupportedVersion(
                            "dataspace type",
                            other,
                        )))
                    }
                };
                (input, kind)
            }
            other => {
                return Err(nom::Err::Failure(Error::UnsupportedVersion(
                    "dataspace", other,
                )))
            }
        };
        let (input, dimensions) = count(address(length_size), dimensionality as usize)(input)?;
        let input = if flags & 0x01 != 0 {
            let (input, max_dimensions) =
                count(address(length_size), dimensionality as usize)(input)?;
            for (current, max) in dimensions.iter().zip(&max_dimensions) {
                // v2 files may declare an unlimited axis; anything else that
                // disagrees with the current size is a growable dataset.
                let unlimited = version == 2 && !is_defined(*max);
                if *max != *current && !unlimited {
                    return Err(nom::Err::Failure(Error::PermutedOrUnequalMaxSize));
                }
            }
            input
        } else {
            input
        };
        Ok((
            input,
            Dataspace {
                version,
                kind,
                dimensions,
            },
        ))
    })(input)
}

impl Dataspace {
    pub fn element_count(&self) -> u64 {
        match self.kind {
            DataspaceKind::Null => 0,
            DataspaceKind::Scalar => 1,
            DataspaceKind::Simple => self.dimensions.iter().product(),
        }
    }

    /// Read the n-dimensional element array this shape describes.
    pub fn read(&self, datatype: &Datatype, reader: &mut Reader) -> Result<Value> {
        match self.kind {
            DataspaceKind::Null => Ok(Value::Null),
            DataspaceKind::Scalar => datatype.read(reader),
            DataspaceKind::Simple => self.read_array(datatype, reader, 0),
        }
    }

    fn read_array(&self, datatype: &Datatype, reader: &mut Reader, dim: usize) -> Result<Value> {
        let n = crate::reader::to_usize(self.dimensions[dim])?;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(if dim + 1 == self.dimensions.len() {
                datatype.read(reader)?
            } else {
                self.read_array(datatype, reader, dim + 1)?
            });
        }
        Ok(Value::Array(items))
    }

    /// Walk the same shape and resolve heap references at every leaf.
    pub fn decode(&self, datatype: &Datatype, value: Value, heap: &dyn HeapAccess) -> Result<Value> {
        match value {
            Value::Array(items) => {
                let items = items
                    .into_iter()
                    .map(|item| self.decode(datatype, item, heap))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::Array(items))
            }
            leaf => datatype.decode(leaf, heap),
        }
    }
}

// ---------------------------------------------------------------------------
// Data layout

#[derive(Debug, Clone)]
pub enum DataLayout {
    Compact {
        data: Vec<u8>,
    },
    Contiguous {
        address: u64,
        /// v1/v2 layouts do not store the byte size; it is derived from
        /// the dataspace and element size at materialization.
        size: Option<u64>,
    },
    Chunked {
        btree_address: u64,
        /// Chunk shape with the trailing element-size axis stripped.
        chunk_shape: Vec<u32>,
        item_size: u32,
    },
}

pub fn data_layout<'a>(
    input: Input<'a>,
    offset_size: u8,
    length_size: u8,
) -> PResult<'a, DataLayout> {
    context("data layout", |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 | 2 => {
                let (input, dimensionality) = le_u8(input)?;
                let (input, class) = le_u8(input)?;
                let (input, _) = take(5usize)(input)?;
                match class {
                    0 => {
                        let (input, _dimensions) =
                            count(le_u32, dimensionality as usize)(input)?;
                        let (input, size) = le_u32(input)?;
                        let (input, data) = take(size as usize)(input)?;
                        Ok((input, DataLayout::Compact { data: data.to_vec() }))
                    }
                    1 => {
                        let (input, data_address) = address(offset_size)(input)?;
                        let (input, _dimensions) =
                            count(le_u32, dimensionality as usize)(input)?;
                        Ok((
                            input,
                            DataLayout::Contiguous {
                                address: data_address,
                                size: None,
                            },
                        ))
                    }
                    2 => {
                        let (input, btree_address) = address(offset_size)(input)?;
                        let (input, chunk_shape) =
                            count(le_u32, dimensionality.saturating_sub(1) as usize)(input)?;
                        let (input, item_size) = le_u32(input)?;
                        Ok((
                            input,
                            DataLayout::Chunked {
                                btree_address,
                                chunk_shape,
                                item_size,
                            },
                        ))
                    }
                    other => Err(nom::Err::Failure(Error::UnsupportedLayoutClass(other))),
                }
            }
            3 => {
                let (input, class) = le_u8(input)?;
                match class {
                    0 => {
                        let (input, size) = le_u16(input)?;
                        let (input, data) = take(size as usize)(input)?;
                        Ok((input, DataLayout::Compact { data: data.to_vec() }))
                    }
                    1 => {
                        let (input, data_address) = address(offset_size)(input)?;
                        let (input, size) = address(length_size)(input)?;
                        Ok((
                            input,
                            DataLayout::Contiguous {
                                address: data_address,
                                size: Some(size),
                            },
                        ))
                    }
                    2 => {
                        let (input, dimensionality) = le_u8(input)?;
                        let (input, btree_address) = address(offset_size)(input)?;
                        let (input, chunk_shape) =
                            count(le_u32, dimensionality.saturating_sub(1) as usize)(input)?;
                        let (input, item_size) = le_u32(input)?;
                        Ok((
                            input,
                            DataLayout::Chunked {
                                btree_address,
                                chunk_shape,
                                item_size,
                            },
                        ))
                    }
                    other => Err(nom::Err::Failure(Error::UnsupportedLayoutClass(other))),
                }
            }
            other => Err(nom::Err::Failure(Error::UnsupportedVersion(
                "data layout",
                other,
            ))),
        }
    })(input)
}

// ---------------------------------------------------------------------------
// Filter pipeline

pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_LZF: u16 = 32000;

#[derive(Debug, Clone)]
pub struct Filter {
    pub id: u16,
    pub name: String,
    pub flags: u16,
    pub client_data: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterPipeline {
    pub filters: Vec<Filter>,
}

pub fn filter_pipeline(input: Input<'_>) -> PResult<'_, FilterPipeline> {
    context("filter pipeline", |input| {
        let (input, version) = le_u8(input)?;
        if version != 1 {
            // The v2 compact header exists in the wild but its offsets are
            // not described here; reject rather than guess.
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "filter pipeline",
                version,
            )));
        }
        let (input, filter_count) = le_u8(input)?;
        let (input, _) = take(6usize)(input)?;
        let mut filters = Vec::with_capacity(filter_count as usize);
        let mut remaining = input;
        for _ in 0..filter_count {
            let (input, id) = le_u16(remaining)?;
            let (input, name_length) = le_u16(input)?;
            let (input, flags) = le_u16(input)?;
            let (input, client_data_count) = le_u16(input)?;
            let (input, name_bytes) = take(name_length as usize)(input)?;
            let name = match CharacterSet::Ascii.decode(name_bytes) {
                Ok(name) => name,
                Err(e) => return Err(nom::Err::Failure(e)),
            };
            let (input, client_data) = count(le_u32, client_data_count as usize)(input)?;
            // An odd count of client data words is followed by four bytes
            // of padding to keep entries eight-byte aligned.
            let (input, _) = if client_data_count % 2 == 1 {
                take(4usize)(input)?
            } else {
                (input, &b""[..])
            };
            filters.push(Filter {
                id,
                name,
                flags,
                client_data,
            });
            remaining = input;
        }
        Ok((remaining, FilterPipeline { filters }))
    })(input)
}

// ---------------------------------------------------------------------------
// Attributes, links and the remaining stored messages

#[derive(Debug, Clone)]
pub struct AttributeMessage {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
}

pub fn attribute(input: Input<'_>, length_size: u8) -> PResult<'_, AttributeMessage> {
    context("attribute", |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 => {
                let (input, _) = take(1usize)(input)?;
                let (input, name_size) = le_u16(input)?;
                let (input, datatype_size) = le_u16(input)?;
                let (input, dataspace_size) = le_u16(input)?;
                let (input, name_bytes) = take(pad8(name_size as usize))(input)?;
                let name = match CharacterSet::Ascii.decode(&name_bytes[..name_size as usize]) {
                    Ok(name) => name,
                    Err(e) => return Err(nom::Err::Failure(e)),
                };
                let (input, datatype_bytes) = take(pad8(datatype_size as usize))(input)?;
                let (_, datatype) = datatype(datatype_bytes)?;
                let (input, dataspace_bytes) = take(pad8(dataspace_size as usize))(input)?;
                let (_, dataspace) = dataspace(dataspace_bytes, length_size)?;
                Ok((
                    &b""[..],
                    AttributeMessage {
                        name,
                        datatype,
                        dataspace,
                        data: input.to_vec(),
                    },
                ))
            }
            2 | 3 => {
                let (input, flags) = le_u8(input)?;
                if flags & 0x03 != 0 {
                    return Err(nom::Err::Failure(Error::UnsupportedVersion(
                        "shared attribute message",
                        version,
                    )));
                }
                let (input, name_size) = le_u16(input)?;
                let (input, datatype_size) = le_u16(input)?;
                let (input, dataspace_size) = le_u16(input)?;
                let (input, charset) = if version == 3 {
                    let (input, code) = le_u8(input)?;
                    match CharacterSet::from_code(code) {
                        Ok(charset) => (input, charset),
                        Err(e) => return Err(nom::Err::Failure(e)),
                    }
                } else {
                    (input, CharacterSet::Ascii)
                };
                let (input, name_bytes) = take(name_size as usize)(input)?;
                let name = match charset.decode(name_bytes) {
                    Ok(name) => name,
                    Err(e) => return Err(nom::Err::Failure(e)),
                };
                let (input, datatype_bytes) = take(datatype_size as usize)(input)?;
                let (_, datatype) = datatype(datatype_bytes)?;
                let (input, dataspace_bytes) = take(dataspace_size as usize)(input)?;
                let (_, dataspace) = dataspace(dataspace_bytes, length_size)?;
                Ok((
                    &b""[..],
                    AttributeMessage {
                        name,
                        datatype,
                        dataspace,
                        data: input.to_vec(),
                    },
                ))
            }
            other => Err(nom::Err::Failure(Error::UnsupportedVersion(
                "attribute", other,
            ))),
        }
    })(input)
}

#[derive(Debug, Clone)]
pub enum LinkTarget {
    Hard(u64),
    Soft(String),
    External(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
}

pub fn link(input: Input<'_>, offset_size: u8) -> PResult<'_, Link> {
    context("link", |input| {
        let (input, version) = le_u8(input)?;
        if version != 1 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion("link", version)));
        }
        let (input, flags) = le_u8(input)?;
        let (input, link_type) = if flags & 0x08 != 0 {
            le_u8(input)?
        } else {
            (input, 0)
        };
        let (input, _creation_order) = if flags & 0x04 != 0 {
            le_u64(input)?
        } else {
            (input, 0)
        };
        let (input, charset) = if flags & 0x10 != 0 {
            let (input, code) = le_u8(input)?;
            match CharacterSet::from_code(code) {
                Ok(charset) => (input, charset),
                Err(e) => return Err(nom::Err::Failure(e)),
            }
        } else {
            (input, CharacterSet::Ascii)
        };
        let name_length_width = 1u8 << (flags & 0x03);
        let (input, name_length) = uint(name_length_width)(input)?;
        let (input, name_bytes) = take(name_length as usize)(input)?;
        let name = match charset.decode(name_bytes) {
            Ok(name) => name,
            Err(e) => return Err(nom::Err::Failure(e)),
        };
        let (input, target) = match link_type {
            0 => {
                let (input, address) = address(offset_size)(input)?;
                (input, LinkTarget::Hard(address))
            }
            1 => {
                let (input, length) = le_u16(input)?;
                let (input, bytes) = take(length as usize)(input)?;
                let soft = match CharacterSet::Ascii.decode(bytes) {
                    Ok(soft) => soft,
                    Err(e) => return Err(nom::Err::Failure(e)),
                };
                (input, LinkTarget::Soft(soft))
            }
            64 => {
                let (input, length) = le_u16(input)?;
                let (input, bytes) = take(length as usize)(input)?;
                (input, LinkTarget::External(bytes.to_vec()))
            }
            other => {
                return Err(nom::Err::Failure(Error::UnsupportedVersion(
                    "link type", other,
                )))
            }
        };
        Ok((input, Link { name, target }))
    })(input)
}

#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub fractal_heap_address: u64,
    pub name_index_btree_address: u64,
}

pub fn link_info(input: Input<'_>, offset_size: u8) -> PResult<'_, LinkInfo> {
    context("link info", |input| {
        let (input, version) = le_u8(input)?;
        if version != 0 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "link info",
                version,
            )));
        }
        let (input, flags) = le_u8(input)?;
        let (input, _max_creation_index) = if flags & 0x01 != 0 {
            le_u64(input)?
        } else {
            (input, 0)
        };
        let (input, fractal_heap_address) = address(offset_size)(input)?;
        let (input, name_index_btree_address) = address(offset_size)(input)?;
        let (input, _creation_order_btree) = if flags & 0x02 != 0 {
            address(offset_size)(input)?
        } else {
            (input, 0)
        };
        Ok((
            input,
            LinkInfo {
                fractal_heap_address,
                name_index_btree_address,
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub max_compact_links: Option<u16>,
    pub min_dense_links: Option<u16>,
}

pub fn group_info(input: Input<'_>) -> PResult<'_, GroupInfo> {
    context("group info", |input| {
        let (input, version) = le_u8(input)?;
        if version != 0 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "group info",
                version,
            )));
        }
        let (input, flags) = le_u8(input)?;
        let (input, limits) = if flags & 0x01 != 0 {
            let (input, max_compact) = le_u16(input)?;
            let (input, min_dense) = le_u16(input)?;
            (input, (Some(max_compact), Some(min_dense)))
        } else {
            (input, (None, None))
        };
        Ok((
            input,
            GroupInfo {
                max_compact_links: limits.0,
                min_dense_links: limits.1,
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct FillValue {
    pub data: Vec<u8>,
}

pub fn fill_value_old(input: Input<'_>) -> PResult<'_, FillValue> {
    context("old fill value", |input| {
        let (input, size) = le_u32(input)?;
        let (input, data) = take(size as usize)(input)?;
        Ok((input, FillValue { data: data.to_vec() }))
    })(input)
}

pub fn fill_value(input: Input<'_>) -> PResult<'_, FillValue> {
    context("fill value", |input| {
        let (input, version) = le_u8(input)?;
        match version {
            1 => {
                let (input, _) = take(3usize)(input)?;
                let (input, size) = le_u32(input)?;
                let (input, data) = take(size as usize)(input)?;
                Ok((input, FillValue { data: data.to_vec() }))
            }
            2 => {
                let (input, _space_allocation_time) = le_u8(input)?;
                let (input, _write_time) = le_u8(input)?;
                let (input, defined) = le_u8(input)?;
                if defined > 0 {
                    let (input, size) = le_u32(input)?;
                    let (input, data) = take(size as usize)(input)?;
                    Ok((input, FillValue { data: data.to_vec() }))
                } else {
                    Ok((input, FillValue { data: Vec::new() }))
                }
            }
            3 => {
                let (input, flags) = le_u8(input)?;
                if flags & 0x20 != 0 {
                    let (input, size) = le_u32(input)?;
                    let (input, data) = take(size as usize)(input)?;
                    Ok((input, FillValue { data: data.to_vec() }))
                } else {
                    Ok((input, FillValue { data: Vec::new() }))
                }
            }
            other => Err(nom::Err::Failure(Error::UnsupportedVersion(
                "fill value",
                other,
            ))),
        }
    })(input)
}

#[derive(Debug, Clone)]
pub struct AttributeInfo {
    pub fractal_heap_address: u64,
    pub name_index_btree_address: u64,
}

pub fn attribute_info(input: Input<'_>, offset_size: u8) -> PResult<'_, AttributeInfo> {
    context("attribute info", |input| {
        let (input, version) = le_u8(input)?;
        if version != 0 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "attribute info",
                version,
            )));
        }
        let (input, flags) = le_u8(input)?;
        let (input, _max_creation_index) = if flags & 0x01 != 0 {
            le_u16(input)?
        } else {
            (input, 0)
        };
        let (input, fractal_heap_address) = address(offset_size)(input)?;
        let (input, name_index_btree_address) = address(offset_size)(input)?;
        let (input, _creation_order_btree) = if flags & 0x02 != 0 {
            address(offset_size)(input)?
        } else {
            (input, 0)
        };
        Ok((
            input,
            AttributeInfo {
                fractal_heap_address,
                name_index_btree_address,
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub heap_address: u64,
}

pub fn symbol_table_message(input: Input<'_>, offset_size: u8) -> PResult<'_, SymbolTableMessage> {
    context("symbol table message", |input| {
        let (input, btree_address) = address(offset_size)(input)?;
        let (input, heap_address) = address(offset_size)(input)?;
        Ok((
            input,
            SymbolTableMessage {
                btree_address,
                heap_address,
            },
        ))
    })(input)
}

pub fn modification_time(input: Input<'_>) -> PResult<'_, u32> {
    context("modification time", |input| {
        let (input, version) = le_u8(input)?;
        if version != 1 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "modification time",
                version,
            )));
        }
        let (input, _) = take(3usize)(input)?;
        le_u32(input)
    })(input)
}

// ---------------------------------------------------------------------------
// The object header walk

const MESSAGE_NIL: u16 = 0x00;
const MESSAGE_DATASPACE: u16 = 0x01;
const MESSAGE_LINK_INFO: u16 = 0x02;
const MESSAGE_DATATYPE: u16 = 0x03;
const MESSAGE_FILL_VALUE_OLD: u16 = 0x04;
const MESSAGE_FILL_VALUE: u16 = 0x05;
const MESSAGE_LINK: u16 = 0x06;
const MESSAGE_DATA_LAYOUT: u16 = 0x08;
const MESSAGE_GROUP_INFO: u16 = 0x0A;
const MESSAGE_FILTER_PIPELINE: u16 = 0x0B;
const MESSAGE_ATTRIBUTE: u16 = 0x0C;
const MESSAGE_COMMENT: u16 = 0x0D;
const MESSAGE_MODIFICATION_TIME_OLD: u16 = 0x0E;
const MESSAGE_CONTINUATION: u16 = 0x10;
const MESSAGE_SYMBOL_TABLE: u16 = 0x11;
const MESSAGE_MODIFICATION_TIME: u16 = 0x12;
const MESSAGE_ATTRIBUTE_INFO: u16 = 0x15;

/// All the metadata messages of one object, gathered across header
/// continuations.
#[derive(Debug, Default)]
pub struct DataObjectHeader {
    pub datatype: Option<Datatype>,
    pub dataspace: Option<Dataspace>,
    pub data_layout: Option<DataLayout>,
    pub filter_pipeline: Option<FilterPipeline>,
    pub attributes: Vec<AttributeMessage>,
    pub links: Vec<Link>,
    pub link_info: Option<LinkInfo>,
    pub group_info: Option<GroupInfo>,
    pub symbol_table: Option<SymbolTableMessage>,
    pub fill_value: Option<FillValue>,
    pub attribute_info: Option<AttributeInfo>,
    pub comment: Option<String>,
    pub modification_time: Option<u32>,
}

struct Block {
    offset: u64,
    length: u64,
}

impl DataObjectHeader {
    pub fn read(
        reader: &mut Reader,
        address: u64,
        offset_size: u8,
        length_size: u8,
    ) -> Result<DataObjectHeader> {
        let restore = reader.position();
        let result = Self::read_at(reader, address, offset_size, length_size);
        reader.seek(restore)?;
        result
    }

    fn read_at(
        reader: &mut Reader,
        address: u64,
        offset_size: u8,
        length_size: u8,
    ) -> Result<DataObjectHeader> {
        reader.seek(address)?;
        if reader.matches(b"OHDR")? {
            Self::read_v2(reader, offset_size, length_size)
        } else {
            Self::read_v1(reader, offset_size, length_size)
        }
    }

    fn read_v1(reader: &mut Reader, offset_size: u8, length_size: u8) -> Result<DataObjectHeader> {
        let version = reader.byte()?;
        if version != 1 {
            return Err(Error::UnsupportedVersion("object header", version));
        }
        reader.skip(1)?;
        let message_count = reader.uint16()?;
        let _reference_count = reader.uint32()?;
        let header_size = reader.uint32()?;
        reader.skip(4)?;

        let mut header = DataObjectHeader::default();
        let mut blocks = VecDeque::new();
        blocks.push_back(Block {
            offset: reader.position(),
            length: u64::from(header_size),
        });
        let mut remaining_messages = message_count as usize;
        while let Some(block) = blocks.pop_front() {
            reader.seek(block.offset)?;
            let bytes = reader.read(crate::reader::to_usize(block.length)?)?;
            let mut pos = 0usize;
            while remaining_messages > 0 && pos + 8 <= bytes.len() {
                let message_type = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
                let size = u16::from_le_bytes([bytes[pos + 2], bytes[pos + 3]]) as usize;
                let flags = bytes[pos + 4];
                pos += 8;
                if pos + size > bytes.len() {
                    return Err(Error::Truncated);
                }
                let payload = &bytes[pos..pos + size];
                // The walk resumes at pos + size no matter how much the
                // message parser consumed; v1 payloads keep messages
                // eight-byte aligned.
                pos = pad8(pos + size);
                remaining_messages -= 1;
                if !header.dispatch(
                    message_type,
                    flags,
                    payload,
                    offset_size,
                    length_size,
                    &mut blocks,
                )? {
                    break;
                }
            }
        }
        Ok(header)
    }

    fn read_v2(reader: &mut Reader, offset_size: u8, length_size: u8) -> Result<DataObjectHeader> {
        let version = reader.byte()?;
        if version != 2 {
            return Err(Error::UnsupportedVersion("object header", version));
        }
        let flags = reader.byte()?;
        if flags & 0x20 != 0 {
            // Access, modification, change and birth times.
            reader.skip(16)?;
        }
        if flags & 0x10 != 0 {
            // Compact-attribute phase-change limits.
            reader.skip(4)?;
        }
        let chunk_size_width = 1u8 << (flags & 0x03);
        let chunk_size = {
            let bytes = reader.read(chunk_size_width as usize)?;
            let mut value = 0u64;
            for (i, b) in bytes.iter().enumerate() {
                value |= u64::from(*b) << (8 * i);
            }
            value
        };
        let tracked_creation_order = flags & 0x04 != 0;

        let mut header = DataObjectHeader::default();
        let mut blocks = VecDeque::new();
        blocks.push_back(Block {
            offset: reader.position(),
            length: chunk_size,
        });
        let mut first = true;
        while let Some(block) = blocks.pop_front() {
            reader.seek(block.offset)?;
            // Continuation blocks carry an "OCHK" magic and a trailing
            // checksum; the first block is sized to its messages alone.
            let messages = if first {
                first = false;
                reader.read(crate::reader::to_usize(block.length)?)?
            } else {
                let length = crate::reader::to_usize(block.length)?;
                if length < 8 {
                    return Err(Error::Truncated);
                }
                reader.expect("OCHK")?;
                reader.read(length - 8)?
            };
            let mut pos = 0usize;
            while pos + 4 <= messages.len() {
                let message_type = u16::from(messages[pos]);
                let size =
                    u16::from_le_bytes([messages[pos + 1], messages[pos + 2]]) as usize;
                let flags = messages[pos + 3];
                pos += 4;
                if tracked_creation_order {
                    pos += 2;
                }
                if pos + size > messages.len() {
                    return Err(Error::Truncated);
                }
                let payload = &messages[pos..pos + size];
                pos += size;
                if !header.dispatch(
                    message_type,
                    flags,
                    payload,
                    offset_size,
                    length_size,
                    &mut blocks,
                )? {
                    break;
                }
            }
        }
        Ok(header)
    }

    /// Apply one message. Returns false when a NIL message ends the
    /// current chunk.
    fn dispatch(
        &mut self,
        message_type: u16,
        flags: u8,
        payload: &[u8],
        offset_size: u8,
        length_size: u8,
        blocks: &mut VecDeque<Block>,
    ) -> Result<bool> {
        match message_type {
            MESSAGE_NIL => return Ok(false),
            MESSAGE_DATASPACE => {
                // A four-byte dataspace with flag bit 0 set is a
                // placeholder left by the library for later rewrite.
                if !(payload.len() == 4 && flags == 1) {
                    self.dataspace = Some(crate::parse::run(dataspace(payload, length_size))?);
                }
            }
            MESSAGE_LINK_INFO => {
                self.link_info = Some(crate::parse::run(link_info(payload, offset_size))?);
            }
            MESSAGE_DATATYPE => {
                self.datatype = Some(crate::parse::run(datatype(payload))?);
            }
            MESSAGE_FILL_VALUE_OLD => {
                self.fill_value = Some(crate::parse::run(fill_value_old(payload))?);
            }
            MESSAGE_FILL_VALUE => {
                self.fill_value = Some(crate::parse::run(fill_value(payload))?);
            }
            MESSAGE_LINK => {
                self.links.push(crate::parse::run(link(payload, offset_size))?);
            }
            MESSAGE_DATA_LAYOUT => {
                self.data_layout = Some(crate::parse::run(data_layout(
                    payload,
                    offset_size,
                    length_size,
                ))?);
            }
            MESSAGE_GROUP_INFO => {
                self.group_info = Some(crate::parse::run(group_info(payload))?);
            }
            MESSAGE_FILTER_PIPELINE => {
                self.filter_pipeline = Some(crate::parse::run(filter_pipeline(payload))?);
            }
            MESSAGE_ATTRIBUTE => {
                self.attributes
                    .push(crate::parse::run(attribute(payload, length_size))?);
            }
            MESSAGE_COMMENT => {
                let terminator = payload.iter().position(|b| *b == 0).unwrap_or(payload.len());
                self.comment = Some(CharacterSet::Ascii.decode(&payload[..terminator])?);
            }
            MESSAGE_MODIFICATION_TIME_OLD => {
                // Fourteen ASCII digits and two bytes of padding; nothing
                // downstream consumes it.
            }
            MESSAGE_CONTINUATION => {
                let (remaining, offset) = address(offset_size)(payload).map_err(Error::from)?;
                let (_, length) = address(length_size)(remaining).map_err(Error::from)?;
                blocks.push_back(Block { offset, length });
            }
            MESSAGE_SYMBOL_TABLE => {
                self.symbol_table =
                    Some(crate::parse::run(symbol_table_message(payload, offset_size))?);
            }
            MESSAGE_MODIFICATION_TIME => {
                self.modification_time = Some(crate::parse::run(modification_time(payload))?);
            }
            MESSAGE_ATTRIBUTE_INFO => {
                self.attribute_info =
                    Some(crate::parse::run(attribute_info(payload, offset_size))?);
            }
            other => return Err(Error::UnsupportedMessageType(other)),
        }
        Ok(true)
    }

    /// True when this object carries everything a dataset needs.
    pub fn is_dataset(&self) -> bool {
        self.datatype.is_some() && self.dataspace.is_some() && self.data_layout.is_some()
    }
}
