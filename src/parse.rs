//! Wire-format parsers for the file-level structures: superblock, symbol
//! tables, v1 B-tree nodes and the two heaps. Parsers operate on byte
//! regions fetched through the reader and thread the superblock's
//! offset/length widths as arguments.

use nom::bytes::streaming::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::streaming::{le_u16, le_u32, le_u8};

use crate::error::Error;
use crate::reader::{is_defined, Reader, UNDEFINED_ADDRESS};

pub type Input<'a> = &'a [u8];
pub type PResult<'a, O> = nom::IResult<Input<'a>, O, Error>;

/// Unwrap a completed parse, folding nom's error plumbing into `Error`.
pub fn run<O>(result: PResult<'_, O>) -> Result<O, Error> {
    result.map(|(_, o)| o).map_err(Error::from)
}

/// A little-endian unsigned field of runtime width. The all-ones pattern
/// normalizes to `UNDEFINED_ADDRESS` regardless of width.
pub fn address<'a>(width: u8) -> impl Fn(Input<'a>) -> PResult<'a, u64> {
    move |input| {
        let (input, bytes) = take(width as usize)(input)?;
        let mut value = 0u64;
        let mut undefined = true;
        for (i, b) in bytes.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
            undefined &= *b == 0xFF;
        }
        Ok((input, if undefined { UNDEFINED_ADDRESS } else { value }))
    }
}

/// Match a magic byte sequence, reporting a mismatch as `BadMagic`.
pub fn signature<'a>(
    magic: &'static [u8],
    label: &'static str,
) -> impl Fn(Input<'a>) -> PResult<'a, ()> {
    move |input| match tag::<_, _, Error>(magic)(input) {
        Ok((input, _)) => Ok((input, ())),
        Err(nom::Err::Incomplete(needed)) => Err(nom::Err::Incomplete(needed)),
        Err(_) => Err(nom::Err::Failure(Error::BadMagic(label))),
    }
}

pub const HDF5_SIGNATURE: &[u8] = b"\x89\x48\x44\x46\x0d\x0a\x1a\x0a";

#[derive(Debug, Clone)]
pub enum Root {
    /// v0/v1: the root group's symbol table entry, parsed in place.
    SymbolTableEntry(SymbolTableEntry),
    /// v2/v3: address of the root data object header.
    ObjectHeader(u64),
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u8,
    pub offset_size: u8,
    pub length_size: u8,
    pub base_address: u64,
    pub end_of_file_address: u64,
    /// Undefined for v2/v3 files.
    pub free_space_address: u64,
    pub driver_information_address: u64,
    /// Undefined for v0/v1 files.
    pub superblock_extension_address: u64,
    pub group_leaf_node_k: u16,
    pub group_internal_node_k: u16,
    pub indexed_storage_internal_node_k: u16,
    pub root: Root,
}

pub fn superblock(input: Input<'_>) -> PResult<'_, Superblock> {
    context("superblock", |input| {
        let (input, _) = signature(HDF5_SIGNATURE, "HDF5 signature")(input)?;
        let (input, version) = le_u8(input)?;
        match version {
            0 | 1 => superblock_v0(input, version),
            2 | 3 => superblock_v2(input, version),
            other => Err(nom::Err::Failure(Error::UnsupportedVersion(
                "superblock",
                other,
            ))),
        }
    })(input)
}

fn superblock_v0(input: Input<'_>, version: u8) -> PResult<'_, Superblock> {
    let (input, _free_space_storage_version) = le_u8(input)?;
    let (input, _root_group_entry_version) = le_u8(input)?;
    let (input, _) = take(1usize)(input)?;
    let (input, _shared_header_message_version) = le_u8(input)?;
    let (input, offset_size) = le_u8(input)?;
    let (input, length_size) = le_u8(input)?;
    check_field_sizes(offset_size, length_size)?;
    let (input, _) = take(1usize)(input)?;
    let (input, group_leaf_node_k) = le_u16(input)?;
    let (input, group_internal_node_k) = le_u16(input)?;
    let (input, _file_consistency_flags) = le_u32(input)?;
    let (input, indexed_storage_internal_node_k) = if version == 1 {
        let (input, k) = le_u16(input)?;
        let (input, _) = take(2usize)(input)?;
        (input, k)
    } else {
        (input, 0)
    };
    let (input, base_address) = address(offset_size)(input)?;
    let (input, free_space_address) = address(offset_size)(input)?;
    let (input, end_of_file_address) = address(offset_size)(input)?;
    let (input, driver_information_address) = address(offset_size)(input)?;
    let (input, root_entry) = symbol_table_entry(input, offset_size)?;

    Ok((
        input,
        Superblock {
            version,
            offset_size,
            length_size,
            base_address,
            end_of_file_address,
            free_space_address,
            driver_information_address,
            superblock_extension_address: UNDEFINED_ADDRESS,
            group_leaf_node_k,
            group_internal_node_k,
            indexed_storage_internal_node_k,
            root: Root::SymbolTableEntry(root_entry),
        },
    ))
}

fn check_field_sizes(offset_size: u8, length_size: u8) -> Result<(), nom::Err<Error>> {
    if offset_size != 4 && offset_size != 8 {
        return Err(nom::Err::Failure(Error::UnsupportedVersion(
            "offset size",
            offset_size,
        )));
    }
    if length_size != 4 && length_size != 8 {
        return Err(nom::Err::Failure(Error::UnsupportedVersion(
            "length size",
            length_size,
        )));
    }
    Ok(())
}

fn superblock_v2(input: Input<'_>, version: u8) -> PResult<'_, Superblock> {
    let (input, offset_size) = le_u8(input)?;
    let (input, length_size) = le_u8(input)?;
    check_field_sizes(offset_size, length_size)?;
    let (input, _file_consistency_flags) = le_u8(input)?;
    let (input, base_address) = address(offset_size)(input)?;
    let (input, superblock_extension_address) = address(offset_size)(input)?;
    let (input, end_of_file_address) = address(offset_size)(input)?;
    let (input, root_object_header_address) = address(offset_size)(input)?;
    // The trailing checksum is not validated.

    Ok((
        input,
        Superblock {
            version,
            offset_size,
            length_size,
            base_address,
            end_of_file_address,
            free_space_address: UNDEFINED_ADDRESS,
            driver_information_address: UNDEFINED_ADDRESS,
            superblock_extension_address,
            group_leaf_node_k: 0,
            group_internal_node_k: 0,
            indexed_storage_internal_node_k: 0,
            root: Root::ObjectHeader(root_object_header_address),
        },
    ))
}

#[derive(Debug, Clone)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    /// Only meaningful when `cache_type == 1`.
    pub btree_address: u64,
    pub heap_address: u64,
}

impl SymbolTableEntry {
    pub fn has_symbol_table(&self) -> bool {
        self.cache_type == 1 && is_defined(self.btree_address) && is_defined(self.heap_address)
    }
}

/// Size in bytes of one entry on disk: two offsets, cache type, reserved
/// word and the fixed 16-byte scratch space.
pub fn symbol_table_entry_size(offset_size: u8) -> usize {
    2 * offset_size as usize + 24
}

pub fn symbol_table_entry(input: Input<'_>, offset_size: u8) -> PResult<'_, SymbolTableEntry> {
    context("symbol table entry", |input| {
        let (input, link_name_offset) = address(offset_size)(input)?;
        let (input, object_header_address) = address(offset_size)(input)?;
        let (input, cache_type) = le_u32(input)?;
        let (input, _) = take(4usize)(input)?;
        let (input, scratch) = take(16usize)(input)?;
        let (btree_address, heap_address) = match cache_type {
            0 => (UNDEFINED_ADDRESS, UNDEFINED_ADDRESS),
            1 => {
                let (scratch, btree) = address(offset_size)(scratch)?;
                let (_, heap) = address(offset_size)(scratch)?;
                (btree, heap)
            }
            other => return Err(nom::Err::Failure(Error::UnsupportedCacheType(other))),
        };
        Ok((
            input,
            SymbolTableEntry {
                link_name_offset,
                object_header_address,
                cache_type,
                btree_address,
                heap_address,
            },
        ))
    })(input)
}

#[derive(Debug)]
pub struct SymbolTableNode {
    pub entries: Vec<SymbolTableEntry>,
}

/// Parse the fixed "SNOD" prefix and return the entry count, so the
/// caller can size the second fetch.
pub fn symbol_table_node_header(input: Input<'_>) -> PResult<'_, u16> {
    context("symbol table node", |input| {
        let (input, _) = signature(b"SNOD", "SNOD")(input)?;
        let (input, version) = le_u8(input)?;
        if version != 1 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "symbol table node",
                version,
            )));
        }
        let (input, _) = take(1usize)(input)?;
        le_u16(input)
    })(input)
}

pub fn symbol_table_node(input: Input<'_>, offset_size: u8) -> PResult<'_, SymbolTableNode> {
    let (input, entries_used) = symbol_table_node_header(input)?;
    let (input, entries) = count(
        |i| symbol_table_entry(i, offset_size),
        entries_used as usize,
    )(input)?;
    Ok((input, SymbolTableNode { entries }))
}

/// Size in bytes of the fixed "SNOD" prefix.
pub const SYMBOL_TABLE_NODE_HEADER_SIZE: usize = 8;

pub const BTREE_GROUP_NODE: u8 = 0;
pub const BTREE_CHUNK_NODE: u8 = 1;

#[derive(Debug, Clone, Copy)]
pub struct BTreeNodeHeader {
    pub node_type: u8,
    pub level: u8,
    pub entries_used: u16,
}

/// Size in bytes of a node header: magic, type, level, entry count and
/// the two sibling offsets.
pub fn btree_node_header_size(offset_size: u8) -> usize {
    8 + 2 * offset_size as usize
}

pub fn btree_node_header(input: Input<'_>, offset_size: u8) -> PResult<'_, BTreeNodeHeader> {
    context("B-tree node", |input| {
        let (input, _) = signature(b"TREE", "TREE")(input)?;
        let (input, node_type) = le_u8(input)?;
        if node_type != BTREE_GROUP_NODE && node_type != BTREE_CHUNK_NODE {
            return Err(nom::Err::Failure(Error::UnsupportedBTreeType(node_type)));
        }
        let (input, level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        let (input, _left_sibling) = address(offset_size)(input)?;
        let (input, _right_sibling) = address(offset_size)(input)?;
        Ok((
            input,
            BTreeNodeHeader {
                node_type,
                level,
                entries_used,
            },
        ))
    })(input)
}

/// One entry of a group node: a key (offset of a name in the local heap,
/// unused during traversal) followed by the child address.
#[derive(Debug, Clone, Copy)]
pub struct GroupNodeEntry {
    pub key: u64,
    pub child: u64,
}

pub fn group_node_entry_size(offset_size: u8, length_size: u8) -> usize {
    offset_size as usize + length_size as usize
}

pub fn group_node_entries(
    input: Input<'_>,
    offset_size: u8,
    length_size: u8,
    entries_used: u16,
) -> PResult<'_, Vec<GroupNodeEntry>> {
    count(
        |i| {
            let (i, key) = address(length_size)(i)?;
            let (i, child) = address(offset_size)(i)?;
            Ok((i, GroupNodeEntry { key, child }))
        },
        entries_used as usize,
    )(input)
}

/// One entry of a raw-chunk node: the stored (possibly compressed) size,
/// the filter mask, the chunk's element offsets along every axis
/// (including the trailing element-size axis, always zero) and the child
/// address.
#[derive(Debug, Clone)]
pub struct ChunkNodeEntry {
    pub size: u32,
    pub filter_mask: u32,
    pub offsets: Vec<u64>,
    pub child: u64,
}

pub fn chunk_node_entry_size(offset_size: u8, dimensionality: usize) -> usize {
    8 + dimensionality * 8 + offset_size as usize
}

pub fn chunk_node_entries(
    input: Input<'_>,
    offset_size: u8,
    dimensionality: usize,
    entries_used: u16,
) -> PResult<'_, Vec<ChunkNodeEntry>> {
    count(
        |i| {
            let (i, size) = le_u32(i)?;
            let (i, filter_mask) = le_u32(i)?;
            let (i, offsets) = count(address(8), dimensionality)(i)?;
            let (i, child) = address(offset_size)(i)?;
            Ok((
                i,
                ChunkNodeEntry {
                    size,
                    filter_mask,
                    offsets,
                    child,
                },
            ))
        },
        entries_used as usize,
    )(input)
}

#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub data_size: u64,
    pub free_list_head: u64,
    pub data_address: u64,
}

pub fn local_heap_size(offset_size: u8, length_size: u8) -> usize {
    8 + 2 * length_size as usize + offset_size as usize
}

pub fn local_heap(input: Input<'_>, offset_size: u8, length_size: u8) -> PResult<'_, LocalHeap> {
    context("local heap", |input| {
        let (input, _) = signature(b"HEAP", "HEAP")(input)?;
        let (input, version) = le_u8(input)?;
        if version != 0 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "local heap",
                version,
            )));
        }
        let (input, _) = take(3usize)(input)?;
        let (input, data_size) = address(length_size)(input)?;
        let (input, free_list_head) = address(length_size)(input)?;
        let (input, data_address) = address(offset_size)(input)?;
        Ok((
            input,
            LocalHeap {
                data_size,
                free_list_head,
                data_address,
            },
        ))
    })(input)
}

/// Size of the "GCOL" prefix: magic, version, reserved and the declared
/// collection size.
pub fn global_heap_header_size(length_size: u8) -> usize {
    8 + length_size as usize
}

/// Parse the collection prefix and return the declared size of the whole
/// collection, header included.
pub fn global_heap_header(input: Input<'_>, length_size: u8) -> PResult<'_, u64> {
    context("global heap collection", |input| {
        let (input, _) = signature(b"GCOL", "GCOL")(input)?;
        let (input, version) = le_u8(input)?;
        if version != 1 {
            return Err(nom::Err::Failure(Error::UnsupportedVersion(
                "global heap collection",
                version,
            )));
        }
        let (input, _) = take(3usize)(input)?;
        address(length_size)(input)
    })(input)
}

/// Walk the objects of a whole collection (header included in
/// `collection` so the 8-byte object alignment lines up). Object index 0
/// marks the remaining free space and terminates the walk.
pub fn global_heap_objects(
    collection: &[u8],
    length_size: u8,
) -> Result<Vec<(u16, Vec<u8>)>, Error> {
    let header = global_heap_header_size(length_size);
    let object_header = 8 + length_size as usize;
    let mut objects = Vec::new();
    let mut pos = header;
    while pos + object_header <= collection.len() {
        let index = run(le_u16::<Error>(&collection[pos..]))?;
        if index == 0 {
            break;
        }
        let size = run(address(length_size)(&collection[pos + 8..]))?;
        let size = crate::reader::to_usize(size)?;
        let data_start = pos + object_header;
        let data_end = data_start.checked_add(size).ok_or(Error::IntegerOverflow)?;
        if data_end > collection.len() {
            return Err(Error::Truncated);
        }
        objects.push((index, collection[data_start..data_end].to_vec()));
        // Objects are 8-byte aligned within the collection.
        pos = data_end + (8 - data_end % 8) % 8;
    }
    Ok(objects)
}

// ---------------------------------------------------------------------------
// B-tree traversal

/// Fetch and parse the symbol-table node at `address`.
pub fn read_symbol_table_node(
    reader: &mut Reader,
    address: u64,
    offset_size: u8,
) -> Result<SymbolTableNode, Error> {
    let prefix = reader.read_at(address, SYMBOL_TABLE_NODE_HEADER_SIZE)?;
    let entries_used = run(symbol_table_node_header(&prefix))? as usize;
    let node = reader.read_at(
        address,
        SYMBOL_TABLE_NODE_HEADER_SIZE + entries_used * symbol_table_entry_size(offset_size),
    )?;
    run(symbol_table_node(&node, offset_size))
}

/// Walk a group B-tree and flatten every reachable leaf into one list of
/// symbol table entries. Levels above zero recurse; level zero points at
/// "SNOD" nodes.
pub fn walk_group_btree(
    reader: &mut Reader,
    address: u64,
    offset_size: u8,
    length_size: u8,
) -> Result<Vec<SymbolTableEntry>, Error> {
    let mut entries = Vec::new();
    walk_group_node(reader, address, offset_size, length_size, &mut entries)?;
    Ok(entries)
}

fn walk_group_node(
    reader: &mut Reader,
    address: u64,
    offset_size: u8,
    length_size: u8,
    entries: &mut Vec<SymbolTableEntry>,
) -> Result<(), Error> {
    let header_size = btree_node_header_size(offset_size);
    let prefix = reader.read_at(address, header_size)?;
    let header = run(btree_node_header(&prefix, offset_size))?;
    if header.node_type != BTREE_GROUP_NODE {
        return Err(Error::UnsupportedBTreeType(header.node_type));
    }
    let body_address = address
        .checked_add(header_size as u64)
        .ok_or(Error::IntegerOverflow)?;
    let body = reader.read_at(
        body_address,
        header.entries_used as usize * group_node_entry_size(offset_size, length_size),
    )?;
    let node_entries = run(group_node_entries(
        &body,
        offset_size,
        length_size,
        header.entries_used,
    ))?;
    for entry in node_entries {
        if header.level == 0 {
            let node = read_symbol_table_node(reader, entry.child, offset_size)?;
            entries.extend(node.entries);
        } else {
            walk_group_node(reader, entry.child, offset_size, length_size, entries)?;
        }
    }
    Ok(())
}

/// Walk a raw-chunk B-tree and flatten every leaf entry. Level-zero
/// entries point directly at stored chunk bytes.
pub fn walk_chunk_btree(
    reader: &mut Reader,
    address: u64,
    dimensionality: usize,
    offset_size: u8,
) -> Result<Vec<ChunkNodeEntry>, Error> {
    let mut entries = Vec::new();
    walk_chunk_node(reader, address, dimensionality, offset_size, &mut entries)?;
    Ok(entries)
}

fn walk_chunk_node(
    reader: &mut Reader,
    address: u64,
    dimensionality: usize,
    offset_size: u8,
    entries: &mut Vec<ChunkNodeEntry>,
) -> Result<(), Error> {
    let header_size = btree_node_header_size(offset_size);
    let prefix = reader.read_at(address, header_size)?;
    let header = run(btree_node_header(&prefix, offset_size))?;
    if header.node_type != BTREE_CHUNK_NODE {
        return Err(Error::UnsupportedBTreeType(header.node_type));
    }
    let body_address = address
        .checked_add(header_size as u64)
        .ok_or(Error::IntegerOverflow)?;
    let body = reader.read_at(
        body_address,
        header.entries_used as usize * chunk_node_entry_size(offset_size, dimensionality),
    )?;
    let node_entries = run(chunk_node_entries(
        &body,
        offset_size,
        dimensionality,
        header.entries_used,
    ))?;
    for entry in node_entries {
        if header.level == 0 {
            entries.push(entry);
        } else {
            walk_chunk_node(reader, entry.child, dimensionality, offset_size, entries)?;
        }
    }
    Ok(())
}
