//! Byte-level builder for miniature HDF5 fixtures. The integration tests
//! assemble real files with it instead of shelling out to a generator.
#![allow(dead_code)] // each test binary uses a different subset

pub const UNDEFINED: u64 = u64::max_value();

pub fn pad8(n: usize) -> usize {
    if n % 8 == 0 {
        n
    } else {
        n + (8 - n % 8)
    }
}

pub struct Writer {
    pub buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Writer {
        Writer { buf: Vec::new() }
    }

    pub fn pos(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    pub fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    pub fn align8(&mut self) {
        let len = self.buf.len();
        self.buf.resize(pad8(len), 0);
    }

    pub fn patch(&mut self, at: usize, bytes: &[u8]) {
        self.buf[at..at + bytes.len()].copy_from_slice(bytes);
    }
}

/// A symbol table entry with 8-byte offsets. `cache` 1 stores the
/// B-tree/heap pair in the scratch space.
pub fn symbol_table_entry(
    w: &mut Writer,
    link_name_offset: u64,
    object_header: u64,
    cache: u32,
    btree: u64,
    heap: u64,
) {
    w.u64(link_name_offset);
    w.u64(object_header);
    w.u32(cache);
    w.u32(0);
    if cache == 1 {
        w.u64(btree);
        w.u64(heap);
    } else {
        w.zeros(16);
    }
}

/// A version 1 object header whose messages are `(type, body)` pairs;
/// bodies are padded to eight bytes as the library writes them. Returns
/// the header's address.
pub fn v1_object_header(w: &mut Writer, messages: &[(u16, Vec<u8>)]) -> u64 {
    w.align8();
    let address = w.pos();
    let total: usize = messages.iter().map(|(_, body)| 8 + pad8(body.len())).sum();
    w.u8(1);
    w.u8(0);
    w.u16(messages.len() as u16);
    w.u32(1); // reference count
    w.u32(total as u32);
    w.zeros(4);
    for (message_type, body) in messages {
        let padded = pad8(body.len());
        w.u16(*message_type);
        w.u16(padded as u16);
        w.u8(0); // flags
        w.zeros(3);
        w.bytes(body);
        w.zeros(padded - body.len());
    }
    address
}

/// A version 2 ("OHDR") object header, flags zero: no times, one-byte
/// chunk size, untracked creation order. Returns the header's address.
pub fn v2_object_header(w: &mut Writer, messages: &[(u16, Vec<u8>)]) -> u64 {
    w.align8();
    let address = w.pos();
    let total: usize = messages.iter().map(|(_, body)| 4 + body.len()).sum();
    assert!(total < 256, "fixture chunk overflows the one-byte size");
    w.bytes(b"OHDR");
    w.u8(2);
    w.u8(0); // flags
    w.u8(total as u8);
    for (message_type, body) in messages {
        w.u8(*message_type as u8);
        w.u16(body.len() as u16);
        w.u8(0); // flags
        w.bytes(body);
    }
    w.u32(0); // checksum, not validated
    address
}

/// Message body: version 1 hard link with a one-byte name length.
pub fn link_body(name: &str, object_header: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1); // version
    body.push(0); // flags: hard, one-byte name length, ASCII
    body.push(name.len() as u8);
    body.extend_from_slice(name.as_bytes());
    body.extend_from_slice(&object_header.to_le_bytes());
    body
}

/// Message body: fixed-point datatype (class 0, version 1).
pub fn fixed_point_body(size: u32, signed: bool) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0x10); // version 1, class 0
    let flags: u32 = if signed { 0x08 } else { 0x00 };
    body.extend_from_slice(&flags.to_le_bytes()[..3]);
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // bit offset
    body.extend_from_slice(&((size * 8) as u16).to_le_bytes()); // precision
    body
}

/// Message body: IEEE little-endian float datatype (class 1, version 1).
pub fn float_body(size: u32) -> Vec<u8> {
    let flags: u32 = match size {
        2 => 0x0F20,
        4 => 0x1F20,
        _ => 0x3F20,
    };
    let (exponent_size, mantissa_size, bias): (u8, u8, u32) = match size {
        2 => (5, 10, 15),
        4 => (8, 23, 127),
        _ => (11, 52, 1023),
    };
    let mut body = Vec::new();
    body.push(0x11); // version 1, class 1
    body.extend_from_slice(&flags.to_le_bytes()[..3]);
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // bit offset
    body.extend_from_slice(&((size * 8) as u16).to_le_bytes()); // precision
    body.push(mantissa_size); // exponent location
    body.push(exponent_size);
    body.push(0); // mantissa location
    body.push(mantissa_size);
    body.extend_from_slice(&bias.to_le_bytes());
    body
}

/// Message body: version 1 dataspace, equal max sizes omitted.
pub fn dataspace_v1_body(dimensions: &[u64]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1);
    body.push(dimensions.len() as u8);
    body.push(0); // flags
    body.push(0);
    body.extend_from_slice(&[0; 4]);
    for dimension in dimensions {
        body.extend_from_slice(&dimension.to_le_bytes());
    }
    body
}

/// Message body: version 2 dataspace (scalar when `dimensions` is empty).
pub fn dataspace_v2_body(dimensions: &[u64]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(2);
    body.push(dimensions.len() as u8);
    body.push(0); // flags
    body.push(if dimensions.is_empty() { 0 } else { 1 });
    for dimension in dimensions {
        body.extend_from_slice(&dimension.to_le_bytes());
    }
    body
}

/// Message body: version 3 contiguous data layout.
pub fn contiguous_layout_body(address: u64, size: u64) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(3);
    body.push(1);
    body.extend_from_slice(&address.to_le_bytes());
    body.extend_from_slice(&size.to_le_bytes());
    body
}

/// Message body: version 3 chunked data layout. The element-size axis is
/// appended to `chunk_shape` on disk.
pub fn chunked_layout_body(btree: u64, chunk_shape: &[u32], item_size: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(3);
    body.push(2);
    body.push((chunk_shape.len() + 1) as u8);
    body.extend_from_slice(&btree.to_le_bytes());
    for extent in chunk_shape {
        body.extend_from_slice(&extent.to_le_bytes());
    }
    body.extend_from_slice(&item_size.to_le_bytes());
    body
}

/// Message body: version 1 filter pipeline with a single unnamed filter.
pub fn filter_pipeline_body(id: u16) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1);
    body.push(1); // one filter
    body.extend_from_slice(&[0; 6]);
    body.extend_from_slice(&id.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // name length
    body.extend_from_slice(&0u16.to_le_bytes()); // flags
    body.extend_from_slice(&0u16.to_le_bytes()); // client data words
    body
}

/// Message body: version 1 attribute, name/datatype/dataspace parts
/// padded to eight bytes.
pub fn attribute_v1_body(name: &str, datatype: &[u8], dataspace: &[u8], data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(1);
    body.push(0);
    body.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
    body.extend_from_slice(&(datatype.len() as u16).to_le_bytes());
    body.extend_from_slice(&(dataspace.len() as u16).to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.resize(8 + pad8(name.len() + 1), 0);
    body.extend_from_slice(datatype);
    body.resize(body.len() + pad8(datatype.len()) - datatype.len(), 0);
    body.extend_from_slice(dataspace);
    body.resize(body.len() + pad8(dataspace.len()) - dataspace.len(), 0);
    body.extend_from_slice(data);
    body
}

/// A level-zero group B-tree whose single node lists `children` symbol
/// table nodes. Returns the tree's address.
pub fn group_btree(w: &mut Writer, children: &[u64]) -> u64 {
    w.align8();
    let address = w.pos();
    w.bytes(b"TREE");
    w.u8(0);
    w.u8(0);
    w.u16(children.len() as u16);
    w.u64(UNDEFINED);
    w.u64(UNDEFINED);
    for child in children {
        w.u64(0); // key: heap offset, unused in traversal
        w.u64(*child);
    }
    address
}

/// A level-zero chunk B-tree. Each entry is `(stored size, filter mask,
/// element offsets without the trailing axis, chunk address)`. Returns
/// the tree's address.
pub fn chunk_btree(w: &mut Writer, entries: &[(u32, u32, Vec<u64>, u64)]) -> u64 {
    w.align8();
    let address = w.pos();
    w.bytes(b"TREE");
    w.u8(1);
    w.u8(0);
    w.u16(entries.len() as u16);
    w.u64(UNDEFINED);
    w.u64(UNDEFINED);
    for (size, mask, offsets, child) in entries {
        w.u32(*size);
        w.u32(*mask);
        for offset in offsets {
            w.u64(*offset);
        }
        w.u64(0); // element-size axis
        w.u64(*child);
    }
    address
}

/// A "SNOD" symbol table node. Returns its address.
pub fn symbol_table_node(w: &mut Writer, entries: &[(u64, u64)]) -> u64 {
    w.align8();
    let address = w.pos();
    w.bytes(b"SNOD");
    w.u8(1);
    w.u8(0);
    w.u16(entries.len() as u16);
    for (link_name_offset, object_header) in entries {
        symbol_table_entry(w, *link_name_offset, *object_header, 0, 0, 0);
    }
    address
}

/// A local heap over `data`. Returns the heap header's address.
pub fn local_heap(w: &mut Writer, data: &[u8]) -> u64 {
    w.align8();
    let data_address = w.pos();
    w.bytes(data);
    w.align8();
    let address = w.pos();
    w.bytes(b"HEAP");
    w.u8(0);
    w.zeros(3);
    w.u64(pad8(data.len()) as u64);
    w.u64(UNDEFINED); // free list
    w.u64(data_address);
    address
}

/// A global heap collection holding one object at index 1. Returns the
/// collection's address.
pub fn global_heap(w: &mut Writer, object: &[u8]) -> u64 {
    w.align8();
    let address = w.pos();
    let payload = pad8(object.len());
    let size = 16 + 16 + payload + 16;
    w.bytes(b"GCOL");
    w.u8(1);
    w.zeros(3);
    w.u64(size as u64);
    w.u16(1); // index
    w.u16(1); // reference count
    w.zeros(4);
    w.u64(object.len() as u64);
    w.bytes(object);
    w.zeros(payload - object.len());
    w.u16(0); // free-space terminator
    w.zeros(14);
    address
}

/// Fill the reserved 96 bytes at offset zero with a version 0 superblock
/// whose root entry caches `btree`/`heap` and points at `root_header`.
pub fn v0_superblock(w: &mut Writer, root_header: u64, btree: u64, heap: u64) {
    let mut sb = Writer::new();
    sb.bytes(b"\x89\x48\x44\x46\x0d\x0a\x1a\x0a");
    sb.bytes(&[0, 0, 0, 0, 0, 8, 8, 0]);
    sb.u16(4); // group leaf K
    sb.u16(16); // group internal K
    sb.u32(0); // consistency flags
    sb.u64(0); // base address
    sb.u64(UNDEFINED); // free space
    sb.u64(w.pos()); // end of file
    sb.u64(UNDEFINED); // driver info
    symbol_table_entry(&mut sb, 0, root_header, 1, btree, heap);
    assert_eq!(sb.buf.len(), 96);
    let bytes = sb.buf;
    w.patch(0, &bytes);
}

/// Fill the reserved 48 bytes at offset zero with a version 2 superblock.
pub fn v2_superblock(w: &mut Writer, root_header: u64) {
    let mut sb = Writer::new();
    sb.bytes(b"\x89\x48\x44\x46\x0d\x0a\x1a\x0a");
    sb.bytes(&[2, 8, 8, 0]);
    sb.u64(0); // base address
    sb.u64(UNDEFINED); // superblock extension
    sb.u64(w.pos()); // end of file
    sb.u64(root_header);
    sb.u32(0); // checksum, not validated
    assert_eq!(sb.buf.len(), 48);
    let bytes = sb.buf;
    w.patch(0, &bytes);
}

pub const MESSAGE_DATASPACE: u16 = 0x01;
pub const MESSAGE_DATATYPE: u16 = 0x03;
pub const MESSAGE_LINK: u16 = 0x06;
pub const MESSAGE_DATA_LAYOUT: u16 = 0x08;
pub const MESSAGE_FILTER_PIPELINE: u16 = 0x0B;
pub const MESSAGE_ATTRIBUTE: u16 = 0x0C;
pub const MESSAGE_SYMBOL_TABLE: u16 = 0x11;
