//! A pure-Rust read-only decoder for the HDF5 container format.
//!
//! This library reconstructs the logical tree of groups and datasets from
//! random-access bytes, exposes each dataset's shape, element type and
//! attributes, and materializes dataset payloads (chunked and
//! filter-compressed included) into a contiguous row-major buffer. It
//! does not intend to support every feature of the specification: writing,
//! SWMR, fractal-heap link storage and user-defined filters are out.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::io::{Read, Seek};
use std::path::Path;
use std::rc::Rc;

pub mod data;
pub mod error;
pub mod filter;
pub mod header;
pub mod parse;
pub mod reader;

pub use error::Error;
pub use header::GlobalHeapId;
pub use reader::{CharacterSet, Reader};

use header::{DataObjectHeader, Dataspace, Datatype, HeapAccess, LinkTarget};
use parse::SymbolTableEntry;
use reader::{is_defined, to_usize, Slab, UNDEFINED_ADDRESS};

type Result<T> = std::result::Result<T, Error>;

/// Above this input size, path-based opens switch from a file mapping to
/// the sliding-window stream reader.
const WINDOW_MODE_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Convenience function for `Hdf5File::open`.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Option<Hdf5File>> {
    Hdf5File::open(path)
}

/// The element type of a dataset or attribute, as user code sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Hdf5Dtype {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
    String,
    Boolean,
    Enum,
    Opaque,
    Compound,
    VariableLength,
}

/// One decoded element, or an n-dimensional array of them.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// An unresolved global-heap reference; `decode` replaces these.
    VariableLength { length: u32, id: GlobalHeapId },
    Array(Vec<Value>),
}

/// Shared decoding state: the single reader cursor, the lazily loaded
/// global-heap collections and the arena of object headers already
/// decoded (keyed by address, which also terminates reference cycles).
struct FileContext {
    reader: RefCell<Reader>,
    offset_size: u8,
    length_size: u8,
    global_heap: RefCell<HashMap<u64, Rc<HashMap<u16, Vec<u8>>>>>,
    headers: RefCell<HashMap<u64, Rc<DataObjectHeader>>>,
}

impl FileContext {
    fn header(&self, address: u64) -> Result<Rc<DataObjectHeader>> {
        if let Some(header) = self.headers.borrow().get(&address) {
            return Ok(header.clone());
        }
        let header = Rc::new(DataObjectHeader::read(
            &mut self.reader.borrow_mut(),
            address,
            self.offset_size,
            self.length_size,
        )?);
        self.headers.borrow_mut().insert(address, header.clone());
        Ok(header)
    }

    fn heap_collection(&self, address: u64) -> Result<Rc<HashMap<u16, Vec<u8>>>> {
        if let Some(collection) = self.global_heap.borrow().get(&address) {
            return Ok(collection.clone());
        }
        let collection = {
            let mut reader = self.reader.borrow_mut();
            let prefix =
                reader.read_at(address, parse::global_heap_header_size(self.length_size))?;
            let size = parse::run(parse::global_heap_header(&prefix, self.length_size))?;
            reader.read_at(address, to_usize(size)?)?
        };
        let objects = parse::global_heap_objects(&collection, self.length_size)?
            .into_iter()
            .collect::<HashMap<u16, Vec<u8>>>();
        let objects = Rc::new(objects);
        self.global_heap.borrow_mut().insert(address, objects.clone());
        Ok(objects)
    }

    fn local_heap(&self, address: u64) -> Result<parse::LocalHeap> {
        let bytes = self.reader.borrow_mut().read_at(
            address,
            parse::local_heap_size(self.offset_size, self.length_size),
        )?;
        parse::run(parse::local_heap(&bytes, self.offset_size, self.length_size))
    }

    /// A NUL-terminated UTF-8 name at an offset into a local heap.
    fn heap_string(&self, heap: &parse::LocalHeap, offset: u64) -> Result<String> {
        let target = heap
            .data_address
            .checked_add(offset)
            .ok_or(Error::IntegerOverflow)?;
        let mut reader = self.reader.borrow_mut();
        let restore = reader.position();
        let result = reader
            .seek(target)
            .and_then(|_| reader.nul_string(CharacterSet::Utf8));
        reader.seek(restore)?;
        result
    }
}

impl HeapAccess for FileContext {
    fn heap_object(&self, id: GlobalHeapId) -> Result<Option<Vec<u8>>> {
        if !is_defined(id.collection_address) {
            return Ok(None);
        }
        let collection = self.heap_collection(id.collection_address)?;
        let index = match u16::try_from(id.index) {
            Ok(index) => index,
            Err(_) => return Ok(None),
        };
        Ok(collection.get(&index).cloned())
    }
}

/// An opened HDF5 file.
pub struct Hdf5File {
    root: Group,
}

impl std::fmt::Debug for Hdf5File {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hdf5File").field("root", &self.root).finish()
    }
}

impl Hdf5File {
    /// Open a file by path. Returns `Ok(None)` when the bytes are not an
    /// HDF5 file at all; malformed HDF5 is an error.
    ///
    /// Inputs below the window threshold are memory-mapped; larger files
    /// are decoded through the sliding-window stream reader.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        if len < parse::HDF5_SIGNATURE.len() as u64 {
            return Ok(None);
        }
        if len > WINDOW_MODE_THRESHOLD {
            Self::from_stream(std::io::BufReader::new(file))
        } else {
            let map = unsafe { memmap::Mmap::map(&file)? };
            Self::from_reader(Reader::from_slab(Slab::Mapped(Rc::new(map))))
        }
    }

    /// Decode from a caller-supplied byte slab.
    pub fn from_bytes(data: Vec<u8>) -> Result<Option<Self>> {
        Self::from_reader(Reader::from_bytes(data))
    }

    /// Decode from a seekable byte source through the windowed reader.
    pub fn from_stream<S: Read + Seek + 'static>(source: S) -> Result<Option<Self>> {
        Self::from_reader(Reader::from_source(Box::new(source))?)
    }

    fn from_reader(mut reader: Reader) -> Result<Option<Self>> {
        if reader.len() < parse::HDF5_SIGNATURE.len() as u64 {
            return Ok(None);
        }
        if !reader.matches(parse::HDF5_SIGNATURE)? {
            return Ok(None);
        }
        let prefix = reader.read_at_upto(0, 512)?;
        let superblock = parse::run(parse::superblock(&prefix))?;
        if superblock.base_address != 0 {
            return Err(Error::NonZeroBaseAddress(superblock.base_address));
        }
        reader.initialize(superblock.offset_size, superblock.length_size)?;
        let ctx = Rc::new(FileContext {
            reader: RefCell::new(reader),
            offset_size: superblock.offset_size,
            length_size: superblock.length_size,
            global_heap: RefCell::new(HashMap::new()),
            headers: RefCell::new(HashMap::new()),
        });
        let root = match superblock.root {
            parse::Root::SymbolTableEntry(entry) => {
                Group::from_entry(ctx, String::new(), String::new(), entry)
            }
            parse::Root::ObjectHeader(address) => {
                Group::from_address(ctx, String::new(), String::new(), address)
            }
        };
        Ok(Some(Hdf5File { root }))
    }

    /// The root group.
    pub fn root(&self) -> Group {
        self.root.clone()
    }
}

struct GroupInner {
    ctx: Rc<FileContext>,
    name: String,
    path: String,
    /// Legacy origin; carries cached B-tree/heap addresses.
    entry: Option<SymbolTableEntry>,
    header_address: u64,
    children: RefCell<Option<BTreeMap<String, Group>>>,
    attributes: RefCell<Option<Rc<BTreeMap<String, Value>>>>,
    variable: RefCell<Option<Option<Variable>>>,
}

/// A node of the file's tree: a group of named children, or a dataset
/// (in which case `value` is present). Children, attributes and dataset
/// payloads decode on first access and are cached; handles are cheap to
/// clone.
#[derive(Clone)]
pub struct Group {
    inner: Rc<GroupInner>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish()
    }
}

impl Group {
    fn from_entry(
        ctx: Rc<FileContext>,
        parent_path: String,
        name: String,
        entry: SymbolTableEntry,
    ) -> Group {
        let header_address = entry.object_header_address;
        Group::new(ctx, parent_path, name, Some(entry), header_address)
    }

    fn from_address(
        ctx: Rc<FileContext>,
        parent_path: String,
        name: String,
        address: u64,
    ) -> Group {
        Group::new(ctx, parent_path, name, None, address)
    }

    fn new(
        ctx: Rc<FileContext>,
        parent_path: String,
        name: String,
        entry: Option<SymbolTableEntry>,
        header_address: u64,
    ) -> Group {
        let path = if name.is_empty() {
            String::new()
        } else {
            format!("{}/{}", parent_path, name)
        };
        Group {
            inner: Rc::new(GroupInner {
                ctx,
                name,
                path,
                entry,
                header_address,
                children: RefCell::new(None),
                attributes: RefCell::new(None),
                variable: RefCell::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The absolute path: empty for the root, `/a/b` below it.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// The named children, decoded on first call.
    pub fn groups(&self) -> Result<BTreeMap<String, Group>> {
        if let Some(children) = self.inner.children.borrow().as_ref() {
            return Ok(children.clone());
        }
        let children = self.decode_children()?;
        *self.inner.children.borrow_mut() = Some(children.clone());
        Ok(children)
    }

    fn decode_children(&self) -> Result<BTreeMap<String, Group>> {
        let ctx = &self.inner.ctx;
        let mut children = BTreeMap::new();

        // Prefer the symbol table: either cached in the entry that named
        // this group, or carried as a header message.
        let (btree_address, heap_address) = match &self.inner.entry {
            Some(entry) if entry.has_symbol_table() => {
                (entry.btree_address, entry.heap_address)
            }
            _ => {
                let header = ctx.header(self.inner.header_address)?;
                match header.symbol_table.as_ref() {
                    Some(message) => (message.btree_address, message.heap_address),
                    None => (UNDEFINED_ADDRESS, UNDEFINED_ADDRESS),
                }
            }
        };

        if is_defined(btree_address) && is_defined(heap_address) {
            let heap = ctx.local_heap(heap_address)?;
            let entries = parse::walk_group_btree(
                &mut ctx.reader.borrow_mut(),
                btree_address,
                ctx.offset_size,
                ctx.length_size,
            )?;
            for entry in entries {
                let name = ctx.heap_string(&heap, entry.link_name_offset)?;
                let child =
                    Group::from_entry(ctx.clone(), self.inner.path.clone(), name.clone(), entry);
                children.insert(name, child);
            }
        } else {
            let header = ctx.header(self.inner.header_address)?;
            for link in &header.links {
                if let LinkTarget::Hard(address) = link.target {
                    let child = Group::from_address(
                        ctx.clone(),
                        self.inner.path.clone(),
                        link.name.clone(),
                        address,
                    );
                    children.insert(link.name.clone(), child);
                }
            }
            if children.is_empty() {
                if let Some(info) = &header.link_info {
                    if is_defined(info.fractal_heap_address) {
                        return Err(Error::UnsupportedLinkStorage);
                    }
                }
            }
        }
        Ok(children)
    }

    /// Resolve a `/`-separated path relative to this group.
    pub fn group(&self, path: &str) -> Result<Option<Group>> {
        let mut current = self.clone();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            let children = current.groups()?;
            match children.get(part) {
                Some(child) => current = child.clone(),
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// The attribute map, with global-heap references resolved.
    pub fn attributes(&self) -> Result<Rc<BTreeMap<String, Value>>> {
        if let Some(attributes) = self.inner.attributes.borrow().as_ref() {
            return Ok(attributes.clone());
        }
        let ctx = &self.inner.ctx;
        let header = ctx.header(self.inner.header_address)?;
        let mut attributes = BTreeMap::new();
        for message in &header.attributes {
            let mut reader = Reader::from_bytes(message.data.clone());
            reader.initialize(ctx.offset_size, ctx.length_size)?;
            let value = message.dataspace.read(&message.datatype, &mut reader)?;
            let value = message
                .dataspace
                .decode(&message.datatype, value, &**ctx)?;
            attributes.insert(message.name.clone(), value);
        }
        let attributes = Rc::new(attributes);
        *self.inner.attributes.borrow_mut() = Some(attributes.clone());
        Ok(attributes)
    }

    /// The dataset held by this node, if it is one. The payload is
    /// materialized and cached on first call.
    pub fn value(&self) -> Result<Option<Variable>> {
        if let Some(variable) = self.inner.variable.borrow().as_ref() {
            return Ok(variable.clone());
        }
        let ctx = &self.inner.ctx;
        let header = ctx.header(self.inner.header_address)?;
        let variable = if header.is_dataset() {
            let (datatype, dataspace, layout) = match (
                header.datatype.as_ref(),
                header.dataspace.as_ref(),
                header.data_layout.as_ref(),
            ) {
                (Some(datatype), Some(dataspace), Some(layout)) => (datatype, dataspace, layout),
                _ => return Ok(None),
            };
            let data = data::materialize(
                &mut ctx.reader.borrow_mut(),
                layout,
                datatype,
                dataspace,
                header.filter_pipeline.as_ref(),
                ctx.offset_size,
            )?;
            Some(Variable {
                inner: Rc::new(VariableInner {
                    ctx: ctx.clone(),
                    datatype: datatype.clone(),
                    dataspace: dataspace.clone(),
                    data,
                }),
            })
        } else {
            None
        };
        *self.inner.variable.borrow_mut() = Some(variable.clone());
        Ok(variable)
    }
}

struct VariableInner {
    ctx: Rc<FileContext>,
    datatype: Datatype,
    dataspace: Dataspace,
    data: Vec<u8>,
}

/// A materialized dataset: element type, shape and the flat byte buffer
/// in row-major order.
#[derive(Clone)]
pub struct Variable {
    inner: Rc<VariableInner>,
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("dtype", &self.dtype())
            .field("shape", &self.shape())
            .field("bytes", &self.inner.data.len())
            .finish()
    }
}

impl Variable {
    pub fn dtype(&self) -> Hdf5Dtype {
        self.inner.datatype.dtype()
    }

    /// Dimension sizes; empty for a scalar.
    pub fn shape(&self) -> &[u64] {
        &self.inner.dataspace.dimensions
    }

    pub fn little_endian(&self) -> bool {
        self.inner.datatype.little_endian()
    }

    /// The flat byte buffer, `element count * element size` long.
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// The typed n-dimensional value tree, with variable-length data
    /// resolved through the global heap.
    pub fn value(&self) -> Result<Value> {
        let inner = &self.inner;
        let mut reader = Reader::from_bytes(inner.data.clone());
        reader.initialize(inner.ctx.offset_size, inner.ctx.length_size)?;
        let value = inner.dataspace.read(&inner.datatype, &mut reader)?;
        inner.dataspace.decode(&inner.datatype, value, &*inner.ctx)
    }
}
