use std::fmt;

/// Every way a decode can fail. All of these are fatal to the current
/// operation; nothing is retried.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    Io(String),
    /// Ran past the end of the file or stream.
    Truncated,
    /// A signature or other fixed byte pattern did not match.
    BadMagic(&'static str),
    UnsupportedVersion(&'static str, u8),
    UnsupportedLayoutClass(u8),
    UnsupportedFilter { id: u16, name: String },
    UnsupportedDatatype { class: u8, size: u32, flags: u32 },
    UnsupportedMessageType(u16),
    UnsupportedCharacterSet(u8),
    UnsupportedCacheType(u32),
    UnsupportedBTreeType(u8),
    /// Links stored in a fractal heap / v2 B-tree, which this reader
    /// does not traverse.
    UnsupportedLinkStorage,
    NonZeroBaseAddress(u64),
    /// A 64-bit field does not fit the host's usize.
    IntegerOverflow,
    CorruptedCompressedData(&'static str),
    PermutedOrUnequalMaxSize,
    /// Name or text bytes that are not valid in their declared character set.
    InvalidString,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Truncated => write!(f, "unexpected end of file"),
            Error::BadMagic(expected) => write!(f, "signature mismatch, expected {:?}", expected),
            Error::UnsupportedVersion(what, version) => {
                write!(f, "unsupported {} version {}", what, version)
            }
            Error::UnsupportedLayoutClass(class) => {
                write!(f, "unsupported data layout class {}", class)
            }
            Error::UnsupportedFilter { id, name } => {
                write!(f, "unsupported filter {} ({:?})", id, name)
            }
            Error::UnsupportedDatatype { class, size, flags } => write!(
                f,
                "unsupported datatype class {} size {} flags {:#x}",
                class, size, flags
            ),
            Error::UnsupportedMessageType(ty) => {
                write!(f, "unsupported object header message type {:#04x}", ty)
            }
            Error::UnsupportedCharacterSet(cset) => {
                write!(f, "unsupported character set {}", cset)
            }
            Error::UnsupportedCacheType(ty) => {
                write!(f, "unsupported symbol table cache type {}", ty)
            }
            Error::UnsupportedBTreeType(ty) => write!(f, "unsupported B-tree node type {}", ty),
            Error::UnsupportedLinkStorage => {
                write!(f, "links are stored in a fractal heap, which is not supported")
            }
            Error::NonZeroBaseAddress(addr) => {
                write!(f, "superblock base address {:#x} is not zero", addr)
            }
            Error::IntegerOverflow => write!(f, "64-bit field exceeds the host address range"),
            Error::CorruptedCompressedData(detail) => {
                write!(f, "corrupted compressed chunk: {}", detail)
            }
            Error::PermutedOrUnequalMaxSize => {
                write!(f, "dataspace with permutation indices or growable max size")
            }
            Error::InvalidString => write!(f, "string bytes invalid for their character set"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

// Wire parsers thread this error type through nom so structure-specific
// failures (bad magic, unsupported versions) survive the combinators.
impl<'a> nom::error::ParseError<&'a [u8]> for Error {
    fn from_error_kind(_input: &'a [u8], kind: nom::error::ErrorKind) -> Self {
        match kind {
            nom::error::ErrorKind::Eof | nom::error::ErrorKind::Complete => Error::Truncated,
            _ => Error::BadMagic("wire structure"),
        }
    }

    fn append(_input: &'a [u8], _kind: nom::error::ErrorKind, other: Self) -> Self {
        other
    }
}

impl From<nom::Err<Error>> for Error {
    fn from(e: nom::Err<Error>) -> Self {
        match e {
            nom::Err::Incomplete(_) => Error::Truncated,
            nom::Err::Error(e) | nom::Err::Failure(e) => e,
        }
    }
}
