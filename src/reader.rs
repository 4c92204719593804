use std::borrow::Cow;
use std::convert::TryFrom;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use crate::error::Error;

type Result<T> = std::result::Result<T, Error>;

/// All-ones offset or length fields mean "no such address" on disk.
pub const UNDEFINED_ADDRESS: u64 = u64::MAX;

/// The windowed reader never buffers more than this around the cursor.
const WINDOW_SIZE: usize = 256;

pub fn is_defined(address: u64) -> bool {
    address != UNDEFINED_ADDRESS
}

/// Convert a 64-bit file offset into a host `usize` without silent truncation.
pub fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::IntegerOverflow)
}

/// Character sets the format declares for names and string data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Ascii,
    Utf8,
}

impl CharacterSet {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(CharacterSet::Ascii),
            1 => Ok(CharacterSet::Utf8),
            other => Err(Error::UnsupportedCharacterSet(other)),
        }
    }

    /// Decode `bytes`, stripping trailing NUL padding.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        let end = bytes
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        let bytes = &bytes[..end];
        match self {
            CharacterSet::Ascii if !bytes.is_ascii() => Err(Error::InvalidString),
            _ => String::from_utf8(bytes.to_vec()).map_err(|_| Error::InvalidString),
        }
    }
}

/// A source of bytes the windowed reader can seek around in.
pub trait ByteSource: Read + Seek {}

impl<T: Read + Seek> ByteSource for T {}

/// The backing storage of a buffered reader: either caller-supplied bytes
/// or a file mapping. Clones share the allocation.
#[derive(Clone)]
pub enum Slab {
    Bytes(Rc<[u8]>),
    Mapped(Rc<memmap::Mmap>),
}

impl Slab {
    fn bytes(&self) -> &[u8] {
        match self {
            Slab::Bytes(b) => b,
            Slab::Mapped(m) => &m[..],
        }
    }
}

#[derive(Clone, Copy)]
struct Widths {
    offset: u8,
    length: u8,
}

pub struct Buffered {
    slab: Slab,
    start: usize,
    end: usize,
    pos: usize,
    widths: Widths,
}

pub struct Windowed {
    source: Box<dyn ByteSource>,
    source_len: u64,
    window: Vec<u8>,
    window_start: u64,
    pos: u64,
    widths: Widths,
}

/// Positioned little-endian reads over either a byte slab or a seekable
/// stream. Both variants honor the same contract; components hold exactly
/// one cursor and save/restore its position around nested reads.
pub enum Reader {
    Buffered(Buffered),
    Windowed(Windowed),
}

impl Reader {
    pub fn from_bytes(data: Vec<u8>) -> Reader {
        Reader::from_slab(Slab::Bytes(Rc::from(data)))
    }

    pub fn from_slab(slab: Slab) -> Reader {
        let end = slab.bytes().len();
        Reader::Buffered(Buffered {
            slab,
            start: 0,
            end,
            pos: 0,
            widths: Widths { offset: 8, length: 8 },
        })
    }

    pub fn from_source(mut source: Box<dyn ByteSource>) -> Result<Reader> {
        let source_len = source.seek(SeekFrom::End(0))?;
        Ok(Reader::Windowed(Windowed {
            source,
            source_len,
            window: Vec::new(),
            window_start: 0,
            pos: 0,
            widths: Widths { offset: 8, length: 8 },
        }))
    }

    /// Fix the widths consumed by `offset()` and `length()`. Called once
    /// after the superblock version byte.
    pub fn initialize(&mut self, offset_size: u8, length_size: u8) -> Result<()> {
        if offset_size != 4 && offset_size != 8 {
            return Err(Error::UnsupportedVersion("offset size", offset_size));
        }
        if length_size != 4 && length_size != 8 {
            return Err(Error::UnsupportedVersion("length size", length_size));
        }
        let widths = Widths {
            offset: offset_size,
            length: length_size,
        };
        match self {
            Reader::Buffered(r) => r.widths = widths,
            Reader::Windowed(r) => r.widths = widths,
        }
        Ok(())
    }

    fn widths(&self) -> Widths {
        match self {
            Reader::Buffered(r) => r.widths,
            Reader::Windowed(r) => r.widths,
        }
    }

    /// Total length of this reader's span.
    pub fn len(&self) -> u64 {
        match self {
            Reader::Buffered(r) => (r.end - r.start) as u64,
            Reader::Windowed(r) => r.source_len,
        }
    }

    /// Cursor position relative to the start of this reader's span.
    pub fn position(&self) -> u64 {
        match self {
            Reader::Buffered(r) => (r.pos - r.start) as u64,
            Reader::Windowed(r) => r.pos,
        }
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len() {
            return Err(Error::Truncated);
        }
        match self {
            Reader::Buffered(r) => r.pos = r.start + to_usize(pos)?,
            Reader::Windowed(r) => r.pos = pos,
        }
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        let pos = self.position().checked_add(n).ok_or(Error::IntegerOverflow)?;
        self.seek(pos)
    }

    /// Round the position up to the next multiple of `m`.
    pub fn align(&mut self, m: u64) -> Result<()> {
        let pos = self.position();
        let rem = pos % m;
        if rem != 0 {
            self.skip(m - rem)?;
        }
        Ok(())
    }

    fn peek_bytes(&mut self, n: usize) -> Result<Cow<'_, [u8]>> {
        match self {
            Reader::Buffered(r) => {
                if r.pos.checked_add(n).map_or(true, |end| end > r.end) {
                    return Err(Error::Truncated);
                }
                Ok(Cow::Borrowed(&r.slab.bytes()[r.pos..r.pos + n]))
            }
            Reader::Windowed(r) => {
                if r.pos + n as u64 > r.source_len {
                    return Err(Error::Truncated);
                }
                if n > WINDOW_SIZE {
                    let mut buf = vec![0u8; n];
                    r.source.seek(SeekFrom::Start(r.pos))?;
                    r.source.read_exact(&mut buf)?;
                    return Ok(Cow::Owned(buf));
                }
                let in_window = r.pos >= r.window_start
                    && r.pos + n as u64 <= r.window_start + r.window.len() as u64;
                if !in_window {
                    let fill = (r.source_len - r.pos).min(WINDOW_SIZE as u64) as usize;
                    r.window.resize(fill, 0);
                    r.source.seek(SeekFrom::Start(r.pos))?;
                    r.source.read_exact(&mut r.window)?;
                    r.window_start = r.pos;
                }
                let at = (r.pos - r.window_start) as usize;
                Ok(Cow::Borrowed(&r.window[at..at + n]))
            }
        }
    }

    fn advance(&mut self, n: usize) {
        match self {
            Reader::Buffered(r) => r.pos += n,
            Reader::Windowed(r) => r.pos += n as u64,
        }
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let bytes = self.peek_bytes(buf.len())?;
        buf.copy_from_slice(&bytes);
        self.advance(buf.len());
        Ok(())
    }

    /// Read `n` bytes and advance.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        let bytes = self.peek_bytes(n)?.into_owned();
        self.advance(n);
        Ok(bytes)
    }

    /// Read `n` bytes without advancing.
    pub fn peek(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.peek_bytes(n)?.into_owned())
    }

    /// Split off an independent sub-reader over the next `n` bytes and
    /// advance past them.
    pub fn stream(&mut self, n: u64) -> Result<Reader> {
        let n_usize = to_usize(n)?;
        let sub = match self {
            Reader::Buffered(r) => {
                if r.pos as u64 + n > r.end as u64 {
                    return Err(Error::Truncated);
                }
                let sub = Reader::Buffered(Buffered {
                    slab: r.slab.clone(),
                    start: r.pos,
                    end: r.pos + n_usize,
                    pos: r.pos,
                    widths: r.widths,
                });
                r.pos += n_usize;
                sub
            }
            Reader::Windowed(_) => {
                let widths = self.widths();
                let bytes = self.read(n_usize)?;
                let mut sub = Reader::from_bytes(bytes);
                if let Reader::Buffered(b) = &mut sub {
                    b.widths = widths;
                }
                sub
            }
        };
        Ok(sub)
    }

    pub fn byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.fill(&mut buf)?;
        Ok(buf[0])
    }

    pub fn int8(&mut self) -> Result<i8> {
        Ok(self.byte()? as i8)
    }

    pub fn uint16(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.fill(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn int16(&mut self) -> Result<i16> {
        Ok(self.uint16()? as i16)
    }

    pub fn uint32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn int32(&mut self) -> Result<i32> {
        Ok(self.uint32()? as i32)
    }

    pub fn uint64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.fill(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn int64(&mut self) -> Result<i64> {
        Ok(self.uint64()? as i64)
    }

    pub fn float16(&mut self) -> Result<f32> {
        Ok(decode_float16(self.uint16()?))
    }

    pub fn float32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.uint32()?))
    }

    pub fn float64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.uint64()?))
    }

    fn varint(&mut self, width: u8) -> Result<u64> {
        let mut buf = [0u8; 8];
        let bytes = &mut buf[..width as usize];
        self.fill(bytes)?;
        let mut value = 0u64;
        let mut undefined = true;
        for (i, b) in bytes.iter().enumerate() {
            value |= u64::from(*b) << (8 * i);
            undefined &= *b == 0xFF;
        }
        Ok(if undefined { UNDEFINED_ADDRESS } else { value })
    }

    /// A file offset of the superblock-declared width.
    pub fn offset(&mut self) -> Result<u64> {
        let width = self.widths().offset;
        self.varint(width)
    }

    /// A length of the superblock-declared width.
    pub fn length(&mut self) -> Result<u64> {
        let width = self.widths().length;
        self.varint(width)
    }

    /// A fixed-size string field; trailing NUL padding is stripped.
    pub fn string(&mut self, size: usize, charset: CharacterSet) -> Result<String> {
        let bytes = self.read(size)?;
        charset.decode(&bytes)
    }

    /// Scan forward from the cursor and count the bytes before `terminator`.
    /// The cursor does not move.
    pub fn size(&mut self, terminator: u8) -> Result<u64> {
        let start = self.position();
        let mut n = 0u64;
        loop {
            let b = self.byte();
            match b {
                Ok(b) if b == terminator => break,
                Ok(_) => n += 1,
                Err(e) => {
                    self.seek(start)?;
                    return Err(e);
                }
            }
        }
        self.seek(start)?;
        Ok(n)
    }

    /// A NUL-terminated string; consumes the terminator.
    pub fn nul_string(&mut self, charset: CharacterSet) -> Result<String> {
        let n = to_usize(self.size(0)?)?;
        let s = self.string(n, charset)?;
        self.skip(1)?;
        Ok(s)
    }

    /// If the next bytes equal `signature`, consume them and return true.
    pub fn matches(&mut self, signature: &[u8]) -> Result<bool> {
        if self.position() + signature.len() as u64 > self.len() {
            return Ok(false);
        }
        let found = self.peek(signature.len())? == signature;
        if found {
            self.skip(signature.len() as u64)?;
        }
        Ok(found)
    }

    /// Consume `signature` or fail with `BadMagic`.
    pub fn expect(&mut self, signature: &'static str) -> Result<()> {
        let bytes = self.peek(signature.len())?;
        if bytes != signature.as_bytes() {
            return Err(Error::BadMagic(signature));
        }
        self.skip(signature.len() as u64)
    }

    /// Read `n` bytes at `address`, restoring the cursor afterwards so a
    /// nested read never corrupts an outer walk.
    pub fn read_at(&mut self, address: u64, n: usize) -> Result<Vec<u8>> {
        let restore = self.position();
        let result = self.seek(address).and_then(|_| self.read(n));
        self.seek(restore)?;
        result
    }

    /// Like `read_at`, but short reads at the end of the source return
    /// what is there instead of failing.
    pub fn read_at_upto(&mut self, address: u64, n: usize) -> Result<Vec<u8>> {
        if address >= self.len() {
            return Ok(Vec::new());
        }
        let available = (self.len() - address).min(n as u64) as usize;
        self.read_at(address, available)
    }
}

/// IEEE 754 half-precision: sign bit 15, exponent bits 14..10, mantissa
/// bits 9..0.
pub fn decode_float16(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0f32 } else { 1.0f32 };
    let exponent = (bits >> 10) & 0x1F;
    let mantissa = bits & 0x03FF;
    let magnitude = match exponent {
        0 => f32::from(mantissa) * 2.0f32.powi(-24),
        0x1F if mantissa != 0 => std::f32::NAN,
        0x1F => std::f32::INFINITY,
        _ => (1.0 + f32::from(mantissa) / 1024.0) * 2.0f32.powi(i32::from(exponent) - 15),
    };
    sign * magnitude
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Vec<u8> {
        (0u16..64).map(|b| b as u8).collect()
    }

    fn both_readers() -> Vec<Reader> {
        vec![
            Reader::from_bytes(sample()),
            Reader::from_source(Box::new(Cursor::new(sample()))).unwrap(),
        ]
    }

    #[test]
    fn read_is_repeatable() {
        for mut reader in both_readers() {
            reader.seek(5).unwrap();
            let first = reader.read(10).unwrap();
            reader.seek(5).unwrap();
            let second = reader.read(10).unwrap();
            assert_eq!(first, second);
            assert_eq!(reader.position(), 15);
        }
    }

    #[test]
    fn peek_does_not_advance() {
        for mut reader in both_readers() {
            let peeked = reader.peek(4).unwrap();
            assert_eq!(reader.position(), 0);
            assert_eq!(peeked, reader.read(4).unwrap());
        }
    }

    #[test]
    fn primitives_decode_little_endian() {
        for mut reader in both_readers() {
            assert_eq!(reader.byte().unwrap(), 0);
            assert_eq!(reader.uint16().unwrap(), 0x0201);
            assert_eq!(reader.uint32().unwrap(), 0x06050403);
            assert_eq!(reader.uint64().unwrap(), 0x0E0D_0C0B_0A09_0807);
        }
    }

    #[test]
    fn align_rounds_up() {
        for mut reader in both_readers() {
            reader.seek(3).unwrap();
            reader.align(8).unwrap();
            assert_eq!(reader.position(), 8);
            reader.align(8).unwrap();
            assert_eq!(reader.position(), 8);
        }
    }

    #[test]
    fn reads_past_the_end_fail() {
        for mut reader in both_readers() {
            reader.seek(60).unwrap();
            assert_eq!(reader.read(8).unwrap_err(), Error::Truncated);
            assert!(reader.seek(65).is_err());
        }
    }

    #[test]
    fn four_byte_offsets_normalize_the_sentinel() {
        let mut reader = Reader::from_bytes(vec![0xFF, 0xFF, 0xFF, 0xFF, 0x2A, 0, 0, 0]);
        reader.initialize(4, 4).unwrap();
        assert_eq!(reader.offset().unwrap(), UNDEFINED_ADDRESS);
        assert_eq!(reader.length().unwrap(), 42);
    }

    #[test]
    fn stream_is_independent() {
        for mut reader in both_readers() {
            reader.seek(8).unwrap();
            let mut sub = reader.stream(4).unwrap();
            assert_eq!(reader.position(), 12);
            assert_eq!(sub.position(), 0);
            assert_eq!(sub.read(4).unwrap(), &[8, 9, 10, 11]);
            assert!(sub.byte().is_err());
        }
    }

    #[test]
    fn windowed_matches_buffered_across_window_boundaries() {
        let big: Vec<u8> = (0u32..2048).map(|i| (i * 7) as u8).collect();
        let mut buffered = Reader::from_bytes(big.clone());
        let mut windowed = Reader::from_source(Box::new(Cursor::new(big))).unwrap();
        for pos in &[0u64, 200, 255, 256, 511, 1024, 2040] {
            buffered.seek(*pos).unwrap();
            windowed.seek(*pos).unwrap();
            assert_eq!(buffered.read(8).unwrap(), windowed.read(8).unwrap());
        }
        // Larger than the window in one read.
        buffered.seek(100).unwrap();
        windowed.seek(100).unwrap();
        assert_eq!(buffered.read(1000).unwrap(), windowed.read(1000).unwrap());
    }

    #[test]
    fn strings_strip_trailing_nuls() {
        let mut reader = Reader::from_bytes(b"name\0\0\0\0rest\0".to_vec());
        assert_eq!(reader.string(8, CharacterSet::Utf8).unwrap(), "name");
        assert_eq!(reader.nul_string(CharacterSet::Ascii).unwrap(), "rest");
        assert_eq!(reader.position(), 13);
    }

    #[test]
    fn size_counts_to_the_terminator() {
        let mut reader = Reader::from_bytes(b"abc\0def".to_vec());
        assert_eq!(reader.size(0).unwrap(), 3);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn float16_reference_vectors() {
        let cases: &[(u16, f32)] = &[
            (0x0000, 0.0),
            (0x3C00, 1.0),
            (0xC000, -2.0),
            (0x7BFF, 65504.0),
            (0x3555, 0.333_251_95),
            (0x0001, 5.960_464_5e-8), // smallest subnormal
            (0x03FF, 6.097_555_0e-5), // largest subnormal
            (0x0400, 6.103_515_6e-5), // smallest normal
        ];
        for (bits, expected) in cases {
            assert_eq!(decode_float16(*bits), *expected, "bits {:#06x}", bits);
        }
        assert_eq!(decode_float16(0x7C00), std::f32::INFINITY);
        assert_eq!(decode_float16(0xFC00), std::f32::NEG_INFINITY);
        assert!(decode_float16(0x7C01).is_nan());
        assert!(decode_float16(0xFFFF).is_nan());
        let negative_zero = decode_float16(0x8000);
        assert_eq!(negative_zero, 0.0);
        assert!(negative_zero.is_sign_negative());
    }
}
