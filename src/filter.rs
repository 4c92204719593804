//! Per-chunk filter application. DEFLATE is delegated to the zlib
//! inflater; LZF is decoded natively in two passes.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::error::Error;
use crate::header::{FilterPipeline, FILTER_DEFLATE, FILTER_LZF};

type Result<T> = std::result::Result<T, Error>;

/// Reject pipelines containing a filter this reader cannot invert,
/// before any chunk is decoded.
pub fn validate(pipeline: &FilterPipeline) -> Result<()> {
    for filter in &pipeline.filters {
        match filter.id {
            FILTER_DEFLATE | FILTER_LZF => {}
            id => {
                return Err(Error::UnsupportedFilter {
                    id,
                    name: filter.name.clone(),
                })
            }
        }
    }
    Ok(())
}

/// Run one chunk through the pipeline in filter order. Bit `i` of the
/// chunk's filter mask skips filter `i`.
pub fn apply(pipeline: &FilterPipeline, filter_mask: u32, mut data: Vec<u8>) -> Result<Vec<u8>> {
    for (i, filter) in pipeline.filters.iter().enumerate() {
        if (filter_mask >> i) & 1 == 1 {
            continue;
        }
        data = match filter.id {
            FILTER_DEFLATE => inflate(&data)?,
            FILTER_LZF => lzf_decompress(&data)?,
            id => {
                return Err(Error::UnsupportedFilter {
                    id,
                    name: filter.name.clone(),
                })
            }
        };
    }
    Ok(data)
}

/// The external inflater: a chunk compressed with the DEFLATE filter is
/// one zlib stream.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut output)
        .map_err(|_| Error::CorruptedCompressedData("invalid deflate stream"))?;
    Ok(output)
}

/// Walk the LZF stream without producing output, returning the decoded
/// length so the copy pass can allocate once.
fn lzf_decompressed_size(input: &[u8]) -> Result<usize> {
    let mut i = 0usize;
    let mut produced = 0usize;
    while i < input.len() {
        let control = input[i] as usize;
        i += 1;
        if control < 32 {
            let run = control + 1;
            if i + run > input.len() {
                return Err(Error::CorruptedCompressedData("literal run past end of input"));
            }
            i += run;
            produced += run;
        } else {
            let mut length = control >> 5;
            if length == 7 {
                length += *input
                    .get(i)
                    .ok_or(Error::CorruptedCompressedData("truncated length byte"))?
                    as usize;
                i += 1;
            }
            length += 2;
            let low = *input
                .get(i)
                .ok_or(Error::CorruptedCompressedData("truncated offset byte"))?
                as usize;
            i += 1;
            let offset = ((control & 0x1F) << 8 | low) + 1;
            if offset > produced {
                return Err(Error::CorruptedCompressedData(
                    "back-reference before start of output",
                ));
            }
            produced += length;
        }
    }
    Ok(produced)
}

/// Native LZF decoder. Control bytes below 32 start a literal run of
/// `control + 1` bytes; anything else is a back-reference whose length
/// lives in the top three bits (with an extension byte at 7) and whose
/// offset spans the low five bits plus one more byte.
pub fn lzf_decompress(input: &[u8]) -> Result<Vec<u8>> {
    let size = lzf_decompressed_size(input)?;
    let mut output = Vec::with_capacity(size);
    let mut i = 0usize;
    while i < input.len() {
        let control = input[i] as usize;
        i += 1;
        if control < 32 {
            let run = control + 1;
            output.extend_from_slice(&input[i..i + run]);
            i += run;
        } else {
            let mut length = control >> 5;
            if length == 7 {
                length += input[i] as usize;
                i += 1;
            }
            length += 2;
            let offset = ((control & 0x1F) << 8 | input[i] as usize) + 1;
            i += 1;
            let start = output.len() - offset;
            // Byte-by-byte so an overlapping reference expands the run it
            // is still writing.
            for k in 0..length {
                let b = output[start + k];
                output.push(b);
            }
        }
    }
    debug_assert_eq!(output.len(), size);
    Ok(output)
}
