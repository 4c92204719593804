//! Dataset payload materialization: compact bytes are returned inline,
//! contiguous spans are read in one piece, chunked storage walks the v1
//! chunk B-tree, decodes each tile through the filter pipeline and
//! scatters it into a dense row-major buffer.

use crate::error::Error;
use crate::filter;
use crate::header::{DataLayout, Dataspace, Datatype, FilterPipeline};
use crate::parse::walk_chunk_btree;
use crate::reader::{is_defined, to_usize, Reader};

type Result<T> = std::result::Result<T, Error>;

/// Produce the dataset's flat byte buffer in natural row-major element
/// order.
pub fn materialize(
    reader: &mut Reader,
    layout: &DataLayout,
    datatype: &Datatype,
    dataspace: &Dataspace,
    pipeline: Option<&FilterPipeline>,
    offset_size: u8,
) -> Result<Vec<u8>> {
    match layout {
        DataLayout::Compact { data } => Ok(data.clone()),
        DataLayout::Contiguous { address, size } => {
            if !is_defined(*address) {
                return Ok(Vec::new());
            }
            let byte_len = match size {
                Some(size) => *size,
                // Legacy layouts do not store the span length.
                None => dataspace.element_count() * u64::from(datatype.size),
            };
            reader.read_at(*address, to_usize(byte_len)?)
        }
        DataLayout::Chunked {
            btree_address,
            chunk_shape,
            item_size,
        } => read_chunked(
            reader,
            *btree_address,
            chunk_shape,
            *item_size,
            dataspace,
            pipeline,
            offset_size,
        ),
    }
}

fn read_chunked(
    reader: &mut Reader,
    btree_address: u64,
    chunk_shape: &[u32],
    item_size: u32,
    dataspace: &Dataspace,
    pipeline: Option<&FilterPipeline>,
    offset_size: u8,
) -> Result<Vec<u8>> {
    let data_shape = &dataspace.dimensions;
    if chunk_shape.len() != data_shape.len() {
        return Err(Error::CorruptedCompressedData(
            "chunk shape rank does not match the dataspace",
        ));
    }
    let item_size = to_usize(u64::from(item_size))?;
    let total = to_usize(dataspace.element_count())?
        .checked_mul(item_size)
        .ok_or(Error::IntegerOverflow)?;
    let mut output = vec![0u8; total];

    // A dataset that never had a chunk written has no index; every slot
    // keeps its zero-initialized state. A null dataspace has no slots.
    if !is_defined(btree_address) || total == 0 {
        return Ok(output);
    }
    if let Some(pipeline) = pipeline {
        filter::validate(pipeline)?;
    }

    let chunk_shape: Vec<u64> = chunk_shape.iter().map(|d| u64::from(*d)).collect();
    let chunk_len = to_usize(chunk_shape.iter().product::<u64>())?
        .checked_mul(item_size)
        .ok_or(Error::IntegerOverflow)?;

    // The on-disk keys carry one extra trailing axis for the element
    // size; entries were parsed with that dimensionality.
    let entries = walk_chunk_btree(reader, btree_address, chunk_shape.len() + 1, offset_size)?;
    for entry in entries {
        let stored = reader.read_at(entry.child, entry.size as usize)?;
        let chunk = match pipeline {
            Some(pipeline) => filter::apply(pipeline, entry.filter_mask, stored)?,
            None => stored,
        };
        if chunk.len() < chunk_len {
            return Err(Error::Truncated);
        }
        let chunk_offset = &entry.offsets[..chunk_shape.len()];
        scatter_chunk(
            &chunk,
            &chunk_shape,
            chunk_offset,
            data_shape,
            item_size,
            &mut output,
        )?;
    }
    Ok(output)
}

/// Copy one chunk's elements into the dense output. The chunk is
/// traversed in row-major order with a right-to-left carry; positions
/// outside the dataset extent (boundary chunks may overhang) are
/// skipped.
pub fn scatter_chunk(
    chunk: &[u8],
    chunk_shape: &[u64],
    chunk_offset: &[u64],
    data_shape: &[u64],
    item_size: usize,
    output: &mut [u8],
) -> Result<()> {
    let rank = chunk_shape.len();
    if rank == 0 {
        output[..item_size].copy_from_slice(&chunk[..item_size]);
        return Ok(());
    }

    let mut data_strides = vec![1u64; rank];
    for i in (0..rank - 1).rev() {
        data_strides[i] = data_strides[i + 1]
            .checked_mul(data_shape[i + 1])
            .ok_or(Error::IntegerOverflow)?;
    }

    let element_count = chunk_shape.iter().product::<u64>();
    let mut chunk_pos = vec![0u64; rank];
    for index in 0..element_count {
        let mut in_bounds = true;
        let mut data_index = 0u64;
        for i in 0..rank {
            let pos = chunk_offset[i] + chunk_pos[i];
            if pos >= data_shape[i] {
                in_bounds = false;
                break;
            }
            data_index += pos * data_strides[i];
        }
        if in_bounds {
            let src = to_usize(index)? * item_size;
            let dst = to_usize(data_index)? * item_size;
            output[dst..dst + item_size].copy_from_slice(&chunk[src..src + item_size]);
        }
        for i in (0..rank).rev() {
            chunk_pos[i] += 1;
            if chunk_pos[i] < chunk_shape[i] {
                break;
            }
            chunk_pos[i] = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Index-decomposition oracle: recover each chunk position by
    /// div/mod instead of the carry loop.
    fn scatter_oracle(
        chunk: &[u8],
        chunk_shape: &[u64],
        chunk_offset: &[u64],
        data_shape: &[u64],
        item_size: usize,
        output: &mut [u8],
    ) {
        let rank = chunk_shape.len();
        let count: u64 = chunk_shape.iter().product();
        for index in 0..count {
            let mut remainder = index;
            let mut chunk_pos = vec![0u64; rank];
            for i in (0..rank).rev() {
                chunk_pos[i] = remainder % chunk_shape[i];
                remainder /= chunk_shape[i];
            }
            let data_pos: Vec<u64> = chunk_pos
                .iter()
                .zip(chunk_offset)
                .map(|(p, o)| p + o)
                .collect();
            if data_pos.iter().zip(data_shape).any(|(p, d)| p >= d) {
                continue;
            }
            let mut data_index = 0u64;
            for (p, d) in data_pos.iter().zip(data_shape) {
                data_index = data_index * d + p;
            }
            let src = index as usize * item_size;
            let dst = data_index as usize * item_size;
            output[dst..dst + item_size].copy_from_slice(&chunk[src..src + item_size]);
        }
    }

    fn check_against_oracle(
        chunk_shape: &[u64],
        chunk_offset: &[u64],
        data_shape: &[u64],
        item_size: usize,
    ) {
        let chunk_elements: u64 = chunk_shape.iter().product();
        let chunk: Vec<u8> = (0..chunk_elements as usize * item_size)
            .map(|i| (i % 251 + 1) as u8)
            .collect();
        let total = data_shape.iter().product::<u64>() as usize * item_size;
        let mut actual = vec![0u8; total];
        let mut expected = vec![0u8; total];
        scatter_chunk(&chunk, chunk_shape, chunk_offset, data_shape, item_size, &mut actual)
            .unwrap();
        scatter_oracle(&chunk, chunk_shape, chunk_offset, data_shape, item_size, &mut expected);
        assert_eq!(actual, expected);
    }

    #[test]
    fn scatter_matches_the_oracle() {
        check_against_oracle(&[2, 2], &[0, 0], &[4, 4], 1);
        check_against_oracle(&[2, 2], &[2, 2], &[4, 4], 4);
        check_against_oracle(&[3, 2, 4], &[3, 2, 4], &[5, 5, 5], 2);
        check_against_oracle(&[8], &[8], &[16], 8);
    }

    #[test]
    fn boundary_chunks_keep_out_of_bounds_slots_zero() {
        // 3-wide data, 2-wide chunks: the second chunk overhangs by one.
        let chunk = [10u8, 20];
        let mut output = vec![0u8; 3];
        scatter_chunk(&chunk, &[2], &[2], &[3], 1, &mut output).unwrap();
        assert_eq!(output, [0, 0, 10]);
    }

    #[test]
    fn interior_chunk_lands_at_its_offset() {
        let chunk = [1u8, 2, 3, 4];
        let mut output = vec![0u8; 16];
        scatter_chunk(&chunk, &[2, 2], &[2, 0], &[4, 4], 1, &mut output).unwrap();
        assert_eq!(
            output,
            [0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0]
        );
    }

    #[test]
    fn scalar_chunk_copies_one_element() {
        let chunk = [7u8, 8];
        let mut output = vec![0u8; 2];
        scatter_chunk(&chunk, &[], &[], &[], 2, &mut output).unwrap();
        assert_eq!(output, [7, 8]);
    }
}
