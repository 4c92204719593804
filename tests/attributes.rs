//! Attribute decoding: a UTF-8 variable-length string attribute resolved
//! through the global heap, and an enumerated `{FALSE,TRUE}` dataset
//! surfacing as boolean.

mod common;

use common::*;
use hdf5_reader::{Hdf5Dtype, Hdf5File, Value};

/// Datatype body: variable-length string, UTF-8 character set.
fn varlen_string_body() -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0x19); // version 1, class 9
    body.extend_from_slice(&0x000101u32.to_le_bytes()[..3]); // string, UTF-8
    body.extend_from_slice(&16u32.to_le_bytes()); // length + heap id
    body
}

/// Datatype body: enumeration of `{FALSE,TRUE} = {0,1}` over int8.
fn boolean_enum_body() -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0x18); // version 1, class 8
    body.extend_from_slice(&2u32.to_le_bytes()[..3]); // two members
    body.extend_from_slice(&1u32.to_le_bytes());
    body.extend_from_slice(&fixed_point_body(1, true));
    body.extend_from_slice(b"FALSE\0\0\0");
    body.extend_from_slice(b"TRUE\0\0\0\0");
    body.push(0);
    body.push(1);
    body
}

fn attributes_file() -> Vec<u8> {
    let text = "grüße, welt";
    let mut w = Writer::new();
    w.zeros(96); // superblock, patched last

    let mut heap_object = text.as_bytes().to_vec();
    heap_object.push(0);
    let global = global_heap(&mut w, &heap_object);

    let flag_data = w.pos();
    w.bytes(&[1, 0]);
    let flag_header = v1_object_header(
        &mut w,
        &[
            (MESSAGE_DATATYPE, boolean_enum_body()),
            (MESSAGE_DATASPACE, dataspace_v1_body(&[2])),
            (MESSAGE_DATA_LAYOUT, contiguous_layout_body(flag_data, 2)),
        ],
    );

    let heap = local_heap(&mut w, b"\0flag\0");
    let snod = symbol_table_node(&mut w, &[(1, flag_header)]);
    let btree = group_btree(&mut w, &[snod]);

    let mut attribute_data = Vec::new();
    attribute_data.extend_from_slice(&(heap_object.len() as u32).to_le_bytes());
    attribute_data.extend_from_slice(&global.to_le_bytes());
    attribute_data.extend_from_slice(&1u32.to_le_bytes());

    let mut symbol_table = Vec::new();
    symbol_table.extend_from_slice(&btree.to_le_bytes());
    symbol_table.extend_from_slice(&heap.to_le_bytes());
    let root_header = v1_object_header(
        &mut w,
        &[
            (MESSAGE_SYMBOL_TABLE, symbol_table),
            (
                MESSAGE_ATTRIBUTE,
                attribute_v1_body(
                    "note",
                    &varlen_string_body(),
                    &dataspace_v1_body(&[]),
                    &attribute_data,
                ),
            ),
        ],
    );

    v0_superblock(&mut w, root_header, btree, heap);
    w.buf
}

#[test]
fn variable_length_string_attribute_resolves_through_the_heap() {
    let file = Hdf5File::from_bytes(attributes_file()).unwrap().unwrap();
    let attributes = file.root().attributes().unwrap();
    // The stored bytes end with a NUL, which decoding strips.
    assert_eq!(
        attributes.get("note"),
        Some(&Value::String("grüße, welt".to_string()))
    );
    // Resolving again hits the cached collection and agrees.
    assert_eq!(file.root().attributes().unwrap(), attributes);
}

#[test]
fn false_true_enumeration_reads_as_boolean() {
    let file = Hdf5File::from_bytes(attributes_file()).unwrap().unwrap();
    let flag = file.root().group("flag").unwrap().expect("dataset flag");
    let variable = flag.value().unwrap().expect("flag is a dataset");
    assert_eq!(variable.dtype(), Hdf5Dtype::Boolean);
    assert_eq!(variable.shape(), &[2]);
    assert_eq!(
        variable.value().unwrap(),
        Value::Array(vec![Value::Bool(true), Value::Bool(false)])
    );
}
