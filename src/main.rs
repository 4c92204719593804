//! Prints the tree of an HDF5 file: groups, dataset shapes and types,
//! and attributes.

use std::process::exit;

use hdf5_reader::{Error, Group};

fn main() {
    let path = match std::env::args().nth(1) {
        Some(path) => path,
        None => {
            eprintln!("usage: hdf5-reader <file>");
            exit(2);
        }
    };
    match hdf5_reader::open(&path) {
        Ok(Some(file)) => {
            if let Err(e) = print_group(&file.root(), 0) {
                eprintln!("error reading {}: {}", path, e);
                exit(1);
            }
        }
        Ok(None) => {
            eprintln!("{} is not an HDF5 file", path);
            exit(1);
        }
        Err(e) => {
            eprintln!("error opening {}: {}", path, e);
            exit(1);
        }
    }
}

fn print_group(group: &Group, depth: usize) -> Result<(), Error> {
    let indent = "  ".repeat(depth);
    let label = if group.path().is_empty() {
        "/"
    } else {
        group.name()
    };
    match group.value()? {
        Some(variable) => println!(
            "{}{}  {:?} {:?}",
            indent,
            label,
            variable.dtype(),
            variable.shape()
        ),
        None => println!("{}{}/", indent, label),
    }
    for (name, value) in group.attributes()?.iter() {
        println!("{}  @{} = {:?}", indent, name, value);
    }
    for (_, child) in group.groups()? {
        print_group(&child, depth + 1)?;
    }
    Ok(())
}
