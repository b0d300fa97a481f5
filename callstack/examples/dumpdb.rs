// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::env;
use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;

use callstack::*;

const USAGE: &str = "Usage: dumpdb [-v] <database>
Print the records of a module database exported from a captured process.

Options:
  -v  Also print modules and load-relative addresses";

#[derive(PartialEq)]
enum Verbose {
    Yes,
    No,
}

fn print_db_records<T: AsRef<Path>>(path: T, verbose: Verbose) {
    let db = ModuleDb::read_path(path.as_ref()).unwrap();
    for record in &db {
        if verbose == Verbose::Yes {
            println!(
                "{:#018x} ({} + {:#x}) {}",
                record.address, record.module, record.lookup_address, record.symbol
            );
        } else {
            println!("{:#018x} {}", record.address, record.symbol);
        }
    }
}

#[cfg_attr(test, allow(dead_code))]
fn main() {
    let mut verbose = Verbose::No;
    let mut stderr = std::io::stderr();
    for arg in env::args_os().skip(1) {
        if arg == OsStr::new("-v") {
            verbose = Verbose::Yes;
        } else if arg.to_str().map(|s| s.starts_with('-')).unwrap_or(false) {
            writeln!(&mut stderr, "Unknown argument {:?}", arg).unwrap();
            break;
        } else {
            return print_db_records(arg, verbose);
        }
    }
    writeln!(&mut stderr, "{}", USAGE).unwrap();
}
