// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic Module Databases for Testing
//!
//! This intentionally doesn't share constants or encoding code with the
//! `callstack` crate, so that incorrect changes to the real format get
//! caught instead of round-tripping cleanly. It exists primarily as an
//! internal dev-dependency of the callstack workspace, but is published
//! for the sake of satisfying cargo-publish.
//!
//! Basic usage is to build up a [SynthDb][] with its chainable methods and
//! then `finish()` to get the bytes, which can be written to disk or fed
//! directly to the `callstack` or `callstack-resolver` crates.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use test_assembler::*;

/// The tag a real Linux capture writes. Spelled out here on purpose.
const TAG: &[u8] = b"LNUXCALL";

/// A writer of synthetic module databases.
pub struct SynthDb {
    /// The `Section` containing the database contents.
    section: Section,
}

impl SynthDb {
    /// Create a `SynthDb` opening with the genuine platform tag.
    pub fn new() -> SynthDb {
        SynthDb::with_tag(TAG)
    }

    /// Create a `SynthDb` opening with arbitrary leading bytes, for testing
    /// tag rejection.
    pub fn with_tag(tag: &[u8]) -> SynthDb {
        SynthDb {
            section: Section::new().append_bytes(tag),
        }
    }

    /// Append one well-formed record line.
    pub fn add_record(
        self,
        address: u64,
        lookup_address: u64,
        module: &str,
        symbol: &str,
    ) -> SynthDb {
        let line = format!("{:x} {:x} {} {}\n", address, lookup_address, module, symbol);
        SynthDb {
            section: self.section.append_bytes(line.as_bytes()),
        }
    }

    /// Append `line` verbatim, newline-terminated. The line doesn't have to
    /// be a valid record.
    pub fn add_raw_line(self, line: &str) -> SynthDb {
        SynthDb {
            section: self
                .section
                .append_bytes(line.as_bytes())
                .append_bytes(b"\n"),
        }
    }

    /// Append raw bytes with no terminator, for truncation and
    /// encoding-error tests.
    pub fn add_raw_bytes(self, bytes: &[u8]) -> SynthDb {
        SynthDb {
            section: self.section.append_bytes(bytes),
        }
    }

    /// Finish generating the synthetic database and get the contents.
    pub fn finish(self) -> Option<Vec<u8>> {
        self.section.get_contents()
    }
}

impl Default for SynthDb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_synth_db_layout() {
        let bytes = SynthDb::new()
            .add_record(0x1000, 0x10, "/bin/a", "f")
            .finish()
            .unwrap();
        assert_eq!(&bytes[..8], b"LNUXCALL");
        assert_eq!(&bytes[8..], b"1000 10 /bin/a f\n");
    }

    #[test]
    fn test_with_tag_replaces_prefix() {
        let bytes = SynthDb::with_tag(b"XX").finish().unwrap();
        assert_eq!(bytes, b"XX");
    }
}
