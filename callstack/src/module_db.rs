// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The serialized module database format.
//!
//! A module database is the portable form of a [`SymbolCache`]: an 8-byte
//! platform tag followed by one text line per captured address. The format
//! carries no record count and no escaping, so a blob can be appended to a
//! capture artifact and scanned later with nothing but a newline search.
//! Lines that don't scan are individually skipped; only a missing or
//! foreign tag rejects the whole blob.
//!
//! [`SymbolCache`]: crate::SymbolCache

use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::str;
use tracing::warn;

/// The 8-byte tag opening every module database this crate produces.
///
/// The tag names the producing platform. A database carrying any other
/// leading bytes was captured by something else and is rejected wholesale
/// rather than half-parsed.
pub const FORMAT_TAG: [u8; 8] = *b"LNUXCALL";

/// Errors encountered while reading a module database.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("File not found")]
    FileNotFound,
    #[error("I/O error")]
    IoError,
    #[error("Missing module database tag (empty database?)")]
    MissingTag,
    #[error("Module database tag mismatch")]
    UnsupportedFormat,
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::FileNotFound => "FileNotFound",
            Error::IoError => "IoError",
            Error::MissingTag => "MissingTag",
            Error::UnsupportedFormat => "UnsupportedFormat",
        }
    }
}

/// One record of a module database: a captured address plus everything a
/// different machine needs to symbolicate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRecord {
    /// The raw address as captured.
    pub address: u64,
    /// The load-relative address to hand to the external resolver tool.
    pub lookup_address: u64,
    /// Path of the module `address` fell in, or `"??"`.
    pub module: String,
    /// The nearest exported symbol name, or `"??"`.
    pub symbol: String,
}

/// A streaming reader over the records of a module database.
///
/// The tag is validated up front by [`Records::new`]; after that each call
/// to `next` scans one line. Malformed lines (wrong field count, bad hex,
/// not UTF-8, or a final line cut off before its newline) are skipped with
/// a logged warning so one corrupt record can't poison the rest of the
/// scan.
///
/// [`bytes_consumed`] reports how far the scan has advanced, which callers
/// use to derive progress.
///
/// [`bytes_consumed`]: Records::bytes_consumed
#[derive(Debug, Clone)]
pub struct Records<'a> {
    rest: &'a [u8],
    total: usize,
    consumed: usize,
}

impl<'a> Records<'a> {
    /// Start scanning `bytes` as a module database.
    ///
    /// Fails immediately if the tag is missing or belongs to some other
    /// producer; no records are parsed in that case.
    pub fn new(bytes: &'a [u8]) -> Result<Records<'a>, Error> {
        if bytes.len() < FORMAT_TAG.len() {
            return Err(Error::MissingTag);
        }
        let (tag, rest) = bytes.split_at(FORMAT_TAG.len());
        if tag != FORMAT_TAG {
            warn!("Unrecognized module database tag. Possibly from another platform?");
            return Err(Error::UnsupportedFormat);
        }
        Ok(Records {
            rest,
            total: bytes.len(),
            consumed: FORMAT_TAG.len(),
        })
    }

    /// Bytes of the database consumed so far, tag and skipped lines
    /// included. Non-decreasing across calls to `next`.
    pub fn bytes_consumed(&self) -> usize {
        self.consumed
    }

    /// Total size of the database in bytes.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Scan one line as a record. Exactly four whitespace-separated fields,
    /// the first two hex; anything else is malformed.
    fn parse_line(line: &[u8]) -> Option<DbRecord> {
        let line = str::from_utf8(line).ok()?;
        let mut fields = line.split_whitespace();
        let address = u64::from_str_radix(fields.next()?, 16).ok()?;
        let lookup_address = u64::from_str_radix(fields.next()?, 16).ok()?;
        let module = fields.next()?.to_string();
        let symbol = fields.next()?.to_string();
        if fields.next().is_some() {
            return None;
        }
        Some(DbRecord {
            address,
            lookup_address,
            module,
            symbol,
        })
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = DbRecord;

    fn next(&mut self) -> Option<DbRecord> {
        while !self.rest.is_empty() {
            let line = match self.rest.iter().position(|&b| b == b'\n') {
                Some(idx) => {
                    let line = &self.rest[..idx];
                    self.consumed += idx + 1;
                    self.rest = &self.rest[idx + 1..];
                    line
                }
                None => {
                    // The writer was interrupted mid-line; nothing usable here.
                    warn!(
                        "ModuleDb: dropping unterminated trailing line: {}",
                        String::from_utf8_lossy(self.rest)
                    );
                    self.consumed += self.rest.len();
                    self.rest = &[];
                    return None;
                }
            };

            match Self::parse_line(line) {
                Some(record) => return Some(record),
                None => {
                    warn!(
                        "ModuleDb: can't parse line: {}",
                        String::from_utf8_lossy(line)
                    );
                }
            }
        }
        None
    }
}

/// A fully parsed module database.
///
/// This is the eager counterpart to [`Records`], for callers that just want
/// the record list. It can be read from raw bytes with
/// [`parse`][ModuleDb::parse] or from a file with
/// [`read_path`][ModuleDb::read_path].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDb {
    records: Vec<DbRecord>,
}

impl ModuleDb {
    /// Parse a whole module database out of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<ModuleDb, Error> {
        let records = Records::new(bytes)?.collect();
        Ok(ModuleDb { records })
    }

    /// Read a `ModuleDb` from a `Path` to a file on disk.
    pub fn read_path<P>(path: P) -> Result<ModuleDb, Error>
    where
        P: AsRef<Path>,
    {
        let f = File::open(path).or(Err(Error::FileNotFound))?;
        let mmap = unsafe { Mmap::map(&f).or(Err(Error::IoError))? };
        ModuleDb::parse(&mmap)
    }

    /// The records, in the order they appeared in the blob.
    pub fn records(&self) -> &[DbRecord] {
        &self.records
    }

    /// Number of records that survived the scan.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DbRecord> {
        self.records.iter()
    }
}

impl<'a> IntoIterator for &'a ModuleDb {
    type Item = &'a DbRecord;
    type IntoIter = std::slice::Iter<'a, DbRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use callstack_synth::SynthDb;

    fn parse_synth_db(db: SynthDb) -> Result<ModuleDb, Error> {
        ModuleDb::parse(&db.finish().unwrap())
    }

    #[test]
    fn test_empty_db() {
        let db = parse_synth_db(SynthDb::new()).unwrap();
        assert!(db.is_empty());
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn test_simple_records() {
        let db = parse_synth_db(
            SynthDb::new()
                .add_record(0x7f00deadbeef, 0xdeadbeef, "/usr/lib/libc.so.6", "malloc")
                .add_record(0x400123, 0x123, "/opt/app/app", "main"),
        )
        .unwrap();

        assert_eq!(db.len(), 2);
        assert_eq!(
            db.records()[0],
            DbRecord {
                address: 0x7f00deadbeef,
                lookup_address: 0xdeadbeef,
                module: "/usr/lib/libc.so.6".to_string(),
                symbol: "malloc".to_string(),
            }
        );
        assert_eq!(db.records()[1].address, 0x400123);
        assert_eq!(db.records()[1].symbol, "main");
    }

    #[test]
    fn test_foreign_tag_rejected() {
        let synth = SynthDb::with_tag(b"WINDCALL").add_record(0x1000, 0x10, "/bin/a", "f");
        assert_eq!(parse_synth_db(synth), Err(Error::UnsupportedFormat));
    }

    #[test]
    fn test_short_input_rejected() {
        assert_eq!(ModuleDb::parse(b"LNUX"), Err(Error::MissingTag));
        assert_eq!(ModuleDb::parse(b""), Err(Error::MissingTag));
    }

    #[test]
    fn test_tag_only_is_valid() {
        assert_eq!(ModuleDb::parse(b"LNUXCALL").unwrap().len(), 0);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let db = parse_synth_db(
            SynthDb::new()
                .add_record(0x1000, 0x10, "/bin/a", "f")
                .add_raw_line("1234 56")
                .add_raw_line("zzzz yyyy /bin/b g")
                .add_raw_line("1 2 /bin/c h extra-field")
                .add_raw_line("")
                .add_record(0x2000, 0x20, "/bin/d", "i"),
        )
        .unwrap();

        assert_eq!(db.len(), 2);
        assert_eq!(db.records()[0].module, "/bin/a");
        assert_eq!(db.records()[1].module, "/bin/d");
    }

    #[test]
    fn test_non_utf8_line_skipped() {
        let db = parse_synth_db(
            SynthDb::new()
                .add_raw_bytes(b"1000 10 /bin/\xff f\n")
                .add_record(0x2000, 0x20, "/bin/b", "g"),
        )
        .unwrap();

        assert_eq!(db.len(), 1);
        assert_eq!(db.records()[0].module, "/bin/b");
    }

    #[test]
    fn test_unterminated_tail_dropped() {
        let db = parse_synth_db(
            SynthDb::new()
                .add_record(0x1000, 0x10, "/bin/a", "f")
                .add_raw_bytes(b"2000 20 /bin/b"),
        )
        .unwrap();

        assert_eq!(db.len(), 1);
        assert_eq!(db.records()[0].address, 0x1000);
    }

    #[test]
    fn test_bytes_consumed_is_monotonic() {
        let bytes = SynthDb::new()
            .add_record(0x1000, 0x10, "/bin/a", "f")
            .add_raw_line("not a record")
            .add_record(0x2000, 0x20, "/bin/b", "g")
            .finish()
            .unwrap();

        let mut records = Records::new(&bytes).unwrap();
        assert_eq!(records.total_bytes(), bytes.len());
        assert_eq!(records.bytes_consumed(), FORMAT_TAG.len());

        let mut last = records.bytes_consumed();
        while let Some(_record) = records.next() {
            assert!(records.bytes_consumed() >= last);
            last = records.bytes_consumed();
        }
        assert_eq!(records.bytes_consumed(), bytes.len());
    }

    #[test]
    fn test_whitespace_runs_tolerated() {
        // Multiple separators between fields still scan as four fields.
        let db = parse_synth_db(SynthDb::new().add_raw_line("1000  10\t/bin/a   f")).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.records()[0].lookup_address, 0x10);
    }

    #[test]
    fn test_read_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modules.db");
        std::fs::write(
            &path,
            SynthDb::new()
                .add_record(0x1000, 0x10, "/bin/a", "f")
                .finish()
                .unwrap(),
        )
        .unwrap();

        let db = ModuleDb::read_path(&path).unwrap();
        assert_eq!(db.len(), 1);

        assert_eq!(
            ModuleDb::read_path(dir.path().join("no-such.db")),
            Err(Error::FileNotFound)
        );
    }
}
