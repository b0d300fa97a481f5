// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Building a queryable address map out of a module database.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use callstack::{DbRecord, Records, UNKNOWN_MARKER};
use tracing::{debug, warn};

use crate::tool::{parse_tool_output, LineResolver, ParsedLine};

/// Fully resolved details for one address.
///
/// Fields are never empty: whatever the resolver tool couldn't answer is
/// filled from the capture-time facts instead (raw exported symbol for the
/// function, module path for the file), and only the line number has a
/// true "unknown" value of `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDetails {
    pub function: String,
    pub file: String,
    pub line: i64,
}

impl AddressDetails {
    /// The sentinel returned for addresses that were never captured:
    /// `"??"` / `"??"` / `-1`.
    pub fn unknown() -> AddressDetails {
        AddressDetails {
            function: UNKNOWN_MARKER.to_string(),
            file: UNKNOWN_MARKER.to_string(),
            line: -1,
        }
    }
}

/// Errors that prevent a [`Resolver`] from being built at all.
///
/// Tool failures are deliberately absent here; they degrade single
/// addresses and are only logged.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BuildError {
    #[error(transparent)]
    Format(#[from] callstack::Error),
    #[error("Resolve pass cancelled from the progress callback")]
    Cancelled,
}

impl BuildError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            BuildError::Format(err) => err.name(),
            BuildError::Cancelled => "Cancelled",
        }
    }
}

/// A read-only map from address to [`AddressDetails`] for one analysis
/// session.
///
/// Build one from the bytes of a module database with
/// [`Resolver::build`], then hand out [`query`][Resolver::query] results
/// from as many threads as you like.
#[derive(Debug, Default)]
pub struct Resolver {
    details: HashMap<u64, AddressDetails>,
}

impl Resolver {
    /// Build a `Resolver` from the bytes of a module database.
    ///
    /// The tag is validated first; a foreign database is rejected without
    /// resolving anything. After that every unique address costs one
    /// `tool` query (duplicate records are ignored, first occurrence
    /// wins) and tool failures degrade just that address to its fallback
    /// details.
    ///
    /// `progress`, if given, is called after each record with a
    /// non-decreasing value in `[0, 1]` derived from bytes consumed;
    /// trailing bytes that scan to no record are reported too, so the
    /// final value is `1.0` whenever the database held any record.
    /// Returning `false` from it abandons the build.
    pub async fn build(
        bytes: &[u8],
        tool: &dyn LineResolver,
        mut progress: Option<&mut dyn FnMut(f32) -> bool>,
    ) -> Result<Resolver, BuildError> {
        let mut records = Records::new(bytes)?;
        let total = records.total_bytes() as f32;

        let mut details = HashMap::new();
        let mut reported = 0;
        while let Some(record) = records.next() {
            match details.entry(record.address) {
                Entry::Vacant(slot) => {
                    slot.insert(resolve_record(&record, tool).await);
                }
                Entry::Occupied(_) => {
                    debug!("skipping duplicate record for {:#x}", record.address);
                }
            }

            if let Some(callback) = progress.as_mut() {
                reported = records.bytes_consumed();
                let done = (reported as f32 / total).min(1.0);
                if !callback(done) {
                    return Err(BuildError::Cancelled);
                }
            }
        }

        // The last next() can consume skipped or unterminated lines on its
        // way to the end of the buffer. Those bytes haven't been reported
        // yet, so the scan wouldn't otherwise finish at 1.0.
        if let Some(callback) = progress.as_mut() {
            if !details.is_empty() && reported < records.bytes_consumed() {
                let done = (records.bytes_consumed() as f32 / total).min(1.0);
                if !callback(done) {
                    return Err(BuildError::Cancelled);
                }
            }
        }

        Ok(Resolver { details })
    }

    /// Resolved details for `address`.
    ///
    /// Addresses that weren't in the database come back as
    /// [`AddressDetails::unknown`]; this never fails.
    pub fn query(&self, address: u64) -> AddressDetails {
        self.details
            .get(&address)
            .cloned()
            .unwrap_or_else(AddressDetails::unknown)
    }

    /// Every resolved address and its details, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &AddressDetails)> + '_ {
        self.details.iter().map(|(&address, details)| (address, details))
    }

    /// Number of unique addresses resolved.
    pub fn len(&self) -> usize {
        self.details.len()
    }

    pub fn is_empty(&self) -> bool {
        self.details.is_empty()
    }
}

/// Resolve one record through the tool, falling back field by field to
/// what the capture already knew.
async fn resolve_record(record: &DbRecord, tool: &dyn LineResolver) -> AddressDetails {
    let parsed = match tool.resolve(&record.module, record.lookup_address).await {
        Ok(text) => parse_tool_output(&text),
        Err(err) => {
            warn!(
                "{} - couldn't resolve {} {:#x}: {}",
                err.name(),
                record.module,
                record.lookup_address,
                err
            );
            ParsedLine::default()
        }
    };

    AddressDetails {
        function: parsed.function.unwrap_or_else(|| record.symbol.clone()),
        file: parsed.file.unwrap_or_else(|| record.module.clone()),
        line: parsed.line.unwrap_or(-1),
    }
}
