// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The process-wide symbol cache.
//!
//! Capturing a stack is supposed to be cheap, so the only work done per
//! address is one [`SymbolLookup`] query the *first* time that address is
//! seen, asking the running process which module the address fell in and
//! what the nearest exported symbol was. Everything after that is a map
//! hit. The accumulated entries are what [`SymbolCache::export`] writes
//! into a capture artifact for offline resolution.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{trace, warn};

use crate::module_db::FORMAT_TAG;

/// The placeholder the toolchain uses for "don't know": unknown modules,
/// symbols, files, and functions all print as `??`.
pub const UNKNOWN_MARKER: &str = "??";

/// What the local lookup learned about one captured address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// The address relative to the load base of `module`, which is the
    /// address an offline resolver must be given.
    pub lookup_address: u64,
    /// Path of the module the address fell in, or `"??"`.
    pub module: String,
    /// The nearest exported symbol name, or `"??"`.
    pub symbol: String,
}

impl CacheEntry {
    fn placeholder(address: u64) -> CacheEntry {
        CacheEntry {
            lookup_address: address,
            module: UNKNOWN_MARKER.to_string(),
            symbol: UNKNOWN_MARKER.to_string(),
        }
    }
}

/// Process-local address lookup, the source of new cache entries.
///
/// The real implementation asks the dynamic linker (see [`DladdrLookup`]);
/// tests substitute synthetic lookups.
pub trait SymbolLookup {
    /// Locate `address` within the running process, or `None` if it falls
    /// outside every loaded module.
    fn locate(&self, address: u64) -> Option<CacheEntry>;
}

/// A [`SymbolLookup`] backed by the dynamic linker's `dladdr`.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct DladdrLookup;

#[cfg(unix)]
impl SymbolLookup for DladdrLookup {
    fn locate(&self, address: u64) -> Option<CacheEntry> {
        use std::ffi::CStr;

        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::dladdr(address as usize as *const libc::c_void, &mut info) };
        if ret == 0 || info.dli_fname.is_null() {
            return None;
        }

        let module = unsafe { CStr::from_ptr(info.dli_fname) }
            .to_string_lossy()
            .into_owned();
        let symbol = if info.dli_sname.is_null() {
            UNKNOWN_MARKER.to_string()
        } else {
            unsafe { CStr::from_ptr(info.dli_sname) }
                .to_string_lossy()
                .into_owned()
        };
        // addr2line and friends want the address relative to where the
        // module happened to be loaded this run.
        let lookup_address = address.wrapping_sub(info.dli_fbase as usize as u64);

        Some(CacheEntry {
            lookup_address,
            module,
            symbol,
        })
    }
}

/// A [`SymbolLookup`] that never locates anything.
///
/// Stands in for [`DladdrLookup`] on platforms without a dynamic-linker
/// query; every address gets memoized as a `"??"` placeholder.
#[derive(Debug, Default)]
pub struct NullLookup;

impl SymbolLookup for NullLookup {
    fn locate(&self, _address: u64) -> Option<CacheEntry> {
        None
    }
}

/// The process-wide memo of every address ever captured.
///
/// A `SymbolCache` manages the local half of symbolication: mapping each
/// captured address to the module/symbol facts that are only knowable while
/// the process is alive, so the expensive half (function/file/line) can
/// happen later on any machine.
///
/// Call [`SymbolCache::new`][new] with the [`SymbolLookup`][lookup] to draw
/// entries from, or use `Default` for the platform lookup. Entries are never
/// evicted or revised; what the first lookup said is what gets exported.
/// All methods take `&self`, so one cache can be shared by every capturing
/// thread.
///
/// [new]: SymbolCache::new
/// [lookup]: trait.SymbolLookup.html
pub struct SymbolCache {
    /// Lookup used to fill misses.
    lookup: Box<dyn SymbolLookup + Send + Sync + 'static>,
    /// Every address seen so far. Ordered so exports are deterministic.
    entries: Mutex<BTreeMap<u64, CacheEntry>>,
}

impl SymbolCache {
    /// Create a `SymbolCache` that fills itself from `lookup`.
    pub fn new<T: SymbolLookup + Send + Sync + 'static>(lookup: T) -> SymbolCache {
        SymbolCache {
            lookup: Box::new(lookup),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record `address` if it hasn't been seen before, and return its entry.
    ///
    /// The first call for a given address pays for one [`SymbolLookup`]
    /// query; every later call is a map hit returning the original entry
    /// unchanged. Failed lookups are memoized as `"??"` placeholders so
    /// they aren't retried either.
    pub fn record_if_absent(&self, address: u64) -> CacheEntry {
        self.entries
            .lock()
            .unwrap()
            .entry(address)
            .or_insert_with(|| {
                trace!("locating {:#x} in the running process", address);
                self.lookup
                    .locate(address)
                    .unwrap_or_else(|| CacheEntry::placeholder(address))
            })
            .clone()
    }

    /// Number of distinct addresses recorded so far.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Serialize every entry into a module database blob.
    ///
    /// The output starts with [`FORMAT_TAG`] and carries one line per
    /// address, lowest address first. The line format has no escaping, so
    /// an entry whose module or symbol embeds whitespace can't be encoded;
    /// such entries are skipped with a logged warning.
    ///
    /// [`FORMAT_TAG`]: crate::FORMAT_TAG
    pub fn export(&self) -> Vec<u8> {
        fn encodable(text: &str) -> bool {
            !text.is_empty() && !text.chars().any(char::is_whitespace)
        }

        let mut buf = FORMAT_TAG.to_vec();
        for (&address, entry) in self.entries.lock().unwrap().iter() {
            if !encodable(&entry.module) || !encodable(&entry.symbol) {
                warn!(
                    "SymbolCache: can't encode entry for {:#x} (whitespace in module or symbol)",
                    address
                );
                continue;
            }
            buf.extend_from_slice(
                format!(
                    "{:x} {:x} {} {}\n",
                    address, entry.lookup_address, entry.module, entry.symbol
                )
                .as_bytes(),
            );
        }
        buf
    }

    /// Two-call export into a caller-provided buffer.
    ///
    /// Pass `None` to learn the required size, then call again with a
    /// buffer of (at least) that size to fill it. The full size is returned
    /// either way; a shorter buffer receives a prefix of the blob.
    pub fn export_into(&self, buf: Option<&mut [u8]>) -> usize {
        let bytes = self.export();
        if let Some(buf) = buf {
            let len = buf.len().min(bytes.len());
            buf[..len].copy_from_slice(&bytes[..len]);
        }
        bytes.len()
    }
}

impl Default for SymbolCache {
    fn default() -> SymbolCache {
        #[cfg(unix)]
        return SymbolCache::new(DladdrLookup);
        #[cfg(not(unix))]
        return SymbolCache::new(NullLookup);
    }
}

impl std::fmt::Debug for SymbolCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolCache")
            .field("entries", &self.entries)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::module_db::ModuleDb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Hands out fixed entries and counts how often it is asked.
    struct CountingLookup {
        calls: Arc<AtomicUsize>,
    }

    impl SymbolLookup for CountingLookup {
        fn locate(&self, address: u64) -> Option<CacheEntry> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(CacheEntry {
                lookup_address: address & 0xfff,
                module: format!("/lib/mod{:x}.so", address >> 12),
                symbol: format!("sym{:x}", address),
            })
        }
    }

    fn counting_cache() -> (SymbolCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SymbolCache::new(CountingLookup {
            calls: calls.clone(),
        });
        (cache, calls)
    }

    #[test]
    fn test_second_insert_is_a_hit() {
        let (cache, calls) = counting_cache();

        let first = cache.record_if_absent(0x1234);
        let second = cache.record_if_absent(0x1234);

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_lookup_is_memoized() {
        struct FailingLookup {
            calls: Arc<AtomicUsize>,
        }
        impl SymbolLookup for FailingLookup {
            fn locate(&self, _address: u64) -> Option<CacheEntry> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                None
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SymbolCache::new(FailingLookup {
            calls: calls.clone(),
        });

        let entry = cache.record_if_absent(0xabc);
        assert_eq!(entry.module, UNKNOWN_MARKER);
        assert_eq!(entry.symbol, UNKNOWN_MARKER);
        assert_eq!(entry.lookup_address, 0xabc);

        cache.record_if_absent(0xabc);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_export_round_trips() {
        let (cache, _) = counting_cache();

        // Size 0.
        let empty = SymbolCache::new(NullLookup);
        let db = ModuleDb::parse(&empty.export()).unwrap();
        assert!(db.is_empty());

        // Size 1.
        let inserted = cache.record_if_absent(0x7f001234);
        let db = ModuleDb::parse(&cache.export()).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.records()[0].address, 0x7f001234);
        assert_eq!(db.records()[0].lookup_address, inserted.lookup_address);
        assert_eq!(db.records()[0].module, inserted.module);
        assert_eq!(db.records()[0].symbol, inserted.symbol);

        // Size N, and the export is sorted by address.
        cache.record_if_absent(0x9000);
        cache.record_if_absent(0x1000);
        let db = ModuleDb::parse(&cache.export()).unwrap();
        assert_eq!(db.len(), 3);
        let addrs: Vec<u64> = db.iter().map(|r| r.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x9000, 0x7f001234]);
    }

    #[test]
    fn test_export_skips_unencodable_entries() {
        struct SpacedLookup;
        impl SymbolLookup for SpacedLookup {
            fn locate(&self, address: u64) -> Option<CacheEntry> {
                Some(CacheEntry {
                    lookup_address: address,
                    module: if address == 0x1 {
                        "/path with spaces/lib.so".to_string()
                    } else {
                        "/bin/fine".to_string()
                    },
                    symbol: "ok".to_string(),
                })
            }
        }

        let cache = SymbolCache::new(SpacedLookup);
        cache.record_if_absent(0x1);
        cache.record_if_absent(0x2);

        let db = ModuleDb::parse(&cache.export()).unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(db.records()[0].address, 0x2);
        // The cache itself still remembers the entry.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_two_call_export() {
        let (cache, _) = counting_cache();
        cache.record_if_absent(0x1000);
        cache.record_if_absent(0x2000);

        let size = cache.export_into(None);
        assert_eq!(size, cache.export().len());

        let mut buf = vec![0u8; size];
        assert_eq!(cache.export_into(Some(&mut buf)), size);
        assert_eq!(buf, cache.export());

        // A short buffer gets a prefix and reports the true size.
        let mut short = vec![0u8; 4];
        assert_eq!(cache.export_into(Some(&mut short)), size);
        assert_eq!(&short[..], &cache.export()[..4]);
    }

    #[cfg(unix)]
    #[test]
    fn test_dladdr_locates_this_test() {
        let address = test_dladdr_locates_this_test as usize as u64;
        let entry = DladdrLookup.locate(address);
        // Static test functions aren't exported, but the address must at
        // least land inside this test binary.
        let entry = entry.expect("test function not in any module?");
        assert!(!entry.module.is_empty());
        assert!(entry.lookup_address <= address);
    }
}
