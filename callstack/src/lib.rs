// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for capturing call stacks and carrying them to another machine.
//!
//! This crate is the capture half of the callstack workspace. It records raw
//! return addresses on the running process, memoizes the cheap local facts
//! about each address (which module it fell in, its load-relative offset,
//! the nearest exported symbol), and serializes those facts into a small
//! tagged blob, the *module database*, that can be embedded in a capture
//! artifact and symbolicated later, elsewhere, by the `callstack-resolver`
//! crate.
//!
//! The pieces:
//!
//! * [`StackCapture`], a bounded, immutable list of addresses for one
//!   thread, filled through a [`StackWalker`].
//! * [`SymbolCache`], the process-wide memo of every address ever captured,
//!   filled through a [`SymbolLookup`] and exported with
//!   [`SymbolCache::export`].
//! * [`ModuleDb`] / [`Records`], the reader side of the serialized format.
//!
//! Capturing is designed to be safe on hot paths: no symbolication happens
//! at capture time, only a `dladdr`-class lookup the first time a given
//! address is seen.
//!
//! # Examples
//!
//! ```
//! use callstack::{ModuleDb, StackCapture, SymbolCache, SystemWalker};
//!
//! let cache = SymbolCache::default();
//! let stack = StackCapture::capture(&SystemWalker, &cache);
//! assert!(stack.len() <= callstack::MAX_FRAMES);
//!
//! // Round-trips through the serialized form.
//! let db = ModuleDb::parse(&cache.export()).unwrap();
//! assert!(db.len() <= cache.len());
//! ```

mod cache;
mod capture;
mod module_db;

pub use crate::cache::{CacheEntry, NullLookup, SymbolCache, SymbolLookup, UNKNOWN_MARKER};
pub use crate::capture::{StackCapture, StackWalker, SystemWalker, MAX_FRAMES};
pub use crate::module_db::{DbRecord, Error, ModuleDb, Records, FORMAT_TAG};

#[cfg(unix)]
pub use crate::cache::DladdrLookup;
