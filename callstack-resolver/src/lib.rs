// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for resolving captured call stacks offline.
//!
//! This crate is the analysis half of the callstack workspace. It takes the
//! module database blob that `callstack` exported on the machine being
//! diagnosed, runs the external `addr2line` tool once per unique address,
//! and builds a read-only map you can query forever after:
//!
//! ```no_run
//! use callstack_resolver::{Addr2Line, Resolver};
//!
//! # async fn example(db_bytes: &[u8]) -> Result<(), callstack_resolver::BuildError> {
//! let resolver = Resolver::build(db_bytes, &Addr2Line::new(), None).await?;
//! let details = resolver.query(0x7f00_1234_5678);
//! println!("{} at {}:{}", details.function, details.file, details.line);
//! # Ok(())
//! # }
//! ```
//!
//! The external tool is treated as hostile: it may be missing entirely,
//! and it may hang or print garbage. All of that degrades individual
//! addresses to their capture-time fallbacks (raw symbol name, module
//! path, line -1) and none of it aborts a resolve pass. See
//! [`LineResolver`] for the seam tests hook into, and [`Resolver::build`]
//! for progress reporting and cancellation.

mod resolver;
mod tool;

pub use crate::resolver::{AddressDetails, BuildError, Resolver};
pub use crate::tool::{
    parse_tool_output, string_line_resolver, Addr2Line, LineResolver, ParsedLine,
    StringLineResolver, ToolError, DEFAULT_TOOL_TIMEOUT,
};
