//! This module defines the interface used to turn one captured address into
//! source text.
//!
//! * [LineResolver][] - resolves a (module, load-relative address) pair to
//!   the raw two-line text the addr2line convention prescribes.
//!     * Implemented by [Addr2Line][], which spawns the real external tool
//!       once per address.
//!     * Implemented by [StringLineResolver][], a mock for tests; build one
//!       with [string_line_resolver][].
//!
//! * [parse_tool_output][] - parses that text into a [ParsedLine][],
//!   treating the tool's `?` placeholders as "unknown".
//!
//! The resolver tool lives outside our process on purpose: it may not be
//! installed at all, and it may hang or crash on hostile debug info. None
//! of that is allowed to take the resolve pass down, so every failure is
//! reported per-address through [ToolError][] and the pass moves on.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// How long [`Addr2Line`] waits for the external tool before killing it
/// and reporting the address unresolved.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// The most stdout bytes kept from one tool invocation.
const MAX_TOOL_OUTPUT: usize = 4095;

/// Errors from one external tool invocation.
///
/// None of these abort a resolve pass; the affected address just stays
/// unresolved.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Failed to launch '{tool}': {source}")]
    Launch {
        tool: String,
        source: std::io::Error,
    },
    #[error("Failed waiting for '{tool}': {source}")]
    Wait {
        tool: String,
        source: std::io::Error,
    },
    #[error("'{tool}' did not exit within {timeout:?}")]
    TimedOut { tool: String, timeout: Duration },
    #[error("'{tool}' exited with {status}")]
    Exited {
        tool: String,
        status: std::process::ExitStatus,
    },
}

impl ToolError {
    /// Returns just the name of the error, as a more human-friendly version of
    /// an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            ToolError::Launch { .. } => "Launch",
            ToolError::Wait { .. } => "Wait",
            ToolError::TimedOut { .. } => "TimedOut",
            ToolError::Exited { .. } => "Exited",
        }
    }
}

/// Resolves one load-relative address within one module to source text.
///
/// The returned string is the raw tool output in the addr2line convention:
/// a function name line, then a `file:line` line. Hand it to
/// [`parse_tool_output`] to interpret. Implementations are queried once per
/// unique address per resolve pass.
#[async_trait]
pub trait LineResolver {
    async fn resolve(&self, module: &str, lookup_address: u64) -> Result<String, ToolError>;
}

/// A [`LineResolver`] that runs the binutils `addr2line` tool (or any
/// drop-in replacement) once per address.
///
/// Invocation is `<tool> -fCe <module> <hex-address>` with stdout and
/// stderr piped back; the child never reads from us. The wait is bounded:
/// a tool that sits past the timeout is killed and that address stays
/// unresolved, rather than wedging the whole pass.
#[derive(Debug, Clone)]
pub struct Addr2Line {
    program: PathBuf,
    timeout: Duration,
}

impl Addr2Line {
    /// An `Addr2Line` running the `addr2line` found on `PATH` with the
    /// default timeout.
    pub fn new() -> Addr2Line {
        Addr2Line::with_program("addr2line")
    }

    /// An `Addr2Line` running `program` instead, for systems carrying the
    /// tool under another name (`llvm-addr2line`) and for tests.
    pub fn with_program<P: Into<PathBuf>>(program: P) -> Addr2Line {
        Addr2Line {
            program: program.into(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Bound each tool invocation to `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Addr2Line {
        self.timeout = timeout;
        self
    }
}

impl Default for Addr2Line {
    fn default() -> Addr2Line {
        Addr2Line::new()
    }
}

#[async_trait]
impl LineResolver for Addr2Line {
    async fn resolve(&self, module: &str, lookup_address: u64) -> Result<String, ToolError> {
        let tool = self.program.display().to_string();

        // -f prints function names, -C demangles, -e names the module.
        let child = Command::new(&self.program)
            .arg("-fCe")
            .arg(module)
            .arg(format!("{:x}", lookup_address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Launch {
                tool: tool.clone(),
                source,
            })?;

        // Dropping the wait future kills the child, so a hung tool can't
        // outlive its timeout.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(waited) => waited.map_err(|source| ToolError::Wait {
                tool: tool.clone(),
                source,
            })?,
            Err(_) => {
                warn!(
                    "'{}' still running after {:?} on {} {:#x}, killing it",
                    tool, self.timeout, module, lookup_address
                );
                return Err(ToolError::TimedOut {
                    tool,
                    timeout: self.timeout,
                });
            }
        };

        if !output.status.success() {
            // Surface whatever the tool had to say, one log line per stream.
            let stdout = flatten(&output.stdout);
            let stderr = flatten(&output.stderr);
            if !stdout.is_empty() {
                debug!("'{}' stdout: {}", tool, stdout);
            }
            if !stderr.is_empty() {
                warn!("'{}' stderr: {}", tool, stderr);
            }
            return Err(ToolError::Exited {
                tool,
                status: output.status,
            });
        }

        let mut stdout = output.stdout;
        stdout.truncate(MAX_TOOL_OUTPUT);
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

/// Collapse a tool's output onto one line for logging.
fn flatten(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .replace(['\r', '\n', '\0'], " ")
        .trim()
        .to_string()
}

/// What one tool response parsed into. `None` means the tool printed a `?`
/// placeholder (or nothing at all) for that part.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLine {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<i64>,
}

/// Parse the two-line `function` / `file:line` text the addr2line
/// convention prescribes.
///
/// A `?` anywhere in a half means the tool didn't know that half, as does
/// a missing line or a line number that isn't an integer. The location is
/// split on the *last* colon so `c:\src\a.c:42` keeps its drive letter.
pub fn parse_tool_output(text: &str) -> ParsedLine {
    let mut lines = text.lines();

    let function = lines
        .next()
        .filter(|name| !name.is_empty() && !name.contains('?'))
        .map(str::to_string);

    let mut file = None;
    let mut line = None;
    if let Some(location) = lines.next() {
        match location.rsplit_once(':') {
            Some((file_half, line_half)) => {
                if !file_half.is_empty() && !file_half.contains('?') {
                    file = Some(file_half.to_string());
                }
                if !line_half.contains('?') {
                    line = line_half.trim().parse::<i64>().ok();
                }
            }
            None => {
                // No colon at all; take the whole line as a file name.
                if !location.is_empty() && !location.contains('?') {
                    file = Some(location.to_string());
                }
            }
        }
    }

    ParsedLine {
        function,
        file,
        line,
    }
}

/// A mock [`LineResolver`] that serves canned text, for tests.
///
/// Keys are `"<module>+<hex-lookup-address>"`; anything absent resolves to
/// a [`ToolError`].
#[derive(Debug, Default)]
pub struct StringLineResolver {
    resolutions: HashMap<String, String>,
}

/// Make a [`StringLineResolver`] from a map of `"<module>+<hex-address>"`
/// keys to raw tool output.
pub fn string_line_resolver(resolutions: HashMap<String, String>) -> StringLineResolver {
    StringLineResolver { resolutions }
}

#[async_trait]
impl LineResolver for StringLineResolver {
    async fn resolve(&self, module: &str, lookup_address: u64) -> Result<String, ToolError> {
        self.resolutions
            .get(&format!("{}+{:x}", module, lookup_address))
            .cloned()
            .ok_or_else(|| ToolError::Launch {
                tool: "string".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no canned resolution"),
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        assert_eq!(
            parse_tool_output("my_function\n/src/a.c:42\n"),
            ParsedLine {
                function: Some("my_function".to_string()),
                file: Some("/src/a.c".to_string()),
                line: Some(42),
            }
        );
    }

    #[test]
    fn test_parse_all_placeholders() {
        assert_eq!(parse_tool_output("?\n?:?\n"), ParsedLine::default());
        assert_eq!(parse_tool_output("??\n??:?\n"), ParsedLine::default());
    }

    #[test]
    fn test_parse_unknown_line_zero() {
        // Stock addr2line prints ??:0 when it has no line table; the zero
        // is taken at face value, only `?` means unknown.
        assert_eq!(
            parse_tool_output("main\n??:0\n"),
            ParsedLine {
                function: Some("main".to_string()),
                file: None,
                line: Some(0),
            }
        );
    }

    #[test]
    fn test_parse_splits_on_last_colon() {
        let parsed = parse_tool_output("f\nc:\\src\\a.c:42\n");
        assert_eq!(parsed.file.as_deref(), Some("c:\\src\\a.c"));
        assert_eq!(parsed.line, Some(42));
    }

    #[test]
    fn test_parse_partial_responses() {
        // Missing location line entirely.
        assert_eq!(
            parse_tool_output("my_function\n"),
            ParsedLine {
                function: Some("my_function".to_string()),
                file: None,
                line: None,
            }
        );
        // Empty output.
        assert_eq!(parse_tool_output(""), ParsedLine::default());
        // Location without a colon.
        let parsed = parse_tool_output("f\n/src/a.c\n");
        assert_eq!(parsed.file.as_deref(), Some("/src/a.c"));
        assert_eq!(parsed.line, None);
    }

    #[test]
    fn test_parse_bad_line_number() {
        let parsed = parse_tool_output("f\n/src/a.c:42abc\n");
        assert_eq!(parsed.file.as_deref(), Some("/src/a.c"));
        assert_eq!(parsed.line, None);

        // A discriminator suffix is not a line number either.
        let parsed = parse_tool_output("f\n/src/a.c:42 (discriminator 3)\n");
        assert_eq!(parsed.line, None);
    }

    #[test]
    fn test_flatten_collapses_streams() {
        assert_eq!(flatten(b"a\nb\r\nc\0d\n"), "a b  c d");
        assert_eq!(flatten(b"\n\n"), "");
    }
}
