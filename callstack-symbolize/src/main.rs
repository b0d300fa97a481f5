// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use std::boxed::Box;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::ops::Deref;
use std::panic;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use callstack::ModuleDb;
use callstack_resolver::{Addr2Line, Resolver};

use clap::{AppSettings, Arg, ArgGroup, Command};
use log::error;
use serde_json::json;
use simplelog::{
    ColorChoice, ConfigBuilder, Level, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};

fn make_app() -> Command<'static> {
    Command::new("callstack-symbolize")
        .version(clap::crate_version!())
        .about("Analyzes module databases and produces a symbolicated report (either human-readable or JSON).")
        .next_line_help(true)
        .setting(AppSettings::DeriveDisplayOrder)
        .override_usage("callstack-symbolize [FLAGS] [OPTIONS] <database>")
        .arg(Arg::new("json").long("json").long_help(
            "Emit a machine-readable JSON report.

The report is one object with a `records` array holding an entry per unique \
address: the raw and load-relative addresses in hex, the module path and raw \
symbol from capture time, and the resolved function/file/line (with fallbacks \
already applied).",
        ))
        .arg(Arg::new("human").long("human").long_help(
            "Emit a human-readable report (the default).

The human-readable report does not have a specified format, and may not have as \
many details as the JSON format. It is intended for quickly inspecting a capture \
or debugging callstack-symbolize itself.",
        ))
        .arg(
            Arg::new("help-markdown")
                .long("help-markdown")
                .long_help("Print --help but formatted as markdown (used for generating docs)")
                .hide(true),
        )
        .group(ArgGroup::new("output-format").args(&["json", "human", "help-markdown"]))
        .arg(
            Arg::new("pretty")
                .long("pretty")
                .help("Pretty-print --json output."),
        )
        .arg(
            Arg::new("tool")
                .long("tool")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .long_help(
                    "The addr2line-compatible tool used to resolve addresses.

Anything accepting `-fCe <module> <hex-address>` and answering with the usual \
two lines (function name, then file:line) will do; binutils addr2line and \
llvm-addr2line both qualify. If unspecified, `addr2line` is looked up on PATH.

The tool is spawned once per unique address. Addresses it can't answer keep \
the fallback details recorded at capture time, so a missing or broken tool \
degrades the report rather than failing it.",
                ),
        )
        .arg(
            Arg::new("timeout-secs")
                .long("timeout-secs")
                .default_value("60")
                .takes_value(true)
                .help(
                    "The maximum amount of time (in seconds) one tool invocation is allowed \
to take.

Invocations that exceed it are killed, and their address reported with fallback details.",
                ),
        )
        .arg(
            Arg::new("output-file")
                .long("output-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write the output to (if unspecified, stdout is used)"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Where to write logs to (if unspecified, stderr is used)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .possible_values(&["off", "error", "warn", "info", "debug", "trace"])
                .default_value("error")
                .takes_value(true)
                .long_help(
                    "Set the logging level.

The database scanner and the tool protocol log every skipped record and failed \
invocation at `warn`, which is the interesting level whenever a database doesn't \
resolve the way you expected.",
                ),
        )
        .arg(
            Arg::new("database")
                .required_unless_present("help-markdown")
                .takes_value(true)
                .allow_invalid_utf8(true)
                .help("Path to the module database file to analyze."),
        )
        .after_help(
            "
NOTES:

Where databases come from:

  A module database is exported by the `callstack` crate from inside the \
process being diagnosed and embedded in its capture artifact. For every \
captured address it records the module path and load-relative address the \
external tool needs, plus the raw exported symbol name as a fallback.

Resolving on another machine:

  The database deliberately contains no machine-local handles, so it can be \
resolved anywhere the referenced modules (with their debug info) are present \
at the recorded paths. Addresses whose modules are absent simply keep their \
fallback symbol names, the same way an absent tool behaves.

",
        )
}

#[cfg_attr(test, allow(dead_code))]
#[tokio::main]
async fn main() {
    let matches = make_app().get_matches();

    // This is a little hack to generate a markdown version of the --help message,
    // to be used by callstack devs to regenerate docs. Not officially part
    // of our public API.
    if matches.is_present("help-markdown") {
        print_help_markdown();
        return;
    }

    let output_file = matches
        .value_of_os("output-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let log_file = matches
        .value_of_os("log-file")
        .map(|os_str| Path::new(os_str).to_owned());

    let verbosity = match matches.value_of("verbose").unwrap() {
        "off" => LevelFilter::Off,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Error,
    };

    // Init the logger (and make trace logging less noisy)
    if let Some(log_path) = log_file {
        let log_file = File::create(log_path).unwrap();
        let _ = WriteLogger::init(
            verbosity,
            ConfigBuilder::new()
                .set_location_level(LevelFilter::Off)
                .set_time_level(LevelFilter::Off)
                .set_thread_level(LevelFilter::Off)
                .set_target_level(LevelFilter::Off)
                .build(),
            log_file,
        )
        .unwrap();
    } else {
        let _ = TermLogger::init(
            verbosity,
            ConfigBuilder::new()
                .set_location_level(LevelFilter::Off)
                .set_time_level(LevelFilter::Off)
                .set_thread_level(LevelFilter::Off)
                .set_target_level(LevelFilter::Off)
                .set_level_color(Level::Trace, None)
                .build(),
            TerminalMode::Stderr,
            ColorChoice::Auto,
        );
    }

    // Set a panic hook to redirect to the logger
    panic::set_hook(Box::new(|panic_info| {
        let (filename, line) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line()))
            .unwrap_or(("<unknown>", 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref)
            .unwrap_or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<&str>()
                    .copied()
                    .unwrap_or("<cause unknown>")
            });
        error!(
            "Panic - A panic occurred at {}:{}: {}",
            filename, line, cause
        );
    }));

    let timeout = matches
        .value_of("timeout-secs")
        .and_then(|x| u64::from_str(x).ok())
        .map(Duration::from_secs)
        .unwrap();

    let tool = match matches.value_of_os("tool") {
        Some(path) => Addr2Line::with_program(Path::new(path)),
        None => Addr2Line::new(),
    }
    .with_timeout(timeout);

    let db_path = matches.value_of_os("database").map(Path::new).unwrap();

    // Although we have a --human argument it's mostly just there to make the
    // documentation more clear. human output is enabled by default, and
    // --json disables it.
    let json = matches.is_present("json");
    let human = !json;

    // Arg::requires can't express this because clap doesn't understand
    // --json being implicitly enabled.
    let pretty = matches.is_present("pretty");
    if pretty && !json {
        error!("Humans must be hideous! (The --pretty and --human flags cannot both be set)");
        std::process::exit(1);
    }

    // Ok now let's do the thing!!!!

    let bytes = match std::fs::read(db_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            let err = if err.kind() == std::io::ErrorKind::NotFound {
                callstack::Error::FileNotFound
            } else {
                callstack::Error::IoError
            };
            error!("{} - Error reading database: {}", err.name(), err);
            std::process::exit(1);
        }
    };

    match ModuleDb::parse(&bytes) {
        Ok(db) => {
            let mut stdout;
            let mut output_f;
            let mut output: &mut dyn Write = if let Some(output_path) = output_file {
                output_f = File::create(output_path).unwrap();
                &mut output_f
            } else {
                stdout = std::io::stdout();
                &mut stdout
            };

            match Resolver::build(&bytes, &tool, None).await {
                Ok(resolver) => {
                    if human {
                        print_human(&db, &resolver, &mut output).unwrap();
                    } else {
                        print_json(&db, &resolver, &mut output, pretty).unwrap();
                    }
                }
                Err(err) => {
                    error!("{} - Error resolving database: {}", err.name(), err);
                    std::process::exit(1);
                }
            }
        }
        Err(err) => {
            error!("{} - Error reading database: {}", err.name(), err);
            std::process::exit(1);
        }
    }
}

/// One block per unique address, in database order.
fn print_human<W: Write>(
    db: &ModuleDb,
    resolver: &Resolver,
    output: &mut W,
) -> std::io::Result<()> {
    writeln!(output, "Resolved {} unique addresses", resolver.len())?;
    let mut seen = HashSet::new();
    for record in db.iter() {
        if !seen.insert(record.address) {
            continue;
        }
        let details = resolver.query(record.address);
        writeln!(output)?;
        writeln!(output, "{:#018x} - {}", record.address, details.function)?;
        if details.line >= 0 {
            writeln!(output, "    at {}:{}", details.file, details.line)?;
        } else {
            writeln!(output, "    at {}", details.file)?;
        }
        writeln!(
            output,
            "    in {} + {:#x}",
            record.module, record.lookup_address
        )?;
    }
    Ok(())
}

fn print_json<W: Write>(
    db: &ModuleDb,
    resolver: &Resolver,
    output: &mut W,
    pretty: bool,
) -> Result<(), serde_json::Error> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for record in db.iter() {
        if !seen.insert(record.address) {
            continue;
        }
        let details = resolver.query(record.address);
        records.push(json!({
            "address": format!("{:#x}", record.address),
            "lookup_address": format!("{:#x}", record.lookup_address),
            "module": record.module,
            "symbol": record.symbol,
            "function": details.function,
            "file": details.file,
            "line": details.line,
        }));
    }
    let report = json!({ "records": records });

    if pretty {
        serde_json::to_writer_pretty(output, &report)
    } else {
        serde_json::to_writer(output, &report)
    }
}

fn print_help_markdown() {
    let mut help_buf = Vec::new();

    // Make a new App to get the help message this time.
    make_app().write_long_help(&mut help_buf).unwrap();
    let help = String::from_utf8(help_buf).unwrap();

    println!("# callstack-symbolize CLI manual");
    println!();
    println!("> This manual can be regenerated with `callstack-symbolize --help-markdown please`");
    println!();

    // First line is --version
    let mut lines = help.lines();
    println!("Version: `{}`", lines.next().unwrap());
    println!();

    for line in lines {
        // Use a trailing colon to indicate a heading
        if let Some(heading) = line.strip_suffix(':') {
            if !line.starts_with(' ') {
                // SCREAMING headers are Main headings
                if heading.to_ascii_uppercase() == heading {
                    println!("# {}", heading);
                } else {
                    println!("## {}", heading);
                }
                continue;
            }
        }

        // Usage strings get wrapped in full code blocks
        if line.starts_with("callstack-symbolize ") {
            println!("```");
            println!("{}", line);
            println!("```");
            continue;
        }

        // The rest is indented, get rid of that
        let line = line.trim();

        // argument names are subheadings
        if line.starts_with('-') || line.starts_with('<') {
            println!("### `{}`", line);
            continue;
        }

        // escape default/value strings
        if line.starts_with('[') {
            println!("\\{}", line);
            continue;
        }

        println!("{}", line);
    }
}
