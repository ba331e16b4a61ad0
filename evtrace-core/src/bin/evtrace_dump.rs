//! evtrace-dump - print the events of a trace table
//!
//! Decodes `<dir>/<table>.jsonl` into generic JSON and prints one payload per
//! line. Malformed lines are skipped and counted on stderr.
//!
//! Usage:
//!     evtrace-dump cannal
//!     evtrace-dump --dir /var/lib/node/traces mempool_tx --envelope
//!     RUST_LOG=evtrace_core=debug evtrace-dump votes --summary

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use evtrace_core::{table_path, Decoded, TableReader};
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "evtrace-dump")]
#[command(about = "Print the events recorded in an evtrace table")]
#[command(version)]
struct Args {
    /// Table to dump
    table: String,

    /// Trace directory holding <table>.jsonl
    #[arg(short, long, default_value = "data/traces")]
    dir: PathBuf,

    /// Print whole envelopes instead of payloads only
    #[arg(long)]
    envelope: bool,

    /// Print counts and the sequence range instead of events
    #[arg(long)]
    summary: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evtrace_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    let path = table_path(&args.dir, &args.table);

    let decoded: Decoded<Value> = match TableReader::open(args.table.as_str(), &path)
        .and_then(|reader| reader.decode())
    {
        Ok(decoded) => decoded,
        Err(e) => {
            eprintln!("Error reading {}: {}", path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = if args.summary {
        print_summary(&args.table, &decoded)
    } else {
        print_events(&decoded, args.envelope)
    };

    if let Err(e) = result {
        // A closed pipe (e.g. `| head`) is not an error worth reporting
        if e.kind() != io::ErrorKind::BrokenPipe {
            eprintln!("Error writing output: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if decoded.skipped_count() > 0 {
        eprintln!("skipped {} malformed line(s)", decoded.skipped_count());
        for failure in &decoded.skipped {
            eprintln!("  line {}: {}", failure.line, failure.reason);
        }
    }

    ExitCode::SUCCESS
}

fn print_events(decoded: &Decoded<Value>, envelope: bool) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    for event in &decoded.events {
        let line = if envelope {
            serde_json::to_string(event)
        } else {
            serde_json::to_string(&event.msg)
        }
        .map_err(io::Error::other)?;
        writeln!(out, "{}", line)?;
    }

    out.flush()
}

fn print_summary(table: &str, decoded: &Decoded<Value>) -> io::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    writeln!(out, "table:    {}", table)?;
    writeln!(out, "events:   {}", decoded.events.len())?;
    writeln!(out, "skipped:  {}", decoded.skipped_count())?;

    if let (Some(first), Some(last)) = (decoded.events.first(), decoded.events.last()) {
        writeln!(out, "sequence: {} ..= {}", first.sequence, last.sequence)?;
        writeln!(
            out,
            "time:     {} .. {}",
            first.timestamp.to_rfc3339(),
            last.timestamp.to_rfc3339()
        )?;

        let mut nodes: Vec<&str> = decoded.events.iter().map(|e| e.node_id.as_str()).collect();
        nodes.sort_unstable();
        nodes.dedup();
        writeln!(out, "nodes:    {}", nodes.join(", "))?;
    }

    Ok(())
}
