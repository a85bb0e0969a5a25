use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use pysnap::{AttachError, CollapsedWriter, SampleSink, SamplingParams, Session};

// Exit code 2 is clap's, for invalid arguments.
const EXIT_INTERNAL: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NO_SUCH_PROCESS: i32 = 3;
const EXIT_PERMISSION: i32 = 4;
const EXIT_UNSUPPORTED: i32 = 5;

#[derive(Debug, Parser)]
#[command(
    name = "pysnap",
    version,
    about = "Frame stack sampling profiler for CPython",
    long_about = "Samples the call stacks of a running CPython process by reading its \
                  memory, without injecting code or pausing it. Output is one \
                  collapsed-stack line per thread per sample."
)]
struct Cli {
    /// Attach to a running interpreter instead of spawning one.
    #[arg(short, long)]
    pid: Option<i32>,

    /// Sampling interval; accepts us/ms/s suffixes, bare numbers are
    /// microseconds.
    #[arg(short, long, default_value = "10ms", value_parser = parse_time_arg)]
    interval: Duration,

    /// Total sampling duration; 0 runs until the target exits.
    #[arg(
        short,
        long,
        visible_alias = "exposure",
        default_value = "0",
        value_parser = parse_time_arg
    )]
    duration: Duration,

    /// Write collapsed stacks to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target command line to spawn and profile (when --pid is not given).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn parse_time_arg(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid time value: {s}"))?;
    match unit {
        "" | "us" => Ok(Duration::from_micros(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        other => Err(format!("unknown time unit '{other}' (use us, ms or s)")),
    }
}

fn exit_code_for(err: &AttachError) -> i32 {
    match err {
        AttachError::NoSuchProcess(_) => EXIT_NO_SUCH_PROCESS,
        AttachError::PermissionDenied(_) => EXIT_PERMISSION,
        AttachError::UnsupportedVersion(_)
        | AttachError::RuntimeNotFound(_)
        | AttachError::MapIncomplete(_) => EXIT_UNSUPPORTED,
        _ => EXIT_INTERNAL,
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let session = match (cli.pid, cli.command.as_slice()) {
        (Some(pid), _) => Session::attach(pid),
        (None, command) if !command.is_empty() => Session::spawn(command),
        (None, _) => {
            eprintln!("pysnap: nothing to profile; pass --pid or a command line");
            return EXIT_USAGE;
        }
    };

    let mut session = match session {
        Ok(session) => session,
        Err(err) => {
            eprintln!("pysnap: {err}");
            return exit_code_for(&err);
        }
    };

    let params = SamplingParams {
        interval: cli.interval,
        duration: (!cli.duration.is_zero()).then_some(cli.duration),
    };
    let metric_us = cli.interval.as_micros() as u64;

    let mut sink: Box<dyn SampleSink> = match &cli.output {
        Some(path) => match File::create(path) {
            Ok(file) => Box::new(CollapsedWriter::new(BufWriter::new(file), metric_us)),
            Err(err) => {
                eprintln!("pysnap: cannot create {}: {err}", path.display());
                return EXIT_INTERNAL;
            }
        },
        None => Box::new(CollapsedWriter::new(std::io::stdout(), metric_us)),
    };

    match session.run(&params, sink.as_mut()) {
        Ok(stats) => {
            log::info!(
                "done: {} samples, {} errors, {} thread walks discarded",
                stats.samples_ok,
                stats.samples_error,
                stats.discarded_threads
            );
            0
        }
        Err(err) => {
            eprintln!("pysnap: {err}");
            EXIT_INTERNAL
        }
    }
}
