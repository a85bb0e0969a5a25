//! pysnap — an external frame-stack sampling profiler for CPython.
//!
//! pysnap attaches to a running interpreter by PID (or spawns one) and, at
//! a configurable cadence, reconstructs every interpreter thread's call
//! stack by reading the target's memory. No code is injected and the
//! target is never paused; every sample is emitted as a collapsed-stack
//! line that flamegraph tooling consumes directly.
//!
//! # Modules
//!
//! - [`py_proc`] - locating and reading the target's runtime structures
//! - [`driver`] - the attach/spawn session and the sampling loop
//! - [`collapse`] - collapsed-stack output
//! - [`spawn`] - fork-pipe-exec support for spawned targets
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pysnap::{CollapsedWriter, SamplingParams, Session};
//!
//! let mut session = Session::attach(4242).expect("attach failed");
//! let mut sink = CollapsedWriter::new(std::io::stdout(), 10_000);
//! let params = SamplingParams {
//!     interval: Duration::from_millis(10),
//!     duration: Some(Duration::from_secs(3)),
//! };
//! let stats = session.run(&params, &mut sink).expect("sampling failed");
//! eprintln!("{} samples", stats.samples_ok);
//! ```

pub mod collapse;
pub mod driver;
pub mod py_proc;
pub mod spawn;

pub use collapse::{CollapsedWriter, SampleSink};
pub use driver::{RunError, SamplingParams, Session, SessionStats};
pub use py_proc::AttachError;
