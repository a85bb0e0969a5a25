//! The sampling session and its driver loop.
//!
//! A [`Session`] is built once — map, binary, anchors, probe — and then
//! driven at the requested cadence until the duration elapses, the target
//! exits, a signal arrives, or the runtime becomes unreachable. Cadence is
//! best-effort: an overrun sample just delays the next one; the driver
//! never catches up by double-sampling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use log::{debug, info};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;

use crate::collapse::SampleSink;
use crate::py_proc::maps;
use crate::py_proc::mem::{AddrSpace, ProcessVmReader, ReadError};
use crate::py_proc::probe;
use crate::py_proc::sampler::FrameSampler;
use crate::py_proc::{binary, AttachError};
use crate::spawn::{spawn_target, SpawnedTarget};

/// Abort when this many samples in a row fail: the target has likely
/// re-execed or its runtime is gone.
const ERROR_WINDOW: u32 = 10;

/// How long a freshly spawned interpreter gets to initialize its runtime
/// before attach gives up.
const SPAWN_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_ATTACH_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("target runtime unreachable: the last {0} samples all failed")]
    TargetUnreachable(u32),
    #[error("failed to write sample output: {0}")]
    Sink(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    /// Nominal wall-clock gap between sample starts.
    pub interval: Duration,
    /// Total budget; None runs until the target exits.
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub samples_ok: u64,
    pub samples_error: u64,
    pub discarded_threads: u64,
    pub last_error: Option<String>,
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_signal_flag() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGINT, note_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, note_interrupt as libc::sighandler_t);
    });
}

/// Signal 0 probes existence without delivering anything. EPERM still
/// means alive.
fn target_alive(pid: i32) -> bool {
    !matches!(kill(Pid::from_raw(pid), None), Err(nix::errno::Errno::ESRCH))
}

/// An attached (or spawned) profiling session.
pub struct Session {
    pid: i32,
    version: (u8, u8),
    sampler: FrameSampler<ProcessVmReader>,
    /// Keeps a spawned target reaped and killed if we bail early.
    child: Option<SpawnedTarget>,
    stop: Arc<AtomicBool>,
}

impl Session {
    /// Attach to a running interpreter: digest its map, parse its binary,
    /// resolve the anchors, and probe the runtime.
    pub fn attach(pid: i32) -> Result<Self, AttachError> {
        let map = maps::load_map(pid)?;
        let image = binary::analyze(map.object_path(), map.elf)?;
        debug!(
            "parsed {} ({} bit, bias {:#x})",
            map.object_path().display(),
            image.word_size,
            image.load_bias
        );

        let space = AddrSpace::new(ProcessVmReader::new(pid), map.min_addr, map.max_addr);
        let probed = probe::probe(&space, &map, &image)?;
        info!(
            "attached to {pid}: CPython {}.{}",
            probed.version.0, probed.version.1
        );

        Ok(Session {
            pid,
            version: probed.version,
            sampler: FrameSampler::new(space, probed),
            child: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Spawn the target command and attach to it. The interpreter needs a
    /// moment to set up its runtime, so attach is retried until the
    /// timeout as long as the child stays alive.
    pub fn spawn(argv: &[String]) -> Result<Self, AttachError> {
        let mut child = spawn_target(argv).map_err(AttachError::Spawn)?;
        child.signal_exec().map_err(AttachError::Spawn)?;
        child.wait_for_exec().map_err(AttachError::Spawn)?;
        child.spawn_reaper();
        let pid = child.pid;

        let deadline = Instant::now() + SPAWN_ATTACH_TIMEOUT;
        loop {
            match Self::attach(pid) {
                Ok(mut session) => {
                    session.child = Some(child);
                    return Ok(session);
                }
                // These two just mean "not initialized yet" on a fresh
                // process; anything else is real.
                Err(e @ (AttachError::MapIncomplete(_) | AttachError::RuntimeNotFound(_))) => {
                    if !target_alive(pid) || Instant::now() >= deadline {
                        return Err(e);
                    }
                    std::thread::sleep(SPAWN_ATTACH_RETRY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn version(&self) -> (u8, u8) {
        self.version
    }

    /// Ask a running [`run`](Session::run) loop to wind down before its
    /// next sample.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Clone of the stop flag, for wiring into another thread.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Raw wait status of a spawned target, once it has been reaped.
    pub fn target_exit_status(&self) -> Option<i32> {
        self.child.as_ref().and_then(|c| c.exit_code())
    }

    /// Drive the sampling loop. Returns cleanly when the duration elapses,
    /// the target exits, or a signal/stop request arrives; errors only on
    /// sink failures or a dead runtime.
    pub fn run(
        &mut self,
        params: &SamplingParams,
        sink: &mut dyn SampleSink,
    ) -> Result<SessionStats, RunError> {
        install_signal_flag();

        let started = Instant::now();
        let mut stats = SessionStats::default();
        let mut consecutive_errors = 0u32;

        loop {
            if INTERRUPTED.load(Ordering::Relaxed) || self.stop.load(Ordering::Relaxed) {
                debug!("stop requested");
                break;
            }
            if let Some(budget) = params.duration {
                if started.elapsed() >= budget {
                    break;
                }
            }
            if !target_alive(self.pid) {
                debug!("target exited");
                break;
            }

            let t0 = Instant::now();
            match self.sampler.sample() {
                Ok(samples) => {
                    consecutive_errors = 0;
                    stats.samples_ok += 1;
                    for sample in &samples {
                        sink.emit(sample)?;
                    }
                }
                Err(ReadError::NoSuchProcess(_)) => break,
                Err(err) => {
                    stats.samples_error += 1;
                    consecutive_errors += 1;
                    stats.last_error = Some(err.to_string());
                    if consecutive_errors >= ERROR_WINDOW {
                        return Err(RunError::TargetUnreachable(ERROR_WINDOW));
                    }
                }
            }

            if let Some(rest) = params.interval.checked_sub(t0.elapsed()) {
                std::thread::sleep(rest);
            }
        }

        sink.flush()?;
        stats.discarded_threads = self.sampler.discarded_threads;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_alive_self() {
        assert!(target_alive(std::process::id() as i32));
    }

    #[test]
    fn test_target_alive_bogus_pid() {
        // Far beyond any kernel's pid_max.
        assert!(!target_alive(i32::MAX));
    }

    #[test]
    fn test_attach_nonexistent_pid() {
        match Session::attach(-2) {
            Err(AttachError::NoSuchProcess(_)) => {}
            other => panic!("expected NoSuchProcess, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_attach_non_python_process() {
        // We are a Rust test binary: no interpreter mapping to find.
        match Session::attach(std::process::id() as i32) {
            Err(AttachError::MapIncomplete(_)) => {}
            other => panic!("expected MapIncomplete, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_sampling_params_copyable() {
        let p = SamplingParams {
            interval: Duration::from_millis(10),
            duration: None,
        };
        let q = p;
        assert_eq!(q.interval, Duration::from_millis(10));
        assert!(p.duration.is_none());
    }
}
