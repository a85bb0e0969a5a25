//! Fork-pipe-exec support for profiling a freshly spawned interpreter.
//!
//! The child is forked first and blocks on a pipe until the parent releases
//! it, so the parent knows the PID before the target executes anything. A
//! second pipe with `O_CLOEXEC` on the write end reports exec failure with
//! the child's errno. Once the target is running, a detached reaper thread
//! waits on it so the child never zombifies; the sampling driver polls
//! liveness independently.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

/// A child interpreter process under our control.
///
/// On drop, if the child has not been waited on, it is killed with
/// `SIGKILL` and reaped.
pub struct SpawnedTarget {
    pub pid: i32,
    /// Write end of the "ready" pipe. Writing releases the child to exec.
    ready_write_fd: Option<i32>,
    /// Read end of the "exec" pipe. EOF means exec succeeded; data is the
    /// child's errno.
    exec_read_fd: Option<i32>,
    /// Whether waitpid has already been called for this child. Shared with
    /// the reaper thread; compare_exchange ensures exactly one reap.
    waited: Arc<AtomicBool>,
    /// The child's exit status, set by whichever side reaped it.
    exit_status: Arc<Mutex<Option<i32>>>,
}

impl Drop for SpawnedTarget {
    fn drop(&mut self) {
        if let Some(fd) = self.ready_write_fd.take() {
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = self.exec_read_fd.take() {
            unsafe { libc::close(fd) };
        }

        // Atomically claim the right to reap; a no-op if the reaper thread
        // got there first.
        if self
            .waited
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
                let mut status: i32 = 0;
                libc::waitpid(self.pid, &mut status, 0);
            }
        }
    }
}

impl SpawnedTarget {
    /// Release the child to exec.
    pub fn signal_exec(&mut self) -> Result<()> {
        if let Some(fd) = self.ready_write_fd.take() {
            let buf: [u8; 1] = [1];
            let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
            // Capture errno before close() can clobber it
            let write_err = if ret < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };
            if let Some(err) = write_err {
                bail!("Failed to release child to exec: {}", err);
            }
        }
        Ok(())
    }

    /// Wait for the child to complete exec. EOF on the CLOEXEC pipe means
    /// success; data means exec failed and carries the errno.
    pub fn wait_for_exec(&mut self) -> Result<()> {
        if let Some(fd) = self.exec_read_fd.take() {
            let mut buf = [0u8; 4];
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
            let read_err = if n < 0 {
                Some(std::io::Error::last_os_error())
            } else {
                None
            };
            unsafe { libc::close(fd) };

            if let Some(err) = read_err {
                bail!("Failed to read exec status pipe: {}", err);
            }
            if n > 0 {
                let errno = if n >= 4 {
                    i32::from_ne_bytes(buf)
                } else {
                    buf[0] as i32
                };
                let mut status: i32 = 0;
                unsafe { libc::waitpid(self.pid, &mut status, 0) };
                self.waited.store(true, Ordering::Release);
                bail!(
                    "Failed to exec target: {}",
                    std::io::Error::from_raw_os_error(errno)
                );
            }
        }
        Ok(())
    }

    /// Start the reaper thread. Call once, after a successful exec.
    pub fn spawn_reaper(&self) {
        let pid = self.pid;
        let waited = Arc::clone(&self.waited);
        let exit_status = Arc::clone(&self.exit_status);
        std::thread::spawn(move || {
            let mut status: i32 = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            if ret == pid
                && waited
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                *exit_status.lock().unwrap() = Some(status);
            }
        });
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_status.lock().unwrap()
    }
}

/// Resolve a command name to a full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);

    if name.contains('/') {
        if !path.exists() {
            bail!("Command not found: {}", name);
        }
        let metadata =
            std::fs::metadata(path).with_context(|| format!("Cannot stat '{}'", name))?;
        if !metadata.is_file() {
            bail!("'{}' is not a regular file", name);
        }
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            bail!("'{}' is not executable", name);
        }
        return Ok(path.to_path_buf());
    }

    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if candidate.exists() {
                if let Ok(metadata) = std::fs::metadata(&candidate) {
                    use std::os::unix::fs::PermissionsExt;
                    if metadata.is_file() && metadata.permissions().mode() & 0o111 != 0 {
                        return Ok(candidate);
                    }
                }
            }
        }
    }

    bail!(
        "Command '{}' not found in PATH. Specify the full path to the executable.",
        name
    );
}

/// Fork a child that waits to exec the given command.
///
/// # Safety
///
/// Calls `libc::fork()`; must run before any threads are spawned. The
/// child branch uses only async-signal-safe functions and never returns —
/// it always `_exit()`s or execs.
pub fn spawn_target(command: &[String]) -> Result<SpawnedTarget> {
    if command.is_empty() {
        bail!("No command specified to run");
    }

    // Resolve and allocate everything before fork; the child may not
    // allocate.
    let resolved_path =
        resolve_executable(&command[0]).with_context(|| "Failed to resolve command")?;

    let path_cstr = CString::new(resolved_path.as_os_str().as_bytes())
        .with_context(|| "Command path contains null byte")?;

    let arg_cstrings: Vec<CString> = command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .with_context(|| format!("Argument contains null byte: {}", arg))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut argv: Vec<*const libc::c_char> = arg_cstrings.iter().map(|s| s.as_ptr()).collect();
    argv.push(std::ptr::null());

    let mut ready_fds = [0i32; 2];
    if unsafe { libc::pipe(ready_fds.as_mut_ptr()) } != 0 {
        bail!(
            "Failed to create ready pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let ready_read = ready_fds[0];
    let ready_write = ready_fds[1];

    let mut exec_fds = [0i32; 2];
    if unsafe { libc::pipe2(exec_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        unsafe {
            libc::close(ready_read);
            libc::close(ready_write);
        }
        bail!(
            "Failed to create exec pipe: {}",
            std::io::Error::last_os_error()
        );
    }
    let exec_read = exec_fds[0];
    let exec_write = exec_fds[1];

    // Saved for the PR_SET_PDEATHSIG race check below.
    let parent_pid = unsafe { libc::getpid() };

    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            unsafe {
                libc::close(ready_read);
                libc::close(ready_write);
                libc::close(exec_read);
                libc::close(exec_write);
            }
            bail!("fork() failed: {}", std::io::Error::last_os_error());
        }
        0 => {
            // ===== CHILD =====
            // Only async-signal-safe libc calls from here on.
            unsafe {
                libc::close(ready_write);
                libc::close(exec_read);

                // If the parent dies before releasing us, take SIGTERM.
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);

                // The parent may already have died between fork() and
                // prctl(); in that case we were reparented.
                if libc::getppid() != parent_pid {
                    libc::_exit(1);
                }

                let mut buf = [0u8; 1];
                let n = libc::read(ready_read, buf.as_mut_ptr() as *mut libc::c_void, 1);
                libc::close(ready_read);

                if n <= 0 {
                    libc::_exit(1);
                }

                libc::execv(path_cstr.as_ptr(), argv.as_ptr());

                // exec failed; report errno through the CLOEXEC pipe.
                let errno = *libc::__errno_location();
                let errno_bytes = errno.to_ne_bytes();
                libc::write(exec_write, errno_bytes.as_ptr() as *const libc::c_void, 4);
                libc::close(exec_write);
                libc::_exit(127);
            }
        }
        child_pid => {
            // ===== PARENT =====
            unsafe {
                libc::close(ready_read);
                libc::close(exec_write);
            }

            Ok(SpawnedTarget {
                pid: child_pid,
                ready_write_fd: Some(ready_write),
                exec_read_fd: Some(exec_read),
                waited: Arc::new(AtomicBool::new(false)),
                exit_status: Arc::new(Mutex::new(None)),
            })
        }
    }
}
