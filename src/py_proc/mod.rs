//! Reading a live CPython process.
//!
//! Everything needed to go from a PID to per-thread stack samples: the
//! memory map digest, the ELF parse that resolves the runtime anchor
//! symbols, the version-indexed structure offsets, the probe that locates
//! and validates the runtime state, and the frame-chain sampler.
//!
//! Session state (map, image, anchors, offsets) is built once at attach
//! and treated as read-only afterwards; only the sampler's code cache
//! grows.

pub mod binary;
pub mod linetable;
pub mod maps;
pub mod mem;
pub mod offsets;
pub mod probe;
pub mod sampler;

use std::path::PathBuf;

use thiserror::Error;

use self::mem::ReadError;

/// Everything that can go wrong while attaching to a target. Each variant
/// maps to a distinct process exit code in the CLI shell.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("process {0} no longer exists")]
    NoSuchProcess(i32),
    #[error(
        "not permitted to inspect process {0}; run with elevated privileges \
         or relax kernel.yama.ptrace_scope"
    )]
    PermissionDenied(i32),
    #[error("process {0} has no interpreter binary or no heap in its memory map")]
    MapIncomplete(i32),
    #[error("malformed object file: {}", .0.display())]
    BadFormat(PathBuf),
    #[error("{} has no dynamic symbol table", .0.display())]
    NoDynamicSymbols(PathBuf),
    #[error("could not locate the interpreter runtime in process {0}")]
    RuntimeNotFound(i32),
    #[error("unsupported interpreter version ({0})")]
    UnsupportedVersion(String),
    #[error("failed to launch target: {0}")]
    Spawn(anyhow::Error),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
