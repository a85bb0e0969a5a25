/// Locating and validating the live interpreter runtime.
///
/// The preferred path goes through the `_PyRuntime` anchor: the symbol's
/// remote address is the runtime state itself. The legacy anchor holds a
/// pointer to the current thread state instead. If neither anchor survives
/// validation (stripped binary, unexpected layout), pointer-aligned words
/// of the BSS and then the heap are tried as runtime candidates until one
/// round-trips: runtime -> interpreter -> thread -> top frame, every
/// pointer in bounds, identifiers plausible.
use std::fs;
use std::path::Path;

use log::{debug, info};
use object::{Object, ObjectSection, ObjectSymbol};

use super::binary::BinaryImage;
use super::maps::{MemoryMap, MemoryRegion};
use super::mem::{AddrSpace, ReadError, RemoteAddress, RemoteMemory};
use super::offsets::{self, PyOffsets};
use super::sampler::top_frame;
use super::AttachError;

/// Interpreter IDs are small integers; anything huge is garbage memory.
const MAX_PLAUSIBLE_INTERP_ID: i64 = 4096;
/// Scan granularity for the BSS/heap fallback.
const SCAN_CHUNK: usize = 64 * 1024;

/// The probe's product: everything the sampler needs, fixed for the
/// session.
#[derive(Debug, Clone, Copy)]
pub struct ProbedRuntime {
    pub offsets: PyOffsets,
    /// Interpreter version, detected or inferred from the accepted
    /// descriptor.
    pub version: (u8, u8),
    /// The first interpreter state.
    pub interp: RemoteAddress,
    /// Address of the interpreter's thread-state head field. The field's
    /// value changes as threads come and go; its location does not.
    pub tstate_head: RemoteAddress,
}

pub fn probe<R: RemoteMemory>(
    space: &AddrSpace<R>,
    map: &MemoryMap,
    image: &BinaryImage,
) -> Result<ProbedRuntime, AttachError> {
    if image.word_size != 64 {
        return Err(AttachError::UnsupportedVersion(format!(
            "{}-bit interpreter", image.word_size
        )));
    }

    let detected = detect_version(map.object_path());
    let descriptors = match detected {
        Some((major, minor)) => {
            let d = offsets::for_version(major, minor).ok_or_else(|| {
                AttachError::UnsupportedVersion(format!("{major}.{minor}"))
            })?;
            info!("target is CPython {major}.{minor}");
            vec![d]
        }
        None => {
            debug!("interpreter version not identifiable from the binary, probing descriptors");
            offsets::all_newest_first()
        }
    };

    // Symbol paths first, across all candidate descriptors.
    for d in &descriptors {
        if let Some(rt) = image.anchors.runtime {
            if let Some(found) = validate_runtime(space, d, rt)? {
                debug!("runtime validated via symbol @ {rt:#x}");
                return Ok(finish(*d, detected, found));
            }
        }
        if let Some(slot) = image.anchors.tstate_current {
            if let Some(found) = validate_tstate_slot(space, d, slot)? {
                debug!("runtime validated via thread-state anchor @ {slot:#x}");
                return Ok(finish(*d, detected, found));
            }
        }
    }

    // Scan fallback: BSS, then heap.
    for d in &descriptors {
        let bss = image.bss.unwrap_or_default();
        for region in [bss, map.heap] {
            if let Some(found) = scan_region(space, region, d)? {
                debug!("runtime found by scan");
                return Ok(finish(*d, detected, found));
            }
        }
    }

    Err(AttachError::RuntimeNotFound(space.pid()))
}

/// A faulting read only rejects the current candidate (racing mutator,
/// garbage pointer); losing the process or the permission to read it is
/// fatal for the whole attach.
fn absorb_fault<T>(res: Result<T, ReadError>) -> Result<Option<T>, AttachError> {
    match res {
        Ok(value) => Ok(Some(value)),
        Err(ReadError::MemoryFault { .. }) => Ok(None),
        Err(ReadError::NoSuchProcess(pid)) => Err(AttachError::NoSuchProcess(pid)),
        Err(ReadError::PermissionDenied(pid)) => Err(AttachError::PermissionDenied(pid)),
    }
}

fn finish(d: PyOffsets, detected: Option<(u8, u8)>, interp: RemoteAddress) -> ProbedRuntime {
    ProbedRuntime {
        offsets: d,
        version: detected.unwrap_or(d.version),
        interp,
        tstate_head: interp.field(d.interp_tstate_head),
    }
}

/// Validate a candidate runtime-state address. `Ok(Some(interp))` on
/// success, `Ok(None)` when the candidate is rejected.
fn validate_runtime<R: RemoteMemory>(
    space: &AddrSpace<R>,
    d: &PyOffsets,
    runtime: u64,
) -> Result<Option<RemoteAddress>, AttachError> {
    let Some(rt) = space.checked(runtime) else {
        return Ok(None);
    };
    let Some(interp) = absorb_fault(space.read_ptr(rt, d.runtime_interp_head))? else {
        return Ok(None);
    };
    validate_interp(space, d, interp)
}

/// Validate a candidate interpreter-state address by walking to its first
/// thread and frame.
fn validate_interp<R: RemoteMemory>(
    space: &AddrSpace<R>,
    d: &PyOffsets,
    interp: u64,
) -> Result<Option<RemoteAddress>, AttachError> {
    let Some(interp) = space.checked(interp) else {
        return Ok(None);
    };

    let Some(id) = absorb_fault(space.read_i64(interp, d.interp_id))? else {
        return Ok(None);
    };
    if !(0..=MAX_PLAUSIBLE_INTERP_ID).contains(&id) {
        return Ok(None);
    }

    let Some(next) = absorb_fault(space.read_ptr(interp, d.interp_next))? else {
        return Ok(None);
    };
    if next != 0 && space.checked(next).is_none() {
        return Ok(None);
    }

    let Some(thead) = absorb_fault(space.read_ptr(interp, d.interp_tstate_head))? else {
        return Ok(None);
    };
    let Some(thead) = space.checked(thead) else {
        return Ok(None);
    };

    let Some(tid) = absorb_fault(space.read_u64(thead, d.tstate_thread_id))? else {
        return Ok(None);
    };
    if tid == 0 {
        return Ok(None);
    }

    // One-frame walk: if the thread has a frame, its code pointer must
    // read cleanly and stay in bounds.
    let Some(frame) = absorb_fault(top_frame(space, d, thead))? else {
        return Ok(None);
    };
    if let Some(frame) = frame {
        let Some(code) = absorb_fault(space.read_ptr(frame, d.frame_code))? else {
            return Ok(None);
        };
        if code != 0 && space.checked(code).is_none() {
            return Ok(None);
        }
    }

    Ok(Some(interp))
}

/// Legacy anchor: the symbol is a slot holding the current thread state.
fn validate_tstate_slot<R: RemoteMemory>(
    space: &AddrSpace<R>,
    d: &PyOffsets,
    slot: u64,
) -> Result<Option<RemoteAddress>, AttachError> {
    let Some(slot) = space.checked(slot) else {
        return Ok(None);
    };
    let Some(tstate) = absorb_fault(space.read_ptr(slot, 0))? else {
        return Ok(None);
    };
    let Some(tstate) = space.checked(tstate) else {
        return Ok(None);
    };
    let Some(interp) = absorb_fault(space.read_ptr(tstate, d.tstate_interp))? else {
        return Ok(None);
    };
    validate_interp(space, d, interp)
}

/// Walk a region chunk by chunk, trying every in-bounds pointer-aligned
/// word as a runtime candidate. Faulting chunks (racing unmaps) are
/// skipped.
fn scan_region<R: RemoteMemory>(
    space: &AddrSpace<R>,
    region: MemoryRegion,
    d: &PyOffsets,
) -> Result<Option<RemoteAddress>, AttachError> {
    let mut buf = vec![0u8; SCAN_CHUNK];
    let mut off = 0u64;
    while off < region.size {
        let len = (region.size - off).min(SCAN_CHUNK as u64) as usize;
        let chunk = &mut buf[..len];
        let readable = match space.checked(region.base + off) {
            Some(at) => absorb_fault(space.read(at, chunk))?.is_some(),
            None => false,
        };
        if readable {
            for word in chunk.chunks_exact(8) {
                let w = u64::from_ne_bytes(word.try_into().unwrap());
                if !space.contains(w) {
                    continue;
                }
                if let Some(found) = validate_runtime(space, d, w)? {
                    return Ok(Some(found));
                }
            }
        }
        off += SCAN_CHUNK as u64;
    }
    Ok(None)
}

/// Identify the interpreter version from the on-disk binary: the
/// `_PySys_ImplCacheTag` string if present, else the `pythonX.Y` pattern in
/// the path.
pub fn detect_version(path: &Path) -> Option<(u8, u8)> {
    if let Ok(data) = fs::read(path) {
        if let Ok(file) = object::File::parse(&*data) {
            if let Some(v) = read_impl_cache_tag(&file).and_then(|s| parse_cpython_version(&s)) {
                return Some(v);
            }
        }
    }
    parse_version_from_path(path)
}

/// Chase `_PySys_ImplCacheTag` to its "cpython-3XX" string. The symbol
/// usually holds a pointer into .rodata; occasionally it is the string
/// itself.
fn read_impl_cache_tag(file: &object::File) -> Option<String> {
    let sym = file
        .symbols()
        .chain(file.dynamic_symbols())
        .find(|s| s.name() == Ok("_PySys_ImplCacheTag"))?;
    let addr = sym.address();
    if addr == 0 {
        return None;
    }

    let section = file
        .sections()
        .find(|s| addr >= s.address() && addr < s.address() + s.size())?;
    let data = section.data().ok()?;
    let off = (addr - section.address()) as usize;

    if off + 8 <= data.len() {
        let ptr = u64::from_le_bytes(data[off..off + 8].try_into().ok()?);
        for target in file.sections() {
            if ptr >= target.address() && ptr < target.address() + target.size() {
                let tdata = target.data().ok()?;
                let toff = (ptr - target.address()) as usize;
                if toff < tdata.len() {
                    let s = read_cstring(&tdata[toff..]);
                    if s.starts_with("cpython") {
                        return Some(s);
                    }
                }
            }
        }
    }

    let s = read_cstring(&data[off.min(data.len())..]);
    s.starts_with("cpython").then_some(s)
}

fn read_cstring(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Parse "cpython-3XX" cache tags.
fn parse_cpython_version(s: &str) -> Option<(u8, u8)> {
    let s = s.strip_prefix("cpython-")?;
    if s.len() < 2 {
        return None;
    }
    let major: u8 = s[..1].parse().ok()?;
    let minor: u8 = s[1..].parse().ok()?;
    Some((major, minor))
}

/// Extract the version from names like "python3.12" or
/// "libpython3.11.so.1.0".
fn parse_version_from_path(path: &Path) -> Option<(u8, u8)> {
    let filename = path.file_name()?.to_str()?;
    let idx = filename.find("python")?;
    let after = &filename[idx + "python".len()..];
    let dot = after.find('.')?;
    let major: u8 = after[..dot].parse().ok()?;
    let rest = &after[dot + 1..];
    let minor_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let minor: u8 = rest[..minor_end].parse().ok()?;
    Some((major, minor))
}
