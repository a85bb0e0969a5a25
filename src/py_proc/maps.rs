/// Process memory map introspection via /proc/<pid>/maps.
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::AttachError;

/// Environment variable that forces the interpreter binary or shared
/// library path when the map heuristic would pick the wrong mapping.
pub const PYTHON_BIN_ENV: &str = "PYSNAP_PYTHON_BIN";

/// Anything smaller is unlikely to be an interpreter binary.
const MIN_BINARY_SIZE: u64 = 1 << 20;

/// One line of /proc/<pid>/maps.
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub name: String,
}

/// A contiguous region of the target's address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// The digest of the target's map that the rest of the session needs:
/// overall address bounds, the heap, and the region backed by the
/// interpreter binary or its shared library.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    pub min_addr: u64,
    pub max_addr: u64,
    pub heap: MemoryRegion,
    pub elf: MemoryRegion,
    pub bin_path: Option<PathBuf>,
    pub lib_path: Option<PathBuf>,
}

impl MemoryMap {
    /// The on-disk object file to parse: the executable if one was found,
    /// otherwise the shared library.
    pub fn object_path(&self) -> &Path {
        self.bin_path
            .as_deref()
            .or(self.lib_path.as_deref())
            .expect("MemoryMap built without a binary candidate")
    }
}

pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?.to_string();
    let offset_str = parts.next()?;
    let dev = parts.next()?;
    let inode_str = parts.next()?;
    let name = parts.collect::<Vec<_>>().join(" ");

    let (start_str, end_str) = range.split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;
    let offset = u64::from_str_radix(offset_str, 16).ok()?;
    let (dev_major_str, dev_minor_str) = dev.split_once(':')?;
    let dev_major = u32::from_str_radix(dev_major_str, 16).ok()?;
    let dev_minor = u32::from_str_radix(dev_minor_str, 16).ok()?;
    let inode = inode_str.parse().ok()?;

    Some(MemoryMapping {
        start,
        end,
        perms,
        offset,
        dev_major,
        dev_minor,
        inode,
        name,
    })
}

/// Resolve a mapped path through /proc/<pid>/root so containerized targets
/// read the file the target actually loaded.
pub fn resolve_proc_path(pid: i32, path: &str) -> PathBuf {
    let proc_root = PathBuf::from(format!("/proc/{pid}/root{path}"));
    if proc_root.exists() {
        proc_root
    } else {
        PathBuf::from(path)
    }
}

/// Whether the first mapping of this file could back the interpreter
/// runtime. The name must look like a Python binary (or match the override
/// variable) and the file must clear the size threshold.
fn is_candidate(pid: i32, mapping: &MemoryMapping, overridden: Option<&str>) -> bool {
    if mapping.name.is_empty() || mapping.inode == 0 {
        return false;
    }
    if let Some(wanted) = overridden {
        return mapping.name == wanted;
    }
    if !mapping.name.to_lowercase().contains("python") {
        return false;
    }
    let size = fs::metadata(resolve_proc_path(pid, &mapping.name))
        .map(|m| m.len())
        .unwrap_or(0);
    size >= MIN_BINARY_SIZE
}

/// Peek at the object file's ELF type field. ET_EXEC means a fixed-address
/// executable; PIE executables and shared libraries both read as ET_DYN and
/// are treated as libraries, which routes them through the load-bias path.
fn is_et_exec(path: &Path) -> bool {
    let mut header = [0u8; 18];
    match fs::File::open(path).and_then(|mut f| {
        use std::io::Read;
        f.read_exact(&mut header)
    }) {
        Ok(()) => header[..4] == [0x7f, b'E', b'L', b'F'] && header[16] == 2,
        Err(_) => false,
    }
}

/// Load and digest the target's memory map.
///
/// `min_addr`/`max_addr` span all real regions; pseudo-regions such as
/// `[vsyscall]` and `[vvar]` are excluded because their addresses would
/// wreck the bounds. Fails with `MapIncomplete` unless both a binary
/// candidate and the heap were seen.
pub fn load_map(pid: i32) -> Result<MemoryMap, AttachError> {
    let content = match fs::read_to_string(format!("/proc/{pid}/maps")) {
        Ok(c) => c,
        Err(e) => {
            return Err(match e.kind() {
                std::io::ErrorKind::NotFound => AttachError::NoSuchProcess(pid),
                std::io::ErrorKind::PermissionDenied => AttachError::PermissionDenied(pid),
                _ => AttachError::Io(e),
            })
        }
    };

    let overridden = std::env::var(PYTHON_BIN_ENV).ok();

    let mut min_addr = u64::MAX;
    let mut max_addr = 0u64;
    let mut heap: Option<MemoryRegion> = None;
    let mut elf = MemoryRegion::default();
    let mut bin_path: Option<PathBuf> = None;
    let mut lib_path: Option<PathBuf> = None;

    for line in content.lines() {
        let Some(mapping) = parse_maps_line(line) else {
            continue;
        };

        if !mapping.name.starts_with("[v") {
            min_addr = min_addr.min(mapping.start);
            max_addr = max_addr.max(mapping.end);
        }

        if heap.is_none() && mapping.name == "[heap]" {
            heap = Some(MemoryRegion {
                base: mapping.start,
                size: mapping.end - mapping.start,
            });
            debug!("heap bounds {:#x}-{:#x}", mapping.start, mapping.end);
            continue;
        }

        if !is_candidate(pid, &mapping, overridden.as_deref()) {
            continue;
        }

        let path = resolve_proc_path(pid, &mapping.name);
        if is_et_exec(&path) {
            // An executable beats any library; first executable wins.
            if bin_path.is_some() {
                continue;
            }
            debug!("candidate binary: {} @ {:#x}", mapping.name, mapping.start);
            bin_path = Some(path);
            elf = MemoryRegion {
                base: mapping.start,
                size: mapping.end - mapping.start,
            };
        } else {
            if bin_path.is_some() || lib_path.is_some() {
                continue;
            }
            debug!("candidate library: {} @ {:#x}", mapping.name, mapping.start);
            lib_path = Some(path);
            elf = MemoryRegion {
                base: mapping.start,
                size: mapping.end - mapping.start,
            };
        }
    }

    let Some(heap) = heap else {
        return Err(AttachError::MapIncomplete(pid));
    };
    if bin_path.is_none() && lib_path.is_none() {
        return Err(AttachError::MapIncomplete(pid));
    }

    // An executable takes precedence over any library seen earlier.
    let lib_path = if bin_path.is_some() { None } else { lib_path };

    Ok(MemoryMap {
        min_addr,
        max_addr,
        heap,
        elf,
        bin_path,
        lib_path,
    })
}
