/// On-disk ELF parsing: word size, load bias, the `.bss` runtime bounds,
/// and the dynamic-symbol walk that resolves the runtime anchor symbols.
///
/// The section and symbol tables are not loaded into target memory, so they
/// are read from the file. Every access is bounds-checked against the byte
/// buffer; a truncated or corrupt file fails with `BadFormat` and never
/// reads past the mapped length.
use std::fs;
use std::path::Path;

use log::debug;

use super::maps::MemoryRegion;
use super::AttachError;

/// Global runtime state, exported by CPython 3.7+.
pub const SYM_RUNTIME: &str = "_PyRuntime";
/// Current thread-state slot, the anchor on older interpreters.
pub const SYM_TSTATE_CURRENT: &str = "_PyThreadState_Current";

const SHT_DYNSYM: u32 = 11;
const PT_LOAD: u32 = 1;

/// Remote addresses of the anchor symbols. Sampling can proceed as long as
/// at least one is present; the dynsym walk stops once both are.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeAnchors {
    pub runtime: Option<u64>,
    pub tstate_current: Option<u64>,
}

impl RuntimeAnchors {
    /// Record a symbol if it is one of the anchors. Returns true when the
    /// full set is resolved and the caller can stop feeding symbols.
    pub fn offer(&mut self, name: &str, remote: u64) -> bool {
        match name {
            SYM_RUNTIME => self.runtime = Some(remote),
            SYM_TSTATE_CURRENT => self.tstate_current = Some(remote),
            _ => {}
        }
        self.complete()
    }

    pub fn complete(&self) -> bool {
        self.runtime.is_some() && self.tstate_current.is_some()
    }

    pub fn any(&self) -> bool {
        self.runtime.is_some() || self.tstate_current.is_some()
    }
}

/// What the session keeps from the binary parse.
#[derive(Debug, Clone)]
pub struct BinaryImage {
    /// 32 or 64, from the ELF identification bytes.
    pub word_size: u8,
    /// Difference between file virtual addresses and the runtime base.
    pub load_bias: u64,
    pub anchors: RuntimeAnchors,
    /// Runtime bounds of `.bss`, for the probe's scan fallback.
    pub bss: Option<MemoryRegion>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ElfClass {
    Elf32,
    Elf64,
}

/// Bounds-checked little-endian field reads.
fn u16_at(d: &[u8], off: u64) -> Option<u16> {
    let off = usize::try_from(off).ok()?;
    Some(u16::from_le_bytes(d.get(off..off + 2)?.try_into().ok()?))
}

fn u32_at(d: &[u8], off: u64) -> Option<u32> {
    let off = usize::try_from(off).ok()?;
    Some(u32::from_le_bytes(d.get(off..off + 4)?.try_into().ok()?))
}

fn u64_at(d: &[u8], off: u64) -> Option<u64> {
    let off = usize::try_from(off).ok()?;
    Some(u64::from_le_bytes(d.get(off..off + 8)?.try_into().ok()?))
}

fn cstr_at(d: &[u8], off: u64) -> Option<&str> {
    let off = usize::try_from(off).ok()?;
    let tail = d.get(off..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok()
}

struct Ehdr {
    class: ElfClass,
    phoff: u64,
    shoff: u64,
    phentsize: u64,
    phnum: u64,
    shentsize: u64,
    shnum: u64,
    shstrndx: u64,
}

fn parse_ehdr(d: &[u8]) -> Option<Ehdr> {
    if d.get(..4)? != [0x7f, b'E', b'L', b'F'] {
        return None;
    }
    let class = match *d.get(4)? {
        1 => ElfClass::Elf32,
        2 => ElfClass::Elf64,
        _ => return None,
    };
    // Field offsets differ between the two header layouts from e_entry on.
    let (phoff, shoff, rest) = match class {
        ElfClass::Elf32 => (u32_at(d, 28)? as u64, u32_at(d, 32)? as u64, 42u64),
        ElfClass::Elf64 => (u64_at(d, 32)?, u64_at(d, 40)?, 54u64),
    };
    Some(Ehdr {
        class,
        phoff,
        shoff,
        phentsize: u16_at(d, rest)? as u64,
        phnum: u16_at(d, rest + 2)? as u64,
        shentsize: u16_at(d, rest + 4)? as u64,
        shnum: u16_at(d, rest + 6)? as u64,
        shstrndx: u16_at(d, rest + 8)? as u64,
    })
}

struct Shdr {
    name: u64,
    sh_type: u32,
    addr: u64,
    offset: u64,
    size: u64,
    link: u64,
    entsize: u64,
}

fn parse_shdr(d: &[u8], off: u64, class: ElfClass) -> Option<Shdr> {
    match class {
        ElfClass::Elf32 => Some(Shdr {
            name: u32_at(d, off)? as u64,
            sh_type: u32_at(d, off + 4)?,
            addr: u32_at(d, off + 12)? as u64,
            offset: u32_at(d, off + 16)? as u64,
            size: u32_at(d, off + 20)? as u64,
            link: u32_at(d, off + 24)? as u64,
            entsize: u32_at(d, off + 36)? as u64,
        }),
        ElfClass::Elf64 => Some(Shdr {
            name: u32_at(d, off)? as u64,
            sh_type: u32_at(d, off + 4)?,
            addr: u64_at(d, off + 16)?,
            offset: u64_at(d, off + 24)?,
            size: u64_at(d, off + 32)?,
            link: u64_at(d, off + 40)? as u64,
            entsize: u64_at(d, off + 56)?,
        }),
    }
}

/// The load bias is the first loadable segment's virtual address aligned
/// down to its alignment boundary.
fn load_bias(d: &[u8], ehdr: &Ehdr) -> Option<u64> {
    for i in 0..ehdr.phnum {
        let off = ehdr.phoff + i * ehdr.phentsize;
        let p_type = u32_at(d, off)?;
        if p_type != PT_LOAD {
            continue;
        }
        let (vaddr, align) = match ehdr.class {
            ElfClass::Elf32 => (u32_at(d, off + 8)? as u64, u32_at(d, off + 28)? as u64),
            ElfClass::Elf64 => (u64_at(d, off + 16)?, u64_at(d, off + 48)?),
        };
        return Some(if align > 0 { vaddr - vaddr % align } else { vaddr });
    }
    None
}

fn sym_name_value(d: &[u8], off: u64, class: ElfClass) -> Option<(u64, u64)> {
    let name = u32_at(d, off)? as u64;
    let value = match class {
        ElfClass::Elf32 => u32_at(d, off + 4)? as u64,
        ElfClass::Elf64 => u64_at(d, off + 8)?,
    };
    Some((name, value))
}

/// Parse the interpreter object file and resolve the anchor symbols.
pub fn analyze(path: &Path, region: MemoryRegion) -> Result<BinaryImage, AttachError> {
    // The maps read already proved we may inspect this process, so any
    // failure to read the backing file is treated as a bad object.
    let data = fs::read(path).map_err(|_| AttachError::BadFormat(path.to_path_buf()))?;
    analyze_bytes(&data, region).ok_or_else(|| classify_failure(&data, path))
}

/// Distinguish the two parse failures for error reporting: a structurally
/// valid ELF with no dynsym section vs. everything else.
fn classify_failure(data: &[u8], path: &Path) -> AttachError {
    let Some(ehdr) = parse_ehdr(data) else {
        return AttachError::BadFormat(path.to_path_buf());
    };
    if ehdr.shoff == 0 || ehdr.shnum < 2 {
        return AttachError::BadFormat(path.to_path_buf());
    }
    let has_dynsym = (0..ehdr.shnum).any(|i| {
        parse_shdr(data, ehdr.shoff + i * ehdr.shentsize, ehdr.class)
            .map(|s| s.sh_type == SHT_DYNSYM)
            .unwrap_or(false)
    });
    if has_dynsym {
        AttachError::BadFormat(path.to_path_buf())
    } else {
        AttachError::NoDynamicSymbols(path.to_path_buf())
    }
}

/// The parse proper. Returns None on any malformed or truncated structure;
/// `classify_failure` turns that into a typed error.
pub fn analyze_bytes(data: &[u8], region: MemoryRegion) -> Option<BinaryImage> {
    let ehdr = parse_ehdr(data)?;
    if ehdr.shoff == 0 || ehdr.shnum < 2 {
        return None;
    }

    let bias = load_bias(data, &ehdr)?;
    debug!("load bias {bias:#x}");

    let shstrtab = parse_shdr(data, ehdr.shoff + ehdr.shstrndx * ehdr.shentsize, ehdr.class)?;

    let mut dynsym: Option<Shdr> = None;
    let mut bss: Option<MemoryRegion> = None;

    for i in 0..ehdr.shnum {
        let shdr = parse_shdr(data, ehdr.shoff + i * ehdr.shentsize, ehdr.class)?;
        let name = cstr_at(data, shstrtab.offset + shdr.name).unwrap_or("");
        if shdr.sh_type == SHT_DYNSYM && name == ".dynsym" {
            dynsym = Some(shdr);
        } else if name == ".bss" {
            let base = region.base + shdr.addr.wrapping_sub(bias);
            bss = Some(MemoryRegion {
                base,
                size: shdr.size,
            });
            debug!("bss @ {:#x} (size {:#x})", base, shdr.size);
        }
    }

    let dynsym = dynsym?;
    if dynsym.offset == 0 || dynsym.entsize == 0 {
        return None;
    }
    let strtab = parse_shdr(data, ehdr.shoff + dynsym.link * ehdr.shentsize, ehdr.class)?;

    let mut anchors = RuntimeAnchors::default();
    let mut off = dynsym.offset;
    let end = dynsym.offset.checked_add(dynsym.size)?;
    while off < end {
        let (name_off, value) = sym_name_value(data, off, ehdr.class)?;
        off += dynsym.entsize;
        if value == 0 {
            continue;
        }
        let Some(name) = cstr_at(data, strtab.offset + name_off) else {
            continue;
        };
        let remote = region.base + value.wrapping_sub(bias);
        if anchors.offer(name, remote) {
            break;
        }
    }

    Some(BinaryImage {
        word_size: match ehdr.class {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 64,
        },
        load_bias: bias,
        anchors,
        bss,
    })
}

#[cfg(test)]
pub mod testing {
    /// Build a minimal ELF64 shared object in memory: one PT_LOAD segment,
    /// a .dynsym with the given symbols, .dynstr, .shstrtab, and a .bss.
    pub fn synthesize_elf64(symbols: &[(&str, u64)], bias_vaddr: u64) -> Vec<u8> {
        let mut strtab = vec![0u8];
        let mut sym_name_offs = Vec::new();
        for (name, _) in symbols {
            sym_name_offs.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }

        let shstrtab = b"\0.dynsym\0.dynstr\0.shstrtab\0.bss\0".to_vec();
        let (n_dynsym, n_dynstr, n_shstrtab, n_bss) = (1u32, 9u32, 17u32, 27u32);

        // Layout: ehdr(64) | phdr(56) | dynsym | dynstr | shstrtab | shdrs(5)
        let ehsize = 64u64;
        let phoff = 64u64;
        let dynsym_off = phoff + 56;
        let symsz = 24u64;
        let dynsym_size = (symbols.len() as u64 + 1) * symsz; // null entry first
        let dynstr_off = dynsym_off + dynsym_size;
        let shstr_off = dynstr_off + strtab.len() as u64;
        let shoff = shstr_off + shstrtab.len() as u64;

        let mut d = Vec::new();
        // ELF header
        d.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        d.extend_from_slice(&[0u8; 8]);
        d.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
        d.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        d.extend_from_slice(&1u32.to_le_bytes());
        d.extend_from_slice(&0u64.to_le_bytes()); // e_entry
        d.extend_from_slice(&phoff.to_le_bytes());
        d.extend_from_slice(&shoff.to_le_bytes());
        d.extend_from_slice(&0u32.to_le_bytes());
        d.extend_from_slice(&(ehsize as u16).to_le_bytes());
        d.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        d.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        d.extend_from_slice(&64u16.to_le_bytes()); // e_shentsize
        d.extend_from_slice(&5u16.to_le_bytes()); // e_shnum
        d.extend_from_slice(&3u16.to_le_bytes()); // e_shstrndx

        // PT_LOAD phdr
        d.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        d.extend_from_slice(&5u32.to_le_bytes()); // flags
        d.extend_from_slice(&0u64.to_le_bytes()); // offset
        d.extend_from_slice(&bias_vaddr.to_le_bytes()); // vaddr
        d.extend_from_slice(&bias_vaddr.to_le_bytes()); // paddr
        d.extend_from_slice(&0x1000u64.to_le_bytes()); // filesz
        d.extend_from_slice(&0x1000u64.to_le_bytes()); // memsz
        d.extend_from_slice(&0x1000u64.to_le_bytes()); // align

        // .dynsym: null entry then the given symbols
        d.extend_from_slice(&[0u8; 24]);
        for (i, (_, value)) in symbols.iter().enumerate() {
            d.extend_from_slice(&sym_name_offs[i].to_le_bytes());
            d.push(0x12); // STB_GLOBAL | STT_OBJECT
            d.push(0);
            d.extend_from_slice(&1u16.to_le_bytes());
            d.extend_from_slice(&value.to_le_bytes());
            d.extend_from_slice(&0u64.to_le_bytes());
        }
        d.extend_from_slice(&strtab);
        d.extend_from_slice(&shstrtab);

        let shdr = |name: u32,
                    sh_type: u32,
                    addr: u64,
                    offset: u64,
                    size: u64,
                    link: u32,
                    entsize: u64| {
            let mut s = Vec::with_capacity(64);
            s.extend_from_slice(&name.to_le_bytes());
            s.extend_from_slice(&sh_type.to_le_bytes());
            s.extend_from_slice(&0u64.to_le_bytes()); // flags
            s.extend_from_slice(&addr.to_le_bytes());
            s.extend_from_slice(&offset.to_le_bytes());
            s.extend_from_slice(&size.to_le_bytes());
            s.extend_from_slice(&link.to_le_bytes());
            s.extend_from_slice(&0u32.to_le_bytes()); // info
            s.extend_from_slice(&8u64.to_le_bytes()); // addralign
            s.extend_from_slice(&entsize.to_le_bytes());
            s
        };

        d.extend_from_slice(&shdr(0, 0, 0, 0, 0, 0, 0)); // null section
        d.extend_from_slice(&shdr(n_dynsym, 11, bias_vaddr + dynsym_off, dynsym_off, dynsym_size, 2, symsz));
        d.extend_from_slice(&shdr(n_dynstr, 3, bias_vaddr + dynstr_off, dynstr_off, strtab.len() as u64, 0, 0));
        d.extend_from_slice(&shdr(n_shstrtab, 3, 0, shstr_off, shstrtab.len() as u64, 0, 0));
        d.extend_from_slice(&shdr(n_bss, 8, bias_vaddr + 0x2000, 0, 0x800, 0, 0)); // SHT_NOBITS
        d
    }
}
