/// Remote process memory access.
///
/// All reads of the target's address space go through [`AddrSpace`], which
/// range-checks every address before a syscall is issued. The underlying
/// copy primitive is the [`RemoteMemory`] capability so the sampler stays
/// platform-agnostic; the Linux realization uses `process_vm_readv`.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("process {0} no longer exists")]
    NoSuchProcess(i32),
    #[error("not permitted to read memory of process {0}")]
    PermissionDenied(i32),
    #[error("unreadable address {addr:#x} in process {pid}")]
    MemoryFault { pid: i32, addr: u64 },
}

/// A validated address in the target's address space. Construction goes
/// through [`AddrSpace::checked`], so holding one means the address was
/// inside the observed map bounds at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteAddress(u64);

impl RemoteAddress {
    pub fn get(self) -> u64 {
        self.0
    }

    /// Project a field inside a structure this address was validated as
    /// the base of. Reads through the result are still end-checked by
    /// [`AddrSpace::read`].
    pub(crate) fn field(self, offset: u64) -> RemoteAddress {
        RemoteAddress(self.0 + offset)
    }
}

/// Capability to copy a byte range out of a foreign process.
///
/// A partial copy is a failure; the caller decides whether to retry.
pub trait RemoteMemory {
    fn pid(&self) -> i32;
    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError>;
}

/// `process_vm_readv`-backed reader.
pub struct ProcessVmReader {
    pid: i32,
}

impl ProcessVmReader {
    pub fn new(pid: i32) -> Self {
        ProcessVmReader { pid }
    }
}

impl RemoteMemory for ProcessVmReader {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        if dst.is_empty() {
            return Ok(());
        }

        let local = libc::iovec {
            iov_base: dst.as_mut_ptr() as *mut libc::c_void,
            iov_len: dst.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: dst.len(),
        };

        let n = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if n < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(match errno {
                libc::ESRCH => ReadError::NoSuchProcess(self.pid),
                libc::EPERM | libc::EACCES => ReadError::PermissionDenied(self.pid),
                _ => ReadError::MemoryFault {
                    pid: self.pid,
                    addr,
                },
            });
        }
        if n as usize != dst.len() {
            // Short read: the range straddles an unmapped page.
            return Err(ReadError::MemoryFault {
                pid: self.pid,
                addr,
            });
        }
        Ok(())
    }
}

/// A bounds-checked view of the target's address space.
///
/// `min_addr`/`max_addr` come from the process map and never change for the
/// lifetime of the session.
pub struct AddrSpace<R> {
    reader: R,
    min_addr: u64,
    max_addr: u64,
}

impl<R: RemoteMemory> AddrSpace<R> {
    pub fn new(reader: R, min_addr: u64, max_addr: u64) -> Self {
        AddrSpace {
            reader,
            min_addr,
            max_addr,
        }
    }

    pub fn pid(&self) -> i32 {
        self.reader.pid()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.min_addr && addr < self.max_addr
    }

    /// Validate a raw word as an in-bounds remote address.
    pub fn checked(&self, addr: u64) -> Option<RemoteAddress> {
        self.contains(addr).then_some(RemoteAddress(addr))
    }

    /// Validate, rejecting with a fault error instead of `None`.
    pub fn checked_or_fault(&self, addr: u64) -> Result<RemoteAddress, ReadError> {
        self.checked(addr).ok_or(ReadError::MemoryFault {
            pid: self.reader.pid(),
            addr,
        })
    }

    /// Copy `dst.len()` bytes starting at `at`. The end of the range is
    /// re-checked against the map bounds, so no out-of-bounds read ever
    /// reaches the kernel.
    pub fn read(&self, at: RemoteAddress, dst: &mut [u8]) -> Result<(), ReadError> {
        let end = at.0.checked_add(dst.len() as u64);
        match end {
            Some(end) if end <= self.max_addr => self.reader.read(at.0, dst),
            _ => Err(ReadError::MemoryFault {
                pid: self.reader.pid(),
                addr: at.0,
            }),
        }
    }

    /// Read a field at `base + offset` without separately validating the
    /// field address first; the range check in `read` covers it.
    pub fn read_at(&self, base: RemoteAddress, offset: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        let addr = base
            .0
            .checked_add(offset)
            .and_then(|a| self.checked(a))
            .ok_or(ReadError::MemoryFault {
                pid: self.reader.pid(),
                addr: base.0,
            })?;
        self.read(addr, dst)
    }

    pub fn read_u64(&self, base: RemoteAddress, offset: u64) -> Result<u64, ReadError> {
        let mut buf = [0u8; 8];
        self.read_at(base, offset, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn read_i64(&self, base: RemoteAddress, offset: u64) -> Result<i64, ReadError> {
        Ok(self.read_u64(base, offset)? as i64)
    }

    pub fn read_i32(&self, base: RemoteAddress, offset: u64) -> Result<i32, ReadError> {
        let mut buf = [0u8; 4];
        self.read_at(base, offset, &mut buf)?;
        Ok(i32::from_ne_bytes(buf))
    }

    pub fn read_u32(&self, base: RemoteAddress, offset: u64) -> Result<u32, ReadError> {
        let mut buf = [0u8; 4];
        self.read_at(base, offset, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    /// Read a pointer-sized field. The value is returned raw; callers that
    /// intend to dereference it must run it back through [`checked`].
    ///
    /// [`checked`]: AddrSpace::checked
    pub fn read_ptr(&self, base: RemoteAddress, offset: u64) -> Result<u64, ReadError> {
        self.read_u64(base, offset)
    }
}
