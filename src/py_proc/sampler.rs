/// The sampling hot loop: walk every interpreter thread's frame chain and
/// resolve each frame to (filename, function, line).
///
/// Per-frame cost is dominated by remote reads, so code objects are
/// snapshotted once per session into a cache keyed by their remote address
/// and never evicted. A read failure inside one thread's walk discards
/// that thread's sample only.
use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use super::linetable::LineTable;
use super::mem::{AddrSpace, ReadError, RemoteAddress, RemoteMemory};
use super::offsets::{FrameLasti, PyOffsets};
use super::probe::ProbedRuntime;

/// Frame chains longer than this are treated as corrupted and truncated.
pub const MAX_STACK_DEPTH: usize = 512;
/// Bound on the thread-state list walk.
const MAX_THREADS: usize = 256;
/// Bound on remote string reads.
const MAX_STR_LEN: i64 = 512;
/// Bound on line-table reads.
const MAX_LINETABLE_SIZE: i64 = 1024 * 1024;

/// `_PyInterpreterFrame.owner` value for the C-stack shim frames that
/// 3.12+ pushes around interpreter entry; they carry no Python code.
const FRAME_OWNED_BY_CSTACK: u8 = 3;

/// One resolved frame, root-to-leaf position decided by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub filename: String,
    pub name: String,
    pub line: i32,
}

/// One thread's stack at one sampling instant.
#[derive(Debug, Clone)]
pub struct Sample {
    pub pid: i32,
    pub tid: u64,
    /// Root first, leaf last.
    pub frames: Vec<Frame>,
    /// The walk hit `MAX_STACK_DEPTH`; the emitted stack carries a
    /// sentinel marker.
    pub truncated: bool,
}

/// Cached copy of a code object's small variable-length fields.
#[derive(Debug)]
pub struct CodeSnapshot {
    pub filename: String,
    pub name: String,
    pub first_line: i32,
    linetable: LineTable,
}

impl CodeSnapshot {
    pub fn line_for_lasti(&self, lasti: i32) -> i32 {
        self.linetable.line_for_lasti(lasti)
    }
}

/// Resolve a thread state's top frame, following the `_PyCFrame`
/// indirection where the version has one. `Ok(None)` means the thread is
/// idle.
pub(crate) fn top_frame<R: RemoteMemory>(
    space: &AddrSpace<R>,
    d: &PyOffsets,
    tstate: RemoteAddress,
) -> Result<Option<RemoteAddress>, ReadError> {
    let mut ptr = space.read_ptr(tstate, d.tstate_frame)?;
    if ptr == 0 {
        return Ok(None);
    }
    if let Some(off) = d.cframe_current_frame {
        let cframe = space.checked_or_fault(ptr)?;
        ptr = space.read_ptr(cframe, off)?;
        if ptr == 0 {
            return Ok(None);
        }
    }
    Ok(Some(space.checked_or_fault(ptr)?))
}

pub struct FrameSampler<R> {
    space: AddrSpace<R>,
    offsets: PyOffsets,
    version: (u8, u8),
    tstate_head: RemoteAddress,
    code_cache: HashMap<u64, Rc<CodeSnapshot>>,
    /// Threads whose walk failed mid-sample, across the session.
    pub discarded_threads: u64,
}

impl<R: RemoteMemory> FrameSampler<R> {
    pub fn new(space: AddrSpace<R>, runtime: ProbedRuntime) -> Self {
        FrameSampler {
            space,
            offsets: runtime.offsets,
            version: runtime.version,
            tstate_head: runtime.tstate_head,
            code_cache: HashMap::new(),
            discarded_threads: 0,
        }
    }

    pub fn space(&self) -> &AddrSpace<R> {
        &self.space
    }

    /// Take one sample: one entry per live interpreter thread. An error
    /// here means the thread list head itself was unreadable; per-thread
    /// failures are absorbed.
    pub fn sample(&mut self) -> Result<Vec<Sample>, ReadError> {
        let mut samples = Vec::new();

        let mut raw = self.space.read_ptr(self.tstate_head, 0)?;
        let mut walked = 0;
        while raw != 0 && walked < MAX_THREADS {
            walked += 1;
            let Some(tstate) = self.space.checked(raw) else {
                break;
            };

            match self.sample_thread(tstate) {
                Ok(sample) => samples.push(sample),
                Err(err) => {
                    self.discarded_threads += 1;
                    debug!("discarding thread sample @ {:#x}: {err}", tstate.get());
                }
            }

            raw = match self.space.read_ptr(tstate, self.offsets.tstate_next) {
                Ok(next) => next,
                Err(_) => break,
            };
        }

        Ok(samples)
    }

    fn sample_thread(&mut self, tstate: RemoteAddress) -> Result<Sample, ReadError> {
        let d = self.offsets;
        let tid = self.space.read_u64(tstate, d.tstate_thread_id)?;

        let mut frames = Vec::new();
        let mut truncated = false;
        let mut depth = 0usize;
        let mut current = top_frame(&self.space, &d, tstate)?;

        while let Some(frame) = current {
            if depth >= MAX_STACK_DEPTH {
                truncated = true;
                break;
            }
            depth += 1;

            let code_raw = self.space.read_ptr(frame, d.frame_code)?;
            let prev_raw = self.space.read_ptr(frame, d.frame_prev)?;

            if code_raw != 0 && !self.is_shim_frame(frame)? {
                let code = self.space.checked_or_fault(code_raw)?;
                let snapshot = self.snapshot_code(code)?;
                let lasti = self.read_lasti(frame, code_raw)?;
                frames.push(Frame {
                    filename: snapshot.filename.clone(),
                    name: snapshot.name.clone(),
                    line: snapshot.line_for_lasti(lasti),
                });
            }

            current = if prev_raw == 0 {
                None
            } else {
                Some(self.space.checked_or_fault(prev_raw)?)
            };
        }

        // The walk went leaf to root; emit root to leaf.
        frames.reverse();

        Ok(Sample {
            pid: self.space.pid(),
            tid,
            frames,
            truncated,
        })
    }

    fn is_shim_frame(&self, frame: RemoteAddress) -> Result<bool, ReadError> {
        let Some(off) = self.offsets.frame_owner else {
            return Ok(false);
        };
        let mut owner = [0u8; 1];
        self.space.read_at(frame, off, &mut owner)?;
        Ok(owner[0] == FRAME_OWNED_BY_CSTACK)
    }

    fn read_lasti(&self, frame: RemoteAddress, code_raw: u64) -> Result<i32, ReadError> {
        match self.offsets.frame_lasti {
            FrameLasti::Field(off) => self.space.read_i32(frame, off),
            FrameLasti::InstrPtr(off) => {
                let instr = self.space.read_ptr(frame, off)?;
                let base = code_raw
                    + self
                        .offsets
                        .code_adaptive
                        .expect("instr-ptr layout without code_adaptive");
                if instr == 0 || instr < base {
                    Ok(-1)
                } else {
                    Ok(((instr - base) / 2) as i32)
                }
            }
        }
    }

    fn snapshot_code(&mut self, code: RemoteAddress) -> Result<Rc<CodeSnapshot>, ReadError> {
        if let Some(cached) = self.code_cache.get(&code.get()) {
            return Ok(Rc::clone(cached));
        }

        let d = self.offsets;
        let filename_ptr = self.space.read_ptr(code, d.code_filename)?;
        let name_ptr = match d.code_qualname {
            Some(off) => self.space.read_ptr(code, off)?,
            None => 0,
        };
        let name_ptr = if name_ptr != 0 {
            name_ptr
        } else {
            self.space.read_ptr(code, d.code_name)?
        };
        let first_line = self.space.read_i32(code, d.code_firstlineno)?;

        let filename = self.read_py_string(filename_ptr)?;
        let name = self.read_py_string(name_ptr)?;
        let table = self.read_linetable(code)?;

        let snapshot = Rc::new(CodeSnapshot {
            filename,
            name,
            first_line,
            linetable: LineTable::new(table, first_line, self.version),
        });
        self.code_cache.insert(code.get(), Rc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Copy a compact unicode object's payload. Only the ASCII shape is
    /// decoded; anything else degrades to a placeholder rather than
    /// failing the thread.
    fn read_py_string(&self, ptr: u64) -> Result<String, ReadError> {
        let at = self.space.checked_or_fault(ptr)?;
        let len = self.space.read_i64(at, self.offsets.unicode_length)?;
        if !(0..=MAX_STR_LEN).contains(&len) {
            return Err(ReadError::MemoryFault {
                pid: self.space.pid(),
                addr: ptr,
            });
        }
        let state = self.space.read_u32(at, self.offsets.unicode_state)?;
        let compact = (state >> 5) & 1 == 1;
        let ascii = (state >> 6) & 1 == 1;
        if !(compact && ascii) {
            return Ok("<unicode>".to_string());
        }

        let mut buf = vec![0u8; len as usize];
        self.space.read_at(at, self.offsets.unicode_data, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    /// Copy the code object's line table (a bytes object), bounded.
    fn read_linetable(&self, code: RemoteAddress) -> Result<Vec<u8>, ReadError> {
        let ptr = self.space.read_ptr(code, self.offsets.code_linetable)?;
        let Some(at) = self.space.checked(ptr) else {
            // A missing table is survivable; lines fall back to first_line.
            return Ok(Vec::new());
        };
        let len = self.space.read_i64(at, self.offsets.varobject_size)?;
        if !(0..=MAX_LINETABLE_SIZE).contains(&len) {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len as usize];
        self.space.read_at(at, self.offsets.bytes_data, &mut buf)?;
        Ok(buf)
    }
}
