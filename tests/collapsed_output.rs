//! End-to-end check of the sampling pipeline against a synthetic target
//! image: a fake address space laid out like a CPython 3.11 process, walked
//! by the real sampler and rendered through the real collapsed-stack
//! writer.

use std::collections::BTreeMap;

use pysnap::collapse::{render_line, CollapsedWriter, SampleSink};
use pysnap::py_proc::mem::{AddrSpace, ReadError, RemoteMemory};
use pysnap::py_proc::offsets::{py311, FrameLasti, PyOffsets};
use pysnap::py_proc::probe::ProbedRuntime;
use pysnap::py_proc::sampler::FrameSampler;

const MIN_ADDR: u64 = 0x1000;
const MAX_ADDR: u64 = 0x7fff_0000_0000;

/// Byte-region fake of a remote address space.
#[derive(Default)]
struct FakeTarget {
    regions: BTreeMap<u64, Vec<u8>>,
}

impl FakeTarget {
    fn put(&mut self, addr: u64, bytes: Vec<u8>) {
        self.regions.insert(addr, bytes);
    }
}

impl RemoteMemory for FakeTarget {
    fn pid(&self) -> i32 {
        4242
    }

    fn read(&self, addr: u64, dst: &mut [u8]) -> Result<(), ReadError> {
        for (&base, bytes) in self.regions.range(..=addr).rev().take(1) {
            if addr >= base && addr + dst.len() as u64 <= base + bytes.len() as u64 {
                let start = (addr - base) as usize;
                dst.copy_from_slice(&bytes[start..start + dst.len()]);
                return Ok(());
            }
        }
        Err(ReadError::MemoryFault { pid: 4242, addr })
    }
}

fn put_u64(buf: &mut [u8], off: u64, value: u64) {
    let off = off as usize;
    buf[off..off + 8].copy_from_slice(&value.to_ne_bytes());
}

fn put_i32(buf: &mut [u8], off: u64, value: i32) {
    let off = off as usize;
    buf[off..off + 4].copy_from_slice(&value.to_ne_bytes());
}

fn ascii_object(s: &str, d: &PyOffsets) -> Vec<u8> {
    let mut b = vec![0u8; d.unicode_data as usize + s.len()];
    put_u64(&mut b, d.unicode_length, s.len() as u64);
    put_i32(&mut b, d.unicode_state, (1 << 2) | (1 << 5) | (1 << 6)); // kind=1, compact, ascii
    b[d.unicode_data as usize..].copy_from_slice(s.as_bytes());
    b
}

const TSTATE_HEAD_SLOT: u64 = 0x20_0000;

/// Lay out: two threads; the first runs fact() under main(), the second is
/// idle. Uses the 3.11 shape: tstate -> cframe -> interpreter frames with
/// instruction pointers measured against co_code_adaptive.
fn build_target(d: &PyOffsets) -> FakeTarget {
    let mut target = FakeTarget::default();

    const TSTATE_1: u64 = 0x30_0000;
    const TSTATE_2: u64 = 0x31_0000;
    const CFRAME: u64 = 0x32_0000;
    const FRAME_MAIN: u64 = 0x40_0000;
    const FRAME_FACT: u64 = 0x41_0000;
    const CODE_MAIN: u64 = 0x50_0000;
    const CODE_FACT: u64 = 0x51_0000;
    const STR_BASE: u64 = 0x60_0000;

    let mut next_str = STR_BASE;
    let mut string = |target: &mut FakeTarget, s: &str| {
        let addr = next_str;
        next_str += 0x1000;
        target.put(addr, ascii_object(s, d));
        addr
    };

    let app_py = string(&mut target, "app.py");
    let main_name = string(&mut target, "main");
    let fact_name = string(&mut target, "fact");

    // Line table for fact(): one entry, +2 lines over 8 code units.
    // Location-table code 13 (signed varint): byte 0x6f = code 13, delta 8.
    let fact_table = vec![0x6fu8, 4];
    let table_obj = {
        let mut b = vec![0u8; d.bytes_data as usize + fact_table.len()];
        put_u64(&mut b, d.varobject_size, fact_table.len() as u64);
        b[d.bytes_data as usize..].copy_from_slice(&fact_table);
        b
    };
    const TABLE_OBJ: u64 = 0x70_0000;
    target.put(TABLE_OBJ, table_obj);

    let code = |filename: u64, name: u64, first_line: i32, table: u64| {
        let mut c = vec![0u8; 512];
        put_u64(&mut c, d.code_filename, filename);
        put_u64(&mut c, d.code_name, name);
        if let Some(off) = d.code_qualname {
            put_u64(&mut c, off, name);
        }
        put_i32(&mut c, d.code_firstlineno, first_line);
        put_u64(&mut c, d.code_linetable, table);
        c
    };
    target.put(CODE_MAIN, code(app_py, main_name, 10, 0));
    target.put(CODE_FACT, code(app_py, fact_name, 3, TABLE_OBJ));

    let FrameLasti::InstrPtr(instr_off) = d.frame_lasti else {
        panic!("3.11 layout expected");
    };
    let adaptive = d.code_adaptive.unwrap();

    let frame = |code_addr: u64, prev: u64, inst_idx: u64| {
        let mut f = vec![0u8; 256];
        put_u64(&mut f, d.frame_code, code_addr);
        put_u64(&mut f, d.frame_prev, prev);
        put_u64(&mut f, instr_off, code_addr + adaptive + inst_idx * 2);
        f
    };
    target.put(FRAME_MAIN, frame(CODE_MAIN, 0, 0));
    target.put(FRAME_FACT, frame(CODE_FACT, FRAME_MAIN, 1));

    // cframe -> leaf frame
    let mut cf = vec![0u8; 64];
    put_u64(&mut cf, d.cframe_current_frame.unwrap(), FRAME_FACT);
    target.put(CFRAME, cf);

    let thread = |tid: u64, cframe: u64, next: u64| {
        let mut t = vec![0u8; 512];
        put_u64(&mut t, d.tstate_thread_id, tid);
        put_u64(&mut t, d.tstate_frame, cframe);
        put_u64(&mut t, d.tstate_next, next);
        t
    };
    target.put(TSTATE_1, thread(0x7001, CFRAME, TSTATE_2));
    target.put(TSTATE_2, thread(0x7002, 0, 0));

    let mut head = vec![0u8; 8];
    put_u64(&mut head, 0, TSTATE_1);
    target.put(TSTATE_HEAD_SLOT, head);

    target
}

fn sampler_for(d: &PyOffsets) -> FrameSampler<FakeTarget> {
    let space = AddrSpace::new(build_target(d), MIN_ADDR, MAX_ADDR);
    let probed = ProbedRuntime {
        offsets: *d,
        version: (3, 11),
        interp: space.checked(TSTATE_HEAD_SLOT).unwrap(),
        tstate_head: space.checked(TSTATE_HEAD_SLOT).unwrap(),
    };
    FrameSampler::new(space, probed)
}

#[test]
fn samples_render_as_collapsed_lines() {
    let mut sampler = sampler_for(&py311());

    let samples = sampler.sample().expect("head walk");
    assert_eq!(samples.len(), 2);

    // First thread: root-to-leaf, fact's line decoded from its table
    // (first_line 3 + 2), main's falling back to its first line.
    assert_eq!(
        render_line(&samples[0], 10_000),
        "P4242;T28673;main (app.py);L10;fact (app.py);L5 10000"
    );
    // Second thread is idle.
    assert_eq!(render_line(&samples[1], 10_000), "P4242;T28674 10000");
}

#[test]
fn emitted_lines_are_newline_terminated_in_order() {
    let mut sampler = sampler_for(&py311());

    let mut sink = CollapsedWriter::new(Vec::new(), 500);
    for sample in sampler.sample().unwrap() {
        sink.emit(&sample).unwrap();
    }
    let text = String::from_utf8(sink.into_inner()).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("P4242;T28673;"));
    assert!(lines[1].starts_with("P4242;T28674"));
    assert!(text.ends_with('\n'));
}

#[test]
fn resample_is_stable_and_cache_backed() {
    let mut sampler = sampler_for(&py311());

    let first = sampler.sample().unwrap();
    let second = sampler.sample().unwrap();
    assert_eq!(first[0].frames, second[0].frames);
}
