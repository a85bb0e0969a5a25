/// CPython version-specific structure offsets.
///
/// One descriptor per supported (major, minor), selected once at attach and
/// immutable for the session. Adjacent minors mostly share values; the
/// constructors below exist to centralize the deltas: the 3.11 `cframe`
/// indirection, the 3.12 interpreter-frame reshuffle, and the 3.13 direct
/// `current_frame` plus the debug-offsets prefix that pushes
/// `interpreters.head` deep into the runtime struct.
///
/// All offsets are for 64-bit builds of the interpreter.

/// How a frame's last-instruction position is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLasti {
    /// `f_lasti: int` at this offset (frame-object interpreters, <= 3.10).
    Field(u64),
    /// `prev_instr`/`instr_ptr` pointer at this offset (3.11+); the
    /// instruction index is derived against `code_adaptive`.
    InstrPtr(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct PyOffsets {
    pub version: (u8, u8),

    // _PyRuntimeState
    pub runtime_interp_head: u64,

    // PyInterpreterState
    pub interp_next: u64,
    pub interp_id: u64,
    pub interp_tstate_head: u64,

    // PyThreadState
    pub tstate_next: u64,
    pub tstate_interp: u64,
    pub tstate_thread_id: u64,
    /// `frame` (<= 3.10), `cframe` (3.11/3.12) or `current_frame` (3.13+).
    pub tstate_frame: u64,
    /// Extra dereference through `_PyCFrame.current_frame`; None when the
    /// thread state points at the frame directly.
    pub cframe_current_frame: Option<u64>,

    // Frame (PyFrameObject or _PyInterpreterFrame)
    pub frame_prev: u64,
    pub frame_code: u64,
    pub frame_lasti: FrameLasti,
    /// `_PyInterpreterFrame.owner`, used to skip C-stack shim frames.
    pub frame_owner: Option<u64>,

    // PyCodeObject
    pub code_filename: u64,
    pub code_name: u64,
    pub code_qualname: Option<u64>,
    pub code_firstlineno: u64,
    /// `co_lnotab` (<= 3.9) or `co_linetable` (3.10+).
    pub code_linetable: u64,
    /// `co_code_adaptive`, the base the 3.11+ instruction pointer is
    /// measured against.
    pub code_adaptive: Option<u64>,

    // Object payloads
    /// offsetof(PyASCIIObject, length).
    pub unicode_length: u64,
    /// offsetof(PyASCIIObject, state), the bitfield holding the
    /// kind/compact/ascii flags.
    pub unicode_state: u64,
    /// Start of the character data of a compact ASCII unicode object
    /// (sizeof(PyASCIIObject); shrank in 3.12 when wstr was removed).
    pub unicode_data: u64,
    /// offsetof(PyBytesObject, ob_sval).
    pub bytes_data: u64,
    /// offsetof(PyVarObject, ob_size).
    pub varobject_size: u64,
}

/// Returns the offsets for a given interpreter (major, minor), or None if
/// the version is not supported. Unknown 3.x newer than the table falls
/// back to the latest known layout.
pub fn for_version(major: u8, minor: u8) -> Option<PyOffsets> {
    if major != 3 {
        return None;
    }
    match minor {
        8 => Some(py38()),
        9 => Some(py39()),
        10 => Some(py310()),
        11 => Some(py311()),
        12 => Some(py312()),
        13 => Some(py313()),
        m if m > 13 => Some(py313()),
        _ => None,
    }
}

/// Descriptors newest-first, for the probe's trial-selection fallback when
/// the binary does not reveal its version.
pub fn all_newest_first() -> Vec<PyOffsets> {
    vec![py313(), py312(), py311(), py310(), py39(), py38()]
}

pub fn py38() -> PyOffsets {
    PyOffsets {
        version: (3, 8),
        runtime_interp_head: 32,
        interp_next: 0,
        interp_id: 16,
        interp_tstate_head: 8,
        tstate_next: 8,
        tstate_interp: 16,
        tstate_thread_id: 176,
        tstate_frame: 24,
        cframe_current_frame: None,
        frame_prev: 24,
        frame_code: 32,
        frame_lasti: FrameLasti::Field(104),
        frame_owner: None,
        code_filename: 104,
        code_name: 112,
        code_qualname: None,
        code_firstlineno: 40,
        code_linetable: 120,
        code_adaptive: None,
        unicode_length: 16,
        unicode_state: 32,
        unicode_data: 48,
        bytes_data: 32,
        varobject_size: 16,
    }
}

pub fn py39() -> PyOffsets {
    PyOffsets {
        version: (3, 9),
        ..py38()
    }
}

pub fn py310() -> PyOffsets {
    PyOffsets {
        version: (3, 10),
        // 3.10 shrank the frame object: f_lasti moved and became an
        // instruction index instead of a byte offset.
        frame_lasti: FrameLasti::Field(96),
        ..py38()
    }
}

pub fn py311() -> PyOffsets {
    PyOffsets {
        version: (3, 11),
        // _finalizing grew a companion field, shifting interpreters.head.
        runtime_interp_head: 40,
        interp_next: 0,
        interp_id: 40,
        interp_tstate_head: 8,
        tstate_next: 8,
        tstate_interp: 16,
        tstate_thread_id: 152,
        // Frames moved off the heap: tstate -> cframe -> _PyInterpreterFrame.
        tstate_frame: 56,
        cframe_current_frame: Some(8),
        frame_prev: 48,
        frame_code: 32,
        frame_lasti: FrameLasti::InstrPtr(56),
        frame_owner: None,
        code_filename: 112,
        code_name: 120,
        code_qualname: Some(128),
        code_firstlineno: 72,
        code_linetable: 136,
        code_adaptive: Some(168),
        unicode_length: 16,
        unicode_state: 32,
        unicode_data: 48,
        bytes_data: 32,
        varobject_size: 16,
    }
}

pub fn py312() -> PyOffsets {
    PyOffsets {
        version: (3, 12),
        runtime_interp_head: 40,
        interp_id: 8,
        interp_tstate_head: 72,
        tstate_thread_id: 128,
        // The interpreter frame was reordered: f_code first, previous second.
        cframe_current_frame: Some(0),
        frame_prev: 8,
        frame_code: 0,
        frame_lasti: FrameLasti::InstrPtr(56),
        frame_owner: Some(70),
        code_firstlineno: 68,
        code_adaptive: Some(192),
        // wstr is gone, PyASCIIObject shrank.
        unicode_data: 40,
        ..py311()
    }
}

pub fn py313() -> PyOffsets {
    PyOffsets {
        version: (3, 13),
        // _Py_DebugOffsets now prefixes the runtime state.
        runtime_interp_head: 632,
        interp_tstate_head: 88,
        tstate_thread_id: 144,
        // No more _PyCFrame: current_frame sits directly on the thread state.
        tstate_frame: 72,
        cframe_current_frame: None,
        frame_owner: Some(74),
        ..py312()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_version_known() {
        assert!(for_version(3, 8).is_some());
        assert!(for_version(3, 13).is_some());
    }

    #[test]
    fn test_for_version_unknown() {
        assert!(for_version(2, 7).is_none());
        assert!(for_version(3, 7).is_none());
    }

    #[test]
    fn test_for_version_future_fallback() {
        let future = for_version(3, 14).unwrap();
        assert_eq!(future.version, (3, 13));
    }

    #[test]
    fn test_py310_offsets() {
        let c = py310();
        assert_eq!(c.code_linetable, 120);
        assert_eq!(c.frame_lasti, FrameLasti::Field(96));
        assert_eq!(c.cframe_current_frame, None);
    }

    #[test]
    fn test_py311_offsets() {
        let c = py311();
        assert_eq!(c.tstate_frame, 56);
        assert_eq!(c.cframe_current_frame, Some(8));
        assert_eq!(c.frame_code, 32);
    }

    #[test]
    fn test_py312_offsets() {
        let c = py312();
        assert_eq!(c.cframe_current_frame, Some(0));
        assert_eq!(c.frame_code, 0);
        assert_eq!(c.code_adaptive, Some(192));
        assert_eq!(c.unicode_data, 40);
    }

    #[test]
    fn test_py313_offsets() {
        let c = py313();
        assert_eq!(c.tstate_frame, 72);
        assert_eq!(c.cframe_current_frame, None);
        assert_eq!(c.runtime_interp_head, 632);
    }

    #[test]
    fn test_newest_first_order() {
        let all = all_newest_first();
        assert_eq!(all.first().unwrap().version, (3, 13));
        assert_eq!(all.last().unwrap().version, (3, 8));
    }

    #[test]
    fn test_unicode_header_layout_stable() {
        // PyASCIIObject's length and state fields have not moved across
        // the supported versions; only the payload start has.
        for c in all_newest_first() {
            assert_eq!(c.unicode_length, 16);
            assert_eq!(c.unicode_state, 32);
        }
    }
}
