//! Collapsed-stack output.
//!
//! One line per sample per thread, in the shape flamegraph tooling
//! consumes:
//!
//! ```text
//! P<pid>;T<tid>;<function> (<filename>);L<line>;... <metric>
//! ```
//!
//! Frames run root to leaf and the metric is the sampling interval in
//! microseconds. A `;` inside a function or file name is escaped as `\;`.

use std::io::{self, Write};

use crate::py_proc::sampler::Sample;

/// Where the driver sends each sample.
pub trait SampleSink {
    fn emit(&mut self, sample: &Sample) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Escape the field separator inside a name.
fn escape(name: &str) -> String {
    if name.contains(';') {
        name.replace(';', "\\;")
    } else {
        name.to_string()
    }
}

/// Render one sample as a collapsed line, without the trailing newline.
pub fn render_line(sample: &Sample, metric_us: u64) -> String {
    let mut line = format!("P{};T{}", sample.pid, sample.tid);
    for frame in &sample.frames {
        line.push(';');
        line.push_str(&escape(&frame.name));
        line.push_str(" (");
        line.push_str(&escape(&frame.filename));
        line.push_str(");L");
        line.push_str(&frame.line.to_string());
    }
    if sample.truncated {
        line.push_str(";<truncated> ();L0");
    }
    line.push(' ');
    line.push_str(&metric_us.to_string());
    line
}

/// Writes collapsed lines to any `Write` target.
pub struct CollapsedWriter<W: Write> {
    out: W,
    metric_us: u64,
}

impl<W: Write> CollapsedWriter<W> {
    pub fn new(out: W, metric_us: u64) -> Self {
        CollapsedWriter { out, metric_us }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SampleSink for CollapsedWriter<W> {
    fn emit(&mut self, sample: &Sample) -> io::Result<()> {
        let line = render_line(sample, self.metric_us);
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
