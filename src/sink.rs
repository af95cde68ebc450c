use std::io::Write;

use log::warn;

use crate::syntax::Word;

/// Receives the output of `dbg` in program order.
pub trait DebugSink {
    fn write(&mut self, value: Word, width: Word);
}

impl<'a, S: DebugSink + ?Sized> DebugSink for &'a mut S {
    fn write(&mut self, value: Word, width: Word) {
        (**self).write(value, width)
    }
}

/// Records every `(value, width)` pair.
impl DebugSink for Vec<(Word, Word)> {
    fn write(&mut self, value: Word, width: Word) {
        self.push((value, width));
    }
}

pub const MAX_FIELD_WIDTH: usize = 64;

/// Writes one right-aligned value per line. Output is best-effort: a failed
/// write is logged and execution carries on.
pub struct WriterSink<W: Write> {
    out: W,
}

impl<W: Write> WriterSink<W> {
    pub fn new(out: W) -> WriterSink<W> {
        WriterSink { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> DebugSink for WriterSink<W> {
    fn write(&mut self, value: Word, width: Word) {
        let width = (width.max(0) as usize).min(MAX_FIELD_WIDTH);
        if let Err(e) = writeln!(self.out, "{:>width$}", value, width = width) {
            warn!("dropped dbg output {}: {}", value, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(pairs: &[(Word, Word)]) -> String {
        let mut sink = WriterSink::new(Vec::new());
        for &(value, width) in pairs {
            sink.write(value, width);
        }
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn pads_to_the_requested_width() {
        assert_eq!(written(&[(5, 0), (-13, 4), (42, 1)]), "5\n -13\n42\n");
    }

    #[test]
    fn clamps_the_width() {
        let out = written(&[(0, 255)]);
        assert_eq!(out.len(), MAX_FIELD_WIDTH + 1);
        assert!(out.ends_with("0\n"));
        assert_eq!(written(&[(7, -3)]), "7\n");
    }

    #[test]
    fn forwards_through_mutable_references() {
        fn emit<S: DebugSink>(mut sink: S) {
            sink.write(1, 2);
            sink.write(3, 4);
        }
        let mut recorded: Vec<(Word, Word)> = Vec::new();
        emit(&mut recorded);
        assert_eq!(recorded, vec![(1, 2), (3, 4)]);
    }
}
