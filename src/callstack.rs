//! Fixed-capacity capture of instruction addresses for one allocation site.
//!
//! A `CallStack` stores raw addresses only; resolving them to
//! function/file/line is deferred to `dump`, since symbol resolution does
//! I/O and is only ever invoked from a shutdown or fatal-error path.

use crate::config::STACK_CAP;
use crate::symbol::SymbolResolver;

const INTERNAL_FILES: [&str; 5] = ["malloc.c", "new.cpp", "dbgheap.c", "afxmem.cpp", "newaop.cpp"];

#[derive(Clone)]
pub struct CallStack {
    frames: heapless::Vec<usize, STACK_CAP>,
}

impl CallStack {
    pub const fn new() -> Self {
        Self {
            frames: heapless::Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// No-op once the capture is already at `STACK_CAP` frames; traces are
    /// truncated rather than grown.
    pub fn push(&mut self, addr: usize) {
        let _ = self.frames.push(addr);
    }

    pub fn at(&self, index: usize) -> Option<usize> {
        self.frames.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Resolve and print one line per frame via `sink`. Frames whose source
    /// file matches a well-known heap/runtime implementation file are
    /// suppressed unless `show_internal` is set.
    pub fn dump(&self, resolver: &SymbolResolver, show_internal: bool, mut sink: impl FnMut(&str)) {
        for &addr in self.frames.iter() {
            let resolved = resolver.resolve(addr);

            if !show_internal {
                if let Some(file) = &resolved.file {
                    let lower = file.to_lowercase();
                    if INTERNAL_FILES.iter().any(|f| lower.contains(f)) {
                        continue;
                    }
                }
            }

            let func = resolved.function.as_deref().unwrap_or("(function name unavailable)");
            let line = match (&resolved.file, resolved.line) {
                (Some(file), Some(lineno)) => format!("    {file} ({lineno}): {func}"),
                _ => format!("    0x{addr:08x} (File and line number not available): {func}"),
            };
            sink(&line);
        }
    }
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_truncates_past_capacity() {
        let mut stack = CallStack::new();
        for i in 0..(STACK_CAP * 2) {
            stack.push(i + 1);
        }
        assert_eq!(stack.len(), STACK_CAP);
        assert_eq!(stack.at(0), Some(1));
    }

    #[test]
    fn clear_resets_length() {
        let mut stack = CallStack::new();
        stack.push(0x1000);
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(stack.at(0), None);
    }
}
