//! Lazy, process-wide symbol resolution: address -> {function, file, line}.
//!
//! Not thread-safe by contract (mirrors the platform debug-symbol service
//! it wraps); every call into this module happens while the caller already
//! holds the tracker's process-wide lock.

use std::ffi::c_void;
use std::path::PathBuf;

use backtrace::BytesOrWideString;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use widestring::U16Str;

#[derive(Debug, Clone, Default)]
pub struct ResolvedFrame {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

pub struct SymbolResolver {
    init: OnceCell<()>,
    extra_search_path: Mutex<Option<PathBuf>>,
}

impl SymbolResolver {
    pub const fn new() -> Self {
        Self {
            init: OnceCell::new(),
            extra_search_path: Mutex::new(None),
        }
    }

    /// Configures an extra module/symbol search directory. Only takes
    /// effect if set before the first `resolve`/`ensure_initialized` call;
    /// replaces the source's hard-coded absolute library path.
    pub fn set_extra_search_path(&self, path: PathBuf) {
        *self.extra_search_path.lock() = Some(path);
    }

    /// Idempotent lazy init: warms up the platform symbol engine and
    /// enumerates loaded modules once. Safe to call repeatedly.
    pub fn ensure_initialized(&self) {
        self.init.get_or_init(|| {
            let probe = Self::ensure_initialized as usize;
            backtrace::resolve(probe as *mut c_void, |_symbol| {});
            self.enumerate_modules(|_module| {});
        });
    }

    /// Resolves a single instruction address. Any of the returned fields
    /// may be absent; callers render fallback text for missing parts.
    pub fn resolve(&self, addr: usize) -> ResolvedFrame {
        self.ensure_initialized();

        let mut out = ResolvedFrame::default();
        // Safety: all callers serialize access to the resolver under the
        // tracker's process-wide lock, satisfying `resolve_unsynchronized`'s
        // contract.
        unsafe {
            backtrace::resolve_unsynchronized(addr as *mut c_void, |symbol| {
                out.function = symbol.name().map(|n| n.to_string());
                out.line = symbol.lineno();
                out.file = symbol.filename_raw().map(|raw| match raw {
                    BytesOrWideString::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    BytesOrWideString::Wide(wide) => U16Str::from_slice(wide).chars_lossy().collect(),
                });
            });
        }
        out
    }

    /// Best-effort enumeration of the modules mapped into this process.
    pub fn enumerate_modules(&self, mut cb: impl FnMut(&str)) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(maps) = std::fs::read_to_string("/proc/self/maps") {
                let mut seen = std::collections::HashSet::new();
                for line in maps.lines() {
                    if let Some(path) = line.split_whitespace().last() {
                        if path.starts_with('/') && seen.insert(path) {
                            cb(path);
                        }
                    }
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = &mut cb;
        }

        if let Some(path) = self.extra_search_path.lock().as_ref() {
            cb(&path.to_string_lossy());
        }
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_own_address_finds_something() {
        let resolver = SymbolResolver::new();
        let addr = SymbolResolver::resolve as usize;
        let resolved = resolver.resolve(addr);
        // Debug builds without symbols may still yield nothing; the call
        // must simply never panic and always return, regardless.
        let _ = resolved;
    }

    #[test]
    fn ensure_initialized_is_idempotent() {
        let resolver = SymbolResolver::new();
        resolver.ensure_initialized();
        resolver.ensure_initialized();
    }
}
