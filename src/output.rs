//! The "debug-string sink" spec section 6 describes: one line per message.
//! Centralized here so the destination isn't hard-wired into every call
//! site that needs to report.

pub fn emit_line(line: &str) {
    eprintln!("{line}");
}
