use thiserror::Error;

/// Install-failure taxonomy (spec section 7). Every other error condition
/// (pool exhaustion, untracked free, corruption, leak, symbol miss) is
/// handled locally via counters, an abort, or a non-fatal report — never
/// surfaced through this type.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("symbol engine could not be initialized")]
    SymbolEngine,
}
