//! Process-wide runtime configuration.

use std::sync::LazyLock;

static VERBOSITY: LazyLock<u8> = LazyLock::new(|| {
    std::env::var("VESPER_VERBOSITY")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
});

/// Diagnostic verbosity, read once from `VESPER_VERBOSITY`.
///
/// 0 silences all diagnostics. 1 reports code emission events, 2 adds
/// per-function line tables.
#[inline]
pub fn verbosity() -> u8 {
    *VERBOSITY
}
