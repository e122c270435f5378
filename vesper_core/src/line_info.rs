//! Resolved source positions for traceback reporting.

use std::sync::Arc;

/// One resolved traceback entry: where execution is in one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    /// 1-based source line.
    pub line: u32,
    /// 0-based source column.
    pub column: u32,
    /// Filename of the module the frame's function was compiled from.
    pub filename: Arc<str>,
    /// Name of the frame's function.
    pub func_name: Arc<str>,
}

impl LineInfo {
    #[inline]
    pub fn new(line: u32, column: u32, filename: Arc<str>, func_name: Arc<str>) -> Self {
        Self {
            line,
            column,
            filename,
            func_name,
        }
    }
}

impl std::fmt::Display for LineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "  File \"{}\", line {}, in {}",
            self.filename, self.line, self.func_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let li = LineInfo::new(12, 4, "main.vsp".into(), "f".into());
        assert_eq!(li.to_string(), "  File \"main.vsp\", line 12, in f");
    }
}
