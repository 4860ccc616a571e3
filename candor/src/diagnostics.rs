//! Diagnostic types for structured error reporting.
//!
//! Compile-time problems — parse errors and the generator's semantic errors
//! — are surfaced to embedders and to the CLI (`--json`) in this shape.

use serde::{Deserialize, Serialize};

/// Diagnostic severity level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// The result of checking a Candor source file.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// A single diagnostic message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub location: Location,
    pub message: String,
}

/// Source location of a diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub col: usize,
    pub offset: usize,
}

impl Location {
    /// Derive line and column from a byte offset.
    pub fn from_offset(file: &str, source: &str, offset: usize) -> Location {
        let clamped = offset.min(source.len());
        let prefix = &source.as_bytes()[..clamped];
        let line = prefix.iter().filter(|&&b| b == b'\n').count() + 1;
        let col = clamped - prefix.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1) + 1;
        Location {
            file: file.to_string(),
            line,
            col,
            offset,
        }
    }
}

impl Diagnostic {
    pub fn error(code: &str, file: &str, source: &str, offset: usize, message: String) -> Self {
        Diagnostic {
            code: code.to_string(),
            severity: Severity::Error,
            location: Location::from_offset(file, source, offset),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_from_offset() {
        let src = "ab\ncd\nef";
        let loc = Location::from_offset("t.can", src, 0);
        assert_eq!((loc.line, loc.col), (1, 1));
        let loc = Location::from_offset("t.can", src, 4);
        assert_eq!((loc.line, loc.col), (2, 2));
        let loc = Location::from_offset("t.can", src, 6);
        assert_eq!((loc.line, loc.col), (3, 1));
    }

    #[test]
    fn serializes_to_json() {
        let d = Diagnostic::error("GEN_001", "t.can", "x = 1", 0, "Incorrect left-hand side".into());
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"code\":\"GEN_001\""));
        assert!(json.contains("\"severity\":\"error\""));
    }
}
