//! Diagnostics side channel for recoverable input problems.

use serde::{Deserialize, Serialize};
use strum_macros::Display as StrumDisplay;
use tracing::warn;

/// Classification of a reported condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, Serialize, Deserialize)]
pub enum DiagnosticKind {
    DuplicateName,
    Malformed,
    MissingAclReference,
    DroppedConflict,
}

/// One reported condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub detail: String,
}

/// Collects diagnostics during a load or resolve pass.
///
/// Entries are mirrored to `tracing` as they arrive; callers inspect the
/// collected list after the pass. None of these conditions abort processing
/// unless the owning group runs in strict mode.
#[derive(Debug, Default)]
pub struct Report {
    entries: Vec<Diagnostic>,
}

impl Report {
    pub fn new() -> Self {
        Report::default()
    }

    pub fn record(&mut self, kind: DiagnosticKind, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(event = "Diagnostic", kind = %kind, detail = %detail);
        self.entries.push(Diagnostic { kind, detail });
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_collects_in_order() {
        let mut report = Report::new();
        assert!(report.is_empty());
        report.record(DiagnosticKind::DuplicateName, "acl foo");
        report.record(DiagnosticKind::Malformed, "line 7");
        assert_eq!(report.len(), 2);
        assert_eq!(report.entries()[0].kind, DiagnosticKind::DuplicateName);
        assert_eq!(report.entries()[1].detail, "line 7");
    }
}
