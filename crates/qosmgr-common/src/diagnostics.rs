//! Diagnostics sink passed explicitly through the builder, compiler and
//! controller.
//!
//! Recording an entry also emits the matching `tracing` event, so the process
//! log and the collected entries always agree.

use std::fmt;

/// Severity of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Returns the severity name used in structured log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single collected diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

/// Ordered collection of diagnostics for one run.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entry and forwards it to `tracing` at the same level.
    pub fn record(&mut self, severity: Severity, message: impl Into<String>) {
        let message = message.into();
        match severity {
            Severity::Debug => tracing::debug!(severity = %severity, "{}", message),
            Severity::Info => tracing::info!(severity = %severity, "{}", message),
            Severity::Warning => tracing::warn!(severity = %severity, "{}", message),
            Severity::Error => tracing::error!(severity = %severity, "{}", message),
        }
        self.entries.push(Diagnostic { severity, message });
    }

    pub fn debug(&mut self, message: impl Into<String>) {
        self.record(Severity::Debug, message);
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.record(Severity::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.record(Severity::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.record(Severity::Error, message);
    }

    /// Iterates over entries at exactly `severity`.
    pub fn with_severity(&self, severity: Severity) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.severity == severity)
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    /// Returns true if any entry at `severity` contains `needle`.
    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.with_severity(severity).any(|d| d.message.contains(needle))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
