//! mmsafe diagnostics engine.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    /// Rendered form of the offending IR entity, when one exists.
    pub subject: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Severity {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "info")]
    Info,
}

impl Diagnostic {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Error,
            message: message.into(),
            subject: None,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity: Severity::Warning,
            message: message.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct DiagnosticBag {
    pub diagnostics: Vec<Diagnostic>,
    pub max_errors: usize,
}

impl DiagnosticBag {
    pub fn new(max_errors: usize) -> Self {
        Self {
            diagnostics: Vec::new(),
            max_errors,
        }
    }

    pub fn emit(&mut self, diag: Diagnostic) {
        if self.diagnostics.len() < self.max_errors {
            self.diagnostics.push(diag);
        }
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }
}

/// Diagnostic code namespaces, one prefix per pipeline component.
pub mod codes {
    // Lock insertion
    pub const MML0001: &str = "MML0001"; // THREAD_LOCAL_MULTI_QUAL
    // Type harmonization
    pub const MMH0001: &str = "MMH0001"; // STORE_PRODUCER_NOT_INSERT_FIELD
    pub const MMH0002: &str = "MMH0002"; // UNRESOLVED_OPERAND_TYPE
    // Free finder
    pub const MMF_PREFIX: &str = "MMF";
    // Key-check optimization
    pub const MMK0001: &str = "MMK0001"; // SYNTHESIZED_CHECK_HELPER
    pub const MMK0002: &str = "MMK0002"; // MISSING_SPLIT_RESULTS
    // IR verifier
    pub const MMV0001: &str = "MMV0001"; // SSA_MULTIPLE_DEFINITION
    pub const MMV0002: &str = "MMV0002"; // USE_BEFORE_DEFINITION
    pub const MMV0003: &str = "MMV0003"; // USE_NOT_DOMINATED
    pub const MMV0004: &str = "MMV0004"; // UNKNOWN_BLOCK_TARGET
    pub const MMV0005: &str = "MMV0005"; // DUPLICATE_BLOCK_ID
    pub const MMV0006: &str = "MMV0006"; // MEMORY_TYPE_MISMATCH
    pub const MMV0007: &str = "MMV0007"; // CALL_ARITY_MISMATCH
    pub const MMV0008: &str = "MMV0008"; // EMPTY_FUNCTION_BODY
    // Driver
    pub const MMD0001: &str = "MMD0001"; // STAGE_FAILED
}
