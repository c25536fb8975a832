//! Task-level error type
//!
//! Everything that can end a task converges on [`PipelineError`]. Its
//! message reaches the progress observer only after
//! [`sanitize_error_message`] has redacted secrets and capped the length.

use crate::gateway::GatewayError;
use crate::ingest::IngestError;
use crate::report::WorkbookError;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Main error type for one enrichment task
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Registry gateway failure: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Invalid requisition data: {0}")]
    Ingest(#[from] IngestError),

    #[error("Spreadsheet error: {0}")]
    Workbook(#[from] WorkbookError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize stage artifact: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background job failed: {message}")]
    Join { message: String },
}

impl PipelineError {
    /// Message suitable for the terminal progress event
    pub fn user_message(&self) -> String {
        sanitize_error_message(&format!("Critical error: {self}"))
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join {
            message: e.to_string(),
        }
    }
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

fn secret_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok())
        .as_ref()
}

fn sensitive_path_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
        })
        .as_ref()
}

/// Redact secrets and sensitive paths, then cap the length at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(re) = secret_pattern() {
        sanitized = re.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(re) = sensitive_path_pattern() {
        sanitized = re.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], TRUNCATE_SUFFIX);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Operation;

    #[test]
    fn test_user_message_marks_critical_error() {
        let error = PipelineError::from(GatewayError::Unavailable {
            operation: Operation::TestHistory,
            status: 502,
        });
        let message = error.user_message();
        assert!(message.starts_with("Critical error:"));
        assert!(message.contains("502"));
    }

    #[test]
    fn test_error_message_sanitization() {
        let sanitized =
            sanitize_error_message("Failed to authenticate: password=secret123 token=abc456");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_long_message_truncation() {
        let long_message = "x".repeat(600);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let long_message = "ж".repeat(400);
        let sanitized = sanitize_error_message(&long_message);

        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let message = "Failed to read /home/user/.ssh/id_rsa and /etc/secrets/api.key";
        let sanitized = sanitize_error_message(message);

        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_sanitize_case_insensitive() {
        let sanitized = sanitize_error_message("PASSWORD=secret123 Token=abc Key=xyz");

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_sanitize_exactly_500_chars() {
        let message = "x".repeat(500);
        let sanitized = sanitize_error_message(&message);
        assert_eq!(sanitized.len(), 500);
        assert!(!sanitized.contains("truncated"));
    }

    #[test]
    fn test_ingest_error_converts() {
        let error: PipelineError = IngestError::Birthday {
            line: 7,
            value: "??".to_string(),
        }
        .into();
        assert!(error.to_string().contains("Line 7"));
    }

    #[test]
    fn test_unreadable_workbook_is_reported_as_spreadsheet_error() {
        let error: PipelineError = WorkbookError::Open {
            path: "uploads/march.xlsx".to_string(),
            message: "invalid zip header".to_string(),
        }
        .into();

        assert!(matches!(error, PipelineError::Workbook(_)));
        assert_eq!(
            error.user_message(),
            "Critical error: Spreadsheet error: Failed to open workbook uploads/march.xlsx: \
             invalid zip header"
        );
    }
}
