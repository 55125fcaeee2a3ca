use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Maximum length of the human-readable `output` summary on a task result.
pub const OUTPUT_MAX_CHARS: usize = 4_000;

/// Maximum number of attachments a single result submission may carry.
pub const ATTACHMENTS_MAX: usize = 16;

/// Maximum length of an attachment filename.
pub const ATTACHMENT_FILENAME_MAX_CHARS: usize = 255;

/// Lifecycle state of a dispatched task.
///
/// `completed` and `failed` are terminal — once reached, a task never
/// transitions again; replayed submissions return the recorded outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Reserved,
    Acknowledged,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Reserved => "reserved",
            TaskStatus::Acknowledged => "acknowledged",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Terminal status a worker may submit for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
}

impl From<TerminalStatus> for TaskStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Completed => TaskStatus::Completed,
            TerminalStatus::Failed => TaskStatus::Failed,
        }
    }
}

/// Content encoding of a result attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum AttachmentEncoding {
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "base64")]
    Base64,
}

/// A file-shaped artifact attached to a task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Attachment {
    pub filename: String,
    pub content: String,
    pub encoding: AttachmentEncoding,
}

/// A worker's view of a reserved task — everything needed to execute it
/// and to keep the lease alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskLease {
    pub execution_id: Uuid,
    pub lease_id: Uuid,
    pub workspace_id: Uuid,
    /// Canonical capability identifier (`pack.action`) this task executes.
    pub capability: String,
    pub payload: serde_json::Value,
    pub status: TaskStatus,
    pub lease_expires_at: DateTime<Utc>,
    pub cumulative_lease_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
}

/// The recorded outcome of a terminal task. Returned verbatim on replayed
/// submissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TaskOutcome {
    pub status: TerminalStatus,
    /// Bounded human-readable summary of what happened.
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attachments: Vec<Attachment>,
    pub recorded_at: DateTime<Utc>,
}

/// Acknowledgement of a result submission. `replayed` marks an idempotent
/// replay of an already-terminal task: the outcome is the one recorded by
/// the first submission, and no side effects ran again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SubmitReceipt {
    pub execution_id: Uuid,
    pub replayed: bool,
    pub outcome: TaskOutcome,
}

/// Validation failures for dispatch payload fields.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("output must not be empty")]
    EmptyOutput,
    #[error("output must be <= {OUTPUT_MAX_CHARS} characters")]
    OutputTooLong,
    #[error("at most {ATTACHMENTS_MAX} attachments are allowed")]
    TooManyAttachments,
    #[error("attachment filename must be 1..={ATTACHMENT_FILENAME_MAX_CHARS} characters")]
    InvalidFilename,
    #[error("attachment content is not valid base64")]
    InvalidBase64,
}

/// Validates the bounded `output` summary of a result submission.
pub fn validate_output(output: &str) -> Result<(), PayloadError> {
    if output.trim().is_empty() {
        return Err(PayloadError::EmptyOutput);
    }
    if output.chars().count() > OUTPUT_MAX_CHARS {
        return Err(PayloadError::OutputTooLong);
    }
    Ok(())
}

/// Structural validation of result attachments. Base64 content must decode;
/// utf-8 content is accepted as-is (it is already a valid Rust string).
pub fn validate_attachments(attachments: &[Attachment]) -> Result<(), PayloadError> {
    use base64::Engine;

    if attachments.len() > ATTACHMENTS_MAX {
        return Err(PayloadError::TooManyAttachments);
    }
    for attachment in attachments {
        let filename = attachment.filename.trim();
        if filename.is_empty() || filename.chars().count() > ATTACHMENT_FILENAME_MAX_CHARS {
            return Err(PayloadError::InvalidFilename);
        }
        if attachment.encoding == AttachmentEncoding::Base64
            && base64::engine::general_purpose::STANDARD
                .decode(attachment.content.as_bytes())
                .is_err()
        {
            return Err(PayloadError::InvalidBase64);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Reserved.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn status_wire_names_are_snake_case() {
        let encoded = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(encoded, "\"in_progress\"");
        let decoded: TerminalStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(decoded, TerminalStatus::Failed);
    }

    #[test]
    fn output_validation_rejects_empty_and_oversized() {
        assert_eq!(validate_output("   "), Err(PayloadError::EmptyOutput));
        assert_eq!(
            validate_output(&"x".repeat(OUTPUT_MAX_CHARS + 1)),
            Err(PayloadError::OutputTooLong)
        );
        assert_eq!(validate_output("done"), Ok(()));
    }

    #[test]
    fn attachment_validation_checks_base64_shape() {
        let good = Attachment {
            filename: "report.bin".to_string(),
            content: "aGVsbG8=".to_string(),
            encoding: AttachmentEncoding::Base64,
        };
        assert_eq!(validate_attachments(std::slice::from_ref(&good)), Ok(()));

        let bad = Attachment {
            content: "not base64 !!!".to_string(),
            ..good.clone()
        };
        assert_eq!(
            validate_attachments(&[bad]),
            Err(PayloadError::InvalidBase64)
        );

        let unnamed = Attachment {
            filename: " ".to_string(),
            ..good
        };
        assert_eq!(
            validate_attachments(&[unnamed]),
            Err(PayloadError::InvalidFilename)
        );
    }

    #[test]
    fn utf8_attachments_skip_base64_decoding() {
        let attachment = Attachment {
            filename: "notes.txt".to_string(),
            content: "plain text, definitely not base64 !!!".to_string(),
            encoding: AttachmentEncoding::Utf8,
        };
        assert_eq!(validate_attachments(&[attachment]), Ok(()));
    }
}
