use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Maximum length of a receipt step identifier.
pub const RECEIPT_STEP_MAX_CHARS: usize = 128;

/// Maximum number of receipts a single invocation may carry.
pub const RECEIPTS_MAX: usize = 32;

/// A caller-supplied claim that an equivalent processing step was already
/// performed on the caller's side, identified by a content digest.
///
/// The gateway checks only the structural shape of a receipt and forwards
/// it; it never verifies what the digest covers — that is the backend's
/// (or the caller's) contract.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Receipt {
    /// Which processing step the receipt covers (e.g. "dedupe", "enrich").
    pub step: String,
    /// Hex-encoded digest of the step's input/output pair.
    pub digest: String,
    /// Digest algorithm. Only "sha256" is accepted.
    pub algorithm: String,
}

/// Optional external-context envelope attached to an invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct ContextEnvelope {
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub receipts: Vec<Receipt>,
}

/// Structural validation failures for receipts.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReceiptError {
    #[error("receipt step must be 1..={RECEIPT_STEP_MAX_CHARS} characters")]
    InvalidStep,
    #[error("receipt algorithm must be \"sha256\"")]
    UnsupportedAlgorithm,
    #[error("receipt digest must be 64 lowercase hex characters")]
    InvalidDigest,
    #[error("at most {RECEIPTS_MAX} receipts are allowed")]
    TooManyReceipts,
}

impl Receipt {
    /// Shape check only: step bounds, algorithm tag, digest format.
    pub fn validate_shape(&self) -> Result<(), ReceiptError> {
        let step = self.step.trim();
        if step.is_empty() || step.chars().count() > RECEIPT_STEP_MAX_CHARS {
            return Err(ReceiptError::InvalidStep);
        }
        if self.algorithm != "sha256" {
            return Err(ReceiptError::UnsupportedAlgorithm);
        }
        if self.digest.len() != 64
            || !self
                .digest
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ReceiptError::InvalidDigest);
        }
        Ok(())
    }
}

impl ContextEnvelope {
    pub fn validate_shape(&self) -> Result<(), ReceiptError> {
        if self.receipts.len() > RECEIPTS_MAX {
            return Err(ReceiptError::TooManyReceipts);
        }
        for receipt in &self.receipts {
            receipt.validate_shape()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt(digest: &str) -> Receipt {
        Receipt {
            step: "dedupe".to_string(),
            digest: digest.to_string(),
            algorithm: "sha256".to_string(),
        }
    }

    #[test]
    fn well_formed_receipt_passes() {
        let valid = receipt(&"ab12".repeat(16));
        assert_eq!(valid.validate_shape(), Ok(()));
    }

    #[test]
    fn digest_must_be_64_lowercase_hex() {
        assert_eq!(
            receipt("abc").validate_shape(),
            Err(ReceiptError::InvalidDigest)
        );
        assert_eq!(
            receipt(&"AB12".repeat(16)).validate_shape(),
            Err(ReceiptError::InvalidDigest)
        );
        assert_eq!(
            receipt(&"zz12".repeat(16)).validate_shape(),
            Err(ReceiptError::InvalidDigest)
        );
    }

    #[test]
    fn only_sha256_is_accepted() {
        let mut bad = receipt(&"ab12".repeat(16));
        bad.algorithm = "md5".to_string();
        assert_eq!(
            bad.validate_shape(),
            Err(ReceiptError::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn envelope_bounds_receipt_count() {
        let envelope = ContextEnvelope {
            receipts: vec![receipt(&"ab12".repeat(16)); RECEIPTS_MAX + 1],
        };
        assert_eq!(
            envelope.validate_shape(),
            Err(ReceiptError::TooManyReceipts)
        );
    }
}
