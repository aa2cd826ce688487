//! Transfer attempt status values stored in the audit ledger.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

/// Lifecycle status of a single transfer attempt.
///
/// `InProgress` is written before a move starts and transitions exactly
/// once to `Success` or `Failed`. `Blacklisted` rows are written directly
/// when the peer denies a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    InProgress,
    Success,
    Failed,
    Blacklisted,
}

impl TransferStatus {
    /// Database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blacklisted => "blacklisted",
        }
    }

    /// Whether the status is final (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "blacklisted" => Ok(Self::Blacklisted),
            other => Err(CoreError::UnknownValue {
                field: "transfer status",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for TransferStatus {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Error text written when a prior session left a row `InProgress`.
pub const INTERRUPTED_ERROR: &str = "interrupted";

/// One row of the audit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAttempt {
    pub id: DbId,
    pub session_id: String,
    pub timestamp: Timestamp,
    pub file_name: String,
    pub source_path: String,
    pub destination_path: String,
    pub rule_name: String,
    pub file_size: i64,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub attempt_count: i64,
}

/// Data for a new ledger row. The ledger fills in id, session and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransferAttempt {
    pub file_name: String,
    pub source_path: String,
    pub destination_path: String,
    pub rule_name: String,
    pub file_size: i64,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub attempt_count: i64,
}

impl NewTransferAttempt {
    /// A pre-move record: `InProgress`, no attempts yet.
    pub fn in_progress(
        file_name: impl Into<String>,
        source_path: impl Into<String>,
        destination_path: impl Into<String>,
        rule_name: impl Into<String>,
        file_size: i64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            rule_name: rule_name.into(),
            file_size,
            status: TransferStatus::InProgress,
            error_message: None,
            attempt_count: 0,
        }
    }

    /// Same attempt with a different initial status and error text.
    pub fn with_status(mut self, status: TransferStatus, error: Option<String>) -> Self {
        self.status = status;
        self.error_message = error;
        self
    }
}

/// Final outcome written over an `InProgress` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub attempt_count: i64,
}

impl TransferOutcome {
    pub fn success(attempt_count: i64) -> Self {
        Self {
            status: TransferStatus::Success,
            error_message: None,
            attempt_count,
        }
    }

    pub fn failed(error: impl Into<String>, attempt_count: i64) -> Self {
        Self {
            status: TransferStatus::Failed,
            error_message: Some(error.into()),
            attempt_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_database_value() {
        for status in [
            TransferStatus::InProgress,
            TransferStatus::Success,
            TransferStatus::Failed,
            TransferStatus::Blacklisted,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_value_is_rejected() {
        assert!("done".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn only_in_progress_is_open() {
        assert!(!TransferStatus::InProgress.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
    }
}
