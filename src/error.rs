// ⚠️ Error Taxonomy - run-level failures
// Row-level problems never abort a batch; everything else here aborts the run

use thiserror::Error;

use crate::pin::ChallengeError;
use crate::secrets::SecretKind;

/// Failure of a whole pipeline run (or of one step inside it).
///
/// `RowImport` is the only non-fatal variant: the sync engine records it in
/// the result and keeps going.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Login rejected by the portal
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// PIN position / digit-count mismatch
    #[error("PIN challenge protocol error: {0}")]
    ChallengeProtocol(#[from] ChallengeError),

    /// Expected page state never reached within a bounded wait
    #[error("portal navigation failed: {0}")]
    PortalNavigation(String),

    /// Ledger server unreachable or credentials rejected
    #[error("ledger connection error: {0}")]
    LedgerConnection(String),

    /// One record failed to map (isolated, non-fatal)
    #[error("row {row}: {message}")]
    RowImport { row: String, message: String },

    /// Atomic ledger write failed
    #[error("commit failed: {0}")]
    Commit(String),

    /// Nobody answered a secret request in time
    #[error("no answer for '{}' within {secs}s", .kind.label())]
    SecretTimeout { kind: SecretKind, secs: u64 },

    /// The automation asked for a secret out of the declared order
    #[error("secret request out of sequence: expected {expected:?}, got {requested:?}")]
    SecretSequence {
        expected: Option<SecretKind>,
        requested: SecretKind,
    },

    #[error("a run is already in progress")]
    RunInProgress,

    #[error("unknown bank '{0}'")]
    UnknownBank(String),

    #[error("no ledger mapping saved for source '{0}'")]
    MissingMapping(String),
}

impl SyncError {
    /// Whether this error must abort the whole run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::RowImport { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_row_errors_are_non_fatal() {
        let row = SyncError::RowImport {
            row: "4".to_string(),
            message: "bad date".to_string(),
        };
        assert!(!row.is_fatal());
        assert!(SyncError::Commit("disk full".to_string()).is_fatal());
        assert!(SyncError::LedgerConnection("refused".to_string()).is_fatal());
    }

    #[test]
    fn test_timeout_message_uses_label() {
        let err = SyncError::SecretTimeout {
            kind: SecretKind::AccessKey,
            secs: 30,
        };
        assert_eq!(err.to_string(), "no answer for 'access key' within 30s");
    }
}
