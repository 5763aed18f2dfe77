//! Remote error classification.
//!
//! Maps every `RemoteError` to the action the sync engine takes. The mapping
//! is total: codes nobody planned for disable sync instead of being retried
//! or dropped.

use crate::remote::{RecordId, RemoteError};
use std::collections::BTreeMap;
use std::time::Duration;

/// What to do about a remote error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Stop syncing until the user re-enables it
    Disable(String),
    /// Stop and start again after the delay
    RetryAfter(Duration),
    /// Halve the failing processor's batch size and retry next cycle
    ShrinkBatch,
    /// Drop the stored change token and fetch everything again
    ResetChangeToken,
    /// Some items failed; handle each on its own
    PerItem(BTreeMap<RecordId, RemoteError>),
    /// The item changed remotely since we last saw it
    Conflict,
    /// The item no longer exists remotely
    Vanished,
    /// The item failed only because a sibling in its batch did
    RetryItem,
}

/// Classify `error`, using `default_retry` when a transient error carries
/// no retry hint.
pub fn classify(error: &RemoteError, default_retry: Duration) -> Strategy {
    use RemoteError::*;

    match error {
        QuotaExceeded | NotAuthenticated | PermissionFailure | UserDeletedZone
        | IncompatibleVersion => Strategy::Disable(error.to_string()),

        NetworkUnavailable
        | NetworkFailure
        | ServiceUnavailable { .. }
        | RateLimited { .. }
        | ZoneBusy { .. }
        | InternalError
        | ServerResponseLost
        // The zone gets recreated on the next start.
        | ZoneNotFound => Strategy::RetryAfter(error.retry_after().unwrap_or(default_retry)),

        LimitExceeded => Strategy::ShrinkBatch,
        ChangeTokenExpired => Strategy::ResetChangeToken,
        PartialFailure { failures, .. } => Strategy::PerItem(failures.clone()),
        ServerRecordChanged => Strategy::Conflict,
        UnknownItem => Strategy::Vanished,
        BatchRequestFailed => Strategy::RetryItem,

        Unknown(code) => Strategy::Disable(format!("Unexpected remote error: {code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: Duration = Duration::from_secs(30);

    #[test]
    fn test_account_errors_disable() {
        for error in [
            RemoteError::QuotaExceeded,
            RemoteError::NotAuthenticated,
            RemoteError::PermissionFailure,
            RemoteError::UserDeletedZone,
            RemoteError::IncompatibleVersion,
        ] {
            assert!(
                matches!(classify(&error, DEFAULT), Strategy::Disable(_)),
                "{error:?}"
            );
        }
    }

    #[test]
    fn test_transient_errors_use_server_hint() {
        let error = RemoteError::RateLimited {
            retry_after: Some(Duration::from_secs(5)),
        };
        assert_eq!(
            classify(&error, DEFAULT),
            Strategy::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            classify(&RemoteError::NetworkUnavailable, DEFAULT),
            Strategy::RetryAfter(DEFAULT)
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(classify(&RemoteError::LimitExceeded, DEFAULT), Strategy::ShrinkBatch);
        assert_eq!(
            classify(&RemoteError::ChangeTokenExpired, DEFAULT),
            Strategy::ResetChangeToken
        );
        assert_eq!(classify(&RemoteError::ServerRecordChanged, DEFAULT), Strategy::Conflict);
        assert_eq!(classify(&RemoteError::UnknownItem, DEFAULT), Strategy::Vanished);
        assert_eq!(classify(&RemoteError::BatchRequestFailed, DEFAULT), Strategy::RetryItem);
    }

    #[test]
    fn test_partial_failure_unpacks_items() {
        let zone = crate::remote::ZoneId::new("Sheets", "__defaultOwner__");
        let mut failures = BTreeMap::new();
        failures.insert(RecordId::new(zone, "a"), RemoteError::UnknownItem);
        let error = RemoteError::PartialFailure {
            failures: failures.clone(),
            saved: Vec::new(),
        };
        assert_eq!(classify(&error, DEFAULT), Strategy::PerItem(failures));
    }

    #[test]
    fn test_unknown_fails_safe() {
        assert!(matches!(
            classify(&RemoteError::Unknown("E_WHAT".into()), DEFAULT),
            Strategy::Disable(_)
        ));
    }
}
