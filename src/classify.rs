//! Failure classification.
//!
//! Maps every [`DeviceError`] kind into a recovery category with a fixed
//! user-facing message. This is the single source of truth for retry
//! decisions: the reconnection loop and the request dispatcher both consult
//! it and nothing else. `classify` is deterministic and side-effect-free so
//! its output can be asserted directly.

use serde::Serialize;

use crate::device::DeviceError;

/// Recovery category of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient transport trouble; the reconnection loop retries these.
    Retryable,
    /// Credential or capability problems; only the user can fix these.
    NonRetryable,
    /// The pairing handshake itself failed.
    Pairing,
    /// Nothing is known about this failure.
    Unknown,
}

/// What the client should do about a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    AutomaticRetry,
    UserIntervention,
    RetryPairing,
    None,
}

/// Structured classification of one failure. Computed fresh each time,
/// never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub category: ErrorCategory,
    /// Stable failure kind name, e.g. `ConnectionLost`.
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Fixed user-facing message for this kind.
    pub message: &'static str,
    #[serde(rename = "action_required")]
    pub action: RecoveryAction,
    pub should_retry: bool,
    /// Raw diagnostic text of the underlying failure.
    #[serde(rename = "technical_message")]
    pub detail: String,
}

/// Classifies a device failure into a recovery category.
#[must_use]
pub fn classify(error: &DeviceError) -> Classification {
    use DeviceError::*;

    let (category, message) = match error {
        ConnectionFailed(_) => (
            ErrorCategory::Retryable,
            "Cannot reach the device. Check that it's powered on and on the same network.",
        ),
        ConnectionLost(_) => (
            ErrorCategory::Retryable,
            "Connection to the device was lost. Reconnecting...",
        ),
        Protocol(_) => (
            ErrorCategory::Retryable,
            "Communication error with the device. Retrying...",
        ),
        Timeout(_) => (
            ErrorCategory::Retryable,
            "The device is not responding. It may be asleep or busy.",
        ),
        Authentication(_) => (
            ErrorCategory::NonRetryable,
            "Authentication failed. Please re-pair your device.",
        ),
        InvalidCredentials(_) => (
            ErrorCategory::NonRetryable,
            "Stored credentials are invalid. Please re-pair your device.",
        ),
        NoCredentials(_) => (
            ErrorCategory::NonRetryable,
            "No pairing credentials found. Please pair your device first.",
        ),
        NotSupported(_) => (
            ErrorCategory::NonRetryable,
            "This feature is not supported by your device.",
        ),
        NoService(_) => (
            ErrorCategory::NonRetryable,
            "No compatible service found on the device. Try scanning again.",
        ),
        Pairing(_) => (ErrorCategory::Pairing, "Pairing failed. Please try again."),
        BackOff(_) => (
            ErrorCategory::Pairing,
            "Too many attempts. Please wait before trying again.",
        ),
        NotConnected | Settings(_) | Other(_) => {
            (ErrorCategory::Unknown, "An unexpected error occurred.")
        }
    };

    let (action, should_retry) = match category {
        ErrorCategory::Retryable => (RecoveryAction::AutomaticRetry, true),
        ErrorCategory::NonRetryable => (RecoveryAction::UserIntervention, false),
        ErrorCategory::Pairing => (RecoveryAction::RetryPairing, false),
        ErrorCategory::Unknown => (RecoveryAction::None, false),
    };

    Classification {
        category,
        kind: error.kind_name(),
        message,
        action,
        should_retry,
        detail: error.to_string(),
    }
}

/// Whether a failure means stored credentials are no longer usable.
#[must_use]
pub fn requires_repairing(error: &DeviceError) -> bool {
    matches!(
        error,
        DeviceError::Authentication(_)
            | DeviceError::InvalidCredentials(_)
            | DeviceError::NoCredentials(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryable_kinds() -> Vec<DeviceError> {
        vec![
            DeviceError::ConnectionFailed("refused".into()),
            DeviceError::ConnectionLost("reset by peer".into()),
            DeviceError::Protocol("bad frame".into()),
            DeviceError::Timeout("no reply in 10s".into()),
        ]
    }

    fn non_retryable_kinds() -> Vec<DeviceError> {
        vec![
            DeviceError::Authentication("rejected".into()),
            DeviceError::InvalidCredentials("stale".into()),
            DeviceError::NoCredentials("none stored".into()),
            DeviceError::NotSupported("no such op".into()),
            DeviceError::NoService("nothing usable".into()),
        ]
    }

    #[test]
    fn retryable_set_recommends_automatic_retry() {
        for error in retryable_kinds() {
            let c = classify(&error);
            assert_eq!(c.category, ErrorCategory::Retryable, "{error}");
            assert_eq!(c.action, RecoveryAction::AutomaticRetry);
            assert!(c.should_retry);
        }
    }

    #[test]
    fn non_retryable_set_requires_user_intervention() {
        for error in non_retryable_kinds() {
            let c = classify(&error);
            assert_eq!(c.category, ErrorCategory::NonRetryable, "{error}");
            assert_eq!(c.action, RecoveryAction::UserIntervention);
            assert!(!c.should_retry);
        }
    }

    #[test]
    fn pairing_set_recommends_retry_pairing() {
        for error in [
            DeviceError::Pairing("handshake failed".into()),
            DeviceError::BackOff("cool down".into()),
        ] {
            let c = classify(&error);
            assert_eq!(c.category, ErrorCategory::Pairing);
            assert_eq!(c.action, RecoveryAction::RetryPairing);
            assert!(!c.should_retry);
        }
    }

    #[test]
    fn unrecognized_kinds_are_unknown() {
        let c = classify(&DeviceError::Other("garbage in the pipe".into()));
        assert_eq!(c.category, ErrorCategory::Unknown);
        assert_eq!(c.action, RecoveryAction::None);
        assert!(!c.should_retry);
        assert_eq!(c.detail, "garbage in the pipe");
    }

    #[test]
    fn classification_is_deterministic() {
        let error = DeviceError::Timeout("no reply".into());
        assert_eq!(classify(&error), classify(&error));
    }

    #[test]
    fn repairing_flag_covers_credential_kinds_only() {
        assert!(requires_repairing(&DeviceError::Authentication("x".into())));
        assert!(requires_repairing(&DeviceError::InvalidCredentials("x".into())));
        assert!(requires_repairing(&DeviceError::NoCredentials("x".into())));
        assert!(!requires_repairing(&DeviceError::ConnectionLost("x".into())));
        assert!(!requires_repairing(&DeviceError::Pairing("x".into())));
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let value =
            serde_json::to_value(classify(&DeviceError::ConnectionLost("gone".into()))).unwrap();
        assert_eq!(value["category"], "retryable");
        assert_eq!(value["type"], "ConnectionLost");
        assert_eq!(value["action_required"], "automatic_retry");
        assert_eq!(value["should_retry"], true);
        assert_eq!(value["technical_message"], "connection lost: gone");
    }
}
