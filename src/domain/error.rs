//! Error types shared by the connectivity engine

use thiserror::Error;

/// Reason a transport gave for refusing or losing access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Cancelled,
    ChannelUnavailable,
    DeviceBusy,
    Timeout,
    AdapterAbsent,
    BadParameters,
    DependencyMissing,
    Unrecognized,
}

/// Coarse view of a [`FailureClass`], used for diagnostics only. Every class
/// goes through the same teardown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureSeverity {
    Recoverable,
    Terminal,
}

impl FailureClass {
    pub fn severity(&self) -> FailureSeverity {
        match self {
            Self::Cancelled | Self::ChannelUnavailable | Self::DeviceBusy | Self::Timeout => {
                FailureSeverity::Recoverable
            }
            Self::AdapterAbsent
            | Self::BadParameters
            | Self::DependencyMissing
            | Self::Unrecognized => FailureSeverity::Terminal,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Cancelled => "search cancelled",
            Self::ChannelUnavailable => "no radio channel available",
            Self::DeviceBusy => "remote is busy",
            Self::Timeout => "search timed out",
            Self::AdapterAbsent => "radio adapter not present",
            Self::BadParameters => "invalid connection parameters",
            Self::DependencyMissing => "radio service not installed",
            Self::Unrecognized => "unrecognized failure",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.describe())
    }
}

/// Errors raised synchronously by transport primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    #[error("Missing permission: {0}")]
    PermissionDenied(String),

    #[error("Radio adapter unavailable")]
    AdapterUnavailable,

    #[error("Access failed: {0}")]
    Failed(FailureClass),

    #[error("Operation not supported by this transport")]
    Unsupported,
}

/// Errors surfaced by the connectivity engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Connection failed: {0}")]
    ConnectFailure(FailureClass),

    #[error("Protocol failure: {0}")]
    ProtocolFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Host action dispatch failed")]
    Dispatch,

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Connection worker stopped")]
    ChannelClosed,
}

impl From<AccessError> for RemoteError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::PermissionDenied(permission) => RemoteError::PermissionDenied(permission),
            AccessError::AdapterUnavailable => {
                RemoteError::TransportUnavailable("radio adapter is off or absent".to_string())
            }
            AccessError::Failed(class) => RemoteError::ConnectFailure(class),
            AccessError::Unsupported => {
                RemoteError::ProtocolFailure("operation not supported".to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_error_conversion() {
        assert_eq!(
            RemoteError::from(AccessError::PermissionDenied("BLUETOOTH_SCAN".into())),
            RemoteError::PermissionDenied("BLUETOOTH_SCAN".into())
        );
        assert!(matches!(
            RemoteError::from(AccessError::AdapterUnavailable),
            RemoteError::TransportUnavailable(_)
        ));
        assert_eq!(
            RemoteError::from(AccessError::Failed(FailureClass::Timeout)),
            RemoteError::ConnectFailure(FailureClass::Timeout)
        );
    }

    #[test]
    fn test_failure_severity() {
        assert_eq!(FailureClass::Timeout.severity(), FailureSeverity::Recoverable);
        assert_eq!(FailureClass::AdapterAbsent.severity(), FailureSeverity::Terminal);
        assert_eq!(
            RemoteError::ConnectFailure(FailureClass::DeviceBusy).to_string(),
            "Connection failed: remote is busy"
        );
    }
}
