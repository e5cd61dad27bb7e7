//! Error types for the sync engine
//!
//! Typed errors cross the engine boundary; the shell renders them as strings.

/// Main error type for sync engine operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // === OBS connection ===
    #[error("OBS authentication failed: {0}")]
    Auth(String),

    #[error("connection refused by {0}")]
    ConnectRefused(String),

    #[error("timed out after {0} s")]
    Timeout(u64),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("OBS is not connected")]
    NotConnected,

    // === Master transport ===
    #[error("port {0} is already in use")]
    BindInUse(u16),

    #[error("no permission to bind port {0}")]
    BindPermission(u16),

    #[error("not running")]
    NotRunning,

    #[error("peer is gone")]
    PeerGone,

    // === Message handling ===
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("failed to apply: {0}")]
    ApplyFailed(String),

    #[error("no scene hosts source '{0}'")]
    SceneResolutionFailed(String),

    #[error("image of {size} bytes exceeds the {limit} byte limit")]
    ImageTooLarge { size: usize, limit: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an apply error
    pub fn apply(msg: impl Into<String>) -> Self {
        Self::ApplyFailed(msg.into())
    }

    /// Create a malformed payload error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    /// Map a bind failure to the matching taxonomy entry
    pub fn from_bind_error(err: std::io::Error, port: u16) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => Self::BindInUse(port),
            std::io::ErrorKind::PermissionDenied => Self::BindPermission(port),
            _ => Self::Io(err),
        }
    }

    /// Whether reconnecting could plausibly clear this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectRefused(_) | Self::Timeout(_) | Self::PeerGone
        )
    }
}

/// Result type alias using SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::BindInUse(8080);
        assert_eq!(err.to_string(), "port 8080 is already in use");

        let err = SyncError::ImageTooLarge {
            size: 20_000_000,
            limit: 16_777_216,
        };
        assert!(err.to_string().contains("20000000"));
        assert!(err.to_string().contains("16777216"));
    }

    #[test]
    fn test_bind_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        assert!(matches!(
            SyncError::from_bind_error(err, 9001),
            SyncError::BindInUse(9001)
        ));

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            SyncError::from_bind_error(err, 80),
            SyncError::BindPermission(80)
        ));

        let err = std::io::Error::new(std::io::ErrorKind::Other, "other");
        assert!(matches!(
            SyncError::from_bind_error(err, 9001),
            SyncError::Io(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(SyncError::ConnectRefused("10.0.0.2:8080".into()).is_retryable());
        assert!(SyncError::Timeout(5).is_retryable());
        assert!(!SyncError::Auth("bad password".into()).is_retryable());
        assert!(!SyncError::NotRunning.is_retryable());
    }
}
