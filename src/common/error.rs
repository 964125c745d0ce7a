//! Error types for dcfed

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    // === Membership Errors ===
    #[error("Join failed: {0}")]
    JoinFailed(String),

    #[error("Encryption mismatch joining {0}")]
    EncryptionMismatch(String),

    #[error("Membership pool is shut down")]
    PoolShutdown,

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No cluster leader")]
    NoLeader,

    #[error("Cluster already bootstrapped")]
    AlreadyBootstrapped,

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Consensus module is shut down")]
    ConsensusShutdown,

    // === Routing Errors ===
    #[error("No path to datacenter: {0}")]
    NoPathToDatacenter(String),

    // === RPC Errors ===
    #[error("Unknown rpc method: {0}")]
    UnknownMethod(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("RPC {method} failed in datacenter {datacenter}: {reason}")]
    Remote {
        method: String,
        datacenter: String,
        reason: String,
    },

    #[error("Global RPC {method} failed: {}", describe_failures(.failures))]
    GlobalRpc {
        method: String,
        failures: Vec<(String, String)>,
    },

    #[error("Codec error: {0}")]
    Codec(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Lifecycle Errors ===
    #[error("Invalid state: {0}")]
    InvalidState(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

fn describe_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(dc, reason)| format!("[{dc}] {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_)
                | Error::ConnectionFailed(_)
                | Error::NoLeader
                | Error::NotLeader(_)
                | Error::NoPathToDatacenter(_)
        )
    }

    /// Configuration races that concurrent convergence produces on purpose.
    pub fn is_config_race(&self) -> bool {
        matches!(
            self,
            Error::AlreadyBootstrapped | Error::NotLeader(_) | Error::NoLeader
        )
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::UnknownMethod(_) => StatusCode::NOT_FOUND,
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::NoLeader | Error::NoPathToDatacenter(_) | Error::ConsensusShutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NoLeader.is_retryable());
        assert!(Error::ConnectionFailed("down".into()).is_retryable());
        assert!(!Error::UnknownMethod("Bad.Method".into()).is_retryable());
        assert!(!Error::AlreadyBootstrapped.is_retryable());
    }

    #[test]
    fn test_global_rpc_message_names_method_and_datacenters() {
        let err = Error::GlobalRpc {
            method: "Bad.Method".to_string(),
            failures: vec![
                ("dc2".to_string(), "Unknown rpc method: Bad.Method".to_string()),
                ("dc3".to_string(), "Operation timeout: dc3".to_string()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Bad.Method"));
        assert!(msg.contains("dc2"));
        assert!(msg.contains("dc3"));
    }

    #[test]
    fn test_http_status_mapping() {
        use axum::http::StatusCode;
        assert_eq!(Error::NoLeader.to_http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            Error::UnknownMethod("x".into()).to_http_status(),
            StatusCode::NOT_FOUND
        );
    }
}
