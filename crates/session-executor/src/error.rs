//! Error types for remote execution sessions

use thiserror::Error;

/// Unified error type for session operations
///
/// Variants fall into three families that callers are expected to tell apart:
/// transport failures ([`Error::is_transport`]), operation failures
/// ([`Error::is_operation`]) and session misuse ([`Error::is_misuse`]).
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to spawn the execution host process
    #[error("failed to spawn execution host: {reason}")]
    SpawnFailed {
        /// The reason for the spawn failure
        reason: String,
    },

    /// The target could not be reached
    #[error("connection to {host} failed: {reason}")]
    Connection {
        /// The node the connection was opened against
        host: String,
        /// The detailed reason for the connection failure
        reason: String,
    },

    /// The target rejected the supplied credentials
    #[error("authentication rejected by {host}: {reason}")]
    Authentication {
        /// The node that rejected the credentials
        host: String,
        /// Remote error text
        reason: String,
    },

    /// The execution host exited or closed its output mid-session
    #[error("execution host for {host} exited: {reason}")]
    HostExited {
        /// The node the host process was serving
        host: String,
        /// Exit status or last known state
        reason: String,
    },

    /// The host wrote something that is not a valid response envelope
    #[error("malformed response from execution host: {reason}")]
    Protocol {
        /// What was wrong with the response
        reason: String,
    },

    /// The operation library could not be located or is the wrong version
    #[error("operation library unavailable at {path}: {reason}")]
    LibraryUnavailable {
        /// Where the library was expected
        path: String,
        /// Why it could not be used
        reason: String,
    },

    /// Initializing a session failed; the cause says whether the transport
    /// handshake or the library load was at fault
    #[error("session initialization failed for {node}: {source}")]
    SessionInitialization {
        /// Node the session targets
        node: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// The operation ran but wrote to its error channel
    #[error("operation {operation} failed: {message}")]
    Operation {
        /// Operation name (or `<script>` for inline scripts)
        operation: String,
        /// Aggregated remote error text
        message: String,
    },

    /// The operation returned records that do not match its schema
    #[error("operation {operation} returned unexpected records: {reason}")]
    Decode {
        /// Operation name
        operation: String,
        /// Validation failure
        reason: String,
    },

    /// The session was used outside the `Initialized` state
    #[error("cannot {action} a session in state {state}")]
    InvalidState {
        /// What the caller attempted
        action: &'static str,
        /// State the session was in
        state: String,
    },

    /// A node identity string could not be parsed
    #[error("invalid node identity '{input}': {reason}")]
    InvalidNode {
        /// Raw input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding error while marshalling a request
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a spawn failed error
    pub fn spawn_failed(reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            reason: reason.into(),
        }
    }

    /// Create an operation error
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Wrap this error as an initialization failure for `node`
    pub fn during_initialization(self, node: impl Into<String>) -> Self {
        match self {
            already @ Error::SessionInitialization { .. } => already,
            other => Error::SessionInitialization {
                node: node.into(),
                source: Box::new(other),
            },
        }
    }

    /// True when the channel to the node itself failed (unreachable host,
    /// rejected credentials, dead host process)
    pub fn is_transport(&self) -> bool {
        match self {
            Error::SpawnFailed { .. }
            | Error::Connection { .. }
            | Error::Authentication { .. }
            | Error::HostExited { .. }
            | Error::Protocol { .. }
            | Error::Io(_) => true,
            Error::SessionInitialization { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// True when the remote operation executed and reported a failure
    pub fn is_operation(&self) -> bool {
        matches!(self, Error::Operation { .. } | Error::Decode { .. })
    }

    /// True when the session was driven outside its lifecycle
    pub fn is_misuse(&self) -> bool {
        matches!(self, Error::InvalidState { .. })
    }

    /// The raw remote error text, when there is one
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Error::Operation { message, .. } => Some(message),
            Error::Connection { reason, .. }
            | Error::Authentication { reason, .. }
            | Error::HostExited { reason, .. } => Some(reason),
            Error::SessionInitialization { source, .. } => source.remote_message(),
            _ => None,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_families() {
        let transport = Error::Connection {
            host: "web01".to_string(),
            reason: "no route".to_string(),
        };
        assert!(transport.is_transport());
        assert!(!transport.is_operation());

        let op = Error::operation("Install-FleetCertificate", "disk full");
        assert!(op.is_operation());
        assert!(!op.is_transport());
        assert_eq!(op.remote_message(), Some("disk full"));

        let misuse = Error::InvalidState {
            action: "run an operation on",
            state: "Created".to_string(),
        };
        assert!(misuse.is_misuse());
        assert!(!misuse.is_transport());
    }

    #[test]
    fn test_initialization_wrapping_keeps_family() {
        let wrapped = Error::Authentication {
            host: "web01".to_string(),
            reason: "Access is denied".to_string(),
        }
        .during_initialization("web01");

        assert!(matches!(wrapped, Error::SessionInitialization { .. }));
        assert!(wrapped.is_transport());
        assert_eq!(wrapped.remote_message(), Some("Access is denied"));

        let library = Error::LibraryUnavailable {
            path: "/missing.ps1".to_string(),
            reason: "not found".to_string(),
        }
        .during_initialization("web01");
        assert!(!library.is_transport());

        // Wrapping twice does not nest
        let twice = library.during_initialization("web02");
        assert!(twice.to_string().contains("web01"));
    }
}
