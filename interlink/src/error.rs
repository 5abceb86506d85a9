//! Error types for node, transaction, and sub-protocol operations.

use thiserror::Error;

use crate::id::LocalEndpoint;
use crate::message::ErrorKind;

/// Failure of an RPC operation.
///
/// `StopIteration` and `OperationAborted` are generator control signals and
/// travel through the same channel as true failures. `InvalidOperation` marks
/// local precondition violations (released stub, closed context) and is
/// raised synchronously, before anything reaches the wire. `RemoteError`
/// wraps a service-defined exception by name.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcError {
    /// Transport or route down.
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// Message addressed to a node other than the receiving one.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// No endpoint registered under the addressed id.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(LocalEndpoint),

    /// Malformed or unexpected entry type or status code.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// No service registered under the requested name.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// No object registered at the requested service path.
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Unknown member on a known object.
    #[error("member not found: {0}")]
    MemberNotFound(String),

    /// Credentials rejected by the service.
    #[error("authentication failed: {0}")]
    AuthenticationError(String),

    /// Transaction exceeded the configured request timeout.
    #[error("request timed out")]
    RequestTimeout,

    /// Caller cancelled the transaction.
    #[error("operation cancelled")]
    OperationCancelled,

    /// Generator exhausted or closed; a control signal, not a failure.
    #[error("stop iteration")]
    StopIteration,

    /// Generator aborted; a control signal, not a failure.
    #[error("operation aborted: {0}")]
    OperationAborted(String),

    /// Operation not valid in the current local state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Service-defined remote exception.
    #[error("{name}: {message}")]
    RemoteError {
        /// Service-defined exception name.
        name: String,
        /// Human-readable description.
        message: String,
    },
}

impl RpcError {
    /// Wire error code for this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::ConnectionError(_) => ErrorKind::ConnectionError,
            RpcError::NodeNotFound(_) => ErrorKind::NodeNotFound,
            RpcError::InvalidEndpoint(_) => ErrorKind::InvalidEndpoint,
            RpcError::ProtocolError(_) => ErrorKind::ProtocolError,
            RpcError::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            RpcError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            RpcError::MemberNotFound(_) => ErrorKind::MemberNotFound,
            RpcError::AuthenticationError(_) => ErrorKind::AuthenticationError,
            RpcError::RequestTimeout => ErrorKind::RequestTimeout,
            RpcError::OperationCancelled => ErrorKind::OperationCancelled,
            RpcError::StopIteration => ErrorKind::StopIteration,
            RpcError::OperationAborted(_) => ErrorKind::OperationAborted,
            RpcError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            RpcError::RemoteError { .. } => ErrorKind::RemoteError,
        }
    }

    /// Qualified error name carried in the `errorname` element.
    pub fn error_name(&self) -> String {
        match self {
            RpcError::RemoteError { name, .. } => name.clone(),
            RpcError::ConnectionError(_) => "Interlink.ConnectionError".into(),
            RpcError::NodeNotFound(_) => "Interlink.NodeNotFound".into(),
            RpcError::InvalidEndpoint(_) => "Interlink.InvalidEndpoint".into(),
            RpcError::ProtocolError(_) => "Interlink.ProtocolError".into(),
            RpcError::ServiceNotFound(_) => "Interlink.ServiceNotFound".into(),
            RpcError::ObjectNotFound(_) => "Interlink.ObjectNotFound".into(),
            RpcError::MemberNotFound(_) => "Interlink.MemberNotFound".into(),
            RpcError::AuthenticationError(_) => "Interlink.AuthenticationError".into(),
            RpcError::RequestTimeout => "Interlink.RequestTimeout".into(),
            RpcError::OperationCancelled => "Interlink.OperationCancelled".into(),
            RpcError::StopIteration => "Interlink.StopIteration".into(),
            RpcError::OperationAborted(_) => "Interlink.OperationAborted".into(),
            RpcError::InvalidOperation(_) => "Interlink.InvalidOperation".into(),
        }
    }

    /// Rebuild a typed failure from a wire error code plus the
    /// `errorname`/`errorstring` elements.
    pub fn from_wire(kind: ErrorKind, name: &str, message: &str) -> RpcError {
        match kind {
            ErrorKind::ConnectionError => RpcError::ConnectionError(message.into()),
            ErrorKind::NodeNotFound => RpcError::NodeNotFound(message.into()),
            ErrorKind::InvalidEndpoint => RpcError::InvalidEndpoint(0),
            ErrorKind::ProtocolError => RpcError::ProtocolError(message.into()),
            ErrorKind::ServiceNotFound => RpcError::ServiceNotFound(message.into()),
            ErrorKind::ObjectNotFound => RpcError::ObjectNotFound(message.into()),
            ErrorKind::MemberNotFound => RpcError::MemberNotFound(message.into()),
            ErrorKind::AuthenticationError => RpcError::AuthenticationError(message.into()),
            ErrorKind::RequestTimeout => RpcError::RequestTimeout,
            ErrorKind::OperationCancelled => RpcError::OperationCancelled,
            ErrorKind::StopIteration => RpcError::StopIteration,
            ErrorKind::OperationAborted => RpcError::OperationAborted(message.into()),
            ErrorKind::InvalidOperation => RpcError::InvalidOperation(message.into()),
            ErrorKind::RemoteError | ErrorKind::Success => RpcError::RemoteError {
                name: name.into(),
                message: message.into(),
            },
        }
    }

    /// Whether this value is a generator control signal rather than a
    /// failure.
    pub fn is_control_signal(&self) -> bool {
        matches!(self, RpcError::StopIteration | RpcError::OperationAborted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        let errors = [
            RpcError::ConnectionError("down".into()),
            RpcError::ServiceNotFound("svc".into()),
            RpcError::RequestTimeout,
            RpcError::OperationCancelled,
            RpcError::StopIteration,
            RpcError::OperationAborted("halt".into()),
            RpcError::RemoteError {
                name: "pkg.FooError".into(),
                message: "boom".into(),
            },
        ];
        for err in errors {
            let rebuilt = RpcError::from_wire(err.kind(), &err.error_name(), &err.to_string());
            assert_eq!(rebuilt.kind(), err.kind());
        }
    }

    #[test]
    fn test_remote_error_keeps_name() {
        let err = RpcError::from_wire(ErrorKind::RemoteError, "pkg.FooError", "boom");
        assert_eq!(
            err,
            RpcError::RemoteError {
                name: "pkg.FooError".into(),
                message: "boom".into()
            }
        );
        assert_eq!(err.error_name(), "pkg.FooError");
    }

    #[test]
    fn test_control_signals() {
        assert!(RpcError::StopIteration.is_control_signal());
        assert!(RpcError::OperationAborted(String::new()).is_control_signal());
        assert!(!RpcError::RequestTimeout.is_control_signal());
    }

    #[test]
    fn test_cancellation_distinct_from_timeout() {
        assert_ne!(
            RpcError::OperationCancelled.kind(),
            RpcError::RequestTimeout.kind()
        );
    }
}
