//! Error types.
//!
//! Two families live here. [`FixtureError`] reports misuse or
//! misconfiguration of a fixture at the call site. [`RpcError`] is the
//! ordinary outcome of a call that ended with a non-OK status, as seen by
//! application code acting as a client.

use crate::descriptor::Cardinality;
use crate::metadata::Metadata;
use crate::state::Termination;
use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {type_name}: {message}")]
    Encode {
        type_name: &'static str,
        message: String,
    },

    #[error("failed to decode {type_name}: {message}")]
    Decode {
        type_name: &'static str,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("method not found: /{service}/{method}")]
    MethodNotFound { service: String, method: String },

    #[error("method {method} is {actual}, not {expected}")]
    CardinalityMismatch {
        method: String,
        expected: Cardinality,
        actual: Cardinality,
    },

    #[error("send_initial_metadata called too late")]
    InitialMetadataAlreadySent,

    #[error("no more requests: the request stream is closed")]
    NoMoreRequests,

    #[error("no more responses")]
    NoMoreResponses,

    #[error("call already terminated with {0:?}")]
    Terminated(Code),

    #[error("status code unexpectedly {actual:?}, expected {expected:?}")]
    UnexpectedCode { expected: Code, actual: Code },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to spawn {name} thread: {source}")]
    Thread {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A call that ended with a status other than OK.
///
/// Besides the status it carries the metadata the client observed, the way a
/// failed call object would.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc failed with {code:?}: {details}")]
pub struct RpcError {
    code: Code,
    details: String,
    initial_metadata: Metadata,
    trailing_metadata: Metadata,
}

impl RpcError {
    pub fn new(code: Code, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            initial_metadata: Metadata::new(),
            trailing_metadata: Metadata::new(),
        }
    }

    pub(crate) fn from_termination(initial_metadata: Metadata, termination: Termination) -> Self {
        Self {
            code: termination.code,
            details: termination.details,
            initial_metadata,
            trailing_metadata: termination.trailing_metadata,
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn initial_metadata(&self) -> &Metadata {
        &self.initial_metadata
    }

    pub fn trailing_metadata(&self) -> &Metadata {
        &self.trailing_metadata
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        Status::new(err.code, err.details)
    }
}

/// Fixture faults hit while invoking a call surface to the client as a
/// failed call.
impl From<FixtureError> for RpcError {
    fn from(err: FixtureError) -> Self {
        let code = match &err {
            FixtureError::MethodNotFound { .. } | FixtureError::CardinalityMismatch { .. } => {
                Code::Unimplemented
            }
            FixtureError::Terminated(code) | FixtureError::UnexpectedCode { actual: code, .. } => {
                *code
            }
            FixtureError::Thread { .. } => Code::Internal,
            _ => Code::Unknown,
        };
        RpcError::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_converts_to_status() {
        let status: Status = RpcError::new(Code::DeadlineExceeded, "Took too much time!").into();
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.message(), "Took too much time!");
    }

    #[test]
    fn lookup_failures_become_unimplemented() {
        let err: RpcError = FixtureError::MethodNotFound {
            service: "svc".into(),
            method: "Nope".into(),
        }
        .into();
        assert_eq!(err.code(), Code::Unimplemented);
        assert_eq!(err.details(), "method not found: /svc/Nope");
    }

    #[test]
    fn codec_errors_are_transparent() {
        let err = FixtureError::from(CodecError::Decode {
            type_name: "Ping",
            message: "truncated".into(),
        });
        assert_eq!(err.to_string(), "failed to decode Ping: truncated");
        assert_eq!(RpcError::from(err).code(), Code::Unknown);
    }
}
