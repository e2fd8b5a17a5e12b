//! Error taxonomy shared by both sides of a channel.

use crate::message::ErrorObject;

/// Errors raised by channel endpoints themselves.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The endpoint (or its peer) has been closed.
    #[error("channel closed")]
    Closed,

    /// The port was transferred away and this handle is no longer usable.
    #[error("port has been transferred and is no longer usable")]
    Neutered,

    /// The endpoint cannot move ports (clone-only channel).
    #[error("endpoint does not support port transfer")]
    TransferUnsupported,
}

/// Errors raised while encoding or decoding wire values.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The value cannot be expressed as a wire value.
    #[error("unserializable value: {reason}")]
    Unserializable {
        /// What made the value unserializable.
        reason: String,
    },

    /// A HANDLER wire value named a handler that is not registered.
    #[error("no transfer handler registered under {name:?}")]
    UnknownHandler {
        /// The missing handler name.
        name: String,
    },

    /// A payload referenced a transfer-list slot that does not exist.
    #[error("transfer list has no port at slot {slot}")]
    BadPortSlot {
        /// The out-of-range slot.
        slot: usize,
    },

    /// A built-in transfer handler cannot be removed.
    #[error("built-in transfer handler {name:?} cannot be removed")]
    ReservedHandler {
        /// The built-in handler name.
        name: String,
    },

    /// JSON (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl WireError {
    /// Shorthand for [`WireError::Unserializable`].
    pub fn unserializable(reason: impl Into<String>) -> Self {
        WireError::Unserializable {
            reason: reason.into(),
        }
    }
}

/// What a remote throw decodes to on the calling side.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteThrow {
    /// An error-like object, reconstructed from its flattened form.
    Error(ErrorObject),
    /// A non-error thrown value, passed through verbatim.
    Value(serde_json::Value),
}

impl RemoteThrow {
    /// The error name, when the remote threw an error-like object.
    pub fn name(&self) -> Option<&str> {
        match self {
            RemoteThrow::Error(error) => Some(&error.name),
            RemoteThrow::Value(_) => None,
        }
    }

    /// The error message, when the remote threw an error-like object.
    pub fn message(&self) -> Option<&str> {
        match self {
            RemoteThrow::Error(error) => Some(&error.message),
            RemoteThrow::Value(_) => None,
        }
    }
}

impl std::fmt::Display for RemoteThrow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteThrow::Error(error) => write!(f, "{}: {}", error.name, error.message),
            RemoteThrow::Value(value) => write!(f, "{}", value),
        }
    }
}

impl std::error::Error for RemoteThrow {}

/// Errors surfaced to a proxy caller. Each error surfaces exactly once, on
/// the issuing side, by failing the call's future.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The exposed operation raised; carries the reconstructed throw.
    #[error("remote threw: {0}")]
    Remote(RemoteThrow),

    /// The proxy's released flag is set; no request was emitted.
    #[error("Proxy has been released and is not useable")]
    Released,

    /// The underlying endpoint failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Encoding or decoding failed locally.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// The reply violated the protocol (e.g. CONSTRUCT without a proxy).
    #[error("protocol violation: {message}")]
    Protocol {
        /// What the peer got wrong.
        message: String,
    },
}

impl CallError {
    /// The remote throw, if that is what this error is.
    pub fn as_remote(&self) -> Option<&RemoteThrow> {
        match self {
            CallError::Remote(thrown) => Some(thrown),
            _ => None,
        }
    }
}
