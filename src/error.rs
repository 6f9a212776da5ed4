//! Error types for pcm-engine.
//!
//! Every fallible operation returns a [`EngineError`]. An operation that
//! returns an error leaves the object it was called on exactly as it was:
//! no partial queue mutation, no half-written buffer, no format lock-in.
//!
//! Runtime conditions that are not caused by a single call (a recorder
//! running out of free buffers, a source draining) are reported through
//! [`EventCallback`](crate::EventCallback) instead.

use crate::format::AudioFormat;

/// Errors returned by buffers, queues, sources, recorders and the engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// Memory for a buffer or queue could not be obtained.
    ///
    /// Always recoverable: the object keeps its previous valid state.
    #[error("allocation of {bytes} bytes failed")]
    AllocationFailure {
        /// Size of the failed request.
        bytes: usize,
    },

    /// A buffer was offered to a stream whose locked-in format differs.
    #[error("buffer format {actual} does not match stream format {expected}")]
    FormatMismatch {
        /// The format the stream locked in with its first buffer.
        expected: AudioFormat,
        /// The format of the rejected buffer.
        actual: AudioFormat,
    },

    /// The format is outside {u8, i16, i32, f32} x {1, 2 channels}.
    #[error("unsupported sample format: {format}")]
    UnsupportedFormat {
        /// Description of the rejected format.
        format: String,
    },

    /// The native audio API rejected an operation. Not retried.
    #[error("audio backend error: {0}")]
    BackendError(String),

    /// The operation is not legal in the stream's current state.
    #[error("invalid state: {reason}")]
    InvalidState {
        /// Why the operation was refused.
        reason: &'static str,
    },
}

impl EngineError {
    /// Creates a backend error from anything displayable.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::BackendError(err.to_string())
    }

    /// Creates an unsupported-format error for the given format.
    pub fn unsupported(format: &AudioFormat) -> Self {
        Self::UnsupportedFormat {
            format: format.to_string(),
        }
    }

    pub(crate) fn invalid_state(reason: &'static str) -> Self {
        Self::InvalidState { reason }
    }
}

impl From<std::collections::TryReserveError> for EngineError {
    fn from(_: std::collections::TryReserveError) -> Self {
        // TryReserveError does not expose the requested size on stable
        Self::AllocationFailure { bytes: 0 }
    }
}
