//! Error and signal types for sequencer operations.
//!
//! Two very different things travel through [`SequencerError`]:
//!
//! - **Signals** ([`SequencerError::Alert`], [`SequencerError::Timeout`],
//!   [`SequencerError::Interrupted`]) are control flow. A consumer that sees one unwinds its
//!   loop, releases whatever it holds, and decides whether to retry. They carry no payload and
//!   capture no backtrace, so raising them on a hot wait loop costs nothing.
//! - **Failures** ([`SequencerError::InvalidArgument`]) are raised synchronously at the call
//!   site and are never worth retrying.
//!
//! Broken invariants (claiming a barrier twice, reading a sequence whose chunk has already been
//! recycled) are not represented here: they panic.

use thiserror::Error;

/// Result type alias for sequencer operations
pub type Result<T> = std::result::Result<T, SequencerError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequencerError {
    /// The consumer barrier was alerted
    #[error("Barrier alerted")]
    Alert,

    /// A timed wait passed its deadline
    #[error("Operation timed out")]
    Timeout,

    /// An interruptible reservation observed its interrupt flag
    #[error("Interrupted while waiting for capacity")]
    Interrupted,

    /// A non-blocking reservation found no room
    #[error("Insufficient capacity")]
    InsufficientCapacity,

    /// Invalid argument or configuration parameter
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Error message describing the rejected value
        message: String,
    },
}

impl SequencerError {
    /// Create a new invalid-argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// True for the cooperative control-flow signals.
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::Alert | Self::Timeout | Self::Interrupted)
    }

    /// Check if retrying the same call later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::InsufficientCapacity)
    }
}

/// Convenience macro for creating invalid-argument errors
#[macro_export]
macro_rules! invalid_argument {
    ($($arg:tt)*) => {
        $crate::error::SequencerError::invalid_argument(format!($($arg)*))
    };
}
