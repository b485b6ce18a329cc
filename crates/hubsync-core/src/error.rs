//! Error types for hubsync-core
//!
//! [`Error`] covers configuration and startup problems. The embedding process
//! treats every variant as fatal at startup.
//!
//! [`HandlerError`] is what a handler returns for one envelope. It never
//! escapes the worker pool; the manager turns it into a scheduling decision.

use crate::identity::EventType;
use thiserror::Error;

/// Result type for hubsync-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or starting the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Two registrations for the same event type
    #[error("event type {0} is already registered")]
    DuplicateRegistration(EventType),

    /// A dependency names an event type that was never registered
    #[error("event type {event_type} depends on unregistered event type {depends_on}")]
    UnknownDependency {
        /// The dependent event type
        event_type: EventType,
        /// The missing dependency
        depends_on: EventType,
    },

    /// An event type depends on itself
    #[error("event type {0} depends on itself")]
    SelfDependency(EventType),

    /// The dependency graph contains a cycle
    #[error("dependency cycle: {}", Self::format_cycle(.0))]
    DependencyCycle(Vec<EventType>),

    /// A delta registration without a dependency on its baseline type
    #[error("delta event type {0} must declare a dependency on its complete type")]
    DeltaWithoutDependency(EventType),

    /// An envelope arrived for an event type nobody registered
    #[error("no registration for event type {0}")]
    UnregisteredEventType(EventType),

    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration text could not be parsed
    #[error("RON parse error: {0}")]
    Config(#[from] ron::error::SpannedError),

    /// IO error (config files, worker threads)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    fn format_cycle(cycle: &[EventType]) -> String {
        cycle
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

/// Failure of a single handler invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Storage or network trouble; the envelope stays eligible for retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// The payload can never be applied; the envelope is dropped
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl HandlerError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        HandlerError::Transient(msg.into())
    }

    /// Create a malformed-payload error
    pub fn malformed(msg: impl Into<String>) -> Self {
        HandlerError::Malformed(msg.into())
    }

    /// True if retrying the same envelope may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }

    /// True if the envelope must be dropped
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

// Compile-time check that both error types can cross worker threads.
fn _assert_error_send_sync<T: Send + Sync>() {}
fn _error_is_send_sync() {
    _assert_error_send_sync::<Error>();
    _assert_error_send_sync::<HandlerError>();
}
