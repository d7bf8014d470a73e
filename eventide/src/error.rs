//! Error types for the simulation kernel.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during simulation operations.
///
/// All kernel errors fail fast; none are retried. A real-clock budget
/// overrun is reported through [`crate::executive::HaltReason`] instead,
/// because it is a graceful stop rather than a defect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    /// Scheduling was attempted outside a runnable state, or at an
    /// absolute time earlier than the current virtual time.
    #[error("scheduling error: {0}")]
    Scheduling(String),
    /// A dequeued event's time is earlier than the current virtual time.
    /// Indicates a defect in the calendar or its caller; unrecoverable.
    #[error("ordering violation: event time {event_time:?} is before current time {current_time:?}")]
    OrderingViolation {
        /// Time carried by the offending event.
        event_time: Duration,
        /// Virtual time when the event was dequeued.
        current_time: Duration,
    },
    /// A suspension token was waited on twice, or resumed without a waiter.
    #[error("suspension misuse: {0}")]
    SuspensionMisuse(String),
    /// The simulation is in an invalid state for the requested operation.
    #[error("invalid simulation state: {0}")]
    InvalidState(String),
    /// The simulation has been shut down and is no longer accessible.
    #[error("simulation has been shut down")]
    SimulationShutdown,
}

/// A type alias for `Result<T, SimulationError>`.
pub type SimulationResult<T> = Result<T, SimulationError>;
