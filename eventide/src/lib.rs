//! A deterministic discrete-event simulation kernel.
//!
//! Eventide advances a virtual clock by dispatching events from an
//! ordered calendar, runs model behavior as suspendable processes, and
//! repeats the whole thing across statistically independent replications.
//!
//! # Architecture
//!
//! - [`Calendar`](events::Calendar) keeps pending events ordered on
//!   `(time, priority, sequence)`; ties break on lower priority value,
//!   then FIFO.
//! - [`Executive`] owns the clock and the dispatch loop. Event actions
//!   run synchronously to completion; virtual time never moves while an
//!   action is running.
//! - [`ProcessEngine`] runs processes written as `async` blocks. A
//!   process suspends with [`ProcessScope::delay`] (time-based) or
//!   [`ProcessScope::suspend_for`] (condition-based); resuming a
//!   suspension transfers control synchronously at the current instant.
//! - [`ReplicationRunner`] resets everything between replications,
//!   repositions the [`StreamRegistry`] streams, and dispatches the
//!   [`ModelElement`] lifecycle hooks.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use eventide::{Executive, ProcessEngine};
//!
//! # fn main() -> eventide::SimulationResult<()> {
//! let executive = Executive::new();
//! executive.initialize();
//! let engine = ProcessEngine::new(&executive);
//!
//! let worker = engine.create_process("worker", |scope| async move {
//!     scope.delay(Duration::from_secs(5)).await?;
//!     assert_eq!(scope.now()?, Duration::from_secs(5));
//!     Ok(())
//! });
//! engine.activate(&worker, Duration::ZERO)?;
//!
//! executive.execute_all_events()?;
//! assert!(worker.is_completed());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::unwrap_used)]

pub mod delay;
pub mod error;
pub mod events;
pub mod executive;
pub mod model;
pub mod process;
pub mod runner;
pub mod streams;
pub mod suspension;

pub use delay::DelayFuture;
pub use error::{SimulationError, SimulationResult};
pub use events::{
    EventHandle, Message, DEFAULT_EVENT_PRIORITY, END_REPLICATION_EVENT_PRIORITY,
    WARM_UP_EVENT_PRIORITY,
};
pub use executive::{Executive, ExecutiveState, HaltReason, WeakExecutive};
pub use model::{ElementId, Model, ModelElement, SimContext};
pub use process::{
    Entity, ProcessEngine, ProcessHandle, ProcessId, ProcessScope, ProcessState,
    WeakProcessEngine,
};
pub use runner::{
    Experiment, ExperimentReport, ReplicationMetrics, ReplicationRunner, RunPhase,
    TerminationReason,
};
pub use streams::{RandomStream, ReplicableRng, StreamOptions, StreamRegistry};
pub use suspension::{SuspendFuture, Suspension};
