//! The executive: the event-dispatch loop that owns virtual time.
//!
//! The executive is the sole component allowed to advance the clock or
//! dequeue events. It uses the same centralized ownership model as the
//! rest of the crate: an `Rc<RefCell>` interior with cheap cloneable
//! handles, so event actions can schedule further events while the
//! dispatch loop is running.

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

use tracing::instrument;

use crate::error::{SimulationError, SimulationResult};
use crate::events::{
    Calendar, EventAction, EventHandle, Message, ScheduledEvent, DEFAULT_EVENT_PRIORITY,
    END_REPLICATION_EVENT_PRIORITY,
};

/// Lifecycle state of an executive within a replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutiveState {
    /// Constructed but not yet initialized; scheduling is rejected.
    Created,
    /// Ready for scheduling, dispatch loop not yet started.
    Initialized,
    /// Dispatch loop in progress.
    Running,
    /// Dispatch loop finished; see [`Executive::halt_reason`].
    Ended,
}

/// Why the dispatch loop stopped. Queryable state, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The calendar ran out of pending events.
    CalendarExhausted,
    /// [`Executive::stop`] was called; carries the reason for diagnostics.
    Stopped(String),
    /// The real-clock execution budget for this replication was exhausted.
    ExecutionTimeExceeded,
}

#[derive(Debug)]
struct ExecInner {
    state: ExecutiveState,
    current_time: Duration,
    calendar: Calendar,
    next_sequence: u64,
    events_processed: u64,
    stop_request: Option<String>,
    halt: Option<HaltReason>,
    end_event: Option<EventHandle>,
    max_execution_time: Option<Duration>,
}

impl ExecInner {
    fn new() -> Self {
        Self {
            state: ExecutiveState::Created,
            current_time: Duration::ZERO,
            calendar: Calendar::new(),
            next_sequence: 0,
            events_processed: 0,
            stop_request: None,
            halt: None,
            end_event: None,
            max_execution_time: None,
        }
    }
}

enum Dispatch {
    Run(ScheduledEvent),
    Halt(HaltReason),
}

/// The event-dispatch loop that owns virtual time and drives the calendar.
///
/// Cloning an `Executive` clones the handle, not the state; all clones
/// share one calendar and one clock.
#[derive(Debug, Clone)]
pub struct Executive {
    inner: Rc<RefCell<ExecInner>>,
}

impl Executive {
    /// Creates a new executive with an empty calendar at time zero.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ExecInner::new())),
        }
    }

    /// Creates a weak reference to this executive.
    ///
    /// Weak references let long-lived continuations reach the executive
    /// without keeping it alive; upgrading after the executive is dropped
    /// yields [`SimulationError::SimulationShutdown`].
    pub fn downgrade(&self) -> WeakExecutive {
        WeakExecutive {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Resets current time to zero, clears the calendar, and clears any
    /// stop or halt state. Called once per replication, before any
    /// scheduling.
    #[instrument(skip(self))]
    pub fn initialize(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.state = ExecutiveState::Initialized;
        inner.current_time = Duration::ZERO;
        inner.calendar.clear();
        inner.next_sequence = 0;
        inner.events_processed = 0;
        inner.stop_request = None;
        inner.halt = None;
        inner.end_event = None;
        tracing::debug!("executive initialized, calendar cleared, time reset to zero");
    }

    /// Returns the current virtual time.
    pub fn now(&self) -> Duration {
        self.inner.borrow().current_time
    }

    /// Returns the executive's lifecycle state.
    pub fn state(&self) -> ExecutiveState {
        self.inner.borrow().state
    }

    /// Returns why the last run halted, or `None` if no run has finished.
    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.inner.borrow().halt.clone()
    }

    /// Number of events dispatched since the last initialize.
    pub fn events_processed(&self) -> u64 {
        self.inner.borrow().events_processed
    }

    /// Number of events waiting in the calendar.
    pub fn pending_event_count(&self) -> usize {
        self.inner.borrow().calendar.len()
    }

    /// Sets the real-clock budget for the next [`Self::execute_all_events`]
    /// call. `None` disables the budget.
    pub fn set_max_execution_time(&self, budget: Option<Duration>) {
        self.inner.borrow_mut().max_execution_time = budget;
    }

    /// Schedules `action` to run after `delay`, at the default priority
    /// and with no message payload. Returns a cancellable handle.
    pub fn schedule<F>(&self, action: F, delay: Duration) -> SimulationResult<EventHandle>
    where
        F: FnOnce(&Executive, Option<Message>) -> SimulationResult<()> + 'static,
    {
        self.schedule_with(action, delay, DEFAULT_EVENT_PRIORITY, None, None)
    }

    /// Schedules `action` to run after `delay` with an explicit priority,
    /// optional message payload, and optional owner name for diagnostics.
    ///
    /// The absolute time is `now() + delay`. Fails with
    /// [`SimulationError::Scheduling`] when the executive is not in a
    /// runnable state.
    pub fn schedule_with<F>(
        &self,
        action: F,
        delay: Duration,
        priority: i32,
        message: Option<Message>,
        owner: Option<&str>,
    ) -> SimulationResult<EventHandle>
    where
        F: FnOnce(&Executive, Option<Message>) -> SimulationResult<()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let time = inner.current_time + delay;
        Self::insert_event(&mut inner, Box::new(action), time, priority, message, owner)
    }

    /// Schedules `action` at an absolute virtual time.
    ///
    /// Fails with [`SimulationError::Scheduling`] when `time` is earlier
    /// than the current time; this is the absolute-time analogue of a
    /// negative delay.
    pub fn schedule_at<F>(
        &self,
        action: F,
        time: Duration,
        priority: i32,
    ) -> SimulationResult<EventHandle>
    where
        F: FnOnce(&Executive, Option<Message>) -> SimulationResult<()> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if time < inner.current_time {
            return Err(SimulationError::Scheduling(format!(
                "cannot schedule at {:?}, which is before the current time {:?}",
                time, inner.current_time
            )));
        }
        Self::insert_event(&mut inner, Box::new(action), time, priority, None, None)
    }

    fn insert_event(
        inner: &mut ExecInner,
        action: EventAction,
        time: Duration,
        priority: i32,
        message: Option<Message>,
        owner: Option<&str>,
    ) -> SimulationResult<EventHandle> {
        match inner.state {
            ExecutiveState::Initialized | ExecutiveState::Running => {}
            state => {
                return Err(SimulationError::Scheduling(format!(
                    "cannot schedule events while the executive is {state:?}"
                )))
            }
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let (event, handle) = ScheduledEvent::new(
            time,
            priority,
            sequence,
            action,
            message,
            owner.map(str::to_string),
        );
        tracing::trace!(?time, priority, sequence, owner, "scheduling event");
        inner.calendar.insert(event)?;
        Ok(handle)
    }

    /// Requests loop termination after the current action finishes.
    /// The reason is retained for diagnostics.
    pub fn stop(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(%reason, "stop requested");
        self.inner.borrow_mut().stop_request = Some(reason);
    }

    /// Returns `true` if an end-of-replication sentinel is scheduled and
    /// not cancelled.
    pub fn is_end_event_scheduled(&self) -> bool {
        self.inner
            .borrow()
            .end_event
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }

    /// Schedules the end-of-replication sentinel at an absolute time.
    ///
    /// Any previously scheduled sentinel is cancelled first. When the
    /// sentinel is dispatched it calls [`Self::stop`].
    pub fn schedule_end_event(&self, time: Duration) -> SimulationResult<EventHandle> {
        if let Some(previous) = self.inner.borrow_mut().end_event.take() {
            tracing::info!(
                scheduled_for = ?previous.time(),
                "cancelling previously scheduled end of replication event"
            );
            previous.cancel();
        }
        tracing::info!(?time, "scheduling end of replication");
        let handle = self.schedule_at(
            |executive, _| {
                executive.stop(format!(
                    "scheduled end of replication occurred at time {:?}",
                    executive.now()
                ));
                Ok(())
            },
            time,
            END_REPLICATION_EVENT_PRIORITY,
        )?;
        self.inner.borrow_mut().end_event = Some(handle.clone());
        Ok(handle)
    }

    /// Runs the dispatch loop until the calendar is exhausted, a stop is
    /// requested, or the real-clock budget is exceeded.
    ///
    /// Each iteration pops the minimum event; cancelled events are
    /// discarded. A popped time earlier than the current time is a fatal
    /// [`SimulationError::OrderingViolation`]. Otherwise the clock
    /// advances to the event's time and its action runs synchronously to
    /// completion, including any nested resumes, before the loop
    /// continues.
    #[instrument(skip(self))]
    pub fn execute_all_events(&self) -> SimulationResult<()> {
        let started = Instant::now();
        let budget = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ExecutiveState::Initialized {
                return Err(SimulationError::InvalidState(format!(
                    "execute_all_events requires an initialized executive, state is {:?}",
                    inner.state
                )));
            }
            inner.state = ExecutiveState::Running;
            inner.max_execution_time
        };

        let halt = loop {
            if let Some(limit) = budget {
                if started.elapsed() >= limit {
                    tracing::warn!(
                        ?limit,
                        "real-clock execution budget exceeded, halting replication"
                    );
                    break HaltReason::ExecutionTimeExceeded;
                }
            }
            match self.next_dispatch()? {
                Dispatch::Halt(reason) => break reason,
                Dispatch::Run(event) => {
                    let (action, message) = event.into_action();
                    action(self, message)?;
                }
            }
        };

        let mut inner = self.inner.borrow_mut();
        tracing::info!(
            current_time = ?inner.current_time,
            events_processed = inner.events_processed,
            halt = ?halt,
            "executive finished executing events"
        );
        inner.halt = Some(halt);
        inner.state = ExecutiveState::Ended;
        Ok(())
    }

    /// Pops the next runnable event, skipping cancelled ones, advancing
    /// the clock, and honoring stop requests.
    fn next_dispatch(&self) -> SimulationResult<Dispatch> {
        let mut inner = self.inner.borrow_mut();
        if let Some(reason) = inner.stop_request.take() {
            return Ok(Dispatch::Halt(HaltReason::Stopped(reason)));
        }
        loop {
            match inner.calendar.remove_min() {
                None => return Ok(Dispatch::Halt(HaltReason::CalendarExhausted)),
                Some(event) if event.is_cancelled() => {
                    tracing::trace!(?event, "discarding cancelled event");
                }
                Some(event) => {
                    if event.time() < inner.current_time {
                        return Err(SimulationError::OrderingViolation {
                            event_time: event.time(),
                            current_time: inner.current_time,
                        });
                    }
                    tracing::trace!(?event, "dispatching event");
                    inner.current_time = event.time();
                    inner.events_processed += 1;
                    return Ok(Dispatch::Run(event));
                }
            }
        }
    }
}

impl Default for Executive {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak reference to an [`Executive`].
#[derive(Debug, Clone)]
pub struct WeakExecutive {
    inner: Weak<RefCell<ExecInner>>,
}

impl WeakExecutive {
    /// Attempts to upgrade to a strong executive handle.
    pub fn upgrade(&self) -> SimulationResult<Executive> {
        self.inner
            .upgrade()
            .map(|inner| Executive { inner })
            .ok_or(SimulationError::SimulationShutdown)
    }
}
