//! Event scheduling and the pending-event calendar.
//!
//! The calendar is an ordered store of pending events keyed on
//! `(time, priority, sequence)`: earlier time first, lower priority value
//! first within a time, and creation order (FIFO) within a time and
//! priority. The exact tie-break makes replay deterministic for a fixed
//! seed sequence.

use std::{
    any::Any,
    cell::Cell,
    cmp::Ordering,
    collections::BinaryHeap,
    fmt,
    rc::Rc,
    time::Duration,
};

use crate::error::{SimulationError, SimulationResult};
use crate::executive::Executive;

/// Priority of the warm-up event, dispatched before ordinary events
/// scheduled at the same time.
pub const WARM_UP_EVENT_PRIORITY: i32 = 1;

/// Default priority for scheduled events. Lower values dispatch first
/// within the same time.
pub const DEFAULT_EVENT_PRIORITY: i32 = 10;

/// Priority of the end-of-replication sentinel. Large so that ordinary
/// events scheduled at exactly the replication length still execute.
pub const END_REPLICATION_EVENT_PRIORITY: i32 = 10_000;

/// Optional payload attached to an event and handed to its action.
pub type Message = Rc<dyn Any>;

/// The action bound to an event, invoked exactly once at dispatch.
///
/// Actions run synchronously to completion, including any nested process
/// resumptions they trigger, before the executive loop continues. An error
/// aborts the run.
pub type EventAction = Box<dyn FnOnce(&Executive, Option<Message>) -> SimulationResult<()>>;

/// A cancellable reference to a scheduled event.
///
/// Cancellation is lazy: the flag is checked when the event is dequeued,
/// so cancelling after dispatch is a no-op.
#[derive(Debug, Clone)]
pub struct EventHandle {
    time: Duration,
    cancelled: Rc<Cell<bool>>,
}

impl EventHandle {
    /// Marks the referenced event cancelled. Its action will never run
    /// unless the event has already been dispatched.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// Returns `true` if the event has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// The absolute virtual time the event was scheduled for.
    pub fn time(&self) -> Duration {
        self.time
    }
}

/// An event scheduled for execution at a specific virtual time.
///
/// Immutable once scheduled except for the cancel flag, consumed exactly
/// once by the executive.
pub struct ScheduledEvent {
    time: Duration,
    priority: i32,
    sequence: u64,
    action: EventAction,
    message: Option<Message>,
    owner: Option<String>,
    cancelled: Rc<Cell<bool>>,
}

impl ScheduledEvent {
    /// Creates a scheduled event together with its cancellable handle.
    pub(crate) fn new(
        time: Duration,
        priority: i32,
        sequence: u64,
        action: EventAction,
        message: Option<Message>,
        owner: Option<String>,
    ) -> (Self, EventHandle) {
        let cancelled = Rc::new(Cell::new(false));
        let handle = EventHandle {
            time,
            cancelled: Rc::clone(&cancelled),
        };
        (
            Self {
                time,
                priority,
                sequence,
                action,
                message,
                owner,
                cancelled,
            },
            handle,
        )
    }

    /// Returns the scheduled execution time.
    pub fn time(&self) -> Duration {
        self.time
    }

    /// Returns the event priority (lower dispatches first).
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Returns the creation sequence number used as the final tie-break.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the owning model element's name, if one was recorded.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Returns `true` if the event has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Consumes the event, yielding its action and message payload.
    pub(crate) fn into_action(self) -> (EventAction, Option<Message>) {
        (self.action, self.message)
    }

    fn key(&self) -> (Duration, i32, u64) {
        (self.time, self.priority, self.sequence)
    }
}

impl fmt::Debug for ScheduledEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledEvent")
            .field("time", &self.time)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("owner", &self.owner)
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap, but the earliest key must come out
        // first, so every comparison is reversed.
        match other.time.cmp(&self.time) {
            Ordering::Equal => match other.priority.cmp(&self.priority) {
                Ordering::Equal => other.sequence.cmp(&self.sequence),
                ord => ord,
            },
            ord => ord,
        }
    }
}

/// The ordered store of pending events, owned by exactly one executive.
///
/// Backed by a binary heap for O(log n) insert and remove. Dispatch order
/// is strictly increasing in time as elements are removed.
#[derive(Debug, Default)]
pub struct Calendar {
    heap: BinaryHeap<ScheduledEvent>,
    last_dispatched: Duration,
}

impl Calendar {
    /// Creates a new empty calendar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending event.
    ///
    /// Fails if the event's time is earlier than the last dispatched
    /// time, which would violate dispatch monotonicity.
    pub fn insert(&mut self, event: ScheduledEvent) -> SimulationResult<()> {
        if event.time() < self.last_dispatched {
            return Err(SimulationError::Scheduling(format!(
                "event time {:?} is before the calendar's last dispatched time {:?}",
                event.time(),
                self.last_dispatched
            )));
        }
        self.heap.push(event);
        Ok(())
    }

    /// Removes and returns the event with the smallest
    /// `(time, priority, sequence)` key, or `None` when empty.
    pub fn remove_min(&mut self) -> Option<ScheduledEvent> {
        let event = self.heap.pop()?;
        self.last_dispatched = event.time();
        Some(event)
    }

    /// Returns a reference to the earliest pending event without
    /// removing it.
    pub fn peek_min(&self) -> Option<&ScheduledEvent> {
        self.heap.peek()
    }

    /// Returns `true` if no events are pending.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Returns the number of pending events.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Removes all pending events and resets the dispatch watermark.
    /// Called at the start of each replication.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.last_dispatched = Duration::ZERO;
    }
}
