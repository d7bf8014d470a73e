//! The process/suspension engine: cooperative continuation machinery.
//!
//! Process bodies are `async` blocks compiled into state machines. The
//! engine is their only scheduler: it polls a process inline when the
//! executive dispatches its resume event (for [`delay`]) or when another
//! continuation resumes its token (for [`suspend_for`]). Because only one
//! continuation ever executes at a time, no locking is needed, and a
//! resume transfers control synchronously at the current virtual time:
//! the resuming call does not return until the resumed continuation next
//! suspends or completes.
//!
//! [`delay`]: ProcessScope::delay
//! [`suspend_for`]: ProcessScope::suspend_for

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
    time::Duration,
};

use tracing::instrument;

use crate::delay::DelayFuture;
use crate::error::{SimulationError, SimulationResult};
use crate::events::{EventHandle, Message};
use crate::executive::{Executive, WeakExecutive};
use crate::suspension::{SuspendFuture, Suspension};

/// Unique identifier of a process within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(u64);

/// Unique identifier of an entity within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId(u64);

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created but not yet activated.
    Created,
    /// Activation event scheduled, first poll pending.
    Scheduled,
    /// Continuation currently executing.
    Running,
    /// Suspended at a delay or suspension point.
    Suspended,
    /// Ran to completion; the continuation has been dropped.
    Completed,
    /// Forcibly terminated before completion.
    Terminated,
}

type ProcessFuture = Pin<Box<dyn Future<Output = SimulationResult<()>>>>;

struct ProcessSlot {
    name: String,
    entity: Option<EntityId>,
    state: ProcessState,
    future: Option<ProcessFuture>,
    waiting_on: Option<u64>,
    pending_event: Option<EventHandle>,
}

impl fmt::Debug for ProcessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSlot")
            .field("name", &self.name)
            .field("entity", &self.entity)
            .field("state", &self.state)
            .field("waiting_on", &self.waiting_on)
            .finish()
    }
}

#[derive(Debug)]
struct Waiter {
    pid: ProcessId,
    resumed: Rc<Cell<bool>>,
    token_name: String,
}

#[derive(Debug)]
struct EntityRecord {
    name: String,
    live_processes: usize,
}

#[derive(Debug)]
struct EngineInner {
    executive: WeakExecutive,
    next_process_id: u64,
    next_suspension_id: u64,
    next_entity_id: u64,
    processes: HashMap<ProcessId, ProcessSlot>,
    waiters: HashMap<u64, Waiter>,
    entities: HashMap<EntityId, EntityRecord>,
}

/// The engine that owns all process continuations of one executive.
///
/// Clones share state through the same handle pattern as [`Executive`].
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    inner: Rc<RefCell<EngineInner>>,
}

impl ProcessEngine {
    /// Creates an engine bound to an executive. The engine schedules all
    /// of its resume events through that executive.
    pub fn new(executive: &Executive) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EngineInner {
                executive: executive.downgrade(),
                next_process_id: 0,
                next_suspension_id: 0,
                next_entity_id: 0,
                processes: HashMap::new(),
                waiters: HashMap::new(),
                entities: HashMap::new(),
            })),
        }
    }

    /// Creates a weak reference to this engine.
    pub fn downgrade(&self) -> WeakProcessEngine {
        WeakProcessEngine {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Drops all processes, waiters, and entities and resets the id
    /// counters, so that every replication starts from a clean slate and
    /// identical runs allocate identical ids.
    pub fn initialize(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.processes.clear();
        inner.waiters.clear();
        inner.entities.clear();
        inner.next_process_id = 0;
        inner.next_suspension_id = 0;
        inner.next_entity_id = 0;
        tracing::debug!("process engine initialized, all continuations dropped");
    }

    /// The executive this engine schedules through.
    pub fn executive(&self) -> SimulationResult<Executive> {
        self.inner.borrow().executive.upgrade()
    }

    /// Creates a named entity. Entities group processes; the engine
    /// retires an entity's record once all of its processes complete and
    /// nothing else references it.
    pub fn entity(&self, name: &str) -> Entity {
        let mut inner = self.inner.borrow_mut();
        let id = EntityId(inner.next_entity_id);
        inner.next_entity_id += 1;
        inner.entities.insert(
            id,
            EntityRecord {
                name: name.to_string(),
                live_processes: 0,
            },
        );
        tracing::trace!(?id, name, "entity created");
        Entity {
            id,
            name: Rc::from(name),
            engine: self.downgrade(),
        }
    }

    /// Number of entities with live (not yet completed) processes or no
    /// processes at all.
    pub fn entity_count(&self) -> usize {
        self.inner.borrow().entities.len()
    }

    /// Creates a named process from an `async` body without an owning
    /// entity. The body receives a [`ProcessScope`] providing the
    /// in-process primitives. The process does not run until activated.
    pub fn create_process<F, Fut>(&self, name: &str, body: F) -> ProcessHandle
    where
        F: FnOnce(ProcessScope) -> Fut,
        Fut: Future<Output = SimulationResult<()>> + 'static,
    {
        self.create_process_inner(name, None, body)
    }

    fn create_process_inner<F, Fut>(
        &self,
        name: &str,
        entity: Option<EntityId>,
        body: F,
    ) -> ProcessHandle
    where
        F: FnOnce(ProcessScope) -> Fut,
        Fut: Future<Output = SimulationResult<()>> + 'static,
    {
        let pid = {
            let mut inner = self.inner.borrow_mut();
            let pid = ProcessId(inner.next_process_id);
            inner.next_process_id += 1;
            pid
        };
        let scope = ProcessScope {
            engine: self.downgrade(),
            pid,
        };
        let future: ProcessFuture = Box::pin(body(scope));
        let mut inner = self.inner.borrow_mut();
        if let Some(eid) = entity {
            if let Some(record) = inner.entities.get_mut(&eid) {
                record.live_processes += 1;
            }
        }
        inner.processes.insert(
            pid,
            ProcessSlot {
                name: name.to_string(),
                entity,
                state: ProcessState::Created,
                future: Some(future),
                waiting_on: None,
                pending_event: None,
            },
        );
        tracing::trace!(?pid, name, "process created");
        ProcessHandle {
            pid,
            name: Rc::from(name),
            engine: self.downgrade(),
        }
    }

    /// Schedules the start of a created process's first continuation at
    /// `now() + delay`. Concurrent activations at the same instant run in
    /// scheduling order. Activating a process twice is an error.
    #[instrument(skip(self, handle), fields(process = %handle.name))]
    pub fn activate(&self, handle: &ProcessHandle, delay: Duration) -> SimulationResult<EventHandle> {
        let pid = handle.pid;
        let executive = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner.processes.get_mut(&pid).ok_or_else(|| {
                SimulationError::InvalidState(format!("process '{}' does not exist", handle.name))
            })?;
            if slot.state != ProcessState::Created {
                return Err(SimulationError::InvalidState(format!(
                    "process '{}' cannot be activated while {:?}",
                    handle.name, slot.state
                )));
            }
            slot.state = ProcessState::Scheduled;
            inner.executive.clone()
        };
        let executive = executive.upgrade()?;
        let weak = self.downgrade();
        let owner = handle.name.to_string();
        let event = executive.schedule_with(
            move |_, _| {
                let engine = weak.upgrade()?;
                engine.take_pending_event(pid);
                engine.step_process(pid)
            },
            delay,
            crate::events::DEFAULT_EVENT_PRIORITY,
            None,
            Some(&owner),
        )?;
        self.set_pending_event(pid, event.clone());
        Ok(event)
    }

    /// Transfers control synchronously to the continuation registered on
    /// `token`, at the current virtual time. Returns once that
    /// continuation next suspends or completes. Resuming a token with no
    /// registered waiter is a [`SimulationError::SuspensionMisuse`].
    pub fn resume(&self, token: &Suspension) -> SimulationResult<()> {
        let waiter = {
            let mut inner = self.inner.borrow_mut();
            let waiter = inner.waiters.remove(&token.id()).ok_or_else(|| {
                SimulationError::SuspensionMisuse(format!(
                    "resume on suspension '{}' which has no registered waiter",
                    token.name()
                ))
            })?;
            if let Some(slot) = inner.processes.get_mut(&waiter.pid) {
                slot.waiting_on = None;
            }
            waiter
        };
        tracing::trace!(token = %waiter.token_name, pid = ?waiter.pid, "resuming waiter");
        waiter.resumed.set(true);
        self.step_process(waiter.pid)
    }

    /// Returns `true` if `token` currently has a registered waiter.
    ///
    /// Used by timeout compositions: a timeout action checks for a waiter
    /// before resuming, so that whichever of the timeout and the external
    /// resume fires first is the only one that ever resumes the process.
    pub fn has_waiter(&self, token: &Suspension) -> bool {
        self.inner.borrow().waiters.contains_key(&token.id())
    }

    /// Forcibly terminates a process: drops its continuation, clears any
    /// suspension registration it holds as a waiter, and cancels any
    /// pending delay event, so no later resume can target the dead
    /// continuation. Terminating the currently running process is an
    /// error.
    pub fn terminate(&self, handle: &ProcessHandle) -> SimulationResult<()> {
        let inner = &mut *self.inner.borrow_mut();
        let slot = inner.processes.get_mut(&handle.pid).ok_or_else(|| {
            SimulationError::InvalidState(format!("process '{}' does not exist", handle.name))
        })?;
        if slot.state == ProcessState::Running {
            return Err(SimulationError::InvalidState(format!(
                "cannot terminate process '{}' while it is running",
                handle.name
            )));
        }
        slot.state = ProcessState::Terminated;
        slot.future = None;
        if let Some(token_id) = slot.waiting_on.take() {
            inner.waiters.remove(&token_id);
        }
        if let Some(event) = slot.pending_event.take() {
            event.cancel();
        }
        let entity = slot.entity;
        Self::release_entity_process(inner, entity);
        tracing::debug!(process = %handle.name, "process terminated");
        Ok(())
    }

    /// Allocates a fresh suspension token.
    pub fn suspension(&self, name: &str) -> Suspension {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_suspension_id;
        inner.next_suspension_id += 1;
        Suspension::new(id, name)
    }

    /// Returns the state of a process, if it exists in this engine.
    pub fn process_state(&self, handle: &ProcessHandle) -> Option<ProcessState> {
        self.inner
            .borrow()
            .processes
            .get(&handle.pid)
            .map(|slot| slot.state)
    }

    /// Polls a process's continuation until it next suspends or
    /// completes. This is the engine's single dispatch point, reached
    /// from activation events, delay resume events, and resume calls.
    pub(crate) fn step_process(&self, pid: ProcessId) -> SimulationResult<()> {
        let mut future = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner.processes.get_mut(&pid).ok_or_else(|| {
                SimulationError::InvalidState(format!("process {pid:?} does not exist"))
            })?;
            match slot.state {
                ProcessState::Completed | ProcessState::Terminated => {
                    return Err(SimulationError::InvalidState(format!(
                        "process '{}' cannot be resumed after {:?}",
                        slot.name, slot.state
                    )))
                }
                ProcessState::Running => {
                    return Err(SimulationError::InvalidState(format!(
                        "process '{}' is already running",
                        slot.name
                    )))
                }
                _ => {}
            }
            slot.state = ProcessState::Running;
            slot.future.take().ok_or_else(|| {
                SimulationError::InvalidState(format!(
                    "process '{}' has no continuation to poll",
                    slot.name
                ))
            })?
        };

        // Poll outside the borrow: the continuation may re-enter the
        // engine to schedule delays, register waiters, or resume other
        // processes. The waker is a no-op because the engine itself is
        // the only scheduler.
        let mut cx = Context::from_waker(Waker::noop());
        let poll = future.as_mut().poll(&mut cx);

        let inner = &mut *self.inner.borrow_mut();
        let slot = inner.processes.get_mut(&pid).ok_or_else(|| {
            SimulationError::InvalidState(format!("process {pid:?} vanished while running"))
        })?;
        match poll {
            Poll::Ready(result) => {
                slot.state = ProcessState::Completed;
                let entity = slot.entity;
                tracing::trace!(process = %slot.name, "process completed");
                Self::release_entity_process(inner, entity);
                result
            }
            Poll::Pending => {
                slot.future = Some(future);
                slot.state = ProcessState::Suspended;
                Ok(())
            }
        }
    }

    /// Schedules the resume event backing a delay, recording its handle
    /// on the process slot so termination can cancel it.
    pub(crate) fn schedule_resume(
        &self,
        pid: ProcessId,
        delay: Duration,
        fired: Rc<Cell<bool>>,
    ) -> SimulationResult<()> {
        let (executive, owner) = {
            let inner = self.inner.borrow();
            let slot = inner.processes.get(&pid).ok_or_else(|| {
                SimulationError::InvalidState(format!("process {pid:?} does not exist"))
            })?;
            (inner.executive.clone(), slot.name.clone())
        };
        let executive = executive.upgrade()?;
        let weak = self.downgrade();
        let event = executive.schedule_with(
            move |_, _| {
                fired.set(true);
                let engine = weak.upgrade()?;
                engine.take_pending_event(pid);
                engine.step_process(pid)
            },
            delay,
            crate::events::DEFAULT_EVENT_PRIORITY,
            None,
            Some(&owner),
        )?;
        self.set_pending_event(pid, event);
        Ok(())
    }

    /// Registers `pid` as the sole waiter on `token`.
    pub(crate) fn register_waiter(
        &self,
        pid: ProcessId,
        token: &Suspension,
        resumed: Rc<Cell<bool>>,
    ) -> SimulationResult<()> {
        let inner = &mut *self.inner.borrow_mut();
        if inner.waiters.contains_key(&token.id()) {
            return Err(SimulationError::SuspensionMisuse(format!(
                "suspension '{}' already has a registered waiter",
                token.name()
            )));
        }
        let slot = inner.processes.get_mut(&pid).ok_or_else(|| {
            SimulationError::InvalidState(format!("process {pid:?} does not exist"))
        })?;
        slot.waiting_on = Some(token.id());
        inner.waiters.insert(
            token.id(),
            Waiter {
                pid,
                resumed,
                token_name: token.name().to_string(),
            },
        );
        tracing::trace!(process = %slot.name, token = token.name(), "waiter registered");
        Ok(())
    }

    fn set_pending_event(&self, pid: ProcessId, event: EventHandle) {
        if let Some(slot) = self.inner.borrow_mut().processes.get_mut(&pid) {
            slot.pending_event = Some(event);
        }
    }

    pub(crate) fn take_pending_event(&self, pid: ProcessId) {
        if let Some(slot) = self.inner.borrow_mut().processes.get_mut(&pid) {
            slot.pending_event = None;
        }
    }

    fn release_entity_process(inner: &mut EngineInner, entity: Option<EntityId>) {
        let Some(eid) = entity else { return };
        let retire = match inner.entities.get_mut(&eid) {
            Some(record) => {
                record.live_processes = record.live_processes.saturating_sub(1);
                record.live_processes == 0
            }
            None => false,
        };
        if retire {
            if let Some(record) = inner.entities.remove(&eid) {
                tracing::trace!(entity = %record.name, "entity retired, all processes complete");
            }
        }
    }
}

/// A weak reference to a [`ProcessEngine`].
#[derive(Debug, Clone)]
pub struct WeakProcessEngine {
    inner: Weak<RefCell<EngineInner>>,
}

impl WeakProcessEngine {
    /// Attempts to upgrade to a strong engine handle.
    pub fn upgrade(&self) -> SimulationResult<ProcessEngine> {
        self.inner
            .upgrade()
            .map(|inner| ProcessEngine { inner })
            .ok_or(SimulationError::SimulationShutdown)
    }
}

/// A domain object that owns processes.
///
/// Entities are created by user code during a replication; the engine
/// retires their bookkeeping once all their processes complete.
#[derive(Debug, Clone)]
pub struct Entity {
    id: EntityId,
    name: Rc<str>,
    engine: WeakProcessEngine,
}

impl Entity {
    /// The entity's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creates a named process owned by this entity.
    pub fn process<F, Fut>(&self, name: &str, body: F) -> SimulationResult<ProcessHandle>
    where
        F: FnOnce(ProcessScope) -> Fut,
        Fut: Future<Output = SimulationResult<()>> + 'static,
    {
        let engine = self.engine.upgrade()?;
        Ok(engine.create_process_inner(name, Some(self.id), body))
    }
}

/// A reference to a process, usable to activate, terminate, or query it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: ProcessId,
    name: Rc<str>,
    engine: WeakProcessEngine,
}

impl ProcessHandle {
    /// The process id.
    pub fn id(&self) -> ProcessId {
        self.pid
    }

    /// The process name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The process's current lifecycle state.
    pub fn state(&self) -> SimulationResult<ProcessState> {
        let engine = self.engine.upgrade()?;
        engine.process_state(self).ok_or_else(|| {
            SimulationError::InvalidState(format!("process '{}' does not exist", self.name))
        })
    }

    /// `true` once the process has run to completion.
    pub fn is_completed(&self) -> bool {
        matches!(self.state(), Ok(ProcessState::Completed))
    }
}

/// The in-process view of the kernel, handed to every process body.
///
/// All suspension primitives are usable only from within the process the
/// scope belongs to; resume and activation are also available to event
/// actions through [`ProcessEngine`].
#[derive(Debug, Clone)]
pub struct ProcessScope {
    engine: WeakProcessEngine,
    pid: ProcessId,
}

impl ProcessScope {
    /// The id of the process this scope belongs to.
    pub fn id(&self) -> ProcessId {
        self.pid
    }

    /// The current virtual time.
    pub fn now(&self) -> SimulationResult<Duration> {
        let engine = self.engine.upgrade()?;
        Ok(engine.executive()?.now())
    }

    /// Suspends the current process for `duration` units of virtual
    /// time. Resumes at exactly `now() + duration`, exactly once.
    pub fn delay(&self, duration: Duration) -> DelayFuture {
        DelayFuture::new(self.engine.clone(), self.pid, duration)
    }

    /// Suspends the current process until `token` is resumed. No event
    /// is scheduled; only an explicit resume wakes the process.
    pub fn suspend_for(&self, token: &Suspension) -> SuspendFuture {
        SuspendFuture::new(self.engine.clone(), self.pid, token.clone())
    }

    /// Resumes the waiter registered on `token`, synchronously at the
    /// current virtual time. See [`ProcessEngine::resume`].
    pub fn resume(&self, token: &Suspension) -> SimulationResult<()> {
        self.engine.upgrade()?.resume(token)
    }

    /// Allocates a fresh suspension token.
    pub fn suspension(&self, name: &str) -> SimulationResult<Suspension> {
        Ok(self.engine.upgrade()?.suspension(name))
    }

    /// Creates a named entity.
    pub fn entity(&self, name: &str) -> SimulationResult<Entity> {
        Ok(self.engine.upgrade()?.entity(name))
    }

    /// Activates `handle` at the current instant.
    pub fn activate(&self, handle: &ProcessHandle) -> SimulationResult<EventHandle> {
        self.activate_after(handle, Duration::ZERO)
    }

    /// Activates `handle` after `delay`.
    pub fn activate_after(
        &self,
        handle: &ProcessHandle,
        delay: Duration,
    ) -> SimulationResult<EventHandle> {
        self.engine.upgrade()?.activate(handle, delay)
    }

    /// Schedules an arbitrary event action after `delay` at the default
    /// priority. Used for compositions such as timeouts that race a
    /// scheduled action against a suspension.
    pub fn schedule<F>(&self, action: F, delay: Duration) -> SimulationResult<EventHandle>
    where
        F: FnOnce(&Executive, Option<Message>) -> SimulationResult<()> + 'static,
    {
        self.engine.upgrade()?.executive()?.schedule(action, delay)
    }

    /// The engine this process belongs to.
    pub fn engine(&self) -> SimulationResult<ProcessEngine> {
        self.engine.upgrade()
    }
}
