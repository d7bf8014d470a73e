//! Condition-based suspension of processes.
//!
//! A [`Suspension`] is a named synchronization point with at most one
//! registered waiter. It is resolved only by an explicit resume call,
//! never by the passage of time. This is the kernel's only non-time-based
//! synchronization primitive; higher-level waits (a busy resource freeing
//! up, a handshake between entities) are built from it.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::SimulationResult;
use crate::process::{ProcessId, WeakProcessEngine};

struct SuspensionInner {
    id: u64,
    name: String,
}

/// A named, single-waiter synchronization token.
///
/// Clones share identity: resuming any clone resumes the waiter
/// registered through any other clone.
#[derive(Clone)]
pub struct Suspension {
    inner: Rc<SuspensionInner>,
}

impl Suspension {
    pub(crate) fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(SuspensionInner {
                id,
                name: name.into(),
            }),
        }
    }

    /// The token's diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suspension")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

enum SuspendState {
    Unregistered,
    Waiting,
    Done,
}

/// Future that suspends a process until its token is explicitly resumed.
///
/// No event is scheduled for this suspension; the process resumes only
/// when some other continuation calls resume on the token. Waiting on a
/// token that already has a waiter fails with
/// [`crate::error::SimulationError::SuspensionMisuse`].
pub struct SuspendFuture {
    engine: WeakProcessEngine,
    pid: ProcessId,
    token: Suspension,
    state: SuspendState,
    resumed: Rc<Cell<bool>>,
}

impl SuspendFuture {
    pub(crate) fn new(engine: WeakProcessEngine, pid: ProcessId, token: Suspension) -> Self {
        Self {
            engine,
            pid,
            token,
            state: SuspendState::Unregistered,
            resumed: Rc::new(Cell::new(false)),
        }
    }
}

impl Future for SuspendFuture {
    type Output = SimulationResult<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            SuspendState::Done => Poll::Ready(Ok(())),
            SuspendState::Unregistered => {
                let engine = match self.engine.upgrade() {
                    Ok(engine) => engine,
                    Err(e) => return Poll::Ready(Err(e)),
                };
                let registration =
                    engine.register_waiter(self.pid, &self.token, Rc::clone(&self.resumed));
                match registration {
                    Ok(()) => {
                        self.state = SuspendState::Waiting;
                        Poll::Pending
                    }
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
            SuspendState::Waiting => {
                if self.resumed.get() {
                    self.state = SuspendState::Done;
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}
