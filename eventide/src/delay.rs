//! Time-based suspension of processes.
//!
//! A [`DelayFuture`] suspends the process that awaits it and schedules a
//! resume event at `now() + duration`. When the executive dispatches that
//! event, the process's continuation resumes at exactly that time, exactly
//! once, never early.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::SimulationResult;
use crate::process::{ProcessId, WeakProcessEngine};

enum DelayState {
    Unscheduled,
    Waiting,
    Done,
}

/// Future that completes after a specified virtual-time duration.
///
/// Created by [`crate::process::ProcessScope::delay`]; only meaningful
/// when awaited from within a process body, because the resume event
/// polls that process.
pub struct DelayFuture {
    engine: WeakProcessEngine,
    pid: ProcessId,
    duration: Duration,
    state: DelayState,
    fired: Rc<Cell<bool>>,
}

impl DelayFuture {
    pub(crate) fn new(engine: WeakProcessEngine, pid: ProcessId, duration: Duration) -> Self {
        Self {
            engine,
            pid,
            duration,
            state: DelayState::Unscheduled,
            fired: Rc::new(Cell::new(false)),
        }
    }
}

impl Future for DelayFuture {
    type Output = SimulationResult<()>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            DelayState::Done => Poll::Ready(Ok(())),
            DelayState::Unscheduled => {
                // First poll: schedule the resume event and suspend.
                let engine = match self.engine.upgrade() {
                    Ok(engine) => engine,
                    Err(e) => return Poll::Ready(Err(e)),
                };
                match engine.schedule_resume(self.pid, self.duration, Rc::clone(&self.fired)) {
                    Ok(()) => {
                        self.state = DelayState::Waiting;
                        Poll::Pending
                    }
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
            DelayState::Waiting => {
                if self.fired.get() {
                    self.state = DelayState::Done;
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}
