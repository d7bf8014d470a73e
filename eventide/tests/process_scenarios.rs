//! End-to-end scenarios for processes: delays, suspensions, synchronous
//! resume ordering, timeout races, and termination.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use eventide::{
    Executive, HaltReason, ProcessEngine, ProcessState, SimulationError, SimulationResult,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn minutes(m: u64) -> Duration {
    Duration::from_secs(m * 60)
}

#[test]
fn delays_resume_at_exact_times() -> SimulationResult<()> {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let times: Rc<RefCell<Vec<Duration>>> = Rc::default();
    let sink = Rc::clone(&times);
    let process = engine.create_process("stepper", |scope| async move {
        sink.borrow_mut().push(scope.now()?);
        scope.delay(Duration::from_secs(3)).await?;
        sink.borrow_mut().push(scope.now()?);
        scope.delay(Duration::from_secs(0)).await?;
        sink.borrow_mut().push(scope.now()?);
        scope.delay(Duration::from_secs(7)).await?;
        sink.borrow_mut().push(scope.now()?);
        Ok(())
    });
    engine.activate(&process, Duration::from_secs(1))?;

    executive.execute_all_events()?;
    assert_eq!(
        *times.borrow(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(4),
            Duration::from_secs(4),
            Duration::from_secs(11),
        ]
    );
    assert!(process.is_completed());
    assert_eq!(executive.halt_reason(), Some(HaltReason::CalendarExhausted));
    Ok(())
}

/// Two entities coordinating through suspensions: a parent drives a child
/// to practice, runs errands while the child plays, and drives home once
/// resumed. Every resume transfers control synchronously, so the trace
/// interleaves in a fully determined order.
#[test]
fn handshake_trace_is_deterministic() -> SimulationResult<()> {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let log: Rc<RefCell<Vec<String>>> = Rc::default();
    let exited_van = engine.suspension("exited-van");
    let done_playing = engine.suspension("done-playing");

    let child_log = Rc::clone(&log);
    let child_exited = exited_van.clone();
    let child_done = done_playing.clone();
    let child = engine.create_process("child", |scope| async move {
        child_log.borrow_mut().push("child: exiting van".into());
        scope.delay(minutes(2)).await?;
        child_log.borrow_mut().push("child: exited".into());
        // Transfers control to the parent until it next suspends.
        scope.resume(&child_exited)?;
        child_log.borrow_mut().push("child: playing".into());
        scope.delay(minutes(60)).await?;
        child_log.borrow_mut().push("child: done".into());
        scope.resume(&child_done)?;
        child_log.borrow_mut().push("child: back in van".into());
        Ok(())
    });

    let parent_log = Rc::clone(&log);
    let parent = engine.create_process("parent", |scope| async move {
        parent_log.borrow_mut().push("parent: driving".into());
        scope.delay(minutes(30)).await?;
        parent_log.borrow_mut().push("parent: arrived".into());
        scope.activate(&child)?;
        scope.suspend_for(&exited_van).await?;
        parent_log.borrow_mut().push("parent: errands".into());
        scope.delay(minutes(45)).await?;
        scope.suspend_for(&done_playing).await?;
        parent_log.borrow_mut().push("parent: driving home".into());
        scope.delay(minutes(30)).await?;
        parent_log.borrow_mut().push("parent: home".into());
        Ok(())
    });
    engine.activate(&parent, Duration::ZERO)?;

    executive.execute_all_events()?;
    assert_eq!(
        *log.borrow(),
        vec![
            "parent: driving",
            "parent: arrived",
            "child: exiting van",
            "child: exited",
            "parent: errands",
            "child: playing",
            "child: done",
            "parent: driving home",
            "child: back in van",
            "parent: home",
        ]
    );
    // 30 to arrive, child exits at 32, plays until 92, 30 home.
    assert_eq!(executive.now(), minutes(122));
    assert!(parent.is_completed());
    Ok(())
}

fn timeout_race(external_resume_at: Option<Duration>, timeout_at: Duration) -> (Option<&'static str>, u32) {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let token = engine.suspension("request");
    let winner: Rc<RefCell<Option<&'static str>>> = Rc::default();
    let resumptions = Rc::new(Cell::new(0u32));

    let body_token = token.clone();
    let count = Rc::clone(&resumptions);
    let waiter = engine.create_process("waiter", |scope| async move {
        scope.suspend_for(&body_token).await?;
        count.set(count.get() + 1);
        Ok(())
    });
    engine.activate(&waiter, Duration::ZERO).unwrap();

    if let Some(at) = external_resume_at {
        let resume_engine = engine.clone();
        let resume_token = token.clone();
        let marker = Rc::clone(&winner);
        executive
            .schedule(
                move |_, _| {
                    *marker.borrow_mut() = Some("external");
                    resume_engine.resume(&resume_token)
                },
                at,
            )
            .unwrap();
    }

    // The timeout only fires if nothing else resumed the token first, so
    // exactly one of the two racers ever resumes the process.
    let timeout_engine = engine.clone();
    let timeout_token = token.clone();
    let marker = Rc::clone(&winner);
    executive
        .schedule(
            move |_, _| {
                if timeout_engine.has_waiter(&timeout_token) {
                    *marker.borrow_mut() = Some("timeout");
                    timeout_engine.resume(&timeout_token)?;
                }
                Ok(())
            },
            timeout_at,
        )
        .unwrap();

    executive.execute_all_events().unwrap();
    assert!(waiter.is_completed());
    let w = *winner.borrow();
    (w, resumptions.get())
}

#[test]
fn external_resume_beats_later_timeout() {
    let (winner, resumptions) = timeout_race(
        Some(Duration::from_secs(30)),
        Duration::from_secs(50),
    );
    assert_eq!(winner, Some("external"));
    assert_eq!(resumptions, 1);
}

#[test]
fn timeout_fires_when_no_resume_arrives() {
    let (winner, resumptions) = timeout_race(None, Duration::from_secs(20));
    assert_eq!(winner, Some("timeout"));
    assert_eq!(resumptions, 1);
}

#[test]
fn same_instant_activations_run_in_scheduling_order() -> SimulationResult<()> {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let log: Rc<RefCell<Vec<&'static str>>> = Rc::default();
    for name in ["first", "second", "third"] {
        let sink = Rc::clone(&log);
        let process = engine.create_process(name, move |_scope| async move {
            sink.borrow_mut().push(name);
            Ok(())
        });
        engine.activate(&process, Duration::from_secs(5))?;
    }

    executive.execute_all_events()?;
    assert_eq!(*log.borrow(), vec!["first", "second", "third"]);
    Ok(())
}

#[test]
fn second_waiter_on_a_token_is_misuse() {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let token = engine.suspension("shared");
    for name in ["a", "b"] {
        let t = token.clone();
        let process = engine.create_process(name, move |scope| async move {
            scope.suspend_for(&t).await
        });
        engine.activate(&process, Duration::ZERO).unwrap();
    }

    let result = executive.execute_all_events();
    assert!(matches!(
        result,
        Err(SimulationError::SuspensionMisuse(_))
    ));
}

#[test]
fn resume_without_waiter_is_misuse() {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let token = engine.suspension("nobody");
    let result = engine.resume(&token);
    assert!(matches!(
        result,
        Err(SimulationError::SuspensionMisuse(_))
    ));
}

#[test]
fn terminate_clears_waiter_and_pending_delay() -> SimulationResult<()> {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let token = engine.suspension("never");
    let t = token.clone();
    let suspended = engine.create_process("suspended", move |scope| async move {
        scope.suspend_for(&t).await
    });
    engine.activate(&suspended, Duration::ZERO)?;

    let delayed_ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&delayed_ran);
    let delayed = engine.create_process("delayed", move |scope| async move {
        scope.delay(Duration::from_secs(100)).await?;
        flag.set(true);
        Ok(())
    });
    engine.activate(&delayed, Duration::ZERO)?;

    // Let both reach their suspension points, then kill them.
    executive.schedule(
        {
            let engine = engine.clone();
            let suspended = suspended.clone();
            let delayed = delayed.clone();
            move |_, _| {
                engine.terminate(&suspended)?;
                engine.terminate(&delayed)?;
                Ok(())
            }
        },
        Duration::from_secs(1),
    )?;

    executive.execute_all_events()?;
    assert_eq!(suspended.state()?, ProcessState::Terminated);
    assert_eq!(delayed.state()?, ProcessState::Terminated);
    assert!(!delayed_ran.get());
    // The waiter registration died with the process.
    assert!(!engine.has_waiter(&token));
    // The 100s delay event was cancelled, so the clock never reached it.
    assert_eq!(executive.now(), Duration::from_secs(1));
    Ok(())
}

#[test]
fn activating_twice_is_rejected() {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let process = engine.create_process("once", |_scope| async move { Ok(()) });
    engine.activate(&process, Duration::ZERO).unwrap();
    let again = engine.activate(&process, Duration::ZERO);
    assert!(matches!(again, Err(SimulationError::InvalidState(_))));

    executive.execute_all_events().unwrap();
    let after_completion = engine.activate(&process, Duration::ZERO);
    assert!(matches!(
        after_completion,
        Err(SimulationError::InvalidState(_))
    ));
}

#[test]
fn entities_retire_when_their_processes_complete() -> SimulationResult<()> {
    init_tracing();
    let executive = Executive::new();
    executive.initialize();
    let engine = ProcessEngine::new(&executive);

    let van = engine.entity("van");
    for (name, length) in [("trip-out", 10u64), ("trip-back", 25)] {
        let process = van.process(name, move |scope| async move {
            scope.delay(Duration::from_secs(length)).await
        })?;
        engine.activate(&process, Duration::ZERO)?;
    }
    assert_eq!(engine.entity_count(), 1);

    executive.execute_all_events()?;
    assert_eq!(engine.entity_count(), 0);
    Ok(())
}
