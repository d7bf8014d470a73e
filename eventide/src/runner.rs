//! The replication controller: runs an experiment as a sequence of
//! statistically independent replications.
//!
//! Each replication resets the executive and the process engine,
//! repositions the random streams according to the configured policy,
//! dispatches the model's lifecycle hooks, runs the event loop, and
//! collects per-replication metrics into an [`ExperimentReport`].

use std::fmt;
use std::time::Duration;

use tracing::instrument;

use crate::error::{SimulationError, SimulationResult};
use crate::events::WARM_UP_EVENT_PRIORITY;
use crate::executive::{Executive, HaltReason};
use crate::model::{Model, SimContext};
use crate::process::ProcessEngine;
use crate::streams::StreamRegistry;

/// Configuration of one experiment.
#[derive(Debug, Clone)]
pub struct Experiment {
    /// Number of replications to run.
    pub replications: usize,
    /// Virtual-time length of each replication. `None` runs until the
    /// calendar is exhausted or an element stops the run.
    pub replication_length: Option<Duration>,
    /// Virtual time after which warm-up hooks fire. `None` disables the
    /// warm-up event.
    pub warm_up_length: Option<Duration>,
    /// Real-clock budget per replication. `None` disables the budget.
    pub max_execution_time: Option<Duration>,
    /// Whether to run each element's `initialize` hook every replication.
    pub replication_initialization: bool,
    /// Whether streams reset to their start before the first replication.
    pub reset_start_stream: bool,
    /// Whether streams advance to the next substream after each
    /// replication.
    pub advance_next_substream: bool,
    /// Pairs replications antithetically: odd replications draw fresh
    /// substreams, even ones replay the previous substream complemented.
    pub antithetic: bool,
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            replications: 1,
            replication_length: None,
            warm_up_length: None,
            max_execution_time: None,
            replication_initialization: true,
            reset_start_stream: true,
            advance_next_substream: true,
            antithetic: false,
        }
    }
}

/// Lifecycle phase of a [`ReplicationRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Constructed, experiment-level setup not yet done.
    Created,
    /// `before_experiment` hooks dispatched, ready for the first
    /// replication.
    Initialized,
    /// A replication's event loop is in progress.
    Running,
    /// At least one replication finished; more may remain.
    StepCompleted,
    /// `after_experiment` hooks dispatched, no further replications run.
    Ended,
}

/// Why the experiment ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Every requested replication ran.
    CompletedAllReplications,
    /// A model element stopped the experiment early.
    StoppedEarly(String),
    /// A replication exhausted its real-clock budget.
    ExecutionTimeExceeded,
    /// The runner was dropped or ended before finishing.
    Unfinished,
}

/// Metrics recorded for one completed replication.
#[derive(Debug, Clone)]
pub struct ReplicationMetrics {
    /// Virtual time at which the replication halted.
    pub simulated_time: Duration,
    /// Events dispatched during the replication.
    pub events_processed: u64,
    /// Why the dispatch loop halted.
    pub halt: HaltReason,
}

/// Summary of a finished experiment.
#[derive(Debug, Clone)]
pub struct ExperimentReport {
    /// Replications the experiment asked for.
    pub replications_requested: usize,
    /// Replications that actually ran to a halt.
    pub replications_completed: usize,
    /// Why the experiment ended.
    pub termination: TerminationReason,
    /// Per-replication metrics, in run order.
    pub metrics: Vec<ReplicationMetrics>,
}

impl ExperimentReport {
    /// Total events dispatched across all replications.
    pub fn total_events(&self) -> u64 {
        self.metrics.iter().map(|m| m.events_processed).sum()
    }
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Experiment Report")?;
        writeln!(f, "=================")?;
        writeln!(
            f,
            "Replications: {}/{} completed",
            self.replications_completed, self.replications_requested
        )?;
        writeln!(f, "Termination:  {:?}", self.termination)?;
        writeln!(f, "Total events: {}", self.total_events())?;
        for (i, m) in self.metrics.iter().enumerate() {
            writeln!(
                f,
                "  rep {:>3}: simulated {:?}, {} events, halt {:?}",
                i + 1,
                m.simulated_time,
                m.events_processed,
                m.halt
            )?;
        }
        Ok(())
    }
}

/// Drives an experiment over a model, one replication at a time.
pub struct ReplicationRunner {
    experiment: Experiment,
    model: Model,
    ctx: SimContext,
    phase: RunPhase,
    current_replication: usize,
    termination: Option<TerminationReason>,
    metrics: Vec<ReplicationMetrics>,
}

impl ReplicationRunner {
    /// Creates a runner with a fresh executive, process engine, and
    /// stream registry.
    pub fn new(model: Model, experiment: Experiment) -> Self {
        let executive = Executive::new();
        let engine = ProcessEngine::new(&executive);
        let streams = StreamRegistry::new();
        Self {
            experiment,
            model,
            ctx: SimContext::new(executive, engine, streams),
            phase: RunPhase::Created,
            current_replication: 0,
            termination: None,
            metrics: Vec::new(),
        }
    }

    /// The context shared with every model element hook. Available before
    /// the run so callers can register streams and elements against it.
    pub fn context(&self) -> &SimContext {
        &self.ctx
    }

    /// The runner's current phase.
    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// The 1-based number of the replication most recently started.
    pub fn current_replication(&self) -> usize {
        self.current_replication
    }

    /// Experiment-level setup: applies the stream policy, dispatches
    /// `before_experiment` hooks, and readies the first replication.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> SimulationResult<()> {
        if self.phase != RunPhase::Created {
            return Err(SimulationError::InvalidState(format!(
                "experiment initialization requires phase Created, phase is {:?}",
                self.phase
            )));
        }
        if self.experiment.replication_length.is_none()
            && self.experiment.max_execution_time.is_none()
        {
            tracing::warn!(
                "no replication length and no execution budget configured; \
                 replications end only when the calendar empties or an element stops the run"
            );
        }

        let streams = self.ctx.streams();
        streams.set_all_reset_start_options(self.experiment.reset_start_stream);
        // Under antithetic pairing the runner repositions streams itself
        // at each replication boundary.
        streams.set_all_advance_options(
            self.experiment.advance_next_substream && !self.experiment.antithetic,
        );
        streams.reset_start_streams();

        self.model.before_experiment_actions(&self.ctx)?;
        self.phase = RunPhase::Initialized;
        Ok(())
    }

    /// Returns `true` while requested replications remain.
    pub fn has_next_replication(&self) -> bool {
        matches!(self.phase, RunPhase::Initialized | RunPhase::StepCompleted)
            && self.current_replication < self.experiment.replications
    }

    /// Runs one replication to its halt and records its metrics.
    #[instrument(skip(self), fields(replication = self.current_replication + 1))]
    pub fn run_next_replication(&mut self) -> SimulationResult<()> {
        if !self.has_next_replication() {
            return Err(SimulationError::InvalidState(format!(
                "no replication to run in phase {:?} after {} of {}",
                self.phase, self.current_replication, self.experiment.replications
            )));
        }
        self.current_replication += 1;

        if self.experiment.antithetic {
            self.apply_antithetic_policy();
        }

        let executive = self.ctx.executive().clone();
        executive.initialize();
        self.ctx.engine().initialize();
        executive.set_max_execution_time(self.experiment.max_execution_time);

        self.model.before_replication_actions(&self.ctx)?;

        if let Some(length) = self.experiment.replication_length {
            executive.schedule_end_event(length)?;
        }
        if let Some(warm_up) = self.experiment.warm_up_length {
            let model = self.model.clone();
            let ctx = self.ctx.clone();
            executive.schedule_at(
                move |_, _| model.warm_up_actions(&ctx),
                warm_up,
                WARM_UP_EVENT_PRIORITY,
            )?;
        }
        if self.experiment.replication_initialization {
            self.model.initialize_actions(&self.ctx)?;
        }

        self.phase = RunPhase::Running;
        executive.execute_all_events()?;

        let halt = executive.halt_reason().ok_or_else(|| {
            SimulationError::InvalidState("dispatch loop finished without a halt reason".into())
        })?;
        self.metrics.push(ReplicationMetrics {
            simulated_time: executive.now(),
            events_processed: executive.events_processed(),
            halt: halt.clone(),
        });

        self.model.after_replication_actions(&self.ctx)?;
        self.ctx.streams().advance_substreams();

        self.phase = RunPhase::StepCompleted;
        if halt == HaltReason::ExecutionTimeExceeded {
            self.termination = Some(TerminationReason::ExecutionTimeExceeded);
        }
        Ok(())
    }

    /// Positions the streams for antithetic pairing. Even replications
    /// replay the previous replication's substream with complemented
    /// draws; odd replications after the first move to fresh substreams.
    fn apply_antithetic_policy(&self) {
        let streams = self.ctx.streams();
        if self.current_replication % 2 == 0 {
            streams.reset_start_substreams();
            streams.set_antithetic(true);
        } else {
            streams.set_antithetic(false);
            if self.current_replication > 1 {
                streams.advance_all_substreams();
            }
        }
    }

    /// Ends the experiment: dispatches `after_experiment` hooks and
    /// records the termination reason.
    pub fn end(&mut self, reason: TerminationReason) -> SimulationResult<()> {
        if self.phase == RunPhase::Ended {
            return Ok(());
        }
        tracing::info!(?reason, "experiment ended");
        self.termination = Some(reason);
        self.phase = RunPhase::Ended;
        self.model.after_experiment_actions(&self.ctx)
    }

    /// Runs the whole experiment and returns its report.
    pub fn run(&mut self) -> SimulationResult<ExperimentReport> {
        self.initialize()?;
        while self.has_next_replication() {
            self.run_next_replication()?;
            if self.termination == Some(TerminationReason::ExecutionTimeExceeded) {
                break;
            }
        }
        let reason = match self.termination.take() {
            Some(reason) => reason,
            None if self.current_replication >= self.experiment.replications => {
                TerminationReason::CompletedAllReplications
            }
            None => TerminationReason::Unfinished,
        };
        self.end(reason)?;
        Ok(self.report())
    }

    /// Builds the report from the metrics recorded so far.
    pub fn report(&self) -> ExperimentReport {
        ExperimentReport {
            replications_requested: self.experiment.replications,
            replications_completed: self.metrics.len(),
            termination: self
                .termination
                .clone()
                .unwrap_or(TerminationReason::Unfinished),
            metrics: self.metrics.clone(),
        }
    }
}

impl fmt::Debug for ReplicationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationRunner")
            .field("phase", &self.phase)
            .field("current_replication", &self.current_replication)
            .field("replications", &self.experiment.replications)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelElement;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Pulse {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl ModelElement for Pulse {
        fn name(&self) -> &str {
            "pulse"
        }

        fn before_replication(&mut self, ctx: &SimContext) -> SimulationResult<()> {
            let log = Rc::clone(&self.log);
            ctx.executive().schedule(
                move |exec, _| {
                    log.borrow_mut().push(format!("tick@{:?}", exec.now()));
                    Ok(())
                },
                Duration::from_secs(2),
            )?;
            Ok(())
        }
    }

    #[test]
    fn runner_completes_requested_replications() {
        let log: Rc<RefCell<Vec<String>>> = Rc::default();
        let model = Model::new();
        model
            .add_element(Rc::new(RefCell::new(Pulse {
                log: Rc::clone(&log),
            })))
            .unwrap();

        let mut runner = ReplicationRunner::new(
            model,
            Experiment {
                replications: 3,
                replication_length: Some(Duration::from_secs(10)),
                ..Experiment::default()
            },
        );
        let report = runner.run().unwrap();

        assert_eq!(report.replications_completed, 3);
        assert_eq!(
            report.termination,
            TerminationReason::CompletedAllReplications
        );
        // Each replication restarts from time zero.
        assert_eq!(
            *log.borrow(),
            vec!["tick@2s", "tick@2s", "tick@2s"]
        );
        for m in &report.metrics {
            assert_eq!(m.simulated_time, Duration::from_secs(10));
            assert!(matches!(m.halt, HaltReason::Stopped(_)));
        }
    }

    #[test]
    fn stepping_requires_initialization() {
        let mut runner = ReplicationRunner::new(Model::new(), Experiment::default());
        assert!(!runner.has_next_replication());
        let result = runner.run_next_replication();
        assert!(matches!(result, Err(SimulationError::InvalidState(_))));
    }

    #[test]
    fn report_formats_per_replication_lines() {
        let mut runner = ReplicationRunner::new(
            Model::new(),
            Experiment {
                replications: 2,
                replication_length: Some(Duration::from_secs(1)),
                ..Experiment::default()
            },
        );
        let report = runner.run().unwrap();
        let text = report.to_string();
        assert!(text.contains("Replications: 2/2 completed"));
        assert!(text.contains("rep   1"));
        assert!(text.contains("rep   2"));
    }
}
