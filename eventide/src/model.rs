//! The model: a named hierarchy of elements with replication lifecycle
//! hooks.
//!
//! Elements register once and then receive hook calls from the
//! replication controller in pre-order (parents before children):
//! experiment setup, per-replication setup, initialization, warm-up,
//! and teardown. Elements schedule their behavior through the
//! [`SimContext`] passed to every hook.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{SimulationError, SimulationResult};
use crate::executive::Executive;
use crate::process::ProcessEngine;
use crate::streams::StreamRegistry;

/// Identifier of an element within one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementId(usize);

/// The kernel facilities available to model element hooks.
///
/// Cheap to clone; all clones reference the same executive, engine, and
/// stream registry.
#[derive(Debug, Clone)]
pub struct SimContext {
    executive: Executive,
    engine: ProcessEngine,
    streams: StreamRegistry,
}

impl SimContext {
    pub(crate) fn new(executive: Executive, engine: ProcessEngine, streams: StreamRegistry) -> Self {
        Self {
            executive,
            engine,
            streams,
        }
    }

    /// The executive driving this run.
    pub fn executive(&self) -> &Executive {
        &self.executive
    }

    /// The process engine for this run.
    pub fn engine(&self) -> &ProcessEngine {
        &self.engine
    }

    /// The registered random streams.
    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// The current virtual time.
    pub fn now(&self) -> Duration {
        self.executive.now()
    }
}

/// A component of the model with replication lifecycle hooks.
///
/// Every hook has a no-op default; elements implement only what they
/// need. Hooks must not assume any particular replication count.
pub trait ModelElement {
    /// The element's unique name within the model.
    fn name(&self) -> &str;

    /// Called once before the first replication of an experiment.
    fn before_experiment(&mut self, _ctx: &SimContext) -> SimulationResult<()> {
        Ok(())
    }

    /// Called at the start of every replication, after the executive is
    /// reset and before any events run. Schedule initial events here.
    fn before_replication(&mut self, _ctx: &SimContext) -> SimulationResult<()> {
        Ok(())
    }

    /// Called at the start of every replication when per-replication
    /// initialization is enabled, after [`Self::before_replication`].
    fn initialize(&mut self, _ctx: &SimContext) -> SimulationResult<()> {
        Ok(())
    }

    /// Called when the warm-up event fires, if a warm-up length is
    /// configured. Statistics collected before this point are discarded.
    fn warm_up(&mut self, _ctx: &SimContext) -> SimulationResult<()> {
        Ok(())
    }

    /// Called after each replication's dispatch loop halts.
    fn after_replication(&mut self, _ctx: &SimContext) -> SimulationResult<()> {
        Ok(())
    }

    /// Called once after the last replication of an experiment.
    fn after_experiment(&mut self, _ctx: &SimContext) -> SimulationResult<()> {
        Ok(())
    }
}

type SharedElement = Rc<RefCell<dyn ModelElement>>;

struct ElementNode {
    element: SharedElement,
    children: Vec<ElementId>,
}

#[derive(Default)]
struct ModelInner {
    nodes: Vec<ElementNode>,
    roots: Vec<ElementId>,
    names: HashSet<String>,
}

/// The registry of model elements, iterated in pre-order for every hook.
#[derive(Clone, Default)]
pub struct Model {
    inner: Rc<RefCell<ModelInner>>,
}

impl Model {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a top-level element. Element names must be unique
    /// within the model.
    pub fn add_element(&self, element: SharedElement) -> SimulationResult<ElementId> {
        self.insert(element, None)
    }

    /// Registers an element as a child of `parent`. Children receive
    /// every hook after their parent.
    pub fn add_child(&self, parent: ElementId, element: SharedElement) -> SimulationResult<ElementId> {
        self.insert(element, Some(parent))
    }

    fn insert(&self, element: SharedElement, parent: Option<ElementId>) -> SimulationResult<ElementId> {
        let mut inner = self.inner.borrow_mut();
        let name = element.borrow().name().to_string();
        if !inner.names.insert(name.clone()) {
            return Err(SimulationError::InvalidState(format!(
                "model already contains an element named '{name}'"
            )));
        }
        if let Some(ElementId(p)) = parent {
            if p >= inner.nodes.len() {
                return Err(SimulationError::InvalidState(format!(
                    "parent element {p} does not exist"
                )));
            }
        }
        let id = ElementId(inner.nodes.len());
        inner.nodes.push(ElementNode {
            element,
            children: Vec::new(),
        });
        match parent {
            Some(ElementId(p)) => inner.nodes[p].children.push(id),
            None => inner.roots.push(id),
        }
        tracing::debug!(name, ?parent, "model element registered");
        Ok(id)
    }

    /// Number of registered elements.
    pub fn element_count(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    /// Snapshot of the elements in pre-order. Taken before dispatching
    /// hooks so a hook can register further elements without holding the
    /// registry borrow.
    fn pre_order(&self) -> Vec<SharedElement> {
        let inner = self.inner.borrow();
        let mut out = Vec::with_capacity(inner.nodes.len());
        let mut stack: Vec<ElementId> = inner.roots.iter().rev().copied().collect();
        while let Some(ElementId(index)) = stack.pop() {
            let node = &inner.nodes[index];
            out.push(Rc::clone(&node.element));
            stack.extend(node.children.iter().rev());
        }
        out
    }

    fn dispatch<F>(&self, ctx: &SimContext, mut hook: F) -> SimulationResult<()>
    where
        F: FnMut(&mut dyn ModelElement, &SimContext) -> SimulationResult<()>,
    {
        for element in self.pre_order() {
            hook(&mut *element.borrow_mut(), ctx)?;
        }
        Ok(())
    }

    pub(crate) fn before_experiment_actions(&self, ctx: &SimContext) -> SimulationResult<()> {
        self.dispatch(ctx, |e, ctx| e.before_experiment(ctx))
    }

    pub(crate) fn before_replication_actions(&self, ctx: &SimContext) -> SimulationResult<()> {
        self.dispatch(ctx, |e, ctx| e.before_replication(ctx))
    }

    pub(crate) fn initialize_actions(&self, ctx: &SimContext) -> SimulationResult<()> {
        self.dispatch(ctx, |e, ctx| e.initialize(ctx))
    }

    pub(crate) fn warm_up_actions(&self, ctx: &SimContext) -> SimulationResult<()> {
        tracing::info!(time = ?ctx.now(), "warm-up period over, notifying elements");
        self.dispatch(ctx, |e, ctx| e.warm_up(ctx))
    }

    pub(crate) fn after_replication_actions(&self, ctx: &SimContext) -> SimulationResult<()> {
        self.dispatch(ctx, |e, ctx| e.after_replication(ctx))
    }

    pub(crate) fn after_experiment_actions(&self, ctx: &SimContext) -> SimulationResult<()> {
        self.dispatch(ctx, |e, ctx| e.after_experiment(ctx))
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("elements", &self.inner.borrow().nodes.len())
            .finish()
    }
}
