//! Join wiring descriptions.
//!
//! A [`Join`] wires N source tasks to M target tasks under one of five
//! dispatch algorithms, tagged by [`JoinKind`] at construction time. The
//! description is inert until registered with [`App::wire`](crate::App::wire),
//! which validates the configuration and subscribes the join as an
//! on-complete hook of every source (or source-batch member).

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::task::TaskId;

/// Unique handle for a wired join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinId(pub usize);

/// Decides which target a switch join routes a result to.
///
/// `Some(i)` routes to `targets[i]`; `None` leaves the result unconsumed.
pub type Selector = Arc<dyn Fn(&Value) -> Option<usize> + Send + Sync>;

/// Fan-in/fan-out algorithm of a join.
pub enum JoinKind {
    /// Stateless broadcast: every source completion forwards to every target.
    Fork,
    /// Stateless pass-through: each of N sources independently forwards to
    /// the target, which may fire up to N times.
    Merge,
    /// Synchronized merge: collect one result per source, fire once when
    /// every slot is full, then reset.
    Sync,
    /// Conditional dispatch to the single target picked by the selector.
    Switch(Selector),
    /// Self-requeuing collector: buffers results until the scheduler hands
    /// the turn back, optionally flushing every `limit` results.
    Gate,
}

impl fmt::Debug for JoinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fork => write!(f, "Fork"),
            Self::Merge => write!(f, "Merge"),
            Self::Sync => write!(f, "Sync"),
            Self::Switch(_) => write!(f, "Switch"),
            Self::Gate => write!(f, "Gate"),
        }
    }
}

/// A join wiring description: sources, targets, dispatch flags, and the
/// variant algorithm.
///
/// Built with the variant constructors and chained flag setters, then
/// registered with [`App::wire`](crate::App::wire):
///
/// ```rust,ignore
/// let join = Join::sync(&[a, b], &[concat]).stacked();
/// app.wire(join)?;
/// ```
pub struct Join {
    pub(crate) kind: JoinKind,
    pub(crate) sources: Vec<TaskId>,
    pub(crate) targets: Vec<TaskId>,
    pub(crate) iterate: bool,
    pub(crate) splat: bool,
    pub(crate) stack: bool,
    pub(crate) unbatched: bool,
    pub(crate) limit: Option<usize>,
}

impl Join {
    fn new(kind: JoinKind, sources: &[TaskId], targets: &[TaskId]) -> Self {
        Self {
            kind,
            sources: sources.to_vec(),
            targets: targets.to_vec(),
            iterate: false,
            splat: false,
            stack: false,
            unbatched: false,
            limit: None,
        }
    }

    /// Broadcast every source completion to every target.
    pub fn fork(sources: &[TaskId], targets: &[TaskId]) -> Self {
        Self::new(JoinKind::Fork, sources, targets)
    }

    /// Alias for [`Join::fork`]: a one-to-one fork is a plain sequence.
    pub fn sequence(sources: &[TaskId], targets: &[TaskId]) -> Self {
        Self::fork(sources, targets)
    }

    /// Forward each source completion independently to the targets.
    pub fn merge(sources: &[TaskId], targets: &[TaskId]) -> Self {
        Self::new(JoinKind::Merge, sources, targets)
    }

    /// Collect one result per source and fire once when all have completed.
    pub fn sync(sources: &[TaskId], targets: &[TaskId]) -> Self {
        Self::new(JoinKind::Sync, sources, targets)
    }

    /// Route each result to the single target picked by `selector`.
    pub fn switch(
        sources: &[TaskId],
        targets: &[TaskId],
        selector: impl Fn(&Value) -> Option<usize> + Send + Sync + 'static,
    ) -> Self {
        Self::new(JoinKind::Switch(Arc::new(selector)), sources, targets)
    }

    /// Collect results across turns, firing when the scheduler reaches the
    /// collector's own queue entry.
    pub fn gate(sources: &[TaskId], targets: &[TaskId]) -> Self {
        Self::new(JoinKind::Gate, sources, targets)
    }

    /// Dispatch once per element of an array result instead of once with
    /// the whole result. Mutually exclusive with [`Join::splat`].
    pub fn iterate(mut self) -> Self {
        self.iterate = true;
        self
    }

    /// Explode an array result into positional arguments for a single
    /// dispatch. Mutually exclusive with [`Join::iterate`].
    pub fn splat(mut self) -> Self {
        self.splat = true;
        self
    }

    /// Defer deliveries to the run queue instead of invoking targets
    /// in-line.
    pub fn stacked(mut self) -> Self {
        self.stack = true;
        self
    }

    /// Subscribe to and deliver to the literal sources/targets only,
    /// ignoring batch membership.
    pub fn unbatched(mut self) -> Self {
        self.unbatched = true;
        self
    }

    /// Flush a gate's buffer every `limit` collected results, ahead of the
    /// closing turn. Only valid on [`Join::gate`] joins.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
