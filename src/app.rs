//! Scheduler: registry, run queue, state machine, and join dispatch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::Audit;
use crate::join::{Join, JoinId, JoinKind, Selector};
use crate::task::{Task, TaskId};

/// Unique identifier for a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub u64);

/// Error surfaced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Operation against a terminated engine.
    #[error("engine is terminated")]
    Terminated,

    /// A task body returned an error; fatal to the current run.
    #[error("task '{task}' failed: {source}")]
    TaskFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// A synchronized merge slot received a second result before the
    /// collected group fired.
    #[error("synchronize collision: '{task}' filled slot {slot} twice")]
    SynchronizeCollision { task: String, slot: usize },

    /// A switch selector picked an index with no matching target.
    #[error("switch index {index} out of bounds for {targets} targets")]
    SwitchIndexOutOfBounds { index: usize, targets: usize },

    /// `iterate` and `splat` cannot be combined on one join.
    #[error("join config: iterate and splat are mutually exclusive")]
    IterateSplatConflict,

    /// `limit` only applies to gate joins, and must be non-zero.
    #[error("join config: limit requires a gate join and must be non-zero")]
    InvalidLimit,

    /// A join must name at least one source and one target.
    #[error("join config: sources and targets must not be empty")]
    EmptyJoin,

    /// A handle referenced a task unknown to this engine.
    #[error("unknown task handle {0}")]
    UnknownTask(usize),

    /// `iterate`/`splat` shaping was asked of a non-array result.
    #[error("result of '{task}' is not iterable")]
    NotIterable { task: String },
}

/// Lifecycle of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Idle; `run` may start or resume draining the queue.
    Ready,
    /// The run loop is draining the queue.
    Running,
    /// Stop observed; the current unit finishes, the queue is preserved.
    Stopping,
    /// Terminated; every further operation fails.
    Terminated,
}

/// Flag-only handle for stopping or terminating a running engine from an
/// asynchronous interrupt context (e.g. a signal handler).
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request a cooperative stop: the current entry finishes, the rest of
    /// the queue is preserved for a later `run`.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request termination: absorbing, observed at the next checkpoint.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }
}

enum QueueEntry {
    /// An (executable, arguments) pair awaiting execution.
    Task {
        id: EntryId,
        task: TaskId,
        args: Vec<Audit>,
        enqueued_at: DateTime<Utc>,
    },
    /// A gate join's self-enqueued continuation. The epoch identifies the
    /// collection it closes, replacing buffer reference identity.
    Resume { join: JoinId, epoch: u64 },
}

/// On-complete subscription: which join to fire, and which source slot the
/// completing task stands in for.
#[derive(Clone, Copy)]
struct Hook {
    join: JoinId,
    slot: usize,
}

enum GateState {
    Idle,
    Collecting { buffer: Vec<Audit>, epoch: u64 },
}

/// Per-join runtime: the variant algorithm plus its mutable buffers.
enum JoinRuntime {
    Fork,
    Merge,
    Sync { slots: Vec<Option<Audit>> },
    Switch { selector: Selector },
    Gate { limit: Option<usize>, collector: GateState },
}

struct JoinEntry {
    targets: Vec<TaskId>,
    iterate: bool,
    splat: bool,
    stack: bool,
    unbatched: bool,
    runtime: JoinRuntime,
}

/// What a join decided to do with a completed result.
enum Firing {
    Deliver {
        targets: Vec<TaskId>,
        groups: Vec<Vec<Audit>>,
    },
    OpenGate {
        epoch: u64,
    },
    Nothing,
}

/// The scheduler: owns the task registry, the run queue, and the state
/// machine. Execution is single-threaded and cooperative; one queue entry
/// is processed fully (including in-line deliveries it triggers) before
/// the next.
pub struct App {
    tasks: Vec<Arc<dyn Task>>,
    batches: Vec<Vec<TaskId>>,
    hooks: Vec<Vec<Hook>>,
    joins: Vec<JoinEntry>,
    queue: VecDeque<QueueEntry>,
    state: RunState,
    stop: Arc<AtomicBool>,
    terminate: Arc<AtomicBool>,
    audit: bool,
    audits: Vec<Audit>,
    next_entry: u64,
    gate_epochs: u64,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    /// New engine with audit mode on.
    pub fn new() -> Self {
        Self::with_audit(true)
    }

    /// New engine that skips trail recording.
    pub fn without_audit() -> Self {
        Self::with_audit(false)
    }

    fn with_audit(audit: bool) -> Self {
        Self {
            tasks: Vec::new(),
            batches: Vec::new(),
            hooks: Vec::new(),
            joins: Vec::new(),
            queue: VecDeque::new(),
            state: RunState::Ready,
            stop: Arc::new(AtomicBool::new(false)),
            terminate: Arc::new(AtomicBool::new(false)),
            audit,
            audits: Vec::new(),
            next_entry: 0,
            gate_epochs: 0,
        }
    }

    /// Register a task, returning its handle. The task's batch starts as
    /// itself alone.
    pub fn register(&mut self, task: impl Task + 'static) -> TaskId {
        let id = TaskId(self.tasks.len());
        self.tasks.push(Arc::new(task));
        self.batches.push(vec![id]);
        self.hooks.push(Vec::new());
        id
    }

    /// Declare the given tasks one dispatch unit: each member's batch
    /// becomes the full group. Declare batches before wiring joins that
    /// should see them.
    pub fn batch(&mut self, members: &[TaskId]) -> Result<(), EngineError> {
        for member in members {
            self.check_task(*member)?;
        }
        for member in members {
            self.batches[member.0] = members.to_vec();
        }
        Ok(())
    }

    /// Validate `join` and subscribe it as an on-complete hook of every
    /// source (or source-batch member). Hooks fire in wiring order.
    pub fn wire(&mut self, join: Join) -> Result<JoinId, EngineError> {
        if join.iterate && join.splat {
            return Err(EngineError::IterateSplatConflict);
        }
        if join.sources.is_empty() || join.targets.is_empty() {
            return Err(EngineError::EmptyJoin);
        }
        match (&join.kind, join.limit) {
            (JoinKind::Gate, Some(0)) => return Err(EngineError::InvalidLimit),
            (JoinKind::Gate, _) => {}
            (_, Some(_)) => return Err(EngineError::InvalidLimit),
            (_, None) => {}
        }
        for task in join.sources.iter().chain(join.targets.iter()) {
            self.check_task(*task)?;
        }

        let id = JoinId(self.joins.len());
        for (slot, source) in join.sources.iter().enumerate() {
            let members: Vec<TaskId> = if join.unbatched {
                vec![*source]
            } else {
                self.batches[source.0].clone()
            };
            for member in members {
                self.hooks[member.0].push(Hook { join: id, slot });
            }
        }

        let runtime = match join.kind {
            JoinKind::Fork => JoinRuntime::Fork,
            JoinKind::Merge => JoinRuntime::Merge,
            JoinKind::Sync => JoinRuntime::Sync {
                slots: vec![None; join.sources.len()],
            },
            JoinKind::Switch(selector) => JoinRuntime::Switch { selector },
            JoinKind::Gate => JoinRuntime::Gate {
                limit: join.limit,
                collector: GateState::Idle,
            },
        };
        self.joins.push(JoinEntry {
            targets: join.targets,
            iterate: join.iterate,
            splat: join.splat,
            stack: join.stack,
            unbatched: join.unbatched,
            runtime,
        });
        Ok(id)
    }

    /// Append a queue entry invoking `task` with the given positional
    /// arguments. Each argument is wrapped as an [`Audit`].
    pub fn enq(&mut self, task: TaskId, args: Vec<Value>) -> Result<EntryId, EngineError> {
        if self.is_terminated() {
            return Err(EngineError::Terminated);
        }
        self.check_task(task)?;
        let id = self.next_entry_id();
        let args = args.into_iter().map(|v| self.wrap(v)).collect();
        debug!(entry = id.0, task = self.tasks[task.0].name(), "enqueued");
        self.queue.push_back(QueueEntry::Task {
            id,
            task,
            args,
            enqueued_at: Utc::now(),
        });
        Ok(id)
    }

    /// Drain the queue, dispatching each entry in FIFO order.
    ///
    /// Returns to [`RunState::Ready`] when the queue empties or a stop is
    /// observed (queue preserved); moves to [`RunState::Terminated`] when a
    /// terminate is observed. A task error or join invariant violation
    /// aborts the run and propagates; the unconsumed remainder of the queue
    /// stays in place, already-dispatched results stay dispatched.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        if self.is_terminated() {
            self.state = RunState::Terminated;
            return Err(EngineError::Terminated);
        }
        // A stop requested before this run is stale.
        self.stop.store(false, Ordering::SeqCst);
        self.state = RunState::Running;
        info!(queued = self.queue.len(), "run loop started");

        while let Some(entry) = self.queue.pop_front() {
            let outcome = match entry {
                QueueEntry::Task {
                    id,
                    task,
                    args,
                    enqueued_at,
                } => {
                    let waited_ms = (Utc::now() - enqueued_at).num_milliseconds();
                    debug!(
                        entry = id.0,
                        task = self.tasks[task.0].name(),
                        waited_ms,
                        "executing queue entry"
                    );
                    self.dispatch_inner(task, args).await
                }
                QueueEntry::Resume { join, epoch } => self.resume_gate(join, epoch).await,
            };
            if let Err(e) = outcome {
                self.state = RunState::Ready;
                return Err(e);
            }

            if self.terminate.load(Ordering::SeqCst) {
                self.state = RunState::Terminated;
                self.queue.clear();
                info!("terminate observed; engine is now inert");
                return Ok(());
            }
            if self.stop.swap(false, Ordering::SeqCst) {
                self.state = RunState::Stopping;
                info!(queued = self.queue.len(), "stop observed; queue preserved");
                break;
            }
            // Hand the embedding runtime a turn between entries.
            tokio::task::yield_now().await;
        }

        self.state = RunState::Ready;
        Ok(())
    }

    /// Invoke `task` immediately with pre-audited arguments, bypassing the
    /// queue, then fire every join hooked on it in wiring order.
    ///
    /// This is the shared primitive behind queue-entry execution and
    /// in-line (`stack = false`) join deliveries, which recurse through it
    /// synchronously.
    pub async fn dispatch(&mut self, task: TaskId, args: Vec<Audit>) -> Result<(), EngineError> {
        self.dispatch_inner(task, args).await
    }

    /// Request a cooperative stop. Sets a flag only; the run loop observes
    /// it after the current entry.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Request termination. Sets a flag only; absorbing once observed.
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    /// Handle for requesting stop/terminate from an interrupt context.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: Arc::clone(&self.stop),
            terminate: Arc::clone(&self.terminate),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Number of entries waiting in the queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Audited results of every dispatch completed so far, in completion
    /// order. Empty when audit mode is off.
    pub fn audits(&self) -> &[Audit] {
        &self.audits
    }

    /// Drain the recorded audits, e.g. after handing them to an external
    /// collaborator for serialization.
    pub fn take_audits(&mut self) -> Vec<Audit> {
        std::mem::take(&mut self.audits)
    }

    fn next_entry_id(&mut self) -> EntryId {
        let id = EntryId(self.next_entry);
        self.next_entry += 1;
        id
    }

    fn wrap(&self, value: Value) -> Audit {
        if self.audit {
            Audit::root(value)
        } else {
            Audit::bare(value)
        }
    }

    fn is_terminated(&self) -> bool {
        self.state == RunState::Terminated || self.terminate.load(Ordering::SeqCst)
    }

    fn check_task(&self, id: TaskId) -> Result<(), EngineError> {
        if id.0 < self.tasks.len() {
            Ok(())
        } else {
            Err(EngineError::UnknownTask(id.0))
        }
    }

    /// Boxed so in-line deliveries can recurse through the join layer.
    fn dispatch_inner<'a>(
        &'a mut self,
        task: TaskId,
        args: Vec<Audit>,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        Box::pin(async move {
            if self.terminate.load(Ordering::SeqCst) {
                debug!("terminate observed at dispatch checkpoint; skipping");
                return Ok(());
            }
            self.check_task(task)?;
            let handle = Arc::clone(&self.tasks[task.0]);
            let values: Vec<Value> = args.iter().map(|a| a.value().clone()).collect();
            let result = handle
                .call(values)
                .await
                .map_err(|e| EngineError::TaskFailed {
                    task: handle.name().to_string(),
                    source: e,
                })?;

            let produced = if self.audit {
                let audited = Audit::merge(&args, handle.name(), result);
                self.audits.push(audited.clone());
                audited
            } else {
                Audit::produced(handle.name(), result)
            };

            let hooks = self.hooks[task.0].clone();
            debug!(task = handle.name(), hooks = hooks.len(), "task completed");
            for hook in hooks {
                self.fire_join(hook.join, hook.slot, &produced).await?;
            }
            Ok(())
        })
    }

    /// One on-complete hook firing: let the join decide, then act on the
    /// decision once the join buffers are released.
    async fn fire_join(
        &mut self,
        id: JoinId,
        slot: usize,
        result: &Audit,
    ) -> Result<(), EngineError> {
        let firing = {
            let entry = &mut self.joins[id.0];
            match &mut entry.runtime {
                JoinRuntime::Fork | JoinRuntime::Merge => Firing::Deliver {
                    targets: entry.targets.clone(),
                    groups: shape_result(entry.iterate, entry.splat, result)?,
                },
                JoinRuntime::Switch { selector } => match selector(result.value()) {
                    None => {
                        debug!(join = id.0, "switch selector declined; result unconsumed");
                        Firing::Nothing
                    }
                    Some(index) if index < entry.targets.len() => Firing::Deliver {
                        targets: vec![entry.targets[index]],
                        groups: shape_result(entry.iterate, entry.splat, result)?,
                    },
                    Some(index) => {
                        return Err(EngineError::SwitchIndexOutOfBounds {
                            index,
                            targets: entry.targets.len(),
                        })
                    }
                },
                JoinRuntime::Sync { slots } => {
                    if slots[slot].is_some() {
                        return Err(EngineError::SynchronizeCollision {
                            task: result.key().unwrap_or("external").to_string(),
                            slot,
                        });
                    }
                    slots[slot] = Some(result.clone());
                    if slots.iter().all(Option::is_some) {
                        // Take the group and reset every slot to the sentinel.
                        let group: Vec<Audit> = slots.iter_mut().filter_map(|s| s.take()).collect();
                        Firing::Deliver {
                            targets: entry.targets.clone(),
                            groups: vec![group],
                        }
                    } else {
                        debug!(join = id.0, slot, "sync slot filled; waiting for the rest");
                        Firing::Nothing
                    }
                }
                JoinRuntime::Gate { limit, collector } => match collector {
                    GateState::Idle => {
                        self.gate_epochs += 1;
                        let epoch = self.gate_epochs;
                        *collector = GateState::Collecting {
                            buffer: vec![result.clone()],
                            epoch,
                        };
                        Firing::OpenGate { epoch }
                    }
                    GateState::Collecting { buffer, .. } => {
                        buffer.push(result.clone());
                        match *limit {
                            Some(limit) if buffer.len() >= limit => {
                                let group: Vec<Audit> = buffer.drain(..).collect();
                                debug!(join = id.0, limit, "gate limit reached; flushing");
                                Firing::Deliver {
                                    targets: entry.targets.clone(),
                                    groups: vec![group],
                                }
                            }
                            _ => Firing::Nothing,
                        }
                    }
                },
            }
        };

        match firing {
            Firing::Nothing => Ok(()),
            Firing::OpenGate { epoch } => {
                debug!(join = id.0, epoch, "gate collection opened; scheduling resume");
                self.queue.push_back(QueueEntry::Resume { join: id, epoch });
                Ok(())
            }
            Firing::Deliver { targets, groups } => {
                for args in groups {
                    self.deliver(id, &targets, args).await?;
                }
                Ok(())
            }
        }
    }

    /// A gate's self-enqueued entry reached the head of the queue: fire the
    /// collected buffer and close the collection.
    async fn resume_gate(&mut self, id: JoinId, epoch: u64) -> Result<(), EngineError> {
        let (targets, group) = {
            let entry = &mut self.joins[id.0];
            let JoinRuntime::Gate { collector, .. } = &mut entry.runtime else {
                warn!(join = id.0, "resume entry for a non-gate join; ignoring");
                return Ok(());
            };
            match collector {
                GateState::Collecting { buffer, epoch: live } if *live == epoch => {
                    let group: Vec<Audit> = buffer.drain(..).collect();
                    *collector = GateState::Idle;
                    (entry.targets.clone(), group)
                }
                _ => {
                    warn!(join = id.0, epoch, "stale gate resume; ignoring");
                    return Ok(());
                }
            }
        };
        if group.is_empty() {
            // Every result already left through limit flushes.
            debug!(join = id.0, "gate closed with an empty buffer");
            return Ok(());
        }
        debug!(join = id.0, collected = group.len(), "gate firing collected results");
        self.deliver(id, &targets, group).await
    }

    /// Deliver one argument list to the given targets, expanding each
    /// target to its batch members unless the join is `unbatched`. `stack`
    /// defers members to the queue; otherwise each is invoked in-line,
    /// depth-first.
    async fn deliver(
        &mut self,
        id: JoinId,
        targets: &[TaskId],
        args: Vec<Audit>,
    ) -> Result<(), EngineError> {
        let (stack, unbatched) = {
            let join = &self.joins[id.0];
            (join.stack, join.unbatched)
        };
        for target in targets {
            let members: Vec<TaskId> = if unbatched {
                vec![*target]
            } else {
                self.batches[target.0].clone()
            };
            for member in members {
                if stack {
                    let entry = self.next_entry_id();
                    debug!(
                        join = id.0,
                        task = self.tasks[member.0].name(),
                        "deferring delivery to the queue"
                    );
                    self.queue.push_back(QueueEntry::Task {
                        id: entry,
                        task: member,
                        args: args.clone(),
                        enqueued_at: Utc::now(),
                    });
                } else {
                    self.dispatch_inner(member, args.clone()).await?;
                }
            }
        }
        Ok(())
    }
}

/// Apply a join's result shaping: one delivery with one argument by
/// default, one delivery per element under `iterate`, one delivery with
/// the elements as positional arguments under `splat`.
fn shape_result(
    iterate: bool,
    splat: bool,
    result: &Audit,
) -> Result<Vec<Vec<Audit>>, EngineError> {
    if iterate {
        let elements = result.splat().ok_or_else(|| not_iterable(result))?;
        Ok(elements.into_iter().map(|e| vec![e]).collect())
    } else if splat {
        Ok(vec![result.splat().ok_or_else(|| not_iterable(result))?])
    } else {
        Ok(vec![vec![result.clone()]])
    }
}

fn not_iterable(result: &Audit) -> EngineError {
    EngineError::NotIterable {
        task: result.key().unwrap_or("external").to_string(),
    }
}
