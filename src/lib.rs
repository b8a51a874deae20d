//! # Conflux
//!
//! The embeddable task-dispatch and dataflow-join engine.
//!
//! Queue-based, restartable execution of discrete tasks, with a reusable
//! Join abstraction wiring producers to consumers under different
//! fan-in/fan-out/collection policies, and audit trails tracing any result
//! back to its originating inputs. No infrastructure required.
//!
//! ## Why Conflux?
//!
//! - **Explicit wiring** - Joins are typed values registered on an owned
//!   [`App`]; no globals, no runtime code generation
//! - **Single-threaded by design** - One cooperative run loop; interleaving
//!   is a property of the queue, not of threads
//! - **Observable by default** - Every dispatched value carries its full
//!   provenance chain
//! - **Embeddable** - A library, not a service. Runs in your process.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conflux::{App, Join};
//! use serde_json::json;
//!
//! let mut app = App::new();
//! let load = app.register(Load);
//! let shout = app.register(Shout);
//! app.wire(Join::sequence(&[load], &[shout]))?;
//!
//! app.enq(load, vec![json!("moon")])?;
//! app.run().await?;
//! ```
//!
//! ## Join variants
//!
//! - [`Join::fork`] / [`Join::sequence`] - broadcast to every target
//! - [`Join::merge`] - independent pass-through, one firing per source
//! - [`Join::sync`] - collect one result per source, fire exactly once
//! - [`Join::switch`] - conditional dispatch through a selector
//! - [`Join::gate`] - self-requeuing collector, optionally windowed with
//!   [`Join::limit`]
//!
//! ## Stopping
//!
//! [`App::stop_handle`] returns a flag-only handle safe to use from signal
//! handlers: `stop` finishes the current entry and preserves the queue for
//! a later `run`; `terminate` is absorbing.

pub mod app;
pub mod audit;
pub mod join;
pub mod task;

pub use app::{App, EngineError, EntryId, RunState, StopHandle};
pub use audit::{Audit, TrailEntry};
pub use join::{Join, JoinId, JoinKind, Selector};
pub use task::{Task, TaskId};
