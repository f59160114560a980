//! labgrid-engine: executes work on a lab's devices.
//!
//! Two engines implement [`Task`]:
//!
//! * [`DagEngine`] runs a persisted workflow graph in dependency waves.
//! * [`ActionEngine`] runs one ad-hoc action through query → send → callback.
//!
//! Both talk to the edge through an [`EdgeSender`] and receive device
//! replies via `on_job_status` / `on_action_state`, which the owning edge
//! session calls when a frame for their task id arrives.

pub mod action;
pub mod dag;
pub mod error;
pub mod notify;
pub mod pool;
pub mod sender;
pub mod status;
pub mod task;

pub use action::ActionEngine;
pub use dag::{DagEngine, build_dependencies};
pub use error::{EngineError, EngineResult};
pub use notify::{BackboneNotifier, Event, Notifier};
pub use pool::WorkerPool;
pub use sender::{ChannelSender, EdgeSender, SendClock};
pub use status::{ActionStatusTable, ActionValue};
pub use task::{ControlTask, Task, TaskRegistry, WorkflowInfo};
