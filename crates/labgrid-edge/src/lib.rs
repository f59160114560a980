//! labgrid-edge: connections from edge controllers.
//!
//! [`Control`] authenticates edges, makes each connection the exclusive
//! owner of its lab, and runs the dispatchers that move jobs from the
//! shared queue onto per-lab queues. Each [`EdgeSession`] drains its lab's
//! queues and runs engines against the connection.

pub mod context;
pub mod control;
mod dispatch;
pub mod error;
pub mod session;
pub mod ws;

pub use context::ControlContext;
pub use control::Control;
pub use error::{EdgeError, EdgeResult};
pub use session::EdgeSession;
pub use ws::{schedule_ws, ws_router};
