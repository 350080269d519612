//! dirsync daemon: the dispatcher and the supervisor that wires detector,
//! queue, dispatcher, and transfer server together.

pub mod dispatcher;
mod error;
mod runtime;

pub use dispatcher::{DispatchStats, Dispatcher, Delivery};
pub use error::DaemonError;
pub use runtime::{init_tracing, run, start_blocking, Supervisor, SupervisorState};
