//! Domain backends.
//!
//! Each backend owns its supervised task, registers its methods on a
//! [`Dispatcher`](crate::protocol::Dispatcher) and its task on a
//! [`SupervisorRegistry`](crate::supervisor::SupervisorRegistry).

pub mod inspector;
pub mod monitor;
pub mod timer;

pub use inspector::InspectorBackend;
pub use monitor::MonitorBackend;
pub use timer::TimerBackend;

use serde_json::{Value, json};

/// `{success:false, error}` result for a benign conflict.
pub(crate) fn rejected(error: &str) -> Value {
    json!({ "success": false, "error": error })
}
