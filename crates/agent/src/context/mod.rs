//! Session context: the step log and the stores executed code can reach.
//!
//! | Store | Keyed by | Lifetime |
//! |-------|----------|----------|
//! | [`StepMemory`] | step order | until `reset()` |
//! | [`SideChannelStore`] | completion id | read once, or swept after TTL |
//! | [`ExecutionLog`] | execution id | committed: session; otherwise swept after TTL |

pub mod execution_log;
pub mod side_channel;
pub mod step_memory;
pub mod sweeper;

pub use execution_log::{ExecutionLog, ExecutionRecord};
pub use side_channel::{SideChannelEntry, SideChannelStore};
pub use step_memory::{ActionStep, DispatchedCode, PlanningStep, Step, StepKind, StepMemory};
pub use sweeper::spawn_sweeper;
