pub mod command;
pub mod event;
pub mod state;

pub use command::Command;
pub use event::{Event, EventData};
pub use state::{
    default_max_tries, get_dot_path, set_dot_path, Lease, SignalRecord, Task, TaskKind,
    TaskStatus, WorkflowState, WorkflowStatus,
};
