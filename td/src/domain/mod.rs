//! Domain types: the persisted entities and in-memory workflow definitions
//! the scheduler operates on.

mod mode;
mod proposal;
mod queue_entry;
mod state_kv;
mod task;
mod task_output;

pub use mode::{IntegrationStyle, Mode, ModeTable, Phase, PhaseFlags, PhaseKind, default_mode};
pub use proposal::{Proposal, ProposalDimensions, ProposalStatus};
pub use queue_entry::{QueueEntry, QueueStatus, UNKNOWN_RETRY_LIMIT};
pub use state_kv::StateKv;
pub use task::{LAST_ERROR_BUDGET, STATUS_BACKLOG, STATUS_DONE, STATUS_FAILED, STATUS_MERGED, STATUS_REBASE, Task, truncate_tail};
pub use task_output::{OUTPUT_BUDGET, TaskOutput};

pub use taskstore::{Filter, FilterOp, IndexValue, Record, Store};
