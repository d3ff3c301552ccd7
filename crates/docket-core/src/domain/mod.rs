//! Domain model (ids, kinds, payloads, task record + state machine, progress).
//!
//! 副作用なし。ストア・キュー・プロバイダには依存しない。

pub mod attempt;
pub mod cost;
pub mod errors;
pub mod ids;
pub mod payload;
pub mod progress;
pub mod state;
pub mod task;
pub mod task_kind;

pub use attempt::{AttemptOutcome, AttemptRecord};
pub use cost::{CostEstimate, CostRates, Usage};
pub use errors::{ErrorKind, TaskError, TransitionError, ValidationError};
pub use ids::{AttemptId, EntryId, OwnerId, TaskId};
pub use payload::{PayloadLimits, TaskPayload};
pub use progress::{CatchUpEvent, ProgressEvent, ProgressMessage, TerminalEvent};
pub use state::TaskStatus;
pub use task::{MAX_IN_FLIGHT_PROGRESS, ProviderBinding, QueueRef, TaskMutation, TaskRecord};
pub use task_kind::TaskKind;
