//! Task dispatch: broadcast, acquire, completion and the maintenance loop

pub mod coordinator;
pub mod scheduler;
pub mod wait;

pub use coordinator::{
    AcquireOutcome, CompletionCallback, DispatchEvent, ExecutionOutcome, PendingTaskEvent,
    TaskDispatchCoordinator, NO_DELEGATE_REACHED,
};
pub use scheduler::TickReport;
pub use wait::{TaskCompletion, WaitRegistry};
