//! Cron expression evaluation and the schedule/execution engine.

pub mod expr;
pub mod scheduler;

pub use expr::{CronError, CronExpr};
pub use scheduler::{
    CronScheduler, Execution, ExecutionStatus, FunctionInvoker, InvokeError, InvokeOutcome,
    NewSchedule, Schedule, ScheduleStatus, SchedulerError,
};
