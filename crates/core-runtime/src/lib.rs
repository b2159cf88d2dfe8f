//! Port allocation, process launching, and the worker runtime supervisor that
//! composes them into a per-function warm pool.

pub mod launcher;
pub mod port;
pub mod supervisor;

pub use launcher::{LaunchedProcess, LauncherError, ProcessLauncher, WorkerEnv};
pub use port::{PortAllocator, PortError, PortRange};
pub use supervisor::{
    Function, FunctionMetricsSnapshot, FunctionStatus, HttpEvent, HttpResponse, Instance,
    InstanceStatus, Invocation, InvocationStatus, NewFunction, WorkerError, WorkerSupervisor,
    WorkerSupervisorConfig,
};
