//! Background task supervision.

pub mod supervisor;

pub use supervisor::{
    NO_BACKTRACE, RestartPolicy, Supervisor, SupervisorReport, TaskExit, WorkerHandle,
};
