//! Child process supervision.

mod output;
mod supervisor;

pub use output::OutputRecordReader;
pub use supervisor::{
    ProcessExit, ProcessSpec, ProcessSupervisor, SupervisedProcess, SupervisorConfig,
};
