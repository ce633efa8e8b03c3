mod config;
mod error;
mod operator;
mod types;

pub use config::{ExecSpec, ResourceLimits, RunSpec, TmpfsMount};
pub use error::{Result, RuntimeError};
pub use operator::ContainerOperator;
pub use types::{
    ContainerEvent, EventStream, EventsQuery, ExecHandle, OUTPUT_BUFFER_LINES, ProcessExit,
    drain_output, output_channel,
};
