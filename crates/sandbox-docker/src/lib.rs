mod command;
mod operator;
mod prerequisites;
mod stream;

pub use command::CommandError;
pub use operator::DockerOperator;
