pub mod config;
pub mod error;
pub mod formatter;
pub mod loader;
pub mod machine;
pub mod model;
pub mod results;
pub mod runlist;
pub mod runtime;
pub mod transport;
pub mod validation;

pub use config::{ConfigFile, RunConfiguration, RunConfigurationBuilder};
pub use error::{ContentError, FailureKind, InputError, OperatorError, TransportError};
pub use formatter::format_command;
pub use machine::{CommandRequest, Machine};
pub use model::{Executor, ExecutorKind, Host, InputArgument, TechniquePlan, TestDefinition};
pub use results::{ExecutionResult, Phase, ResultStatus, RunReport, TestRecord};
pub use runlist::{RunListBuilder, Selection, WorkItem};
pub use runtime::{InputPrompter, Operator, RunOutcome, RunRequest};
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
