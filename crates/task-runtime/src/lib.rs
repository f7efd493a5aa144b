mod handler;
mod reduce;
mod runtime;

pub use handler::{Handler, HandlerOutcome, HandlerRegistry};
pub use reduce::{reduce, StepAction, StepCommand, StepTransition};
pub use runtime::MicroStepRuntime;
