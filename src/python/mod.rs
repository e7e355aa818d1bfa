mod executor;
mod interpreter;

pub use executor::{CodeExecutor, ExceptionInfo, ExecOutcome};
pub use interpreter::{EvalResult, GlobalEntry, InterruptHandle, InterruptRequest, PythonSession};
