use anyhow::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub exc_type: String,
    pub message: String,
    pub traceback: String,
}

/// Captured result of running one code fragment.
///
/// `stdout` and `stderr` hold everything written before the fragment finished or raised;
/// `raised` is set when execution stopped on an uncaught error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub raised: Option<ExceptionInfo>,
}

impl ExecOutcome {
    pub fn is_success(&self) -> bool {
        self.raised.is_none()
    }
}

/// Runs code fragments against a namespace that lives as long as the executor.
///
/// `Err` is reserved for failures of the executor itself; errors raised by the fragment
/// come back inside `ExecOutcome::raised`.
pub trait CodeExecutor {
    fn run(&self, code: &str) -> Result<ExecOutcome>;
}
