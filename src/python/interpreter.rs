use anyhow::{Result, anyhow};
use pyo3::exceptions::PyKeyboardInterrupt;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyTuple};
use std::ffi::CString;
use std::os::raw::c_long;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::executor::{CodeExecutor, ExceptionInfo, ExecOutcome};

// sys.stdout and sys.stderr are process-wide, so two captures must never overlap.
static CAPTURE_LOCK: Mutex<()> = Mutex::new(());
// Cell names land in the shared linecache, so numbering is process-wide.
static CELL_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_cell() -> u64 {
    CELL_COUNTER.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalResult {
    pub value_repr: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalEntry {
    pub name: String,
    pub type_name: String,
}

/// An embedded CPython namespace that persists for the lifetime of the session.
///
/// Each session owns its own globals dictionary, so two sessions never see each
/// other's bindings even though they share one interpreter.
pub struct PythonSession {
    helpers: Py<PyDict>,
    namespace: Py<PyDict>,
    running: Arc<RunState>,
}

struct RunState {
    helpers: Py<PyDict>,
    executing: AtomicBool,
    interrupted: AtomicBool,
}

/// What a Ctrl-C means for the fragment currently executing, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptRequest {
    /// Nothing is executing.
    Idle,
    /// First interrupt for this fragment: raise `KeyboardInterrupt` inside it.
    Raise,
    /// The fragment survived an earlier interrupt.
    Repeated,
}

/// Cross-thread handle used to interrupt the fragment a `PythonSession` is running.
#[derive(Clone)]
pub struct InterruptHandle {
    state: Arc<RunState>,
}

impl InterruptHandle {
    pub fn is_executing(&self) -> bool {
        self.state.executing.load(Ordering::SeqCst)
    }

    pub fn request(&self) -> InterruptRequest {
        if !self.is_executing() {
            return InterruptRequest::Idle;
        }
        if self.state.interrupted.swap(true, Ordering::SeqCst) {
            InterruptRequest::Repeated
        } else {
            InterruptRequest::Raise
        }
    }

    /// Schedules `KeyboardInterrupt` in the thread running user code. Blocks until the
    /// interpreter lock is available. Returns false when no user code was running.
    pub fn raise_keyboard_interrupt(&self) -> Result<bool> {
        Python::attach(|py| -> Result<bool> {
            let helpers = self.state.helpers.bind(py);
            let thread = PythonSession::call_helper(helpers, "running_thread", ())?;
            let Some(thread) = thread.extract::<Option<u64>>()? else {
                return Ok(false);
            };

            let exception = py.get_type::<PyKeyboardInterrupt>();
            // SAFETY: the interpreter lock is held and `exception` is a live type object.
            let affected = unsafe {
                pyo3::ffi::PyThreadState_SetAsyncExc(thread as c_long, exception.as_ptr())
            };
            Ok(affected == 1)
        })
    }
}

struct ExecutingGuard<'a>(&'a RunState);

impl<'a> ExecutingGuard<'a> {
    fn enter(state: &'a RunState) -> Self {
        state.interrupted.store(false, Ordering::SeqCst);
        state.executing.store(true, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.executing.store(false, Ordering::SeqCst);
        self.0.interrupted.store(false, Ordering::SeqCst);
    }
}

impl PythonSession {
    pub fn initialize() -> Result<Self> {
        Python::attach(|py| -> Result<Self> {
            let helpers = PyDict::new(py);
            Self::install_runtime_helpers(py, &helpers)?;

            let namespace = Self::call_helper(&helpers, "new_namespace", ())?;
            let namespace = Self::cast_dict(&namespace)?.clone();
            Self::health_check(py, &namespace)?;

            let running = Arc::new(RunState {
                helpers: helpers.clone().unbind(),
                executing: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
            });

            Ok(Self {
                helpers: helpers.unbind(),
                namespace: namespace.unbind(),
                running,
            })
        })
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            state: Arc::clone(&self.running),
        }
    }

    pub fn exec_code(&self, code: &str) -> Result<ExecOutcome> {
        let _capture = CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let _executing = ExecutingGuard::enter(&self.running);
        Python::attach(|py| -> Result<ExecOutcome> {
            let helpers = self.helpers.bind(py);
            let namespace = self.namespace.bind(py);
            let result =
                Self::call_helper(helpers, "exec_code", (namespace, code, next_cell()))?;

            let raised = if Self::result_ok(&result)? {
                None
            } else {
                Some(Self::dict_exception(&result)?)
            };

            Ok(ExecOutcome {
                stdout: Self::dict_string(&result, "stdout")?,
                stderr: Self::dict_string(&result, "stderr")?,
                raised,
            })
        })
    }

    pub fn eval_expr(&self, expr: &str) -> Result<EvalResult> {
        let _capture = CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        Python::attach(|py| -> Result<EvalResult> {
            let helpers = self.helpers.bind(py);
            let namespace = self.namespace.bind(py);
            let result =
                Self::call_helper(helpers, "eval_expr", (namespace, expr, next_cell()))?;
            if !Self::result_ok(&result)? {
                let exception = Self::dict_exception(&result)?;
                anyhow::bail!("{}", exception.traceback)
            }

            Ok(EvalResult {
                value_repr: Self::dict_string(&result, "value_repr")?,
                stdout: Self::dict_string(&result, "stdout")?,
                stderr: Self::dict_string(&result, "stderr")?,
            })
        })
    }

    pub fn list_globals(&self) -> Result<Vec<GlobalEntry>> {
        Python::attach(|py| -> Result<Vec<GlobalEntry>> {
            let helpers = self.helpers.bind(py);
            let namespace = self.namespace.bind(py);
            let py_entries = Self::call_helper(helpers, "list_globals", (namespace,))?;
            let py_entries = Self::cast_list(&py_entries)?;
            let mut entries = Vec::with_capacity(py_entries.len());
            for item in py_entries.iter() {
                let tuple = Self::cast_tuple(&item)?;
                entries.push(GlobalEntry {
                    name: tuple.get_item(0)?.extract()?,
                    type_name: tuple.get_item(1)?.extract()?,
                });
            }
            Ok(entries)
        })
    }

    /// Distributions importable from this interpreter, as `name==version`.
    pub fn installed_packages(&self) -> Result<Vec<String>> {
        Python::attach(|py| -> Result<Vec<String>> {
            let helpers = self.helpers.bind(py);
            let packages = Self::call_helper(helpers, "installed_packages", ())?;
            Ok(packages.extract()?)
        })
    }

    pub fn python_version(&self) -> Result<String> {
        Python::attach(|py| -> Result<String> {
            let helpers = self.helpers.bind(py);
            let version = Self::call_helper(helpers, "python_version", ())?;
            Ok(version.extract()?)
        })
    }

    pub fn is_healthy(&self) -> bool {
        Python::attach(|py| {
            let namespace = self.namespace.bind(py);
            Self::health_check(py, namespace).is_ok()
        })
    }

    fn health_check(py: Python<'_>, namespace: &Bound<'_, PyDict>) -> PyResult<()> {
        let _ = py.eval(c"1 + 1", Some(namespace), Some(namespace))?;
        Ok(())
    }

    fn install_runtime_helpers(py: Python<'_>, helpers: &Bound<'_, PyDict>) -> Result<()> {
        let helper_code = CString::new(include_str!("runtime_helpers.py"))?;
        py.run(helper_code.as_c_str(), Some(helpers), Some(helpers))?;
        Ok(())
    }

    fn call_helper<'py, A>(
        helpers: &Bound<'py, PyDict>,
        helper_name: &str,
        args: A,
    ) -> Result<Bound<'py, PyAny>>
    where
        A: pyo3::call::PyCallArgs<'py>,
    {
        let helper = helpers
            .get_item(helper_name)?
            .ok_or_else(|| anyhow!("missing runtime helper {helper_name}"))?;
        Ok(helper.call1(args)?)
    }

    fn result_ok(result: &Bound<'_, PyAny>) -> Result<bool> {
        let dict = Self::cast_dict(result)?;
        Ok(dict
            .get_item("ok")?
            .ok_or_else(|| anyhow!("missing ok in helper result"))?
            .extract()?)
    }

    fn dict_string(result: &Bound<'_, PyAny>, key: &str) -> Result<String> {
        let dict = Self::cast_dict(result)?;
        Ok(dict
            .get_item(key)?
            .ok_or_else(|| anyhow!("missing {key} in helper result"))?
            .extract()?)
    }

    fn dict_exception(result: &Bound<'_, PyAny>) -> Result<ExceptionInfo> {
        let dict = Self::cast_dict(result)?;
        let exception = dict
            .get_item("exception")?
            .ok_or_else(|| anyhow!("missing exception in helper result"))?;
        let exception = Self::cast_dict(&exception)?;
        let field = |key: &str| -> Result<String> {
            Ok(exception
                .get_item(key)?
                .ok_or_else(|| anyhow!("missing {key}"))?
                .extract()?)
        };

        Ok(ExceptionInfo {
            exc_type: field("exc_type")?,
            message: field("message")?,
            traceback: field("traceback")?,
        })
    }

    fn cast_dict<'a, 'py>(value: &'a Bound<'py, PyAny>) -> Result<&'a Bound<'py, PyDict>> {
        value
            .cast::<PyDict>()
            .map_err(|err| anyhow!(err.to_string()))
    }

    fn cast_list<'a, 'py>(value: &'a Bound<'py, PyAny>) -> Result<&'a Bound<'py, PyList>> {
        value
            .cast::<PyList>()
            .map_err(|err| anyhow!(err.to_string()))
    }

    fn cast_tuple<'a, 'py>(value: &'a Bound<'py, PyAny>) -> Result<&'a Bound<'py, PyTuple>> {
        value
            .cast::<PyTuple>()
            .map_err(|err| anyhow!(err.to_string()))
    }
}

impl CodeExecutor for PythonSession {
    fn run(&self, code: &str) -> Result<ExecOutcome> {
        self.exec_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::{InterruptRequest, PythonSession};
    use crate::python::CodeExecutor;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn exec_persists_state_across_calls() {
        let session = PythonSession::initialize().expect("python session");
        session.exec_code("x = 41").expect("exec set x");
        let eval = session.eval_expr("x + 1").expect("eval x");
        assert_eq!(eval.value_repr, "42");
    }

    #[test]
    fn definitions_and_imports_survive_later_fragments() {
        let session = PythonSession::initialize().expect("python session");
        session
            .run("import math\ndef area(r):\n    return math.pi * r * r")
            .expect("define function");
        let outcome = session.run("print(round(area(2), 2))").expect("call function");
        assert!(outcome.is_success());
        assert_eq!(outcome.stdout, "12.57\n");
    }

    #[test]
    fn rebinding_replaces_previous_value_only_when_asked() {
        let session = PythonSession::initialize().expect("python session");
        session.run("a = 1\nb = 'keep'").expect("seed");
        session.run("a = 2").expect("rebind");
        assert_eq!(session.eval_expr("a").expect("eval a").value_repr, "2");
        assert_eq!(session.eval_expr("b").expect("eval b").value_repr, "'keep'");
    }

    #[test]
    fn sessions_do_not_share_namespaces() {
        let first = PythonSession::initialize().expect("first session");
        let second = PythonSession::initialize().expect("second session");
        first.run("only_here = 1").expect("seed first");

        let outcome = second.run("only_here").expect("run in second");
        let raised = outcome.raised.expect("name error");
        assert_eq!(raised.exc_type, "NameError");
    }

    #[test]
    fn identical_fragment_on_fresh_sessions_yields_identical_stdout() {
        let code = "total = sum(range(10))\nprint(total, [i * i for i in range(4)])";
        let first = PythonSession::initialize()
            .expect("first session")
            .run(code)
            .expect("first run");
        let second = PythonSession::initialize()
            .expect("second session")
            .run(code)
            .expect("second run");
        assert_eq!(first.stdout, "45 [0, 1, 4, 9]\n");
        assert_eq!(first.stdout, second.stdout);
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let session = PythonSession::initialize().expect("python session");
        let result = session
            .exec_code("import sys\nprint('hello')\nprint('oops', file=sys.stderr)")
            .expect("exec with output");
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "oops\n");
        assert!(result.is_success());
    }

    #[test]
    fn output_printed_before_raise_is_kept_with_the_error() {
        let session = PythonSession::initialize().expect("python session");
        let outcome = session
            .run("print('partial')\nraise ValueError('boom')\nprint('never')")
            .expect("run");
        assert_eq!(outcome.stdout, "partial\n");
        let raised = outcome.raised.expect("raised");
        assert_eq!(raised.exc_type, "ValueError");
        assert_eq!(raised.message, "boom");
        assert!(raised.traceback.contains("Traceback"));
        assert!(raised.traceback.contains("raise ValueError('boom')"));
        assert!(!raised.traceback.contains("runtime_helpers"));
    }

    #[test]
    fn state_before_failing_statement_is_retained() {
        let session = PythonSession::initialize().expect("python session");
        let outcome = session.run("kept = 5\n1 / 0\nlost = 6").expect("run");
        assert_eq!(
            outcome.raised.expect("raised").exc_type,
            "ZeroDivisionError"
        );
        assert_eq!(session.eval_expr("kept").expect("kept").value_repr, "5");
        assert!(session.eval_expr("lost").is_err());
    }

    #[test]
    fn syntax_error_is_reported_not_fatal() {
        let session = PythonSession::initialize().expect("python session");
        let outcome = session.run("if True").expect("run");
        let raised = outcome.raised.expect("syntax error");
        assert_eq!(raised.exc_type, "SyntaxError");
        assert!(raised.traceback.contains("SyntaxError"));
        assert!(session.is_healthy());
    }

    #[test]
    fn system_exit_is_captured_as_failure() {
        let session = PythonSession::initialize().expect("python session");
        let outcome = session.run("import sys\nsys.exit(3)").expect("run");
        assert_eq!(outcome.raised.expect("raised").exc_type, "SystemExit");
        assert!(session.is_healthy());
    }

    #[test]
    fn eval_failure_returns_traceback_error() {
        let session = PythonSession::initialize().expect("python session");
        let err = session.eval_expr("missing_name").expect_err("name error");
        assert!(err.to_string().contains("NameError"));
    }

    #[test]
    fn list_globals_returns_name_and_type_excluding_dunders() {
        let session = PythonSession::initialize().expect("python session");
        session
            .exec_code("x = 10\ndef fn():\n    return x")
            .expect("seed globals");
        let globals = session.list_globals().expect("list globals");

        assert!(
            globals
                .iter()
                .any(|entry| entry.name == "x" && entry.type_name == "int")
        );
        assert!(
            globals
                .iter()
                .any(|entry| entry.name == "fn" && entry.type_name == "function")
        );
        assert!(!globals.iter().any(|entry| entry.name == "__builtins__"));
        assert!(!globals.iter().any(|entry| entry.name == "__name__"));
    }

    #[test]
    fn python_version_looks_like_dotted_triplet() {
        let session = PythonSession::initialize().expect("python session");
        let version = session.python_version().expect("version");
        assert!(version.starts_with('3'));
        assert_eq!(version.split('.').count(), 3);
    }

    #[test]
    fn installed_packages_are_name_version_pairs() {
        let session = PythonSession::initialize().expect("python session");
        let packages = session.installed_packages().expect("packages");
        assert!(packages.iter().all(|entry| entry.contains("==")));
    }

    #[test]
    fn interrupt_request_is_idle_without_running_code() {
        let session = PythonSession::initialize().expect("python session");
        let handle = session.interrupt_handle();
        assert!(!handle.is_executing());
        assert_eq!(handle.request(), InterruptRequest::Idle);
        assert!(!handle.raise_keyboard_interrupt().expect("raise"));
    }

    #[test]
    fn keyboard_interrupt_stops_a_running_loop_and_keeps_the_session() {
        let session = Arc::new(PythonSession::initialize().expect("python session"));
        let handle = session.interrupt_handle();
        let runner = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                session.run(
                    "import time\nticks = 0\nwhile True:\n    ticks += 1\n    time.sleep(0.01)",
                )
            })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.is_executing() {
            assert!(Instant::now() < deadline, "fragment never started");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(handle.request(), InterruptRequest::Raise);
        assert_eq!(handle.request(), InterruptRequest::Repeated);
        while !handle.raise_keyboard_interrupt().expect("raise") {
            assert!(Instant::now() < deadline, "user code never started");
            thread::sleep(Duration::from_millis(10));
        }

        let outcome = runner
            .join()
            .expect("runner thread")
            .expect("run returns an outcome");
        let raised = outcome.raised.expect("interrupted");
        assert_eq!(raised.exc_type, "KeyboardInterrupt");
        assert!(raised.traceback.contains("<cell-"));

        assert!(!handle.is_executing());
        assert_eq!(handle.request(), InterruptRequest::Idle);
        assert!(session.is_healthy());
        assert!(session.eval_expr("ticks").is_ok());
    }

    #[test]
    fn only_recent_cells_keep_their_source_cached() {
        let session = PythonSession::initialize().expect("python session");
        session.run("oldest_cell = 'cell_marker_oldest'").expect("first cell");
        for _ in 0..510 {
            session.run("pass").expect("filler cell");
        }
        session.run("newest_cell = 'cell_marker_newest'").expect("last cell");

        let cached = |suffix: &str| {
            let source = format!(
                "any(('cell_marker_' + '{suffix}') in ''.join(entry[2]) \
                 for entry in __import__('linecache').cache.values() if len(entry) > 2)"
            );
            session
                .eval_expr(&source)
                .expect("inspect linecache")
                .value_repr
        };
        assert_eq!(cached("oldest"), "False");
        assert_eq!(cached("newest"), "True");
    }
}
