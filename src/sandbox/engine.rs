use std::time::Duration;

use pyo3::exceptions::PyTimeoutError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use serde::Serialize;
use tracing::{debug, warn};

use super::capture;
use super::deadline::Watchdog;
use super::hints::enrich_error;
use super::render::render_result;

/// Names read back as the designated result, in priority order. Both are
/// removed before each run so stale values never leak into a later result.
pub const RESULT_BINDINGS: &[&str] = &["result", "_"];

const PROGRAM_FILENAME: &str = "<agent_code>";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    pub skills_used: Vec<String>,
    pub session_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_skills(mut self, skills_used: Vec<String>) -> Self {
        self.skills_used = skills_used;
        self
    }
}

/// Outcome of one execution. `error` is set exactly when `success` is false,
/// and `result` only ever accompanies a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl ExecutionOutcome {
    pub fn succeeded(output: Option<String>, result: Option<String>) -> Self {
        Self {
            success: true,
            output,
            error: None,
            result: result.filter(|text| !text.is_empty()),
        }
    }

    pub fn failed(output: Option<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            output,
            error: Some(if error.is_empty() {
                "Exception: execution failed without a message".to_string()
            } else {
                error
            }),
            result: None,
        }
    }
}

pub(crate) fn run_code(
    py: Python<'_>,
    namespace: &Bound<'_, PyDict>,
    code: &str,
    timeout: Option<Duration>,
) -> ExecutionOutcome {
    if let Err(err) = clear_result_bindings(namespace) {
        warn!(error = %err, "could not reset result bindings");
    }

    reinstall_streams(py, "before");
    let limit = timeout.filter(|limit| !limit.is_zero());
    let capture = capture::begin();
    let watchdog = limit.and_then(|limit| match Watchdog::arm(py, limit) {
        Ok(watchdog) => Some(watchdog),
        Err(err) => {
            warn!(error = %err, "could not arm execution deadline, running without one");
            None
        }
    });

    let run = exec_program(py, namespace, code);
    let timed_out = watchdog.is_some_and(|watchdog| watchdog.disarm(py));
    reinstall_streams(py, "after");
    let output = capture.finish().combined();

    match run {
        Ok(()) => ExecutionOutcome::succeeded(output, designated_result(py, namespace)),
        Err(err) => {
            let deadline = if timed_out { limit } else { None };
            ExecutionOutcome::failed(output, enrich_error(&describe_failure(py, &err, deadline)))
        }
    }
}

fn reinstall_streams(py: Python<'_>, phase: &'static str) {
    match capture::install(py) {
        Ok(true) => debug!(phase, "restored rebound standard streams"),
        Ok(false) => {}
        Err(err) => warn!(phase, error = %err, "could not reinstall output capture"),
    }
}

fn clear_result_bindings(namespace: &Bound<'_, PyDict>) -> PyResult<()> {
    for name in RESULT_BINDINGS {
        if namespace.contains(*name)? {
            namespace.del_item(*name)?;
        }
    }
    Ok(())
}

fn exec_program(py: Python<'_>, namespace: &Bound<'_, PyDict>, code: &str) -> PyResult<()> {
    let builtins = PyModule::import(py, "builtins")?;
    let program = builtins
        .getattr("compile")?
        .call1((code, PROGRAM_FILENAME, "exec"))?;
    builtins.getattr("exec")?.call1((program, namespace))?;
    Ok(())
}

fn designated_result(py: Python<'_>, namespace: &Bound<'_, PyDict>) -> Option<String> {
    RESULT_BINDINGS.iter().find_map(|name| {
        let value = namespace.get_item(*name).ok().flatten()?;
        if value.is_none() {
            return None;
        }
        let rendered = render_result(py, &value).unwrap_or_else(|err| {
            warn!(binding = *name, error = %err, "failed to render sandbox result");
            format!("<unrenderable {name}: {err}>")
        });
        Some(rendered).filter(|text| !text.is_empty())
    })
}

fn describe_failure(py: Python<'_>, err: &PyErr, deadline: Option<Duration>) -> String {
    let exc_type = err
        .get_type(py)
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "Exception".to_string());
    let message = match deadline.filter(|_| err.is_instance_of::<PyTimeoutError>(py)) {
        Some(limit) => format!("execution exceeded the {limit:?} deadline"),
        None => err
            .value(py)
            .str()
            .map(|text| text.to_string())
            .unwrap_or_default(),
    };
    let traceback = format_traceback(py, err).unwrap_or_default();

    format!("{exc_type}: {message}\n{traceback}")
}

fn format_traceback(py: Python<'_>, err: &PyErr) -> PyResult<String> {
    let lines: Vec<String> = PyModule::import(py, "traceback")?
        .getattr("format_exception")?
        .call1((err.get_type(py), err.value(py), err.traceback(py)))?
        .extract()?;
    Ok(lines.concat())
}
