//! Per-thread capture of Python's standard streams.
//!
//! `sys.stdout` and `sys.stderr` point at process-wide routers. While a
//! capture is active on the writing thread, text lands in that thread's
//! buffers; otherwise it is forwarded to the stream that was current when the
//! routers were first installed. Code may rebind `sys.stdout`, so the routers
//! are put back around every execution.

use std::cell::RefCell;
use std::sync::{Mutex, PoisonError};

use pyo3::prelude::*;
use pyo3::types::PyModule;

thread_local! {
    static ACTIVE: RefCell<Option<CapturedOutput>> = const { RefCell::new(None) };
}

static ROUTERS: Mutex<Option<Routers>> = Mutex::new(None);

struct Routers {
    stdout: Py<StreamRouter>,
    stderr: Py<StreamRouter>,
}

impl Routers {
    fn clone_ref(&self, py: Python<'_>) -> Self {
        Self {
            stdout: self.stdout.clone_ref(py),
            stderr: self.stderr.clone_ref(py),
        }
    }

    fn create(py: Python<'_>, sys: &Bound<'_, PyModule>) -> PyResult<Self> {
        let router = |name: &str, stream: Stream| -> PyResult<Py<StreamRouter>> {
            let current = sys.getattr(name)?;
            let fallback = match current.cast::<StreamRouter>() {
                Ok(existing) => existing.borrow().fallback.clone_ref(py),
                Err(_) => current.unbind(),
            };
            Py::new(py, StreamRouter { stream, fallback })
        };
        Ok(Self {
            stdout: router("stdout", Stream::Stdout)?,
            stderr: router("stderr", Stream::Stderr)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    fn push(&mut self, stream: Stream, text: &str) {
        match stream {
            Stream::Stdout => self.stdout.push_str(text),
            Stream::Stderr => self.stderr.push_str(text),
        }
    }

    /// Stdout followed by a labelled stderr section, or `None` when nothing
    /// but whitespace was written.
    pub fn combined(&self) -> Option<String> {
        let mut output = self.stdout.clone();
        if !self.stderr.is_empty() {
            output.push_str("\n[stderr]\n");
            output.push_str(&self.stderr);
        }

        let trimmed = output.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[pyclass(module = "ashare_agent")]
struct StreamRouter {
    stream: Stream,
    fallback: Py<PyAny>,
}

#[pymethods]
impl StreamRouter {
    fn write(&self, py: Python<'_>, text: &str) -> PyResult<usize> {
        let captured = ACTIVE.with(|active| match active.borrow_mut().as_mut() {
            Some(buffers) => {
                buffers.push(self.stream, text);
                true
            }
            None => false,
        });

        if !captured && !self.fallback.is_none(py) {
            self.fallback.bind(py).call_method1("write", (text,))?;
        }
        Ok(text.chars().count())
    }

    fn flush(&self, py: Python<'_>) -> PyResult<()> {
        if !self.fallback.is_none(py) {
            self.fallback.bind(py).call_method0("flush")?;
        }
        Ok(())
    }

    fn isatty(&self) -> bool {
        false
    }

    fn writable(&self) -> bool {
        true
    }

    fn __getattr__(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
        Ok(self.fallback.bind(py).getattr(name)?.unbind())
    }
}

/// Points `sys.stdout` and `sys.stderr` at the routers, creating them on
/// first use. Safe to call repeatedly. Returns whether a stream that had been
/// rebound was put back.
pub(crate) fn install(py: Python<'_>) -> PyResult<bool> {
    let sys = PyModule::import(py, "sys")?;
    let existing = ROUTERS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|routers| routers.clone_ref(py));
    let routers = match existing {
        Some(routers) => routers,
        None => {
            let created = Routers::create(py, &sys)?;
            let mut slot = ROUTERS.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert(created).clone_ref(py)
        }
    };

    let mut restored = false;
    for (name, router) in [("stdout", &routers.stdout), ("stderr", &routers.stderr)] {
        if sys.getattr(name)?.as_ptr() != router.as_ptr() {
            sys.setattr(name, router.clone_ref(py))?;
            restored = true;
        }
    }
    Ok(restored)
}

/// Starts capturing on the current thread until the guard is finished or dropped.
pub(crate) fn begin() -> CaptureGuard {
    ACTIVE.with(|active| *active.borrow_mut() = Some(CapturedOutput::default()));
    CaptureGuard { finished: false }
}

pub(crate) struct CaptureGuard {
    finished: bool,
}

impl CaptureGuard {
    pub fn finish(mut self) -> CapturedOutput {
        self.finished = true;
        ACTIVE
            .with(|active| active.borrow_mut().take())
            .unwrap_or_default()
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        if !self.finished {
            ACTIVE.with(|active| active.borrow_mut().take());
        }
    }
}
