use std::ffi::c_long;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use pyo3::PyTypeInfo;
use pyo3::exceptions::PyTimeoutError;
use pyo3::ffi;
use pyo3::prelude::*;
use pyo3::types::PyModule;
use tracing::warn;

/// Raises `TimeoutError` inside the executing Python thread once the limit
/// elapses. Cancellation is cooperative: the exception surfaces at the next
/// bytecode boundary, so long-running C calls finish first.
pub(crate) struct Watchdog {
    thread_ident: c_long,
    finished: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    cancel: Sender<()>,
}

impl Watchdog {
    pub(crate) fn arm(py: Python<'_>, limit: Duration) -> PyResult<Self> {
        let ident: u64 = PyModule::import(py, "threading")?
            .getattr("get_ident")?
            .call0()?
            .extract()?;
        let thread_ident = ident as c_long;
        let finished = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let (cancel, cancelled) = mpsc::channel::<()>();

        let watch_finished = Arc::clone(&finished);
        let watch_fired = Arc::clone(&fired);
        thread::Builder::new()
            .name("sandbox-watchdog".to_string())
            .spawn(move || {
                if !matches!(cancelled.recv_timeout(limit), Err(RecvTimeoutError::Timeout)) {
                    return;
                }
                Python::attach(|py| {
                    // `finished` only flips while the executing thread is attached.
                    if watch_finished.load(Ordering::SeqCst) {
                        return;
                    }
                    let exc_type = PyTimeoutError::type_object(py);
                    let affected =
                        unsafe { ffi::PyThreadState_SetAsyncExc(thread_ident, exc_type.as_ptr()) };
                    if affected == 1 {
                        watch_fired.store(true, Ordering::SeqCst);
                    } else {
                        warn!(affected, "sandbox watchdog could not target the executing thread");
                    }
                });
            })?;

        Ok(Self {
            thread_ident,
            finished,
            fired,
            cancel,
        })
    }

    /// Stops the watchdog and reports whether it fired. Must be called by
    /// the thread that armed it, while still attached.
    pub(crate) fn disarm(self, _py: Python<'_>) -> bool {
        self.finished.store(true, Ordering::SeqCst);
        // Drop an injected exception that has not been raised yet.
        unsafe {
            ffi::PyThreadState_SetAsyncExc(self.thread_ident, std::ptr::null_mut());
        }
        let _ = self.cancel.send(());
        self.fired.load(Ordering::SeqCst)
    }
}
