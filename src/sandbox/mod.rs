//! Session-scoped Python execution.
//!
//! Each session owns one namespace that persists across executions until it
//! is cleared. Sessions are isolated from each other at the namespace level
//! only: they share one interpreter, its imported modules and the data handle.

mod capture;
mod deadline;
mod engine;
mod hints;
mod namespace;
mod proxy;
mod registry;
mod render;
#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pyo3::prelude::*;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::SandboxConfig;

pub use engine::{ExecutionOutcome, ExecutionRequest, RESULT_BINDINGS};
pub use hints::enrich_error;
pub use namespace::{
    DEFAULT_DATA_FACTORY, DataHandleSource, LIBRARY_BINDINGS, LibraryBinding, NamespaceBuilder,
    STORE_BINDING, STORE_DIR_BINDING,
};
pub use proxy::{DATE_COLUMNS, StoreCallError};
pub use registry::{DEFAULT_SESSION_ID, InMemoryNamespaceStore, NamespaceStore, SessionRegistry};
pub use render::{RESULT_MAX_ROWS, RESULT_PREVIEW_ROWS};

pub struct Sandbox {
    registry: SessionRegistry,
    timeout: Option<Duration>,
}

impl Sandbox {
    pub fn init(config: &SandboxConfig, data: DataHandleSource) -> Result<Self> {
        let registry = Python::attach(|py| -> Result<SessionRegistry> {
            capture::install(py)?;
            let builder = NamespaceBuilder::prepare(py, config, data)?;
            Ok(SessionRegistry::new(builder))
        })?;
        info!(
            strict_libraries = config.strict_libraries,
            timeout_secs = config.timeout_secs,
            "sandbox initialized"
        );

        Ok(Self {
            registry,
            timeout: config.timeout(),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn set_current_session(&self, session_id: impl Into<String>) {
        self.registry.set_current_session(session_id);
    }

    pub fn current_session_id(&self) -> String {
        self.registry.resolve_session_id(None)
    }

    /// Clears the named session, or the ambient one when `session_id` is
    /// `None`. Returns whether a namespace existed.
    pub fn clear_session(&self, session_id: Option<&str>) -> bool {
        let session_id = self.registry.resolve_session_id(session_id);
        self.registry.clear(&session_id)
    }

    /// Runs code in the request's session. Failures are reported in the
    /// outcome; bindings made before a failure stay in the namespace.
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionOutcome {
        let session_id = self
            .registry
            .resolve_session_id(request.session_id.as_deref());
        let timeout = request.timeout.or(self.timeout);
        debug!(
            session = %session_id,
            code_bytes = request.code.len(),
            skills = ?request.skills_used,
            "executing sandbox code"
        );

        let outcome = Python::attach(|py| match self.registry.get_or_create(py, &session_id) {
            Ok(namespace) => engine::run_code(py, &namespace, &request.code, timeout),
            Err(err) => ExecutionOutcome::failed(
                None,
                format!("SandboxError: failed to prepare session {session_id}: {err}"),
            ),
        });
        debug!(session = %session_id, success = outcome.success, "sandbox execution finished");
        outcome
    }

    /// Runs [`Sandbox::execute`] on the blocking pool.
    pub async fn execute_async(self: Arc<Self>, request: ExecutionRequest) -> ExecutionOutcome {
        match tokio::task::spawn_blocking(move || self.execute(&request)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                ExecutionOutcome::failed(None, format!("SandboxError: execution task failed: {err}"))
            }
        }
    }

    /// Calls a data handle method and returns its result as JSON records.
    pub fn call_store(
        &self,
        method: &str,
        kwargs: &[(&str, String)],
        tail: Option<usize>,
    ) -> std::result::Result<Value, StoreCallError> {
        Python::attach(|py| {
            let handle = self
                .registry
                .builder()
                .data_handle(py)
                .ok_or(StoreCallError::Unconfigured)?;
            proxy::call_store_records(py, &handle, method, kwargs, tail)
        })
    }

    pub fn has_data_handle(&self) -> bool {
        self.registry.builder().has_data_handle()
    }

    pub fn teardown(&self) {
        self.registry.teardown();
    }
}
