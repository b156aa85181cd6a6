use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use pyo3::prelude::*;
use pyo3::types::PyDict;
use tracing::{debug, info};

use super::namespace::NamespaceBuilder;

/// Session used when neither the caller nor the ambient context names one.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Storage for per-session namespaces. The sandbox only needs these few
/// operations, so a persistent or evicting store can be swapped in.
pub trait NamespaceStore: Send + Sync {
    fn get(&self, py: Python<'_>, session_id: &str) -> Option<Py<PyDict>>;
    /// Stores `namespace` unless the session already has one and returns
    /// whichever namespace ends up registered.
    fn insert_if_absent(&self, py: Python<'_>, session_id: &str, namespace: Py<PyDict>)
    -> Py<PyDict>;
    fn remove(&self, session_id: &str) -> Option<Py<PyDict>>;
    fn session_ids(&self) -> Vec<String>;
    fn drain(&self) -> Vec<Py<PyDict>>;
}

#[derive(Default)]
pub struct InMemoryNamespaceStore {
    sessions: Mutex<HashMap<String, Py<PyDict>>>,
}

impl NamespaceStore for InMemoryNamespaceStore {
    fn get(&self, py: Python<'_>, session_id: &str) -> Option<Py<PyDict>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).map(|namespace| namespace.clone_ref(py))
    }

    fn insert_if_absent(
        &self,
        py: Python<'_>,
        session_id: &str,
        namespace: Py<PyDict>,
    ) -> Py<PyDict> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .entry(session_id.to_string())
            .or_insert(namespace)
            .clone_ref(py)
    }

    fn remove(&self, session_id: &str) -> Option<Py<PyDict>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    fn session_ids(&self) -> Vec<String> {
        let mut ids = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    fn drain(&self) -> Vec<Py<PyDict>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, namespace)| namespace)
            .collect()
    }
}

pub struct SessionRegistry {
    builder: NamespaceBuilder,
    store: Box<dyn NamespaceStore>,
    current: RwLock<Option<String>>,
}

impl SessionRegistry {
    pub fn new(builder: NamespaceBuilder) -> Self {
        Self::with_store(builder, Box::<InMemoryNamespaceStore>::default())
    }

    pub fn with_store(builder: NamespaceBuilder, store: Box<dyn NamespaceStore>) -> Self {
        Self {
            builder,
            store,
            current: RwLock::new(None),
        }
    }

    pub fn builder(&self) -> &NamespaceBuilder {
        &self.builder
    }

    /// Returns the session's namespace, creating it on first use. Concurrent
    /// first calls for one id all end up with the same namespace.
    pub fn get_or_create<'py>(
        &self,
        py: Python<'py>,
        session_id: &str,
    ) -> PyResult<Bound<'py, PyDict>> {
        if let Some(namespace) = self.store.get(py, session_id) {
            return Ok(namespace.into_bound(py));
        }

        let fresh = self.builder.build(py)?.unbind();
        let namespace = self.store.insert_if_absent(py, session_id, fresh);
        debug!(session = %session_id, "created sandbox namespace");
        Ok(namespace.into_bound(py))
    }

    /// Drops the session's namespace. Returns whether one existed.
    pub fn clear(&self, session_id: &str) -> bool {
        let Some(namespace) = self.store.remove(session_id) else {
            return false;
        };
        Python::attach(|_py| drop(namespace));
        info!(session = %session_id, "cleared sandbox session");
        true
    }

    pub fn set_current_session(&self, session_id: impl Into<String>) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(session_id.into());
    }

    pub fn reset_current_session(&self) {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = None;
    }

    /// Explicit id, then the ambient current session, then `"default"`.
    pub fn resolve_session_id(&self, explicit: Option<&str>) -> String {
        if let Some(id) = explicit.map(str::trim).filter(|id| !id.is_empty()) {
            return id.to_string();
        }

        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.store.session_ids()
    }

    pub fn len(&self) -> usize {
        self.store.session_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn teardown(&self) {
        let drained = self.store.drain();
        let count = drained.len();
        Python::attach(|_py| drop(drained));
        self.reset_current_session();
        debug!(sessions = count, "sandbox registry torn down");
    }
}
