use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use tracing::{debug, info, warn};

use super::proxy::DataHandleProxy;
use crate::config::{DataConfig, SandboxConfig};

pub const STORE_BINDING: &str = "store";
pub const STORE_DIR_BINDING: &str = "STORE_DIR";
pub const DEFAULT_DATA_FACTORY: &str = "stock_data.store:open_store";

const MPL_SCRATCH_PREFIX: &str = "ashare-agent-mpl";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryBinding {
    pub module: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

/// Libraries bound into every fresh namespace, in binding order.
pub const LIBRARY_BINDINGS: &[LibraryBinding] = &[
    LibraryBinding {
        module: "numpy",
        aliases: &["np", "numpy"],
        required: true,
    },
    LibraryBinding {
        module: "pandas",
        aliases: &["pd", "pandas"],
        required: true,
    },
    LibraryBinding {
        module: "scipy",
        aliases: &["scipy"],
        required: false,
    },
];

/// Where the `store` binding gets its underlying handle from.
pub enum DataHandleSource {
    Unconfigured,
    /// `module.path:callable`, called with the store directory when one is set.
    Factory {
        target: String,
        store_dir: Option<String>,
        python_path: Vec<PathBuf>,
    },
    Object {
        handle: Py<PyAny>,
        store_dir: Option<String>,
    },
}

impl DataHandleSource {
    pub fn from_config(data: &DataConfig) -> Self {
        let target = match (&data.factory, &data.store_dir) {
            (Some(factory), _) => factory.clone(),
            (None, Some(_)) => DEFAULT_DATA_FACTORY.to_string(),
            (None, None) => return Self::Unconfigured,
        };
        Self::Factory {
            target,
            store_dir: data.store_dir.clone(),
            python_path: data.python_path.clone(),
        }
    }

    fn open(self, py: Python<'_>) -> Result<(Option<Py<PyAny>>, Option<String>)> {
        match self {
            Self::Unconfigured => Ok((None, None)),
            Self::Object { handle, store_dir } => Ok((Some(handle), store_dir)),
            Self::Factory {
                target,
                store_dir,
                python_path,
            } => {
                extend_sys_path(py, &python_path)?;
                let (module_name, attr) = target.split_once(':').ok_or_else(|| {
                    anyhow!(
                        "Failed to open data handle: factory '{target}' must look like module.path:callable"
                    )
                })?;
                let factory = PyModule::import(py, module_name)
                    .and_then(|module| module.getattr(attr))
                    .map_err(|err| anyhow!("Failed to open data handle via {target}: {err}"))?;
                let handle = match &store_dir {
                    Some(dir) => factory.call1((dir.as_str(),)),
                    None => factory.call0(),
                }
                .map_err(|err| anyhow!("Failed to open data handle via {target}: {err}"))?;

                info!(factory = %target, store_dir = ?store_dir, "opened data handle");
                Ok((Some(handle.unbind()), store_dir))
            }
        }
    }
}

/// Holds everything needed to stamp out a fresh session namespace. Library
/// imports and the data handle are resolved once, at sandbox init.
pub struct NamespaceBuilder {
    bindings: Vec<(String, Py<PyAny>)>,
    data_handle: Option<Py<PyAny>>,
    store_dir: Option<String>,
    unavailable: Vec<String>,
}

impl NamespaceBuilder {
    pub fn prepare(py: Python<'_>, config: &SandboxConfig, data: DataHandleSource) -> Result<Self> {
        let mut bindings = Vec::new();
        let mut unavailable = Vec::new();

        for library in LIBRARY_BINDINGS {
            match PyModule::import(py, library.module) {
                Ok(module) => {
                    for alias in library.aliases {
                        bindings.push(((*alias).to_string(), module.clone().into_any().unbind()));
                    }
                }
                Err(err) if library.required && config.strict_libraries => {
                    bail!(
                        "Failed to initialize sandbox: required library {} is unavailable: {err}",
                        library.module
                    );
                }
                Err(err) => {
                    warn!(module = library.module, error = %err, "library unavailable, leaving it out of sandbox namespaces");
                    unavailable.push(library.module.to_string());
                }
            }
        }

        if config.plotting {
            match import_plotting(py) {
                Ok(plotting) => bindings.extend(plotting),
                Err(err) => {
                    debug!(error = %err, "matplotlib unavailable, plotting disabled");
                    unavailable.push("matplotlib".to_string());
                }
            }
        }

        let (data_handle, store_dir) = data.open(py)?;
        Ok(Self {
            bindings,
            data_handle,
            store_dir,
            unavailable,
        })
    }

    /// Builds a namespace with the library bindings, `__builtins__`, a fresh
    /// `store` proxy and `STORE_DIR`.
    pub fn build<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let namespace = PyDict::new(py);
        namespace.set_item("__builtins__", PyModule::import(py, "builtins")?)?;
        for (name, value) in &self.bindings {
            namespace.set_item(name, value.bind(py))?;
        }

        let proxy = DataHandleProxy::new(self.data_handle.as_ref().map(|handle| handle.clone_ref(py)));
        namespace.set_item(STORE_BINDING, Py::new(py, proxy)?)?;
        namespace.set_item(STORE_DIR_BINDING, self.store_dir.as_deref())?;
        Ok(namespace)
    }

    pub fn data_handle<'py>(&self, py: Python<'py>) -> Option<Bound<'py, PyAny>> {
        self.data_handle.as_ref().map(|handle| handle.bind(py).clone())
    }

    pub fn has_data_handle(&self) -> bool {
        self.data_handle.is_some()
    }

    pub fn bound_names(&self) -> Vec<&str> {
        self.bindings.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Optional libraries that failed to import.
    pub fn unavailable(&self) -> &[String] {
        &self.unavailable
    }
}

fn import_plotting(py: Python<'_>) -> PyResult<Vec<(String, Py<PyAny>)>> {
    if let Err(err) = ensure_mpl_config_dir(py) {
        debug!(error = %err, "could not prepare a matplotlib config directory");
    }
    let matplotlib = PyModule::import(py, "matplotlib")?;
    matplotlib.call_method1("use", ("Agg",))?;
    let pyplot = PyModule::import(py, "matplotlib.pyplot")?;

    Ok(vec![
        ("matplotlib".to_string(), matplotlib.into_any().unbind()),
        ("plt".to_string(), pyplot.into_any().unbind()),
    ])
}

// matplotlib writes a font cache on import; point it at a writable scratch
// directory unless the user already chose one.
fn ensure_mpl_config_dir(py: Python<'_>) -> PyResult<()> {
    let environ = PyModule::import(py, "os")?.getattr("environ")?;
    if environ.contains("MPLCONFIGDIR")? {
        return Ok(());
    }

    let dir = env::temp_dir().join(format!("{MPL_SCRATCH_PREFIX}-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    environ.set_item("MPLCONFIGDIR", dir.to_string_lossy().into_owned())?;
    Ok(())
}

fn extend_sys_path(py: Python<'_>, paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }

    let sys_path = PyModule::import(py, "sys")?.getattr("path")?;
    for path in paths.iter().rev() {
        let entry = path.to_string_lossy().into_owned();
        if !sys_path.contains(entry.as_str())? {
            sys_path.call_method1("insert", (0, entry))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{DataHandleSource, NamespaceBuilder, STORE_BINDING, STORE_DIR_BINDING};
    use crate::config::{DataConfig, SandboxConfig};
    use pyo3::prelude::*;
    use std::fs;
    use std::path::PathBuf;

    fn lenient() -> SandboxConfig {
        SandboxConfig {
            strict_libraries: false,
            plotting: false,
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn source_from_config_defaults_factory_when_only_store_dir_is_set() {
        let source = DataHandleSource::from_config(&DataConfig {
            factory: None,
            store_dir: Some("/data/store".to_string()),
            python_path: vec![],
        });

        match source {
            DataHandleSource::Factory {
                target, store_dir, ..
            } => {
                assert_eq!(target, super::DEFAULT_DATA_FACTORY);
                assert_eq!(store_dir.as_deref(), Some("/data/store"));
            }
            _ => panic!("expected factory source"),
        }
    }

    #[test]
    fn source_from_empty_config_is_unconfigured() {
        let source = DataHandleSource::from_config(&DataConfig::default());
        assert!(matches!(source, DataHandleSource::Unconfigured));
    }

    #[test]
    fn built_namespace_has_builtins_store_and_store_dir() {
        Python::attach(|py| {
            let builder =
                NamespaceBuilder::prepare(py, &lenient(), DataHandleSource::Unconfigured)
                    .expect("prepare");
            let namespace = builder.build(py).expect("build");

            assert!(namespace.contains("__builtins__").expect("contains"));
            assert!(namespace.contains(STORE_BINDING).expect("contains"));
            let store_dir = namespace
                .get_item(STORE_DIR_BINDING)
                .expect("lookup")
                .expect("store dir bound");
            assert!(store_dir.is_none());
            assert!(!builder.has_data_handle());
        });
    }

    #[test]
    fn factory_source_imports_module_from_python_path() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("ashare_fake_store.py"),
            "class Handle:\n    def __init__(self, root):\n        self.root = root\n\ndef open_store(root):\n    return Handle(root)\n",
        )
        .expect("write module");

        Python::attach(|py| {
            let builder = NamespaceBuilder::prepare(
                py,
                &lenient(),
                DataHandleSource::Factory {
                    target: "ashare_fake_store:open_store".to_string(),
                    store_dir: Some("/srv/store".to_string()),
                    python_path: vec![PathBuf::from(tmp.path())],
                },
            )
            .expect("prepare with factory");

            let handle = builder.data_handle(py).expect("handle opened");
            let root: String = handle
                .getattr("root")
                .expect("root attr")
                .extract()
                .expect("root text");
            assert_eq!(root, "/srv/store");
        });
    }

    #[test]
    fn malformed_factory_target_fails_init() {
        Python::attach(|py| {
            let err = NamespaceBuilder::prepare(
                py,
                &lenient(),
                DataHandleSource::Factory {
                    target: "no_colon_here".to_string(),
                    store_dir: None,
                    python_path: vec![],
                },
            )
            .err()
            .expect("malformed target should fail");
            assert!(err.to_string().contains("module.path:callable"));
        });
    }
}
