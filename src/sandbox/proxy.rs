//! The `store` object exposed to agent code.
//!
//! Every callable attribute of the underlying data handle is wrapped so that
//! tabular results come back with numeric `YYYYMMDD` date columns, whatever
//! representation the handle used.

use std::error::Error;
use std::fmt::{Display, Formatter};

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule, PyTuple};
use serde_json::Value;

/// Columns coerced to numeric `YYYYMMDD` whenever they are present.
pub const DATE_COLUMNS: &[&str] = &[
    "trade_date",
    "cal_date",
    "pretrade_date",
    "ann_date",
    "f_ann_date",
    "end_date",
    "list_date",
    "delist_date",
    "setup_date",
    "start_date",
    "ex_date",
    "record_date",
    "pay_date",
    "div_listdate",
    "imp_ann_date",
    "base_date",
];

pub(crate) const NO_HANDLE_MESSAGE: &str =
    "store is unavailable: no data handle is configured (set [data] factory or STOCK_DATA_STORE_DIR)";

#[pyclass(name = "Store", module = "ashare_agent")]
pub(crate) struct DataHandleProxy {
    inner: Option<Py<PyAny>>,
}

impl DataHandleProxy {
    pub(crate) fn new(inner: Option<Py<PyAny>>) -> Self {
        Self { inner }
    }
}

#[pymethods]
impl DataHandleProxy {
    fn __getattr__(&self, py: Python<'_>, name: &str) -> PyResult<Py<PyAny>> {
        let inner = self
            .inner
            .as_ref()
            .ok_or_else(|| PyRuntimeError::new_err(NO_HANDLE_MESSAGE))?;
        let member = inner.bind(py).getattr(name)?;
        if name.starts_with("__") || !member.is_callable() {
            return Ok(member.unbind());
        }

        let call = NormalizedCall {
            name: name.to_string(),
            target: member.unbind(),
        };
        Ok(Py::new(py, call)?.into_any())
    }

    fn __dir__(&self, py: Python<'_>) -> PyResult<Vec<String>> {
        match &self.inner {
            Some(inner) => inner.bind(py).dir()?.extract(),
            None => Ok(Vec::new()),
        }
    }

    fn __repr__(&self, py: Python<'_>) -> PyResult<String> {
        match &self.inner {
            Some(inner) => Ok(format!("<store {}>", inner.bind(py).repr()?)),
            None => Ok("<store: not configured>".to_string()),
        }
    }
}

#[pyclass(name = "StoreMethod", module = "ashare_agent")]
struct NormalizedCall {
    name: String,
    target: Py<PyAny>,
}

#[pymethods]
impl NormalizedCall {
    #[pyo3(signature = (*args, **kwargs))]
    fn __call__<'py>(
        &self,
        py: Python<'py>,
        args: &Bound<'py, PyTuple>,
        kwargs: Option<&Bound<'py, PyDict>>,
    ) -> PyResult<Py<PyAny>> {
        let value = self.target.bind(py).call(args.clone(), kwargs)?;
        Ok(coerce_date_columns(py, value)?.unbind())
    }

    fn __repr__(&self) -> String {
        format!("<store.{}>", self.name)
    }
}

/// Returns a copy of `value` with date columns coerced, or `value` itself
/// when it is not a table or has no date columns.
pub(crate) fn coerce_date_columns<'py>(
    py: Python<'py>,
    value: Bound<'py, PyAny>,
) -> PyResult<Bound<'py, PyAny>> {
    if !(value.hasattr("columns")? && value.hasattr("dtypes")? && value.hasattr("copy")?) {
        return Ok(value);
    }

    let columns = value.getattr("columns")?;
    let mut present = Vec::new();
    for column in DATE_COLUMNS {
        if columns.contains(*column)? {
            present.push(*column);
        }
    }
    if present.is_empty() {
        return Ok(value);
    }

    let pandas = PyModule::import(py, "pandas")?;
    let is_numeric = pandas
        .getattr("api")?
        .getattr("types")?
        .getattr("is_numeric_dtype")?;
    let to_numeric = pandas.getattr("to_numeric")?;
    let coerce = PyDict::new(py);
    coerce.set_item("errors", "coerce")?;

    let frame = value.call_method0("copy")?;
    for column in present {
        let series = frame.get_item(column)?;
        if is_numeric.call1((&series,))?.is_truthy()? {
            continue;
        }
        let digits = series
            .call_method1("astype", ("str",))?
            .getattr("str")?
            .call_method1("replace", ("-", ""))?
            .getattr("str")?
            .call_method1("slice", (0, 8))?;
        let numeric = to_numeric.call((digits,), Some(&coerce))?;
        frame.set_item(column, numeric)?;
    }
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCallError {
    Unconfigured,
    Python { exc_type: String, message: String },
    Decode(String),
}

impl Display for StoreCallError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unconfigured => write!(f, "{NO_HANDLE_MESSAGE}"),
            Self::Python { exc_type, message } => write!(f, "{exc_type}: {message}"),
            Self::Decode(msg) => write!(f, "failed to decode store result: {msg}"),
        }
    }
}

impl Error for StoreCallError {}

impl StoreCallError {
    fn from_py(py: Python<'_>, err: &PyErr) -> Self {
        let exc_type = err
            .get_type(py)
            .name()
            .map(|name| name.to_string())
            .unwrap_or_else(|_| "Exception".to_string());
        let message = err
            .value(py)
            .str()
            .map(|text| text.to_string())
            .unwrap_or_default();
        Self::Python { exc_type, message }
    }
}

/// Calls `method` on the data handle with string keyword arguments and
/// returns the normalized result as JSON records. Tables are sorted by
/// `trade_date` when present and cut to their last `tail` rows.
pub(crate) fn call_store_records<'py>(
    py: Python<'py>,
    handle: &Bound<'py, PyAny>,
    method: &str,
    kwargs: &[(&str, String)],
    tail: Option<usize>,
) -> Result<Value, StoreCallError> {
    let records = store_records_json(py, handle, method, kwargs, tail)
        .map_err(|err| StoreCallError::from_py(py, &err))?;
    serde_json::from_str(&records).map_err(|err| StoreCallError::Decode(err.to_string()))
}

fn store_records_json<'py>(
    py: Python<'py>,
    handle: &Bound<'py, PyAny>,
    method: &str,
    kwargs: &[(&str, String)],
    tail: Option<usize>,
) -> PyResult<String> {
    let call_kwargs = PyDict::new(py);
    for (key, value) in kwargs {
        call_kwargs.set_item(*key, value)?;
    }
    let raw = handle.getattr(method)?.call((), Some(&call_kwargs))?;
    let mut value = coerce_date_columns(py, raw)?;

    if value.hasattr("to_dict")? && value.hasattr("columns")? {
        if value.getattr("columns")?.contains("trade_date")? {
            value = value.call_method1("sort_values", ("trade_date",))?;
        }
        if let Some(rows) = tail {
            value = value.call_method1("tail", (rows,))?;
        }
        let orient = PyDict::new(py);
        orient.set_item("orient", "records")?;
        value = value.call_method("to_dict", (), Some(&orient))?;
    }

    let dumps = PyDict::new(py);
    dumps.set_item("ensure_ascii", false)?;
    dumps.set_item("default", PyModule::import(py, "builtins")?.getattr("str")?)?;
    PyModule::import(py, "json")?
        .call_method("dumps", (value,), Some(&dumps))?
        .extract()
}

#[cfg(test)]
mod tests {
    use super::{DataHandleProxy, StoreCallError, call_store_records};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use serde_json::json;

    const FAKE_HANDLE: &std::ffi::CStr = c"
class FakeStore:
    rows = [{'ts_code': '600519.SH', 'trade_date': '2024-01-03', 'close': 10.0},
            {'ts_code': '600519.SH', 'trade_date': '2024-01-02', 'close': 9.0}]

    def daily(self, ts_code=None):
        return [row for row in self.rows if ts_code is None or row['ts_code'] == ts_code]

    label = 'fake'

handle = FakeStore()
";

    fn with_fake_handle<T>(f: impl for<'py> FnOnce(Python<'py>, &Bound<'py, PyAny>) -> T) -> T {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            py.run(FAKE_HANDLE, Some(&globals), Some(&globals))
                .expect("define fake store");
            let handle = globals
                .get_item("handle")
                .expect("lookup handle")
                .expect("handle defined");
            f(py, &handle)
        })
    }

    #[test]
    fn unconfigured_proxy_raises_descriptive_error() {
        Python::attach(|py| {
            let proxy = Py::new(py, DataHandleProxy::new(None)).expect("proxy");
            let err = proxy
                .bind(py)
                .getattr("daily")
                .expect_err("attribute access should fail");
            assert_eq!(
                err.get_type(py).name().expect("type name").to_string(),
                "RuntimeError"
            );
            assert!(err.to_string().contains("no data handle is configured"));
        });
    }

    #[test]
    fn proxy_passes_through_plain_attributes_and_wraps_methods() {
        with_fake_handle(|py, handle| {
            let proxy =
                Py::new(py, DataHandleProxy::new(Some(handle.clone().unbind()))).expect("proxy");
            let proxy = proxy.bind(py);

            let label: String = proxy
                .getattr("label")
                .expect("label")
                .extract()
                .expect("label text");
            assert_eq!(label, "fake");

            let rows = proxy
                .getattr("daily")
                .expect("daily")
                .call0()
                .expect("call daily");
            assert_eq!(rows.len().expect("len"), 2);
        });
    }

    #[test]
    fn store_records_decode_non_tabular_results() {
        let records = with_fake_handle(|py, handle| {
            call_store_records(py, handle, "daily", &[("ts_code", "600519.SH".to_string())], None)
        })
        .expect("records");

        assert_eq!(records[0]["close"], json!(10.0));
        assert_eq!(records.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn store_records_report_python_errors() {
        let err = with_fake_handle(|py, handle| {
            call_store_records(py, handle, "daily", &[("offset", "5".to_string())], None)
        })
        .expect_err("unknown keyword should fail");

        match err {
            StoreCallError::Python { exc_type, message } => {
                assert_eq!(exc_type, "TypeError");
                assert!(message.contains("offset"));
            }
            other => panic!("expected python error, got {other:?}"),
        }
    }

    fn coerce_frame(setup: &std::ffi::CStr) -> Vec<(String, Vec<f64>)> {
        Python::attach(|py| {
            crate::sandbox::test_support::ensure_tabular_module(py);
            let globals = PyDict::new(py);
            py.run(setup, Some(&globals), Some(&globals))
                .expect("setup runs");
            let frame = globals.get_item("frame").expect("lookup").expect("frame");
            let coerced = super::coerce_date_columns(py, frame).expect("coerce");
            ["trade_date", "ann_date", "close"]
                .into_iter()
                .filter(|column| {
                    coerced
                        .getattr("columns")
                        .and_then(|columns| columns.contains(*column))
                        .expect("columns")
                })
                .map(|column| {
                    let values: Vec<f64> = coerced
                        .get_item(column)
                        .and_then(|series| series.call_method0("tolist"))
                        .and_then(|list| list.extract())
                        .expect("numeric column");
                    (column.to_string(), values)
                })
                .collect()
        })
    }

    #[test]
    fn date_columns_become_numeric_on_frames() {
        let columns = coerce_frame(
            c"import pandas as pd
frame = pd.DataFrame({'trade_date': ['2024-01-02', '20240103'], 'close': [1.0, 2.0]})",
        );

        assert_eq!(
            columns,
            vec![
                ("trade_date".to_string(), vec![20240102.0, 20240103.0]),
                ("close".to_string(), vec![1.0, 2.0]),
            ]
        );
    }

    #[test]
    fn unparseable_dates_become_missing_and_source_frame_is_untouched() {
        let (coerced, original) = Python::attach(|py| {
            crate::sandbox::test_support::ensure_tabular_module(py);
            let globals = PyDict::new(py);
            py.run(
                c"import pandas as pd
frame = pd.DataFrame({'ann_date': ['2023-12-31', 'pending']})",
                Some(&globals),
                Some(&globals),
            )
            .expect("setup runs");
            let frame = globals.get_item("frame").expect("lookup").expect("frame");
            let coerced = super::coerce_date_columns(py, frame.clone()).expect("coerce");
            let read = |table: &Bound<'_, PyAny>| -> String {
                table
                    .get_item("ann_date")
                    .and_then(|series| series.call_method0("tolist"))
                    .and_then(|list| list.str())
                    .expect("column values")
                    .to_string()
            };
            (read(&coerced), read(&frame))
        });

        assert!(coerced.starts_with("[20231231"), "{coerced}");
        assert!(coerced.ends_with(", nan]"), "{coerced}");
        assert_eq!(original, "['2023-12-31', 'pending']");
    }

    #[test]
    fn values_without_date_columns_pass_through() {
        let columns = coerce_frame(
            c"import pandas as pd
frame = pd.DataFrame({'close': [3.0]})",
        );
        assert_eq!(columns, vec![("close".to_string(), vec![3.0])]);
    }
}
