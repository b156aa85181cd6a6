use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyModule};

/// Tables longer than this are previewed instead of printed in full.
pub const RESULT_MAX_ROWS: usize = 50;
pub const RESULT_PREVIEW_ROWS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TabularKind {
    Frame,
    Series,
}

pub(crate) fn render_result(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<String> {
    if let Some(kind) = tabular_kind(py, value)? {
        return render_tabular(value, kind);
    }

    if (value.is_instance_of::<PyDict>() || value.is_instance_of::<PyList>())
        && let Ok(text) = render_structured(py, value)
    {
        return Ok(text);
    }

    value.str()?.extract()
}

fn tabular_kind(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<Option<TabularKind>> {
    // A value can only be a pandas object if pandas is already loaded.
    let modules = PyModule::import(py, "sys")?.getattr("modules")?;
    let pandas = modules.call_method1("get", ("pandas",))?;
    if pandas.is_none() {
        return Ok(None);
    }

    if value.is_instance(&pandas.getattr("DataFrame")?)? {
        return Ok(Some(TabularKind::Frame));
    }
    if value.is_instance(&pandas.getattr("Series")?)? {
        return Ok(Some(TabularKind::Series));
    }
    Ok(None)
}

/// Every table gets a size header; only tables past `RESULT_MAX_ROWS` are
/// cut to a preview with a footer counting the omitted rows.
fn render_tabular(value: &Bound<'_, PyAny>, kind: TabularKind) -> PyResult<String> {
    let total = value.len()?;
    let (header, unit) = match kind {
        TabularKind::Frame => {
            let columns = value.getattr("columns")?.len()?;
            (format!("DataFrame ({total} rows x {columns} cols)"), "rows")
        }
        TabularKind::Series => (format!("Series ({total} items)"), "items"),
    };
    if total <= RESULT_MAX_ROWS {
        let full: String = value.call_method0("to_string")?.extract()?;
        return Ok(format!("{header}:\n{full}"));
    }

    let preview: String = value
        .call_method1("head", (RESULT_PREVIEW_ROWS,))?
        .call_method0("to_string")?
        .extract()?;

    Ok(format!(
        "{header}:\n{preview}\n... ({} more {unit})",
        total - RESULT_PREVIEW_ROWS
    ))
}

fn render_structured(py: Python<'_>, value: &Bound<'_, PyAny>) -> PyResult<String> {
    let kwargs = PyDict::new(py);
    kwargs.set_item("indent", 2)?;
    kwargs.set_item("ensure_ascii", false)?;
    kwargs.set_item("default", PyModule::import(py, "builtins")?.getattr("str")?)?;

    PyModule::import(py, "json")?
        .call_method("dumps", (value,), Some(&kwargs))?
        .extract()
}

#[cfg(test)]
mod tests {
    use super::{RESULT_MAX_ROWS, RESULT_PREVIEW_ROWS, render_result};
    use crate::sandbox::test_support::ensure_tabular_module;
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use std::ffi::CString;

    fn render_expr(setup: &str, expr: &str) -> Option<String> {
        Python::attach(|py| {
            let globals = PyDict::new(py);
            let setup = CString::new(setup).expect("setup source");
            if py.run(&setup, Some(&globals), Some(&globals)).is_err() {
                return None;
            }
            let expr = CString::new(expr).expect("expr source");
            let value = py.eval(&expr, Some(&globals), Some(&globals)).ok()?;
            render_result(py, &value).ok()
        })
    }

    #[test]
    fn dicts_render_as_indented_json() {
        let text = render_expr("data = {'code': '600519.SH', 'close': 1700.5}", "data")
            .expect("render dict");
        assert_eq!(text, "{\n  \"code\": \"600519.SH\",\n  \"close\": 1700.5\n}");
    }

    #[test]
    fn non_ascii_text_is_kept_verbatim() {
        let text = render_expr("data = ['贵州茅台']", "data").expect("render list");
        assert!(text.contains("贵州茅台"));
    }

    #[test]
    fn unserializable_values_fall_back_to_str() {
        let text = render_expr("import datetime\ndata = [datetime.date(2024, 1, 2)]", "data")
            .expect("render list with date");
        assert!(text.contains("2024-01-02"));
    }

    #[test]
    fn scalars_render_with_str() {
        assert_eq!(render_expr("", "1 + 1").as_deref(), Some("2"));
        assert_eq!(render_expr("", "'plain'").as_deref(), Some("plain"));
    }

    #[test]
    fn long_frames_are_truncated_with_footer() {
        Python::attach(ensure_tabular_module);
        let text = render_expr(
            "import pandas as pd\nframe = pd.DataFrame({'a': range(120), 'b': range(120)})",
            "frame",
        )
        .expect("render frame");

        assert!(text.starts_with("DataFrame (120 rows x 2 cols):\n"), "{text}");
        assert!(text.ends_with(&format!("... ({} more rows)", 120 - RESULT_PREVIEW_ROWS)));
        assert!(!text.contains("\n119 "), "{text}");
    }

    #[test]
    fn short_series_render_in_full_with_count_header() {
        Python::attach(ensure_tabular_module);
        let text = render_expr(
            &format!("import pandas as pd\ns = pd.Series(range({RESULT_MAX_ROWS}))"),
            "s",
        )
        .expect("render series");

        assert!(text.starts_with(&format!("Series ({RESULT_MAX_ROWS} items):\n")), "{text}");
        assert!(!text.contains("more items"));
        assert!(text.contains("49"));
    }

    #[test]
    fn short_frames_get_a_header_but_no_footer() {
        Python::attach(ensure_tabular_module);
        let text = render_expr(
            "import pandas as pd\nframe = pd.DataFrame({'close': [1.5, 2.5, 3.5]})",
            "frame",
        )
        .expect("render frame");

        assert!(text.starts_with("DataFrame (3 rows x 1 cols):\n"), "{text}");
        assert!(!text.contains("more rows"));
        assert!(text.contains("3.5"));
    }
}
