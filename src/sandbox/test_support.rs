//! Test helpers shared by the sandbox modules.

use pyo3::prelude::*;
use pyo3::types::PyModule;

use super::{DataHandleSource, Sandbox};
use crate::config::SandboxConfig;

pub(crate) fn lenient_sandbox() -> Sandbox {
    let config = SandboxConfig {
        strict_libraries: false,
        plotting: false,
        ..SandboxConfig::default()
    };
    Sandbox::init(&config, DataHandleSource::Unconfigured).expect("sandbox init")
}

/// A small stand-in for the slice of pandas the sandbox touches: table
/// length, columns, dtypes, `head`, `to_string`, string accessors and
/// `to_numeric`.
const TABULAR_STAND_IN: &std::ffi::CStr = c"
import math
from types import SimpleNamespace


def _infer_dtype(values):
    if values and all(isinstance(v, int) and not isinstance(v, bool) for v in values):
        return 'int64'
    if values and all(isinstance(v, (int, float)) and not isinstance(v, bool) for v in values):
        return 'float64'
    return 'object'


class _StringMethods:
    def __init__(self, series):
        self._series = series

    def replace(self, old, new):
        return Series([str(v).replace(old, new) for v in self._series.tolist()], name=self._series.name)

    def slice(self, start=None, stop=None):
        return Series([str(v)[start:stop] for v in self._series.tolist()], name=self._series.name)


class Series:
    def __init__(self, values=(), name=None):
        self._values = list(values)
        self.name = name
        self.dtype = _infer_dtype(self._values)

    def __len__(self):
        return len(self._values)

    def __iter__(self):
        return iter(self._values)

    @property
    def str(self):
        return _StringMethods(self)

    def astype(self, kind):
        if kind not in ('str', str):
            raise TypeError(f'unsupported dtype {kind!r}')
        return Series([str(v) for v in self._values], name=self.name)

    def head(self, n=5):
        return Series(self._values[:n], name=self.name)

    def tolist(self):
        return list(self._values)

    def to_string(self):
        return '\\n'.join(f'{i}    {v}' for i, v in enumerate(self._values))


class DataFrame:
    def __init__(self, data=None):
        self._columns = {}
        for key, values in (data or {}).items():
            self[key] = values

    @property
    def columns(self):
        return list(self._columns)

    @property
    def dtypes(self):
        return {key: column.dtype for key, column in self._columns.items()}

    def __len__(self):
        return max((len(column) for column in self._columns.values()), default=0)

    def __getitem__(self, key):
        return self._columns[key]

    def __setitem__(self, key, values):
        self._columns[key] = Series(values, name=key)

    def copy(self):
        return DataFrame({key: column.tolist() for key, column in self._columns.items()})

    def head(self, n=5):
        return DataFrame({key: column.tolist()[:n] for key, column in self._columns.items()})

    def to_string(self):
        lines = ['    ' + '  '.join(self.columns)]
        for row in range(len(self)):
            cells = '  '.join(str(column.tolist()[row]) for column in self._columns.values())
            lines.append(f'{row}   {cells}')
        return '\\n'.join(lines)


def is_numeric_dtype(value):
    return getattr(value, 'dtype', None) in ('int64', 'float64')


def to_numeric(values, errors='raise'):
    converted = []
    for value in values:
        try:
            converted.append(int(value))
        except ValueError:
            if errors != 'coerce':
                raise
            converted.append(math.nan)
    return Series(converted)


api = SimpleNamespace(types=SimpleNamespace(is_numeric_dtype=is_numeric_dtype))
";

/// Makes `import pandas` succeed. Real pandas is used when installed;
/// otherwise the stand-in above is registered once in `sys.modules`.
pub(crate) fn ensure_tabular_module(py: Python<'_>) {
    if PyModule::import(py, "pandas").is_ok() {
        return;
    }
    let stand_in = PyModule::from_code(py, TABULAR_STAND_IN, c"pandas.py", c"pandas")
        .expect("build tabular stand-in");
    PyModule::import(py, "sys")
        .and_then(|sys| sys.getattr("modules"))
        .and_then(|modules| modules.call_method1("setdefault", ("pandas", stand_in)))
        .expect("register tabular stand-in");
}
