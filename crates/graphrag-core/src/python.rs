//! Python bindings: `_graphrag_core`.

use std::path::PathBuf;

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyString};
use pyo3::wrap_pyfunction;
use serde::Serialize;
use serde_json::Value;

use crate::config::load_settings;
use crate::errors::GraphError;
use crate::indexer::pipeline::{index_repository as run_repository, CancellationFlag, RunMode};
use crate::models::QueryFilter;
use crate::store::reader::StoreReader;

fn json_to_py(py: Python<'_>, value: &Value) -> PyResult<PyObject> {
    Ok(match value {
        Value::Null => py.None(),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any().unbind(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into_pyobject(py)?.into_any().unbind(),
            None => PyFloat::new(py, n.as_f64().unwrap_or_default())
                .into_any()
                .unbind(),
        },
        Value::String(s) => PyString::new(py, s).into_any().unbind(),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any().unbind()
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            dict.into_any().unbind()
        }
    })
}

fn to_py<T: Serialize>(py: Python<'_>, value: &T) -> PyResult<PyObject> {
    let json = serde_json::to_value(value).map_err(GraphError::from)?;
    json_to_py(py, &json)
}

/// Run master + feature indexing and return the run report.
#[pyfunction]
#[pyo3(signature = (config_path=None, repo=None))]
fn index_repository(
    py: Python<'_>,
    config_path: Option<PathBuf>,
    repo: Option<PathBuf>,
) -> PyResult<PyObject> {
    let mut settings = load_settings(config_path.as_deref())?;
    if let Some(repo) = repo {
        settings.repo_path = repo;
    }
    let report = py.allow_threads(|| {
        run_repository(settings, RunMode::Update, &CancellationFlag::new())
    })?;
    to_py(py, &report)
}

#[pyfunction]
#[pyo3(signature = (db_path, name=None, kind=None, limit=25))]
fn query_current(
    py: Python<'_>,
    db_path: PathBuf,
    name: Option<String>,
    kind: Option<String>,
    limit: usize,
) -> PyResult<PyObject> {
    let filter = QueryFilter {
        name,
        kind,
        limit,
        include_members: true,
        ..Default::default()
    };
    let entities = py.allow_threads(|| StoreReader::new(&db_path).query_current(&filter))?;
    to_py(py, &entities)
}

#[pyfunction]
fn index_status(py: Python<'_>, db_path: PathBuf) -> PyResult<PyObject> {
    let reader = StoreReader::new(&db_path);
    let status = serde_json::json!({
        "db_path": db_path.display().to_string(),
        "state": reader.index_state()?,
        "snapshots": reader.commit_snapshots()?,
        "stats": reader.stats()?,
    });
    json_to_py(py, &status)
}

#[pymodule]
fn _graphrag_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(index_repository, m)?)?;
    m.add_function(wrap_pyfunction!(query_current, m)?)?;
    m.add_function(wrap_pyfunction!(index_status, m)?)?;
    Ok(())
}
