//! Python embedding - builds [`HostValue`]s from interpreter objects
//!
//! Exposed as the `_ffi` extension module when built with the `python`
//! feature.

use crate::context::Context;
use crate::error::{ErrorCategory, FfiError};
use crate::ffi::{Module, NDArray, NativeLibrary, Object, ObjectProxy, PackedFunc};
use crate::interop::{convert_to_packed_func, Callable, HostValue};
use crate::FfiConfig;
use pyo3::exceptions::{PyRuntimeError, PySystemError, PyTypeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyByteArray, PyBytes, PyDict, PyFloat, PyList, PyLong, PyString, PyTuple};
use std::any::Any;
use std::sync::Arc;

impl From<FfiError> for PyErr {
    fn from(err: FfiError) -> Self {
        let msg = err.to_string();
        match err.category() {
            ErrorCategory::Type => PyTypeError::new_err(msg),
            ErrorCategory::Value => PyValueError::new_err(msg),
            ErrorCategory::Runtime => PyRuntimeError::new_err(msg),
            ErrorCategory::Fatal => PySystemError::new_err(msg),
        }
    }
}

/// Handle to a loaded runtime and its registries
#[pyclass(name = "Runtime")]
struct PyRuntime {
    ctx: Arc<Context>,
}

#[pyclass(name = "PackedFunc")]
struct PyPackedFunc {
    ctx: Arc<Context>,
    func: PackedFunc,
}

#[pyclass(name = "Object")]
struct PyObjectRef {
    inner: Box<dyn ObjectProxy>,
}

#[pyclass(name = "NDArray")]
struct PyNDArray {
    array: NDArray,
}

#[pyclass(name = "Module")]
struct PyModuleRef {
    module: Module,
}

#[pymethods]
impl PyRuntime {
    /// Load from `path`, or from discovered configuration when omitted
    #[new]
    #[pyo3(signature = (path=None))]
    fn new(path: Option<String>) -> PyResult<Self> {
        let config = FfiConfig::discover();
        crate::logging::init_with_config(config.logging.to_log_config());
        let library = match path {
            Some(path) => NativeLibrary::load(path)?,
            None => NativeLibrary::load_from_config(&config)?,
        };
        Ok(Self {
            ctx: Context::builder(Arc::new(library)).config(config).build(),
        })
    }

    #[pyo3(signature = (name, allow_missing=false))]
    fn get_global_func(&self, name: &str, allow_missing: bool) -> PyResult<Option<PyPackedFunc>> {
        Ok(self.ctx.get_global_func(name, allow_missing)?.map(|func| PyPackedFunc {
            ctx: Arc::clone(&self.ctx),
            func,
        }))
    }

    fn list_global_func_names(&self) -> PyResult<Vec<String>> {
        Ok(self.ctx.list_global_func_names()?)
    }

    #[pyo3(signature = (name, func, override_=false))]
    fn register_func(&self, name: &str, func: &PyAny, override_: bool) -> PyResult<()> {
        let value = to_host(&self.ctx, func)?;
        Ok(self.ctx.register_func(name, value, override_)?)
    }

    fn remove_global_func(&self, name: &str) -> PyResult<()> {
        Ok(self.ctx.remove_global_func(name)?)
    }
}

#[pymethods]
impl PyPackedFunc {
    #[pyo3(signature = (*args))]
    fn __call__(&self, py: Python<'_>, args: &PyTuple) -> PyResult<PyObject> {
        let args = args
            .iter()
            .map(|a| to_host(&self.ctx, a))
            .collect::<PyResult<Vec<_>>>()?;
        let ctx = Arc::clone(&self.ctx);
        let result = py.allow_threads(|| self.func.call(&ctx, &args))?;
        to_py(py, &self.ctx, result)
    }

    fn is_global(&self) -> bool {
        self.func.is_global()
    }
}

#[pymethods]
impl PyObjectRef {
    fn same_as(&self, other: &PyObjectRef) -> bool {
        self.inner.same_as(other.inner.as_ref())
    }

    fn type_index(&self) -> PyResult<u32> {
        Ok(self.inner.object().type_index()?)
    }
}

#[pymethods]
impl PyNDArray {
    #[getter]
    fn shape(&self) -> Vec<i64> {
        self.array.shape()
    }

    #[getter]
    fn dtype(&self) -> Option<String> {
        self.array.dtype().map(|d| d.to_string())
    }

    #[getter]
    fn device(&self) -> Option<String> {
        self.array.device().map(|d| d.to_string())
    }
}

#[pymethods]
impl PyModuleRef {
    fn same_as(&self, other: &PyModuleRef) -> bool {
        self.module.same_as(&other.module)
    }
}

/// Borrowed view of a Python-held object, passed by handle without a transfer
#[derive(Debug)]
struct BorrowedObject {
    object: Object,
}

impl ObjectProxy for BorrowedObject {
    fn object(&self) -> &Object {
        &self.object
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Build the closed host value for a Python object
///
/// Wrappers produced by this module are passed as non-owning aliases; the
/// argument tuple keeps the owning wrapper alive for the whole call.
fn to_host(ctx: &Arc<Context>, obj: &PyAny) -> PyResult<HostValue> {
    if obj.is_none() {
        return Ok(HostValue::Null);
    }
    if let Ok(func) = obj.extract::<PyRef<'_, PyPackedFunc>>() {
        return Ok(HostValue::PackedFunc(unsafe { func.func.alias() }));
    }
    if let Ok(obj_ref) = obj.extract::<PyRef<'_, PyObjectRef>>() {
        let object = unsafe { obj_ref.inner.object().alias() };
        return Ok(HostValue::Object(Box::new(BorrowedObject { object })));
    }
    if let Ok(array) = obj.extract::<PyRef<'_, PyNDArray>>() {
        return Ok(HostValue::NDArray(unsafe { array.array.alias() }));
    }
    if let Ok(module) = obj.extract::<PyRef<'_, PyModuleRef>>() {
        return Ok(HostValue::Module(unsafe { module.module.alias() }));
    }
    if obj.is_instance_of::<PyBool>() {
        return Ok(HostValue::Int(i64::from(obj.extract::<bool>()?)));
    }
    if obj.is_instance_of::<PyLong>() {
        return Ok(HostValue::Int(obj.extract()?));
    }
    if obj.is_instance_of::<PyFloat>() {
        return Ok(HostValue::Float(obj.extract()?));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Ok(HostValue::Str(s.to_str()?.to_string()));
    }
    if let Ok(b) = obj.downcast::<PyBytes>() {
        return Ok(HostValue::Bytes(b.as_bytes().to_vec()));
    }
    if let Ok(b) = obj.downcast::<PyByteArray>() {
        return Ok(HostValue::Bytes(b.to_vec()));
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return Ok(HostValue::List(list.iter().map(|v| to_host(ctx, v)).collect::<PyResult<_>>()?));
    }
    if let Ok(tuple) = obj.downcast::<PyTuple>() {
        return Ok(HostValue::Tuple(tuple.iter().map(|v| to_host(ctx, v)).collect::<PyResult<_>>()?));
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let entries = dict
            .iter()
            .map(|(k, v)| Ok((to_host(ctx, k)?, to_host(ctx, v)?)))
            .collect::<PyResult<_>>()?;
        return Ok(HostValue::Map(entries));
    }
    if obj.is_callable() {
        return Ok(HostValue::Callable(python_callable(Arc::clone(ctx), obj.into())));
    }
    let type_name = obj.get_type().name().unwrap_or("<unknown>").to_string();
    Err(FfiError::unsupported(type_name).into())
}

/// Bridge a Python callable; errors carry the formatted Python traceback
fn python_callable(ctx: Arc<Context>, func: PyObject) -> Callable {
    Callable::new(move |args| {
        Python::with_gil(|py| {
            let args = args
                .into_iter()
                .map(|a| to_py(py, &ctx, a))
                .collect::<PyResult<Vec<_>>>()
                .map_err(|e| describe_py_error(py, &e))?;
            let result = func
                .call1(py, PyTuple::new(py, args))
                .map_err(|e| describe_py_error(py, &e))?;
            to_host(&ctx, result.as_ref(py)).map_err(|e| describe_py_error(py, &e).into())
        })
    })
}

fn describe_py_error(py: Python<'_>, err: &PyErr) -> String {
    match err.traceback(py).map(|tb| tb.format()) {
        Some(Ok(traceback)) => format!("{}{}", traceback, err),
        _ => err.to_string(),
    }
}

fn to_py(py: Python<'_>, ctx: &Arc<Context>, value: HostValue) -> PyResult<PyObject> {
    Ok(match value {
        HostValue::Null => py.None(),
        HostValue::Int(v) => v.into_py(py),
        HostValue::Float(v) => v.into_py(py),
        HostValue::Str(s) => s.into_py(py),
        HostValue::Bytes(b) => PyBytes::new(py, &b).into_py(py),
        HostValue::DataType(d) => d.to_string().into_py(py),
        HostValue::Device(d) => (d.device_type, d.device_id).into_py(py),
        HostValue::Handle(h) => (h.0 as usize).into_py(py),
        HostValue::Object(inner) => Py::new(py, PyObjectRef { inner })?.into_py(py),
        HostValue::NDArray(array) => Py::new(py, PyNDArray { array })?.into_py(py),
        HostValue::Module(module) => Py::new(py, PyModuleRef { module })?.into_py(py),
        HostValue::PackedFunc(func) => Py::new(py, PyPackedFunc { ctx: Arc::clone(ctx), func })?.into_py(py),
        HostValue::Callable(callable) => {
            let func = convert_to_packed_func(ctx, &callable)?;
            Py::new(py, PyPackedFunc { ctx: Arc::clone(ctx), func })?.into_py(py)
        }
        HostValue::List(items) => {
            let items = items.into_iter().map(|v| to_py(py, ctx, v)).collect::<PyResult<Vec<_>>>()?;
            PyList::new(py, items).into_py(py)
        }
        HostValue::Tuple(items) => {
            let items = items.into_iter().map(|v| to_py(py, ctx, v)).collect::<PyResult<Vec<_>>>()?;
            PyTuple::new(py, items).into_py(py)
        }
        HostValue::Map(entries) => {
            let dict = PyDict::new(py);
            for (k, v) in entries {
                dict.set_item(to_py(py, ctx, k)?, to_py(py, ctx, v)?)?;
            }
            dict.into_py(py)
        }
        HostValue::Extension(ext) => (ext.handle() as usize).into_py(py),
        HostValue::RValueRef(_) => return Err(FfiError::unsupported("ObjectRValueRef").into()),
    })
}

#[pymodule]
fn _ffi(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyRuntime>()?;
    m.add_class::<PyPackedFunc>()?;
    m.add_class::<PyObjectRef>()?;
    m.add_class::<PyNDArray>()?;
    m.add_class::<PyModuleRef>()?;
    Ok(())
}
