//! Wire model for packed calls
//!
//! Defines the C-compatible tagged union, the parallel type tags and the
//! closed host-side value union the marshaler consumes.

use super::scalar::{DataType, Device};
use crate::error::HostError;
use crate::ffi::{Module, NDArray, ObjectProxy, ObjectRValueRef, PackedFunc};
use core::ffi::{c_char, c_void};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque native handle, never dereferenced by this layer
pub type RawHandle = *mut c_void;

/// Type tag travelling alongside every wire value
///
/// Tags below [`TypeTag::EXT_BEGIN`] are reserved by this layer; higher
/// tags are assigned to registered extension types.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct TypeTag(pub i32);

impl TypeTag {
    pub const INT: Self = Self(0);
    pub const UINT: Self = Self(1);
    pub const FLOAT: Self = Self(2);
    pub const HANDLE: Self = Self(3);
    pub const NULL: Self = Self(4);
    pub const DATA_TYPE: Self = Self(5);
    pub const DEVICE: Self = Self(6);
    pub const DLTENSOR_HANDLE: Self = Self(7);
    pub const OBJECT_HANDLE: Self = Self(8);
    pub const MODULE_HANDLE: Self = Self(9);
    pub const PACKED_FUNC_HANDLE: Self = Self(10);
    pub const STR: Self = Self(11);
    pub const BYTES: Self = Self(12);
    pub const NDARRAY_HANDLE: Self = Self(13);
    pub const OBJECT_RVALUE_REF_ARG: Self = Self(14);
    pub const EXT_BEGIN: Self = Self(15);

    #[inline]
    pub const fn code(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_extension(self) -> bool {
        self.0 >= Self::EXT_BEGIN.0
    }

    /// Whether the wire value carries a handle in `v_handle`
    #[inline]
    pub const fn is_handle(self) -> bool {
        matches!(self.0, 3 | 7 | 8 | 9 | 10 | 13 | 14) || self.is_extension()
    }

    /// Short name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "int",
            1 => "uint",
            2 => "float",
            3 => "handle",
            4 => "null",
            5 => "dtype",
            6 => "device",
            7 => "dltensor",
            8 => "object",
            9 => "module",
            10 => "packed_func",
            11 => "str",
            12 => "bytes",
            13 => "ndarray",
            14 => "object_rvalue_ref",
            _ => "extension",
        }
    }
}

impl fmt::Debug for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({}:{})", self.0, self.name())
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Wire value (untagged union); the tag travels in a parallel array
#[repr(C)]
#[derive(Clone, Copy)]
pub union WireValue {
    pub v_int64: i64,
    pub v_float64: f64,
    pub v_handle: *mut c_void,
    pub v_str: *const c_char,
}

impl WireValue {
    #[inline]
    pub const fn null() -> Self {
        Self { v_handle: core::ptr::null_mut() }
    }

    #[inline]
    pub const fn from_int(v: i64) -> Self {
        Self { v_int64: v }
    }

    #[inline]
    pub const fn from_float(v: f64) -> Self {
        Self { v_float64: v }
    }

    #[inline]
    pub const fn from_handle(handle: RawHandle) -> Self {
        Self { v_handle: handle }
    }

    #[inline]
    pub const fn from_str_ptr(ptr: *const c_char) -> Self {
        Self { v_str: ptr }
    }
}

impl Default for WireValue {
    #[inline]
    fn default() -> Self {
        Self::from_int(0)
    }
}

impl fmt::Debug for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // All fields are 8 bytes wide, so the integer view is always initialized.
        write!(f, "WireValue({:#x})", unsafe { self.v_int64 })
    }
}

/// Length + pointer record for BYTES arguments
#[repr(C)]
#[derive(Debug)]
pub struct ByteArray {
    pub data: *const u8,
    pub size: usize,
}

/// Opaque handle passed through verbatim (HANDLE tag)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OpaqueHandle(pub RawHandle);

// Never dereferenced on this side.
unsafe impl Send for OpaqueHandle {}
unsafe impl Sync for OpaqueHandle {}

impl OpaqueHandle {
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Host closure signature accepted by the bridge
pub type HostFn = dyn Fn(Vec<HostValue>) -> Result<HostValue, HostError> + Send + Sync;

/// Host closure that can be exposed to the native side
#[derive(Clone)]
pub struct Callable {
    func: Arc<HostFn>,
}

impl Callable {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Vec<HostValue>) -> Result<HostValue, HostError> + Send + Sync + 'static,
    {
        Self { func: Arc::new(func) }
    }

    pub fn invoke(&self, args: Vec<HostValue>) -> Result<HostValue, HostError> {
        (self.func)(args)
    }

    pub(crate) fn shared(&self) -> Arc<HostFn> {
        Arc::clone(&self.func)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callable({:p})", Arc::as_ptr(&self.func) as *const ())
    }
}

/// Instance of a registered third-party value kind
pub trait Extension: Any + Send + Sync + fmt::Debug {
    /// Tag assigned when the extension type was declared
    fn type_tag(&self) -> TypeTag;

    /// Handle passed to the native side for this instance
    fn handle(&self) -> RawHandle;

    fn as_any(&self) -> &dyn Any;
}

/// Every host value that can cross the boundary
#[derive(Debug)]
pub enum HostValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    DataType(DataType),
    Device(Device),
    Handle(OpaqueHandle),
    Object(Box<dyn ObjectProxy>),
    NDArray(NDArray),
    Module(Module),
    PackedFunc(PackedFunc),
    Extension(Box<dyn Extension>),
    RValueRef(ObjectRValueRef),
    List(Vec<HostValue>),
    Tuple(Vec<HostValue>),
    Map(Vec<(HostValue, HostValue)>),
    Callable(Callable),
}

impl HostValue {
    /// Host-facing type name, used in marshaling errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "None",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::DataType(_) => "DataType",
            Self::Device(_) => "Device",
            Self::Handle(_) => "c_void_p",
            Self::Object(_) => "Object",
            Self::NDArray(_) => "NDArray",
            Self::Module(_) => "Module",
            Self::PackedFunc(_) => "PackedFunc",
            Self::Extension(_) => "Extension",
            Self::RValueRef(_) => "ObjectRValueRef",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Map(_) => "dict",
            Self::Callable(_) => "function",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to float
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&dyn ObjectProxy> {
        match self {
            Self::Object(obj) => Some(obj.as_ref()),
            _ => None,
        }
    }

    pub fn into_packed_func(self) -> Option<PackedFunc> {
        match self {
            Self::PackedFunc(f) => Some(f),
            _ => None,
        }
    }

    pub fn into_ndarray(self) -> Option<NDArray> {
        match self {
            Self::NDArray(arr) => Some(arr),
            _ => None,
        }
    }
}

impl From<i64> for HostValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DataType> for HostValue {
    fn from(v: DataType) -> Self {
        Self::DataType(v)
    }
}

impl From<Device> for HostValue {
    fn from(v: Device) -> Self {
        Self::Device(v)
    }
}

impl From<NDArray> for HostValue {
    fn from(v: NDArray) -> Self {
        Self::NDArray(v)
    }
}

impl From<Module> for HostValue {
    fn from(v: Module) -> Self {
        Self::Module(v)
    }
}

impl From<PackedFunc> for HostValue {
    fn from(v: PackedFunc) -> Self {
        Self::PackedFunc(v)
    }
}

impl From<Callable> for HostValue {
    fn from(v: Callable) -> Self {
        Self::Callable(v)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}
