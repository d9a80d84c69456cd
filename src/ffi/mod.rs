//! Native boundary - entry points and owning handle wrappers
//!
//! Design: the native runtime is an external collaborator reached only
//! through [`NativeApi`]:
//! 1. Function dispatch and the C-callback protocol
//! 2. Object, array and module lifecycle (free, type index)
//! 3. DLPack export/import
//! 4. Global function registry
//!
//! Each resource kind gets one owning wrapper that releases its handle
//! exactly once.

mod dlpack;
mod handle;
mod module;
mod native;
mod ndarray;
mod object;

pub use dlpack::{Capsule, CapsuleState, DLDataType, DLDevice, DLManagedTensor, DLTensor};
pub use dlpack::{CAPSULE_NAME, CAPSULE_NAME_USED};
pub use handle::ResourceKind;
pub use module::{Module, PackedFunc};
pub use native::{NativeLibrary, SYMBOLS};
pub use ndarray::NDArray;
pub use object::{GenericObject, Object, ObjectProxy, ObjectRValueRef};

use crate::error::NativeResult;
use crate::interop::{DataType, Device, RawHandle, TypeTag, WireValue};
use core::ffi::{c_int, c_void};

/// Opaque return slot handed to a C callback
pub type RetValueHandle = *mut c_void;

/// Fixed-signature function the native side can call back into
pub type PackedCFunc = unsafe extern "C" fn(
    args: *mut WireValue,
    type_codes: *mut TypeTag,
    num_args: c_int,
    ret: RetValueHandle,
    resource_handle: *mut c_void,
) -> c_int;

/// Called once by the native side when it disposes a C-backed function
pub type CFuncFinalizer = unsafe extern "C" fn(resource_handle: *mut c_void);

/// Entry points exported by the native runtime
///
/// Mirrors the C API one to one; nonzero native status codes surface as
/// [`NativeError`](crate::error::NativeError) carrying the native-side
/// formatted message.
pub trait NativeApi: Send + Sync {
    /// Invoke a packed function; arguments are borrowed for the call
    fn func_call(
        &self,
        func: RawHandle,
        values: &mut [WireValue],
        tags: &mut [TypeTag],
    ) -> NativeResult<(WireValue, TypeTag)>;

    fn func_free(&self, func: RawHandle) -> NativeResult<()>;

    /// Wrap a C callback as a packed function handle
    fn func_create_from_cfunc(
        &self,
        func: PackedCFunc,
        resource_handle: *mut c_void,
        finalizer: CFuncFinalizer,
    ) -> NativeResult<RawHandle>;

    /// Store a callback's return value into the native return slot
    fn cfunc_set_return(
        &self,
        ret: RetValueHandle,
        values: &mut [WireValue],
        tags: &mut [TypeTag],
    ) -> NativeResult<()>;

    /// Claim a callback argument so the host may own it like a return value
    fn cb_arg_to_return(&self, value: &mut WireValue, tag: TypeTag) -> NativeResult<()>;

    fn object_free(&self, obj: RawHandle) -> NativeResult<()>;
    fn object_type_index(&self, obj: RawHandle) -> NativeResult<u32>;
    fn object_type_key_to_index(&self, type_key: &str) -> NativeResult<u32>;

    fn array_alloc(&self, shape: &[i64], dtype: DataType, device: Device) -> NativeResult<RawHandle>;
    fn array_free(&self, array: RawHandle) -> NativeResult<()>;
    fn array_copy_from_to(&self, from: RawHandle, to: RawHandle) -> NativeResult<()>;
    fn array_to_dlpack(&self, array: RawHandle) -> NativeResult<*mut DLManagedTensor>;
    fn array_from_dlpack(&self, managed: *mut DLManagedTensor) -> NativeResult<RawHandle>;
    fn array_type_index(&self, array: RawHandle) -> NativeResult<u32>;
    fn dl_managed_tensor_call_deleter(&self, managed: *mut DLManagedTensor);

    fn module_free(&self, module: RawHandle) -> NativeResult<()>;

    fn func_register_global(&self, name: &str, func: RawHandle, override_: bool) -> NativeResult<()>;
    /// Null handle when no function is registered under `name`
    fn func_get_global(&self, name: &str) -> NativeResult<RawHandle>;
    fn func_remove_global(&self, name: &str) -> NativeResult<()>;
    fn func_list_global_names(&self) -> NativeResult<Vec<String>>;

    /// Hand a callback diagnostic to the native side
    fn set_last_error(&self, message: &str);
}
