//! Native runtime loaded from a shared library
//!
//! Every entry point is resolved once at load time; a missing symbol
//! fails the load instead of the first call that needs it.

use super::dlpack::DLManagedTensor;
use super::{CFuncFinalizer, NativeApi, PackedCFunc, RetValueHandle};
use crate::config::FfiConfig;
use crate::error::{FfiError, NativeError, NativeResult, Result};
use crate::interop::library::Library;
use crate::interop::{DataType, Device, RawHandle, TypeTag, WireValue};
use crate::libinfo;
use crate::logging::{debug, info, warn};
use core::ffi::{c_char, c_int, c_uint, c_void};
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

type FuncCallFn = unsafe extern "C" fn(
    RawHandle,
    *mut WireValue,
    *mut TypeTag,
    c_int,
    *mut WireValue,
    *mut TypeTag,
) -> c_int;
type FreeFn = unsafe extern "C" fn(RawHandle) -> c_int;
type CreateFromCFuncFn =
    unsafe extern "C" fn(PackedCFunc, *mut c_void, Option<CFuncFinalizer>, *mut RawHandle) -> c_int;
type SetReturnFn =
    unsafe extern "C" fn(RetValueHandle, *mut WireValue, *mut TypeTag, c_int) -> c_int;
type CbArgToReturnFn = unsafe extern "C" fn(*mut WireValue, *mut TypeTag) -> c_int;
type TypeIndexFn = unsafe extern "C" fn(RawHandle, *mut c_uint) -> c_int;
type KeyToIndexFn = unsafe extern "C" fn(*const c_char, *mut c_uint) -> c_int;
type ArrayAllocFn = unsafe extern "C" fn(
    *const i64,
    c_int,
    c_int,
    c_int,
    c_int,
    c_int,
    c_int,
    *mut RawHandle,
) -> c_int;
type CopyFromToFn = unsafe extern "C" fn(RawHandle, RawHandle, *mut c_void) -> c_int;
type ToDLPackFn = unsafe extern "C" fn(RawHandle, *mut *mut DLManagedTensor) -> c_int;
type FromDLPackFn = unsafe extern "C" fn(*mut DLManagedTensor, *mut RawHandle) -> c_int;
type CallDeleterFn = unsafe extern "C" fn(*mut DLManagedTensor);
type RegisterGlobalFn = unsafe extern "C" fn(*const c_char, RawHandle, c_int) -> c_int;
type GetGlobalFn = unsafe extern "C" fn(*const c_char, *mut RawHandle) -> c_int;
type RemoveGlobalFn = unsafe extern "C" fn(*const c_char) -> c_int;
type ListNamesFn = unsafe extern "C" fn(*mut c_int, *mut *const *const c_char) -> c_int;
type SetLastErrorFn = unsafe extern "C" fn(*const c_char);
type GetLastErrorFn = unsafe extern "C" fn() -> *const c_char;

/// Entry points required from the runtime library
pub const SYMBOLS: &[&str] = &[
    "OSTARFuncCall",
    "OSTARFuncFree",
    "OSTARFuncCreateFromCFunc",
    "OSTARCFuncSetReturn",
    "OSTARCbArgToReturn",
    "OSTARObjectFree",
    "OSTARObjectGetTypeIndex",
    "OSTARObjectTypeKey2Index",
    "OSTARArrayAlloc",
    "OSTARArrayFree",
    "OSTARArrayCopyFromTo",
    "OSTARArrayToDLPack",
    "OSTARArrayFromDLPack",
    "OSTARArrayGetTypeIndex",
    "OSTARDLManagedTensorCallDeleter",
    "OSTARModFree",
    "OSTARFuncRegisterGlobal",
    "OSTARFuncGetGlobal",
    "OSTARFuncRemoveGlobal",
    "OSTARFuncListGlobalNames",
    "OSTARAPISetLastError",
    "OSTARGetLastError",
];

struct Symbols {
    func_call: FuncCallFn,
    func_free: FreeFn,
    func_create_from_cfunc: CreateFromCFuncFn,
    cfunc_set_return: SetReturnFn,
    cb_arg_to_return: CbArgToReturnFn,
    object_free: FreeFn,
    object_type_index: TypeIndexFn,
    object_type_key_to_index: KeyToIndexFn,
    array_alloc: ArrayAllocFn,
    array_free: FreeFn,
    array_copy_from_to: CopyFromToFn,
    array_to_dlpack: ToDLPackFn,
    array_from_dlpack: FromDLPackFn,
    array_type_index: TypeIndexFn,
    dl_managed_tensor_call_deleter: CallDeleterFn,
    module_free: FreeFn,
    func_register_global: RegisterGlobalFn,
    func_get_global: GetGlobalFn,
    func_remove_global: RemoveGlobalFn,
    func_list_global_names: ListNamesFn,
    set_last_error: SetLastErrorFn,
    get_last_error: GetLastErrorFn,
}

macro_rules! resolve {
    ($lib:expr, $name:literal) => {
        // Signature is fixed by the runtime's C API for this symbol.
        unsafe { std::mem::transmute::<*const (), _>($lib.symbol($name)?) }
    };
}

impl Symbols {
    fn resolve(lib: &Library) -> Result<Self> {
        Ok(Self {
            func_call: resolve!(lib, "OSTARFuncCall"),
            func_free: resolve!(lib, "OSTARFuncFree"),
            func_create_from_cfunc: resolve!(lib, "OSTARFuncCreateFromCFunc"),
            cfunc_set_return: resolve!(lib, "OSTARCFuncSetReturn"),
            cb_arg_to_return: resolve!(lib, "OSTARCbArgToReturn"),
            object_free: resolve!(lib, "OSTARObjectFree"),
            object_type_index: resolve!(lib, "OSTARObjectGetTypeIndex"),
            object_type_key_to_index: resolve!(lib, "OSTARObjectTypeKey2Index"),
            array_alloc: resolve!(lib, "OSTARArrayAlloc"),
            array_free: resolve!(lib, "OSTARArrayFree"),
            array_copy_from_to: resolve!(lib, "OSTARArrayCopyFromTo"),
            array_to_dlpack: resolve!(lib, "OSTARArrayToDLPack"),
            array_from_dlpack: resolve!(lib, "OSTARArrayFromDLPack"),
            array_type_index: resolve!(lib, "OSTARArrayGetTypeIndex"),
            dl_managed_tensor_call_deleter: resolve!(lib, "OSTARDLManagedTensorCallDeleter"),
            module_free: resolve!(lib, "OSTARModFree"),
            func_register_global: resolve!(lib, "OSTARFuncRegisterGlobal"),
            func_get_global: resolve!(lib, "OSTARFuncGetGlobal"),
            func_remove_global: resolve!(lib, "OSTARFuncRemoveGlobal"),
            func_list_global_names: resolve!(lib, "OSTARFuncListGlobalNames"),
            set_last_error: resolve!(lib, "OSTARAPISetLastError"),
            get_last_error: resolve!(lib, "OSTARGetLastError"),
        })
    }
}

/// [`NativeApi`] backed by the runtime shared library
pub struct NativeLibrary {
    symbols: Symbols,
    path: PathBuf,
    // Dropped last so no symbol outlives the mapping.
    _library: Library,
}

impl NativeLibrary {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let library = Library::load(path)?;
        let symbols = Symbols::resolve(&library)?;
        info!(path = %path.display(), "native runtime loaded");
        Ok(Self {
            symbols,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    /// Search the configured locations and load the first usable candidate
    pub fn load_from_config(config: &FfiConfig) -> Result<Self> {
        let candidates = libinfo::find_lib_path(config, false)?;
        let mut last_err = None;
        for candidate in candidates {
            match Self::load(&candidate) {
                Ok(lib) => return Ok(lib),
                Err(err) => {
                    warn!(path = %candidate.display(), error = %err, "skipping library candidate");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FfiError::library("no library candidates found")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn last_error(&self) -> String {
        unsafe {
            let msg = (self.symbols.get_last_error)();
            if msg.is_null() {
                "unknown native error".to_string()
            } else {
                CStr::from_ptr(msg).to_string_lossy().into_owned()
            }
        }
    }

    #[inline]
    fn check_call(&self, status: c_int) -> NativeResult<()> {
        if status == 0 {
            Ok(())
        } else {
            let message = self.last_error();
            debug!(status, message = %message, "native call failed");
            Err(NativeError::new(message))
        }
    }
}

fn c_string(s: &str) -> NativeResult<CString> {
    CString::new(s).map_err(|_| NativeError::new(format!("string contains NUL byte: {:?}", s)))
}

fn c_len(len: usize) -> NativeResult<c_int> {
    c_int::try_from(len).map_err(|_| NativeError::new(format!("too many arguments: {}", len)))
}

impl NativeApi for NativeLibrary {
    fn func_call(
        &self,
        func: RawHandle,
        values: &mut [WireValue],
        tags: &mut [TypeTag],
    ) -> NativeResult<(WireValue, TypeTag)> {
        debug_assert_eq!(values.len(), tags.len());
        let mut ret = WireValue::null();
        let mut ret_tag = TypeTag::NULL;
        let status = unsafe {
            (self.symbols.func_call)(
                func,
                values.as_mut_ptr(),
                tags.as_mut_ptr(),
                c_len(values.len())?,
                &mut ret,
                &mut ret_tag,
            )
        };
        self.check_call(status)?;
        Ok((ret, ret_tag))
    }

    fn func_free(&self, func: RawHandle) -> NativeResult<()> {
        self.check_call(unsafe { (self.symbols.func_free)(func) })
    }

    fn func_create_from_cfunc(
        &self,
        func: PackedCFunc,
        resource_handle: *mut c_void,
        finalizer: CFuncFinalizer,
    ) -> NativeResult<RawHandle> {
        let mut out = core::ptr::null_mut();
        let status = unsafe {
            (self.symbols.func_create_from_cfunc)(func, resource_handle, Some(finalizer), &mut out)
        };
        self.check_call(status)?;
        Ok(out)
    }

    fn cfunc_set_return(
        &self,
        ret: RetValueHandle,
        values: &mut [WireValue],
        tags: &mut [TypeTag],
    ) -> NativeResult<()> {
        let status = unsafe {
            (self.symbols.cfunc_set_return)(
                ret,
                values.as_mut_ptr(),
                tags.as_mut_ptr(),
                c_len(values.len())?,
            )
        };
        self.check_call(status)
    }

    fn cb_arg_to_return(&self, value: &mut WireValue, tag: TypeTag) -> NativeResult<()> {
        let mut tag = tag;
        self.check_call(unsafe { (self.symbols.cb_arg_to_return)(value, &mut tag) })
    }

    fn object_free(&self, obj: RawHandle) -> NativeResult<()> {
        self.check_call(unsafe { (self.symbols.object_free)(obj) })
    }

    fn object_type_index(&self, obj: RawHandle) -> NativeResult<u32> {
        let mut index: c_uint = 0;
        self.check_call(unsafe { (self.symbols.object_type_index)(obj, &mut index) })?;
        Ok(index)
    }

    fn object_type_key_to_index(&self, type_key: &str) -> NativeResult<u32> {
        let key = c_string(type_key)?;
        let mut index: c_uint = 0;
        self.check_call(unsafe { (self.symbols.object_type_key_to_index)(key.as_ptr(), &mut index) })?;
        Ok(index)
    }

    fn array_alloc(&self, shape: &[i64], dtype: DataType, device: Device) -> NativeResult<RawHandle> {
        let mut out = core::ptr::null_mut();
        let status = unsafe {
            (self.symbols.array_alloc)(
                shape.as_ptr(),
                c_len(shape.len())?,
                c_int::from(dtype.code),
                c_int::from(dtype.bits),
                c_int::from(dtype.lanes),
                device.device_type,
                device.device_id,
                &mut out,
            )
        };
        self.check_call(status)?;
        Ok(out)
    }

    fn array_free(&self, array: RawHandle) -> NativeResult<()> {
        self.check_call(unsafe { (self.symbols.array_free)(array) })
    }

    fn array_copy_from_to(&self, from: RawHandle, to: RawHandle) -> NativeResult<()> {
        let status =
            unsafe { (self.symbols.array_copy_from_to)(from, to, core::ptr::null_mut()) };
        self.check_call(status)
    }

    fn array_to_dlpack(&self, array: RawHandle) -> NativeResult<*mut DLManagedTensor> {
        let mut out = core::ptr::null_mut();
        self.check_call(unsafe { (self.symbols.array_to_dlpack)(array, &mut out) })?;
        Ok(out)
    }

    fn array_from_dlpack(&self, managed: *mut DLManagedTensor) -> NativeResult<RawHandle> {
        let mut out = core::ptr::null_mut();
        self.check_call(unsafe { (self.symbols.array_from_dlpack)(managed, &mut out) })?;
        Ok(out)
    }

    fn array_type_index(&self, array: RawHandle) -> NativeResult<u32> {
        let mut index: c_uint = 0;
        self.check_call(unsafe { (self.symbols.array_type_index)(array, &mut index) })?;
        Ok(index)
    }

    fn dl_managed_tensor_call_deleter(&self, managed: *mut DLManagedTensor) {
        unsafe { (self.symbols.dl_managed_tensor_call_deleter)(managed) }
    }

    fn module_free(&self, module: RawHandle) -> NativeResult<()> {
        self.check_call(unsafe { (self.symbols.module_free)(module) })
    }

    fn func_register_global(&self, name: &str, func: RawHandle, override_: bool) -> NativeResult<()> {
        let name = c_string(name)?;
        let status = unsafe {
            (self.symbols.func_register_global)(name.as_ptr(), func, c_int::from(override_))
        };
        self.check_call(status)
    }

    fn func_get_global(&self, name: &str) -> NativeResult<RawHandle> {
        let name = c_string(name)?;
        let mut out = core::ptr::null_mut();
        self.check_call(unsafe { (self.symbols.func_get_global)(name.as_ptr(), &mut out) })?;
        Ok(out)
    }

    fn func_remove_global(&self, name: &str) -> NativeResult<()> {
        let name = c_string(name)?;
        self.check_call(unsafe { (self.symbols.func_remove_global)(name.as_ptr()) })
    }

    fn func_list_global_names(&self) -> NativeResult<Vec<String>> {
        let mut size: c_int = 0;
        let mut names: *const *const c_char = core::ptr::null();
        self.check_call(unsafe { (self.symbols.func_list_global_names)(&mut size, &mut names) })?;
        if names.is_null() {
            return Ok(Vec::new());
        }
        // The runtime keeps the name table alive in thread-local storage.
        let entries = unsafe { std::slice::from_raw_parts(names, size.max(0) as usize) };
        Ok(entries
            .iter()
            .map(|&name| unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
            .collect())
    }

    fn set_last_error(&self, message: &str) {
        // Interior NULs would truncate the diagnostic; replace them.
        let message = CString::new(message.replace('\0', "\\0")).unwrap_or_default();
        unsafe { (self.symbols.set_last_error)(message.as_ptr()) }
    }
}

impl std::fmt::Debug for NativeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeLibrary").field("path", &self.path).finish()
    }
}
