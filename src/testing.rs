//! In-process stand-in for the native runtime, instrumented for tests
//!
//! Handles are reference counted like the real runtime. C functions are
//! invoked through the same trampoline protocol, so bridged closures are
//! exercised end to end.

use crate::context::Context;
use crate::error::{NativeError, NativeResult};
use crate::ffi::{CFuncFinalizer, DLManagedTensor, DLTensor, NativeApi, PackedCFunc, RetValueHandle};
use crate::interop::{DataType, Device, RawHandle, TypeTag, WireValue};
use core::ffi::{c_int, c_void};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) const ARRAY_INDEX: u32 = 3;
pub(crate) const MAP_INDEX: u32 = 4;
pub(crate) const NODE_INDEX: u32 = 100;
pub(crate) const LEAF_INDEX: u32 = 101;
pub(crate) const NDARRAY_INDEX: u32 = 7;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
    static RET_STRS: RefCell<Vec<CString>> = const { RefCell::new(Vec::new()) };
}

/// Calls into each native entry point worth asserting on
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub object_frees: AtomicUsize,
    pub array_frees: AtomicUsize,
    pub module_frees: AtomicUsize,
    pub func_frees: AtomicUsize,
    pub finalizers: AtomicUsize,
    pub deleter_calls: AtomicUsize,
    pub claims: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Item {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Handle(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    None,
    Int(i64),
    Items(Vec<Item>),
}

type Builtin =
    Arc<dyn Fn(&FakeRuntime, &mut [WireValue], &mut [TypeTag]) -> Result<(WireValue, TypeTag), String> + Send + Sync>;

enum EntryKind {
    Object { type_index: u32, payload: Payload },
    Module,
    Builtin(Builtin),
    CFunc { func: PackedCFunc, resource: usize, finalizer: CFuncFinalizer },
    Array {
        _tensor: Box<DLTensor>,
        _shape: Box<[i64]>,
        _data: Vec<u8>,
        /// Managed tensor this array was imported from
        source: Option<usize>,
    },
}

struct Entry {
    refs: usize,
    kind: EntryKind,
}

#[derive(Default)]
struct State {
    next_id: usize,
    entries: HashMap<usize, Entry>,
    globals: HashMap<String, usize>,
}

/// Return slot handed to C callbacks
struct RetSlot {
    value: WireValue,
    tag: TypeTag,
}

pub(crate) struct FakeRuntime {
    state: Mutex<State>,
    pub counters: Counters,
}

// Raw pointers inside the state are only touched under the lock.
unsafe impl Send for FakeRuntime {}
unsafe impl Sync for FakeRuntime {}

enum Target {
    Builtin(Builtin),
    C(PackedCFunc, usize),
}

fn int_arg(values: &[WireValue], tags: &[TypeTag], i: usize) -> Result<i64, String> {
    match tags.get(i) {
        Some(&TypeTag::INT) => Ok(unsafe { values[i].v_int64 }),
        other => Err(format!("argument {} expects int, got {:?}", i, other)),
    }
}

fn str_arg(values: &[WireValue], tags: &[TypeTag], i: usize) -> Result<String, String> {
    match tags.get(i) {
        Some(&TypeTag::STR) => Ok(unsafe { CStr::from_ptr(values[i].v_str) }.to_string_lossy().into_owned()),
        other => Err(format!("argument {} expects str, got {:?}", i, other)),
    }
}

/// String return value, valid for the rest of the test thread
pub(crate) fn ret_str(s: &str) -> (WireValue, TypeTag) {
    let cstr = CString::new(s).unwrap_or_default();
    let ptr = cstr.as_ptr();
    RET_STRS.with(|strs| strs.borrow_mut().push(cstr));
    (WireValue::from_str_ptr(ptr), TypeTag::STR)
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        let rt = Arc::new(Self {
            state: Mutex::new(State {
                next_id: 0x100,
                ..State::default()
            }),
            counters: Counters::default(),
        });
        rt.install_builtins();
        rt
    }

    /// Fake runtime plus a context with no registered classes
    pub fn context() -> (Arc<Self>, Arc<Context>) {
        let rt = Self::new();
        let api: Arc<dyn NativeApi> = rt.clone();
        (rt, Context::new(api))
    }

    fn insert(&self, kind: EntryKind) -> RawHandle {
        let mut st = self.state.lock();
        st.next_id += 0x10;
        let id = st.next_id;
        st.entries.insert(id, Entry { refs: 1, kind });
        id as RawHandle
    }

    pub fn new_object(&self, type_index: u32, payload: Payload) -> RawHandle {
        self.insert(EntryKind::Object { type_index, payload })
    }

    pub fn new_module(&self) -> RawHandle {
        self.insert(EntryKind::Module)
    }

    pub fn register_builtin<F>(&self, name: &str, f: F)
    where
        F: Fn(&FakeRuntime, &mut [WireValue], &mut [TypeTag]) -> Result<(WireValue, TypeTag), String>
            + Send
            + Sync
            + 'static,
    {
        let handle = self.insert(EntryKind::Builtin(Arc::new(f)));
        self.state.lock().globals.insert(name.to_string(), handle as usize);
    }

    pub fn refs(&self, handle: RawHandle) -> Option<usize> {
        self.state.lock().entries.get(&(handle as usize)).map(|e| e.refs)
    }

    /// Message the native side would re-raise on this thread
    pub fn native_last_error() -> String {
        LAST_ERROR.with(|slot| slot.borrow().clone())
    }

    pub fn is_live(&self, handle: RawHandle) -> bool {
        self.refs(handle).is_some()
    }

    pub fn payload(&self, handle: RawHandle) -> Option<Payload> {
        match &self.state.lock().entries.get(&(handle as usize))?.kind {
            EntryKind::Object { payload, .. } => Some(payload.clone()),
            _ => None,
        }
    }

    fn incref(&self, handle: RawHandle) -> NativeResult<()> {
        match self.state.lock().entries.get_mut(&(handle as usize)) {
            Some(entry) => {
                entry.refs += 1;
                Ok(())
            }
            None => Err(self.fail(format!("invalid handle {:p}", handle))),
        }
    }

    fn decref(&self, handle: RawHandle) -> NativeResult<()> {
        let removed = {
            let mut st = self.state.lock();
            let key = handle as usize;
            let Some(entry) = st.entries.get_mut(&key) else {
                return Err(self.fail(format!("double free of handle {:p}", handle)));
            };
            entry.refs -= 1;
            if entry.refs == 0 {
                st.entries.remove(&key)
            } else {
                None
            }
        };
        // Finalizers may re-enter the runtime; the lock is already released.
        if let Some(entry) = removed {
            match entry.kind {
                EntryKind::CFunc { resource, finalizer, .. } => {
                    self.counters.finalizers.fetch_add(1, Ordering::SeqCst);
                    unsafe { finalizer(resource as *mut c_void) }
                }
                EntryKind::Array { source: Some(managed), .. } => {
                    self.dl_managed_tensor_call_deleter(managed as *mut DLManagedTensor)
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn fail(&self, message: String) -> NativeError {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = message.clone());
        NativeError::new(message)
    }

    fn item(&self, value: WireValue, tag: TypeTag) -> Item {
        unsafe {
            match tag {
                TypeTag::NULL => Item::Null,
                TypeTag::INT => Item::Int(value.v_int64),
                TypeTag::FLOAT => Item::Float(value.v_float64),
                TypeTag::STR => Item::Str(CStr::from_ptr(value.v_str).to_string_lossy().into_owned()),
                _ => Item::Handle(value.v_handle as usize),
            }
        }
    }

    fn install_builtins(&self) {
        self.register_builtin("runtime.Array", |rt, values, tags| {
            let items = values.iter().zip(tags.iter()).map(|(v, t)| rt.item(*v, *t)).collect();
            let h = rt.new_object(ARRAY_INDEX, Payload::Items(items));
            Ok((WireValue::from_handle(h), TypeTag::OBJECT_HANDLE))
        });
        self.register_builtin("runtime.Map", |rt, values, tags| {
            if values.len() % 2 != 0 {
                return Err("runtime.Map expects key/value pairs".to_string());
            }
            let items = values.iter().zip(tags.iter()).map(|(v, t)| rt.item(*v, *t)).collect();
            let h = rt.new_object(MAP_INDEX, Payload::Items(items));
            Ok((WireValue::from_handle(h), TypeTag::OBJECT_HANDLE))
        });
        self.register_builtin("testing.add", |_, values, tags| {
            let a = int_arg(values, tags, 0)?;
            let b = int_arg(values, tags, 1)?;
            Ok((WireValue::from_int(a + b), TypeTag::INT))
        });
        self.register_builtin("testing.echo", |rt, values, tags| {
            let (Some(&value), Some(&tag)) = (values.first(), tags.first()) else {
                return Ok((WireValue::null(), TypeTag::NULL));
            };
            match tag {
                TypeTag::OBJECT_HANDLE | TypeTag::MODULE_HANDLE | TypeTag::PACKED_FUNC_HANDLE | TypeTag::NDARRAY_HANDLE => {
                    rt.incref(unsafe { value.v_handle }).map_err(|e| e.message)?
                }
                TypeTag::STR => return Ok(ret_str(&str_arg(values, tags, 0)?)),
                _ => {}
            }
            Ok((value, tag))
        });
        self.register_builtin("testing.tag_of", |_, _, tags| {
            Ok((WireValue::from_int(tags.first().map_or(-1, |t| i64::from(t.code()))), TypeTag::INT))
        });
        self.register_builtin("testing.call", |rt, values, tags| {
            if tags.first() != Some(&TypeTag::PACKED_FUNC_HANDLE) {
                return Err("testing.call expects a function first".to_string());
            }
            let func = unsafe { values[0].v_handle };
            rt.func_call(func, &mut values[1..], &mut tags[1..]).map_err(|e| e.message)
        });
        self.register_builtin("testing.new_node", |rt, values, tags| {
            let h = rt.new_object(NODE_INDEX, Payload::Int(int_arg(values, tags, 0)?));
            Ok((WireValue::from_handle(h), TypeTag::OBJECT_HANDLE))
        });
        self.register_builtin("testing.new_leaf", |rt, _, _| {
            let h = rt.new_object(LEAF_INDEX, Payload::None);
            Ok((WireValue::from_handle(h), TypeTag::OBJECT_HANDLE))
        });
        self.register_builtin("testing.node_value", |rt, values, tags| {
            if tags.first() != Some(&TypeTag::OBJECT_HANDLE) {
                return Err("testing.node_value expects an object".to_string());
            }
            match rt.payload(unsafe { values[0].v_handle }) {
                Some(Payload::Int(v)) => Ok((WireValue::from_int(v), TypeTag::INT)),
                other => Err(format!("not a node: {:?}", other)),
            }
        });
        self.register_builtin("testing.steal", |rt, values, tags| {
            if tags.first() != Some(&TypeTag::OBJECT_RVALUE_REF_ARG) {
                return Err("testing.steal expects a move-only reference".to_string());
            }
            let slot = unsafe { values[0].v_handle } as *mut RawHandle;
            let handle = unsafe { std::mem::replace(&mut *slot, core::ptr::null_mut()) };
            rt.decref(handle).map_err(|e| e.message)?;
            Ok((WireValue::null(), TypeTag::NULL))
        });
        self.register_builtin("testing.new_module", |rt, _, _| {
            Ok((WireValue::from_handle(rt.new_module()), TypeTag::MODULE_HANDLE))
        });
        self.register_builtin("testing.new_array", |rt, _, _| {
            let h = rt
                .array_alloc(&[2, 3], DataType::float(32), Device::cpu(0))
                .map_err(|e| e.message)?;
            Ok((WireValue::from_handle(h), TypeTag::NDARRAY_HANDLE))
        });
        self.register_builtin("testing.fail", |_, _, _| Err("boom from native".to_string()));
        self.register_builtin("testing.bad_tag", |_, _, _| Ok((WireValue::null(), TypeTag(1))));
        self.register_builtin("runtime._datatype_get_type_code", |_, values, tags| {
            match str_arg(values, tags, 0)?.as_str() {
                "posit" => Ok((WireValue::from_int(131), TypeTag::INT)),
                other => Err(format!("unknown custom type {}", other)),
            }
        });
        self.register_builtin("runtime._datatype_get_type_name", |_, values, tags| {
            match int_arg(values, tags, 0)? {
                131 => Ok(ret_str("posit")),
                other => Err(format!("unknown custom type code {}", other)),
            }
        });
        self.register_builtin("runtime.GetDeviceAttr", |_, values, tags| {
            let kind = int_arg(values, tags, 0)?;
            let attr = int_arg(values, tags, 2)?;
            Ok(match attr {
                0 => (WireValue::from_int(i64::from(kind == 1)), TypeTag::INT),
                1 => (WireValue::from_int(1024), TypeTag::INT),
                4 => ret_str("8.6"),
                5 => ret_str("FakeCPU"),
                8 => ret_str("[1024, 1024, 64]"),
                _ => (WireValue::null(), TypeTag::NULL),
            })
        });
    }
}

impl NativeApi for FakeRuntime {
    fn func_call(
        &self,
        func: RawHandle,
        values: &mut [WireValue],
        tags: &mut [TypeTag],
    ) -> NativeResult<(WireValue, TypeTag)> {
        let target = match self.state.lock().entries.get(&(func as usize)).map(|e| &e.kind) {
            Some(EntryKind::Builtin(f)) => Some(Target::Builtin(Arc::clone(f))),
            Some(EntryKind::CFunc { func, resource, .. }) => Some(Target::C(*func, *resource)),
            _ => None,
        };
        // The lock is released here; builtins and callbacks may re-enter.
        let Some(target) = target else {
            return Err(self.fail(format!("invalid function handle {:p}", func)));
        };

        match target {
            Target::Builtin(f) => f(self, values, tags).map_err(|m| self.fail(m)),
            Target::C(cfunc, resource) => {
                let mut slot = RetSlot {
                    value: WireValue::null(),
                    tag: TypeTag::NULL,
                };
                let status = unsafe {
                    cfunc(
                        values.as_mut_ptr(),
                        tags.as_mut_ptr(),
                        values.len() as c_int,
                        &mut slot as *mut RetSlot as RetValueHandle,
                        resource as *mut c_void,
                    )
                };
                if status != 0 {
                    let message = LAST_ERROR.with(|slot| slot.borrow().clone());
                    return Err(NativeError::new(message));
                }
                Ok((slot.value, slot.tag))
            }
        }
    }

    fn func_free(&self, func: RawHandle) -> NativeResult<()> {
        self.counters.func_frees.fetch_add(1, Ordering::SeqCst);
        self.decref(func)
    }

    fn func_create_from_cfunc(
        &self,
        func: PackedCFunc,
        resource_handle: *mut c_void,
        finalizer: CFuncFinalizer,
    ) -> NativeResult<RawHandle> {
        Ok(self.insert(EntryKind::CFunc {
            func,
            resource: resource_handle as usize,
            finalizer,
        }))
    }

    fn cfunc_set_return(&self, ret: RetValueHandle, values: &mut [WireValue], tags: &mut [TypeTag]) -> NativeResult<()> {
        let (Some(&value), Some(&tag)) = (values.first(), tags.first()) else {
            return Err(self.fail("empty return".to_string()));
        };
        let (value, tag) = match tag {
            TypeTag::OBJECT_HANDLE | TypeTag::MODULE_HANDLE | TypeTag::PACKED_FUNC_HANDLE | TypeTag::NDARRAY_HANDLE => {
                self.incref(unsafe { value.v_handle })?;
                (value, tag)
            }
            TypeTag::STR => ret_str(&unsafe { CStr::from_ptr(value.v_str) }.to_string_lossy()),
            _ => (value, tag),
        };
        let slot = unsafe { &mut *(ret as *mut RetSlot) };
        slot.value = value;
        slot.tag = tag;
        Ok(())
    }

    fn cb_arg_to_return(&self, value: &mut WireValue, tag: TypeTag) -> NativeResult<()> {
        self.counters.claims.fetch_add(1, Ordering::SeqCst);
        match tag {
            TypeTag::OBJECT_RVALUE_REF_ARG => unsafe {
                let slot = value.v_handle as *mut RawHandle;
                value.v_handle = std::mem::replace(&mut *slot, core::ptr::null_mut());
                Ok(())
            },
            t if t.is_handle() && t != TypeTag::HANDLE && t != TypeTag::DLTENSOR_HANDLE => {
                self.incref(unsafe { value.v_handle })
            }
            _ => Ok(()),
        }
    }

    fn object_free(&self, obj: RawHandle) -> NativeResult<()> {
        self.counters.object_frees.fetch_add(1, Ordering::SeqCst);
        self.decref(obj)
    }

    fn object_type_index(&self, obj: RawHandle) -> NativeResult<u32> {
        match self.state.lock().entries.get(&(obj as usize)).map(|e| &e.kind) {
            Some(EntryKind::Object { type_index, .. }) => Ok(*type_index),
            _ => Err(NativeError::new(format!("not an object {:p}", obj))),
        }
    }

    fn object_type_key_to_index(&self, type_key: &str) -> NativeResult<u32> {
        match type_key {
            "runtime.Array" => Ok(ARRAY_INDEX),
            "runtime.Map" => Ok(MAP_INDEX),
            "testing.Node" => Ok(NODE_INDEX),
            "testing.Leaf" => Ok(LEAF_INDEX),
            other => Err(self.fail(format!("Cannot find type {}", other))),
        }
    }

    fn array_alloc(&self, shape: &[i64], dtype: DataType, device: Device) -> NativeResult<RawHandle> {
        let elems: i64 = shape.iter().product();
        let elem_bytes = (usize::from(dtype.bits) * usize::from(dtype.lanes) + 7) / 8;
        let mut data = vec![0u8; elems.max(0) as usize * elem_bytes];
        let mut shape: Box<[i64]> = shape.into();
        let tensor = Box::new(DLTensor {
            data: data.as_mut_ptr().cast(),
            device,
            ndim: shape.len() as i32,
            dtype,
            shape: shape.as_mut_ptr(),
            strides: core::ptr::null_mut(),
            byte_offset: 0,
        });
        // Array handles are header addresses; keep a side id out of the way.
        let handle = &*tensor as *const DLTensor as usize;
        self.state.lock().entries.insert(
            handle,
            Entry {
                refs: 1,
                kind: EntryKind::Array {
                    _tensor: tensor,
                    _shape: shape,
                    _data: data,
                    source: None,
                },
            },
        );
        Ok(handle as RawHandle)
    }

    fn array_free(&self, array: RawHandle) -> NativeResult<()> {
        self.counters.array_frees.fetch_add(1, Ordering::SeqCst);
        self.decref(array)
    }

    fn array_copy_from_to(&self, from: RawHandle, to: RawHandle) -> NativeResult<()> {
        unsafe {
            let src = &*(from as *const DLTensor);
            let dst = &*(to as *const DLTensor);
            let shape = |t: &DLTensor| std::slice::from_raw_parts(t.shape, t.ndim as usize).to_vec();
            if shape(src) != shape(dst) || src.dtype != dst.dtype {
                return Err(self.fail("array copy shape mismatch".to_string()));
            }
            let n: i64 = shape(src).iter().product();
            let bytes = n as usize * ((usize::from(src.dtype.bits) * usize::from(src.dtype.lanes) + 7) / 8);
            core::ptr::copy(src.data as *const u8, dst.data as *mut u8, bytes);
        }
        Ok(())
    }

    fn array_to_dlpack(&self, array: RawHandle) -> NativeResult<*mut DLManagedTensor> {
        self.incref(array)?;
        let header = unsafe { &*(array as *const DLTensor) };
        let managed = Box::new(DLManagedTensor {
            dl_tensor: DLTensor {
                data: header.data,
                device: header.device,
                ndim: header.ndim,
                dtype: header.dtype,
                shape: header.shape,
                strides: header.strides,
                byte_offset: header.byte_offset,
            },
            manager_ctx: array,
            deleter: None,
        });
        Ok(Box::into_raw(managed))
    }

    fn array_from_dlpack(&self, managed: *mut DLManagedTensor) -> NativeResult<RawHandle> {
        let t = unsafe { &(*managed).dl_tensor };
        let mut shape: Box<[i64]> = unsafe { std::slice::from_raw_parts(t.shape, t.ndim as usize) }.into();
        let tensor = Box::new(DLTensor {
            data: t.data,
            device: t.device,
            ndim: t.ndim,
            dtype: t.dtype,
            shape: shape.as_mut_ptr(),
            strides: t.strides,
            byte_offset: t.byte_offset,
        });
        let handle = &*tensor as *const DLTensor as usize;
        self.state.lock().entries.insert(
            handle,
            Entry {
                refs: 1,
                kind: EntryKind::Array {
                    _tensor: tensor,
                    _shape: shape,
                    _data: Vec::new(),
                    source: Some(managed as usize),
                },
            },
        );
        Ok(handle as RawHandle)
    }

    fn array_type_index(&self, _array: RawHandle) -> NativeResult<u32> {
        Ok(NDARRAY_INDEX)
    }

    fn dl_managed_tensor_call_deleter(&self, managed: *mut DLManagedTensor) {
        self.counters.deleter_calls.fetch_add(1, Ordering::SeqCst);
        let managed = unsafe { Box::from_raw(managed) };
        if !managed.manager_ctx.is_null() {
            let _ = self.decref(managed.manager_ctx);
        }
    }

    fn module_free(&self, module: RawHandle) -> NativeResult<()> {
        self.counters.module_frees.fetch_add(1, Ordering::SeqCst);
        self.decref(module)
    }

    fn func_register_global(&self, name: &str, func: RawHandle, override_: bool) -> NativeResult<()> {
        if !override_ && self.state.lock().globals.contains_key(name) {
            return Err(self.fail(format!("Global function {} is already registered", name)));
        }
        self.incref(func)?;
        let previous = self.state.lock().globals.insert(name.to_string(), func as usize);
        if let Some(previous) = previous {
            self.decref(previous as RawHandle)?;
        }
        Ok(())
    }

    fn func_get_global(&self, name: &str) -> NativeResult<RawHandle> {
        let found = self.state.lock().globals.get(name).copied();
        match found {
            Some(handle) => {
                self.incref(handle as RawHandle)?;
                Ok(handle as RawHandle)
            }
            None => Ok(core::ptr::null_mut()),
        }
    }

    fn func_remove_global(&self, name: &str) -> NativeResult<()> {
        let removed = self.state.lock().globals.remove(name);
        match removed {
            Some(handle) => self.decref(handle as RawHandle),
            None => Err(self.fail(format!("Global function {} is not registered", name))),
        }
    }

    fn func_list_global_names(&self) -> NativeResult<Vec<String>> {
        let mut names: Vec<String> = self.state.lock().globals.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn set_last_error(&self, message: &str) {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = message.to_string());
    }
}
