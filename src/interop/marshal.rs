//! Argument marshaling - host values into packed wire arguments
//!
//! Design: a total match over the closed [`HostValue`] union. Anything a
//! wire slot points into (C strings, byte records, converted containers,
//! bridged closures) is parked in the keep-alive list, which lives exactly
//! as long as the [`PackedArgs`] it belongs to.

use super::bridge::convert_to_packed_func;
use super::call::construct_object;
use super::stats;
use super::types::{ByteArray, HostValue, TypeTag, WireValue};
use crate::context::Context;
use crate::error::{ErrorKind, FfiError, Result};
use crate::ffi::{Object, PackedFunc};
use smallvec::SmallVec;
use std::ffi::CString;
use std::marker::PhantomData;

/// Owner of memory referenced by a wire slot
#[derive(Debug)]
enum KeepAlive {
    Str(CString),
    Bytes(Box<ByteArray>),
    Object(Object),
    Func(PackedFunc),
}

/// Packed argument arrays plus everything they borrow
///
/// The wire slots may point into the original arguments (`'a`) and into
/// the keep-alive list; neither may be dropped before the call returns.
#[derive(Debug)]
pub struct PackedArgs<'a> {
    values: SmallVec<[WireValue; 8]>,
    tags: SmallVec<[TypeTag; 8]>,
    keep_alive: Vec<KeepAlive>,
    _args: PhantomData<&'a HostValue>,
}

impl<'a> PackedArgs<'a> {
    fn with_capacity(n: usize) -> Self {
        Self {
            values: SmallVec::with_capacity(n),
            tags: SmallVec::with_capacity(n),
            keep_alive: Vec::new(),
            _args: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn values(&self) -> &[WireValue] {
        &self.values
    }

    pub fn tags(&self) -> &[TypeTag] {
        &self.tags
    }

    /// Number of auxiliary owners held for the call
    pub fn keep_alive_len(&self) -> usize {
        self.keep_alive.len()
    }

    pub(crate) fn parts_mut(&mut self) -> (&mut [WireValue], &mut [TypeTag]) {
        (&mut self.values, &mut self.tags)
    }

    #[inline]
    fn push(&mut self, value: WireValue, tag: TypeTag) {
        self.values.push(value);
        self.tags.push(tag);
    }

    fn push_str(&mut self, s: &str) -> Result<()> {
        let cstr = CString::new(s).map_err(|_| FfiError::unsupported("str with interior NUL byte"))?;
        // The heap buffer does not move when the CString is moved into the list.
        self.push(WireValue::from_str_ptr(cstr.as_ptr()), TypeTag::STR);
        self.keep_alive.push(KeepAlive::Str(cstr));
        Ok(())
    }

    fn push_object(&mut self, object: Object) {
        self.push(WireValue::from_handle(object.handle()), TypeTag::OBJECT_HANDLE);
        self.keep_alive.push(KeepAlive::Object(object));
    }
}

/// Marshal `args` for one packed call
pub fn marshal<'a>(ctx: &Context, args: &'a [HostValue]) -> Result<PackedArgs<'a>> {
    pack(ctx, args.iter())
}

pub(crate) fn pack<'a, I>(ctx: &Context, args: I) -> Result<PackedArgs<'a>>
where
    I: IntoIterator<Item = &'a HostValue>,
    I::IntoIter: ExactSizeIterator,
{
    let args = args.into_iter();
    let mut packed = PackedArgs::with_capacity(args.len());
    for arg in args {
        if let Err(err) = pack_one(ctx, arg, &mut packed) {
            stats::record_marshaling_error();
            return Err(err);
        }
    }
    Ok(packed)
}

fn pack_one<'a>(ctx: &Context, arg: &'a HostValue, out: &mut PackedArgs<'a>) -> Result<()> {
    match arg {
        HostValue::Object(proxy) => out.push(WireValue::from_handle(proxy.handle()), TypeTag::OBJECT_HANDLE),
        HostValue::NDArray(array) => {
            let tag = if array.is_view() { TypeTag::DLTENSOR_HANDLE } else { TypeTag::NDARRAY_HANDLE };
            out.push(WireValue::from_handle(array.handle()), tag);
        }
        HostValue::Module(module) => out.push(WireValue::from_handle(module.handle()), TypeTag::MODULE_HANDLE),
        HostValue::PackedFunc(func) => {
            out.push(WireValue::from_handle(func.handle()), TypeTag::PACKED_FUNC_HANDLE)
        }
        HostValue::Null => out.push(WireValue::null(), TypeTag::NULL),
        HostValue::Extension(ext) => {
            let tag = ext.type_tag();
            if ctx.extension(tag).is_none() {
                return Err(FfiError::unsupported(format!("{:?}", ext)));
            }
            out.push(WireValue::from_handle(ext.handle()), tag);
        }
        HostValue::Int(v) => out.push(WireValue::from_int(*v), TypeTag::INT),
        HostValue::Float(v) => out.push(WireValue::from_float(*v), TypeTag::FLOAT),
        HostValue::DataType(dtype) => {
            let text = ctx.format_dtype(*dtype)?;
            out.push_str(&text)?;
        }
        HostValue::Device(device) => out.push(WireValue::from_int(device.to_int64()), TypeTag::DEVICE),
        HostValue::Bytes(bytes) => {
            let record = Box::new(ByteArray {
                data: bytes.as_ptr(),
                size: bytes.len(),
            });
            let ptr = &*record as *const ByteArray as *mut core::ffi::c_void;
            out.push(WireValue::from_handle(ptr), TypeTag::BYTES);
            out.keep_alive.push(KeepAlive::Bytes(record));
        }
        HostValue::Str(s) => out.push_str(s)?,
        HostValue::List(items) | HostValue::Tuple(items) => {
            let ctor = ctx.config().containers.array_constructor.as_str();
            let object = construct_container(ctx, ctor, items.iter())?;
            out.push_object(object);
        }
        HostValue::Map(entries) => {
            let ctor = ctx.config().containers.map_constructor.as_str();
            let flat: Vec<&HostValue> = entries.iter().flat_map(|(k, v)| [k, v]).collect();
            let object = construct_container(ctx, ctor, flat)?;
            out.push_object(object);
        }
        HostValue::Callable(callable) => {
            let func = convert_to_packed_func(ctx, callable)?;
            out.push(WireValue::from_handle(func.handle()), TypeTag::PACKED_FUNC_HANDLE);
            out.keep_alive.push(KeepAlive::Func(func));
        }
        HostValue::Handle(handle) => out.push(WireValue::from_handle(handle.0), TypeTag::HANDLE),
        HostValue::RValueRef(rref) => {
            out.push(WireValue::from_handle(rref.slot().cast()), TypeTag::OBJECT_RVALUE_REF_ARG)
        }
    }
    Ok(())
}

/// Box a container into a native object through its constructor global
fn construct_container<'b, I>(ctx: &Context, ctor: &str, items: I) -> Result<Object>
where
    I: IntoIterator<Item = &'b HostValue>,
    I::IntoIter: ExactSizeIterator,
{
    let func = ctx
        .get_global_func(ctor, false)?
        .ok_or_else(|| FfiError::new(ErrorKind::GlobalFuncNotFound { name: ctor.to_string() }))?;
    construct_object(ctx, &func, items).map_err(|e| e.with_function(ctor))
}
