//! Decode tables - wire values back into host values
//!
//! Design: two dispatch tables keyed by type tag. The return table decodes
//! results of a packed call; the callback table decodes arguments handed
//! to a bridged closure. Handle kinds in the callback table first claim
//! the argument through the native callback-arg-to-return entry point so
//! the wrapper can own it exactly like a returned handle. Each value is
//! claimed once, right before it is wrapped.

use super::scalar::{DataType, Device};
use super::types::{ByteArray, HostValue, OpaqueHandle, RawHandle, TypeTag, WireValue};
use crate::context::Context;
use crate::error::{FfiError, Result};
use crate::ffi::{Module, NDArray, NativeApi, Object, PackedFunc};
use crate::logging::log_unknown_tag;
use std::ffi::CStr;
use std::sync::Arc;

/// Which table to consult
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Return,
    Callback,
}

/// Decoder for an extension type's handle
pub type ExtensionDecoder = fn(RawHandle, &Arc<dyn NativeApi>) -> Result<HostValue>;

type DecodeFn = fn(&Context, &mut WireValue, TypeTag) -> Result<HostValue>;

const TABLE_SIZE: usize = TypeTag::EXT_BEGIN.code() as usize;

static RETURN_TABLE: [Option<DecodeFn>; TABLE_SIZE] = [
    Some(decode_int),         // INT
    None,                     // UINT
    Some(decode_float),       // FLOAT
    Some(decode_handle),      // HANDLE
    Some(decode_null),        // NULL
    Some(decode_dtype),       // DATA_TYPE
    Some(decode_device),      // DEVICE
    None,                     // DLTENSOR_HANDLE
    Some(decode_object),      // OBJECT_HANDLE
    Some(decode_module),      // MODULE_HANDLE
    Some(decode_packed_func), // PACKED_FUNC_HANDLE
    Some(decode_str),         // STR
    Some(decode_bytes),       // BYTES
    Some(decode_ndarray),     // NDARRAY_HANDLE
    None,                     // OBJECT_RVALUE_REF_ARG
];

static CALLBACK_TABLE: [Option<DecodeFn>; TABLE_SIZE] = [
    Some(decode_int),
    None,
    Some(decode_float),
    Some(decode_handle),
    Some(decode_null),
    Some(decode_dtype),
    Some(decode_device),
    Some(decode_dltensor),
    Some(claimed::object),
    Some(claimed::module),
    Some(claimed::packed_func),
    Some(decode_str),
    Some(decode_bytes),
    Some(claimed::ndarray),
    Some(claimed::object),
];

/// Decode one wire value
///
/// An unknown tag means the host and native binaries disagree on the ABI
/// and is reported as fatal.
pub(crate) fn decode(ctx: &Context, value: &mut WireValue, tag: TypeTag, mode: DecodeMode) -> Result<HostValue> {
    if tag.is_extension() {
        return match ctx.extension(tag) {
            Some(ext) => {
                if mode == DecodeMode::Callback {
                    claim(ctx, value, tag)?;
                }
                (ext.decode)(unsafe { value.v_handle }, ctx.api())
            }
            None => unknown(tag),
        };
    }

    let table = match mode {
        DecodeMode::Return => &RETURN_TABLE,
        DecodeMode::Callback => &CALLBACK_TABLE,
    };
    match usize::try_from(tag.code()).ok().and_then(|i| table[i]) {
        Some(decode_fn) => decode_fn(ctx, value, tag),
        None => unknown(tag),
    }
}

fn unknown(tag: TypeTag) -> Result<HostValue> {
    log_unknown_tag(tag.code());
    Err(FfiError::unknown_tag(tag.code()))
}

fn claim(ctx: &Context, value: &mut WireValue, tag: TypeTag) -> Result<()> {
    Ok(ctx.api().cb_arg_to_return(value, tag)?)
}

fn decode_int(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::Int(unsafe { value.v_int64 }))
}

fn decode_float(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::Float(unsafe { value.v_float64 }))
}

fn decode_handle(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::Handle(OpaqueHandle(unsafe { value.v_handle })))
}

fn decode_null(_: &Context, _: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::Null)
}

fn decode_dtype(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    // Descriptor occupies the low 32 bits.
    let bits = unsafe { value.v_int64 } as u32;
    Ok(HostValue::DataType(DataType::from_bits(bits)))
}

fn decode_device(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::Device(Device::from_int64(unsafe { value.v_int64 })))
}

fn decode_str(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    let ptr = unsafe { value.v_str };
    if ptr.is_null() {
        return Ok(HostValue::Null);
    }
    // Valid until the next call on this thread; copied out immediately.
    let s = unsafe { CStr::from_ptr(ptr) };
    Ok(HostValue::Str(s.to_string_lossy().into_owned()))
}

fn decode_bytes(_: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    let record = unsafe { (value.v_handle as *const ByteArray).as_ref() };
    let bytes = match record {
        Some(arr) if !arr.data.is_null() && arr.size > 0 => unsafe {
            std::slice::from_raw_parts(arr.data, arr.size).to_vec()
        },
        _ => Vec::new(),
    };
    Ok(HostValue::Bytes(bytes))
}

fn decode_object(ctx: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    let raw = unsafe { value.v_handle };
    if raw.is_null() {
        return Ok(HostValue::Null);
    }
    let object = unsafe { Object::acquire(raw, ctx.api()) };
    ctx.decode_object(object)
}

fn decode_module(ctx: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::Module(unsafe { Module::acquire(value.v_handle, ctx.api()) }))
}

/// Returned functions are owned, never global
fn decode_packed_func(ctx: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::PackedFunc(unsafe { PackedFunc::acquire(value.v_handle, ctx.api(), false) }))
}

fn decode_ndarray(ctx: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    let array = unsafe { NDArray::acquire(value.v_handle, ctx.api(), false) };
    ctx.decode_ndarray(array)
}

/// Borrowed tensor view; the caller keeps ownership
fn decode_dltensor(ctx: &Context, value: &mut WireValue, _: TypeTag) -> Result<HostValue> {
    Ok(HostValue::NDArray(unsafe { NDArray::acquire(value.v_handle, ctx.api(), true) }))
}

mod claimed {
    use super::*;

    pub(super) fn object(ctx: &Context, value: &mut WireValue, tag: TypeTag) -> Result<HostValue> {
        claim(ctx, value, tag)?;
        decode_object(ctx, value, tag)
    }

    pub(super) fn module(ctx: &Context, value: &mut WireValue, tag: TypeTag) -> Result<HostValue> {
        claim(ctx, value, tag)?;
        decode_module(ctx, value, tag)
    }

    pub(super) fn packed_func(ctx: &Context, value: &mut WireValue, tag: TypeTag) -> Result<HostValue> {
        claim(ctx, value, tag)?;
        decode_packed_func(ctx, value, tag)
    }

    pub(super) fn ndarray(ctx: &Context, value: &mut WireValue, tag: TypeTag) -> Result<HostValue> {
        claim(ctx, value, tag)?;
        decode_ndarray(ctx, value, tag)
    }
}
