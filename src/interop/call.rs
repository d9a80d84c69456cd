//! Packed function invocation
//!
//! Marshal, call, decode. Native failures carry the native-side message;
//! a successful call clears this thread's last-error slot.

use super::decode::{decode, DecodeMode};
use super::marshal::{marshal, pack, PackedArgs};
use super::stats;
use super::types::{HostValue, RawHandle, TypeTag, WireValue};
use crate::context::Context;
use crate::error::{self, ErrorKind, FfiError, Result};
use crate::ffi::{Object, PackedFunc};
use crate::logging::log_packed_call;

/// Invoke `func` with already packed arguments
pub(crate) fn call_packed(ctx: &Context, func: RawHandle, args: &mut PackedArgs<'_>) -> Result<(WireValue, TypeTag)> {
    stats::record_call();
    log_packed_call(func, args.len());
    let (values, tags) = args.parts_mut();
    let ret = ctx.api().func_call(func, values, tags)?;
    error::clear_last_error();
    Ok(ret)
}

impl PackedFunc {
    /// Call with host arguments and decode the single return value
    pub fn call(&self, ctx: &Context, args: &[HostValue]) -> Result<HostValue> {
        let mut packed = marshal(ctx, args)?;
        let (mut value, tag) = call_packed(ctx, self.handle(), &mut packed)?;
        // Returned memory may alias the arguments; decode before they drop.
        let result = decode(ctx, &mut value, tag, DecodeMode::Return);
        drop(packed);
        result
    }
}

/// Call a constructor and take ownership of the object it returns
pub fn init_handle_by_constructor(ctx: &Context, ctor: &PackedFunc, args: &[HostValue]) -> Result<Object> {
    construct_object(ctx, ctor, args.iter())
}

pub(crate) fn construct_object<'a, I>(ctx: &Context, ctor: &PackedFunc, args: I) -> Result<Object>
where
    I: IntoIterator<Item = &'a HostValue>,
    I::IntoIter: ExactSizeIterator,
{
    let mut packed = pack(ctx, args)?;
    let (value, tag) = call_packed(ctx, ctor.handle(), &mut packed)?;
    if tag != TypeTag::OBJECT_HANDLE {
        return Err(FfiError::new(ErrorKind::UnexpectedReturnTag {
            expected: TypeTag::OBJECT_HANDLE,
            found: tag,
        }));
    }
    Ok(unsafe { Object::acquire(value.v_handle, ctx.api()) })
}
