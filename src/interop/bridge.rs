//! Native-callable bridge - host closures behind a C trampoline
//!
//! Design: each bridged closure occupies one slot in a process-wide arena,
//! keyed by the resource handle the native side hands back on every call.
//! The slot is the closure's single strong owner for the lifetime of the
//! native function object; the finalizer clears it exactly once.

use super::decode::{decode, DecodeMode};
use super::marshal::pack;
use super::stats;
use super::types::{Callable, HostFn, HostValue, TypeTag, WireValue};
use crate::context::Context;
use crate::error::{self, ErrorKind, FfiError, HostError, Result};
use crate::ffi::{NativeApi, PackedFunc, RetValueHandle};
use crate::logging::{log_callback_error, trace};
use core::ffi::{c_int, c_void};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

struct BridgeEntry {
    ctx: Arc<Context>,
    func: Arc<HostFn>,
}

/// Live bridged closures by resource id
static CALLBACKS: Lazy<DashMap<usize, BridgeEntry>> = Lazy::new(DashMap::new);

/// Runtime that most recently received a bridged closure
///
/// Stale ids have no arena entry left, so their diagnostic goes here.
static LAST_API: Lazy<RwLock<Option<Weak<dyn NativeApi>>>> = Lazy::new(|| RwLock::new(None));

/// Zero is never handed out, so a null resource handle is always invalid
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Expose `callable` to the native side as a packed function
///
/// The returned function is owned; once the native side drops its last
/// reference the finalizer releases the closure.
pub fn convert_to_packed_func(ctx: &Context, callable: &Callable) -> Result<PackedFunc> {
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    CALLBACKS.insert(
        id,
        BridgeEntry {
            ctx: ctx.shared()?,
            func: callable.shared(),
        },
    );
    *LAST_API.write() = Some(Arc::downgrade(ctx.api()));

    match ctx
        .api()
        .func_create_from_cfunc(bridge_trampoline, id as *mut c_void, bridge_finalizer)
    {
        Ok(raw) => {
            trace!(callback = id, handle = ?raw, "host closure bridged");
            Ok(unsafe { PackedFunc::acquire(raw, ctx.api(), false) })
        }
        Err(err) => {
            CALLBACKS.remove(&id);
            Err(err.into())
        }
    }
}

/// Number of bridged closures the native side still holds
pub fn live_callbacks() -> usize {
    CALLBACKS.len()
}

/// Entry point the native side calls for every bridged closure
///
/// Returns 0 on success. On failure the diagnostic is stored in the
/// last-error slots (thread-local and native) and -1 is returned.
pub(crate) unsafe extern "C" fn bridge_trampoline(
    args: *mut WireValue,
    type_codes: *mut TypeTag,
    num_args: c_int,
    ret: RetValueHandle,
    resource_handle: *mut c_void,
) -> c_int {
    let id = resource_handle as usize;
    // Clone out of the arena so no shard lock is held while the closure runs.
    let entry = CALLBACKS
        .get(&id)
        .map(|e| (Arc::clone(&e.ctx), Arc::clone(&e.func)));
    let Some((ctx, func)) = entry else {
        let message = format!("bridged callback {} is no longer registered", id);
        if let Some(api) = LAST_API.read().as_ref().and_then(Weak::upgrade) {
            api.set_last_error(&message);
        }
        error::set_last_error(message);
        return -1;
    };

    stats::record_callback();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        invoke(&ctx, &*func, args, type_codes, num_args, ret)
    }));

    let message = match outcome {
        Ok(Ok(())) => return 0,
        Ok(Err(err)) => err.to_string(),
        Err(payload) => panic_message(payload.as_ref()),
    };

    stats::record_callback_failure();
    let diagnostic = format_diagnostic(&message);
    log_callback_error(id, &message);
    ctx.api().set_last_error(&diagnostic);
    error::set_last_error(diagnostic);
    -1
}

unsafe extern "C" fn bridge_finalizer(resource_handle: *mut c_void) {
    let id = resource_handle as usize;
    if CALLBACKS.remove(&id).is_some() {
        trace!(callback = id, "bridged closure released");
    }
}

unsafe fn invoke(
    ctx: &Context,
    func: &HostFn,
    args: *mut WireValue,
    type_codes: *mut TypeTag,
    num_args: c_int,
    ret: RetValueHandle,
) -> std::result::Result<(), HostError> {
    let n = usize::try_from(num_args).unwrap_or(0);
    let (values, tags): (&mut [WireValue], &[TypeTag]) = if n == 0 || args.is_null() || type_codes.is_null() {
        (&mut [], &[])
    } else {
        (
            std::slice::from_raw_parts_mut(args, n),
            std::slice::from_raw_parts(type_codes, n),
        )
    };

    let mut host_args = Vec::with_capacity(n);
    for (value, &tag) in values.iter_mut().zip(tags) {
        host_args.push(decode(ctx, value, tag, DecodeMode::Callback)?);
    }

    match func(host_args)? {
        HostValue::Null => Ok(()),
        HostValue::Tuple(_) => Err(FfiError::new(ErrorKind::MultipleReturnValues).into()),
        value => {
            let mut packed = pack(ctx, std::iter::once(&value))?;
            let (values, tags) = packed.parts_mut();
            ctx.api().cfunc_set_return(ret, values, tags)?;
            Ok(())
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("host callback panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("host callback panicked: {}", s)
    } else {
        "host callback panicked".to_string()
    }
}

fn format_diagnostic(message: &str) -> String {
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        format!("Traceback (host callback):\n{}\n{}", backtrace, message)
    } else {
        message.to_string()
    }
}
