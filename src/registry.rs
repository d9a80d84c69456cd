//! Global function registry
//!
//! Functions registered by name on the native side, reachable from both
//! languages. Lookups return owned wrappers; `init_api` hands out
//! process-lifetime globals.

use crate::context::Context;
use crate::error::{self, ErrorKind, FfiError, Result};
use crate::ffi::PackedFunc;
use crate::interop::{convert_to_packed_func, Callable, HostValue, RawHandle};
use crate::logging::{debug, info};
use core::ffi::c_int;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// C initializer that registers extension functions through a callback
pub type ExtInitFn = unsafe extern "C" fn(RawHandle) -> c_int;

impl Context {
    /// Register `func` (a packed function or a host closure) under `name`
    pub fn register_func(&self, name: &str, func: HostValue, override_: bool) -> Result<()> {
        let func = match func {
            HostValue::PackedFunc(f) => f,
            HostValue::Callable(c) => convert_to_packed_func(self, &c)?,
            other => return Err(FfiError::unsupported(other.type_name()).with_function(name)),
        };
        self.api()
            .func_register_global(name, func.handle(), override_)
            .map_err(|e| FfiError::from(e).with_function(name))?;
        debug!(name, override_, "global function registered");
        Ok(())
    }

    /// Look up a global function
    ///
    /// A missing name is `Ok(None)` when `allow_missing` is set and an
    /// error otherwise.
    pub fn get_global_func(&self, name: &str, allow_missing: bool) -> Result<Option<PackedFunc>> {
        let raw = self.api().func_get_global(name)?;
        if !raw.is_null() {
            return Ok(Some(unsafe { PackedFunc::acquire(raw, self.api(), false) }));
        }
        if allow_missing {
            Ok(None)
        } else {
            Err(FfiError::new(ErrorKind::GlobalFuncNotFound { name: name.to_string() }))
        }
    }

    pub fn list_global_func_names(&self) -> Result<Vec<String>> {
        Ok(self.api().func_list_global_names()?)
    }

    pub fn remove_global_func(&self, name: &str) -> Result<()> {
        self.api()
            .func_remove_global(name)
            .map_err(|e| FfiError::from(e).with_function(name))
    }

    /// Look up and call a global function
    pub fn call_global(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        let func = self
            .get_global_func(name, false)?
            .ok_or_else(|| FfiError::new(ErrorKind::GlobalFuncNotFound { name: name.to_string() }))?;
        func.call(self, args).map_err(|e| e.with_function(name))
    }

    /// Every global `prefix.<name>` without a further dot, keyed by `<name>`
    pub fn init_api(&self, prefix: &str) -> Result<BTreeMap<String, PackedFunc>> {
        let mut funcs = BTreeMap::new();
        for full_name in self.list_global_func_names()? {
            let Some(short) = full_name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .filter(|rest| !rest.is_empty() && !rest.contains('.'))
            else {
                continue;
            };
            if let Some(func) = self.get_global_func(&full_name, true)? {
                funcs.insert(short.to_string(), func.into_global());
            }
        }
        info!(prefix, count = funcs.len(), "api functions initialized");
        Ok(funcs)
    }

    /// Collect the functions a C initializer registers through a callback
    ///
    /// The initializer receives a packed function taking `(name, func)`.
    pub fn extract_ext_funcs(&self, finit: ExtInitFn) -> Result<BTreeMap<String, PackedFunc>> {
        let collected: Arc<Mutex<BTreeMap<String, PackedFunc>>> = Arc::default();
        let sink = Arc::clone(&collected);
        let collector = Callable::new(move |args| {
            let mut args = args.into_iter();
            match (args.next(), args.next()) {
                (Some(HostValue::Str(name)), Some(HostValue::PackedFunc(func))) => {
                    sink.lock().insert(name, func);
                    Ok(HostValue::Null)
                }
                _ => Err("extension registration expects (name, function)".into()),
            }
        });

        let fadd = convert_to_packed_func(self, &collector)?;
        error::clear_last_error();
        let status = unsafe { finit(fadd.handle()) };
        drop(fadd);
        if status != 0 {
            let message = error::last_error()
                .unwrap_or_else(|| format!("extension initializer failed with status {}", status));
            return Err(FfiError::native(message));
        }

        let funcs = std::mem::take(&mut *collected.lock());
        Ok(funcs)
    }

    /// Runtime type index for a registered type key
    pub fn type_index_of(&self, type_key: &str) -> Result<u32> {
        self.api()
            .object_type_key_to_index(type_key)
            .map_err(|e| FfiError::from(e).with_function(type_key))
    }
}
