//! OSTAR FFI - packed-call boundary between a host language and the
//! native runtime
//!
//! Every call crosses through one C-compatible convention: an array of
//! tagged wire values in, one tagged value out. This crate owns the
//! marshaling tables, the handle ownership model for native objects,
//! arrays, modules and functions, the bridge that exposes host closures
//! to native code, and zero-copy DLPack tensor exchange.

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod ffi;
pub mod interop;
pub mod libinfo;
pub mod logging;
pub mod registry;

#[cfg(feature = "python")]
mod python;

#[cfg(test)]
pub(crate) mod testing;

// Re-export core types
pub use config::FfiConfig;
pub use context::{ClassStrategy, Context, ContextBuilder, ExtensionType};
pub use device::DeviceInfo;
pub use error::{last_error, ErrorCategory, ErrorKind, FfiError, NativeError, Result};
pub use ffi::{Capsule, GenericObject, Module, NDArray, NativeApi, NativeLibrary, Object};
pub use ffi::{ObjectProxy, ObjectRValueRef, PackedFunc};
pub use interop::{marshal, Callable, DataType, Device, HostValue, PackedArgs, TypeTag, WireValue};

use std::sync::Arc;

/// Load the native runtime named by discovered configuration and build a
/// context with no registered classes
pub fn init() -> Result<Arc<Context>> {
    let config = FfiConfig::discover();
    logging::init_with_config(config.logging.to_log_config());
    let library = NativeLibrary::load_from_config(&config)?;
    Ok(Context::builder(Arc::new(library)).config(config).build())
}
