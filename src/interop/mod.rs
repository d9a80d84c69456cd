//! Interoperability - packed calls across the host/native boundary
//!
//! Design: one calling convention for everything, values travel as a
//! tagged union with a parallel tag array
//!
//! Architecture:
//! - `types.rs` - wire model (WireValue, TypeTag, HostValue)
//! - `scalar.rs` - DataType and Device descriptors
//! - `marshal.rs` - host values -> wire values plus keep-alive set
//! - `decode.rs` - wire values -> host values (return and callback tables)
//! - `call.rs` - packed function invocation
//! - `bridge.rs` - host closures exposed as native-callable functions
//! - `library.rs` - dynamic library loading (dlopen/LoadLibrary)

mod bridge;
mod call;
mod decode;
pub(crate) mod library;
mod marshal;
mod scalar;
mod types;

pub use bridge::{convert_to_packed_func, live_callbacks};
pub use call::init_handle_by_constructor;
pub use decode::{DecodeMode, ExtensionDecoder};
pub use library::{Library, LoadError, SymbolError};
pub use marshal::{marshal, PackedArgs};
pub use scalar::{CustomTypeResolver, DataType, DataTypeCode, Device, DeviceAttr, RPC_SESS_MASK};
pub use types::{ByteArray, Callable, Extension, HostFn, HostValue, OpaqueHandle, RawHandle};
pub use types::{TypeTag, WireValue};

/// Get interop statistics
pub fn stats() -> InteropStats {
    stats::snapshot()
}

/// Interop statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InteropStats {
    pub calls_made: usize,
    pub marshaling_errors: usize,
    pub callbacks_invoked: usize,
    pub callback_failures: usize,
    pub handles_released: usize,
}

pub(crate) mod stats {
    use super::InteropStats;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS_MADE: AtomicUsize = AtomicUsize::new(0);
    static MARSHALING_ERRORS: AtomicUsize = AtomicUsize::new(0);
    static CALLBACKS_INVOKED: AtomicUsize = AtomicUsize::new(0);
    static CALLBACK_FAILURES: AtomicUsize = AtomicUsize::new(0);
    static HANDLES_RELEASED: AtomicUsize = AtomicUsize::new(0);

    #[inline]
    pub fn record_call() {
        CALLS_MADE.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_marshaling_error() {
        MARSHALING_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_callback() {
        CALLBACKS_INVOKED.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_callback_failure() {
        CALLBACK_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_release() {
        HANDLES_RELEASED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> InteropStats {
        InteropStats {
            calls_made: CALLS_MADE.load(Ordering::Relaxed),
            marshaling_errors: MARSHALING_ERRORS.load(Ordering::Relaxed),
            callbacks_invoked: CALLBACKS_INVOKED.load(Ordering::Relaxed),
            callback_failures: CALLBACK_FAILURES.load(Ordering::Relaxed),
            handles_released: HANDLES_RELEASED.load(Ordering::Relaxed),
        }
    }
}
