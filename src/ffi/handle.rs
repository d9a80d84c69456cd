//! Handle ownership - release-once semantics for native handles
//!
//! A handle is stored in an atomic slot. Release swaps the slot to null
//! before calling the native free entry point, so a second release (or a
//! drop after an explicit release) finds nothing to do. Wrappers keep
//! only a weak reference to the native API: once the library has been
//! torn down the upgrade fails and release is skipped.

use super::NativeApi;
use crate::error::Result;
use crate::interop::{stats, RawHandle};
use crate::logging::{trace, warn};
use core::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Weak};

/// Resource kind, selecting the free entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Object,
    NDArray,
    Module,
    PackedFunc,
}

impl ResourceKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::NDArray => "ndarray",
            Self::Module => "module",
            Self::PackedFunc => "packed_func",
        }
    }
}

pub(crate) struct OwnedHandle {
    raw: AtomicPtr<c_void>,
    api: Weak<dyn NativeApi>,
    kind: ResourceKind,
    /// Views and global functions never call the free entry point
    owns: bool,
}

impl OwnedHandle {
    pub(crate) fn new(raw: RawHandle, api: &Arc<dyn NativeApi>, kind: ResourceKind, owns: bool) -> Self {
        Self {
            raw: AtomicPtr::new(raw),
            api: Arc::downgrade(api),
            kind,
            owns,
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> RawHandle {
        self.raw.load(Ordering::Acquire)
    }

    /// Address of the handle slot, for move-only reference arguments
    #[inline]
    pub(crate) fn slot(&self) -> *mut RawHandle {
        self.raw.as_ptr()
    }

    #[inline]
    pub(crate) fn owns(&self) -> bool {
        self.owns
    }

    pub(crate) fn api(&self) -> Option<Arc<dyn NativeApi>> {
        self.api.upgrade()
    }

    /// Second wrapper over the same handle that never frees it
    pub(crate) fn alias(&self) -> Self {
        Self {
            raw: AtomicPtr::new(self.get()),
            api: Weak::clone(&self.api),
            kind: self.kind,
            owns: false,
        }
    }

    /// Give up the handle without freeing it
    pub(crate) fn take(&self) -> RawHandle {
        self.raw.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn same_as(&self, other: &OwnedHandle) -> bool {
        self.get() == other.get()
    }

    /// Free the handle once; later calls are no-ops
    ///
    /// Returns whether the native free entry point was invoked.
    pub(crate) fn release(&self) -> Result<bool> {
        let raw = self.take();
        if raw.is_null() || !self.owns {
            return Ok(false);
        }

        let Some(api) = self.api.upgrade() else {
            trace!(kind = self.kind.name(), handle = ?raw, "native library gone, release skipped");
            return Ok(false);
        };

        match self.kind {
            ResourceKind::Object => api.object_free(raw)?,
            ResourceKind::NDArray => api.array_free(raw)?,
            ResourceKind::Module => api.module_free(raw)?,
            ResourceKind::PackedFunc => api.func_free(raw)?,
        }

        stats::record_release();
        trace!(kind = self.kind.name(), handle = ?raw, "handle released");
        Ok(true)
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(kind = self.kind.name(), error = %err, "failed to release native handle");
        }
    }
}

impl std::fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedHandle")
            .field("kind", &self.kind)
            .field("raw", &self.get())
            .field("owns", &self.owns)
            .finish()
    }
}
