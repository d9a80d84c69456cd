//! Module and packed function handles

use super::handle::{OwnedHandle, ResourceKind};
use super::NativeApi;
use crate::error::Result;
use crate::interop::RawHandle;
use std::sync::Arc;

/// Owning wrapper around a loaded native module
#[derive(Debug)]
pub struct Module {
    handle: OwnedHandle,
}

impl Module {
    /// # Safety
    /// `raw` must be a live module handle whose reference is transferred
    /// to the returned wrapper.
    pub unsafe fn acquire(raw: RawHandle, api: &Arc<dyn NativeApi>) -> Self {
        Self {
            handle: OwnedHandle::new(raw, api, ResourceKind::Module, true),
        }
    }

    /// # Safety
    /// The alias must not be used after `self` releases the handle.
    pub unsafe fn alias(&self) -> Self {
        Self { handle: self.handle.alias() }
    }

    #[inline]
    pub fn handle(&self) -> RawHandle {
        self.handle.get()
    }

    pub fn release(&self) -> Result<bool> {
        self.handle.release()
    }

    pub fn same_as(&self, other: &Module) -> bool {
        self.handle.same_as(&other.handle)
    }
}

/// Handle to a function callable through the packed convention
///
/// Global functions are never individually released.
#[derive(Debug)]
pub struct PackedFunc {
    handle: OwnedHandle,
}

impl PackedFunc {
    /// # Safety
    /// `raw` must be a live function handle. Unless `is_global` is set, its
    /// reference is transferred to the returned wrapper.
    pub unsafe fn acquire(raw: RawHandle, api: &Arc<dyn NativeApi>, is_global: bool) -> Self {
        Self {
            handle: OwnedHandle::new(raw, api, ResourceKind::PackedFunc, !is_global),
        }
    }

    /// Non-owning wrapper over the same function
    ///
    /// The alias reports [`is_global`](Self::is_global) since it never
    /// frees the handle.
    ///
    /// # Safety
    /// The alias must not be used after `self` releases the handle.
    pub unsafe fn alias(&self) -> Self {
        Self { handle: self.handle.alias() }
    }

    #[inline]
    pub fn handle(&self) -> RawHandle {
        self.handle.get()
    }

    pub fn is_global(&self) -> bool {
        !self.handle.owns()
    }

    /// Re-wrap as a global function that is never freed from this side
    pub fn into_global(self) -> Self {
        let Some(api) = self.handle.api() else {
            return self;
        };
        let raw = self.handle.take();
        // The reference stays with the native side for the process lifetime.
        unsafe { Self::acquire(raw, &api, true) }
    }

    pub fn release(&self) -> Result<bool> {
        self.handle.release()
    }

    pub fn same_as(&self, other: &PackedFunc) -> bool {
        self.handle.same_as(&other.handle)
    }
}
