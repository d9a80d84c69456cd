//! Object handles - owning wrapper and host proxy classes
//!
//! Proxy classes wrap an [`Object`] and are produced by the decoder
//! without running any host-side constructor logic.

use super::handle::{OwnedHandle, ResourceKind};
use super::NativeApi;
use crate::error::{FfiError, Result};
use crate::interop::RawHandle;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Owning wrapper around a native object handle
#[derive(Debug)]
pub struct Object {
    handle: OwnedHandle,
}

impl Object {
    /// Take ownership of `raw`
    ///
    /// # Safety
    /// `raw` must be a live object handle whose reference is transferred
    /// to the returned wrapper; nothing else may free it.
    pub unsafe fn acquire(raw: RawHandle, api: &Arc<dyn NativeApi>) -> Self {
        Self {
            handle: OwnedHandle::new(raw, api, ResourceKind::Object, true),
        }
    }

    /// Non-owning wrapper over the same native object
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

    pub fn is_null(&self) -> bool {
        self.handle().is_null()
    }

    /// Release the native reference; idempotent
    pub fn release(&self) -> Result<bool> {
        self.handle.release()
    }

    /// Same underlying native object, regardless of wrapper identity
    pub fn same_as(&self, other: &Object) -> bool {
        self.handle.same_as(&other.handle)
    }

    /// Runtime type index reported by the native side
    pub fn type_index(&self) -> Result<u32> {
        let api = self
            .handle
            .api()
            .ok_or_else(|| FfiError::library("native library already unloaded"))?;
        Ok(api.object_type_index(self.handle())?)
    }

    pub(crate) fn slot(&self) -> *mut RawHandle {
        self.handle.slot()
    }
}

/// Host-side class bound to a native object type
pub trait ObjectProxy: Any + Send + Sync + fmt::Debug {
    fn object(&self) -> &Object;

    fn as_any(&self) -> &dyn Any;
}

impl<'a> dyn ObjectProxy + 'a {
    pub fn downcast_ref<T: ObjectProxy>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: ObjectProxy>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn handle(&self) -> RawHandle {
        self.object().handle()
    }

    pub fn same_as(&self, other: &dyn ObjectProxy) -> bool {
        self.object().same_as(other.object())
    }
}

/// Fallback class for type indices without a bound proxy
#[derive(Debug)]
pub struct GenericObject {
    object: Object,
    type_index: u32,
}

impl GenericObject {
    pub fn new(object: Object, type_index: u32) -> Self {
        Self { object, type_index }
    }

    pub fn type_index(&self) -> u32 {
        self.type_index
    }

    pub fn into_object(self) -> Object {
        self.object
    }
}

impl ObjectProxy for GenericObject {
    fn object(&self) -> &Object {
        &self.object
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Move-only object argument
///
/// The callee receives the address of the handle slot and may steal the
/// reference by nulling it; the wrapper then has nothing left to free.
#[derive(Debug)]
pub struct ObjectRValueRef {
    object: Object,
}

impl ObjectRValueRef {
    pub fn new(object: Object) -> Self {
        Self { object }
    }

    pub fn object(&self) -> &Object {
        &self.object
    }

    /// Whether the callee took ownership
    pub fn is_moved(&self) -> bool {
        self.object.is_null()
    }

    pub(crate) fn slot(&self) -> *mut RawHandle {
        self.object.slot()
    }
}
