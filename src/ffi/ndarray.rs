//! NDArray handles
//!
//! An array handle points at a native `DLTensor` header. Views alias
//! memory owned elsewhere (a zero-copy producer, a callback argument)
//! and never free it.

use super::dlpack::{Capsule, DLTensor};
use super::handle::{OwnedHandle, ResourceKind};
use super::NativeApi;
use crate::context::Context;
use crate::error::{FfiError, Result};
use crate::interop::{DataType, Device, RawHandle};
use std::sync::Arc;

#[derive(Debug)]
pub struct NDArray {
    handle: OwnedHandle,
    is_view: bool,
}

impl NDArray {
    /// # Safety
    /// `raw` must point to a live native array header. Unless `is_view` is
    /// set, its reference is transferred to the returned wrapper.
    pub unsafe fn acquire(raw: RawHandle, api: &Arc<dyn NativeApi>, is_view: bool) -> Self {
        Self {
            handle: OwnedHandle::new(raw, api, ResourceKind::NDArray, !is_view),
            is_view,
        }
    }

    /// Allocate an uninitialized array on `device`
    pub fn alloc(ctx: &Context, shape: &[i64], dtype: DataType, device: Device) -> Result<Self> {
        let raw = ctx.api().array_alloc(shape, dtype, device)?;
        // Fresh allocation, owned by us.
        Ok(unsafe { Self::acquire(raw, ctx.api(), false) })
    }

    /// Non-owning wrapper over the same array; the view flag is kept
    ///
    /// # Safety
    /// The alias must not be used after `self` releases the handle.
    pub unsafe fn alias(&self) -> Self {
        Self {
            handle: self.handle.alias(),
            is_view: self.is_view,
        }
    }

    #[inline]
    pub fn handle(&self) -> RawHandle {
        self.handle.get()
    }

    pub fn is_view(&self) -> bool {
        self.is_view
    }

    pub fn release(&self) -> Result<bool> {
        self.handle.release()
    }

    pub fn same_as(&self, other: &NDArray) -> bool {
        self.handle.same_as(&other.handle)
    }

    fn header(&self) -> Option<&DLTensor> {
        // Array handles point at the tensor header for as long as the handle is held.
        unsafe { (self.handle() as *const DLTensor).as_ref() }
    }

    pub fn shape(&self) -> Vec<i64> {
        match self.header() {
            Some(t) if !t.shape.is_null() && t.ndim > 0 => unsafe {
                std::slice::from_raw_parts(t.shape, t.ndim as usize).to_vec()
            },
            _ => Vec::new(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.header().map_or(0, |t| t.ndim.max(0) as usize)
    }

    pub fn dtype(&self) -> Option<DataType> {
        self.header().map(|t| t.dtype)
    }

    pub fn device(&self) -> Option<Device> {
        self.header().map(|t| t.device)
    }

    fn api(&self) -> Result<Arc<dyn NativeApi>> {
        self.handle
            .api()
            .ok_or_else(|| FfiError::library("native library already unloaded"))
    }

    /// Copy contents into `target`, which must have a matching shape
    pub fn copy_to<'a>(&self, target: &'a NDArray) -> Result<&'a NDArray> {
        self.api()?.array_copy_from_to(self.handle(), target.handle())?;
        Ok(target)
    }

    /// Export as a live DLPack capsule without copying
    pub fn to_dlpack(&self) -> Result<Capsule> {
        let api = self.api()?;
        let tensor = api.array_to_dlpack(self.handle())?;
        Ok(Capsule::from_native(tensor, &api))
    }

    /// Import a live capsule, taking over its memory
    pub fn from_dlpack(ctx: &Context, capsule: &Capsule) -> Result<Self> {
        let api = ctx.api();
        let raw = capsule.consume(|tensor| Ok(api.array_from_dlpack(tensor)?))?;
        Ok(unsafe { Self::acquire(raw, api, false) })
    }
}
