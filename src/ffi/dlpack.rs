//! Zero-copy tensor exchange through single-consume capsules
//!
//! A capsule starts `live` under the name `"dltensor"` with a deleter
//! attached. Consuming it builds a native array from the managed tensor,
//! renames it to `"used_dltensor"` and drops the deleter in one step
//! under the capsule lock, so the memory changes owner at most once and
//! exactly one deleter ever runs.

use super::NativeApi;
use crate::error::{ErrorKind, FfiError, Result};
use crate::interop::{DataType, Device, RawHandle};
use crate::logging::{debug, trace};
use core::ffi::c_void;
use core::ptr::NonNull;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Capsule name while the tensor is still owned by the producer
pub const CAPSULE_NAME: &str = "dltensor";
/// Capsule name once a consumer has taken the tensor
pub const CAPSULE_NAME_USED: &str = "used_dltensor";

pub type DLDevice = Device;
pub type DLDataType = DataType;

/// Plain tensor view, layout-compatible with DLPack's `DLTensor`
#[repr(C)]
#[derive(Debug)]
pub struct DLTensor {
    pub data: *mut c_void,
    pub device: DLDevice,
    pub ndim: i32,
    pub dtype: DLDataType,
    pub shape: *mut i64,
    pub strides: *mut i64,
    pub byte_offset: u64,
}

/// Tensor plus the producer's deleter
#[repr(C)]
#[derive(Debug)]
pub struct DLManagedTensor {
    pub dl_tensor: DLTensor,
    pub manager_ctx: *mut c_void,
    pub deleter: Option<unsafe extern "C" fn(*mut DLManagedTensor)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleState {
    Live,
    Consumed,
}

enum Deleter {
    /// Release through the native runtime's managed-tensor deleter
    Native(Weak<dyn NativeApi>),
    /// Call the deleter stored inside the managed tensor
    Embedded,
    None,
}

struct CapsuleInner {
    name: &'static str,
    tensor: *mut DLManagedTensor,
    deleter: Deleter,
}

/// Single-consume container for a DLPack managed tensor
pub struct Capsule {
    inner: Mutex<CapsuleInner>,
}

// The tensor pointer is only read or handed off under the capsule lock.
unsafe impl Send for Capsule {}
unsafe impl Sync for Capsule {}

impl Capsule {
    pub(crate) fn from_native(tensor: *mut DLManagedTensor, api: &Arc<dyn NativeApi>) -> Self {
        Self {
            inner: Mutex::new(CapsuleInner {
                name: CAPSULE_NAME,
                tensor,
                deleter: Deleter::Native(Arc::downgrade(api)),
            }),
        }
    }

    /// Wrap a tensor exported by a foreign producer
    ///
    /// # Safety
    /// `tensor` must stay valid until either a consumer takes it or its
    /// embedded deleter runs when the capsule is dropped.
    pub unsafe fn from_managed(tensor: NonNull<DLManagedTensor>) -> Self {
        Self {
            inner: Mutex::new(CapsuleInner {
                name: CAPSULE_NAME,
                tensor: tensor.as_ptr(),
                deleter: Deleter::Embedded,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.lock().name
    }

    pub fn state(&self) -> CapsuleState {
        if self.name() == CAPSULE_NAME {
            CapsuleState::Live
        } else {
            CapsuleState::Consumed
        }
    }

    pub fn is_live(&self) -> bool {
        self.state() == CapsuleState::Live
    }

    /// Raw managed tensor, valid only while the capsule is live
    pub fn as_ptr(&self) -> *mut DLManagedTensor {
        self.inner.lock().tensor
    }

    /// Transition `live -> consumed`, handing the tensor to `import`
    ///
    /// If `import` fails the capsule stays live and keeps its deleter.
    pub(crate) fn consume<F>(&self, import: F) -> Result<RawHandle>
    where
        F: FnOnce(*mut DLManagedTensor) -> Result<RawHandle>,
    {
        let mut inner = self.inner.lock();
        if inner.name != CAPSULE_NAME {
            return Err(FfiError::new(ErrorKind::CapsuleConsumed));
        }
        let handle = import(inner.tensor)?;
        inner.name = CAPSULE_NAME_USED;
        inner.deleter = Deleter::None;
        debug!(tensor = ?inner.tensor, "dlpack capsule consumed");
        Ok(handle)
    }
}

impl Drop for Capsule {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.name != CAPSULE_NAME || inner.tensor.is_null() {
            return;
        }
        match std::mem::replace(&mut inner.deleter, Deleter::None) {
            Deleter::Native(api) => {
                if let Some(api) = api.upgrade() {
                    api.dl_managed_tensor_call_deleter(inner.tensor);
                    trace!(tensor = ?inner.tensor, "unconsumed capsule released by native deleter");
                }
            }
            Deleter::Embedded => unsafe {
                if let Some(deleter) = (*inner.tensor).deleter {
                    deleter(inner.tensor);
                }
            },
            Deleter::None => {}
        }
    }
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Capsule")
            .field("name", &inner.name)
            .field("tensor", &inner.tensor)
            .finish()
    }
}
