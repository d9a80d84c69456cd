//! Device attribute queries through `runtime.GetDeviceAttr`

use crate::context::Context;
use crate::error::{FfiError, Result};
use crate::interop::{Device, DeviceAttr, HostValue};

const GET_DEVICE_ATTR: &str = "runtime.GetDeviceAttr";

/// Attribute view of one device
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo<'a> {
    ctx: &'a Context,
    device: Device,
}

impl Context {
    pub fn device_info(&self, device: Device) -> DeviceInfo<'_> {
        DeviceInfo { ctx: self, device }
    }
}

impl<'a> DeviceInfo<'a> {
    pub fn device(&self) -> Device {
        self.device
    }

    /// Raw attribute value as returned by the runtime
    pub fn attr(&self, attr: DeviceAttr) -> Result<HostValue> {
        self.ctx.call_global(
            GET_DEVICE_ATTR,
            &[
                HostValue::Int(i64::from(self.device.device_type)),
                HostValue::Int(i64::from(self.device.device_id)),
                HostValue::Int(attr as i64),
            ],
        )
    }

    fn int_attr(&self, attr: DeviceAttr) -> Result<i64> {
        match self.attr(attr)? {
            HostValue::Int(v) => Ok(v),
            other => Err(unexpected(attr, &other)),
        }
    }

    fn str_attr(&self, attr: DeviceAttr) -> Result<String> {
        match self.attr(attr)? {
            HostValue::Str(s) => Ok(s),
            other => Err(unexpected(attr, &other)),
        }
    }

    pub fn exist(&self) -> Result<bool> {
        Ok(self.int_attr(DeviceAttr::Exist)? != 0)
    }

    pub fn max_threads_per_block(&self) -> Result<i64> {
        self.int_attr(DeviceAttr::MaxThreadsPerBlock)
    }

    pub fn warp_size(&self) -> Result<i64> {
        self.int_attr(DeviceAttr::WarpSize)
    }

    pub fn max_shared_memory_per_block(&self) -> Result<i64> {
        self.int_attr(DeviceAttr::MaxSharedMemoryPerBlock)
    }

    /// e.g. `"8.6"` for CUDA devices
    pub fn compute_version(&self) -> Result<String> {
        self.str_attr(DeviceAttr::ComputeVersion)
    }

    pub fn device_name(&self) -> Result<String> {
        self.str_attr(DeviceAttr::DeviceName)
    }

    pub fn max_clock_rate(&self) -> Result<i64> {
        self.int_attr(DeviceAttr::MaxClockRate)
    }

    pub fn multi_processor_count(&self) -> Result<i64> {
        self.int_attr(DeviceAttr::MultiProcessorCount)
    }

    /// Per-dimension thread limits, sent as a JSON array
    pub fn max_thread_dimensions(&self) -> Result<Vec<i64>> {
        let json = self.str_attr(DeviceAttr::MaxThreadDimensions)?;
        serde_json::from_str(&json).map_err(|e| {
            FfiError::native(format!("malformed max_thread_dimensions {:?}: {}", json, e))
        })
    }

    pub fn api_version(&self) -> Result<i64> {
        self.int_attr(DeviceAttr::ApiVersion)
    }

    pub fn driver_version(&self) -> Result<String> {
        self.str_attr(DeviceAttr::DriverVersion)
    }
}

fn unexpected(attr: DeviceAttr, value: &HostValue) -> FfiError {
    FfiError::native(format!(
        "device attribute {:?} returned unexpected {}",
        attr,
        value.type_name()
    ))
    .with_function(GET_DEVICE_ATTR)
}
