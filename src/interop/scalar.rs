//! Scalar descriptors - DataType and Device codecs
//!
//! Both descriptors have a fixed binary layout shared with the native
//! runtime and a canonical string form (`"float32"`, `"cuda(0)"`).

use crate::error::{ErrorKind, FfiError, Result};
use std::fmt;
use std::str::FromStr;

/// Type-code field of [`DataType`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataTypeCode {
    Int = 0,
    UInt = 1,
    Float = 2,
    Handle = 3,
    BFloat = 4,
}

impl DataTypeCode {
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Int),
            1 => Some(Self::UInt),
            2 => Some(Self::Float),
            3 => Some(Self::Handle),
            4 => Some(Self::BFloat),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Float => "float",
            Self::Handle => "handle",
            Self::BFloat => "bfloat",
        }
    }
}

/// Two-way lookup for `custom[...]` type names, owned by the native side
pub trait CustomTypeResolver {
    fn type_code(&self, name: &str) -> Result<u8>;
    fn type_name(&self, code: u8) -> Result<String>;
}

/// Element type descriptor, layout-compatible with `DLDataType`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataType {
    pub code: u8,
    pub bits: u8,
    pub lanes: u16,
}

/// Canonical names checked before any parsing
const LITERALS: &[(&str, DataTypeCode, u8)] = &[
    ("bool", DataTypeCode::UInt, 1),
    ("int8", DataTypeCode::Int, 8),
    ("int16", DataTypeCode::Int, 16),
    ("int32", DataTypeCode::Int, 32),
    ("int64", DataTypeCode::Int, 64),
    ("uint8", DataTypeCode::UInt, 8),
    ("uint16", DataTypeCode::UInt, 16),
    ("uint32", DataTypeCode::UInt, 32),
    ("uint64", DataTypeCode::UInt, 64),
    ("float16", DataTypeCode::Float, 16),
    ("float32", DataTypeCode::Float, 32),
    ("float64", DataTypeCode::Float, 64),
];

impl DataType {
    #[inline]
    pub const fn new(code: DataTypeCode, bits: u8, lanes: u16) -> Self {
        Self { code: code as u8, bits, lanes }
    }

    pub const fn bool() -> Self {
        Self::new(DataTypeCode::UInt, 1, 1)
    }

    pub const fn int(bits: u8) -> Self {
        Self::new(DataTypeCode::Int, bits, 1)
    }

    pub const fn uint(bits: u8) -> Self {
        Self::new(DataTypeCode::UInt, bits, 1)
    }

    pub const fn float(bits: u8) -> Self {
        Self::new(DataTypeCode::Float, bits, 1)
    }

    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self { lanes, ..self }
    }

    /// Code is outside the built-in set (native custom-type registry)
    pub const fn is_custom(&self) -> bool {
        DataTypeCode::from_u8(self.code).is_none()
    }

    /// Literal table entries, in canonical order
    pub fn canonical_names() -> impl Iterator<Item = &'static str> {
        LITERALS.iter().map(|(name, _, _)| *name)
    }

    /// Parse a type string; custom kinds resolve through `resolver`
    ///
    /// Without a resolver only numeric custom codes (`custom[130]16`) are
    /// accepted.
    pub fn parse_with(input: &str, resolver: Option<&dyn CustomTypeResolver>) -> Result<Self> {
        if let Some((_, code, bits)) = LITERALS.iter().find(|(name, _, _)| *name == input) {
            return Ok(Self::new(*code, *bits, 1));
        }

        // Lanes follow the last 'x' outside any custom[...] brackets.
        let tail_start = input.rfind(']').map_or(0, |i| i + 1);
        let (head, lanes) = match input[tail_start..].find('x') {
            Some(pos) => {
                let split = tail_start + pos;
                let lanes = input[split + 1..]
                    .parse::<u16>()
                    .map_err(|_| FfiError::invalid_dtype(input, "bad lane count"))?;
                (&input[..split], lanes)
            }
            None => (input, 1),
        };

        let (code, digits, default_bits) = if let Some(rest) = head.strip_prefix("uint") {
            (DataTypeCode::UInt as u8, rest, 32)
        } else if let Some(rest) = head.strip_prefix("int") {
            (DataTypeCode::Int as u8, rest, 32)
        } else if let Some(rest) = head.strip_prefix("bfloat") {
            (DataTypeCode::BFloat as u8, rest, 32)
        } else if let Some(rest) = head.strip_prefix("float") {
            (DataTypeCode::Float as u8, rest, 32)
        } else if let Some(rest) = head.strip_prefix("handle") {
            (DataTypeCode::Handle as u8, rest, 64)
        } else if let Some(rest) = head.strip_prefix("custom") {
            let (low, high) = match (rest.find('['), rest.find(']')) {
                (Some(low), Some(high)) if low < high => (low, high),
                _ => {
                    return Err(FfiError::invalid_dtype(
                        input,
                        "badly formatted custom type string",
                    ))
                }
            };
            let name = &rest[low + 1..high];
            let code = match resolver {
                Some(resolver) => resolver.type_code(name)?,
                None => name.parse::<u8>().map_err(|_| {
                    FfiError::invalid_dtype(input, "custom type names need a native resolver")
                })?,
            };
            (code, &rest[high + 1..], 32)
        } else {
            return Err(FfiError::invalid_dtype(input, "do not know how to handle type"));
        };

        let bits = if digits.is_empty() {
            default_bits
        } else {
            digits
                .parse::<u8>()
                .map_err(|_| FfiError::invalid_dtype(input, "bad bit width"))?
        };

        Ok(Self { code, bits, lanes })
    }

    /// Render the canonical string; custom kinds resolve through `resolver`
    pub fn format_with(&self, resolver: Option<&dyn CustomTypeResolver>) -> Result<String> {
        if self.code == DataTypeCode::UInt as u8 && self.bits == 1 && self.lanes == 1 {
            return Ok("bool".to_string());
        }
        let type_name = match DataTypeCode::from_u8(self.code) {
            Some(code) => code.name().to_string(),
            None => match resolver {
                Some(resolver) => format!("custom[{}]", resolver.type_name(self.code)?),
                None => format!("custom[{}]", self.code),
            },
        };
        let mut out = format!("{}{}", type_name, self.bits);
        if self.lanes != 1 {
            out.push_str(&format!("x{}", self.lanes));
        }
        Ok(out)
    }

    /// Binary form packed into the low 32 bits of a wire integer
    pub const fn to_bits(self) -> u32 {
        (self.code as u32) | ((self.bits as u32) << 8) | ((self.lanes as u32) << 16)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            code: (bits & 0xff) as u8,
            bits: ((bits >> 8) & 0xff) as u8,
            lanes: (bits >> 16) as u16,
        }
    }
}

impl FromStr for DataType {
    type Err = FfiError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_with(s, None)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Infallible without a resolver.
        match self.format_with(None) {
            Ok(s) => f.write_str(&s),
            Err(_) => Err(fmt::Error),
        }
    }
}

/// Device descriptor, layout-compatible with `DLDevice`
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Device {
    pub device_type: i32,
    pub device_id: i32,
}

/// Device kinds at or above this value belong to remote sessions
pub const RPC_SESS_MASK: i32 = 128;

impl Device {
    pub const CPU: i32 = 1;
    pub const CUDA: i32 = 2;
    pub const CUDA_HOST: i32 = 3;
    pub const CUDA_MANAGED: i32 = 13;

    #[inline]
    pub const fn new(device_type: i32, device_id: i32) -> Self {
        Self { device_type, device_id }
    }

    pub const fn cpu(device_id: i32) -> Self {
        Self::new(Self::CPU, device_id)
    }

    pub const fn cuda(device_id: i32) -> Self {
        Self::new(Self::CUDA, device_id)
    }

    /// Display name of a (local) device kind
    pub const fn kind_name(device_type: i32) -> Option<&'static str> {
        match device_type {
            Self::CPU => Some("cpu"),
            Self::CUDA => Some("cuda"),
            Self::CUDA_HOST => Some("cuda_host"),
            Self::CUDA_MANAGED => Some("cuda_managed"),
            _ => None,
        }
    }

    /// Device for a target kind name (`"llvm"`, `"cuda"`, ...)
    pub fn by_name(kind: &str, device_id: i32) -> Result<Self> {
        let device_type = match kind {
            "llvm" | "stackvm" | "cpu" | "c" | "test" | "hybrid" | "composite" => Self::CPU,
            "cuda" => Self::CUDA,
            "cuda_host" => Self::CUDA_HOST,
            "cuda_managed" => Self::CUDA_MANAGED,
            _ => {
                return Err(FfiError::new(ErrorKind::UnknownDeviceKind {
                    name: kind.to_string(),
                }))
            }
        };
        Ok(Self::new(device_type, device_id))
    }

    pub const fn is_remote(&self) -> bool {
        self.device_type >= RPC_SESS_MASK
    }

    /// Bit-pack into one wire integer, native endian
    pub fn to_int64(self) -> i64 {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.device_type.to_ne_bytes());
        bytes[4..].copy_from_slice(&self.device_id.to_ne_bytes());
        i64::from_ne_bytes(bytes)
    }

    pub fn from_int64(packed: i64) -> Self {
        let bytes = packed.to_ne_bytes();
        let mut ty = [0u8; 4];
        let mut id = [0u8; 4];
        ty.copy_from_slice(&bytes[..4]);
        id.copy_from_slice(&bytes[4..]);
        Self::new(i32::from_ne_bytes(ty), i32::from_ne_bytes(id))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, kind) = if self.is_remote() {
            let table = self.device_type / RPC_SESS_MASK - 1;
            (Some(table), self.device_type % RPC_SESS_MASK)
        } else {
            (None, self.device_type)
        };
        if let Some(table) = prefix {
            write!(f, "remote[{}]:", table)?;
        }
        match Self::kind_name(kind) {
            Some(name) => write!(f, "{}({})", name, self.device_id),
            None => write!(f, "device[{}]({})", kind, self.device_id),
        }
    }
}

/// Attribute ids understood by `runtime.GetDeviceAttr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum DeviceAttr {
    Exist = 0,
    MaxThreadsPerBlock = 1,
    WarpSize = 2,
    MaxSharedMemoryPerBlock = 3,
    ComputeVersion = 4,
    DeviceName = 5,
    MaxClockRate = 6,
    MultiProcessorCount = 7,
    MaxThreadDimensions = 8,
    ApiVersion = 11,
    DriverVersion = 12,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct Registry;

    impl CustomTypeResolver for Registry {
        fn type_code(&self, name: &str) -> Result<u8> {
            match name {
                "posit" => Ok(131),
                _ => Err(FfiError::invalid_dtype(name, "unregistered")),
            }
        }

        fn type_name(&self, code: u8) -> Result<String> {
            match code {
                131 => Ok("posit".to_string()),
                _ => Err(FfiError::invalid_dtype(code.to_string(), "unregistered")),
            }
        }
    }

    #[test]
    fn test_canonical_round_trip() {
        for name in DataType::canonical_names() {
            let dtype: DataType = name.parse().unwrap();
            assert_eq!(dtype.to_string(), name);
        }
    }

    #[test]
    fn test_parse_vector_and_defaults() {
        assert_eq!("float32x4".parse::<DataType>().unwrap(), DataType::float(32).with_lanes(4));
        assert_eq!("int".parse::<DataType>().unwrap(), DataType::int(32));
        assert_eq!(
            "handle".parse::<DataType>().unwrap(),
            DataType::new(DataTypeCode::Handle, 64, 1)
        );
        assert_eq!(
            "bfloat16".parse::<DataType>().unwrap(),
            DataType::new(DataTypeCode::BFloat, 16, 1)
        );
    }

    #[test]
    fn test_bool_rendering() {
        assert_eq!(DataType::uint(1).to_string(), "bool");
        assert_eq!(DataType::uint(1).with_lanes(4).to_string(), "uint1x4");
    }

    #[test]
    fn test_single_bit_types_keep_their_code() {
        for code in [DataTypeCode::Int, DataTypeCode::Float, DataTypeCode::Handle, DataTypeCode::BFloat] {
            let dtype = DataType::new(code, 1, 1);
            let text = dtype.to_string();
            assert_ne!(text, "bool");
            assert_eq!(text.parse::<DataType>().unwrap(), dtype);
        }
        assert_eq!("int1".parse::<DataType>().unwrap().to_string(), "int1");
    }

    #[test]
    fn test_parse_errors_name_input() {
        let err = "complex64".parse::<DataType>().unwrap_err();
        assert!(err.to_string().contains("complex64"));
        assert!("int8xq".parse::<DataType>().is_err());
        assert!("customposit]8".parse::<DataType>().is_err());
    }

    #[test]
    fn test_custom_types_use_resolver() {
        let dtype = DataType::parse_with("custom[posit]16x2", Some(&Registry)).unwrap();
        assert_eq!(dtype, DataType { code: 131, bits: 16, lanes: 2 });
        assert!(dtype.is_custom());
        assert_eq!(dtype.format_with(Some(&Registry)).unwrap(), "custom[posit]16x2");
        assert_eq!(dtype.to_string(), "custom[131]16x2");
        assert_eq!("custom[131]16x2".parse::<DataType>().unwrap(), dtype);
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::new(2, 0).to_string(), "cuda(0)");
        assert_eq!(Device::cpu(3).to_string(), "cpu(3)");
        assert_eq!(Device::new(RPC_SESS_MASK + 1, 1).to_string(), "remote[0]:cpu(1)");
        assert_eq!(Device::new(2 * RPC_SESS_MASK + 2, 0).to_string(), "remote[1]:cuda(0)");
    }

    #[test]
    fn test_device_by_name() {
        assert_eq!(Device::by_name("llvm", 0).unwrap(), Device::cpu(0));
        assert_eq!(Device::by_name("cuda", 1).unwrap(), Device::cuda(1));
        assert!(Device::by_name("tpu", 0).is_err());
    }

    #[test]
    fn test_device_packing() {
        let dev = Device::new(2, 7);
        assert_eq!(Device::from_int64(dev.to_int64()), dev);
    }

    proptest! {
        #[test]
        fn prop_dtype_string_round_trip(code in 0u8..=4, bits in 1u8..=255, lanes in 1u16..=1024) {
            let dtype = DataType { code, bits, lanes };
            let parsed: DataType = dtype.to_string().parse().unwrap();
            prop_assert_eq!(parsed, dtype);
        }

        #[test]
        fn prop_dtype_bits_round_trip(code: u8, bits: u8, lanes: u16) {
            let dtype = DataType { code, bits, lanes };
            prop_assert_eq!(DataType::from_bits(dtype.to_bits()), dtype);
        }

        #[test]
        fn prop_device_pack_round_trip(ty: i32, id: i32) {
            let dev = Device::new(ty, id);
            prop_assert_eq!(Device::from_int64(dev.to_int64()), dev);
        }
    }
}
