//! Error types for the packed-call boundary
//!
//! Every failure is synchronous and reported to the immediate caller.
//! Bridged callback failures additionally land in a thread-local
//! last-error slot so the native side can re-raise them.

use crate::interop::TypeTag;
use std::cell::RefCell;
use std::fmt;

/// Broad error category, matching the host-language exception kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The value cannot cross the boundary at all
    Type,
    /// The value has the right kind but the wrong content or state
    Value,
    /// The native side reported a failure
    Runtime,
    /// Host and native binaries disagree on the ABI; no recovery
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedArgument { type_name: String },
    Native { message: String },
    CapsuleConsumed,
    InvalidDataType { input: String, reason: String },
    MultipleReturnValues,
    GlobalFuncNotFound { name: String },
    UnknownDeviceKind { name: String },
    UnknownTypeTag { tag: i32 },
    InvalidExtensionTag { tag: i32, reason: String },
    UnexpectedReturnTag { expected: TypeTag, found: TypeTag },
    Library { message: String },
    Config { message: String },
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedArgument { .. } => ErrorCategory::Type,
            Self::CapsuleConsumed
            | Self::InvalidDataType { .. }
            | Self::MultipleReturnValues
            | Self::GlobalFuncNotFound { .. }
            | Self::UnknownDeviceKind { .. }
            | Self::InvalidExtensionTag { .. }
            | Self::Config { .. } => ErrorCategory::Value,
            Self::Native { .. } | Self::UnexpectedReturnTag { .. } | Self::Library { .. } => {
                ErrorCategory::Runtime
            }
            Self::UnknownTypeTag { .. } => ErrorCategory::Fatal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedArgument { type_name } => {
                write!(f, "Don't know how to handle type {}", type_name)
            }
            Self::Native { message } => write!(f, "{}", message),
            Self::CapsuleConsumed => {
                write!(f, "Expect a dltensor field, capsule can only be consumed once")
            }
            Self::InvalidDataType { input, reason } => {
                write!(f, "Invalid data type '{}': {}", input, reason)
            }
            Self::MultipleReturnValues => {
                write!(f, "PackedFunction can only support one return value")
            }
            Self::GlobalFuncNotFound { name } => {
                write!(f, "Cannot find global function {}", name)
            }
            Self::UnknownDeviceKind { name } => write!(f, "Unknown device kind {}", name),
            Self::UnknownTypeTag { tag } => {
                write!(f, "Unknown type tag {} (host/native ABI mismatch)", tag)
            }
            Self::InvalidExtensionTag { tag, reason } => {
                write!(f, "Cannot register extension tag {}: {}", tag, reason)
            }
            Self::UnexpectedReturnTag { expected, found } => {
                write!(f, "Expected return tag {}, found {}", expected, found)
            }
            Self::Library { message } => write!(f, "Library error: {}", message),
            Self::Config { message } => write!(f, "Config error: {}", message),
        }
    }
}

/// Error raised by any boundary operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfiError {
    pub kind: ErrorKind,
    /// Packed function or entry point being called, when known
    pub function: Option<String>,
}

impl FfiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, function: None }
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn unsupported(type_name: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedArgument { type_name: type_name.into() })
    }

    pub fn native(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Native { message: message.into() })
    }

    pub fn invalid_dtype(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidDataType {
            input: input.into(),
            reason: reason.into(),
        })
    }

    pub fn unknown_tag(tag: i32) -> Self {
        Self::new(ErrorKind::UnknownTypeTag { tag })
    }

    pub fn library(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Library { message: message.into() })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config { message: message.into() })
    }

    /// Message text without the function prefix
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl fmt::Display for FfiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(function) = &self.function {
            write!(f, "{}: ", function)?;
        }
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for FfiError {}

/// Failure reported by a native entry point (nonzero status)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeError {
    pub message: String,
}

impl NativeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for NativeError {}

impl From<NativeError> for FfiError {
    fn from(err: NativeError) -> Self {
        Self::native(err.message)
    }
}

pub type Result<T, E = FfiError> = std::result::Result<T, E>;
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Error type returned by host closures exposed through the bridge
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Diagnostic recorded by the most recent failed callback on this thread
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

pub(crate) fn set_last_error(message: String) {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|slot| slot.borrow_mut().take());
}
