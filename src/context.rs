//! Boundary context - frozen registries shared by every call
//!
//! Design: registration is an explicit phase. A [`ContextBuilder`]
//! collects object classes, ndarray classes and extension types; `build`
//! freezes them into an immutable [`Context`] handed out as `Arc`, so
//! marshaling and decoding read the tables without locking.

use crate::config::FfiConfig;
use crate::error::{ErrorKind, FfiError, Result};
use crate::ffi::{GenericObject, NDArray, NativeApi, Object, ObjectProxy};
use crate::interop::{CustomTypeResolver, DataType, ExtensionDecoder, HostValue, TypeTag};
use crate::logging::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Builds a host proxy around an object of the given runtime type index
pub type ProxyCtor = fn(Object, u32) -> Box<dyn ObjectProxy>;

/// Converts an object straight into a host-native value
pub type NativeCtor = fn(Object) -> Result<HostValue>;

/// Wraps an owned array of a registered array subclass
pub type NDArrayCtor = fn(NDArray) -> HostValue;

/// How a decoded object of a registered type index becomes a host value
#[derive(Clone, Copy)]
pub enum ClassStrategy {
    /// Host proxy that keeps the object handle
    Proxy(ProxyCtor),
    /// Host-native value (string, integer) built from the object
    Native(NativeCtor),
}

impl std::fmt::Debug for ClassStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proxy(_) => f.write_str("Proxy"),
            Self::Native(_) => f.write_str("Native"),
        }
    }
}

/// Third-party value kind bound to an extension tag
#[derive(Clone)]
pub struct ExtensionType {
    pub name: String,
    pub tag: TypeTag,
    pub decode: ExtensionDecoder,
}

impl std::fmt::Debug for ExtensionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionType")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .finish()
    }
}

/// Registration phase
pub struct ContextBuilder {
    api: Arc<dyn NativeApi>,
    config: FfiConfig,
    object_classes: HashMap<u32, ClassStrategy>,
    ndarray_classes: HashMap<u32, NDArrayCtor>,
    extensions: HashMap<TypeTag, ExtensionType>,
}

impl ContextBuilder {
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        Self {
            api,
            config: FfiConfig::default(),
            object_classes: HashMap::new(),
            ndarray_classes: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    pub fn config(mut self, config: FfiConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind a class to a runtime type index; the last registration wins
    pub fn register_object(&mut self, type_index: u32, strategy: ClassStrategy) -> &mut Self {
        if self.object_classes.insert(type_index, strategy).is_some() {
            debug!(type_index, "object class replaced");
        }
        self
    }

    /// Bind a class by its runtime type key
    ///
    /// With `registry.skip_unknown_objects` set, a key the runtime cannot
    /// resolve is skipped instead of failing.
    pub fn register_object_key(&mut self, type_key: &str, strategy: ClassStrategy) -> Result<&mut Self> {
        match self.api.object_type_key_to_index(type_key) {
            Ok(index) => Ok(self.register_object(index, strategy)),
            Err(err) if self.config.registry.skip_unknown_objects => {
                warn!(type_key, error = %err, "unknown object type key skipped");
                Ok(self)
            }
            Err(err) => Err(FfiError::from(err).with_function(type_key)),
        }
    }

    /// Bind an ndarray subclass to a runtime array type index
    pub fn register_ndarray(&mut self, type_index: u32, ctor: NDArrayCtor) -> &mut Self {
        self.ndarray_classes.insert(type_index, ctor);
        self
    }

    /// Reserve `tag` for an extension type
    ///
    /// Tags below [`TypeTag::EXT_BEGIN`] are reserved and a tag can be
    /// claimed only once.
    pub fn register_extension(
        &mut self,
        name: impl Into<String>,
        tag: TypeTag,
        decode: ExtensionDecoder,
    ) -> Result<&mut Self> {
        let name = name.into();
        if !tag.is_extension() {
            return Err(FfiError::new(ErrorKind::InvalidExtensionTag {
                tag: tag.code(),
                reason: format!("tags below {} are reserved", TypeTag::EXT_BEGIN.code()),
            }));
        }
        if let Some(existing) = self.extensions.get(&tag) {
            return Err(FfiError::new(ErrorKind::InvalidExtensionTag {
                tag: tag.code(),
                reason: format!("already assigned to {}", existing.name),
            }));
        }
        debug!(name = %name, tag = tag.code(), "extension type registered");
        self.extensions.insert(tag, ExtensionType { name, tag, decode });
        Ok(self)
    }

    pub fn build(self) -> Arc<Context> {
        Arc::new_cyclic(|this| Context {
            this: this.clone(),
            api: self.api,
            config: self.config,
            object_classes: self.object_classes,
            ndarray_classes: self.ndarray_classes,
            extensions: self.extensions,
        })
    }
}

/// Frozen registries plus the native entry points
pub struct Context {
    this: Weak<Context>,
    api: Arc<dyn NativeApi>,
    config: FfiConfig,
    object_classes: HashMap<u32, ClassStrategy>,
    ndarray_classes: HashMap<u32, NDArrayCtor>,
    extensions: HashMap<TypeTag, ExtensionType>,
}

impl Context {
    pub fn builder(api: Arc<dyn NativeApi>) -> ContextBuilder {
        ContextBuilder::new(api)
    }

    /// Context with no registered classes
    pub fn new(api: Arc<dyn NativeApi>) -> Arc<Self> {
        ContextBuilder::new(api).build()
    }

    #[inline]
    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.api
    }

    pub fn config(&self) -> &FfiConfig {
        &self.config
    }

    /// Strong reference to this context, for callbacks that outlive a call
    pub(crate) fn shared(&self) -> Result<Arc<Context>> {
        self.this
            .upgrade()
            .ok_or_else(|| FfiError::library("context is being torn down"))
    }

    pub fn resolve_object(&self, type_index: u32) -> Option<ClassStrategy> {
        self.object_classes.get(&type_index).copied()
    }

    pub fn extension(&self, tag: TypeTag) -> Option<&ExtensionType> {
        self.extensions.get(&tag)
    }

    pub fn extension_tags(&self) -> impl Iterator<Item = TypeTag> + '_ {
        self.extensions.keys().copied()
    }

    /// Build the host value for an owned object handle
    ///
    /// The class is chosen by the runtime type index; unmapped indices fall
    /// back to [`GenericObject`].
    pub(crate) fn decode_object(&self, object: Object) -> Result<HostValue> {
        let type_index = object.type_index()?;
        match self.resolve_object(type_index) {
            Some(ClassStrategy::Proxy(ctor)) => Ok(HostValue::Object(ctor(object, type_index))),
            Some(ClassStrategy::Native(ctor)) => ctor(object),
            None => Ok(HostValue::Object(Box::new(GenericObject::new(object, type_index)))),
        }
    }

    pub(crate) fn decode_ndarray(&self, array: NDArray) -> Result<HostValue> {
        if self.ndarray_classes.is_empty() || array.is_view() {
            return Ok(HostValue::NDArray(array));
        }
        let type_index = self.api.array_type_index(array.handle())?;
        Ok(match self.ndarray_classes.get(&type_index) {
            Some(ctor) => ctor(array),
            None => HostValue::NDArray(array),
        })
    }

    /// Parse a type string, resolving `custom[...]` names through the runtime
    pub fn parse_dtype(&self, input: &str) -> Result<DataType> {
        DataType::parse_with(input, Some(self))
    }

    pub fn format_dtype(&self, dtype: DataType) -> Result<String> {
        dtype.format_with(Some(self))
    }

    fn call_resolver(&self, name: &str, arg: HostValue) -> Result<HostValue> {
        let func = self
            .get_global_func(name, false)?
            .ok_or_else(|| FfiError::new(ErrorKind::GlobalFuncNotFound { name: name.to_string() }))?;
        func.call(self, &[arg]).map_err(|e| e.with_function(name))
    }
}

impl CustomTypeResolver for Context {
    fn type_code(&self, name: &str) -> Result<u8> {
        let code = self
            .call_resolver("runtime._datatype_get_type_code", HostValue::from(name))?
            .as_int()
            .and_then(|c| u8::try_from(c).ok());
        code.ok_or_else(|| FfiError::invalid_dtype(name, "custom type code out of range"))
    }

    fn type_name(&self, code: u8) -> Result<String> {
        match self.call_resolver("runtime._datatype_get_type_name", HostValue::Int(i64::from(code)))? {
            HostValue::Str(name) => Ok(name),
            other => Err(FfiError::invalid_dtype(
                code.to_string(),
                format!("custom type name lookup returned {}", other.type_name()),
            )),
        }
    }
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("config", &self.config)
            .field("object_classes", &self.object_classes.len())
            .field("ndarray_classes", &self.ndarray_classes.len())
            .field("extensions", &self.extensions)
            .finish()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("object_classes", &self.object_classes.len())
            .field("ndarray_classes", &self.ndarray_classes.len())
            .field("extensions", &self.extensions.len())
            .finish()
    }
}
