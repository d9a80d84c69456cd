//! Boundary configuration (`.ostarrc` / `.ostarrc.toml`)

use crate::error::{FfiError, Result};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FfiConfig {
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub containers: ContainerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Explicit library file; skips directory search when set
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub search_paths: Vec<PathBuf>,

    /// Prefer the runtime-only library over the full compiler library
    #[serde(default = "default_false")]
    pub use_runtime_lib: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Skip object classes whose type key the runtime does not know
    #[serde(default = "default_false")]
    pub skip_unknown_objects: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_array_constructor")]
    pub array_constructor: String,

    #[serde(default = "default_map_constructor")]
    pub map_constructor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default = "default_false")]
    pub spans: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            path: None,
            search_paths: Vec::new(),
            use_runtime_lib: false,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { skip_unknown_objects: false }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            array_constructor: default_array_constructor(),
            map_constructor: default_map_constructor(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            json: false,
            spans: false,
        }
    }
}

fn default_false() -> bool { false }
fn default_level() -> String { "info".to_string() }
fn default_array_constructor() -> String { "runtime.Array".to_string() }
fn default_map_constructor() -> String { "runtime.Map".to_string() }

impl LoggingConfig {
    pub fn to_log_config(&self) -> LogConfig {
        let mut config = LogConfig::default();
        config.level = LogConfig::parse_level(&self.level);
        if let Some(path) = &self.file {
            config.file_output = true;
            config.log_path = Some(path.clone());
        }
        config.json_format = self.json;
        config.show_spans = self.spans;
        config
    }
}

impl FfiConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| FfiError::config(format!("Failed to read {}: {}", path.display(), e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FfiError::config(format!("Failed to parse config: {}", e)))
    }

    /// Find configuration in the current directory or its parents, then
    /// apply environment overrides
    pub fn discover() -> Self {
        let start = std::env::current_dir().ok();
        let mut config = start.as_deref().and_then(Self::discover_from).unwrap_or_default();
        config.apply_env();
        config
    }

    /// Nearest readable config file at or above `dir`
    pub fn discover_from(dir: &Path) -> Option<Self> {
        let mut current = Some(dir);

        while let Some(dir) = current {
            for name in [".ostarrc", ".ostarrc.toml"] {
                let config_path = dir.join(name);
                if config_path.exists() {
                    if let Ok(config) = Self::load(&config_path) {
                        return Some(config);
                    }
                }
            }
            current = dir.parent();
        }

        None
    }

    /// `OSTAR_LIBRARY_PATH` and `OSTAR_USE_RUNTIME_LIB` win over file settings
    pub fn apply_env(&mut self) {
        if let Some(paths) = std::env::var_os("OSTAR_LIBRARY_PATH") {
            let mut extra: Vec<PathBuf> = std::env::split_paths(&paths).collect();
            extra.retain(|p| !p.as_os_str().is_empty());
            extra.append(&mut self.library.search_paths);
            self.library.search_paths = extra;
        }

        if let Ok(val) = std::env::var("OSTAR_USE_RUNTIME_LIB") {
            self.library.use_runtime_lib = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }
}
