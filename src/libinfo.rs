//! Runtime library discovery

use crate::config::FfiConfig;
use crate::error::{FfiError, Result};
use crate::logging::debug;
use std::path::PathBuf;

#[cfg(target_os = "windows")]
const LOADER_PATH_VAR: &str = "PATH";
#[cfg(target_os = "macos")]
const LOADER_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LOADER_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[cfg(target_os = "windows")]
const LIB_EXT: &str = "dll";
#[cfg(target_os = "macos")]
const LIB_EXT: &str = "dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIB_EXT: &str = "so";

fn env_paths(var: &str) -> Vec<PathBuf> {
    std::env::var_os(var)
        .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
        .unwrap_or_default()
}

/// Existing directories that may hold the runtime library, in search order
pub fn dll_directories(config: &FfiConfig) -> Vec<PathBuf> {
    let mut dirs = env_paths("OSTAR_LIBRARY_PATH");
    dirs.extend(env_paths(LOADER_PATH_VAR));
    if LOADER_PATH_VAR != "PATH" {
        dirs.extend(env_paths("PATH"));
    }
    dirs.extend(config.library.search_paths.iter().cloned());

    let mut seen = std::collections::HashSet::new();
    dirs.retain(|d| d.is_dir() && seen.insert(d.clone()));
    dirs
}

/// Candidate library file names, most specific first
pub fn library_names(use_runtime_lib: bool) -> Vec<String> {
    let prefix = if cfg!(target_os = "windows") { "" } else { "lib" };
    let runtime = format!("{}ostar_runtime.{}", prefix, LIB_EXT);
    let full = format!("{}ostar.{}", prefix, LIB_EXT);
    if use_runtime_lib {
        vec![runtime]
    } else {
        vec![full, runtime]
    }
}

/// Existing library files
///
/// An explicit `library.path` wins. With nothing found, an error listing
/// every searched path is returned unless `optional` is set.
pub fn find_lib_path(config: &FfiConfig, optional: bool) -> Result<Vec<PathBuf>> {
    let searched: Vec<PathBuf> = match &config.library.path {
        Some(path) => vec![path.clone()],
        None => {
            let names = library_names(config.library.use_runtime_lib);
            dll_directories(config)
                .iter()
                .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
                .collect()
        }
    };

    let found: Vec<PathBuf> = searched.iter().filter(|p| p.is_file()).cloned().collect();
    debug!(searched = searched.len(), found = found.len(), "library search finished");

    if found.is_empty() && !optional {
        let listing: Vec<String> = searched.iter().map(|p| p.display().to_string()).collect();
        return Err(FfiError::library(format!(
            "Cannot find the ostar library. List of candidates:\n{}",
            listing.join("\n")
        )));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_names() {
        let names = library_names(false);
        assert_eq!(names.len(), 2);
        assert!(names[0].contains("ostar."));
        assert_eq!(library_names(true).len(), 1);
        assert!(library_names(true)[0].contains("ostar_runtime"));
    }

    #[test]
    fn test_find_in_configured_dir() {
        let dir = tempfile::tempdir().unwrap();
        let name = &library_names(true)[0];
        std::fs::write(dir.path().join(name), b"").unwrap();

        let mut config = FfiConfig::default();
        config.library.use_runtime_lib = true;
        config.library.search_paths.push(dir.path().to_path_buf());

        let found = find_lib_path(&config, false).unwrap();
        assert!(found.contains(&dir.path().join(name)));
    }

    #[test]
    fn test_missing_library_lists_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = FfiConfig::default();
        config.library.path = Some(dir.path().join("nope.so"));

        let err = find_lib_path(&config, false).unwrap_err();
        assert!(err.to_string().contains("nope.so"));
        assert!(find_lib_path(&config, true).unwrap().is_empty());
    }
}
