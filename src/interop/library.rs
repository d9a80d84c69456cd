//! Dynamic library loading and symbol resolution
//!
//! Platform-agnostic wrapper around dlopen/LoadLibrary.

use core::ffi::c_void;
use core::ptr::NonNull;
use std::ffi::CString;
use std::path::Path;

/// Handle to dynamically loaded library
pub struct Library {
    handle: NonNull<c_void>,
}

impl Library {
    /// Load library from a path (or a bare name searched by the OS loader)
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        Self::load_impl(path.as_ref())
    }

    #[cfg(unix)]
    fn load_impl(path: &Path) -> Result<Self, LoadError> {
        use std::os::unix::ffi::OsStrExt;

        let cname = CString::new(path.as_os_str().as_bytes()).map_err(|_| LoadError::InvalidName)?;

        unsafe {
            // RTLD_GLOBAL so extension libraries can resolve runtime symbols.
            let handle = libc::dlopen(cname.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL);
            NonNull::new(handle)
                .map(|h| Self { handle: h })
                .ok_or_else(|| {
                    let err = libc::dlerror();
                    let msg = if !err.is_null() {
                        std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
                    } else {
                        "Unknown error".into()
                    };
                    LoadError::LoadFailed(msg)
                })
        }
    }

    #[cfg(windows)]
    fn load_impl(path: &Path) -> Result<Self, LoadError> {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::libloaderapi::LoadLibraryW;

        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();

        unsafe {
            let handle = LoadLibraryW(wide.as_ptr());
            NonNull::new(handle as *mut c_void)
                .map(|h| Self { handle: h })
                .ok_or_else(|| LoadError::LoadFailed(format!("Error code: {}", GetLastError())))
        }
    }

    /// Get function pointer by symbol name
    pub fn symbol(&self, name: &str) -> Result<*const (), SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;
        let ptr = self.symbol_impl(&cname);
        if ptr.is_null() {
            Err(SymbolError::NotFound(name.to_string()))
        } else {
            Ok(ptr)
        }
    }

    #[cfg(unix)]
    fn symbol_impl(&self, name: &CString) -> *const () {
        unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) as *const () }
    }

    #[cfg(windows)]
    fn symbol_impl(&self, name: &CString) -> *const () {
        use winapi::um::libloaderapi::GetProcAddress;

        unsafe { GetProcAddress(self.handle.as_ptr() as _, name.as_ptr()) as *const () }
    }
}

impl Drop for Library {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        use winapi::um::libloaderapi::FreeLibrary;

        unsafe {
            FreeLibrary(self.handle.as_ptr() as _);
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Library({:p})", self.handle)
    }
}

/// Library loading errors
#[derive(Debug)]
pub enum LoadError {
    InvalidName,
    LoadFailed(String),
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "Invalid library name"),
            Self::LoadFailed(msg) => write!(f, "Failed to load library: {}", msg),
        }
    }
}

impl std::error::Error for LoadError {}

/// Symbol lookup errors
#[derive(Debug)]
pub enum SymbolError {
    InvalidName,
    NotFound(String),
}

impl core::fmt::Display for SymbolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "Invalid symbol name"),
            Self::NotFound(name) => write!(f, "Symbol not found: {}", name),
        }
    }
}

impl std::error::Error for SymbolError {}

impl From<LoadError> for crate::error::FfiError {
    fn from(err: LoadError) -> Self {
        Self::library(err.to_string())
    }
}

impl From<SymbolError> for crate::error::FfiError {
    fn from(err: SymbolError) -> Self {
        Self::library(err.to_string())
    }
}
