use libloading::{Library, Symbol};
use std::env::consts::DLL_EXTENSION;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::api::{
    PluginDeclaration, UserPlugin, HOST_API_VERSION, PLUGIN_ABI_VERSION, PLUGIN_SYMBOL,
};
use crate::fault::catch_fault;

/// Why a module could not become a plugin record.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Plugin file {} is not found", path.display())]
    NotFound { path: PathBuf },

    #[error("Plugin file {} isn't a valid native module: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Plugin file {} doesn't export a plugin declaration: {source}", path.display())]
    MissingSymbol {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error(
        "Plugin file {} was built for ABI {found_abi} (oasis {found_api}), host expects ABI {} (oasis {})",
        path.display(),
        PLUGIN_ABI_VERSION,
        HOST_API_VERSION
    )]
    AbiMismatch {
        path: PathBuf,
        found_abi: u32,
        found_api: String,
    },

    #[error("Plugin constructor in {} panicked: {message}", path.display())]
    ConstructorPanicked { path: PathBuf, message: String },

    #[error("Plugin {module} panicked while describing itself: {message}")]
    DescriptorPanicked { module: String, message: String },

    #[error("Plugin {module} has an empty name")]
    EmptyName { module: String },

    #[error("Plugin {name} has already been registered")]
    Duplicate { name: String },
}

/// A plugin instance together with the library that provides its code.
pub struct PluginModule {
    // Declared before `library` so the plugin is dropped while its code is
    // still mapped.
    pub(super) plugin: Box<dyn UserPlugin>,
    pub(super) source: Option<PathBuf>,
    pub(super) library: Option<Library>,
}

impl PluginModule {
    /// Wrap a plugin compiled into the host binary.
    pub fn in_process(plugin: impl UserPlugin + 'static) -> Self {
        Self {
            plugin: Box::new(plugin),
            source: None,
            library: None,
        }
    }

    /// Open a native module and validate its declaration.
    ///
    /// # Errors
    /// Returns an error if the file is missing, cannot be loaded, lacks the
    /// plugin symbol, was built against a different ABI, or its constructor
    /// panics.
    pub fn open(path: &Path) -> Result<Self, DiscoveryError> {
        if !path.is_file() {
            return Err(DiscoveryError::NotFound {
                path: path.to_path_buf(),
            });
        }

        // Safety: loading a library runs its initialisers. Plugins are
        // trusted native code placed in the plugin directory by the operator.
        let library = unsafe { Library::new(path) }.map_err(|source| DiscoveryError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        // Safety: the symbol is the address of a `PluginDeclaration` static
        // emitted by `declare_plugin!`; only `abi_version` is trusted until
        // the versions have been checked.
        let declaration = unsafe {
            let symbol: Symbol<*const PluginDeclaration> =
                library
                    .get(PLUGIN_SYMBOL)
                    .map_err(|source| DiscoveryError::MissingSymbol {
                        path: path.to_path_buf(),
                        source,
                    })?;
            let pointer = *symbol;
            if pointer.is_null() {
                return Err(DiscoveryError::AbiMismatch {
                    path: path.to_path_buf(),
                    found_abi: 0,
                    found_api: String::new(),
                });
            }
            let abi_version = std::ptr::addr_of!((*pointer).abi_version).read();
            if abi_version != PLUGIN_ABI_VERSION {
                return Err(DiscoveryError::AbiMismatch {
                    path: path.to_path_buf(),
                    found_abi: abi_version,
                    found_api: String::from("?"),
                });
            }
            pointer.read()
        };

        if declaration.host_version != HOST_API_VERSION {
            return Err(DiscoveryError::AbiMismatch {
                path: path.to_path_buf(),
                found_abi: declaration.abi_version,
                found_api: declaration.host_version.to_string(),
            });
        }

        let plugin = catch_fault(declaration.create).map_err(|message| {
            DiscoveryError::ConstructorPanicked {
                path: path.to_path_buf(),
                message,
            }
        })?;

        Ok(Self {
            plugin,
            source: Some(path.to_path_buf()),
            library: Some(library),
        })
    }

    /// File the module was loaded from, `None` for in-process plugins.
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub(super) fn label(&self) -> String {
        self.source
            .as_ref()
            .map_or_else(|| "<in-process>".to_string(), |p| p.display().to_string())
    }
}

/// Append the platform's library extension to `name` unless present.
#[must_use]
pub fn module_file_name(name: &str) -> String {
    let suffix = format!(".{DLL_EXTENSION}");
    if name.ends_with(&suffix) {
        name.to_string()
    } else {
        format!("{name}{suffix}")
    }
}

/// Module file names directly inside `dir`, sorted.
///
/// # Errors
/// Returns an error if the directory cannot be read.
pub fn scan_directory(dir: &Path) -> io::Result<Vec<String>> {
    let mut modules = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some(DLL_EXTENSION) {
            if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                modules.push(name.to_string());
            }
        }
    }

    modules.sort();
    Ok(modules)
}
