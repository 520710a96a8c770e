use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const VERSION_KEY: &str = "Version";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize config value: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Debug, Default)]
struct Layers {
    defaults: Mapping,
    values: Mapping,
}

impl Layers {
    fn lookup(&self, key: &str) -> Option<&Value> {
        lookup_path(&self.values, key).or_else(|| lookup_path(&self.defaults, key))
    }

    fn merged(&self) -> Mapping {
        let mut merged = self.defaults.clone();
        merge_into(&mut merged, &self.values);
        merged
    }
}

/// A YAML key-value document backed by a file.
///
/// Keys are dot-separated paths into nested mappings (`Greeter.Times`).
/// Values set explicitly or read from the file shadow the defaults; writing
/// persists both layers.
#[derive(Debug)]
pub struct ConfigDocument {
    path: PathBuf,
    layers: RwLock<Layers>,
}

impl ConfigDocument {
    /// Document without a file behind it until [`ConfigDocument::write`].
    pub fn in_memory(path: impl Into<PathBuf>, defaults: &Mapping) -> Self {
        let document = Self {
            path: path.into(),
            layers: RwLock::new(Layers::default()),
        };
        document.apply_defaults(defaults);
        document
    }

    /// Open the document at `path`, seeding it with `defaults`.
    ///
    /// A missing file is created from the defaults. Read, parse and write
    /// failures are logged; the document then keeps working in memory.
    pub fn open(path: impl Into<PathBuf>, defaults: &Mapping) -> Self {
        let document = Self::in_memory(path, defaults);

        if document.path.exists() {
            if let Err(e) = document.reload() {
                warn!("{e}, using defaults");
                return document;
            }
            document.upgrade_version();
        } else if let Err(e) = document.write() {
            warn!("{e}");
        }
        document
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, replacing every non-default value.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed; the document
    /// is left untouched in that case.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let contents = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;

        let values = if contents.trim().is_empty() {
            Mapping::new()
        } else {
            serde_yaml::from_str::<Mapping>(&contents).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?
        };

        self.layers.write().values = values;
        Ok(())
    }

    /// Persist defaults and values to the file.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn write(&self) -> Result<(), ConfigError> {
        let contents = serde_yaml::to_string(&self.layers.read().merged())?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;
        }
        fs::write(&self.path, contents).map_err(|source| ConfigError::Write {
            path: self.path.clone(),
            source,
        })
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.layers.read().lookup(key).cloned()
    }

    /// Deserialize the value at `key` into `T`.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_yaml::from_value(value).ok())
    }

    #[must_use]
    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Sequence(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `key` holds a value in either layer.
    #[must_use]
    pub fn is_set(&self, key: &str) -> bool {
        self.layers.read().lookup(key).is_some()
    }

    /// Every leaf key, dot-joined and sorted.
    #[must_use]
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        collect_keys(&self.layers.read().merged(), "", &mut keys);
        keys.sort();
        keys
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        insert_path(&mut self.layers.write().values, key, value.into());
    }

    /// Serialize `value` and store it at `key`.
    ///
    /// # Errors
    /// Returns an error if `value` cannot be represented as YAML.
    pub fn set_serialized<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let value = serde_yaml::to_value(value)?;
        self.set(key, value);
        Ok(())
    }

    pub fn set_default(&self, key: &str, value: impl Into<Value>) {
        insert_path(&mut self.layers.write().defaults, key, value.into());
    }

    /// [`ConfigDocument::set`] followed by [`ConfigDocument::write`].
    ///
    /// # Errors
    /// Returns an error if the write fails; the value stays set in memory.
    pub fn set_and_write(&self, key: &str, value: impl Into<Value>) -> Result<(), ConfigError> {
        self.set(key, value);
        self.write()
    }

    fn apply_defaults(&self, defaults: &Mapping) {
        for (key, value) in defaults {
            match key {
                Value::String(key) => self.set_default(key, value.clone()),
                other => {
                    self.layers
                        .write()
                        .defaults
                        .insert(other.clone(), value.clone());
                }
            }
        }
    }

    /// Raise the file's `Version` to the default one when it is lower.
    fn upgrade_version(&self) {
        let upgrade = {
            let layers = self.layers.read();
            let wanted = lookup_path(&layers.defaults, VERSION_KEY).and_then(Value::as_str);
            let found = lookup_path(&layers.values, VERSION_KEY).and_then(Value::as_str);
            match (wanted, found) {
                (Some(wanted), Some(found)) if found < wanted => {
                    Some((found.to_string(), wanted.to_string()))
                }
                (Some(wanted), None) => Some((String::new(), wanted.to_string())),
                _ => None,
            }
        };

        if let Some((from, to)) = upgrade {
            info!(
                "Upgrading config file {} from version [{from}] to [{to}]",
                self.path.display()
            );
            if let Err(e) = self.set_and_write(VERSION_KEY, to) {
                warn!("{e}");
            }
        }
    }
}

fn lookup_path<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    let mut segments = key.split('.');
    let mut current = map.get(segments.next()?)?;
    for segment in segments {
        current = current.as_mapping()?.get(segment)?;
    }
    Some(current)
}

fn insert_path(map: &mut Mapping, key: &str, value: Value) {
    let mut current = map;
    let mut segments = key.split('.').peekable();
    while let Some(segment) = segments.next() {
        let slot = Value::from(segment);
        if segments.peek().is_none() {
            current.insert(slot, value);
            return;
        }

        let child = current
            .entry(slot)
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if !child.is_mapping() {
            *child = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(next) = child else {
            return;
        };
        current = next;
    }
}

/// Overlay `top` onto `base`, recursing into mappings present in both.
fn merge_into(base: &mut Mapping, top: &Mapping) {
    for (key, value) in top {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(overlay)) => {
                merge_into(existing, overlay);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn collect_keys(map: &Mapping, prefix: &str, keys: &mut Vec<String>) {
    for (key, value) in map {
        let key = match key {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Mapping(child) if !child.is_empty() => collect_keys(child, &path, keys),
            _ => keys.push(path),
        }
    }
}
