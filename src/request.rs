//! What to package, and the checks a request must pass before anything privileged happens.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use crate::{
    error::{PackageError, Result},
    plan::placement_order,
    subvol::SubvolumeSource,
};

/// Highest zstd level btrfs accepts.
pub const MAX_COMPRESSION_LEVEL: u32 = 15;
/// btrfs labels are at most 255 bytes.
pub const MAX_LABEL_BYTES: usize = 255;

/// One subvolume to place in the image.
#[derive(Debug, Clone)]
pub struct SubvolumeSpec {
    /// Absolute in-image path.
    pub path: PathBuf,
    pub source: Arc<dyn SubvolumeSource>,
    /// Leave the subvolume read-write in the final image.
    pub writable: bool,
}

impl SubvolumeSpec {
    pub fn new(path: impl Into<PathBuf>, source: Arc<dyn SubvolumeSource>) -> Self {
        SubvolumeSpec {
            path: path.into(),
            source,
            writable: false,
        }
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Where `btrfs receive` creates the subvolume, relative to the image root.
    pub(crate) fn landing_path(&self) -> PathBuf {
        let mut landing = PathBuf::from("/");
        if let Some(name) = self.source.path().file_name() {
            landing.push(name);
        }
        landing
    }
}

#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub output_path: PathBuf,
    pub subvols: HashMap<PathBuf, SubvolumeSpec>,
    pub default_path: Option<PathBuf>,
    pub label: Option<String>,
    pub compression_level: u32,
    pub seed_device: bool,
    pub size_mb: Option<u64>,
}

impl PackageRequest {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        PackageRequest {
            output_path: output_path.into(),
            subvols: HashMap::new(),
            default_path: None,
            label: None,
            compression_level: 0,
            seed_device: false,
            size_mb: None,
        }
    }

    /// Adds a subvolume, keyed by its in-image path.
    pub fn subvol(mut self, spec: SubvolumeSpec) -> Self {
        self.subvols.insert(spec.path.clone(), spec);
        self
    }

    pub fn default_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_path = Some(path.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    pub fn seed_device(mut self, seed_device: bool) -> Self {
        self.seed_device = seed_device;
        self
    }

    pub fn size_mb(mut self, size_mb: u64) -> Self {
        self.size_mb = Some(size_mb);
        self
    }

    /// The keys in the order they get placed.
    pub fn placement_order(&self) -> Vec<PathBuf> {
        placement_order(self.subvols.keys().map(PathBuf::as_path))
    }

    /// Checks everything that can be checked without touching the system.
    pub fn validate(&self) -> Result<()> {
        if self.subvols.is_empty() {
            return Err(PackageError::validation("no subvolumes to package"));
        }

        if let Some(default) = &self.default_path {
            if !default.is_absolute() {
                return Err(PackageError::validation(format!(
                    "Requested default: '{}' must be an absolute path.",
                    default.display()
                )));
            }
            if !self.subvols.contains_key(default) {
                let mut keys: Vec<_> = self.subvols.keys().map(|k| k.display().to_string()).collect();
                keys.sort();
                return Err(PackageError::validation(format!(
                    "Requested default: '{}' is not a subvol being packaged: {keys:?}",
                    default.display()
                )));
            }
        }

        for (key, spec) in &self.subvols {
            validate_key(key)?;
            if *key != spec.path {
                return Err(PackageError::validation(format!(
                    "subvol keyed as '{}' claims path '{}'",
                    key.display(),
                    spec.path.display()
                )));
            }
        }

        if self.compression_level > MAX_COMPRESSION_LEVEL {
            return Err(PackageError::validation(format!(
                "compression level {} is out of range 0..={MAX_COMPRESSION_LEVEL}",
                self.compression_level
            )));
        }

        if let Some(label) = &self.label {
            if label.len() > MAX_LABEL_BYTES {
                return Err(PackageError::validation(format!(
                    "label is {} bytes, btrfs allows at most {MAX_LABEL_BYTES}",
                    label.len()
                )));
            }
        }

        self.validate_landings()
    }

    /// Every subvolume is received at `/<source basename>` before it is moved into place.  That
    /// spot must not be taken by anything placed before it.
    fn validate_landings(&self) -> Result<()> {
        let order = self.placement_order();
        for (i, key) in order.iter().enumerate() {
            let landing = self.subvols[key].landing_path();
            if *key != landing && key.starts_with(&landing) {
                return Err(PackageError::validation(format!(
                    "'{}' would have to be moved into itself from '{}'",
                    key.display(),
                    landing.display()
                )));
            }
            if let Some(earlier) = order[..i].iter().find(|p| p.starts_with(&landing)) {
                return Err(PackageError::validation(format!(
                    "'{}' is received at '{}', which is already occupied by '{}'",
                    key.display(),
                    landing.display(),
                    earlier.display()
                )));
            }
        }
        Ok(())
    }
}

/// In-image paths must be absolute, normalized and not the image root itself.
fn validate_key(key: &Path) -> Result<()> {
    if !key.is_absolute() {
        return Err(PackageError::validation(format!(
            "Requested subvol name must be an absolute path: {}",
            key.display()
        )));
    }
    if key
        .components()
        .any(|c| matches!(c, Component::CurDir | Component::ParentDir))
    {
        return Err(PackageError::validation(format!(
            "Requested subvol name must be normalized: {}",
            key.display()
        )));
    }
    if key.file_name().is_none() {
        return Err(PackageError::validation(
            "Requested subvol name cannot be the image root",
        ));
    }
    Ok(())
}
