//! The JSON document describing a package, as accepted on the command line.

use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{
    error::{PackageError, Result},
    exec::PrivilegedExecutor,
    request::{PackageRequest, SubvolumeSpec},
    subvol::HostSubvolume,
};

/// One entry of `subvols`: which host subvolume goes to the keyed in-image path.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubvolOpts {
    pub path: PathBuf,
    #[serde(default)]
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageOpts {
    pub subvols: BTreeMap<PathBuf, SubvolOpts>,
    #[serde(default)]
    pub default_subvol: Option<PathBuf>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub compression_level: u32,
    #[serde(default)]
    pub seed_device: bool,
    #[serde(default)]
    pub size_mb: Option<u64>,
}

impl std::str::FromStr for PackageOpts {
    type Err = PackageError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| PackageError::validation(format!("malformed package options: {e}")))
    }
}

impl PackageOpts {
    /// Opens every host subvolume and assembles the request.  `exec` is used for the commands
    /// run against the sources (size estimates, `btrfs send`).
    pub fn into_request(
        self,
        output_path: impl Into<PathBuf>,
        exec: Arc<dyn PrivilegedExecutor>,
    ) -> Result<PackageRequest> {
        let mut request = PackageRequest::new(output_path)
            .compression_level(self.compression_level)
            .seed_device(self.seed_device);
        if let Some(label) = self.label {
            request = request.label(label);
        }
        if let Some(default) = self.default_subvol {
            request = request.default_path(default);
        }
        if let Some(size_mb) = self.size_mb {
            request = request.size_mb(size_mb);
        }
        for (path, subvol) in self.subvols {
            let source = HostSubvolume::open(&subvol.path, Arc::clone(&exec))?;
            request = request
                .subvol(SubvolumeSpec::new(path, Arc::new(source)).writable(subvol.writable));
        }
        Ok(request)
    }
}
