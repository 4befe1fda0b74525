//! Sizing of the loopback image.
//!
//! Content estimates are deliberately upper bounds (shared extents get counted once per
//! subvolume): running out of space half-way through a receive is a hard failure, while a few
//! wasted megabytes are not.

use crate::{
    error::{PackageError, Result},
    subvol::SubvolumeSource,
};

pub const MIB: u64 = 1 << 20;

/// Deployment-supplied lower bounds for a btrfs loopback image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeLimits {
    /// `mkfs.btrfs` refuses to create anything smaller.
    pub min_create_bytes: u64,
    /// Headroom btrfs needs for metadata on top of the content itself.
    pub min_free_bytes: u64,
}

impl Default for SizeLimits {
    fn default() -> Self {
        SizeLimits {
            // ERROR: minimum size for a btrfs filesystem is 114294784
            min_create_bytes: 109 * MIB,
            min_free_bytes: 81 * MIB,
        }
    }
}

/// The inputs to a sizing decision, plus the derived target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBudget {
    pub estimated_content_bytes: u64,
    pub minimum_free_bytes: u64,
    pub minimum_creation_bytes: u64,
    pub requested_bytes: Option<u64>,
}

impl SizeBudget {
    /// The size the image will be created with.
    pub fn target_bytes(&self) -> Result<u64> {
        target_size(
            self.estimated_content_bytes,
            self.minimum_free_bytes,
            self.minimum_creation_bytes,
            self.requested_bytes,
        )
    }
}

fn too_large(what: &str) -> PackageError {
    PackageError::validation(format!("{what} does not fit in 64 bits"))
}

/// Converts a size given in MiB to bytes.
pub fn mib_to_bytes(mib: u64) -> Result<u64> {
    mib.checked_mul(MIB)
        .ok_or_else(|| too_large(&format!("size of {mib} MiB")))
}

/// Sums the content estimates of all sources.
pub fn estimate<'a, S>(sources: impl IntoIterator<Item = &'a S>) -> Result<u64>
where
    S: SubvolumeSource + ?Sized + 'a,
{
    let mut total: u64 = 0;
    for source in sources {
        total = total
            .checked_add(source.estimate_content_bytes()?)
            .ok_or_else(|| too_large("combined content estimate"))?;
    }
    Ok(total)
}

/// `max(estimate + min_free, min_create)`, or `requested` if that is at least as big.
pub fn target_size(
    estimate: u64,
    min_free: u64,
    min_create: u64,
    requested: Option<u64>,
) -> Result<u64> {
    let minimum = estimate
        .checked_add(min_free)
        .ok_or_else(|| too_large("estimate plus free space"))?
        .max(min_create);
    match requested {
        Some(requested) if requested < minimum => Err(PackageError::validation(format!(
            "Unable to package subvol of {minimum} bytes into requested loopback size of \
             {requested} bytes"
        ))),
        Some(requested) => Ok(requested),
        None => Ok(minimum),
    }
}
