//! Packaging a set of subvolumes into one loopback btrfs image.
//!
//! A build validates and sizes the request up front, then acquires an isolation scope and a
//! mounted loopback volume (in that order, on an explicit [`GuardStack`]), streams and places
//! every subvolume ancestors-first, seals them leaves-first, sets the default subvolume and
//! optionally shrinks the image.  The guards are unwound on every exit path, so the image is
//! unmounted and the scope closed before any error reaches the caller.

use std::{fs::File, path::PathBuf, sync::Arc};

use log::info;
use tokio::task::spawn_blocking;

use crate::{
    btrfs,
    error::Result,
    finalize,
    guard::GuardStack,
    isolate::{IsolationScope, Namespace, Sandbox},
    loopback::LoopbackVolume,
    pipeline::{self, join_error},
    place::{host_path, place},
    request::PackageRequest,
    sizing::{self, mib_to_bytes, SizeBudget, SizeLimits},
};

/// What a successful build produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReport {
    /// In-image paths, in the order they were placed.
    pub placed: Vec<PathBuf>,
    /// Final size of the image file.
    pub image_bytes: u64,
    pub default_subvol_id: Option<u64>,
}

pub struct Packager {
    sandbox: Arc<dyn Sandbox>,
    limits: SizeLimits,
}

impl std::fmt::Debug for Packager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packager")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Runs privileged tool invocations and other blocking work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f).await.map_err(join_error)?
}

impl Packager {
    pub fn new(sandbox: Arc<dyn Sandbox>) -> Self {
        Packager {
            sandbox,
            limits: SizeLimits::default(),
        }
    }

    pub fn limits(mut self, limits: SizeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Works out how big the image for `request` has to be.  Fails if an explicitly requested
    /// size is too small, or if any of the sizes involved overflow.
    pub fn budget(&self, request: &PackageRequest) -> Result<SizeBudget> {
        let estimated = sizing::estimate(request.subvols.values().map(|s| s.source.as_ref()))?;
        let budget = SizeBudget {
            estimated_content_bytes: estimated,
            minimum_free_bytes: self.limits.min_free_bytes,
            minimum_creation_bytes: self.limits.min_create_bytes,
            requested_bytes: request.size_mb.map(mib_to_bytes).transpose()?,
        };
        budget.target_bytes()?;
        Ok(budget)
    }

    /// Builds the image described by `request` at its output path.
    ///
    /// Nothing is touched if the request is invalid.  Once the build has started, a failure
    /// leaves whatever was written at the output path behind.
    pub async fn package(&self, request: &PackageRequest) -> Result<PackageReport> {
        request.validate()?;
        let order = request.placement_order();
        let budget = self.budget(request)?;
        let size_bytes = budget.target_bytes()?;
        info!(
            "Packaging {} subvolume(s) into {} ({size_bytes} bytes, {} estimated)",
            order.len(),
            request.output_path.display(),
            budget.estimated_content_bytes
        );

        File::create(&request.output_path)?;
        let request = Arc::new(request.clone());

        let mut guards = GuardStack::new();
        let scope = Arc::new(
            blocking({
                let sandbox = Arc::clone(&self.sandbox);
                move || sandbox.open(&[Namespace::Mount, Namespace::Pid])
            })
            .await?,
        );
        guards.push("isolation scope", {
            let scope = Arc::clone(&scope);
            move || scope.close()
        });
        let created = blocking({
            let exec = scope.executor();
            let request = Arc::clone(&request);
            move || {
                LoopbackVolume::create(
                    exec,
                    &request.output_path,
                    size_bytes,
                    request.label.as_deref(),
                    request.compression_level,
                )
            }
        })
        .await;
        let volume = match created {
            Ok(volume) => Arc::new(volume),
            Err(e) => {
                blocking(move || guards.unwind()).await.ok();
                return Err(e);
            }
        };
        guards.push("loopback volume", {
            let volume = Arc::clone(&volume);
            move || volume.release()
        });

        let populated = populate(&request, &order, &scope, &volume, &budget, size_bytes).await;
        let released = blocking(move || guards.unwind()).await;
        let (default_subvol_id, image_bytes) = populated?;
        released?;

        if request.seed_device {
            info!("Marking {} as a seed device", request.output_path.display());
            let host = self.sandbox.host();
            let output = request.output_path.clone();
            blocking(move || btrfs::mark_seed_device(host.as_ref(), &output)).await?;
        }

        info!(
            "Packaged {} ({image_bytes} bytes)",
            request.output_path.display()
        );
        Ok(PackageReport {
            placed: order,
            image_bytes,
            default_subvol_id,
        })
    }
}

/// Everything that happens while the image is mounted.  Returns the default subvolume id and the
/// final image size.
async fn populate(
    request: &Arc<PackageRequest>,
    order: &[PathBuf],
    scope: &Arc<IsolationScope>,
    volume: &Arc<LoopbackVolume>,
    budget: &SizeBudget,
    allocated: u64,
) -> Result<(Option<u64>, u64)> {
    for path in order {
        let spec = &request.subvols[path];
        pipeline::transfer(
            &spec.source,
            volume,
            budget.estimated_content_bytes,
            allocated,
        )
        .await?;
        let scope = Arc::clone(scope);
        let volume = Arc::clone(volume);
        let landing = spec.landing_path();
        let target = path.clone();
        blocking(move || {
            let mount_dir = volume.mount_dir();
            // receive leaves it writable, but we are about to move things under it
            scope.set_readonly(&host_path(mount_dir, &landing), false)?;
            place(&scope, mount_dir, &landing, &target)
        })
        .await?;
    }

    let request = Arc::clone(request);
    let order = order.to_vec();
    let scope = Arc::clone(scope);
    let volume = Arc::clone(volume);
    blocking(move || finish(&request, &order, &scope, &volume, allocated)).await
}

/// Seals, sets the default subvolume and shrinks the image unless a size was asked for.
fn finish(
    request: &PackageRequest,
    order: &[PathBuf],
    scope: &IsolationScope,
    volume: &LoopbackVolume,
    allocated: u64,
) -> Result<(Option<u64>, u64)> {
    let mount_dir = volume.mount_dir();
    finalize::seal(scope, mount_dir, request, order)?;

    let default_subvol_id = match &request.default_path {
        Some(default) => Some(finalize::set_default(scope, mount_dir, default)?),
        None => None,
    };

    let image_bytes = match request.size_mb {
        Some(_) => allocated,
        None => volume.minimize_size()?,
    };
    Ok((default_subvol_id, image_bytes))
}
