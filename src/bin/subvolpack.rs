use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Args, Parser};

use subvolpack::{
    exec::{HostExecutor, PrivilegedExecutor},
    isolate::UnshareSandbox,
    opts::PackageOpts,
    sizing::{mib_to_bytes, SizeLimits},
    Packager,
};

/// subvolpack
#[derive(Debug, Parser)]
#[clap(name = "subvolpack", version)]
pub struct App {
    /// Where to write the image
    #[clap(long)]
    output_path: PathBuf,

    #[clap(flatten)]
    opts: OptsSource,

    /// Smallest image mkfs.btrfs will create, in MiB
    #[clap(long)]
    min_create_mib: Option<u64>,
    /// Headroom to leave on top of the estimated content, in MiB
    #[clap(long)]
    min_free_mib: Option<u64>,

    /// Never prefix privileged commands with sudo
    #[clap(long)]
    no_sudo: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct OptsSource {
    /// The package description, as JSON
    #[clap(long)]
    opts: Option<String>,
    /// A file containing the package description
    #[clap(long)]
    opts_file: Option<PathBuf>,
}

impl OptsSource {
    fn load(&self) -> Result<PackageOpts> {
        let json = match (&self.opts, &self.opts_file) {
            (Some(json), _) => json.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?,
            (None, None) => anyhow::bail!("one of --opts or --opts-file is required"),
        };
        Ok(json.parse()?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let host = if args.no_sudo {
        HostExecutor::unprefixed()
    } else {
        HostExecutor::new()
    };

    let mut limits = SizeLimits::default();
    if let Some(mib) = args.min_create_mib {
        limits.min_create_bytes = mib_to_bytes(mib).context("--min-create-mib")?;
    }
    if let Some(mib) = args.min_free_mib {
        limits.min_free_bytes = mib_to_bytes(mib).context("--min-free-mib")?;
    }

    let exec: Arc<dyn PrivilegedExecutor> = Arc::new(host.clone());
    let request = args
        .opts
        .load()?
        .into_request(&args.output_path, exec)
        .context("preparing package request")?;

    let report = Packager::new(Arc::new(UnshareSandbox::new(host)))
        .limits(limits)
        .package(&request)
        .await
        .with_context(|| format!("packaging {}", args.output_path.display()))?;

    log::info!(
        "Placed {} subvolume(s), image is {} bytes",
        report.placed.len(),
        report.image_bytes
    );
    if let Some(id) = report.default_subvol_id {
        println!("default subvolume id: {id}");
    }
    println!("{}", args.output_path.display());
    Ok(())
}
