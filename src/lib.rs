//! Packages btrfs subvolumes into a single loopback disk image.
//!
//! Each subvolume is streamed with `btrfs send`/`btrfs receive` into a freshly formatted image,
//! moved to its in-image path, and sealed read-only unless asked otherwise.  All privileged work
//! happens inside a private mount/pid namespace that lives exactly as long as one build.

pub mod btrfs;
pub mod error;
pub mod exec;
pub mod finalize;
pub mod guard;
pub mod isolate;
pub mod loopback;
pub mod opts;
pub mod package;
pub mod pipeline;
pub mod place;
pub mod plan;
pub mod request;
pub mod sizing;
pub mod subvol;


pub use error::{PackageError, Result};
pub use package::{PackageReport, Packager};
pub use request::{PackageRequest, SubvolumeSpec};
