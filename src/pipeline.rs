//! Streaming one subvolume from its source into the mounted image.
//!
//! The producer (`btrfs send`) and the consumer (`btrfs receive`) run as two independent blocking
//! tasks joined only by an anonymous pipe.  The pipe's kernel buffer is the only buffering, so a
//! slow side stalls the other instead of the stream piling up in memory.  Each side owns exactly
//! one end; when the producer finishes its end is closed and the consumer sees EOF, and when the
//! consumer dies early the producer gets EPIPE.

use std::sync::Arc;

use log::{debug, info};
use rustix::pipe::{pipe_with, PipeFlags};
use tokio::task::{spawn_blocking, JoinError};

use crate::{
    btrfs,
    error::{PackageError, Result},
    exec::CommandOutput,
    loopback::LoopbackVolume,
    subvol::SubvolumeSource,
};

pub(crate) fn join_error(e: JoinError) -> PackageError {
    std::io::Error::other(format!("blocking task failed: {e}")).into()
}

/// Sends `source` into the root of `volume`, where it lands (read-write) under its basename.
///
/// `estimated` and `allocated` only feed the message of [`PackageError::Space`].
pub async fn transfer(
    source: &Arc<dyn SubvolumeSource>,
    volume: &Arc<LoopbackVolume>,
    estimated: u64,
    allocated: u64,
) -> Result<()> {
    info!(
        "Receiving {} -> {}",
        source.path().display(),
        volume.mount_dir().display()
    );
    let (reader, writer) = pipe_with(PipeFlags::CLOEXEC).map_err(std::io::Error::from)?;

    let producer = spawn_blocking({
        let source = Arc::clone(source);
        move || source.mark_readonly_and_stream(writer)
    });
    let consumer = spawn_blocking({
        let volume = Arc::clone(volume);
        move || volume.receive(reader)
    });
    let (produced, received) = tokio::join!(producer, consumer);

    // The consumer's verdict wins: when receive fails, send usually only died of EPIPE.
    classify(received.map_err(join_error)??, volume, estimated, allocated)?;
    produced.map_err(join_error)??;
    debug!("received {}", source.path().display());
    Ok(())
}

fn classify(
    output: CommandOutput,
    volume: &LoopbackVolume,
    estimated: u64,
    allocated: u64,
) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    if btrfs::is_out_of_space(&output.stderr) {
        return Err(PackageError::Space {
            estimated,
            allocated,
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        });
    }
    Err(PackageError::external(
        &btrfs::receive_argv(volume.mount_dir()),
        Some(output.status),
        &output.stderr,
    ))
}
