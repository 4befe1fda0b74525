//! Placement order for subvolumes within the image.

use std::path::{Path, PathBuf};

/// Orders in-image paths so that every ancestor comes strictly before its descendants.
///
/// Paths are compared component by component; an ancestor's components are a strict prefix of
/// its descendant's, so it always sorts first.  The order is total and deterministic regardless
/// of the order the paths are supplied in.  Placement walks it forwards, sealing walks it in
/// reverse.
pub fn placement_order<'a>(paths: impl IntoIterator<Item = &'a Path>) -> Vec<PathBuf> {
    let mut order: Vec<PathBuf> = paths.into_iter().map(Path::to_path_buf).collect();
    order.sort_by(|a, b| a.components().cmp(b.components()));
    order
}
