use std::path::{Path, PathBuf};

use common::{Error, Handle};

/// Disk usage of a container's rootfs (spec §4.1 `Metrics`'s `DiskStat`
/// component).
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStat {
    pub bytes_used: u64,
    pub inodes_used: u64,
}

/// The image/layer graph and rootfs snapshotter, out of scope per spec.md
/// §1 ("treated as a `VolumeCreator` that, given a handle and image
/// reference, returns a mounted rootfs path"). A narrow trait, not a
/// concrete dependency, so Gardener never has to know whether a real
/// layer store or a test double is behind it (spec §9 "Dynamic dispatch
/// -> narrow capability traits").
pub trait VolumeCreator: Send + Sync {
    fn create(&self, handle: &Handle, rootfs_ref: &str) -> Result<PathBuf, Error>;
    fn destroy(&self, handle: &Handle) -> Result<(), Error>;
    fn metrics(&self, handle: &Handle) -> Result<DiskStat, Error>;
}

/// The simplest implementation that satisfies the trait without pulling
/// or layering anything (both non-goals, spec.md §1): treats
/// `rootfs_ref` as a path to an already-materialized rootfs directory
/// on the local filesystem and hands it straight back. A real layer
/// graph would replace this entirely; nothing else in this crate
/// depends on its internals.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPathVolumeCreator;

impl VolumeCreator for LocalPathVolumeCreator {
    #[fehler::throws(Error)]
    fn create(&self, handle: &Handle, rootfs_ref: &str) -> PathBuf {
        let path = Path::new(rootfs_ref).to_path_buf();

        if !path.is_dir() {
            fehler::throw!(Error::Validation(format!(
                "rootfs_ref '{}' for handle '{}' is not a directory",
                rootfs_ref, handle
            )));
        }

        path
    }

    fn destroy(&self, _handle: &Handle) -> Result<(), Error> {
        // The rootfs directory belongs to whatever produced `rootfs_ref`,
        // not to this crate - nothing to remove here.
        Ok(())
    }

    #[fehler::throws(Error)]
    fn metrics(&self, handle: &Handle) -> DiskStat {
        let _ = handle;
        DiskStat::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_returns_the_path_when_it_exists() {
        let dir = tempfile::tempdir().unwrap();
        let handle = Handle::new("handle-a").unwrap();
        let creator = LocalPathVolumeCreator;

        let rootfs = creator.create(&handle, dir.path().to_str().unwrap()).unwrap();

        assert_eq!(rootfs, dir.path());
    }

    #[test]
    fn create_rejects_a_missing_path() {
        let handle = Handle::new("handle-a").unwrap();
        let creator = LocalPathVolumeCreator;

        let err = creator.create(&handle, "/does/not/exist").unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
    }
}
