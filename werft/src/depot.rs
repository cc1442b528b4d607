use std::path::PathBuf;

use common::{Error, Handle};

/// The on-disk directory containing all bundles, one per live container
/// (spec §6 "Bundle on disk" table; glossary "Depot"). Partitioned by
/// handle, so distinct handles never contend on the same paths (spec §5
/// "the Depot directory is partitioned by handle; no cross-handle
/// contention").
pub struct Depot {
    root: PathBuf,
}

impl Depot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn bundle_dir(&self, handle: &Handle) -> PathBuf {
        self.root.join(handle.as_str())
    }

    pub fn config_path(&self, handle: &Handle) -> PathBuf {
        self.bundle_dir(handle).join("config.json")
    }

    pub fn rootfs_path(&self, handle: &Handle) -> PathBuf {
        self.bundle_dir(handle).join("rootfs")
    }

    pub fn processes_dir(&self, handle: &Handle) -> PathBuf {
        self.bundle_dir(handle).join("processes")
    }

    pub fn process_json_path(&self, handle: &Handle, pid: &str) -> PathBuf {
        self.processes_dir(handle).join(format!("{}.json", pid))
    }

    pub fn pidfile_path(&self, handle: &Handle, pid: &str) -> PathBuf {
        self.processes_dir(handle).join(format!("{}.pid", pid))
    }

    pub fn network_log_path(&self, handle: &Handle) -> PathBuf {
        self.bundle_dir(handle).join("network.log")
    }

    #[fehler::throws(Error)]
    pub fn create_bundle_dir(&self, handle: &Handle, volume_rootfs: &std::path::Path) {
        std::fs::create_dir_all(self.bundle_dir(handle)).map_err(|e| Error::Io(e.into()))?;
        std::fs::create_dir_all(self.processes_dir(handle)).map_err(|e| Error::Io(e.into()))?;

        let rootfs_link = self.rootfs_path(handle);
        if !rootfs_link.exists() {
            symlink(volume_rootfs, &rootfs_link).map_err(|e| Error::Io(e.into()))?;
        }
    }

    #[fehler::throws(Error)]
    pub fn remove_bundle_dir(&self, handle: &Handle) {
        let dir = self.bundle_dir(handle);
        if dir.exists() {
            std::fs::remove_dir_all(dir).map_err(|e| Error::Io(e.into()))?;
        }
    }

    pub fn exists(&self, handle: &Handle) -> bool {
        self.bundle_dir(handle).exists()
    }
}

#[cfg(unix)]
fn symlink(original: &std::path::Path, link: &std::path::Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_rootfs_symlink_and_processes_dir() {
        let root = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let depot = Depot::new(root.path());
        let handle = Handle::new("handle-a").unwrap();

        depot.create_bundle_dir(&handle, rootfs.path()).unwrap();

        assert!(depot.processes_dir(&handle).is_dir());
        assert!(depot.rootfs_path(&handle).exists());
        assert!(depot.exists(&handle));
    }

    #[test]
    fn remove_bundle_dir_is_tolerant_of_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let depot = Depot::new(root.path());
        let handle = Handle::new("unknown").unwrap();

        depot.remove_bundle_dir(&handle).unwrap();
    }
}
