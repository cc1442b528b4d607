use std::sync::Arc;
use std::time::Duration;

use common::{CommandRunner, Error, Handle, PropertyFilter};
use netzwerk::Networker;
use storage::{PropertyStore, Storage, StorageEngine};
use werft::{BundleSpec, Containerizer};

use crate::{activity::ActivityTracker, container::Container, spec::DesiredContainerSpec, volume_creator::VolumeCreator};

/// Composes Networker, VolumeCreator, Containerizer, and the Property
/// Store into the container lifecycle surface (spec §4.1). Holds the
/// only process-wide references; every other component (`Container`) is
/// constructed per-lookup from clones of the `Arc`s held here, never
/// from a reference back to the `Gardener` itself (spec §9's
/// "Cyclic-graph avoidance").
pub struct Gardener<T: StorageEngine, R: CommandRunner, V: VolumeCreator> {
    storage: Arc<Storage<T>>,
    networker: Arc<Networker<R>>,
    containerizer: Arc<Containerizer<R>>,
    volume_creator: Arc<V>,
    activity: Arc<ActivityTracker>,
    max_containers: u64,
}

impl<T: StorageEngine, R: CommandRunner, V: VolumeCreator> Gardener<T, R, V> {
    pub fn new(
        storage: Storage<T>,
        networker: Networker<R>,
        containerizer: Containerizer<R>,
        volume_creator: V,
        max_containers: u64,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            networker: Arc::new(networker),
            containerizer: Arc::new(containerizer),
            volume_creator: Arc::new(volume_creator),
            activity: Arc::new(ActivityTracker::new()),
            max_containers,
        }
    }

    fn properties(&self) -> PropertyStore<'_, T> {
        PropertyStore::new(&self.storage)
    }

    fn facade(&self, handle: Handle) -> Container<T, R, V> {
        Container::new(
            handle,
            self.containerizer.clone(),
            self.networker.clone(),
            self.volume_creator.clone(),
            self.storage.clone(),
            self.activity.clone(),
        )
    }

    /// `Create(DesiredSpec) -> Container` (spec §4.1). Transactional: any
    /// subsystem failure after `VolumeCreator.create` rolls back through
    /// `Networker.destroy`/`VolumeCreator.destroy` in reverse order
    /// (spec §4.1/§7). The handle is only registered as live once
    /// `Containerizer.create` has actually succeeded, so `Lookup` never
    /// observes a partially-created container (spec §5's ordering
    /// guarantee).
    #[fehler::throws(Error)]
    pub fn create(&self, spec: DesiredContainerSpec) -> Container<T, R, V> {
        self.check_admission()?;

        let handle = match &spec.handle {
            Some(raw) => Handle::new(raw.clone())?,
            None => Handle::generate(),
        };

        let properties = self.properties();
        if properties.is_live(&handle)? {
            fehler::throw!(Error::Validation(format!("container '{}' already exists", handle)));
        }

        let rootfs_path = self.volume_creator.create(&handle, &spec.rootfs_path)?;

        let hooks = match self.networker.hooks(&handle, &spec.network_spec, &properties) {
            Ok(hooks) => hooks,
            Err(err) => {
                let _ = self.volume_creator.destroy(&handle);
                fehler::throw!(err);
            }
        };

        let bundle_spec = BundleSpec {
            handle: handle.clone(),
            rootfs_path: rootfs_path.clone(),
            privileged: spec.privileged,
            limits: spec.limits.clone(),
            bind_mounts: spec.bind_mounts.clone(),
            env: spec.env.clone(),
            args: spec.args.clone(),
            prestart_hooks: vec![hooks.prestart],
            poststop_hooks: vec![hooks.poststop],
            log_file: self.containerizer.depot().network_log_path(&handle),
        };

        if let Err(err) = self.containerizer.create(&bundle_spec, &rootfs_path) {
            self.rollback(&handle, &properties);
            fehler::throw!(err);
        }

        properties.register(&handle, spec.properties)?;
        self.activity.touch(handle.as_str());

        if let Some(grace_time) = spec.grace_time {
            properties.set(&handle, "garden.grace-time", grace_time.as_secs().to_string())?;
        }

        self.facade(handle)
    }

    /// `Destroy(handle)` (spec §4.1/§7): reverse order, log-and-continue,
    /// never fatal on missing state.
    pub fn destroy(&self, handle: &Handle) {
        if let Err(err) = self.containerizer.destroy(handle) {
            tracing::warn!(%handle, error = %err, "containerizer destroy failed");
        }

        self.rollback(handle, &self.properties());

        if let Err(err) = self.properties().deregister(handle) {
            tracing::warn!(%handle, error = %err, "failed to deregister handle");
        }

        self.activity.forget(handle.as_str());
    }

    /// `Lookup(handle) -> Container` (spec §4.1).
    #[fehler::throws(Error)]
    pub fn lookup(&self, handle: &str) -> Container<T, R, V> {
        let handle = Handle::new(handle)?;

        if !self.properties().is_live(&handle)? {
            fehler::throw!(Error::NotFound(handle.to_string()));
        }

        self.facade(handle)
    }

    /// `Containers(filter) -> [handle]` (spec §4.1).
    #[fehler::throws(Error)]
    pub fn containers(&self, filter: &PropertyFilter) -> Vec<Handle> {
        self.properties().containers(filter)?
    }

    /// Sweeps every tracked handle and destroys those that have both
    /// exceeded their grace time and have no active Run/Attach (spec §9:
    /// "idle means no active Run/Attach processes" - modeled here as "no
    /// activity recorded more recently than `grace_time` ago", since this
    /// crate doesn't track in-flight process counts separately from
    /// activity timestamps).
    pub fn sweep_grace_times(&self) {
        for handle in self.activity.handles() {
            let handle = match Handle::new(handle) {
                Ok(handle) => handle,
                Err(_) => continue,
            };

            let grace_time = match self.properties().get(&handle, "garden.grace-time") {
                Ok(raw) => match raw.parse().map(Duration::from_secs) {
                    Ok(duration) => duration,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };

            if self.activity.idle_for(handle.as_str()).map(|idle| idle >= grace_time).unwrap_or(false) {
                tracing::info!(%handle, "grace time elapsed, destroying");
                self.destroy(&handle);
            }
        }
    }

    fn rollback(&self, handle: &Handle, properties: &PropertyStore<'_, T>) {
        if let Err(err) = self.networker.destroy(handle, properties) {
            tracing::warn!(%handle, error = %err, "networker destroy failed during rollback");
        }

        if let Err(err) = self.volume_creator.destroy(handle) {
            tracing::warn!(%handle, error = %err, "volume destroy failed during rollback");
        }

        // `Hooks` may have written a network config row for this handle
        // before `Create` ever reached `register` (spec §5's ordering
        // guarantee); clear it so a rolled-back attempt leaves nothing
        // behind for a later `Create` of the same handle to inherit.
        if let Err(err) = properties.deregister(handle) {
            tracing::warn!(%handle, error = %err, "failed to deregister handle during rollback");
        }
    }

    #[fehler::throws(Error)]
    fn check_admission(&self) {
        if self.networker.capacity() == 0 {
            fehler::throw!(Error::CapacityExhausted("subnet pool has zero capacity".into()));
        }

        if self.max_containers > 0 {
            let live = self.properties().containers(&PropertyFilter::new())?.len() as u64;

            if live >= self.max_containers {
                fehler::throw!(Error::CapacityExhausted(format!(
                    "max_containers ({}) reached",
                    self.max_containers
                )));
            }
        }
    }
}

/// Spawns the grace-time sweep as a background task (spec §9: "treat as
/// a background daemon timer"). Returns a handle the caller can drop to
/// stop sweeping (aborting the task), matching `tokio::task::JoinHandle`'s
/// own drop-cancels-nothing semantics by wrapping it so the caller must
/// explicitly decide whether to keep it alive.
pub fn spawn_grace_time_sweep<T, R, V>(gardener: Arc<Gardener<T, R, V>>, interval: Duration) -> tokio::task::JoinHandle<()>
where
    T: StorageEngine + Send + Sync + 'static,
    R: CommandRunner + Send + Sync + 'static,
    V: VolumeCreator + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            gardener.sweep_grace_times();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use test_helpers::FakeCommandRunner;
    use werft::Depot;

    use super::*;
    use crate::volume_creator::LocalPathVolumeCreator;

    type TestGardener = Gardener<storage::Connection, FakeCommandRunner, LocalPathVolumeCreator>;

    fn gardener(dir: &tempfile::TempDir, max_containers: u64) -> (FakeCommandRunner, TestGardener) {
        let storage = Storage::new(dir.path()).unwrap();
        let runner = FakeCommandRunner::new();

        let networker = Networker::new(
            "/usr/local/bin/hook",
            ipnetwork::Ipv4Network::try_from("10.254.0.0/24").unwrap(),
            30,
            60000,
            100,
            runner.clone(),
            "w",
            "10.0.0.1".parse().unwrap(),
            vec![],
            1500,
        );

        let containerizer = Containerizer::new(
            Depot::new(dir.path().join("depot")),
            runner.clone(),
            "/usr/bin/runtime",
            "/usr/bin/iodaemon",
            "/usr/bin/nstar",
        );

        (runner, Gardener::new(storage, networker, containerizer, LocalPathVolumeCreator, max_containers))
    }

    fn desired(rootfs: &tempfile::TempDir) -> DesiredContainerSpec {
        DesiredContainerSpec {
            rootfs_path: rootfs.path().to_str().unwrap().to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn create_registers_the_handle_and_lookup_finds_it() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (runner, gardener) = gardener(&dir, 0);
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());

        let container = gardener.create(desired(&rootfs)).unwrap();
        let handle = container.handle().clone();

        assert!(gardener.lookup(handle.as_str()).is_ok());
    }

    #[test]
    fn create_with_an_already_live_handle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (runner, gardener) = gardener(&dir, 0);
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());

        let mut spec = desired(&rootfs);
        spec.handle = Some("fixed-handle".into());
        gardener.create(spec.clone()).unwrap();

        let err = gardener.create(spec).unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn create_rolls_back_the_volume_when_the_containerizer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (_runner, gardener) = gardener(&dir, 0);
        // No stdout queued, so the start token never appears and Create fails.

        let err = gardener.create(desired(&rootfs)).unwrap_err();

        assert!(matches!(err, Error::Runtime(_)));
    }

    #[test]
    fn lookup_of_an_unknown_handle_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_runner, gardener) = gardener(&dir, 0);

        let err = gardener.lookup("never-created").unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn destroy_of_an_unknown_handle_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let (_runner, gardener) = gardener(&dir, 0);

        gardener.destroy(&Handle::new("never-created").unwrap());
    }

    #[test]
    fn destroy_removes_the_handle_so_lookup_stops_finding_it() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (runner, gardener) = gardener(&dir, 0);
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());

        let container = gardener.create(desired(&rootfs)).unwrap();
        let handle = container.handle().clone();

        gardener.destroy(&handle);

        assert!(matches!(gardener.lookup(handle.as_str()).unwrap_err(), Error::NotFound(_)));
    }

    #[test]
    fn create_rejects_once_max_containers_is_reached() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (runner, gardener) = gardener(&dir, 1);
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());

        gardener.create(desired(&rootfs)).unwrap();

        let err = gardener.create(desired(&rootfs)).unwrap_err();

        assert!(matches!(err, Error::CapacityExhausted(_)));
    }

    #[test]
    fn containers_filters_by_property() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (runner, gardener) = gardener(&dir, 0);
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());

        let mut matching = desired(&rootfs);
        matching.properties.insert("role".into(), "web".into());
        let matching_handle = gardener.create(matching).unwrap().handle().clone();

        let mut other = desired(&rootfs);
        other.properties.insert("role".into(), "worker".into());
        gardener.create(other).unwrap();

        let mut filter = PropertyFilter::new();
        filter.insert("role".into(), "web".into());

        let found = gardener.containers(&filter).unwrap();

        assert_eq!(found, vec![matching_handle]);
    }

    #[test]
    fn sweep_destroys_containers_past_their_grace_time() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = tempfile::tempdir().unwrap();
        let (runner, gardener) = gardener(&dir, 0);
        runner.queue_stdout("/usr/bin/runtime", b"werft: container ready".to_vec());

        let mut spec = desired(&rootfs);
        spec.grace_time = Some(Duration::from_secs(0));
        let container = gardener.create(spec).unwrap();
        let handle = container.handle().clone();

        gardener.sweep_grace_times();

        assert!(matches!(gardener.lookup(handle.as_str()).unwrap_err(), Error::NotFound(_)));
    }
}
