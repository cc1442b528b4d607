mod activity;
mod container;
mod gardener;
mod spec;
mod volume_creator;

pub use activity::ActivityTracker;
pub use container::Container;
pub use gardener::{spawn_grace_time_sweep, Gardener};
pub use spec::{ContainerInfo, ContainerMetrics, DesiredContainerSpec, Process};
pub use volume_creator::{DiskStat, LocalPathVolumeCreator, VolumeCreator};
