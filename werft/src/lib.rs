pub mod bundle;
pub mod containerizer;
pub mod depot;
mod error;
pub mod exec_preparer;
mod nstar;
pub mod process_tracker;
pub mod runtime;

pub use bundle::{BindMount, BundleSpec, Limits, MountMode, RuntimeConfig};
pub use containerizer::{ActualContainerSpec, CgroupStats, Containerizer};
pub use depot::Depot;
pub use error::{to_common_error, ContainerizerError};
pub use exec_preparer::{ProcessSpec, ResolvedUser};
pub use process_tracker::ProcessTracker;
pub use runtime::{RuntimeDriver, RuntimeState};
