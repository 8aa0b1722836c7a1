//! Container-side machinery of the warden supervisor: the minimal container
//! collaborator, the volume manager with its pluggable storage backends and
//! crash-recoverable journal, and the task-launcher boundary that wires
//! cgroups and volume links into a starting container.

pub mod container;
pub mod launcher;
pub mod volume;

pub use container::{Container, ContainerStatus};
pub use launcher::LaunchSpec;
pub use volume::manager::{ContainerMap, VolumeManager};
pub use volume::spec::VolumeSpec;
pub use volume::{BackendType, Volume, VolumeLink, VolumeState};
