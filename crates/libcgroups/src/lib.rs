//! The supervisor's view of the kernel's cgroup v1 hierarchies. A snapshot
//! reader walks the mount table to discover every mounted subsystem set; an
//! interning registry hands out one canonical handle per subsystem and per
//! tree node; nodes mediate kernel state through knob I/O under their
//! computed paths and know how to create, drain and tear themselves down.

pub mod cgroup;
pub mod mount;
pub mod snapshot;
pub mod subsystem;

pub use cgroup::{Cgroup, CgroupRegistry, CGROUP_PROCS, CGROUP_TASKS, DEFAULT_CGROUP_ROOT};
pub use mount::Mount;
pub use snapshot::CgroupSnapshot;
pub use subsystem::{Freezer, Subsystem, KNOWN_SUBSYSTEMS};
