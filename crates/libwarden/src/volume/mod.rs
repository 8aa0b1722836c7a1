//! Managed volumes: the entity combining a storage backend, a mount
//! location, lower layers, quotas and the links binding it into containers.

pub mod backend;
pub mod journal;
pub mod manager;
pub mod spec;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Weak;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use warden_common::error::{Error, Result};
use warden_common::units;

use crate::container::Container;

/// Directory under a place where the manager keeps per-volume state
/// (auto-allocated paths, overlay upper/work dirs, loop images).
pub const PLACE_VOLUMES_DIR: &str = "volumes";
/// Directory under a place where named layers live.
pub const PLACE_LAYERS_DIR: &str = "layers";
/// Directory under a place for manager-owned storage referenced by
/// relative `storage` names.
pub const PLACE_STORAGE_DIR: &str = "storage";

const DEFAULT_PERMISSIONS: u32 = 0o775;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BackendType {
    #[default]
    Plain,
    Bind,
    Rbd,
    Loop,
    Overlay,
    Tmpfs,
    HugeTmpfs,
    Quota,
    Lvm,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Plain => "plain",
            BackendType::Bind => "bind",
            BackendType::Rbd => "rbd",
            BackendType::Loop => "loop",
            BackendType::Overlay => "overlay",
            BackendType::Tmpfs => "tmpfs",
            BackendType::HugeTmpfs => "hugetmpfs",
            BackendType::Quota => "quota",
            BackendType::Lvm => "lvm",
        }
    }
}

impl Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(BackendType::Plain),
            "bind" => Ok(BackendType::Bind),
            "rbd" => Ok(BackendType::Rbd),
            "loop" => Ok(BackendType::Loop),
            "overlay" => Ok(BackendType::Overlay),
            "tmpfs" => Ok(BackendType::Tmpfs),
            "hugetmpfs" => Ok(BackendType::HugeTmpfs),
            "quota" => Ok(BackendType::Quota),
            "lvm" => Ok(BackendType::Lvm),
            other => Err(Error::InvalidValue(format!("unknown backend {other:?}"))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumeState {
    #[default]
    Initial,
    Configured,
    Building,
    Ready,
    Tuning,
    Unlinked,
    ToDestroy,
    Destroying,
    Destroyed,
    Unready,
}

impl VolumeState {
    /// The monotonic partial order of volume lifecycles. UNREADY is the
    /// build-failure escape hatch and may be retried or destroyed.
    pub fn can_become(self, next: VolumeState) -> bool {
        use VolumeState::*;
        matches!(
            (self, next),
            (Initial, Configured)
                | (Configured, Building)
                | (Building, Ready)
                | (Building, Unready)
                | (Ready, Tuning)
                | (Tuning, Ready)
                | (Tuning, Unready)
                | (Ready, Unlinked)
                | (Ready, ToDestroy)
                | (Unlinked, ToDestroy)
                | (Unready, Building)
                | (Unready, ToDestroy)
                | (ToDestroy, Destroying)
                | (Destroying, Destroyed)
        )
    }

    pub fn is_destroying(self) -> bool {
        matches!(
            self,
            VolumeState::ToDestroy | VolumeState::Destroying | VolumeState::Destroyed
        )
    }
}

impl Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VolumeState::Initial => "INITIAL",
            VolumeState::Configured => "CONFIGURED",
            VolumeState::Building => "BUILDING",
            VolumeState::Ready => "READY",
            VolumeState::Tuning => "TUNING",
            VolumeState::Unlinked => "UNLINKED",
            VolumeState::ToDestroy => "TO_DESTROY",
            VolumeState::Destroying => "DESTROYING",
            VolumeState::Destroyed => "DESTROYED",
            VolumeState::Unready => "UNREADY",
        };
        f.write_str(name)
    }
}

impl FromStr for VolumeState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INITIAL" => Ok(VolumeState::Initial),
            "CONFIGURED" => Ok(VolumeState::Configured),
            "BUILDING" => Ok(VolumeState::Building),
            "READY" => Ok(VolumeState::Ready),
            "TUNING" => Ok(VolumeState::Tuning),
            "UNLINKED" => Ok(VolumeState::Unlinked),
            "TO_DESTROY" => Ok(VolumeState::ToDestroy),
            "DESTROYING" => Ok(VolumeState::Destroying),
            "DESTROYED" => Ok(VolumeState::Destroyed),
            "UNREADY" => Ok(VolumeState::Unready),
            other => Err(Error::InvalidValue(format!(
                "unknown volume state {other:?}"
            ))),
        }
    }
}

/// A binding of a volume into one container's mount namespace. The link
/// keeps a back-reference to its container but does not keep it alive.
#[derive(Debug, Clone)]
pub struct VolumeLink {
    pub volume_path: PathBuf,
    pub container: Weak<Container>,
    pub container_name: String,
    /// Path in the container namespace; empty means the link only pins the
    /// volume without binding it anywhere.
    pub target: PathBuf,
    /// Host path the bind actually landed on; empty until bound.
    pub host_target: PathBuf,
    pub read_only: bool,
    pub required: bool,
    pub busy: bool,
}

impl VolumeLink {
    pub fn is_bound(&self) -> bool {
        !self.host_target.as_os_str().is_empty()
    }
}

/// The managed volume. Mutable fields are guarded by the volume manager's
/// lock; backends receive `&mut Volume` only under it.
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub path: PathBuf,
    pub internal_path: PathBuf,
    pub is_auto_path: bool,
    pub place: PathBuf,
    pub storage: String,
    pub storage_path: PathBuf,
    pub backend_type: BackendType,
    pub state: VolumeState,
    pub read_only: bool,
    /// Lower layers, bottom to top.
    pub layers: Vec<String>,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub inode_guarantee: u64,
    pub claimed_space: u64,
    pub owner_container: String,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: u32,
    pub creator: String,
    pub private_data: String,
    pub labels: BTreeMap<String, String>,
    pub links: Vec<VolumeLink>,
    /// Paths of volumes strictly nested under this one's path.
    pub nested: BTreeSet<PathBuf>,
    pub keep_storage: bool,
    pub device_name: String,
    pub device_index: i32,
    pub build_time: Option<DateTime<Utc>>,
    pub change_time: Option<DateTime<Utc>>,
}

impl Volume {
    pub(crate) fn empty(id: String) -> Self {
        Volume {
            id,
            path: PathBuf::new(),
            internal_path: PathBuf::new(),
            is_auto_path: false,
            place: PathBuf::new(),
            storage: String::new(),
            storage_path: PathBuf::new(),
            backend_type: BackendType::default(),
            state: VolumeState::Initial,
            read_only: false,
            layers: Vec::new(),
            space_limit: 0,
            inode_limit: 0,
            space_guarantee: 0,
            inode_guarantee: 0,
            claimed_space: 0,
            owner_container: String::new(),
            owner_uid: None,
            owner_gid: None,
            uid: None,
            gid: None,
            permissions: DEFAULT_PERMISSIONS,
            creator: String::new(),
            private_data: String::new(),
            labels: BTreeMap::new(),
            links: Vec::new(),
            nested: BTreeSet::new(),
            keep_storage: false,
            device_name: String::new(),
            device_index: -1,
            build_time: None,
            change_time: None,
        }
    }

    /// Advances the lifecycle, refusing transitions outside the state
    /// partial order. Re-entering the current state is a no-op.
    pub fn set_state(&mut self, next: VolumeState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_become(next) {
            return Err(Error::Unknown(format!(
                "volume {} cannot go {} -> {}",
                self.id, self.state, next
            )));
        }
        tracing::info!(volume = %self.id, from = %self.state, to = %next, "volume state");
        self.state = next;
        self.change_time = Some(Utc::now());
        if next == VolumeState::Ready && self.build_time.is_none() {
            self.build_time = self.change_time;
        }
        Ok(())
    }

    pub fn have_quota(&self) -> bool {
        self.space_limit != 0 || self.inode_limit != 0
    }

    pub fn have_storage(&self) -> bool {
        !self.storage.is_empty()
    }

    /// User provided an absolute directory for storage.
    pub fn user_storage(&self) -> bool {
        self.storage.starts_with('/')
    }

    /// Backends that keep no data in `storage_path`.
    pub fn remote_storage(&self) -> bool {
        matches!(
            self.backend_type,
            BackendType::Rbd
                | BackendType::Lvm
                | BackendType::Tmpfs
                | BackendType::HugeTmpfs
                | BackendType::Plain
                | BackendType::Quota
        )
    }

    /// Backend storage is a regular file.
    pub fn file_storage(&self) -> bool {
        self.backend_type == BackendType::Loop
    }

    pub fn have_layers(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Per-volume scratch directory under the place.
    pub fn internal_dir(&self) -> PathBuf {
        self.place.join(PLACE_VOLUMES_DIR).join(&self.id)
    }

    /// Resolves the storage reference: absolute paths are user storage,
    /// relative names live under the place's storage directory.
    pub fn resolve_storage(&self) -> PathBuf {
        if self.user_storage() {
            PathBuf::from(&self.storage)
        } else {
            self.place.join(PLACE_STORAGE_DIR).join(&self.storage)
        }
    }

    /// Resolves a layer reference: absolute references stand alone, named
    /// ones live under the place's layer directory.
    pub fn layer_path(&self, layer: &str) -> PathBuf {
        if layer.starts_with('/') {
            PathBuf::from(layer)
        } else {
            self.place.join(PLACE_LAYERS_DIR).join(layer)
        }
    }

    pub fn find_link(&self, container: &str, target: &Path) -> Option<usize> {
        self.links
            .iter()
            .position(|l| l.container_name == container && l.target == target)
    }

    pub fn has_required_links(&self) -> bool {
        self.links
            .iter()
            .any(|l| l.required && l.container.upgrade().is_some())
    }

    /// Serializes every attribute into the journal's string map. Keys
    /// starting with `_` are internal.
    pub fn dump(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(journal::K_ID.into(), self.id.clone());
        map.insert(journal::K_PATH.into(), self.path.display().to_string());
        map.insert(journal::K_BACKEND.into(), self.backend_type.to_string());
        map.insert(journal::K_STATE.into(), self.state.to_string());
        map.insert(journal::K_PLACE.into(), self.place.display().to_string());
        if !self.internal_path.as_os_str().is_empty() {
            map.insert(
                journal::K_INTERNAL_PATH.into(),
                self.internal_path.display().to_string(),
            );
        }
        if self.have_storage() {
            map.insert(journal::K_STORAGE.into(), self.storage.clone());
        }
        if self.have_layers() {
            map.insert(journal::K_LAYERS.into(), self.layers.join(";"));
        }
        if self.read_only {
            map.insert(journal::K_READ_ONLY.into(), "true".into());
        }
        if self.keep_storage {
            map.insert(journal::K_KEEP_STORAGE.into(), "true".into());
        }
        for (key, value) in [
            (journal::K_SPACE_LIMIT, self.space_limit),
            (journal::K_INODE_LIMIT, self.inode_limit),
            (journal::K_SPACE_GUARANTEE, self.space_guarantee),
            (journal::K_INODE_GUARANTEE, self.inode_guarantee),
        ] {
            if value != 0 {
                map.insert(key.into(), units::format_size(value));
            }
        }
        if let Some(uid) = self.uid {
            map.insert(journal::K_USER.into(), uid.to_string());
        }
        if let Some(gid) = self.gid {
            map.insert(journal::K_GROUP.into(), gid.to_string());
        }
        map.insert(
            journal::K_PERMISSIONS.into(),
            format!("{:o}", self.permissions),
        );
        if !self.owner_container.is_empty() {
            map.insert(
                journal::K_OWNER_CONTAINER.into(),
                self.owner_container.clone(),
            );
        }
        if let Some(uid) = self.owner_uid {
            map.insert(journal::K_OWNER_USER.into(), uid.to_string());
        }
        if let Some(gid) = self.owner_gid {
            map.insert(journal::K_OWNER_GROUP.into(), gid.to_string());
        }
        if !self.creator.is_empty() {
            map.insert(journal::K_CREATOR.into(), self.creator.clone());
        }
        if !self.private_data.is_empty() {
            map.insert(journal::K_PRIVATE.into(), self.private_data.clone());
        }
        if !self.labels.is_empty() {
            let labels: Vec<String> = self
                .labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            map.insert(journal::K_LABELS.into(), labels.join(";"));
        }
        if !self.device_name.is_empty() {
            map.insert(journal::K_DEVICE_NAME.into(), self.device_name.clone());
        }
        if let Some(t) = self.build_time {
            map.insert(journal::K_BUILD_TIME.into(), t.to_rfc3339());
        }
        if let Some(t) = self.change_time {
            map.insert(journal::K_CHANGE_TIME.into(), t.to_rfc3339());
        }
        if self.device_index >= 0 {
            map.insert(journal::K_RAW_LOOP_DEV.into(), self.device_index.to_string());
        }
        if self.is_auto_path {
            map.insert(journal::K_RAW_AUTO_PATH.into(), "true".into());
        }
        if !self.links.is_empty() {
            let links: Vec<String> = self
                .links
                .iter()
                .map(|l| {
                    format!(
                        "{}:{}:{}:{}",
                        l.container_name,
                        l.target.display(),
                        l.read_only,
                        l.required
                    )
                })
                .collect();
            map.insert(journal::K_RAW_CONTAINERS.into(), links.join(";"));
        }
        map
    }

    /// Rebuilds a volume from a journal record. Links come back unbound
    /// (`host_target` empty, container reference dangling) until the
    /// manager re-attaches them to restored containers.
    pub fn load(map: &BTreeMap<String, String>) -> Result<Self> {
        let id = map
            .get(journal::K_ID)
            .ok_or_else(|| Error::InvalidValue("journal record without id".into()))?
            .clone();
        let mut volume = Volume::empty(id);
        for (key, value) in map {
            match key.as_str() {
                journal::K_ID => {}
                journal::K_PATH => volume.path = PathBuf::from(value),
                journal::K_INTERNAL_PATH => volume.internal_path = PathBuf::from(value),
                journal::K_BACKEND => volume.backend_type = value.parse()?,
                journal::K_STATE => volume.state = value.parse()?,
                journal::K_PLACE => volume.place = PathBuf::from(value),
                journal::K_STORAGE => volume.storage = value.clone(),
                journal::K_LAYERS => {
                    volume.layers = value.split(';').map(String::from).collect()
                }
                journal::K_READ_ONLY => volume.read_only = parse_bool(value)?,
                journal::K_KEEP_STORAGE => volume.keep_storage = parse_bool(value)?,
                journal::K_SPACE_LIMIT => volume.space_limit = units::parse_size(value)?,
                journal::K_INODE_LIMIT => volume.inode_limit = units::parse_size(value)?,
                journal::K_SPACE_GUARANTEE => {
                    volume.space_guarantee = units::parse_size(value)?
                }
                journal::K_INODE_GUARANTEE => {
                    volume.inode_guarantee = units::parse_size(value)?
                }
                journal::K_USER => volume.uid = Some(parse_id(value)?),
                journal::K_GROUP => volume.gid = Some(parse_id(value)?),
                journal::K_PERMISSIONS => {
                    volume.permissions = u32::from_str_radix(value, 8).map_err(|_| {
                        Error::InvalidValue(format!("bad permissions {value:?}"))
                    })?
                }
                journal::K_OWNER_CONTAINER => volume.owner_container = value.clone(),
                journal::K_OWNER_USER => volume.owner_uid = Some(parse_id(value)?),
                journal::K_OWNER_GROUP => volume.owner_gid = Some(parse_id(value)?),
                journal::K_CREATOR => volume.creator = value.clone(),
                journal::K_PRIVATE => volume.private_data = value.clone(),
                journal::K_LABELS => {
                    for pair in value.split(';').filter(|p| !p.is_empty()) {
                        let (k, v) = pair.split_once('=').ok_or_else(|| {
                            Error::InvalidValue(format!("bad label {pair:?}"))
                        })?;
                        volume.labels.insert(k.to_string(), v.to_string());
                    }
                }
                journal::K_DEVICE_NAME => volume.device_name = value.clone(),
                journal::K_BUILD_TIME => volume.build_time = Some(parse_time(value)?),
                journal::K_CHANGE_TIME => volume.change_time = Some(parse_time(value)?),
                journal::K_RAW_LOOP_DEV => {
                    volume.device_index = value.parse().map_err(|_| {
                        Error::InvalidValue(format!("bad loop device {value:?}"))
                    })?
                }
                journal::K_RAW_AUTO_PATH => volume.is_auto_path = parse_bool(value)?,
                journal::K_RAW_CONTAINERS => {
                    for entry in value.split(';').filter(|e| !e.is_empty()) {
                        let link = spec::LinkSpec::parse(entry)?;
                        volume.links.push(VolumeLink {
                            volume_path: volume.path.clone(),
                            container: Weak::new(),
                            container_name: link.container,
                            target: link.target.unwrap_or_default(),
                            host_target: PathBuf::new(),
                            read_only: link.read_only,
                            required: link.required,
                            busy: false,
                        });
                    }
                }
                other => {
                    tracing::warn!(volume = %volume.id, key = other, "ignoring unknown journal key");
                }
            }
        }
        Ok(volume)
    }
}

pub(crate) fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::InvalidValue(format!("bad boolean {other:?}"))),
    }
}

pub(crate) fn parse_id(s: &str) -> Result<u32> {
    s.parse()
        .map_err(|_| Error::InvalidValue(format!("bad numeric id {s:?}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::InvalidValue(format!("bad timestamp {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_order_is_enforced() {
        let mut vol = Volume::empty("1".into());
        assert_eq!(vol.state, VolumeState::Initial);
        vol.set_state(VolumeState::Configured).unwrap();
        vol.set_state(VolumeState::Building).unwrap();
        vol.set_state(VolumeState::Ready).unwrap();
        assert!(vol.build_time.is_some());

        // tuning bounces back to ready
        vol.set_state(VolumeState::Tuning).unwrap();
        vol.set_state(VolumeState::Ready).unwrap();

        // no going back to building from ready
        assert!(vol.set_state(VolumeState::Building).is_err());
        // and never out of destroyed
        vol.set_state(VolumeState::ToDestroy).unwrap();
        vol.set_state(VolumeState::Destroying).unwrap();
        vol.set_state(VolumeState::Destroyed).unwrap();
        assert!(vol.set_state(VolumeState::Ready).is_err());
    }

    #[test]
    fn unready_is_reachable_from_building_only() {
        let mut vol = Volume::empty("1".into());
        vol.set_state(VolumeState::Configured).unwrap();
        vol.set_state(VolumeState::Building).unwrap();
        vol.set_state(VolumeState::Unready).unwrap();
        // retry path
        vol.set_state(VolumeState::Building).unwrap();
        vol.set_state(VolumeState::Ready).unwrap();
        assert!(vol.set_state(VolumeState::Unready).is_err());
    }

    #[test]
    fn dump_load_round_trip() {
        let mut vol = Volume::empty("7".into());
        vol.path = PathBuf::from("/place/volumes/7/volume");
        vol.internal_path = PathBuf::from("/inside/data");
        vol.is_auto_path = true;
        vol.place = PathBuf::from("/place");
        vol.storage = "store".into();
        vol.backend_type = BackendType::Overlay;
        vol.state = VolumeState::Ready;
        vol.read_only = true;
        vol.layers = vec!["base".into(), "patch".into()];
        vol.space_limit = 64 << 20;
        vol.inode_limit = 4096;
        vol.space_guarantee = 32 << 20;
        vol.uid = Some(1000);
        vol.gid = Some(1000);
        vol.owner_container = "ct".into();
        vol.owner_uid = Some(0);
        vol.creator = "api".into();
        vol.private_data = "opaque".into();
        vol.labels.insert("tier".into(), "hot".into());
        vol.device_index = 3;
        vol.build_time = Some(Utc::now());
        vol.change_time = vol.build_time;
        vol.links.push(VolumeLink {
            volume_path: vol.path.clone(),
            container: Weak::new(),
            container_name: "ct".into(),
            target: PathBuf::from("/data"),
            host_target: PathBuf::from("/run/ct/root/data"),
            read_only: false,
            required: true,
            busy: false,
        });

        let dumped = vol.dump();
        assert_eq!(dumped.get("_auto_path").map(String::as_str), Some("true"));
        assert_eq!(dumped.get("_loop_dev").map(String::as_str), Some("3"));
        assert_eq!(dumped.get("space_limit").map(String::as_str), Some("64M"));

        let restored = Volume::load(&dumped).unwrap();
        // host_target is runtime scratch; the rest round-trips
        let mut redumped = restored.dump();
        let mut expected = dumped.clone();
        redumped.remove("change_time");
        expected.remove("change_time");
        assert_eq!(redumped, expected);
        assert_eq!(restored.links.len(), 1);
        assert!(restored.links[0].required);
        assert!(!restored.links[0].is_bound());
    }

    #[test]
    fn layer_paths_resolve_against_place() {
        let mut vol = Volume::empty("1".into());
        vol.place = PathBuf::from("/place");
        assert_eq!(vol.layer_path("base"), PathBuf::from("/place/layers/base"));
        assert_eq!(vol.layer_path("/abs/layer"), PathBuf::from("/abs/layer"));
    }
}
