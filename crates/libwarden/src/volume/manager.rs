//! The volume registry. One process-wide mutex guards the volumes map, the
//! link map, per-place claims and every state transition; each transition
//! is journaled before the kernel operation it precedes, which is what
//! makes `restore_all` possible after a crash.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libcgroups::mount::{self, Mount};

use warden_common::error::{Error, Result};
use warden_common::fsutil;
use warden_common::units;

use crate::container::Container;

use super::backend::{open_backend, StatFs};
use super::journal::Journal;
use super::spec::VolumeSpec;
use super::{BackendType, Volume, VolumeLink, VolumeState};

pub type ContainerMap = BTreeMap<String, Arc<Container>>;

struct VolumesState {
    volumes: BTreeMap<PathBuf, Volume>,
    /// host target of every bound link, back to its volume path
    links: BTreeMap<PathBuf, PathBuf>,
    /// bytes claimed per claim key
    claims: HashMap<String, u64>,
    next_id: u64,
}

pub struct VolumeManager {
    state: Mutex<VolumesState>,
    journal: Journal,
    default_place: PathBuf,
    /// Named alternate places selectable via the spec's `place_key`.
    places: HashMap<String, PathBuf>,
}

/// Bytes a volume debits from its claim key. Backends that keep their data
/// off the place claim nothing.
fn claim_size(volume: &Volume) -> u64 {
    match volume.backend_type {
        BackendType::Bind | BackendType::Rbd | BackendType::Lvm => 0,
        _ => volume.space_limit,
    }
}

impl VolumeManager {
    pub fn new<P: Into<PathBuf>, K: Into<PathBuf>>(default_place: P, kv_dir: K) -> Result<Self> {
        let default_place = default_place.into();
        fsutil::create_dir_all(&default_place)?;
        Ok(VolumeManager {
            state: Mutex::new(VolumesState {
                volumes: BTreeMap::new(),
                links: BTreeMap::new(),
                claims: HashMap::new(),
                next_id: 0,
            }),
            journal: Journal::open(kv_dir)?,
            default_place,
            places: HashMap::new(),
        })
    }

    pub fn default_place(&self) -> &Path {
        &self.default_place
    }

    /// Registers a named place for specs that select storage by key.
    pub fn register_place<K: Into<String>, P: Into<PathBuf>>(
        &mut self,
        key: K,
        place: P,
    ) -> Result<()> {
        let place = place.into();
        fsutil::create_dir_all(&place)?;
        self.places.insert(key.into(), place);
        Ok(())
    }

    /// A read-only snapshot of one volume.
    pub fn volume(&self, path: &Path) -> Option<Volume> {
        self.state.lock().unwrap().volumes.get(path).cloned()
    }

    pub fn volume_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().volumes.keys().cloned().collect()
    }

    /// Validates the spec, builds the backend and registers the volume.
    /// A failed build leaves the volume registered UNREADY for retry.
    pub fn create(&self, spec: VolumeSpec, containers: &ContainerMap) -> Result<Volume> {
        let mut st = self.state.lock().unwrap();
        st.next_id += 1;
        let id = st.next_id.to_string();

        let mut volume = Volume::empty(id);
        volume.backend_type = spec.backend;
        volume.place = match (&spec.place, &spec.place_key) {
            (Some(place), _) => place.clone(),
            (None, Some(key)) => self
                .places
                .get(key)
                .ok_or_else(|| Error::NotFound(format!("place {key:?} is not registered")))?
                .clone(),
            (None, None) => self.default_place.clone(),
        };
        volume.storage = spec.storage.clone();
        volume.read_only = spec.read_only;
        volume.layers = spec.layers.clone();
        volume.space_limit = spec.space_limit;
        volume.inode_limit = spec.inode_limit;
        volume.space_guarantee = spec.space_guarantee;
        volume.inode_guarantee = spec.inode_guarantee;
        volume.uid = spec.uid;
        volume.gid = spec.gid;
        if let Some(permissions) = spec.permissions {
            volume.permissions = permissions;
        }
        volume.owner_container = spec.owner_container.clone();
        volume.owner_uid = spec.owner_uid;
        volume.owner_gid = spec.owner_gid;
        volume.creator = spec.owner_container.clone();
        volume.private_data = spec.private_data.clone();
        volume.labels = spec.labels.clone();

        let target_root = match &spec.target_container {
            Some(name) => Some(Arc::clone(containers.get(name).ok_or_else(|| {
                Error::NotFound(format!("target container {name} does not exist"))
            })?)),
            None => None,
        };
        match &spec.path {
            Some(path) => {
                volume.path = match &target_root {
                    Some(ct) => {
                        volume.internal_path = path.clone();
                        ct.compose_path(path)
                    }
                    None => path.clone(),
                };
            }
            None => {
                volume.path = volume.internal_dir().join("volume");
                volume.is_auto_path = true;
            }
        }
        if st.volumes.contains_key(&volume.path) {
            return Err(Error::VolumeAlreadyExists(volume.path.clone()));
        }

        let backend = open_backend(volume.backend_type);
        backend.configure(&mut volume)?;
        volume.set_state(VolumeState::Configured)?;

        let claim_key = backend.claim_place(&volume);
        Self::claim(&mut st, &claim_key, &mut volume)?;
        self.journal.save(&volume.id, &volume.dump())?;

        if volume.is_auto_path {
            fsutil::create_dir_all(&volume.internal_dir())?;
        }

        volume.set_state(VolumeState::Building)?;
        self.journal.save(&volume.id, &volume.dump())?;

        let built = backend
            .build(&mut volume)
            .and_then(|()| Self::apply_ownership(&volume));
        match built {
            Ok(()) => {
                volume.set_state(VolumeState::Ready)?;
                self.journal.save(&volume.id, &volume.dump())?;
            }
            Err(err) => {
                tracing::error!(volume = %volume.id, %err, "volume build failed");
                volume.set_state(VolumeState::Unready)?;
                if let Err(journal_err) = self.journal.save(&volume.id, &volume.dump()) {
                    tracing::warn!(volume = %volume.id, %journal_err, "failed to journal UNREADY");
                }
                Self::register(&mut st, volume);
                return Err(err);
            }
        }

        let path = volume.path.clone();
        Self::register(&mut st, volume);

        for link_spec in &spec.containers {
            let container = containers.get(&link_spec.container).ok_or_else(|| {
                Error::NotFound(format!(
                    "container {} does not exist",
                    link_spec.container
                ))
            })?;
            self.link_locked(
                &mut st,
                &path,
                container,
                link_spec.target.as_deref(),
                link_spec.read_only,
                link_spec.required,
            )?;
        }

        st.volumes
            .get(&path)
            .cloned()
            .ok_or_else(|| Error::Unknown("volume vanished during create".into()))
    }

    /// Appends a link; when the target is set and the container runs, the
    /// bind lands immediately.
    pub fn link(
        &self,
        volume_path: &Path,
        container: &Arc<Container>,
        target: Option<&Path>,
        read_only: bool,
        required: bool,
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.link_locked(&mut st, volume_path, container, target, read_only, required)
    }

    fn link_locked(
        &self,
        st: &mut VolumesState,
        volume_path: &Path,
        container: &Arc<Container>,
        target: Option<&Path>,
        read_only: bool,
        required: bool,
    ) -> Result<()> {
        let volume = st
            .volumes
            .get_mut(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;
        if volume.state != VolumeState::Ready {
            return Err(Error::VolumeNotReady(volume.id.clone()));
        }
        let target_path = target.map(Path::to_path_buf).unwrap_or_default();
        if volume.find_link(container.name(), &target_path).is_some() {
            return Err(Error::Busy(format!(
                "volume {} is already linked to {}",
                volume.id,
                container.name()
            )));
        }

        let mut link = VolumeLink {
            volume_path: volume.path.clone(),
            container: Arc::downgrade(container),
            container_name: container.name().to_string(),
            target: target_path,
            host_target: PathBuf::new(),
            read_only: read_only || volume.read_only,
            required,
            busy: false,
        };

        if !link.target.as_os_str().is_empty() && container.is_running() {
            let host_target = container.compose_path(&link.target);
            fsutil::create_dir_all(&host_target)?;
            mount::bind(&volume.path, &host_target, link.read_only)?;
            link.host_target = host_target.clone();
            st.links.insert(host_target, volume_path.to_path_buf());
        }

        let volume = st
            .volumes
            .get_mut(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;
        tracing::info!(volume = %volume.id, container = container.name(), required, "volume linked");
        volume.links.push(link);
        self.journal.save(&volume.id, &volume.dump())
    }

    /// Removes matching links; an empty target drops every link the
    /// container holds. Volumes left without links become UNLINKED and are
    /// returned for destruction.
    pub fn unlink(
        &self,
        volume_path: &Path,
        container_name: &str,
        target: Option<&Path>,
        strict: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut st = self.state.lock().unwrap();
        self.unlink_locked(&mut st, volume_path, container_name, target, strict)
    }

    fn unlink_locked(
        &self,
        st: &mut VolumesState,
        volume_path: &Path,
        container_name: &str,
        target: Option<&Path>,
        strict: bool,
    ) -> Result<Vec<PathBuf>> {
        let volume = st
            .volumes
            .get_mut(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;

        let matches: Vec<usize> = volume
            .links
            .iter()
            .enumerate()
            .filter(|(_, link)| {
                link.container_name == container_name
                    && target.map(|t| link.target == t).unwrap_or(true)
            })
            .map(|(i, _)| i)
            .collect();
        if matches.is_empty() {
            return Err(Error::NotFound(format!(
                "volume {} is not linked to {container_name}",
                volume.id
            )));
        }
        if strict && matches.iter().any(|&i| volume.links[i].busy) {
            return Err(Error::Busy(format!(
                "volume {} link to {container_name} is busy",
                volume.id
            )));
        }

        for &index in matches.iter().rev() {
            let link = volume.links.remove(index);
            if link.is_bound() {
                mount::umount_detach(&link.host_target)?;
                st.links.remove(&link.host_target);
            }
            tracing::info!(volume = %volume.id, container = container_name, "volume unlinked");
        }

        let mut unlinked = Vec::new();
        if volume.links.is_empty() && volume.state == VolumeState::Ready {
            volume.set_state(VolumeState::Unlinked)?;
            unlinked.push(volume.path.clone());
        }
        self.journal.save(&volume.id, &volume.dump())?;
        Ok(unlinked)
    }

    /// Drops every link a stopping container holds, across all volumes.
    pub fn unlink_all(&self, container_name: &str) -> Result<Vec<PathBuf>> {
        let mut st = self.state.lock().unwrap();
        let linked: Vec<PathBuf> = st
            .volumes
            .values()
            .filter(|v| v.links.iter().any(|l| l.container_name == container_name))
            .map(|v| v.path.clone())
            .collect();
        let mut unlinked = Vec::new();
        for path in linked {
            unlinked.extend(self.unlink_locked(&mut st, &path, container_name, None, false)?);
        }
        Ok(unlinked)
    }

    /// Destroys volumes collected from `unlink`, best-effort.
    pub fn delete_unlinked(&self, unlinked: &[PathBuf]) {
        for path in unlinked {
            if let Err(err) = self.delete(path) {
                tracing::warn!(path = %path.display(), %err, "failed to destroy unlinked volume");
            }
        }
    }

    /// Drives one volume to DESTROYED and drops its journal record.
    /// Deleting an already-destroyed volume is success; required links held
    /// by live containers and nested volumes refuse with `Busy`.
    pub fn delete(&self, volume_path: &Path) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.delete_locked(&mut st, volume_path)
    }

    fn delete_locked(&self, st: &mut VolumesState, volume_path: &Path) -> Result<()> {
        let Some(volume) = st.volumes.get_mut(volume_path) else {
            return Ok(());
        };
        if volume.has_required_links() {
            return Err(Error::Busy(format!(
                "volume {} has required links",
                volume.id
            )));
        }
        if !volume.nested.is_empty() {
            return Err(Error::Busy(format!(
                "volume {} has nested volumes",
                volume.id
            )));
        }

        let dropped: Vec<VolumeLink> = std::mem::take(&mut volume.links);
        for link in &dropped {
            if link.is_bound() {
                mount::umount_detach(&link.host_target)?;
                st.links.remove(&link.host_target);
            }
        }

        let volume = st
            .volumes
            .get_mut(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;
        if !volume.state.is_destroying() {
            volume.set_state(VolumeState::ToDestroy)?;
            self.journal.save(&volume.id, &volume.dump())?;
        }
        if volume.state == VolumeState::ToDestroy {
            volume.set_state(VolumeState::Destroying)?;
            self.journal.save(&volume.id, &volume.dump())?;
        }

        let backend = open_backend(volume.backend_type);
        backend.delete(volume)?;

        let claim_key = backend.claim_place(volume);
        if let Some(claimed) = st.claims.get_mut(&claim_key) {
            *claimed = claimed.saturating_sub(
                st.volumes
                    .get(volume_path)
                    .map(|v| v.claimed_space)
                    .unwrap_or(0),
            );
        }

        let volume = st
            .volumes
            .get_mut(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;
        volume.set_state(VolumeState::Destroyed)?;
        let id = volume.id.clone();
        self.journal.remove(&id)?;

        st.volumes.remove(volume_path);
        for other in st.volumes.values_mut() {
            other.nested.remove(volume_path);
        }
        tracing::info!(volume = id, path = %volume_path.display(), "volume destroyed");
        Ok(())
    }

    /// Best-effort teardown of every volume, children before parents.
    pub fn delete_all(&self) {
        let mut paths = self.volume_paths();
        paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for path in paths {
            if let Err(err) = self.delete(&path) {
                tracing::warn!(path = %path.display(), %err, "failed to destroy volume at shutdown");
            }
        }
    }

    /// Looks a link up by the host path its bind landed on.
    pub fn resolve_link(&self, host_target: &Path) -> Option<VolumeLink> {
        let st = self.state.lock().unwrap();
        let volume_path = st.links.get(host_target)?;
        st.volumes
            .get(volume_path)?
            .links
            .iter()
            .find(|link| link.host_target == host_target)
            .cloned()
    }

    /// Looks a link up by a path inside the deepest volume containing it.
    pub fn resolve_origin(&self, path: &Path) -> Option<VolumeLink> {
        let st = self.state.lock().unwrap();
        st.volumes
            .values()
            .filter(|v| path.starts_with(&v.path))
            .max_by_key(|v| v.path.components().count())?
            .links
            .first()
            .cloned()
    }

    /// Mutates limits, guarantees, labels and the private blob; anything
    /// else cannot be tuned. Limit changes delegate to the backend resize.
    pub fn tune(&self, volume_path: &Path, cfg: &BTreeMap<String, String>) -> Result<()> {
        let mut new_space_limit = None;
        let mut new_inode_limit = None;
        let mut new_space_guarantee = None;
        let mut new_inode_guarantee = None;
        let mut new_private = None;
        let mut new_labels = Vec::new();
        for (key, value) in cfg {
            match key.as_str() {
                "space_limit" => new_space_limit = Some(units::parse_size(value)?),
                "inode_limit" => new_inode_limit = Some(units::parse_size(value)?),
                "space_guarantee" => new_space_guarantee = Some(units::parse_size(value)?),
                "inode_guarantee" => new_inode_guarantee = Some(units::parse_size(value)?),
                "private" => new_private = Some(value.clone()),
                "labels" => {
                    for pair in value.split(';').filter(|p| !p.is_empty()) {
                        match pair.split_once('=') {
                            Some((k, v)) => new_labels.push((k.to_string(), v.to_string())),
                            None => {
                                return Err(Error::InvalidValue(format!("bad label {pair:?}")))
                            }
                        }
                    }
                }
                other => {
                    return Err(Error::InvalidValue(format!(
                        "volume property {other:?} cannot be tuned"
                    )))
                }
            }
        }

        let mut st = self.state.lock().unwrap();
        let volume = st
            .volumes
            .get_mut(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;
        if volume.state != VolumeState::Ready {
            return Err(Error::VolumeNotReady(volume.id.clone()));
        }

        let space_limit = new_space_limit.unwrap_or(volume.space_limit);
        let inode_limit = new_inode_limit.unwrap_or(volume.inode_limit);
        let space_guarantee = new_space_guarantee.unwrap_or(volume.space_guarantee);
        let inode_guarantee = new_inode_guarantee.unwrap_or(volume.inode_guarantee);
        if space_limit != 0 && space_guarantee > space_limit {
            return Err(Error::InvalidValue(
                "space_guarantee exceeds space_limit".into(),
            ));
        }
        if inode_limit != 0 && inode_guarantee > inode_limit {
            return Err(Error::InvalidValue(
                "inode_guarantee exceeds inode_limit".into(),
            ));
        }

        volume.set_state(VolumeState::Tuning)?;
        self.journal.save(&volume.id, &volume.dump())?;

        let resize_needed =
            space_limit != volume.space_limit || inode_limit != volume.inode_limit;
        let result = (|| {
            if resize_needed {
                let backend = open_backend(volume.backend_type);
                backend.resize(volume, space_limit, inode_limit)?;
                volume.space_limit = space_limit;
                volume.inode_limit = inode_limit;
            }
            volume.space_guarantee = space_guarantee;
            volume.inode_guarantee = inode_guarantee;
            if let Some(private_data) = new_private {
                volume.private_data = private_data;
            }
            for (key, value) in new_labels {
                if value.is_empty() {
                    volume.labels.remove(&key);
                } else {
                    volume.labels.insert(key, value);
                }
            }
            Ok(())
        })();

        volume.set_state(VolumeState::Ready)?;
        self.journal.save(&volume.id, &volume.dump())?;
        result
    }

    /// Verifies lower layers exist and form a DAG, and that every volume
    /// this one nests under is READY.
    pub fn check_dependencies(&self, volume_path: &Path) -> Result<()> {
        let st = self.state.lock().unwrap();
        let volume = st
            .volumes
            .get(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;

        let mut visited = vec![volume.path.clone()];
        let mut stack = vec![volume];
        while let Some(current) = stack.pop() {
            for layer in &current.layers {
                let layer_path = current.layer_path(layer);
                if !fsutil::exists(&layer_path) {
                    return Err(Error::LayerNotFound(layer.clone()));
                }
                if let Some(lower) = st.volumes.get(&layer_path) {
                    if visited.contains(&lower.path) {
                        return Err(Error::InvalidValue(format!(
                            "layer cycle through {}",
                            lower.path.display()
                        )));
                    }
                    if lower.state != VolumeState::Ready {
                        return Err(Error::VolumeNotReady(lower.id.clone()));
                    }
                    visited.push(lower.path.clone());
                    stack.push(lower);
                }
            }
        }

        for parent in st.volumes.values() {
            if volume.path != parent.path
                && volume.path.starts_with(&parent.path)
                && parent.state != VolumeState::Ready
            {
                return Err(Error::VolumeNotReady(parent.id.clone()));
            }
        }
        Ok(())
    }

    /// Verifies every required link a container holds points at a READY
    /// volume; a container must not start otherwise.
    pub fn check_required(&self, container_name: &str) -> Result<()> {
        let st = self.state.lock().unwrap();
        for volume in st.volumes.values() {
            let required = volume
                .links
                .iter()
                .any(|l| l.required && l.container_name == container_name);
            if required && volume.state != VolumeState::Ready {
                return Err(Error::VolumeNotReady(volume.id.clone()));
            }
        }
        Ok(())
    }

    pub fn stat_fs(&self, volume_path: &Path) -> Result<StatFs> {
        let st = self.state.lock().unwrap();
        let volume = st
            .volumes
            .get(volume_path)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume_path.display())))?;
        open_backend(volume.backend_type).stat_fs(volume)
    }

    /// Reconstructs every journaled volume, re-attaches backends, relinks
    /// restored containers and destroys orphans. Per-volume failures are
    /// logged and do not abort startup.
    pub fn restore_all(&self, containers: &ContainerMap) -> Result<()> {
        let records = self.journal.load_all()?;
        let mut resume_destroy = Vec::new();
        for (id, record) in records {
            {
                let mut st = self.state.lock().unwrap();
                if let Ok(seq) = id.parse::<u64>() {
                    st.next_id = st.next_id.max(seq);
                }
            }
            match self.restore_one(&record, containers) {
                Ok(Some(path)) => resume_destroy.push(path),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(id, %err, "failed to restore volume");
                }
            }
        }

        // resume interrupted destructions, then collect orphans
        for path in resume_destroy {
            if let Err(err) = self.delete(&path) {
                tracing::warn!(path = %path.display(), %err, "failed to resume volume destruction");
            }
        }
        let orphans: Vec<PathBuf> = {
            let st = self.state.lock().unwrap();
            st.volumes
                .values()
                .filter(|v| v.links.is_empty())
                .map(|v| v.path.clone())
                .collect()
        };
        for path in orphans {
            tracing::info!(path = %path.display(), "destroying orphan volume");
            if let Err(err) = self.delete(&path) {
                tracing::warn!(path = %path.display(), %err, "failed to destroy orphan volume");
            }
        }
        Ok(())
    }

    /// Restores one record. Returns the volume path when a destruction has
    /// to be resumed.
    fn restore_one(
        &self,
        record: &BTreeMap<String, String>,
        containers: &ContainerMap,
    ) -> Result<Option<PathBuf>> {
        let mut volume = Volume::load(record)?;
        let recorded_state = volume.state;
        volume.state = VolumeState::Configured;
        volume.claimed_space = 0;

        let backend = open_backend(volume.backend_type);
        backend.restore(&mut volume)?;

        volume.set_state(VolumeState::Building)?;
        if recorded_state != VolumeState::Ready && !recorded_state.is_destroying() {
            // the build never finished; re-run it, restore() made that safe
            if let Err(err) = backend.build(&mut volume) {
                tracing::warn!(volume = %volume.id, %err, "rebuild after crash failed");
                volume.set_state(VolumeState::Unready)?;
                self.journal.save(&volume.id, &volume.dump())?;
                let mut st = self.state.lock().unwrap();
                Self::register(&mut st, volume);
                return Err(err);
            }
        }
        volume.set_state(VolumeState::Ready)?;

        // re-attach links to the containers that still exist
        let mut kept_links = Vec::new();
        for mut link in std::mem::take(&mut volume.links) {
            match containers.get(&link.container_name) {
                Some(container) => {
                    link.container = Arc::downgrade(container);
                    if !link.target.as_os_str().is_empty() && container.is_running() {
                        let host_target = container.compose_path(&link.target);
                        if !Mount::is_mounted(&host_target)? {
                            fsutil::create_dir_all(&host_target)?;
                            mount::bind(&volume.path, &host_target, link.read_only)?;
                        }
                        link.host_target = host_target;
                    }
                    kept_links.push(link);
                }
                None => {
                    tracing::warn!(
                        volume = %volume.id,
                        container = link.container_name,
                        "dropping link to a container that no longer exists"
                    );
                }
            }
        }
        volume.links = kept_links;
        self.journal.save(&volume.id, &volume.dump())?;

        let mut st = self.state.lock().unwrap();
        let claim_key = backend.claim_place(&volume);
        volume.claimed_space = claim_size(&volume);
        *st.claims.entry(claim_key).or_default() += volume.claimed_space;
        for link in &volume.links {
            if link.is_bound() {
                st.links
                    .insert(link.host_target.clone(), volume.path.clone());
            }
        }
        let path = volume.path.clone();
        Self::register(&mut st, volume);
        if recorded_state.is_destroying() {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    fn register(st: &mut VolumesState, volume: Volume) {
        let path = volume.path.clone();
        let mut volume = volume;
        for (other_path, other) in st.volumes.iter_mut() {
            if other_path.starts_with(&path) && *other_path != path {
                volume.nested.insert(other_path.clone());
            }
            if path.starts_with(other_path) && *other_path != path {
                other.nested.insert(path.clone());
            }
        }
        st.volumes.insert(path, volume);
    }

    /// Debits the claim under the volumes lock; the place must keep room
    /// for every peer's guarantee.
    fn claim(st: &mut VolumesState, claim_key: &str, volume: &mut Volume) -> Result<()> {
        let size = claim_size(volume);
        let place_backed = claim_key == volume.place.display().to_string();
        if place_backed {
            let free = super::backend::statvfs_for(&volume.place)?.space_avail;
            let mut guarantees = volume.space_guarantee;
            for peer in st.volumes.values() {
                if open_backend(peer.backend_type).claim_place(peer) == claim_key {
                    guarantees += peer.space_guarantee;
                }
            }
            if size.saturating_add(guarantees) > free {
                return Err(Error::NoSpace(format!(
                    "place {} cannot cover {} claimed plus {} guaranteed",
                    volume.place.display(),
                    size,
                    guarantees
                )));
            }
        }
        *st.claims.entry(claim_key.to_string()).or_default() += size;
        volume.claimed_space = size;
        Ok(())
    }

    /// Ownership and permissions apply after a successful build; read-only
    /// volumes keep whatever the backend produced.
    fn apply_ownership(volume: &Volume) -> Result<()> {
        if volume.read_only {
            return Ok(());
        }
        fsutil::set_owner(&volume.path, volume.uid, volume.gid)?;
        if volume.uid.is_some() || volume.gid.is_some() {
            fsutil::set_mode(&volume.path, volume.permissions)?;
        }
        Ok(())
    }
}

impl Drop for VolumeManager {
    fn drop(&mut self) {
        // shutdown teardown is owned by the caller via delete_all(); the
        // drop only reports what was left behind
        let st = self.state.lock().unwrap();
        if !st.volumes.is_empty() {
            tracing::debug!(count = st.volumes.len(), "volume manager dropped with live volumes");
        }
    }
}
