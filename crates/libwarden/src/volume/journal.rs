//! The crash-recovery journal: one JSON record per volume, keyed by id,
//! holding the attribute map as strings. Records are rewritten atomically
//! so a restart never loads a half-written one.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use warden_common::error::{Error, IoResultExt, Result};
use warden_common::fsutil;

pub const K_ID: &str = "id";
pub const K_PATH: &str = "path";
pub const K_INTERNAL_PATH: &str = "internal_path";
pub const K_BACKEND: &str = "backend";
pub const K_STATE: &str = "state";
pub const K_PLACE: &str = "place";
pub const K_STORAGE: &str = "storage";
pub const K_LAYERS: &str = "layers";
pub const K_READ_ONLY: &str = "read_only";
pub const K_KEEP_STORAGE: &str = "keep_storage";
pub const K_SPACE_LIMIT: &str = "space_limit";
pub const K_INODE_LIMIT: &str = "inode_limit";
pub const K_SPACE_GUARANTEE: &str = "space_guarantee";
pub const K_INODE_GUARANTEE: &str = "inode_guarantee";
pub const K_USER: &str = "user";
pub const K_GROUP: &str = "group";
pub const K_PERMISSIONS: &str = "permissions";
pub const K_OWNER_CONTAINER: &str = "owner_container";
pub const K_OWNER_USER: &str = "owner_user";
pub const K_OWNER_GROUP: &str = "owner_group";
pub const K_CREATOR: &str = "creator";
pub const K_PRIVATE: &str = "private";
pub const K_LABELS: &str = "labels";
pub const K_DEVICE_NAME: &str = "device_name";
pub const K_BUILD_TIME: &str = "build_time";
pub const K_CHANGE_TIME: &str = "change_time";

// Internal fields carry a leading underscore.
pub const K_RAW_LOOP_DEV: &str = "_loop_dev";
pub const K_RAW_AUTO_PATH: &str = "_auto_path";
pub const K_RAW_CONTAINERS: &str = "_containers";

pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self> {
        let dir = dir.into();
        fsutil::create_dir_all(&dir)?;
        Ok(Journal { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes the record through a temp file and renames it into place.
    pub fn save(&self, id: &str, record: &BTreeMap<String, String>) -> Result<()> {
        let tmp_path = self.dir.join(format!(".{id}.tmp"));
        let file = File::create(&tmp_path).path_context("create", &tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record)
            .map_err(|err| Error::Unknown(format!("failed to encode journal record {id}: {err}")))?;
        writer.flush().path_context("write", &tmp_path)?;
        let path = self.record_path(id);
        fs::rename(&tmp_path, &path).path_context("rename", &path)?;
        tracing::debug!(id, path = %path.display(), "journal record saved");
        Ok(())
    }

    /// Drops the record; absence is success.
    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).path_context("remove", &path),
        }
    }

    pub fn load(&self, id: &str) -> Result<BTreeMap<String, String>> {
        let path = self.record_path(id);
        let file = File::open(&path).path_context("open", &path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|err| Error::Unknown(format!("failed to decode journal record {id}: {err}")))
    }

    /// Enumerates every record, skipping ones that fail to decode with a
    /// warning; a corrupt record must not abort startup.
    pub fn load_all(&self) -> Result<Vec<(String, BTreeMap<String, String>)>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir).path_context("read dir", &self.dir)? {
            let entry = entry.path_context("read dir", &self.dir)?;
            let path = entry.path();
            let id = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name.ends_with(".json") => {
                    name.trim_end_matches(".json").to_string()
                }
                _ => continue,
            };
            match self.load(&id) {
                Ok(record) => records.push((id, record)),
                Err(err) => {
                    tracing::warn!(id, %err, "skipping corrupt journal record");
                }
            }
        }
        records.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn save_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = Journal::open(tmp.path().join("kv")).unwrap();
        let rec = record(&[(K_ID, "3"), (K_BACKEND, "loop"), (K_STATE, "READY")]);
        journal.save("3", &rec).unwrap();
        assert_eq!(journal.load("3").unwrap(), rec);
    }

    #[test]
    fn load_all_skips_corrupt_records() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = Journal::open(tmp.path()).unwrap();
        journal.save("1", &record(&[(K_ID, "1")])).unwrap();
        journal.save("2", &record(&[(K_ID, "2")])).unwrap();
        std::fs::write(tmp.path().join("9.json"), "{ not json").unwrap();

        let all = journal.load_all().unwrap();
        let ids: Vec<&str> = all.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = Journal::open(tmp.path()).unwrap();
        journal.save("5", &record(&[(K_ID, "5")])).unwrap();
        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["5.json"]);
    }

    #[test]
    fn remove_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let journal = Journal::open(tmp.path()).unwrap();
        journal.save("4", &record(&[(K_ID, "4")])).unwrap();
        journal.remove("4").unwrap();
        journal.remove("4").unwrap();
        assert!(journal.load("4").is_err());
    }
}
