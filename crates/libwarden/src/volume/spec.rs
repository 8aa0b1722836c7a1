//! Parsing and validation of the `volume.create` configuration map.

use std::collections::BTreeMap;
use std::path::PathBuf;

use warden_common::error::{Error, Result};
use warden_common::units;

use super::{parse_bool, parse_id, BackendType};

/// One initial link request: `ct[:target[:ro[:rq]]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub container: String,
    pub target: Option<PathBuf>,
    pub read_only: bool,
    pub required: bool,
}

impl LinkSpec {
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.split(':');
        let container = parts
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidValue(format!("bad container link {entry:?}")))?
            .to_string();
        let target = match parts.next() {
            None | Some("") => None,
            Some(target) => Some(PathBuf::from(target)),
        };
        let read_only = match parts.next() {
            None | Some("") => false,
            Some(flag) => parse_bool(flag)?,
        };
        let required = match parts.next() {
            None | Some("") => false,
            Some(flag) => parse_bool(flag)?,
        };
        if parts.next().is_some() {
            return Err(Error::InvalidValue(format!(
                "bad container link {entry:?}"
            )));
        }
        Ok(LinkSpec {
            container,
            target,
            read_only,
            required,
        })
    }
}

/// A validated `volume.create` request. Unknown keys are rejected, limits
/// carry K/M/G suffixes, and guarantees may not exceed limits.
#[derive(Debug, Clone, Default)]
pub struct VolumeSpec {
    pub path: Option<PathBuf>,
    pub backend: BackendType,
    pub storage: String,
    pub layers: Vec<String>,
    pub space_limit: u64,
    pub inode_limit: u64,
    pub space_guarantee: u64,
    pub inode_guarantee: u64,
    pub read_only: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub containers: Vec<LinkSpec>,
    pub place: Option<PathBuf>,
    pub place_key: Option<String>,
    pub owner_container: String,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub private_data: String,
    pub labels: BTreeMap<String, String>,
    pub target_container: Option<String>,
}

impl VolumeSpec {
    pub fn parse(cfg: &BTreeMap<String, String>) -> Result<Self> {
        let mut spec = VolumeSpec::default();
        for (key, value) in cfg {
            match key.as_str() {
                "path" => {
                    if !value.is_empty() {
                        spec.path = Some(PathBuf::from(value));
                    }
                }
                "backend" => spec.backend = value.parse()?,
                "storage" => spec.storage = value.clone(),
                "layers" => {
                    spec.layers = value
                        .split(';')
                        .filter(|l| !l.is_empty())
                        .map(String::from)
                        .collect()
                }
                "space_limit" => spec.space_limit = units::parse_size(value)?,
                "inode_limit" => spec.inode_limit = units::parse_size(value)?,
                "space_guarantee" => spec.space_guarantee = units::parse_size(value)?,
                "inode_guarantee" => spec.inode_guarantee = units::parse_size(value)?,
                "read_only" => spec.read_only = parse_bool(value)?,
                "user" => spec.uid = Some(parse_id(value)?),
                "group" => spec.gid = Some(parse_id(value)?),
                "permissions" => {
                    spec.permissions = Some(u32::from_str_radix(value, 8).map_err(|_| {
                        Error::InvalidValue(format!("bad permissions {value:?}"))
                    })?)
                }
                "containers" => {
                    spec.containers = value
                        .split(';')
                        .filter(|e| !e.is_empty())
                        .map(LinkSpec::parse)
                        .collect::<Result<_>>()?
                }
                "place" => {
                    if !value.is_empty() {
                        spec.place = Some(PathBuf::from(value));
                    }
                }
                "place_key" => spec.place_key = Some(value.clone()),
                "owner_container" => spec.owner_container = value.clone(),
                "owner_user" => spec.owner_uid = Some(parse_id(value)?),
                "owner_group" => spec.owner_gid = Some(parse_id(value)?),
                "private" => spec.private_data = value.clone(),
                "labels" => {
                    for pair in value.split(';').filter(|p| !p.is_empty()) {
                        let (k, v) = pair.split_once('=').ok_or_else(|| {
                            Error::InvalidValue(format!("bad label {pair:?}"))
                        })?;
                        spec.labels.insert(k.to_string(), v.to_string());
                    }
                }
                "target_container" => spec.target_container = Some(value.clone()),
                other => {
                    return Err(Error::InvalidValue(format!(
                        "unknown volume property {other:?}"
                    )))
                }
            }
        }

        if spec.space_limit != 0 && spec.space_guarantee > spec.space_limit {
            return Err(Error::InvalidValue(
                "space_guarantee exceeds space_limit".into(),
            ));
        }
        if spec.inode_limit != 0 && spec.inode_guarantee > spec.inode_limit {
            return Err(Error::InvalidValue(
                "inode_guarantee exceeds inode_limit".into(),
            ));
        }
        if let Some(path) = &spec.path {
            if !path.is_absolute() && spec.target_container.is_none() {
                return Err(Error::InvalidValue(format!(
                    "volume path {} is not absolute",
                    path.display()
                )));
            }
        }
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_full_spec() {
        let spec = VolumeSpec::parse(&cfg(&[
            ("path", "/mnt/data"),
            ("backend", "overlay"),
            ("layers", "base;patch"),
            ("space_limit", "1G"),
            ("space_guarantee", "256M"),
            ("read_only", "true"),
            ("user", "1000"),
            ("permissions", "0775"),
            ("containers", "web:/data;db:/db:true:true"),
            ("labels", "tier=hot;kind=scratch"),
            ("private", "blob"),
        ]))
        .unwrap();

        assert_eq!(spec.backend, BackendType::Overlay);
        assert_eq!(spec.layers, vec!["base", "patch"]);
        assert_eq!(spec.space_limit, 1 << 30);
        assert_eq!(spec.space_guarantee, 256 << 20);
        assert!(spec.read_only);
        assert_eq!(spec.uid, Some(1000));
        assert_eq!(spec.permissions, Some(0o775));
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[0].container, "web");
        assert!(!spec.containers[0].required);
        assert!(spec.containers[1].read_only);
        assert!(spec.containers[1].required);
        assert_eq!(spec.labels.get("tier").map(String::as_str), Some("hot"));
    }

    #[test]
    fn rejects_unknown_key() {
        let err = VolumeSpec::parse(&cfg(&[("shiny", "yes")])).unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }

    #[test]
    fn rejects_bad_bool_and_size() {
        assert!(VolumeSpec::parse(&cfg(&[("read_only", "yes")])).is_err());
        assert!(VolumeSpec::parse(&cfg(&[("space_limit", "10X")])).is_err());
    }

    #[test]
    fn rejects_guarantee_over_limit() {
        let err = VolumeSpec::parse(&cfg(&[
            ("space_limit", "1M"),
            ("space_guarantee", "2M"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));
    }

    #[test]
    fn link_spec_forms() {
        assert_eq!(
            LinkSpec::parse("web").unwrap(),
            LinkSpec {
                container: "web".into(),
                target: None,
                read_only: false,
                required: false,
            }
        );
        let full = LinkSpec::parse("db:/var/lib/db:true:true").unwrap();
        assert_eq!(full.target, Some(PathBuf::from("/var/lib/db")));
        assert!(full.read_only && full.required);
        assert!(LinkSpec::parse("").is_err());
        assert!(LinkSpec::parse("a:b:c:d:e").is_err());
        assert!(LinkSpec::parse("a:/t:maybe").is_err());
    }
}
