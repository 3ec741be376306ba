use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaFile {
    pub version: u32,
    pub created_at: String,
    pub partitions: usize,
}

pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    fn db(&self) -> PathBuf { self.root.join("tables.sled") }
    fn meta(&self) -> PathBuf { self.root.join("meta.json") }
}

pub fn save_meta(paths: &StatePaths, meta: &MetaFile) -> Result<(), PipelineError> {
    create_dir_all(&paths.root)?;
    let mut f = File::create(paths.meta())?;
    let json = serde_json::to_string_pretty(meta)?;
    f.write_all(json.as_bytes())?;
    Ok(())
}

pub fn load_meta(paths: &StatePaths) -> Result<MetaFile, PipelineError> {
    let mut f = File::open(paths.meta())?;
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    let meta: MetaFile = serde_json::from_str(&buf)?;
    Ok(meta)
}

/// The sled database backing every table's change log.
#[derive(Clone)]
pub struct StateStore {
    db: sled::Db,
}

impl StateStore {
    /// Open (or create) the state directory. A state directory written with a
    /// different partition count is still usable: tables are not laid out by
    /// partition on disk.
    pub fn open(paths: &StatePaths, partitions: usize) -> Result<Self, PipelineError> {
        create_dir_all(&paths.root)?;
        match load_meta(paths) {
            Ok(meta) => {
                if meta.version != STATE_VERSION {
                    return Err(PipelineError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("state format version {} is not supported (expected {STATE_VERSION})", meta.version),
                    )));
                }
                if meta.partitions != partitions {
                    tracing::warn!(stored = meta.partitions, configured = partitions, "partition count changed since state was created");
                }
            }
            Err(PipelineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                let meta = MetaFile {
                    version: STATE_VERSION,
                    created_at: time::OffsetDateTime::now_utc()
                        .format(&time::format_description::well_known::Rfc3339)
                        .unwrap_or_else(|_| "".into()),
                    partitions,
                };
                save_meta(paths, &meta)?;
            }
            Err(e) => return Err(e),
        }
        let db = sled::open(paths.db())?;
        tracing::info!(path = %paths.root.display(), "opened state store");
        Ok(Self { db })
    }

    /// A store that lives only as long as the process.
    pub fn temporary() -> Result<Self, PipelineError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub(crate) fn tree(&self, name: &str) -> Result<sled::Tree, PipelineError> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn flush(&self) -> Result<(), PipelineError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_writes_meta_once() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        {
            let _store = StateStore::open(&paths, 2).unwrap();
        }
        let first = load_meta(&paths).unwrap();
        assert_eq!(first.version, STATE_VERSION);
        assert_eq!(first.partitions, 2);

        let _store = StateStore::open(&paths, 4).unwrap();
        assert_eq!(load_meta(&paths).unwrap(), first);
    }

    #[test]
    fn unknown_version_is_refused() {
        let dir = tempdir().unwrap();
        let paths = StatePaths::new(dir.path());
        save_meta(&paths, &MetaFile { version: 99, created_at: String::new(), partitions: 1 }).unwrap();
        assert!(StateStore::open(&paths, 1).is_err());
    }
}
