use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File holding the mapping from original to stored names.
pub const MASTER_LIST_FILE: &str = "master";
pub const RANDOM_NAME_BYTES: usize = 16;
const MAX_NAME_ATTEMPTS: usize = 16;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("`{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("`{0}` is not a valid stored file name")]
    InvalidName(String),
    #[error("no stored file named `{0}`")]
    NotFound(String),
    #[error("`{name}` is not valid JSON")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no unused file name after {0} attempts")]
    NamesExhausted(usize),
}

pub type Result<T, E = StoreError> = core::result::Result<T, E>;

/// Flat namespace of named byte blobs.
pub trait FileStore {
    fn read_bytes(&self, name: &str) -> Result<Vec<u8>>;
    /// Replaces `name` atomically: readers see the old or the new content,
    /// never a partial write.
    fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<()>;
    fn exists(&self, name: &str) -> Result<bool>;
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\', '\0']);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_owned()))
    }
}

/// A [`FileStore`] over one directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            name: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl FileStore for DirStore {
    fn read_bytes(&self, name: &str) -> Result<Vec<u8>> {
        fs::read(self.path(name)?).map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(name.to_owned()),
            _ => StoreError::Io {
                name: name.to_owned(),
                source,
            },
        })
    }

    fn write_bytes(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        let tmp = self.root.join(format!(".{}.tmp", name));
        let io_error = |source| StoreError::Io {
            name: name.to_owned(),
            source,
        };
        fs::write(&tmp, bytes).map_err(io_error)?;
        if let Err(source) = fs::rename(&tmp, &path) {
            fs::remove_file(&tmp).ok();
            return Err(io_error(source));
        }
        log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name)?.exists())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileNameMapping {
    #[serde(alias = "OriginalName")]
    pub original_name: String,
    #[serde(alias = "SecureName")]
    pub secure_name: String,
}

impl FileNameMapping {
    pub fn new(original_name: impl Into<String>, secure_name: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            secure_name: secure_name.into(),
        }
    }

    /// Extension of the original name, without the dot.
    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.original_name)
            .extension()
            .and_then(|extension| extension.to_str())
    }
}

/// Ordered list of every file the vault holds.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MasterList {
    #[serde(alias = "FileMappings", default)]
    file_mappings: Vec<FileNameMapping>,
}

impl MasterList {
    /// Reads the list, or starts an empty one if none was saved yet.
    pub fn load(store: &impl FileStore) -> Result<Self> {
        if !store.exists(MASTER_LIST_FILE)? {
            return Ok(Self::default());
        }
        let bytes = store.read_bytes(MASTER_LIST_FILE)?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            name: MASTER_LIST_FILE.to_owned(),
            source,
        })
    }

    pub fn save(&self, store: &impl FileStore) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Json {
            name: MASTER_LIST_FILE.to_owned(),
            source,
        })?;
        store.write_bytes(MASTER_LIST_FILE, &bytes)
    }

    pub fn push(&mut self, mapping: FileNameMapping) {
        self.file_mappings.push(mapping);
    }

    pub fn mappings(&self) -> &[FileNameMapping] {
        &self.file_mappings
    }

    pub fn resolve(&self, secure_name: &str) -> Option<&FileNameMapping> {
        self.file_mappings
            .iter()
            .find(|mapping| mapping.secure_name == secure_name)
    }

    /// Most recently stored file with this original name.
    pub fn find_by_original(&self, original_name: &str) -> Option<&FileNameMapping> {
        self.file_mappings
            .iter()
            .rev()
            .find(|mapping| mapping.original_name == original_name)
    }

    /// A name used neither by the list nor by the store, built from
    /// `random` bytes. Draws again on collision.
    pub fn random_name<E, F>(&self, store: &impl FileStore, mut random: F) -> Result<String, E>
    where
        F: FnMut(usize) -> Result<Vec<u8>, E>,
        E: From<StoreError>,
    {
        for _ in 0..MAX_NAME_ATTEMPTS {
            let bytes = random(RANDOM_NAME_BYTES)?;
            let name = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
            let reserved = name == MASTER_LIST_FILE || name.starts_with('.');
            if !reserved && self.resolve(&name).is_none() && !store.exists(&name)? {
                return Ok(name);
            }
            log::debug!("random name `{}` is taken, drawing again", name);
        }
        Err(StoreError::NamesExhausted(MAX_NAME_ATTEMPTS).into())
    }
}
