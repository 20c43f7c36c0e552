//! On-disk persistence of collections.
//!
//! Each collection is stored as a JSON array of documents:
//! ```text
//! <DATA_DIR>/
//!   patients.json
//!   appointments.json
//!   ...
//! ```
//!
//! Writes go to a temporary file that is renamed over the previous one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use medisync_core::Document;

const EXTENSION: &str = "json";

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error reading or writing a file.
    IoError(PathBuf, io::Error),
    /// A collection file does not hold a list of documents.
    ParseError(PathBuf, serde_json::Error),
    /// Invalid collection name (e.g., contains path separators).
    InvalidCollection(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            StorageError::ParseError(path, e) => {
                write!(f, "Failed to parse collection {}: {}", path.display(), e)
            }
            StorageError::InvalidCollection(name) => {
                write!(f, "Invalid collection name: {}", name)
            }
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::IoError(_, e) => Some(e),
            StorageError::ParseError(_, e) => Some(e),
            StorageError::InvalidCollection(_) => None,
        }
    }
}

/// Whether `name` can be used as a collection name and file stem.
pub fn is_valid_collection(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// JSON-file persistence for collections.
#[derive(Debug, Clone)]
pub struct CollectionStorage {
    data_dir: PathBuf,
}

impl CollectionStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_collection(collection) {
            return Err(StorageError::InvalidCollection(collection.to_string()));
        }
        Ok(self
            .data_dir
            .join(format!("{}.{}", collection, EXTENSION)))
    }

    /// Loads a collection. A collection that was never saved is empty.
    pub fn load(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        let path = self.collection_path(collection)?;
        match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| StorageError::ParseError(path, e))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StorageError::IoError(path, e)),
        }
    }

    /// Loads every persisted collection, sorted by name.
    pub fn load_all(&self) -> Result<Vec<(String, Vec<Document>)>, StorageError> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::IoError(self.data_dir.clone(), e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::IoError(self.data_dir.clone(), e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_collection(stem) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let docs = self.load(&name)?;
                Ok((name, docs))
            })
            .collect()
    }

    /// Saves a collection, replacing what was stored before.
    pub fn save(&self, collection: &str, docs: &[Document]) -> Result<(), StorageError> {
        let path = self.collection_path(collection)?;
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| StorageError::IoError(self.data_dir.clone(), e))?;

        let bytes = serde_json::to_vec_pretty(docs)
            .map_err(|e| StorageError::ParseError(path.clone(), e))?;

        let temp_path = path.with_extension("json.tmp");
        let mut file =
            File::create(&temp_path).map_err(|e| StorageError::IoError(temp_path.clone(), e))?;
        file.write_all(&bytes)
            .map_err(|e| StorageError::IoError(temp_path.clone(), e))?;
        file.sync_all()
            .map_err(|e| StorageError::IoError(temp_path.clone(), e))?;

        // Rename to final path (atomic on most filesystems)
        fs::rename(&temp_path, &path).map_err(|e| StorageError::IoError(path, e))?;

        Ok(())
    }
}
