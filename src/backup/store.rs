//! Filesystem backup storage
//!
//! Each backup `name` is a chunk file `name.chunks` holding the raw bytes at
//! their file positions, plus an optional `name.meta` record encoded with
//! bincode.

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind as IoErrorKind, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use log::debug;

use crate::error::{FamError, Result};

use super::types::BackupMetadata;

const CHUNK_SUFFIX: &str = "chunks";
const META_SUFFIX: &str = "meta";

/// Durable backup storage rooted at one directory
#[derive(Debug, Clone)]
pub struct FsBackupStore {
    root: PathBuf,
}

impl FsBackupStore {
    /// Open (creating if needed) the backup directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| FamError::from_io(e, "Failed to create backup directory"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\0')
        {
            return Err(FamError::invalid_parameter(
                "backup_name",
                format!("{:?} is not a valid backup name", name),
            ));
        }
        Ok(())
    }

    fn path(&self, name: &str, suffix: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(format!("{}.{}", name, suffix)))
    }

    /// Persist the metadata record; an existing record is a name collision
    pub fn write_metadata(&self, metadata: &BackupMetadata) -> Result<()> {
        let path = self.path(&metadata.backup_name, META_SUFFIX)?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                return Err(FamError::name_collision(&metadata.backup_name));
            }
            Err(e) => return Err(FamError::from_io(e, "Failed to create backup metadata")),
        };
        let encoded = bincode::serialize(metadata)?;
        file.write_all(&encoded)
            .and_then(|_| file.sync_all())
            .map_err(|e| FamError::from_io(e, "Failed to write backup metadata"))?;
        debug!("backup metadata written for {}", metadata.backup_name);
        Ok(())
    }

    pub fn read_metadata(&self, name: &str) -> Result<Option<BackupMetadata>> {
        let path = self.path(name, META_SUFFIX)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(FamError::from_io(e, "Failed to read backup metadata")),
        }
    }

    /// Open the chunk file for writing, creating it if needed
    pub fn open_chunks_for_write(&self, name: &str) -> Result<File> {
        let path = self.path(name, CHUNK_SUFFIX)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| FamError::from_io(e, "Failed to open backup chunk file"))
    }

    pub fn open_chunks(&self, name: &str) -> Result<File> {
        let path = self.path(name, CHUNK_SUFFIX)?;
        File::open(&path).map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                FamError::not_found(format!("backup {}", name))
            } else {
                FamError::from_io(e, "Failed to open backup chunk file")
            }
        })
    }

    pub fn write_chunk(file: &File, position: u64, bytes: &[u8]) -> Result<()> {
        file.write_all_at(bytes, position)
            .map_err(|e| FamError::from_io(e, "Failed to write backup chunk"))
    }

    pub fn read_chunk(file: &File, position: u64, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        file.read_exact_at(&mut buffer, position)
            .map_err(|e| FamError::from_io(e, "Failed to read backup chunk"))?;
        Ok(buffer)
    }

    /// Bytes of chunk data stored for `name`, or `None` if there are none
    pub fn stored_bytes(&self, name: &str) -> Result<Option<u64>> {
        let path = self.path(name, CHUNK_SUFFIX)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(FamError::from_io(e, "Failed to stat backup chunk file")),
        }
    }

    /// Remove chunks and metadata; a missing backup is not an error
    pub fn delete(&self, name: &str) -> Result<()> {
        for suffix in [CHUNK_SUFFIX, META_SUFFIX] {
            let path = self.path(name, suffix)?;
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(FamError::from_io(e, "Failed to delete backup")),
            }
        }
        Ok(())
    }

    /// Metadata of every backup that has a metadata record
    pub fn list(&self) -> Result<Vec<BackupMetadata>> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| FamError::from_io(e, "Failed to list backup directory"))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FamError::from_io(e, "Failed to list backup directory"))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(META_SUFFIX) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if let Some(metadata) = self.read_metadata(name)? {
                found.push(metadata);
            }
        }
        found.sort_by(|a, b| a.backup_name.cmp(&b.backup_name));
        Ok(found)
    }
}
