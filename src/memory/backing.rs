//! Mapped memory backing a region

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use log::warn;
use memmap2::{MmapMut, MmapOptions};

use crate::error::{FamError, Result};

use super::config::MemoryType;

/// Byte storage for one region: an anonymous mapping for volatile memory or a
/// file mapping for persistent memory
#[derive(Debug)]
pub struct MemoryBacking {
    mmap: MmapMut,
    memory_type: MemoryType,
    /// Backing file and its path for persistent regions
    file: Option<(File, PathBuf)>,
}

impl MemoryBacking {
    /// Map `size` bytes of anonymous memory
    pub fn volatile(size: u64) -> Result<Self> {
        let mmap = Self::map_anon(size)?;
        Ok(Self {
            mmap,
            memory_type: MemoryType::Volatile,
            file: None,
        })
    }

    /// Create (or truncate) `path` to `size` bytes and map it
    pub fn persistent(path: &Path, size: u64, permissions: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(permissions)
            .open(path)
            .map_err(|e| FamError::from_io(e, "Failed to create backing file"))?;

        file.set_len(size)
            .map_err(|e| FamError::from_io(e, "Failed to set backing file size"))?;

        let mmap = Self::map_file(&file, size)?;
        Ok(Self {
            mmap,
            memory_type: MemoryType::Persistent,
            file: Some((file, path.to_path_buf())),
        })
    }

    fn checked_len(size: u64) -> Result<usize> {
        usize::try_from(size)
            .map_err(|_| FamError::invalid_parameter("size", "Region size exceeds address space"))
    }

    fn map_anon(size: u64) -> Result<MmapMut> {
        MmapOptions::new()
            .len(Self::checked_len(size)?)
            .map_anon()
            .map_err(|e| FamError::from_io(e, "Failed to create anonymous mapping"))
    }

    fn map_file(file: &File, size: u64) -> Result<MmapMut> {
        let len = Self::checked_len(size)?;
        // The file outlives the mapping and is only resized under &mut self.
        unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(file)
                .map_err(|e| FamError::from_io(e, "Failed to create memory mapping"))
        }
    }

    /// Grow or shrink the mapping, preserving the common prefix
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        match &self.file {
            None => {
                let mut mmap = Self::map_anon(new_size)?;
                let keep = self.mmap.len().min(mmap.len());
                mmap[..keep].copy_from_slice(&self.mmap[..keep]);
                self.mmap = mmap;
            }
            Some((file, _)) => {
                self.mmap
                    .flush()
                    .map_err(|e| FamError::from_io(e, "Failed to flush before resize"))?;
                file.set_len(new_size)
                    .map_err(|e| FamError::from_io(e, "Failed to resize backing file"))?;
                self.mmap = Self::map_file(file, new_size)?;
            }
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Process-local address of the first byte
    pub fn base_addr(&self) -> u64 {
        self.mmap.as_ptr() as u64
    }

    /// Raw pointer to the first byte
    ///
    /// Valid until the next [`resize`](Self::resize) or until the backing is dropped.
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// Flush changes to persistent storage (no-op for volatile memory)
    pub fn flush(&self) -> Result<()> {
        if self.file.is_some() {
            self.mmap
                .flush()
                .map_err(|e| FamError::from_io(e, "Failed to flush memory mapping"))?;
        }
        Ok(())
    }

    /// Remove the backing file of a persistent region
    ///
    /// The mapping stays valid until the backing is dropped.
    pub fn discard(&mut self) {
        if let Some((_, path)) = self.file.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to remove backing file {}: {}", path.display(), e);
            }
        }
    }
}
