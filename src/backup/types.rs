//! Backup requests, metadata records and access filtering

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::region::RegionId;

/// Backup of a dataitem range into durable storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub src_region_id: RegionId,
    /// Region-relative offset of the first byte to save; for a dataitem
    /// striped over several servers, its base on the executing server
    pub src_offset: u64,
    pub size: u64,
    pub chunk_size: u64,
    pub used_memserver_cnt: u64,
    /// Byte position in the backup where this section starts
    pub file_start_pos: u64,
    pub backup_name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub dataitem_name: String,
    pub item_size: u64,
    pub write_metadata: bool,
}

/// Restore of a backup section into a dataitem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub dest_region_id: RegionId,
    /// Region-relative offset of the first byte to overwrite; for a
    /// dataitem striped over several servers, its base on the executing server
    pub dest_offset: u64,
    pub size: u64,
    pub chunk_size: u64,
    pub used_memserver_cnt: u64,
    pub file_start_pos: u64,
    pub backup_name: String,
}

/// Metadata record persisted ahead of a backup's chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_name: String,
    pub dataitem_name: String,
    pub item_size: u64,
    pub chunk_size: u64,
    pub used_memserver_cnt: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub created_at: SystemTime,
}

/// Read-only view of a stored backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub dataitem_name: String,
    pub item_size: u64,
    pub chunk_size: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    /// Bytes of chunk data currently stored
    pub stored_bytes: u64,
    pub created_at: SystemTime,
}

impl BackupInfo {
    pub fn from_metadata(metadata: BackupMetadata, stored_bytes: u64) -> Self {
        Self {
            name: metadata.backup_name,
            dataitem_name: metadata.dataitem_name,
            item_size: metadata.item_size,
            chunk_size: metadata.chunk_size,
            uid: metadata.uid,
            gid: metadata.gid,
            mode: metadata.mode,
            stored_bytes,
            created_at: metadata.created_at,
        }
    }
}

/// Requester identity and requested access bits used to filter metadata
/// queries
///
/// The filter decides visibility only: a backup the requester may not read
/// is reported as missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFilter {
    pub uid: u32,
    pub gid: u32,
    /// Requested rwx bits (`0o4` = read)
    pub mode: u32,
}

impl AccessFilter {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        Self { uid, gid, mode }
    }

    /// Filter asking for read access as `uid`/`gid`
    pub fn reader(uid: u32, gid: u32) -> Self {
        Self::new(uid, gid, 0o4)
    }

    pub fn allows(&self, metadata: &BackupMetadata) -> bool {
        if self.uid == 0 {
            return true;
        }
        let bits = if self.uid == metadata.uid {
            (metadata.mode >> 6) & 0o7
        } else if self.gid == metadata.gid {
            (metadata.mode >> 3) & 0o7
        } else {
            metadata.mode & 0o7
        };
        let wanted = self.mode & 0o7;
        bits & wanted == wanted
    }
}
