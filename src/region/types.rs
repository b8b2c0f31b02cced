//! Region and dataitem data types

use serde::{Deserialize, Serialize};

use crate::memory::{AccessType, DataitemMemory, MemoryType};

/// Process-unique region identifier
pub type RegionId = u64;

/// Owner identity recorded at creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Real uid/gid of this process
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Unix-style permission mode (`0o640` and friends)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission(u32);

impl Permission {
    pub const fn new(mode: u32) -> Self {
        Self(mode & 0o777)
    }

    pub fn mode(&self) -> u32 {
        self.0
    }

    /// Permission bits (rwx) that apply to `caller` for an object owned by `owner`
    fn class_bits(&self, owner: &Owner, caller: &Owner) -> u32 {
        if caller.uid == owner.uid {
            (self.0 >> 6) & 0o7
        } else if caller.gid == owner.gid {
            (self.0 >> 3) & 0o7
        } else {
            self.0 & 0o7
        }
    }

    /// Whether `caller` may register an object owned by `owner` for `access`
    pub fn allows(&self, owner: &Owner, caller: &Owner, access: AccessType) -> bool {
        if caller.uid == 0 {
            return true;
        }
        let bits = self.class_bits(owner, caller);
        match access {
            AccessType::ReadOnly => bits & 0o4 != 0,
            AccessType::ReadWrite => bits & 0o6 == 0o6,
        }
    }
}

impl Default for Permission {
    fn default() -> Self {
        Self::new(0o600)
    }
}

impl From<u32> for Permission {
    fn from(mode: u32) -> Self {
        Self::new(mode)
    }
}

/// Placement attributes chosen at region creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAttributes {
    /// Servers the region is striped across; empty means this server only
    pub memory_server_ids: Vec<u64>,
    /// Stripe width in bytes; zero means unstriped
    pub interleave_size: u64,
    /// Overrides the service's memory type
    pub memory_type: Option<MemoryType>,
}

/// Snapshot of a region's attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub id: RegionId,
    pub name: String,
    pub size: u64,
    pub permission: Permission,
    pub owner: Owner,
    pub memory_type: MemoryType,
    pub memory_server_ids: Vec<u64>,
    pub interleave_size: u64,
    pub dataitem_count: usize,
    /// Sum of live dataitem extents
    pub used_bytes: u64,
    pub open_count: u64,
}

/// Live dataitem record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataitemInfo {
    pub region_id: RegionId,
    pub offset: u64,
    pub size: u64,
    pub permission: Permission,
    pub owner: Owner,
}

impl DataitemInfo {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Result of a successful allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionItemInfo {
    pub region_id: RegionId,
    pub offset: u64,
    pub size: u64,
    pub memory: DataitemMemory,
    pub memory_server_id: u64,
}

/// Whether a region's resources were reclaimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Everything was released
    Released,
    /// The region is still opened; backing memory stays until the last close
    Busy { open_count: u64 },
}
