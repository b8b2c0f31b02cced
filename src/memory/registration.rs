//! Registration of region memory for one-sided remote access
//!
//! A registration hands out a capability triple (key, base address, node
//! address). Requests presenting the key are authorized against the entries
//! recorded here; entries only ever grant the access type they were created
//! with.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::error::{FamError, Result};

use super::config::AccessType;

/// Opaque fabric address of a memory server
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeAddr(Vec<u8>);

impl NodeAddr {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(text) => write!(f, "NodeAddr({:?})", text),
            Err(_) => write!(f, "NodeAddr({:02x?})", self.0),
        }
    }
}

impl From<&str> for NodeAddr {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

/// Capability a peer needs to target registered memory directly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryCapability {
    pub key: u64,
    pub base_addr: u64,
    pub node_addr: NodeAddr,
    pub access: AccessType,
}

/// Capability scoped to a single dataitem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataitemMemory {
    pub capability: MemoryCapability,
    /// Region-relative offset of the dataitem
    pub offset: u64,
    pub size: u64,
}

/// Recorded registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrationEntry {
    pub key: u64,
    pub access: AccessType,
    /// Region-relative start of the registered range
    pub offset: u64,
    pub len: u64,
}

/// Source of registration keys, unique per memory server
#[derive(Debug)]
pub struct KeyGenerator {
    server_bits: u64,
    counter: AtomicU64,
}

impl KeyGenerator {
    pub fn new(memory_server_id: u64) -> Self {
        Self {
            server_bits: (memory_server_id & 0xffff) << 48,
            counter: AtomicU64::new(1),
        }
    }

    pub fn next_key(&self) -> u64 {
        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) & ((1 << 48) - 1);
        self.server_bits | sequence
    }
}

/// Registration entries of one region
#[derive(Debug, Default)]
pub struct RegistrationTable {
    region: HashMap<AccessType, RegistrationEntry>,
    dataitems: HashMap<(u64, AccessType), RegistrationEntry>,
    /// Region-wide entries that outlive the last close
    pinned: HashSet<AccessType>,
}

impl RegistrationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a region-wide registration for `access` exists
    pub fn register_region(
        &mut self,
        access: AccessType,
        region_size: u64,
        keys: &KeyGenerator,
    ) -> RegistrationEntry {
        let entry = self.region.entry(access).or_insert_with(|| RegistrationEntry {
            key: keys.next_key(),
            access,
            offset: 0,
            len: region_size,
        });
        entry.len = region_size;
        *entry
    }

    /// Region-wide registration kept until the region's contents are released
    pub fn pin_region(
        &mut self,
        access: AccessType,
        region_size: u64,
        keys: &KeyGenerator,
    ) -> RegistrationEntry {
        self.pinned.insert(access);
        self.register_region(access, region_size, keys)
    }

    pub fn region_entry(&self, access: AccessType) -> Option<RegistrationEntry> {
        self.region.get(&access).copied()
    }

    /// Ensure a registration covering the dataitem at `offset` exists
    pub fn register_dataitem(
        &mut self,
        offset: u64,
        len: u64,
        access: AccessType,
        keys: &KeyGenerator,
    ) -> RegistrationEntry {
        *self
            .dataitems
            .entry((offset, access))
            .or_insert_with(|| RegistrationEntry {
                key: keys.next_key(),
                access,
                offset,
                len,
            })
    }

    pub fn dataitem_entry(&self, offset: u64, access: AccessType) -> Option<RegistrationEntry> {
        self.dataitems.get(&(offset, access)).copied()
    }

    /// Drop every registration of the dataitem at `offset`
    pub fn release_dataitem(&mut self, offset: u64) {
        self.dataitems.retain(|(item_offset, _), _| *item_offset != offset);
    }

    /// Keep region-wide registrations in step with a resized region
    pub fn resize_region(&mut self, region_size: u64) {
        for entry in self.region.values_mut() {
            entry.len = region_size;
        }
    }

    /// Drop the unpinned region-wide registrations, keeping dataitem ones
    pub fn release_region_entries(&mut self) {
        let pinned = &self.pinned;
        self.region.retain(|access, _| pinned.contains(access));
    }

    pub fn clear(&mut self) {
        self.region.clear();
        self.dataitems.clear();
        self.pinned.clear();
    }

    pub fn len(&self) -> usize {
        self.region.len() + self.dataitems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that `key` grants `required` access to `[offset, offset + len)`
    pub fn authorize(&self, key: u64, required: AccessType, offset: u64, len: u64) -> Result<()> {
        let entry = self
            .region
            .values()
            .chain(self.dataitems.values())
            .find(|entry| entry.key == key)
            .ok_or_else(|| {
                FamError::permission_denied(format!("key {:#x} is not registered", key))
            })?;

        if !entry.access.permits(required) {
            return Err(FamError::permission_denied(format!(
                "key {:#x} is registered {}, operation needs {}",
                key,
                entry.access.name(),
                required.name()
            )));
        }

        let end = offset
            .checked_add(len)
            .ok_or_else(|| FamError::invalid_range("operation range overflows"))?;
        if offset < entry.offset || end > entry.offset + entry.len {
            return Err(FamError::permission_denied(format!(
                "key {:#x} does not cover [{}, {})",
                key, offset, end
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_region_registration_is_idempotent() {
        let keys = KeyGenerator::new(3);
        let mut table = RegistrationTable::new();

        let first = table.register_region(AccessType::ReadWrite, 4096, &keys);
        let second = table.register_region(AccessType::ReadWrite, 4096, &keys);
        assert_eq!(first, second);
        assert_eq!(first.key >> 48, 3);

        let read_only = table.register_region(AccessType::ReadOnly, 4096, &keys);
        assert_ne!(read_only.key, first.key);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_pinned_entry_survives_release() {
        let keys = KeyGenerator::new(0);
        let mut table = RegistrationTable::new();
        let pinned = table.pin_region(AccessType::ReadWrite, 4096, &keys);
        table.register_region(AccessType::ReadOnly, 4096, &keys);

        table.release_region_entries();
        assert_eq!(table.region_entry(AccessType::ReadWrite), Some(pinned));
        assert_eq!(table.region_entry(AccessType::ReadOnly), None);

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_authorize_scopes() {
        let keys = KeyGenerator::new(0);
        let mut table = RegistrationTable::new();
        let item = table.register_dataitem(128, 64, AccessType::ReadOnly, &keys);

        assert!(table.authorize(item.key, AccessType::ReadOnly, 128, 64).is_ok());

        let err = table
            .authorize(item.key, AccessType::ReadWrite, 128, 8)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = table
            .authorize(item.key, AccessType::ReadOnly, 120, 16)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        table.release_dataitem(128);
        assert!(table.authorize(item.key, AccessType::ReadOnly, 128, 8).is_err());
    }
}
