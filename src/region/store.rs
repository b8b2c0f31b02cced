//! Region and dataitem store
//!
//! Each region owns one structural lock. Every mutation of a region's
//! dataitems, registrations or size happens under its write half, so
//! unrelated regions never contend with each other. Atomic operations hold the
//! read half while they touch memory, which keeps a concurrent deallocate or
//! destroy from pulling the dataitem out from under them.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use log::debug;

use crate::{
    error::{FamError, Result},
    memory::{MemoryBacking, MemoryType, RegistrationTable},
};

use super::{
    allocator::{Allocator, FreeListAllocator},
    types::{DataitemInfo, Owner, Permission, RegionAttributes, RegionId, RegionInfo},
};

/// Lifecycle of a region entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    /// Reserved, backing mapped, not yet visible to lifecycle calls
    Creating,
    Active,
    /// Destroyed while still opened; memory is reclaimed at the last close
    Destroyed,
}

/// Mutable structure of a region, guarded by the region's structural lock
#[derive(Debug)]
pub struct RegionStructure {
    pub state: RegionState,
    pub size: u64,
    pub allocator: FreeListAllocator,
    pub dataitems: BTreeMap<u64, DataitemInfo>,
    pub registrations: RegistrationTable,
    pub open_count: u64,
}

impl RegionStructure {
    pub fn ensure_active(&self, region_id: RegionId) -> Result<()> {
        match self.state {
            RegionState::Active => Ok(()),
            RegionState::Creating => Err(FamError::invalid_state(format!(
                "region {} is still being created",
                region_id
            ))),
            RegionState::Destroyed => Err(FamError::invalid_state(format!(
                "region {} has been destroyed",
                region_id
            ))),
        }
    }

    /// Live dataitem whose extent contains `offset`
    pub fn dataitem_containing(&self, offset: u64) -> Result<&DataitemInfo> {
        self.dataitems
            .range(..=offset)
            .next_back()
            .map(|(_, item)| item)
            .filter(|item| item.contains(offset))
            .ok_or_else(|| {
                FamError::invalid_range(format!("offset {} is not inside a live dataitem", offset))
            })
    }

    /// Live dataitem starting exactly at `offset`
    pub fn dataitem_at(&self, offset: u64) -> Result<&DataitemInfo> {
        self.dataitems
            .get(&offset)
            .ok_or_else(|| FamError::not_found(format!("dataitem at offset {}", offset)))
    }

    /// Drop all dataitems and registrations
    pub fn release_contents(&mut self) {
        self.dataitems.clear();
        self.allocator.reset();
        self.registrations.clear();
    }
}

/// A region: immutable identity plus lock-guarded structure and memory
#[derive(Debug)]
pub struct RegionEntry {
    pub id: RegionId,
    pub name: String,
    pub owner: Owner,
    pub permission: Permission,
    pub memory_type: MemoryType,
    pub memory_server_ids: Vec<u64>,
    pub interleave_size: u64,
    structure: RwLock<RegionStructure>,
    memory: RwLock<MemoryBacking>,
}

impl RegionEntry {
    pub fn read(&self) -> RwLockReadGuard<'_, RegionStructure> {
        self.structure.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, RegionStructure> {
        self.structure.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared access to the backing memory; take the structural lock first
    pub fn memory(&self) -> RwLockReadGuard<'_, MemoryBacking> {
        self.memory.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the backing memory; take the structural lock first
    pub fn memory_mut(&self) -> RwLockWriteGuard<'_, MemoryBacking> {
        self.memory.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn info(&self) -> RegionInfo {
        let structure = self.read();
        RegionInfo {
            id: self.id,
            name: self.name.clone(),
            size: structure.size,
            permission: self.permission,
            owner: self.owner,
            memory_type: self.memory_type,
            memory_server_ids: self.memory_server_ids.clone(),
            interleave_size: self.interleave_size,
            dataitem_count: structure.dataitems.len(),
            used_bytes: structure.allocator.used_size(),
            open_count: structure.open_count,
        }
    }
}

/// Parameters for a new region
#[derive(Debug, Clone)]
pub struct NewRegion {
    pub name: String,
    pub size: u64,
    pub permission: Permission,
    pub owner: Owner,
    pub memory_type: MemoryType,
    pub attributes: RegionAttributes,
    pub alignment: u64,
}

#[derive(Debug, Default)]
struct StoreTables {
    regions: HashMap<RegionId, Arc<RegionEntry>>,
    names: HashMap<String, RegionId>,
}

/// Owner of every region record on a memory server
#[derive(Debug)]
pub struct RegionStore {
    tables: RwLock<StoreTables>,
    next_region_id: AtomicU64,
}

impl RegionStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(StoreTables::default()),
            next_region_id: AtomicU64::new(1),
        }
    }

    fn tables(&self) -> RwLockReadGuard<'_, StoreTables> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn tables_mut(&self) -> RwLockWriteGuard<'_, StoreTables> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the name, map memory via `make_backing` and insert the region in
    /// [`RegionState::Creating`]
    pub fn create<F>(&self, request: NewRegion, make_backing: F) -> Result<Arc<RegionEntry>>
    where
        F: FnOnce(RegionId) -> Result<MemoryBacking>,
    {
        let id = {
            let mut tables = self.tables_mut();
            if tables.names.contains_key(&request.name) {
                return Err(FamError::name_collision(&request.name));
            }
            let id = self.next_region_id.fetch_add(1, Ordering::SeqCst);
            tables.names.insert(request.name.clone(), id);
            id
        };

        let built = FreeListAllocator::new(request.size, request.alignment)
            .and_then(|allocator| make_backing(id).map(|memory| (allocator, memory)));
        let (allocator, memory) = match built {
            Ok(parts) => parts,
            Err(e) => {
                self.release_name(&request.name, id);
                return Err(e);
            }
        };

        let memory_server_ids = request.attributes.memory_server_ids;
        let entry = Arc::new(RegionEntry {
            id,
            name: request.name,
            owner: request.owner,
            permission: request.permission,
            memory_type: request.memory_type,
            memory_server_ids,
            interleave_size: request.attributes.interleave_size,
            structure: RwLock::new(RegionStructure {
                state: RegionState::Creating,
                size: request.size,
                allocator,
                dataitems: BTreeMap::new(),
                registrations: RegistrationTable::new(),
                open_count: 0,
            }),
            memory: RwLock::new(memory),
        });

        self.tables_mut().regions.insert(id, Arc::clone(&entry));
        debug!("region {} ({}) reserved", id, entry.name);
        Ok(entry)
    }

    pub fn get(&self, region_id: RegionId) -> Result<Arc<RegionEntry>> {
        self.tables()
            .regions
            .get(&region_id)
            .cloned()
            .ok_or_else(|| FamError::not_found(format!("region {}", region_id)))
    }

    /// Id of the live region called `name`
    pub fn lookup(&self, name: &str) -> Option<RegionId> {
        self.tables().names.get(name).copied()
    }

    /// Free `name` if it still maps to `region_id`
    pub fn release_name(&self, name: &str, region_id: RegionId) {
        let mut tables = self.tables_mut();
        if tables.names.get(name) == Some(&region_id) {
            tables.names.remove(name);
        }
    }

    /// Drop the region record; memory is unmapped once the last `Arc` goes
    pub fn remove(&self, region_id: RegionId) -> Option<Arc<RegionEntry>> {
        let mut tables = self.tables_mut();
        let entry = tables.regions.remove(&region_id)?;
        if tables.names.get(&entry.name) == Some(&region_id) {
            tables.names.remove(&entry.name);
        }
        Some(entry)
    }

    pub fn region_ids(&self) -> Vec<RegionId> {
        self.tables().regions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tables().regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RegionStore {
    fn default() -> Self {
        Self::new()
    }
}
