//! In-process memory server
//!
//! Regions live in [`RegionStore`]; every structural change takes the
//! region's write lock, so lifecycle calls on one region are serialized while
//! other regions proceed. One-sided operations take the read half plus the
//! memory lock for as long as they touch bytes.

use std::{
    fs,
    ptr::NonNull,
    sync::Arc,
    time::{Duration, SystemTime},
};

use log::{debug, info, warn};

use crate::{
    backup::{
        chunk_ranges, AccessFilter, BackupInfo, BackupMetadata, BackupRequest, FsBackupStore,
        RestoreRequest,
    },
    cas::{CasLockTable, HolderId},
    copy::{plan_copy, CopyRequest, StripeLayout},
    error::{FamError, Result},
    fabric::{FabricTransport, LoopbackFabric, RemoteTarget},
    memory::{
        AccessType, DataitemMemory, KeyGenerator, MemoryBacking, MemoryCapability,
        MemoryServerDirectory, MemoryType, NodeAddr, RegistrationEntry,
    },
    ops::{execute_read, execute_write, AtomicRequest, AtomicResponse},
    region::{
        Allocator, DataitemInfo, NewRegion, Owner, Permission, RegionAttributes, RegionEntry,
        RegionId, RegionInfo, RegionItemInfo, RegionState, RegionStore, ResourceStatus,
    },
};

use super::{
    config::{Deployment, ServiceConfig},
    stats::{AtomicServiceStats, ServiceOp, ServiceStats},
    MemoryService,
};

/// Memory server serving regions from this process
#[derive(Debug)]
pub struct LocalMemoryService {
    config: ServiceConfig,
    node_addr: NodeAddr,
    store: RegionStore,
    keys: KeyGenerator,
    locks: CasLockTable,
    directory: Arc<MemoryServerDirectory>,
    fabric: Arc<dyn FabricTransport>,
    backups: FsBackupStore,
    stats: AtomicServiceStats,
}

fn offset_by(base: u64, delta: u64) -> Result<u64> {
    base.checked_add(delta).ok_or_else(|| {
        FamError::invalid_range(format!("offset {} plus {} overflows", base, delta))
    })
}

fn within_dataitem(item: &DataitemInfo, offset: u64, len: u64) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if offset >= item.offset && end <= item.end() => Ok(()),
        _ => Err(FamError::invalid_range(format!(
            "[{}, +{}) runs past the dataitem at {} of {} bytes",
            offset, len, item.offset, item.size
        ))),
    }
}

impl LocalMemoryService {
    /// Service with a private loopback fabric and the process-wide server table
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_fabric(
            config,
            Arc::new(LoopbackFabric::new()),
            MemoryServerDirectory::global(),
        )
    }

    pub fn with_fabric(
        config: ServiceConfig,
        fabric: Arc<dyn FabricTransport>,
        directory: Arc<MemoryServerDirectory>,
    ) -> Result<Self> {
        config.validate()?;
        let backups = FsBackupStore::open(&config.backup_dir)?;
        let node_addr = NodeAddr::new(config.node_addr.clone());

        info!(
            "memory server {} ready at {:?} ({} memory)",
            config.memory_server_id,
            node_addr,
            config.memory_type.name()
        );

        Ok(Self {
            keys: KeyGenerator::new(config.memory_server_id),
            node_addr,
            store: RegionStore::new(),
            locks: CasLockTable::new(),
            directory,
            fabric,
            backups,
            stats: AtomicServiceStats::new(),
            config,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn profiled<T>(&self, op: ServiceOp, bytes: u64, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = f();
        match &result {
            Ok(_) => self.stats.record_success(op, bytes),
            Err(e) => {
                self.stats.record_failure(op);
                debug!("{:?} failed on server {}: {}", op, self.config.memory_server_id, e);
            }
        }
        result
    }

    fn capability(&self, entry: &RegionEntry, registration: RegistrationEntry) -> MemoryCapability {
        MemoryCapability {
            key: registration.key,
            base_addr: entry.memory().base_addr() + registration.offset,
            node_addr: self.node_addr.clone(),
            access: registration.access,
        }
    }

    fn make_backing(
        &self,
        region_id: RegionId,
        size: u64,
        memory_type: MemoryType,
    ) -> Result<MemoryBacking> {
        match memory_type {
            MemoryType::Volatile => MemoryBacking::volatile(size),
            MemoryType::Persistent => {
                fs::create_dir_all(&self.config.persistent_dir).map_err(|e| {
                    FamError::from_io(e, "Failed to create persistent region directory")
                })?;
                let path = self.config.persistent_dir.join(format!(
                    "region_{}_{}.fam",
                    self.config.memory_server_id, region_id
                ));
                MemoryBacking::persistent(&path, size, 0o600)
            }
        }
    }

    fn check_access(
        &self,
        permission: Permission,
        owner: &Owner,
        access: AccessType,
        what: &str,
    ) -> Result<()> {
        if permission.allows(owner, &self.config.credentials, access) {
            Ok(())
        } else {
            Err(FamError::permission_denied(format!(
                "{} mode {:o} does not grant {} access",
                what,
                permission.mode(),
                access.name()
            )))
        }
    }

    fn reclaim(&self, entry: &RegionEntry) {
        entry.memory_mut().discard();
        info!("region {} ({}) memory reclaimed", entry.id, entry.name);
    }

    fn ensure_region_active(&self, region_id: RegionId) -> Result<()> {
        let entry = self.store.get(region_id)?;
        let structure = entry.read();
        structure.ensure_active(region_id)
    }

    fn check_dataitem_range(&self, region_id: RegionId, offset: u64, len: u64) -> Result<()> {
        let entry = self.store.get(region_id)?;
        let structure = entry.read();
        structure.ensure_active(region_id)?;
        within_dataitem(structure.dataitem_containing(offset)?, offset, len)
    }

    /// Copy `len` bytes at region offset `offset` out of a live dataitem,
    /// checking `key` against the read-only registrations when given
    fn read_dataitem_range(
        &self,
        region_id: RegionId,
        offset: u64,
        len: u64,
        key: Option<u64>,
    ) -> Result<Vec<u8>> {
        let entry = self.store.get(region_id)?;
        let structure = entry.read();
        structure.ensure_active(region_id)?;
        within_dataitem(structure.dataitem_containing(offset)?, offset, len)?;
        if let Some(key) = key {
            structure
                .registrations
                .authorize(key, AccessType::ReadOnly, offset, len)?;
        }
        let memory = entry.memory();
        Ok(memory.as_slice()[offset as usize..(offset + len) as usize].to_vec())
    }

    /// Write `(relative offset, bytes)` pieces into the dataitem containing
    /// `base`; nothing is written unless every piece fits
    fn write_into_dataitem(
        &self,
        region_id: RegionId,
        base: u64,
        pieces: &[(u64, Vec<u8>)],
    ) -> Result<()> {
        let entry = self.store.get(region_id)?;
        let structure = entry.read();
        structure.ensure_active(region_id)?;
        let item = structure.dataitem_containing(base)?;
        let mut starts = Vec::with_capacity(pieces.len());
        for (relative, bytes) in pieces {
            let start = offset_by(base, *relative)?;
            within_dataitem(item, start, bytes.len() as u64)?;
            starts.push(start as usize);
        }

        let mut memory = entry.memory_mut();
        let target = memory.as_mut_slice();
        for (start, (_, bytes)) in starts.into_iter().zip(pieces) {
            target[start..start + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn chunk_size(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.config.backup_chunk_size
        } else {
            requested
        }
    }

    /// The pieces of a backup section this server holds, as
    /// `(backup position, region offset, len)`
    ///
    /// A section covers logical item bytes `[file_start_pos, +size)`. Unstriped,
    /// `base` is the region offset of the section's first byte. Striped over
    /// several servers, `base` is where the dataitem starts on this server and
    /// only the stripes this server owns are returned.
    fn section_extents(
        &self,
        region_id: RegionId,
        base: u64,
        file_start_pos: u64,
        size: u64,
        chunk_size: u64,
        used_memserver_cnt: u64,
    ) -> Result<Vec<(u64, u64, u64)>> {
        offset_by(file_start_pos, size)?;
        if used_memserver_cnt <= 1 {
            offset_by(base, size)?;
            return Ok(chunk_ranges(size, chunk_size)
                .map(|(start, len)| (file_start_pos + start, base + start, len))
                .collect());
        }

        let entry = self.store.get(region_id)?;
        if used_memserver_cnt > entry.memory_server_ids.len() as u64 {
            return Err(FamError::range_mismatch(format!(
                "dataitem striped over {} servers, region {} spans {}",
                used_memserver_cnt,
                region_id,
                entry.memory_server_ids.len()
            )));
        }
        let server_index = entry
            .memory_server_ids
            .iter()
            .position(|&id| id == self.config.memory_server_id)
            .ok_or_else(|| {
                FamError::invalid_parameter(
                    "memory_server_id",
                    format!(
                        "server {} holds no part of region {}",
                        self.config.memory_server_id, region_id
                    ),
                )
            })?;
        let striped = StripeLayout::new(entry.interleave_size, used_memserver_cnt)?;
        let flat = StripeLayout::new(0, 1)?;

        let mut extents = Vec::new();
        for (start, len) in chunk_ranges(size, chunk_size) {
            let pos = file_start_pos + start;
            for piece in plan_copy(&flat, pos, &striped, pos, server_index as u64, len) {
                extents.push((
                    piece.src_local_offset,
                    offset_by(base, piece.dest_local_offset)?,
                    piece.len,
                ));
            }
        }
        Ok(extents)
    }

    /// Check every extent lies in a live dataitem; `base` must name one even
    /// when this server holds nothing of the section
    fn check_extents(
        &self,
        region_id: RegionId,
        base: u64,
        extents: &[(u64, u64, u64)],
    ) -> Result<()> {
        self.check_dataitem_range(region_id, base, 0)?;
        for &(_, offset, len) in extents {
            self.check_dataitem_range(region_id, offset, len)?;
        }
        Ok(())
    }

    fn write_backup_chunks(
        &self,
        request: &BackupRequest,
        extents: &[(u64, u64, u64)],
    ) -> Result<()> {
        let file = self.backups.open_chunks_for_write(&request.backup_name)?;
        for &(position, offset, len) in extents {
            let bytes = self.read_dataitem_range(request.src_region_id, offset, len, None)?;
            FsBackupStore::write_chunk(&file, position, &bytes)?;
        }
        file.sync_all()
            .map_err(|e| FamError::from_io(e, "Failed to sync backup chunks"))
    }
}

impl MemoryService for LocalMemoryService {
    fn create_region_with(
        &self,
        name: &str,
        size: u64,
        permission: Permission,
        attributes: RegionAttributes,
    ) -> Result<RegionId> {
        self.profiled(ServiceOp::CreateRegion, size, || {
            if name.is_empty() {
                return Err(FamError::invalid_parameter("name", "Region name cannot be empty"));
            }
            if size == 0 {
                return Err(FamError::invalid_parameter(
                    "size",
                    "Region size must be greater than 0",
                ));
            }

            let memory_type = attributes.memory_type.unwrap_or(self.config.memory_type);
            let mut attributes = attributes;
            if attributes.memory_server_ids.is_empty() {
                attributes.memory_server_ids.push(self.config.memory_server_id);
            }
            if attributes.memory_server_ids.len() > 1 && attributes.interleave_size == 0 {
                attributes.interleave_size = self.config.default_interleave_size;
            }

            let request = NewRegion {
                name: name.to_string(),
                size,
                permission,
                owner: self.config.credentials,
                memory_type,
                attributes,
                alignment: self.config.allocation_alignment,
            };
            let entry = self
                .store
                .create(request, |id| self.make_backing(id, size, memory_type))?;

            let mut structure = entry.write();
            if self.config.eager_registration {
                let registered = self
                    .check_access(permission, &entry.owner, AccessType::ReadWrite, "region")
                    .map(|_| {
                        structure
                            .registrations
                            .pin_region(AccessType::ReadWrite, size, &self.keys)
                    });
                if let Err(e) = registered {
                    drop(structure);
                    warn!("registering region {} failed, unwinding: {}", name, e);
                    self.create_region_failure_cleanup(entry.id)?;
                    return Err(e);
                }
            }
            structure.state = RegionState::Active;
            drop(structure);

            info!(
                "region {} ({}) created: {} bytes of {} memory",
                entry.id,
                name,
                size,
                memory_type.name()
            );
            Ok(entry.id)
        })
    }

    fn destroy_region(&self, region_id: RegionId) -> Result<ResourceStatus> {
        self.profiled(ServiceOp::DestroyRegion, 0, || {
            let entry = self.store.get(region_id)?;
            let open_count = {
                let mut structure = entry.write();
                structure.ensure_active(region_id)?;
                structure.release_contents();
                structure.state = RegionState::Destroyed;
                structure.open_count
            };
            self.locks.release_region(region_id);

            if open_count > 0 {
                self.store.release_name(&entry.name, region_id);
                info!(
                    "region {} ({}) destroyed while open {} time(s)",
                    region_id, entry.name, open_count
                );
                return Ok(ResourceStatus::Busy { open_count });
            }

            self.store.remove(region_id);
            self.reclaim(&entry);
            Ok(ResourceStatus::Released)
        })
    }

    fn resize_region(&self, region_id: RegionId, new_size: u64) -> Result<()> {
        self.profiled(ServiceOp::ResizeRegion, 0, || {
            if new_size == 0 {
                return Err(FamError::invalid_parameter(
                    "size",
                    "Region size must be greater than 0",
                ));
            }
            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;
            structure.allocator.check_resize(new_size)?;

            entry.memory_mut().resize(new_size)?;
            structure.allocator.resize(new_size)?;
            structure.size = new_size;
            structure.registrations.resize_region(new_size);

            info!("region {} resized to {} bytes", region_id, new_size);
            Ok(())
        })
    }

    fn allocate(
        &self,
        region_id: RegionId,
        size: u64,
        permission: Permission,
    ) -> Result<RegionItemInfo> {
        self.profiled(ServiceOp::Allocate, size, || {
            if size == 0 {
                return Err(FamError::invalid_parameter(
                    "size",
                    "Dataitem size must be greater than 0",
                ));
            }
            let owner = self.config.credentials;
            let access = [AccessType::ReadWrite, AccessType::ReadOnly]
                .into_iter()
                .find(|&access| permission.allows(&owner, &owner, access))
                .ok_or_else(|| {
                    FamError::permission_denied(format!(
                        "dataitem mode {:o} grants no access to its owner",
                        permission.mode()
                    ))
                })?;

            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;

            let offset = structure.allocator.allocate(size)?;
            structure.dataitems.insert(
                offset,
                DataitemInfo {
                    region_id,
                    offset,
                    size,
                    permission,
                    owner,
                },
            );
            let registration =
                structure
                    .registrations
                    .register_dataitem(offset, size, access, &self.keys);

            debug!(
                "dataitem of {} bytes allocated at region {} offset {}",
                size, region_id, offset
            );
            Ok(RegionItemInfo {
                region_id,
                offset,
                size,
                memory: DataitemMemory {
                    capability: self.capability(&entry, registration),
                    offset,
                    size,
                },
                memory_server_id: self.config.memory_server_id,
            })
        })
    }

    fn deallocate(&self, region_id: RegionId, offset: u64) -> Result<()> {
        self.profiled(ServiceOp::Deallocate, 0, || {
            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;
            structure.dataitem_at(offset)?;

            structure.allocator.deallocate(offset)?;
            structure.dataitems.remove(&offset);
            structure.registrations.release_dataitem(offset);
            debug!("dataitem at region {} offset {} released", region_id, offset);
            Ok(())
        })
    }

    fn region_info(&self, region_id: RegionId) -> Result<RegionInfo> {
        Ok(self.store.get(region_id)?.info())
    }

    fn create_region_failure_cleanup(&self, region_id: RegionId) -> Result<()> {
        let Ok(entry) = self.store.get(region_id) else {
            debug!("nothing to clean up for region {}", region_id);
            return Ok(());
        };
        {
            let mut structure = entry.write();
            if structure.state == RegionState::Active {
                return Err(FamError::invalid_state(format!(
                    "region {} finished creation; destroy it instead",
                    region_id
                )));
            }
            structure.release_contents();
            structure.state = RegionState::Destroyed;
        }
        self.locks.release_region(region_id);
        if self.store.remove(region_id).is_some() {
            self.reclaim(&entry);
            warn!("region {} ({}) unwound after failed creation", region_id, entry.name);
        }
        Ok(())
    }

    fn open_region_with_registration(
        &self,
        region_id: RegionId,
        access: AccessType,
    ) -> Result<MemoryCapability> {
        self.profiled(ServiceOp::OpenRegion, 0, || {
            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;
            self.check_access(entry.permission, &entry.owner, access, "region")?;

            let size = structure.size;
            let registration = structure
                .registrations
                .register_region(access, size, &self.keys);
            structure.open_count += 1;
            Ok(self.capability(&entry, registration))
        })
    }

    fn open_region_without_registration(&self, region_id: RegionId) -> Result<()> {
        self.profiled(ServiceOp::OpenRegion, 0, || {
            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;
            structure.open_count += 1;
            Ok(())
        })
    }

    fn close_region(&self, region_id: RegionId) -> Result<ResourceStatus> {
        self.profiled(ServiceOp::CloseRegion, 0, || {
            let entry = self.store.get(region_id)?;
            let (remaining, state) = {
                let mut structure = entry.write();
                if structure.open_count == 0 {
                    return Err(FamError::invalid_state(format!(
                        "region {} is not open",
                        region_id
                    )));
                }
                structure.open_count -= 1;
                if structure.open_count == 0 {
                    structure.registrations.release_region_entries();
                }
                (structure.open_count, structure.state)
            };

            if remaining > 0 {
                return Ok(ResourceStatus::Busy {
                    open_count: remaining,
                });
            }
            if state == RegionState::Destroyed && self.store.remove(region_id).is_some() {
                self.reclaim(&entry);
            }
            Ok(ResourceStatus::Released)
        })
    }

    fn register_region_memory(&self, region_id: RegionId, access: AccessType) -> Result<()> {
        self.profiled(ServiceOp::Register, 0, || {
            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;
            self.check_access(entry.permission, &entry.owner, access, "region")?;
            let size = structure.size;
            structure
                .registrations
                .register_region(access, size, &self.keys);
            Ok(())
        })
    }

    fn get_region_memory(
        &self,
        region_id: RegionId,
        access: AccessType,
    ) -> Result<MemoryCapability> {
        let entry = self.store.get(region_id)?;
        let structure = entry.read();
        structure.ensure_active(region_id)?;
        let registration = structure.registrations.region_entry(access).ok_or_else(|| {
            FamError::not_found(format!(
                "{} registration of region {}",
                access.name(),
                region_id
            ))
        })?;
        Ok(self.capability(&entry, registration))
    }

    fn get_dataitem_memory(
        &self,
        region_id: RegionId,
        offset: u64,
        access: AccessType,
    ) -> Result<DataitemMemory> {
        self.profiled(ServiceOp::Register, 0, || {
            let entry = self.store.get(region_id)?;
            let mut structure = entry.write();
            structure.ensure_active(region_id)?;
            let item = *structure.dataitem_at(offset)?;
            self.check_access(item.permission, &item.owner, access, "dataitem")?;

            let registration =
                structure
                    .registrations
                    .register_dataitem(item.offset, item.size, access, &self.keys);
            Ok(DataitemMemory {
                capability: self.capability(&entry, registration),
                offset: item.offset,
                size: item.size,
            })
        })
    }

    fn get_local_pointer(&self, region_id: RegionId, offset: u64) -> Result<NonNull<u8>> {
        if self.config.deployment == Deployment::Networked {
            return Err(FamError::unsupported(
                "local pointers need the client on the memory server's host",
            ));
        }
        let entry = self.store.get(region_id)?;
        let structure = entry.read();
        structure.ensure_active(region_id)?;
        structure.dataitem_containing(offset)?;

        let memory = entry.memory();
        NonNull::new(memory.as_ptr().wrapping_add(offset as usize))
            .ok_or_else(|| FamError::invalid_state("region memory is not mapped"))
    }

    fn execute_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        request: AtomicRequest,
    ) -> Result<AtomicResponse> {
        let op = ServiceOp::from(request.kind());
        self.profiled(op, request.transfer_len(), || {
            if capability.node_addr != self.node_addr {
                return Err(FamError::permission_denied(format!(
                    "capability targets {:?}, not {:?}",
                    capability.node_addr, self.node_addr
                )));
            }

            let entry = self.store.get(region_id)?;
            let structure = entry.read();
            structure.ensure_active(region_id)?;

            let base = request.base_offset();
            let item = structure.dataitem_containing(base)?;
            let span = request.validate(item.end() - base)?;
            structure
                .registrations
                .authorize(capability.key, request.required_access(), base, span)?;

            let response = if request.is_read_only() {
                execute_read(&request, entry.memory().as_slice())?
            } else {
                execute_write(&request, entry.memory_mut().as_mut_slice())?
            };
            debug!(
                "{:?} on region {} offset {} ({} bytes)",
                request.kind(),
                region_id,
                base,
                request.transfer_len()
            );
            Ok(response)
        })
    }

    fn acquire_cas_lock(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<()> {
        self.profiled(ServiceOp::CasLock, 0, || {
            self.ensure_region_active(region_id)?;
            match self.config.cas_lock_timeout {
                Some(timeout) => self.locks.acquire_timeout(region_id, offset, holder, timeout),
                None => self.locks.acquire(region_id, offset, holder),
            }
        })
    }

    fn acquire_cas_lock_timeout(
        &self,
        region_id: RegionId,
        offset: u64,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<()> {
        self.profiled(ServiceOp::CasLock, 0, || {
            self.ensure_region_active(region_id)?;
            self.locks.acquire_timeout(region_id, offset, holder, timeout)
        })
    }

    fn try_acquire_cas_lock(
        &self,
        region_id: RegionId,
        offset: u64,
        holder: HolderId,
    ) -> Result<bool> {
        self.profiled(ServiceOp::CasLock, 0, || {
            self.ensure_region_active(region_id)?;
            self.locks.try_acquire(region_id, offset, holder)
        })
    }

    fn release_cas_lock(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<()> {
        self.profiled(ServiceOp::CasLock, 0, || {
            self.locks.release(region_id, offset, holder)
        })
    }

    fn copy(&self, request: &CopyRequest) -> Result<()> {
        self.profiled(ServiceOp::Copy, request.size, || {
            let plan = request.plan()?;
            let servers = self.directory.snapshot();

            // Everything is read before the destination is locked, so a copy
            // within one region cannot deadlock against itself.
            let mut pieces = Vec::with_capacity(plan.len());
            for transfer in &plan {
                let index = transfer.src_server_index as usize;
                let offset = offset_by(request.src_offsets[index], transfer.src_local_offset)?;
                let server_id = request.src_memserver_ids[index];
                let key = request.src_keys[index];

                let bytes = if server_id == self.config.memory_server_id {
                    self.read_dataitem_range(request.src_region_id, offset, transfer.len, Some(key))?
                } else {
                    let target = RemoteTarget {
                        node_addr: servers.lookup(server_id)?.node_addr.clone(),
                        region_id: request.src_region_id,
                        key,
                        base_addr: request.src_base_addrs[index],
                    };
                    self.fabric.read(&target, offset, transfer.len)?
                };
                pieces.push((transfer.dest_local_offset, bytes));
            }

            self.write_into_dataitem(request.dest_region_id, request.dest_offset, &pieces)?;
            debug!(
                "copied {} bytes into region {} in {} transfer(s)",
                request.size,
                request.dest_region_id,
                plan.len()
            );
            Ok(())
        })
    }

    fn backup(&self, request: &BackupRequest) -> Result<()> {
        self.profiled(ServiceOp::Backup, request.size, || {
            let chunk_size = self.chunk_size(request.chunk_size);
            let extents = self.section_extents(
                request.src_region_id,
                request.src_offset,
                request.file_start_pos,
                request.size,
                chunk_size,
                request.used_memserver_cnt,
            )?;
            self.check_extents(request.src_region_id, request.src_offset, &extents)?;

            if request.write_metadata {
                self.backups.write_metadata(&BackupMetadata {
                    backup_name: request.backup_name.clone(),
                    dataitem_name: request.dataitem_name.clone(),
                    item_size: request.item_size,
                    chunk_size,
                    used_memserver_cnt: request.used_memserver_cnt,
                    uid: request.uid,
                    gid: request.gid,
                    mode: request.mode,
                    created_at: SystemTime::now(),
                })?;
            }

            if let Err(e) = self.write_backup_chunks(request, &extents) {
                if request.write_metadata {
                    if let Err(cleanup) = self.backups.delete(&request.backup_name) {
                        warn!("failed to remove partial backup {}: {}", request.backup_name, cleanup);
                    }
                }
                return Err(e);
            }

            info!(
                "backup {} written: {} bytes at position {} in {}-byte chunks",
                request.backup_name, request.size, request.file_start_pos, chunk_size
            );
            Ok(())
        })
    }

    fn restore(&self, request: &RestoreRequest) -> Result<()> {
        self.profiled(ServiceOp::Restore, request.size, || {
            let chunk_size = self.chunk_size(request.chunk_size);
            let extents = self.section_extents(
                request.dest_region_id,
                request.dest_offset,
                request.file_start_pos,
                request.size,
                chunk_size,
                request.used_memserver_cnt,
            )?;
            self.check_extents(request.dest_region_id, request.dest_offset, &extents)?;

            let file = self.backups.open_chunks(&request.backup_name)?;
            let needed = request.file_start_pos + request.size;
            if let Some(metadata) = self.backups.read_metadata(&request.backup_name)? {
                if needed > metadata.item_size {
                    return Err(FamError::range_mismatch(format!(
                        "backup {} covers {} bytes, restore needs {}",
                        request.backup_name, metadata.item_size, needed
                    )));
                }
            }
            let stored = self
                .backups
                .stored_bytes(&request.backup_name)?
                .unwrap_or(0);
            if needed > stored {
                return Err(FamError::invalid_range(format!(
                    "backup {} holds {} bytes, restore needs {}",
                    request.backup_name, stored, needed
                )));
            }

            for (position, offset, len) in extents {
                let bytes = FsBackupStore::read_chunk(&file, position, len as usize)?;
                self.write_into_dataitem(request.dest_region_id, offset, &[(0, bytes)])?;
            }

            info!(
                "backup {} restored into region {} offset {}",
                request.backup_name, request.dest_region_id, request.dest_offset
            );
            Ok(())
        })
    }

    fn get_backup_info(&self, name: &str, filter: &AccessFilter) -> Result<BackupInfo> {
        let hidden = || FamError::not_found(format!("backup {}", name));
        let metadata = self.backups.read_metadata(name)?.ok_or_else(hidden)?;
        if !filter.allows(&metadata) {
            return Err(hidden());
        }
        let stored = self.backups.stored_bytes(name)?.unwrap_or(0);
        Ok(BackupInfo::from_metadata(metadata, stored))
    }

    fn list_backup(&self, pattern: &str, filter: &AccessFilter) -> Result<Vec<BackupInfo>> {
        let prefix = pattern.trim_end_matches('*');
        let mut found = Vec::new();
        for metadata in self.backups.list()? {
            if !metadata.backup_name.starts_with(prefix) || !filter.allows(&metadata) {
                continue;
            }
            let stored = self
                .backups
                .stored_bytes(&metadata.backup_name)?
                .unwrap_or(0);
            found.push(BackupInfo::from_metadata(metadata, stored));
        }
        Ok(found)
    }

    fn delete_backup(&self, name: &str) -> Result<()> {
        self.backups.delete(name)?;
        info!("backup {} deleted", name);
        Ok(())
    }

    fn update_memserver_addrlist(&self, buffer: &[u8], count: u64) -> Result<()> {
        self.directory.update_from_buffer(buffer, count)
    }

    fn get_memory_server_id(&self) -> u64 {
        self.config.memory_server_id
    }

    fn get_addr(&self) -> Vec<u8> {
        self.node_addr.as_bytes().to_vec()
    }

    fn get_addr_size(&self) -> usize {
        self.node_addr.len()
    }

    fn get_memtype(&self) -> MemoryType {
        self.config.memory_type
    }

    fn reset_profile(&self) {
        self.stats.reset();
        info!("profile of memory server {} reset", self.config.memory_server_id);
    }

    fn dump_profile(&self) -> ServiceStats {
        let stats = self.stats.snapshot(self.config.memory_server_id);
        info!("{}", stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    fn service(temp_dir: &TempDir) -> LocalMemoryService {
        let config = ServiceConfig::new(0)
            .with_backup_dir(temp_dir.path().join("backups"))
            .with_persistent_dir(temp_dir.path().join("regions"))
            .with_credentials(Owner::new(1000, 1000));
        LocalMemoryService::new(config).unwrap()
    }

    #[test]
    fn test_put_get_through_dataitem_capability() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(&temp_dir);

        let region = svc.create_region("r", 4096, Permission::new(0o600)).unwrap();
        let item = svc.allocate(region, 128, Permission::new(0o600)).unwrap();
        let cap = &item.memory.capability;
        assert_eq!(cap.access, AccessType::ReadWrite);

        svc.put_atomic(region, cap, item.offset + 8, b"fabric".to_vec()).unwrap();
        assert_eq!(svc.get_atomic(region, cap, item.offset + 8, 6).unwrap(), b"fabric");

        let err = svc.get_atomic(region, cap, item.offset + 120, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn test_read_only_capability_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(&temp_dir);

        let region = svc.create_region("ro", 4096, Permission::new(0o600)).unwrap();
        let item = svc.allocate(region, 64, Permission::new(0o400)).unwrap();
        let cap = &item.memory.capability;
        assert_eq!(cap.access, AccessType::ReadOnly);

        let err = svc.put_atomic(region, cap, item.offset, vec![1; 8]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let err = svc
            .get_dataitem_memory(region, item.offset, AccessType::ReadWrite)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_eager_registration_failure_unwinds() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServiceConfig::new(0)
            .with_backup_dir(temp_dir.path().join("backups"))
            .with_credentials(Owner::new(1000, 1000))
            .with_eager_registration(true);
        let svc = LocalMemoryService::new(config).unwrap();

        let err = svc
            .create_region("locked", 4096, Permission::new(0o400))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        // The name is free again and cleanup of a missing region is a no-op.
        let region = svc.create_region("locked", 4096, Permission::new(0o600)).unwrap();
        assert!(svc.create_region_failure_cleanup(region + 100).is_ok());
        assert_eq!(
            svc.create_region_failure_cleanup(region).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_local_pointer_needs_shared_host() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(&temp_dir);
        let region = svc.create_region("lp", 4096, Permission::new(0o600)).unwrap();
        let item = svc.allocate(region, 64, Permission::new(0o600)).unwrap();
        svc.put_atomic(region, &item.memory.capability, item.offset, vec![42])
            .unwrap();

        let ptr = svc.get_local_pointer(region, item.offset).unwrap();
        assert_eq!(unsafe { *ptr.as_ptr() }, 42);

        // A pointer fetched after a resize reads the preserved contents.
        svc.resize_region(region, 1024 * 1024).unwrap();
        let ptr = svc.get_local_pointer(region, item.offset).unwrap();
        assert_eq!(unsafe { *ptr.as_ptr() }, 42);

        let config = ServiceConfig::new(1)
            .with_backup_dir(temp_dir.path().join("backups"))
            .with_deployment(Deployment::Networked);
        let remote = LocalMemoryService::new(config).unwrap();
        let region = remote.create_region("lp", 4096, Permission::new(0o600)).unwrap();
        let item = remote.allocate(region, 64, Permission::new(0o600)).unwrap();
        assert_eq!(
            remote.get_local_pointer(region, item.offset).unwrap_err().kind(),
            ErrorKind::UnsupportedOperation
        );
    }

    #[test]
    fn test_persistent_region_backing_file() {
        let temp_dir = TempDir::new().unwrap();
        let svc = service(&temp_dir);
        let attributes = RegionAttributes {
            memory_type: Some(MemoryType::Persistent),
            ..Default::default()
        };
        let region = svc
            .create_region_with("pmem", 8192, Permission::new(0o600), attributes)
            .unwrap();
        assert_eq!(svc.region_info(region).unwrap().memory_type, MemoryType::Persistent);

        let path = temp_dir.path().join("regions").join(format!("region_0_{}.fam", region));
        assert!(path.exists());
        assert_eq!(svc.destroy_region(region).unwrap(), ResourceStatus::Released);
        assert!(!path.exists());
    }
}
