//! Memory service capability set
//!
//! [`MemoryService`] is the one contract every memory server implements.
//! [`LocalMemoryService`] serves regions out of this process; a networked stub
//! would implement the same trait by marshalling each call.

pub mod config;
pub mod local;
pub mod stats;

use std::{fmt, ptr::NonNull, time::Duration};

use crate::{
    backup::{AccessFilter, BackupInfo, BackupRequest, RestoreRequest},
    cas::HolderId,
    copy::CopyRequest,
    error::Result,
    memory::{AccessType, DataitemMemory, MemoryCapability, MemoryType},
    ops::{AtomicRequest, AtomicResponse, AtomicValue, BitwiseOp, IndexedLayout, StridedLayout},
    region::{Permission, RegionAttributes, RegionId, RegionInfo, RegionItemInfo, ResourceStatus},
};

pub use config::{Deployment, ServiceConfig};
pub use local::LocalMemoryService;
pub use stats::{AtomicServiceStats, OpCounters, ServiceOp, ServiceStats};

/// Operations offered by a memory server
///
/// Lifecycle calls block until they complete. Atomic calls are synchronous at
/// this level; callers that want non-blocking issue go through a
/// [`Context`](crate::context::Context).
pub trait MemoryService: Send + Sync + fmt::Debug {
    // Region and dataitem lifecycle

    fn create_region(&self, name: &str, size: u64, permission: Permission) -> Result<RegionId> {
        self.create_region_with(name, size, permission, RegionAttributes::default())
    }

    fn create_region_with(
        &self,
        name: &str,
        size: u64,
        permission: Permission,
        attributes: RegionAttributes,
    ) -> Result<RegionId>;

    fn destroy_region(&self, region_id: RegionId) -> Result<ResourceStatus>;

    /// Fails with `InvalidRange` when a live dataitem ends past `new_size`
    fn resize_region(&self, region_id: RegionId, new_size: u64) -> Result<()>;

    fn allocate(&self, region_id: RegionId, size: u64, permission: Permission)
        -> Result<RegionItemInfo>;

    fn deallocate(&self, region_id: RegionId, offset: u64) -> Result<()>;

    fn region_info(&self, region_id: RegionId) -> Result<RegionInfo>;

    /// Unwind whatever a failed creation left behind; safe to call when
    /// nothing is left
    fn create_region_failure_cleanup(&self, region_id: RegionId) -> Result<()>;

    // Registration

    fn open_region_with_registration(
        &self,
        region_id: RegionId,
        access: AccessType,
    ) -> Result<MemoryCapability>;

    fn open_region_without_registration(&self, region_id: RegionId) -> Result<()>;

    fn close_region(&self, region_id: RegionId) -> Result<ResourceStatus>;

    fn register_region_memory(&self, region_id: RegionId, access: AccessType) -> Result<()>;

    fn get_region_memory(&self, region_id: RegionId, access: AccessType)
        -> Result<MemoryCapability>;

    fn get_dataitem_memory(
        &self,
        region_id: RegionId,
        offset: u64,
        access: AccessType,
    ) -> Result<DataitemMemory>;

    /// Process-local address of region byte `offset`
    ///
    /// Only meaningful when the caller shares the service's address space.
    /// The pointer is not tied to any lock: a later `resize_region` may remap
    /// the backing and leave it dangling, and nothing orders raw accesses
    /// through it against one-sided operations. Fetch it again after a resize.
    fn get_local_pointer(&self, region_id: RegionId, offset: u64) -> Result<NonNull<u8>>;

    // One-sided operations

    fn execute_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        request: AtomicRequest,
    ) -> Result<AtomicResponse>;

    fn get_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        self.execute_atomic(region_id, capability, AtomicRequest::Get { offset, len })?
            .into_data()
    }

    fn put_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        self.execute_atomic(region_id, capability, AtomicRequest::Put { offset, data })
            .map(|_| ())
    }

    fn scatter_strided_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        layout: StridedLayout,
        data: Vec<u8>,
    ) -> Result<()> {
        let request = AtomicRequest::ScatterStrided {
            offset,
            layout,
            data,
        };
        self.execute_atomic(region_id, capability, request).map(|_| ())
    }

    fn gather_strided_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        layout: StridedLayout,
    ) -> Result<Vec<u8>> {
        self.execute_atomic(
            region_id,
            capability,
            AtomicRequest::GatherStrided { offset, layout },
        )?
        .into_data()
    }

    fn scatter_indexed_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        layout: IndexedLayout,
        data: Vec<u8>,
    ) -> Result<()> {
        let request = AtomicRequest::ScatterIndexed {
            offset,
            layout,
            data,
        };
        self.execute_atomic(region_id, capability, request).map(|_| ())
    }

    fn gather_indexed_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        layout: IndexedLayout,
    ) -> Result<Vec<u8>> {
        self.execute_atomic(
            region_id,
            capability,
            AtomicRequest::GatherIndexed { offset, layout },
        )?
        .into_data()
    }

    /// Read-modify-write; returns the prior value when `fetch` is set
    fn bitwise_atomic(
        &self,
        region_id: RegionId,
        capability: &MemoryCapability,
        offset: u64,
        op: BitwiseOp,
        value: AtomicValue,
        fetch: bool,
    ) -> Result<Option<AtomicValue>> {
        let request = AtomicRequest::Bitwise {
            offset,
            op,
            value,
            fetch,
        };
        match self.execute_atomic(region_id, capability, request)? {
            AtomicResponse::Value(prior) => Ok(Some(prior)),
            _ => Ok(None),
        }
    }

    // CAS locks

    /// Block until the lock on (`region_id`, `offset`) is held by `holder`
    fn acquire_cas_lock(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<()>;

    fn acquire_cas_lock_timeout(
        &self,
        region_id: RegionId,
        offset: u64,
        holder: HolderId,
        timeout: Duration,
    ) -> Result<()>;

    /// Returns `Ok(false)` instead of waiting when the lock is held
    fn try_acquire_cas_lock(&self, region_id: RegionId, offset: u64, holder: HolderId)
        -> Result<bool>;

    fn release_cas_lock(&self, region_id: RegionId, offset: u64, holder: HolderId) -> Result<()>;

    // Copy and backup

    fn copy(&self, request: &CopyRequest) -> Result<()>;

    fn backup(&self, request: &BackupRequest) -> Result<()>;

    fn restore(&self, request: &RestoreRequest) -> Result<()>;

    /// Backups hidden by `filter` are reported as `NotFound`
    fn get_backup_info(&self, name: &str, filter: &AccessFilter) -> Result<BackupInfo>;

    fn list_backup(&self, pattern: &str, filter: &AccessFilter) -> Result<Vec<BackupInfo>>;

    fn delete_backup(&self, name: &str) -> Result<()>;

    // Membership and identity

    fn update_memserver_addrlist(&self, buffer: &[u8], count: u64) -> Result<()>;

    fn get_memory_server_id(&self) -> u64;

    fn get_addr(&self) -> Vec<u8>;

    fn get_addr_size(&self) -> usize {
        self.get_addr().len()
    }

    fn get_memtype(&self) -> MemoryType;

    // Profiling

    fn reset_profile(&self);

    fn dump_profile(&self) -> ServiceStats;
}
