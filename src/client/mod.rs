//! Application handle over a memory service
//!
//! [`Fam`] owns a default context plus any contexts the application opens,
//! hands out opaque descriptors and provides the global fence.

pub mod descriptor;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    backup::{AccessFilter, BackupInfo, BackupRequest, RestoreRequest},
    context::{CompletionHandle, Context, ContextId},
    copy::CopyRequest,
    error::{FamError, Result},
    region::{Owner, Permission, RegionAttributes, ResourceStatus},
    service::{LocalMemoryService, MemoryService, ServiceConfig},
};

pub use descriptor::{DataitemDescriptor, RegionDescriptor};

/// Transport backend selected at initialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Runtime {
    /// In-process memory service reached over the loopback fabric
    #[default]
    None,
    /// Process-management runtime bootstrap of a networked deployment
    Pmix,
}

/// Recognized initialization options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamOptions {
    pub runtime: Runtime,
    /// Mode applied by [`Fam::allocate_default`]
    pub default_permission: Permission,
    pub service: ServiceConfig,
}

impl Default for FamOptions {
    fn default() -> Self {
        Self {
            runtime: Runtime::None,
            default_permission: Permission::new(0o600),
            service: ServiceConfig::default(),
        }
    }
}

impl FamOptions {
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_default_permission(mut self, permission: Permission) -> Self {
        self.default_permission = permission;
        self
    }

    pub fn with_service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }
}

/// Initialized application session
#[derive(Debug)]
pub struct Fam {
    app_name: String,
    identity: Owner,
    default_permission: Permission,
    service: Arc<dyn MemoryService>,
    default_context: Context,
    contexts: Mutex<HashMap<ContextId, Arc<Context>>>,
}

impl Fam {
    /// Start a session with a memory service built from `options`
    pub fn initialize(app_name: &str, options: FamOptions) -> Result<Self> {
        match options.runtime {
            Runtime::None => {}
            Runtime::Pmix => {
                return Err(FamError::unsupported(
                    "the PMIx runtime needs a networked service stub",
                ))
            }
        }
        let service: Arc<dyn MemoryService> =
            Arc::new(LocalMemoryService::new(options.service.clone())?);
        Self::with_service(app_name, service, &options)
    }

    /// Start a session against an existing service
    pub fn with_service(
        app_name: &str,
        service: Arc<dyn MemoryService>,
        options: &FamOptions,
    ) -> Result<Self> {
        if app_name.is_empty() {
            return Err(FamError::invalid_parameter(
                "app_name",
                "Application name cannot be empty",
            ));
        }
        let default_context = Context::open(Arc::clone(&service))?;
        info!(
            "{} initialized against memory server {}",
            app_name,
            service.get_memory_server_id()
        );
        Ok(Self {
            app_name: app_name.to_string(),
            identity: options.service.credentials,
            default_permission: options.default_permission,
            service,
            default_context,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Fence and close every context, ending the session
    pub fn finalize(self, app_name: &str) -> Result<()> {
        if app_name != self.app_name {
            return Err(FamError::invalid_parameter(
                "app_name",
                format!("session belongs to {}, not {}", self.app_name, app_name),
            ));
        }
        let contexts: Vec<Arc<Context>> = self.contexts().drain().map(|(_, ctx)| ctx).collect();
        let mut result = Ok(());
        for context in contexts {
            if let Err(e) = context.close() {
                warn!("context {} closed with errors: {}", context.id(), e);
                result = result.and(Err(e));
            }
        }
        let closed = self.default_context.close();
        info!("{} finalized", self.app_name);
        result.and(closed)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn service(&self) -> &Arc<dyn MemoryService> {
        &self.service
    }

    pub fn default_permission(&self) -> Permission {
        self.default_permission
    }

    fn contexts(&self) -> MutexGuard<'_, HashMap<ContextId, Arc<Context>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Context used by operations issued through the handle itself
    pub fn default_context(&self) -> &Context {
        &self.default_context
    }

    pub fn context_open(&self) -> Result<Arc<Context>> {
        let context = Arc::new(Context::open(Arc::clone(&self.service))?);
        self.contexts().insert(context.id(), Arc::clone(&context));
        Ok(context)
    }

    /// Fence and close `context`
    pub fn context_close(&self, context: &Context) -> Result<()> {
        if self.contexts().remove(&context.id()).is_none() {
            return Err(FamError::invalid_state(format!(
                "context {} is not open in this session",
                context.id()
            )));
        }
        context.close()
    }

    /// Fence every context of the session
    ///
    /// All contexts are drained even when some report failures; the failures
    /// of all of them come back in one aggregate.
    pub fn quiet(&self) -> Result<()> {
        let contexts: Vec<Arc<Context>> = self.contexts().values().cloned().collect();
        let mut failures = Vec::new();
        let mut first_other = None;

        let outcomes = std::iter::once(self.default_context.quiet())
            .chain(contexts.iter().map(|context| context.quiet()));
        for outcome in outcomes {
            match outcome {
                Ok(()) => {}
                Err(FamError::AggregateFailure { failures: found }) => failures.extend(found),
                Err(other) => {
                    first_other.get_or_insert(other);
                }
            }
        }

        if let Some(error) = first_other {
            return Err(error);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(FamError::AggregateFailure { failures })
        }
    }

    pub fn create_region(
        &self,
        name: &str,
        size: u64,
        permission: Permission,
    ) -> Result<RegionDescriptor> {
        self.create_region_with(name, size, permission, RegionAttributes::default())
    }

    pub fn create_region_with(
        &self,
        name: &str,
        size: u64,
        permission: Permission,
        attributes: RegionAttributes,
    ) -> Result<RegionDescriptor> {
        let region_id = self
            .service
            .create_region_with(name, size, permission, attributes)?;
        Ok(RegionDescriptor::new(region_id, name))
    }

    pub fn destroy_region(&self, region: &RegionDescriptor) -> Result<ResourceStatus> {
        self.service.destroy_region(region.region_id())
    }

    pub fn resize_region(&self, region: &RegionDescriptor, new_size: u64) -> Result<()> {
        self.service.resize_region(region.region_id(), new_size)
    }

    pub fn allocate(
        &self,
        region: &RegionDescriptor,
        size: u64,
        permission: Permission,
    ) -> Result<DataitemDescriptor> {
        let item = self.service.allocate(region.region_id(), size, permission)?;
        Ok(DataitemDescriptor::from_item(item, permission))
    }

    pub fn allocate_default(&self, region: &RegionDescriptor, size: u64) -> Result<DataitemDescriptor> {
        self.allocate(region, size, self.default_permission)
    }

    pub fn deallocate(&self, item: DataitemDescriptor) -> Result<()> {
        self.service.deallocate(item.region_id(), item.offset())
    }

    /// Copy `size` bytes between two unstriped dataitems through the default
    /// context
    pub fn copy(
        &self,
        src: &DataitemDescriptor,
        src_offset: u64,
        dest: &DataitemDescriptor,
        dest_offset: u64,
        size: u64,
    ) -> Result<CompletionHandle<()>> {
        src.absolute(src_offset, size)?;
        dest.absolute(dest_offset, size)?;
        self.default_context.copy(CopyRequest {
            src_region_id: src.region_id(),
            src_offsets: vec![src.offset()],
            src_used_memsrv_cnt: 1,
            src_copy_start: src_offset,
            src_copy_end: src.size(),
            src_keys: vec![src.capability().key],
            src_base_addrs: vec![src.capability().base_addr],
            src_memserver_ids: vec![src.memory_server_id()],
            src_interleave_size: 0,
            dest_region_id: dest.region_id(),
            dest_offset: dest.offset(),
            dest_used_memsrv_cnt: 1,
            dest_server_index: 0,
            dest_copy_start: dest_offset,
            dest_interleave_size: 0,
            size,
        })
    }

    fn filter(&self) -> AccessFilter {
        AccessFilter::reader(self.identity.uid, self.identity.gid)
    }

    /// Save a whole dataitem under `backup_name`
    pub fn backup(
        &self,
        item: &DataitemDescriptor,
        backup_name: &str,
        dataitem_name: &str,
    ) -> Result<()> {
        self.service.backup(&BackupRequest {
            src_region_id: item.region_id(),
            src_offset: item.offset(),
            size: item.size(),
            chunk_size: 0,
            used_memserver_cnt: 1,
            file_start_pos: 0,
            backup_name: backup_name.to_string(),
            uid: self.identity.uid,
            gid: self.identity.gid,
            mode: item.permission().mode(),
            dataitem_name: dataitem_name.to_string(),
            item_size: item.size(),
            write_metadata: true,
        })
    }

    /// Overwrite `item` with the contents of `backup_name`
    pub fn restore(&self, backup_name: &str, item: &DataitemDescriptor) -> Result<()> {
        let info = self.backup_info(backup_name)?;
        if info.item_size > item.size() {
            return Err(FamError::range_mismatch(format!(
                "backup {} holds {} bytes, dataitem has {}",
                backup_name,
                info.item_size,
                item.size()
            )));
        }
        self.service.restore(&RestoreRequest {
            dest_region_id: item.region_id(),
            dest_offset: item.offset(),
            size: info.item_size,
            chunk_size: info.chunk_size,
            used_memserver_cnt: 1,
            file_start_pos: 0,
            backup_name: backup_name.to_string(),
        })
    }

    pub fn backup_info(&self, backup_name: &str) -> Result<BackupInfo> {
        self.service.get_backup_info(backup_name, &self.filter())
    }

    pub fn list_backups(&self, pattern: &str) -> Result<Vec<BackupInfo>> {
        self.service.list_backup(pattern, &self.filter())
    }

    pub fn delete_backup(&self, backup_name: &str) -> Result<()> {
        self.service.delete_backup(backup_name)
    }
}
