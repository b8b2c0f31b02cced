//! Memory service configuration

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::{FamError, Result},
    memory::MemoryType,
    region::Owner,
};

/// Where clients run relative to the memory service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Deployment {
    /// Clients share the service's address space
    #[default]
    SharedHost,
    /// Clients reach the service over a fabric
    Networked,
}

/// Configuration for one memory server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Memory server id, unique within the cluster
    pub memory_server_id: u64,
    /// Fabric address advertised in capabilities
    pub node_addr: Vec<u8>,
    /// Default memory type of new regions
    pub memory_type: MemoryType,
    pub deployment: Deployment,
    /// Directory holding backing files of persistent regions
    pub persistent_dir: PathBuf,
    /// Directory holding backups
    pub backup_dir: PathBuf,
    /// Identity the service registers memory as
    pub credentials: Owner,
    /// Upper bound on a blocking CAS acquire; `None` waits forever
    pub cas_lock_timeout: Option<Duration>,
    /// Register region memory read-write at creation; that registration
    /// survives open/close cycles and is dropped only with the region
    pub eager_registration: bool,
    /// Alignment of dataitem offsets (power of two)
    pub allocation_alignment: u64,
    /// Chunk size used when a backup request leaves it at zero
    pub backup_chunk_size: u64,
    /// Stripe width given to multi-server regions created without one
    pub default_interleave_size: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let scratch = std::env::temp_dir();
        Self {
            memory_server_id: 0,
            node_addr: b"loopback://0".to_vec(),
            memory_type: MemoryType::Volatile,
            deployment: Deployment::SharedHost,
            persistent_dir: scratch.join("famsvc_regions"),
            backup_dir: scratch.join("famsvc_backups"),
            credentials: Owner::current(),
            cas_lock_timeout: None,
            eager_registration: false,
            allocation_alignment: crate::config::DEFAULT_ALIGNMENT,
            backup_chunk_size: crate::config::DEFAULT_BACKUP_CHUNK_SIZE,
            default_interleave_size: crate::config::DEFAULT_INTERLEAVE_SIZE,
        }
    }
}

impl ServiceConfig {
    /// Configuration for server `memory_server_id` with a loopback address
    pub fn new(memory_server_id: u64) -> Self {
        Self {
            memory_server_id,
            node_addr: format!("loopback://{}", memory_server_id).into_bytes(),
            ..Default::default()
        }
    }

    pub fn with_node_addr(mut self, node_addr: impl Into<Vec<u8>>) -> Self {
        self.node_addr = node_addr.into();
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn with_deployment(mut self, deployment: Deployment) -> Self {
        self.deployment = deployment;
        self
    }

    pub fn with_persistent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistent_dir = dir.into();
        self
    }

    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn with_credentials(mut self, credentials: Owner) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_cas_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cas_lock_timeout = timeout;
        self
    }

    pub fn with_eager_registration(mut self, eager: bool) -> Self {
        self.eager_registration = eager;
        self
    }

    pub fn with_allocation_alignment(mut self, alignment: u64) -> Self {
        self.allocation_alignment = alignment;
        self
    }

    pub fn with_backup_chunk_size(mut self, chunk_size: u64) -> Self {
        self.backup_chunk_size = chunk_size;
        self
    }

    pub fn with_default_interleave_size(mut self, interleave_size: u64) -> Self {
        self.default_interleave_size = interleave_size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node_addr.is_empty() {
            return Err(FamError::invalid_parameter(
                "node_addr",
                "Node address cannot be empty",
            ));
        }

        if !self.allocation_alignment.is_power_of_two() {
            return Err(FamError::invalid_parameter(
                "allocation_alignment",
                "Alignment must be a power of two",
            ));
        }

        if self.backup_chunk_size == 0 {
            return Err(FamError::invalid_parameter(
                "backup_chunk_size",
                "Backup chunk size cannot be zero",
            ));
        }

        if self.default_interleave_size == 0 {
            return Err(FamError::invalid_parameter(
                "default_interleave_size",
                "Interleave size cannot be zero",
            ));
        }

        if self.cas_lock_timeout == Some(Duration::ZERO) {
            return Err(FamError::invalid_parameter(
                "cas_lock_timeout",
                "Use try_acquire_cas_lock instead of a zero timeout",
            ));
        }

        Ok(())
    }
}
