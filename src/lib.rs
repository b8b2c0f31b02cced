//! # famsvc - Fabric-Attached Memory Service
//!
//! famsvc serves named memory regions carved into dataitems and lets clients
//! drive one-sided operations against them through capabilities handed out at
//! registration time.
//!
//! ## Features
//!
//! - **Regions and dataitems**: create, resize, destroy, allocate, deallocate
//! - **Registration**: per-region and per-dataitem capabilities with access checks
//! - **Atomic op engine**: get/put, strided and indexed scatter/gather, bitwise ops
//! - **Contexts and fences**: ordered non-blocking issue with aggregated `quiet`
//! - **CAS locks**: offset-scoped mutual exclusion for read-modify-write
//! - **Striped copy**: interleaved copies across memory servers
//! - **Backup/restore**: chunked dataitem snapshots with metadata queries
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │      Fam session  ──►  Context (fence/quiet)    │
//! ├─────────────────────────────────────────────────┤
//! │              MemoryService trait                │
//! │  Region store │ Atomic engine │ CAS │ Copy │ Bkp│
//! └─────────────────────────────────────────────────┘
//!           │                         │
//!           ▼                         ▼
//! ┌─────────────────┐    ┌─────────────────────────┐
//! │ Mapped backings │    │  Fabric transport       │
//! │ (anon / file)   │    │  (remote source reads)  │
//! └─────────────────┘    └─────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod region;
pub mod ops;
pub mod cas;
pub mod copy;
pub mod backup;
pub mod fabric;
pub mod service;
pub mod context;
pub mod client;

// Main API re-exports
pub use client::{DataitemDescriptor, Fam, FamOptions, RegionDescriptor, Runtime};
pub use context::{CompletionHandle, Context, ContextId};
pub use error::{ErrorKind, FamError, OperationFailure, Result};
pub use service::{
    Deployment, LocalMemoryService, MemoryService, ServiceConfig, ServiceOp, ServiceStats,
};
pub use memory::{
    AccessType, DataitemMemory, MemoryCapability, MemoryServerDirectory, MemoryServerInfo,
    MemoryType, NodeAddr,
};
pub use region::{Owner, Permission, RegionAttributes, RegionId, RegionInfo, ResourceStatus};
pub use ops::{AtomicRequest, AtomicResponse, AtomicValue, BitwiseOp, IndexedLayout, StridedLayout};
pub use cas::{CasLockTable, HolderId};
pub use copy::CopyRequest;
pub use backup::{AccessFilter, BackupInfo, BackupRequest, RestoreRequest};
pub use fabric::{FabricTransport, LoopbackFabric};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 3;
pub const VERSION_PATCH: u32 = 0;

/// Default configuration constants
pub mod config {
    /// Default alignment of dataitem offsets
    pub const DEFAULT_ALIGNMENT: u64 = 64;

    /// Default backup chunk size (1 MiB)
    pub const DEFAULT_BACKUP_CHUNK_SIZE: u64 = 1024 * 1024;

    /// Default stripe width of multi-server regions (64KB)
    pub const DEFAULT_INTERLEAVE_SIZE: u64 = 64 * 1024;
}
