//! Transport seam between memory servers
//!
//! The copy engine reads source stripes held by other servers through a
//! [`FabricTransport`]. Only the in-process [`LoopbackFabric`] lives here; a
//! networked transport plugs in behind the same trait.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, Weak},
};

use log::debug;

use crate::{
    error::{FamError, Result},
    memory::{AccessType, MemoryCapability, NodeAddr},
    ops::AtomicRequest,
    region::RegionId,
    service::MemoryService,
};

/// Registered memory on a remote server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub node_addr: NodeAddr,
    pub region_id: RegionId,
    pub key: u64,
    pub base_addr: u64,
}

impl RemoteTarget {
    fn capability(&self) -> MemoryCapability {
        MemoryCapability {
            key: self.key,
            base_addr: self.base_addr,
            node_addr: self.node_addr.clone(),
            access: AccessType::ReadOnly,
        }
    }
}

/// One-sided access to another memory server's registered memory
pub trait FabricTransport: Send + Sync + fmt::Debug {
    /// Read `len` bytes at region-relative `offset` of `target`
    fn read(&self, target: &RemoteTarget, offset: u64, len: u64) -> Result<Vec<u8>>;
}

/// Transport that reaches services living in the same process
#[derive(Default)]
pub struct LoopbackFabric {
    endpoints: RwLock<HashMap<NodeAddr, Weak<dyn MemoryService>>>,
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoints = self.endpoints.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LoopbackFabric")
            .field("endpoints", &endpoints.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `service` reachable at its node address
    pub fn attach(&self, service: &Arc<dyn MemoryService>) {
        let addr = NodeAddr::new(service.get_addr());
        debug!("loopback endpoint attached at {:?}", addr);
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, Arc::downgrade(service));
    }

    pub fn detach(&self, node_addr: &NodeAddr) {
        self.endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_addr);
    }

    fn endpoint(&self, node_addr: &NodeAddr) -> Result<Arc<dyn MemoryService>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_addr)
            .and_then(Weak::upgrade)
            .ok_or_else(|| FamError::not_found(format!("fabric endpoint {:?}", node_addr)))
    }
}

impl FabricTransport for LoopbackFabric {
    fn read(&self, target: &RemoteTarget, offset: u64, len: u64) -> Result<Vec<u8>> {
        let service = self.endpoint(&target.node_addr)?;
        service
            .execute_atomic(
                target.region_id,
                &target.capability(),
                AtomicRequest::Get { offset, len },
            )?
            .into_data()
    }
}
