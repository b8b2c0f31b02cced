//! Process-wide memory server address table
//!
//! The table is rebuilt wholesale on membership change and published as an
//! immutable snapshot, so an operation that loaded a snapshot keeps a
//! consistent view even while an update is swapped in.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
};

use arc_swap::ArcSwap;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{FamError, Result};

use super::registration::NodeAddr;

/// Address record of one memory server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryServerInfo {
    pub id: u64,
    pub node_addr: NodeAddr,
}

/// Immutable snapshot of the server address table
#[derive(Debug, Default)]
pub struct MemoryServerTable {
    servers: HashMap<u64, MemoryServerInfo>,
    generation: u64,
}

impl MemoryServerTable {
    pub fn lookup(&self, memory_server_id: u64) -> Result<&MemoryServerInfo> {
        self.servers.get(&memory_server_id).ok_or_else(|| {
            FamError::not_found(format!("memory server {}", memory_server_id))
        })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Number of updates applied before this snapshot was built
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Atomically swapped holder of the current [`MemoryServerTable`]
#[derive(Debug, Default)]
pub struct MemoryServerDirectory {
    current: ArcSwap<MemoryServerTable>,
}

impl MemoryServerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory shared by every service in this process
    pub fn global() -> Arc<MemoryServerDirectory> {
        static GLOBAL: OnceLock<Arc<MemoryServerDirectory>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(MemoryServerDirectory::new()))
            .clone()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<MemoryServerTable> {
        self.current.load_full()
    }

    /// Replace the table with `servers`
    pub fn replace(&self, servers: Vec<MemoryServerInfo>) -> Result<()> {
        let mut table = HashMap::with_capacity(servers.len());
        for server in servers {
            let id = server.id;
            if table.insert(id, server).is_some() {
                return Err(FamError::invalid_parameter(
                    "memory_servers",
                    format!("duplicate memory server id {}", id),
                ));
            }
        }

        // Concurrent updaters retry so each one bumps the generation once.
        let previous = self.current.rcu(|current| {
            Arc::new(MemoryServerTable {
                servers: table.clone(),
                generation: current.generation + 1,
            })
        });
        let generation = previous.generation + 1;
        let count = table.len();
        info!(
            "memory server table updated: {} server(s), generation {}",
            count, generation
        );
        Ok(())
    }

    /// Decode a buffer produced by [`encode_server_list`] and install it
    pub fn update_from_buffer(&self, buffer: &[u8], count: u64) -> Result<()> {
        let servers: Vec<MemoryServerInfo> = bincode::deserialize(buffer)?;
        if servers.len() as u64 != count {
            return Err(FamError::invalid_parameter(
                "memory_server_count",
                format!("buffer holds {} servers, caller declared {}", servers.len(), count),
            ));
        }
        self.replace(servers)
    }
}

/// Encode a server list into the buffer format consumed by
/// [`MemoryServerDirectory::update_from_buffer`]
pub fn encode_server_list(servers: &[MemoryServerInfo]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(servers)?)
}
