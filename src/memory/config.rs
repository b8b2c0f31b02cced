//! Memory type and access type definitions

use serde::{Deserialize, Serialize};

/// Kind of memory a server exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryType {
    /// Anonymous mapping, contents lost when the region is destroyed
    Volatile,
    /// File-backed mapping that survives the process
    Persistent,
}

impl Default for MemoryType {
    fn default() -> Self {
        Self::Volatile
    }
}

impl MemoryType {
    /// Get a human-readable name for the memory type
    pub fn name(&self) -> &'static str {
        match self {
            MemoryType::Volatile => "volatile",
            MemoryType::Persistent => "persistent",
        }
    }
}

/// Remote access granted by a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    ReadOnly,
    ReadWrite,
}

impl AccessType {
    /// Whether a registration of this type satisfies an operation needing `required`
    pub fn permits(self, required: AccessType) -> bool {
        match (self, required) {
            (AccessType::ReadWrite, _) => true,
            (AccessType::ReadOnly, AccessType::ReadOnly) => true,
            (AccessType::ReadOnly, AccessType::ReadWrite) => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AccessType::ReadOnly => "read-only",
            AccessType::ReadWrite => "read-write",
        }
    }
}
