//! Opaque region and dataitem descriptors

use crate::{
    error::{FamError, Result},
    memory::MemoryCapability,
    region::{Permission, RegionId, RegionItemInfo},
};

/// Handle of a region created through [`Fam`](super::Fam)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescriptor {
    region_id: RegionId,
    name: String,
}

impl RegionDescriptor {
    pub(crate) fn new(region_id: RegionId, name: impl Into<String>) -> Self {
        Self {
            region_id,
            name: name.into(),
        }
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle of an allocated dataitem
///
/// Carries the capability handed out at allocation; operations issued
/// through it address bytes relative to the start of the dataitem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataitemDescriptor {
    region_id: RegionId,
    offset: u64,
    size: u64,
    permission: Permission,
    capability: MemoryCapability,
    memory_server_id: u64,
}

impl DataitemDescriptor {
    pub(crate) fn from_item(item: RegionItemInfo, permission: Permission) -> Self {
        Self {
            region_id: item.region_id,
            offset: item.offset,
            size: item.size,
            permission,
            capability: item.memory.capability,
            memory_server_id: item.memory_server_id,
        }
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    /// Region-relative offset of the first byte
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn capability(&self) -> &MemoryCapability {
        &self.capability
    }

    pub fn memory_server_id(&self) -> u64 {
        self.memory_server_id
    }

    /// Region offset of `[offset, offset + len)` inside this dataitem
    pub(crate) fn absolute(&self, offset: u64, len: u64) -> Result<u64> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(self.offset + offset),
            _ => Err(FamError::invalid_range(format!(
                "[{}, +{}) is outside a dataitem of {} bytes",
                offset, len, self.size
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{AccessType, DataitemMemory, NodeAddr};

    #[test]
    fn test_absolute_offsets() {
        let capability = MemoryCapability {
            key: 1,
            base_addr: 0,
            node_addr: NodeAddr::from("loopback://0"),
            access: AccessType::ReadWrite,
        };
        let item = RegionItemInfo {
            region_id: 4,
            offset: 256,
            size: 64,
            memory: DataitemMemory {
                capability,
                offset: 256,
                size: 64,
            },
            memory_server_id: 0,
        };
        let descriptor = DataitemDescriptor::from_item(item, Permission::default());

        assert_eq!(descriptor.absolute(8, 8).unwrap(), 264);
        assert!(descriptor.absolute(60, 8).is_err());
        assert!(descriptor.absolute(u64::MAX, 2).is_err());
    }
}
