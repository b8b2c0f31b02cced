//! Region and dataitem store

pub mod allocator;
pub mod store;
pub mod types;

pub use allocator::{Allocator, FreeListAllocator};
pub use store::{NewRegion, RegionEntry, RegionState, RegionStore, RegionStructure};
pub use types::{
    DataitemInfo, Owner, Permission, RegionAttributes, RegionId, RegionInfo, RegionItemInfo,
    ResourceStatus,
};
