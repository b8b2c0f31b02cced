//! Address/registration layer and the mapped memory behind regions

pub mod addrlist;
pub mod backing;
pub mod config;
pub mod registration;

pub use addrlist::{encode_server_list, MemoryServerDirectory, MemoryServerInfo, MemoryServerTable};
pub use backing::MemoryBacking;
pub use config::{AccessType, MemoryType};
pub use registration::{
    DataitemMemory, KeyGenerator, MemoryCapability, NodeAddr, RegistrationEntry, RegistrationTable,
};
