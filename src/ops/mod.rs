//! One-sided atomic operation engine

pub mod engine;
pub mod request;

pub use engine::{execute_read, execute_write};
pub use request::{
    AtomicRequest, AtomicResponse, AtomicValue, BitwiseOp, IndexedLayout, OpKind, StridedLayout,
};
