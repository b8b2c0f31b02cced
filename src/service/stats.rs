//! Service profiling counters

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::ops::OpKind;

/// Profiled service operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceOp {
    CreateRegion,
    DestroyRegion,
    ResizeRegion,
    Allocate,
    Deallocate,
    OpenRegion,
    CloseRegion,
    Register,
    Get,
    Put,
    ScatterStrided,
    GatherStrided,
    ScatterIndexed,
    GatherIndexed,
    Bitwise,
    CasLock,
    Copy,
    Backup,
    Restore,
}

impl ServiceOp {
    pub const COUNT: usize = 19;

    pub const ALL: [ServiceOp; Self::COUNT] = [
        ServiceOp::CreateRegion,
        ServiceOp::DestroyRegion,
        ServiceOp::ResizeRegion,
        ServiceOp::Allocate,
        ServiceOp::Deallocate,
        ServiceOp::OpenRegion,
        ServiceOp::CloseRegion,
        ServiceOp::Register,
        ServiceOp::Get,
        ServiceOp::Put,
        ServiceOp::ScatterStrided,
        ServiceOp::GatherStrided,
        ServiceOp::ScatterIndexed,
        ServiceOp::GatherIndexed,
        ServiceOp::Bitwise,
        ServiceOp::CasLock,
        ServiceOp::Copy,
        ServiceOp::Backup,
        ServiceOp::Restore,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl From<OpKind> for ServiceOp {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::Get => ServiceOp::Get,
            OpKind::Put => ServiceOp::Put,
            OpKind::ScatterStrided => ServiceOp::ScatterStrided,
            OpKind::GatherStrided => ServiceOp::GatherStrided,
            OpKind::ScatterIndexed => ServiceOp::ScatterIndexed,
            OpKind::GatherIndexed => ServiceOp::GatherIndexed,
            OpKind::Bitwise => ServiceOp::Bitwise,
        }
    }
}

/// Counters of one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounters {
    pub calls: u64,
    pub failures: u64,
    /// Payload bytes moved by successful calls
    pub bytes: u64,
}

/// Snapshot of the service profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStats {
    pub memory_server_id: u64,
    pub operations: Vec<(ServiceOp, OpCounters)>,
}

impl ServiceStats {
    pub fn get(&self, op: ServiceOp) -> OpCounters {
        self.operations
            .iter()
            .find(|(kind, _)| *kind == op)
            .map(|(_, counters)| *counters)
            .unwrap_or_default()
    }

    pub fn total_calls(&self) -> u64 {
        self.operations.iter().map(|(_, c)| c.calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.operations.iter().map(|(_, c)| c.failures).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.operations.iter().map(|(_, c)| c.bytes).sum()
    }
}

impl fmt::Display for ServiceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "memory server {}: {} call(s), {} failure(s), {} byte(s)",
            self.memory_server_id,
            self.total_calls(),
            self.total_failures(),
            self.total_bytes()
        )?;
        for (op, counters) in self.operations.iter().filter(|(_, c)| c.calls > 0) {
            writeln!(
                f,
                "  {:<16} calls={:<8} failures={:<6} bytes={}",
                format!("{:?}", op),
                counters.calls,
                counters.failures,
                counters.bytes
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AtomicOpCounters {
    calls: AtomicU64,
    failures: AtomicU64,
    bytes: AtomicU64,
}

/// Thread-safe profile counters
#[derive(Debug)]
pub struct AtomicServiceStats {
    counters: [AtomicOpCounters; ServiceOp::COUNT],
}

impl AtomicServiceStats {
    pub fn new() -> Self {
        Self {
            counters: Default::default(),
        }
    }

    /// Record a successful call that moved `bytes` payload bytes
    pub fn record_success(&self, op: ServiceOp, bytes: u64) {
        let counters = &self.counters[op.index()];
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failure(&self, op: ServiceOp) {
        let counters = &self.counters[op.index()];
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, memory_server_id: u64) -> ServiceStats {
        let operations = ServiceOp::ALL
            .iter()
            .map(|&op| {
                let counters = &self.counters[op.index()];
                (
                    op,
                    OpCounters {
                        calls: counters.calls.load(Ordering::Relaxed),
                        failures: counters.failures.load(Ordering::Relaxed),
                        bytes: counters.bytes.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        ServiceStats {
            memory_server_id,
            operations,
        }
    }

    pub fn reset(&self) {
        for counters in &self.counters {
            counters.calls.store(0, Ordering::Relaxed);
            counters.failures.store(0, Ordering::Relaxed);
            counters.bytes.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for AtomicServiceStats {
    fn default() -> Self {
        Self::new()
    }
}
