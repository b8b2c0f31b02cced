//! Backup/restore pipeline
//!
//! Data is moved in fixed-size chunks; the last chunk of a section may be
//! shorter. Metadata queries go through an [`AccessFilter`].

pub mod store;
pub mod types;

pub use store::FsBackupStore;
pub use types::{AccessFilter, BackupInfo, BackupMetadata, BackupRequest, RestoreRequest};

/// `(start, len)` of each chunk covering `size` bytes
pub fn chunk_ranges(size: u64, chunk_size: u64) -> impl Iterator<Item = (u64, u64)> {
    let step = chunk_size.max(1);
    (0..size)
        .step_by(step as usize)
        .map(move |start| (start, step.min(size - start)))
}
